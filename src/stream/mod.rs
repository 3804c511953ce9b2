//! The per-path packet bus.
//!
//! A [`Stream`] is created when a publisher starts and holds the media
//! description agreed at that moment, plus the per-(media, format)
//! reader registrations. The publisher's task calls
//! [`Stream::write_rtp_packet`] directly: the packet is decoded to a
//! [`Unit`] once, then handed to every registered reader through its
//! [`AsyncWriter`]. Registrations sit behind a rwlock taken in read mode
//! on the write path, so admission changes never stall fan-out beyond
//! the brief swap.
//!
//! ```text
//!  publisher ──write_rtp_packet──▶ Unit (Arc, decoded once)
//!                                   │
//!              ┌────────────────────┼────────────────────┐
//!              ▼                    ▼                    ▼
//!        AsyncWriter          AsyncWriter          AsyncWriter
//!         (reader A)           (reader B)           (reader C)
//! ```

pub mod writer;

pub use writer::AsyncWriter;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use crate::media::{Format, MediaDescription, RtpPacket, Unit};
use crate::session::SessionId;

/// Callback invoked (on the reader's writer task) for every unit on a
/// subscribed (media, format). Must not block.
pub type ReaderCallback = Arc<dyn Fn(Arc<Unit>) + Send + Sync>;

struct Binding {
    session: SessionId,
    writer: Arc<AsyncWriter>,
    callback: ReaderCallback,
}

/// The packet bus of a live path.
pub struct Stream {
    desc: MediaDescription,
    generate_rtp: bool,
    // bindings[media][format] -> readers in registration order
    bindings: RwLock<Vec<Vec<Vec<Binding>>>>,
    bytes_received: AtomicU64,
}

impl Stream {
    /// Creates a stream from the description agreed at publish time.
    /// `generate_rtp` records whether collaborators must generate RTP
    /// packets from raw units for this stream.
    pub fn new(desc: MediaDescription, generate_rtp: bool) -> Self {
        let bindings = desc
            .medias
            .iter()
            .map(|m| m.formats.iter().map(|_| Vec::new()).collect())
            .collect();

        Self {
            desc,
            generate_rtp,
            bindings: RwLock::new(bindings),
            bytes_received: AtomicU64::new(0),
        }
    }

    /// The media description. Immutable for the stream's lifetime.
    pub fn description(&self) -> &MediaDescription {
        &self.desc
    }

    /// Whether collaborators must generate RTP packets for this stream.
    pub fn generate_rtp(&self) -> bool {
        self.generate_rtp
    }

    /// Total payload bytes written so far.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Registers a reader for the (media, format) pair. Idempotent: a
    /// second registration of the same reader replaces the first. The
    /// indices must come from [`Stream::description`]; out-of-range
    /// pairs are logged and ignored.
    pub fn add_reader(
        &self,
        session: SessionId,
        writer: Arc<AsyncWriter>,
        media: usize,
        format: usize,
        callback: ReaderCallback,
    ) {
        let mut bindings = self.bindings.write().expect("stream lock poisoned");

        let Some(slot) = bindings.get_mut(media).and_then(|m| m.get_mut(format)) else {
            tracing::error!(
                session = %session,
                media = media,
                format = format,
                "reader subscription out of range"
            );
            return;
        };

        if let Some(existing) = slot.iter_mut().find(|b| b.session == session) {
            existing.writer = writer;
            existing.callback = callback;
            return;
        }

        slot.push(Binding {
            session,
            writer,
            callback,
        });
    }

    /// Unregisters every registration of the reader, atomically.
    pub fn remove_reader(&self, session: SessionId) {
        let mut bindings = self.bindings.write().expect("stream lock poisoned");
        for media in bindings.iter_mut() {
            for slot in media.iter_mut() {
                slot.retain(|b| b.session != session);
            }
        }
    }

    /// Formats the reader is subscribed to, for logging.
    pub fn formats_for_reader(&self, session: SessionId) -> Vec<Format> {
        let bindings = self.bindings.read().expect("stream lock poisoned");
        let mut out = Vec::new();
        for (mi, media) in bindings.iter().enumerate() {
            for (fi, slot) in media.iter().enumerate() {
                if slot.iter().any(|b| b.session == session) {
                    if let Some(format) = self.desc.format_at(mi, fi) {
                        out.push(format.clone());
                    }
                }
            }
        }
        out
    }

    /// Number of distinct readers with at least one registration.
    pub fn reader_count(&self) -> usize {
        let bindings = self.bindings.read().expect("stream lock poisoned");
        let mut ids: Vec<SessionId> = bindings
            .iter()
            .flatten()
            .flatten()
            .map(|b| b.session)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }

    /// Writes a packet on the given (media, format). The packet is
    /// decoded to a [`Unit`] once and delivered to every registered
    /// reader in registration order. Per-pair delivery order matches
    /// write order; a reader whose queue overflows is flagged on its own
    /// writer and does not affect anyone else.
    pub fn write_rtp_packet(
        &self,
        media: usize,
        format: usize,
        pkt: RtpPacket,
        ntp: SystemTime,
        pts: i64,
    ) {
        self.bytes_received
            .fetch_add(pkt.payload.len() as u64, Ordering::Relaxed);

        let unit = Arc::new(Unit::from_rtp(pkt, ntp, pts));

        let bindings = self.bindings.read().expect("stream lock poisoned");
        let Some(slot) = bindings.get(media).and_then(|m| m.get(format)) else {
            tracing::error!(media = media, format = format, "write out of range");
            return;
        };

        for binding in slot.iter() {
            let callback = binding.callback.clone();
            let unit = unit.clone();
            // Overflow latches the reader's own writer; the session
            // observes it through the writer's error channel.
            let _ = binding.writer.push(move || callback(unit));
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("medias", &self.desc.medias.len())
            .field("readers", &self.reader_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bytes::Bytes;
    use tokio::sync::oneshot;
    use uuid::Uuid;

    use super::*;
    use crate::media::{Media, MediaKind};

    fn sample_desc() -> MediaDescription {
        MediaDescription::new(vec![
            Media::new(MediaKind::Video, vec![Format::new(96, "H264", 90000)]),
            Media::new(MediaKind::Audio, vec![Format::new(97, "OPUS", 48000)]),
        ])
    }

    fn pkt(seq: u16) -> RtpPacket {
        RtpPacket {
            payload_type: 96,
            sequence_number: seq,
            timestamp: u32::from(seq) * 3000,
            marker: false,
            payload: Bytes::from_static(b"payload"),
        }
    }

    struct TestReader {
        session: SessionId,
        writer: Arc<AsyncWriter>,
        seen: Arc<Mutex<Vec<u16>>>,
    }

    impl TestReader {
        fn attach(stream: &Stream, media: usize, format: usize) -> Self {
            let writer = Arc::new(AsyncWriter::new(1024));
            writer.start();

            let seen = Arc::new(Mutex::new(Vec::new()));
            let session = Uuid::new_v4();

            let cb_seen = seen.clone();
            stream.add_reader(
                session,
                writer.clone(),
                media,
                format,
                Arc::new(move |unit: Arc<Unit>| {
                    cb_seen.lock().unwrap().push(unit.rtp.sequence_number);
                }),
            );

            Self {
                session,
                writer,
                seen,
            }
        }

        async fn drained(&self) {
            let (tx, rx) = oneshot::channel();
            self.writer.push(move || drop(tx.send(()))).unwrap();
            rx.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_fan_out_preserves_order() {
        let stream = Stream::new(sample_desc(), false);
        let a = TestReader::attach(&stream, 0, 0);
        let b = TestReader::attach(&stream, 0, 0);

        for seq in 0..50 {
            stream.write_rtp_packet(0, 0, pkt(seq), SystemTime::now(), i64::from(seq));
        }
        a.drained().await;
        b.drained().await;

        let expected: Vec<u16> = (0..50).collect();
        assert_eq!(*a.seen.lock().unwrap(), expected);
        assert_eq!(*b.seen.lock().unwrap(), expected);
        assert_eq!(stream.reader_count(), 2);
    }

    #[tokio::test]
    async fn test_readers_only_get_their_pair() {
        let stream = Stream::new(sample_desc(), false);
        let video = TestReader::attach(&stream, 0, 0);
        let audio = TestReader::attach(&stream, 1, 0);

        stream.write_rtp_packet(0, 0, pkt(1), SystemTime::now(), 0);
        stream.write_rtp_packet(1, 0, pkt(2), SystemTime::now(), 0);
        video.drained().await;
        audio.drained().await;

        assert_eq!(*video.seen.lock().unwrap(), vec![1]);
        assert_eq!(*audio.seen.lock().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_remove_reader_stops_delivery() {
        let stream = Stream::new(sample_desc(), false);
        let reader = TestReader::attach(&stream, 0, 0);

        stream.write_rtp_packet(0, 0, pkt(1), SystemTime::now(), 0);
        reader.drained().await;

        stream.remove_reader(reader.session);
        stream.write_rtp_packet(0, 0, pkt(2), SystemTime::now(), 0);
        reader.drained().await;

        assert_eq!(*reader.seen.lock().unwrap(), vec![1]);
        assert_eq!(stream.reader_count(), 0);
    }

    #[tokio::test]
    async fn test_registration_is_idempotent() {
        let stream = Stream::new(sample_desc(), false);
        let reader = TestReader::attach(&stream, 0, 0);

        // Re-register the same (reader, media, format).
        let cb_seen = reader.seen.clone();
        stream.add_reader(
            reader.session,
            reader.writer.clone(),
            0,
            0,
            Arc::new(move |unit: Arc<Unit>| {
                cb_seen.lock().unwrap().push(unit.rtp.sequence_number);
            }),
        );

        stream.write_rtp_packet(0, 0, pkt(5), SystemTime::now(), 0);
        reader.drained().await;

        // Delivered once, not twice.
        assert_eq!(*reader.seen.lock().unwrap(), vec![5]);
    }

    #[tokio::test]
    async fn test_formats_for_reader() {
        let stream = Stream::new(sample_desc(), false);
        let reader = TestReader::attach(&stream, 0, 0);

        let cb = Arc::new(|_: Arc<Unit>| {});
        stream.add_reader(reader.session, reader.writer.clone(), 1, 0, cb);

        let formats = stream.formats_for_reader(reader.session);
        assert_eq!(formats.len(), 2);
        assert_eq!(formats[0].name, "H264");
        assert_eq!(formats[1].name, "OPUS");
    }

    #[tokio::test]
    async fn test_bytes_received() {
        let stream = Stream::new(sample_desc(), false);
        stream.write_rtp_packet(0, 0, pkt(1), SystemTime::now(), 0);
        stream.write_rtp_packet(0, 0, pkt(2), SystemTime::now(), 0);
        assert_eq!(stream.bytes_received(), 2 * "payload".len() as u64);
    }
}
