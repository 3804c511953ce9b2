//! In-process broadcast demo.
//!
//! Run with: cargo run --example local_broadcast
//!
//! Simulates what two protocol servers would do: one session publishes
//! an H.264 track to `live/cam1`, another reads it, and packets flow
//! through the path manager's fan-out. No sockets involved; everything
//! happens inside one process.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use mediahub_rs::conf::{ManagerConf, PathConf, PathConfSet};
use mediahub_rs::externalcmd::ProcessExecutor;
use mediahub_rs::media::{Format, Media, MediaDescription, MediaKind, RtpPacket, Unit};
use mediahub_rs::path::PathManager;
use mediahub_rs::session::{AccessRequest, Protocol, SessionRef};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mediahub_rs=debug".parse()?),
        )
        .init();

    // One catch-all template: any valid name resolves to it.
    let paths = PathConfSet::new(vec![("all_others".to_string(), PathConf::default())])?;
    let manager = PathManager::new(
        ManagerConf::default(),
        paths,
        Arc::new(ProcessExecutor),
        None,
    )?;

    // A publisher claims live/cam1 and declares its media.
    let (publisher, _pub_kick) = SessionRef::new(Protocol::Rtmp);
    let access = AccessRequest::basic("live/cam1", "127.0.0.1".parse()?, Protocol::Rtmp, true);
    let binding = manager.add_publisher(access, publisher.clone()).await?;

    let desc = MediaDescription::new(vec![Media::new(
        MediaKind::Video,
        vec![Format::new(96, "H264", 90000)],
    )]);
    let stream = binding.start_publisher(&publisher, desc, false).await?;
    println!("publishing to '{}'", binding.name());

    // A reader attaches and subscribes to the video format.
    let (reader, _read_kick) = SessionRef::new(Protocol::Rtsp);
    let access = AccessRequest::basic("live/cam1", "127.0.0.1".parse()?, Protocol::Rtsp, false);
    let attachment = manager.add_reader(access, reader.clone()).await?;

    attachment.stream.add_reader(
        reader.id(),
        attachment.writer.clone(),
        0,
        0,
        Arc::new(|unit: Arc<Unit>| {
            println!(
                "  reader got seq={} pts={} ({} bytes)",
                unit.rtp.sequence_number,
                unit.pts,
                unit.payload().len()
            );
        }),
    );

    // The publisher pushes a few packets at ~25 fps.
    for seq in 0..10u16 {
        let pkt = RtpPacket {
            payload_type: 96,
            sequence_number: seq,
            timestamp: u32::from(seq) * 3600,
            marker: true,
            payload: Bytes::from_static(b"fake access unit"),
        };
        stream.write_rtp_packet(0, 0, pkt, SystemTime::now(), i64::from(seq) * 3600);
        tokio::time::sleep(Duration::from_millis(40)).await;
    }

    // Orderly teardown.
    attachment.path.remove_reader(&reader).await;
    binding.remove_publisher(&publisher).await;
    manager.close().await;

    Ok(())
}
