//! Media description types.
//!
//! A publisher negotiates a [`MediaDescription`] when it starts: an
//! ordered list of medias, each carrying an ordered list of formats.
//! The description is immutable for the lifetime of the stream built
//! from it; readers address subscriptions by (media, format) index pair.

pub mod unit;

pub use unit::{RtpPacket, Unit};

/// Kind of a media within a description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Video track.
    Video,
    /// Audio track.
    Audio,
    /// Application data (e.g. KLV metadata).
    Application,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Video => write!(f, "video"),
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Application => write!(f, "application"),
        }
    }
}

/// A single payload format within a media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    /// RTP payload type.
    pub payload_type: u8,
    /// Codec name, e.g. "H264" or "OPUS".
    pub name: String,
    /// RTP clock rate in Hz.
    pub clock_rate: u32,
}

impl Format {
    /// Creates a format.
    pub fn new(payload_type: u8, name: impl Into<String>, clock_rate: u32) -> Self {
        Self {
            payload_type,
            name: name.into(),
            clock_rate,
        }
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.payload_type)
    }
}

/// One media of a description: a kind plus its candidate formats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Media {
    /// Kind of the media.
    pub kind: MediaKind,
    /// Formats offered for the media, in negotiation order.
    pub formats: Vec<Format>,
}

impl Media {
    /// Creates a media with the given formats.
    pub fn new(kind: MediaKind, formats: Vec<Format>) -> Self {
        Self { kind, formats }
    }
}

/// The full media description agreed at publish time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MediaDescription {
    /// Medias in declaration order.
    pub medias: Vec<Media>,
}

impl MediaDescription {
    /// Creates a description from its medias.
    pub fn new(medias: Vec<Media>) -> Self {
        Self { medias }
    }

    /// Total number of formats across all medias.
    pub fn format_count(&self) -> usize {
        self.medias.iter().map(|m| m.formats.len()).sum()
    }

    /// Looks up the (media, format) index pair of a payload type.
    pub fn find_format(&self, payload_type: u8) -> Option<(usize, usize)> {
        for (mi, media) in self.medias.iter().enumerate() {
            for (fi, format) in media.formats.iter().enumerate() {
                if format.payload_type == payload_type {
                    return Some((mi, fi));
                }
            }
        }
        None
    }

    /// Format at the given index pair, if in range.
    pub fn format_at(&self, media: usize, format: usize) -> Option<&Format> {
        self.medias.get(media)?.formats.get(format)
    }

    /// Format names across all medias, for logging.
    pub fn format_names(&self) -> Vec<String> {
        self.medias
            .iter()
            .flat_map(|m| m.formats.iter().map(|f| f.name.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_desc() -> MediaDescription {
        MediaDescription::new(vec![
            Media::new(MediaKind::Video, vec![Format::new(96, "H264", 90000)]),
            Media::new(
                MediaKind::Audio,
                vec![Format::new(97, "OPUS", 48000), Format::new(0, "PCMU", 8000)],
            ),
        ])
    }

    #[test]
    fn test_format_count() {
        assert_eq!(sample_desc().format_count(), 3);
        assert_eq!(MediaDescription::default().format_count(), 0);
    }

    #[test]
    fn test_find_format() {
        let desc = sample_desc();
        assert_eq!(desc.find_format(96), Some((0, 0)));
        assert_eq!(desc.find_format(0), Some((1, 1)));
        assert_eq!(desc.find_format(42), None);
    }

    #[test]
    fn test_format_names() {
        assert_eq!(sample_desc().format_names(), vec!["H264", "OPUS", "PCMU"]);
    }
}
