//! The internal packet representation carried through a stream.
//!
//! Incoming RTP packets are decoded into a [`Unit`] once, on the
//! publisher's task, and the same `Unit` is then shared by reference with
//! every reader. `bytes::Bytes` keeps the payload reference counted, so
//! fan-out never copies media data.

use std::time::SystemTime;

use bytes::Bytes;

/// A raw RTP packet as received from a publisher.
///
/// Cheap to clone: the payload is reference counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    /// RTP payload type.
    pub payload_type: u8,
    /// RTP sequence number.
    pub sequence_number: u16,
    /// RTP timestamp, in clock-rate units.
    pub timestamp: u32,
    /// Marker bit.
    pub marker: bool,
    /// Packet payload.
    pub payload: Bytes,
}

/// The decoded form of a packet, produced once per write and shared with
/// all readers of the (media, format) it belongs to.
#[derive(Debug, Clone)]
pub struct Unit {
    /// The packet the unit was decoded from.
    pub rtp: RtpPacket,
    /// Wall-clock time the packet was written at.
    pub ntp: SystemTime,
    /// Presentation timestamp, in clock-rate units.
    pub pts: i64,
}

impl Unit {
    /// Decodes an RTP packet into a unit.
    pub fn from_rtp(rtp: RtpPacket, ntp: SystemTime, pts: i64) -> Self {
        Self { rtp, ntp, pts }
    }

    /// The media payload of the unit.
    pub fn payload(&self) -> &Bytes {
        &self.rtp.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_shares_payload() {
        let payload = Bytes::from_static(b"frame data");
        let pkt = RtpPacket {
            payload_type: 96,
            sequence_number: 7,
            timestamp: 90000,
            marker: true,
            payload: payload.clone(),
        };

        let unit = Unit::from_rtp(pkt, SystemTime::now(), 90000);

        // Same allocation, not a copy.
        assert_eq!(unit.payload().as_ptr(), payload.as_ptr());
        assert_eq!(unit.pts, 90000);
    }
}
