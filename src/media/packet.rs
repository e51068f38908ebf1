//! Canonical audio/video packet
//!
//! Protocol-neutral access unit produced by packet-oriented producers (RTSP,
//! GB28181 PS, programmatic) and by the RTSP remuxer.
//!
//! Payload layout:
//! - video (AVC/HEVC): one or more NAL units, each prefixed by a 4-byte
//!   big-endian length (AVCC style)
//! - audio (AAC): one raw AAC frame without ADTS header

use bytes::Bytes;
use serde::Serialize;

/// Codec of an [`AvPacket`] payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PayloadType {
    /// H.264
    Avc,
    /// H.265
    Hevc,
    /// AAC
    Aac,
}

impl PayloadType {
    pub fn is_video(&self) -> bool {
        matches!(self, PayloadType::Avc | PayloadType::Hevc)
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, PayloadType::Aac)
    }

    /// Codec name as reported in stats
    pub fn name(&self) -> &'static str {
        match self {
            PayloadType::Avc => "H264",
            PayloadType::Hevc => "H265",
            PayloadType::Aac => "AAC",
        }
    }
}

/// One decoded audio or video access unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvPacket {
    pub payload_type: PayloadType,
    /// Decode timestamp in the producer's unit, monotonic per media type
    pub timestamp: i64,
    /// Presentation timestamp in the same unit, when it differs from `timestamp`
    pub pts: Option<i64>,
    pub payload: Bytes,
}

impl AvPacket {
    pub fn new(payload_type: PayloadType, timestamp: i64, payload: Bytes) -> Self {
        Self {
            payload_type,
            timestamp,
            pts: None,
            payload,
        }
    }

    pub fn with_pts(mut self, pts: i64) -> Self {
        self.pts = Some(pts);
        self
    }

    pub fn is_video(&self) -> bool {
        self.payload_type.is_video()
    }

    pub fn is_audio(&self) -> bool {
        self.payload_type.is_audio()
    }

    /// Presentation timestamp, falling back to the decode timestamp
    pub fn presentation_timestamp(&self) -> i64 {
        self.pts.unwrap_or(self.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_type_kinds() {
        assert!(PayloadType::Avc.is_video());
        assert!(PayloadType::Hevc.is_video());
        assert!(!PayloadType::Aac.is_video());
        assert!(PayloadType::Aac.is_audio());
        assert_eq!(PayloadType::Hevc.name(), "H265");
    }

    #[test]
    fn test_presentation_timestamp_fallback() {
        let pkt = AvPacket::new(PayloadType::Avc, 40, Bytes::new());
        assert_eq!(pkt.presentation_timestamp(), 40);

        let pkt = pkt.with_pts(120);
        assert_eq!(pkt.presentation_timestamp(), 120);
    }
}
