//! Remux pipeline
//!
//! ```text
//! AvPacket ──> AvPacketToFlvRemuxer ──> FlvTag ──┬──> RTMP / HTTP-FLV / push relays
//!                                                ├──> FlvToMpegtsRemuxer ──> TsFrame ──> HTTP-TS
//!                                                └──> FlvToRtspRemuxer ──> SdpInfo + AvPacket ──> RTSP
//! ```
//!
//! Every remuxer is driven synchronously on the ingestion path. Malformed
//! input surfaces as a [`MediaError`](crate::error::MediaError); callers log
//! and drop it.

pub mod avpacket2flv;
pub mod flv2mpegts;
pub mod flv2rtsp;

pub use avpacket2flv::{AvPacketToFlvRemuxer, TimestampPolicy};
pub use flv2mpegts::{FlvToMpegtsRemuxer, SegmentInfo, TsFrame, TsMedia, TsOutput};
pub use flv2rtsp::{FlvToRtspRemuxer, RtspOutput, SdpInfo};

use bytes::Bytes;

use crate::error::{MediaError, Result};
use crate::media::{AvcConfig, FlvTag, HevcConfig, PayloadType, VideoCodec};

/// Decoder configuration taken from a video sequence header
#[derive(Debug, Clone)]
pub(crate) enum VideoParams {
    Avc(AvcConfig),
    Hevc(HevcConfig),
}

impl VideoParams {
    pub(crate) fn from_sequence_header(tag: &FlvTag) -> Result<Self> {
        let record = tag.video_body().ok_or(MediaError::InvalidAvcPacket)?;
        match tag.video_codec() {
            Some(VideoCodec::Avc) => Ok(VideoParams::Avc(AvcConfig::parse(record)?)),
            Some(VideoCodec::Hevc) => Ok(VideoParams::Hevc(HevcConfig::parse(record)?)),
            _ => Err(MediaError::InvalidAvcPacket.into()),
        }
    }

    pub(crate) fn nalu_length_size(&self) -> u8 {
        match self {
            VideoParams::Avc(c) => c.nalu_length_size,
            VideoParams::Hevc(c) => c.nalu_length_size,
        }
    }

    pub(crate) fn annexb_parameter_sets(&self) -> Bytes {
        match self {
            VideoParams::Avc(c) => c.annexb_parameter_sets(),
            VideoParams::Hevc(c) => c.annexb_parameter_sets(),
        }
    }

    pub(crate) fn payload_type(&self) -> PayloadType {
        match self {
            VideoParams::Avc(_) => PayloadType::Avc,
            VideoParams::Hevc(_) => PayloadType::Hevc,
        }
    }
}
