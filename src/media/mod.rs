//! Media handling
//!
//! This module provides:
//! - the canonical [`AvPacket`] producers feed into a group
//! - the internal fan-out message ([`FlvTag`])
//! - H.264/H.265 parameter-set and NAL unit helpers
//! - AAC config parsing and ADTS framing

pub mod aac;
pub mod flv;
pub mod h264;
pub mod hevc;
pub mod packet;

pub use aac::{AacPacketType, AudioSpecificConfig};
pub use flv::{FlvTag, FlvTagType, VideoCodec};
pub use h264::{AvcConfig, AvcPacketType, NaluType};
pub use hevc::HevcConfig;
pub use packet::{AvPacket, PayloadType};
