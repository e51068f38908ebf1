//! History caches
//!
//! Two [`GopCache`] instances live in every group: one of internal messages
//! (RTMP, HTTP-FLV, push relays, RTSP replay) and one of segment-ready frames
//! (HTTP-TS).

pub mod gop;

pub use gop::GopCache;

use crate::media::FlvTag;
use crate::remux::{TsFrame, TsMedia};

/// Slot for frames kept outside the GOP ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderSlot {
    Metadata,
    Video,
    Audio,
}

/// A frame the history cache can hold
pub trait CacheFrame: Clone {
    /// Opens a new GOP
    fn is_keyframe(&self) -> bool;

    /// Headers are kept in their own slot instead of the GOP ring
    fn header_slot(&self) -> Option<HeaderSlot>;

    fn size(&self) -> usize;
}

impl CacheFrame for FlvTag {
    fn is_keyframe(&self) -> bool {
        self.is_key_nalu()
    }

    fn header_slot(&self) -> Option<HeaderSlot> {
        if self.is_metadata() {
            Some(HeaderSlot::Metadata)
        } else if self.is_video_sequence_header() {
            Some(HeaderSlot::Video)
        } else if self.is_aac_sequence_header() {
            Some(HeaderSlot::Audio)
        } else {
            None
        }
    }

    fn size(&self) -> usize {
        FlvTag::size(self)
    }
}

impl CacheFrame for TsFrame {
    fn is_keyframe(&self) -> bool {
        self.media == TsMedia::Video && self.keyframe
    }

    // Parameter sets travel in-band on every keyframe
    fn header_slot(&self) -> Option<HeaderSlot> {
        None
    }

    fn size(&self) -> usize {
        self.data.len()
    }
}
