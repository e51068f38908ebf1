//! GOP-bounded history for late joiners
//!
//! A consumer that joins mid-stream needs, in order:
//! 1. metadata and the latest sequence headers
//! 2. the most recent keyframe
//! 3. every frame since that keyframe
//!
//! The cache keeps the last N groups of pictures (the one still being filled
//! counts toward N) so that replay always starts on a keyframe. Headers live
//! in their own slots and survive GOP eviction and [`GopCache::reset`].

use std::collections::VecDeque;

use super::{CacheFrame, HeaderSlot};

/// Frames kept in one GOP when no explicit bound is configured
pub const DEFAULT_MAX_FRAMES_PER_GOP: usize = 1500;

#[derive(Debug, Clone)]
struct Gop<T> {
    seq: u64,
    frames: Vec<T>,
    /// Frame limit hit; everything until the next keyframe is discarded
    overflowed: bool,
}

/// Ring of the most recent GOPs plus header slots
#[derive(Debug)]
pub struct GopCache<T> {
    /// Name used in logs ("message", "segment")
    name: &'static str,
    /// Maximum retained GOPs (0 disables frame caching)
    capacity: usize,
    /// Frames accepted per GOP before dropping until the next keyframe
    max_frames_per_gop: usize,
    metadata: Option<T>,
    video_header: Option<T>,
    audio_header: Option<T>,
    gops: VecDeque<Gop<T>>,
    next_seq: u64,
}

impl<T: CacheFrame> GopCache<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self::with_frame_limit(name, capacity, DEFAULT_MAX_FRAMES_PER_GOP)
    }

    pub fn with_frame_limit(name: &'static str, capacity: usize, max_frames_per_gop: usize) -> Self {
        Self {
            name,
            capacity,
            max_frames_per_gop: max_frames_per_gop.max(1),
            metadata: None,
            video_header: None,
            audio_header: None,
            gops: VecDeque::with_capacity(capacity),
            next_seq: 0,
        }
    }

    /// Record one frame
    ///
    /// Headers replace their slot. A keyframe opens a new GOP, evicting the
    /// oldest when full. Other frames extend the open GOP and are discarded
    /// when no keyframe has been seen yet.
    pub fn append_frame(&mut self, frame: T) {
        if let Some(slot) = frame.header_slot() {
            match slot {
                HeaderSlot::Metadata => self.metadata = Some(frame),
                HeaderSlot::Video => self.video_header = Some(frame),
                HeaderSlot::Audio => self.audio_header = Some(frame),
            }
            return;
        }

        if self.capacity == 0 {
            return;
        }

        if frame.is_keyframe() {
            if self.gops.len() >= self.capacity {
                if let Some(evicted) = self.gops.pop_front() {
                    tracing::trace!(
                        cache = self.name,
                        seq = evicted.seq,
                        frames = evicted.frames.len(),
                        "Evicted GOP"
                    );
                }
            }
            self.gops.push_back(Gop {
                seq: self.next_seq,
                frames: Vec::new(),
                overflowed: false,
            });
            self.next_seq += 1;
        }

        let max_frames = self.max_frames_per_gop;
        let Some(gop) = self.gops.back_mut() else {
            return;
        };
        if gop.frames.len() >= max_frames {
            if !gop.overflowed {
                gop.overflowed = true;
                tracing::warn!(
                    cache = self.name,
                    seq = gop.seq,
                    max_frames,
                    "GOP frame limit reached, dropping frames until next keyframe"
                );
            }
            return;
        }
        gop.frames.push(frame);
    }

    /// Headers followed by every retained frame, oldest GOP first
    pub fn replayable(&self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.frame_count() + 3);
        out.extend(self.headers());
        for gop in &self.gops {
            out.extend(gop.frames.iter().cloned());
        }
        out
    }

    /// Metadata, video header and audio header that are currently known
    pub fn headers(&self) -> Vec<T> {
        [&self.metadata, &self.video_header, &self.audio_header]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }

    /// Drop all GOPs, keeping headers until replaced
    pub fn reset(&mut self) {
        self.gops.clear();
    }

    /// Drop everything including headers
    pub fn clear(&mut self) {
        self.reset();
        self.metadata = None;
        self.video_header = None;
        self.audio_header = None;
    }

    pub fn video_header(&self) -> Option<&T> {
        self.video_header.as_ref()
    }

    pub fn audio_header(&self) -> Option<&T> {
        self.audio_header.as_ref()
    }

    pub fn metadata(&self) -> Option<&T> {
        self.metadata.as_ref()
    }

    /// Number of retained GOPs, including the open one
    pub fn gop_count(&self) -> usize {
        self.gops.len()
    }

    /// Number of retained frames, headers excluded
    pub fn frame_count(&self) -> usize {
        self.gops.iter().map(|g| g.frames.len()).sum()
    }

    /// Bytes held by retained frames
    pub fn size(&self) -> usize {
        self.gops
            .iter()
            .flat_map(|g| g.frames.iter())
            .map(|f| f.size())
            .sum()
    }

    /// Sequence ids of retained GOPs, oldest first
    pub fn gop_sequence_ids(&self) -> Vec<u64> {
        self.gops.iter().map(|g| g.seq).collect()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::media::FlvTag;

    fn make_tag(timestamp: u32, is_keyframe: bool, size: usize) -> FlvTag {
        let mut data = vec![0u8; size.max(2)];
        data[0] = if is_keyframe { 0x17 } else { 0x27 };
        data[1] = 0x01;
        FlvTag::video(timestamp, Bytes::from(data))
    }

    fn feed_gop(cache: &mut GopCache<FlvTag>, start: u32, frames: usize) {
        for i in 0..frames {
            cache.append_frame(make_tag(start + i as u32 * 40, i == 0, 10));
        }
    }

    #[test]
    fn test_retains_last_n_gops() {
        let mut cache = GopCache::new("message", 2);
        feed_gop(&mut cache, 0, 3);
        feed_gop(&mut cache, 1000, 2);
        feed_gop(&mut cache, 2000, 4);

        assert_eq!(cache.gop_count(), 2);
        assert_eq!(cache.frame_count(), 6);
        assert_eq!(cache.gop_sequence_ids(), vec![1, 2]);

        let replay = cache.replayable();
        assert_eq!(replay[0].timestamp, 1000);
        assert!(replay[0].is_key_nalu());
        assert_eq!(replay.last().map(|t| t.timestamp), Some(2120));
    }

    #[test]
    fn test_frames_before_first_keyframe_are_dropped() {
        let mut cache = GopCache::new("message", 1);
        cache.append_frame(make_tag(0, false, 10));
        cache.append_frame(make_tag(40, false, 10));
        assert_eq!(cache.frame_count(), 0);
        assert_eq!(cache.gop_count(), 0);

        cache.append_frame(make_tag(80, true, 10));
        assert_eq!(cache.frame_count(), 1);
    }

    #[test]
    fn test_headers_replayed_first() {
        let mut cache = GopCache::new("message", 1);
        cache.append_frame(FlvTag::script(0, Bytes::from_static(b"meta")));
        cache.append_frame(FlvTag::aac_sequence_header(0, &[0x12, 0x10]));
        cache.append_frame(FlvTag::video(0, Bytes::from_static(&[0x17, 0x00, 0, 0, 0])));
        feed_gop(&mut cache, 0, 2);

        let replay = cache.replayable();
        assert_eq!(replay.len(), 5);
        assert!(replay[0].is_metadata());
        assert!(replay[1].is_avc_sequence_header());
        assert!(replay[2].is_aac_sequence_header());
        assert!(replay[3].is_key_nalu());
    }

    #[test]
    fn test_header_not_counted_as_keyframe() {
        let mut cache = GopCache::new("message", 1);
        feed_gop(&mut cache, 0, 3);
        // A new sequence header mid-GOP must not open a GOP
        cache.append_frame(FlvTag::video(120, Bytes::from_static(&[0x17, 0x00, 0, 0, 0])));
        assert_eq!(cache.gop_count(), 1);
        assert_eq!(cache.frame_count(), 3);
    }

    #[test]
    fn test_reset_keeps_headers() {
        let mut cache = GopCache::new("message", 2);
        cache.append_frame(FlvTag::aac_sequence_header(0, &[0x12, 0x10]));
        feed_gop(&mut cache, 0, 3);

        cache.reset();
        assert_eq!(cache.frame_count(), 0);
        assert!(cache.audio_header().is_some());
        assert_eq!(cache.replayable().len(), 1);

        cache.clear();
        assert!(cache.audio_header().is_none());
        assert!(cache.replayable().is_empty());
    }

    #[test]
    fn test_zero_capacity_keeps_only_headers() {
        let mut cache = GopCache::new("message", 0);
        cache.append_frame(FlvTag::aac_sequence_header(0, &[0x12, 0x10]));
        feed_gop(&mut cache, 0, 3);
        assert_eq!(cache.frame_count(), 0);
        assert_eq!(cache.replayable().len(), 1);
    }

    #[test]
    fn test_frame_limit_per_gop() {
        let mut cache = GopCache::with_frame_limit("message", 2, 3);
        feed_gop(&mut cache, 0, 10);
        assert_eq!(cache.frame_count(), 3);

        // next keyframe starts a fresh GOP
        feed_gop(&mut cache, 1000, 2);
        assert_eq!(cache.gop_count(), 2);
        assert_eq!(cache.frame_count(), 5);
    }

    #[test]
    fn test_size_tracks_retained_frames() {
        let mut cache = GopCache::new("message", 1);
        cache.append_frame(make_tag(0, true, 100));
        cache.append_frame(make_tag(40, false, 50));
        assert_eq!(cache.size(), 150);

        cache.append_frame(make_tag(80, true, 30));
        assert_eq!(cache.size(), 30);
    }
}
