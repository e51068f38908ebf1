//! Group event notifications
//!
//! Lets control-plane code (HTTP API, HLS file management, metrics) react to
//! group events without the group depending on it. Callbacks run while the
//! group lock is held: they must return quickly and must not call back into
//! the group.

use crate::remux::SegmentInfo;

pub trait GroupObserver: Send + Sync {
    /// The producer left; segment files for the stream may be removed
    fn cleanup_segments_if_needed(&self, _app: &str, _stream: &str) {}

    /// A segment fragment was closed
    fn on_segment_produced(&self, _app: &str, _stream: &str, _info: &SegmentInfo) {}

    fn on_relay_pull_start(&self, _app: &str, _stream: &str, _url: &str) {}

    /// The relay pull producer left, or pulling gave up
    fn on_relay_pull_stop(&self, _app: &str, _stream: &str, _url: &str) {}

    /// A push target stopped, or pushing to it gave up
    fn on_relay_push_stop(&self, _app: &str, _stream: &str, _url: &str) {}
}

/// Observer that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl GroupObserver for NoopObserver {}
