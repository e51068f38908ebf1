//! Producer-side handle into a group
//!
//! The producer's own I/O context holds an [`IngestHandle`] and pushes frames
//! through it. The handle keeps only a weak reference, so a disposed and
//! dropped group silently stops accepting input.

use std::sync::{Arc, Weak};

use super::group::StreamGroup;
use crate::media::{AvPacket, FlvTag};

#[derive(Clone)]
pub struct IngestHandle {
    group: Weak<StreamGroup>,
    session_key: Arc<str>,
}

impl IngestHandle {
    pub(crate) fn new(group: Weak<StreamGroup>, session_key: &str) -> Self {
        Self {
            group,
            session_key: Arc::from(session_key),
        }
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    /// Whether this session is currently the group's producer
    pub fn is_attached(&self) -> bool {
        self.group
            .upgrade()
            .is_some_and(|g| g.is_producer(&self.session_key))
    }

    /// Push one internal message (RTMP-style producers)
    ///
    /// Returns `false` when the frame was not accepted: the group is gone or
    /// this session is no longer its producer. Frames from a relay pull that
    /// is still connecting are held and delivered once it attaches.
    pub fn feed_message(&self, msg: FlvTag) -> bool {
        self.group
            .upgrade()
            .is_some_and(|g| g.ingest_message(&self.session_key, msg))
    }

    /// Push one canonical packet (RTSP, PS and programmatic producers)
    pub fn feed_packet(&self, pkt: &AvPacket) -> bool {
        self.group
            .upgrade()
            .is_some_and(|g| g.ingest_packet(&self.session_key, pkt))
    }

    /// Set the out-of-band audio configuration
    pub fn feed_audio_config(&self, asc: &[u8]) -> bool {
        self.group
            .upgrade()
            .is_some_and(|g| g.ingest_audio_config(&self.session_key, asc))
    }
}

impl std::fmt::Debug for IngestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestHandle")
            .field("session_key", &self.session_key)
            .field("group_alive", &(self.group.strong_count() > 0))
            .finish()
    }
}
