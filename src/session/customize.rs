//! Programmatic producer
//!
//! Created by [`StreamGroup::attach_customize_pub`](crate::hub::StreamGroup::attach_customize_pub)
//! for applications that generate media in-process. The caller feeds canonical
//! packets; the group remuxes them like any other packet producer.

use tokio_util::sync::CancellationToken;

use super::key::SessionKind;
use super::stat::{SessionStat, TrafficCounter};
use super::SessionControl;
use crate::hub::IngestHandle;
use crate::media::AvPacket;

pub struct CustomizePubSession {
    key: String,
    ingest: IngestHandle,
    traffic: TrafficCounter,
    token: CancellationToken,
}

impl CustomizePubSession {
    pub(crate) fn new(key: String, ingest: IngestHandle) -> Self {
        Self {
            key,
            ingest,
            traffic: TrafficCounter::new(),
            token: CancellationToken::new(),
        }
    }

    /// Feed one access unit. Returns `false` once the session is detached.
    pub fn feed_packet(&self, pkt: &AvPacket) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        self.traffic.add_read(pkt.payload.len());
        self.ingest.feed_packet(pkt)
    }

    /// Set the AudioSpecificConfig, before or interleaved with the first audio frame
    pub fn feed_audio_config(&self, asc: &[u8]) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        self.traffic.add_read(asc.len());
        self.ingest.feed_audio_config(asc)
    }

    /// Cancelled when the group disposes the session
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl SessionControl for CustomizePubSession {
    fn unique_key(&self) -> &str {
        &self.key
    }

    fn is_alive(&self) -> (bool, bool) {
        self.traffic.is_alive()
    }

    fn update_stat(&self, interval_sec: u32) {
        self.traffic.update_stat(interval_sec);
    }

    fn stat(&self) -> SessionStat {
        let mut stat = SessionStat::new(&self.key, SessionKind::CustomizePub);
        self.traffic.fill_stat(&mut stat);
        stat
    }

    fn dispose(&self) {
        if !self.token.is_cancelled() {
            tracing::debug!(session = %self.key, "Programmatic producer disposed");
            self.token.cancel();
        }
    }
}
