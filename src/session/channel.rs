//! Channel-backed consumer sessions
//!
//! [`ChannelSink`] is the simplest consumer a server can attach: the group
//! writes into a bounded queue and the session's own task drains the
//! [`mpsc::Receiver`] onto its transport. Writes never block the group; a
//! full queue drops the frame.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use super::key::{gen_unique_key, SessionKind};
use super::stat::{SessionStat, TrafficCounter};
use super::{MessageSink, RtspSink, SessionControl, TsSink};
use crate::media::{AvPacket, FlvTag};
use crate::remux::{SdpInfo, TsFrame};

/// What an RTSP consumer's queue carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtspEvent {
    Sdp(SdpInfo),
    Packet(AvPacket),
}

/// Bounded-queue consumer
pub struct ChannelSink<F> {
    key: String,
    kind: SessionKind,
    remote_addr: String,
    tx: mpsc::Sender<F>,
    traffic: TrafficCounter,
    token: CancellationToken,
    dropped: AtomicU64,
}

impl<F: Send + 'static> ChannelSink<F> {
    /// Create a sink and the receiver its I/O task drains
    pub fn new(kind: SessionKind, capacity: usize) -> (Arc<Self>, mpsc::Receiver<F>) {
        Self::with_remote_addr(kind, capacity, "")
    }

    pub fn with_remote_addr(
        kind: SessionKind,
        capacity: usize,
        remote_addr: impl Into<String>,
    ) -> (Arc<Self>, mpsc::Receiver<F>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = Arc::new(Self {
            key: gen_unique_key(kind),
            kind,
            remote_addr: remote_addr.into(),
            tx,
            traffic: TrafficCounter::new(),
            token: CancellationToken::new(),
            dropped: AtomicU64::new(0),
        });
        (sink, rx)
    }

    /// Cancelled once the group disposes the session or the receiver is gone
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Frames dropped because the queue was full
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn traffic(&self) -> &TrafficCounter {
        &self.traffic
    }

    fn send(&self, frame: F, size: usize) {
        if self.token.is_cancelled() {
            return;
        }
        match self.tx.try_send(frame) {
            Ok(()) => self.traffic.add_wrote(size),
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(session = %self.key, dropped, "Consumer queue full, frame dropped");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(session = %self.key, "Consumer receiver closed");
                self.token.cancel();
            }
        }
    }
}

impl<F: Send + 'static> SessionControl for ChannelSink<F> {
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
        let mut stat = SessionStat::new(&self.key, self.kind);
        stat.remote_addr = self.remote_addr.clone();
        self.traffic.fill_stat(&mut stat);
        stat
    }

    fn dispose(&self) {
        if !self.token.is_cancelled() {
            tracing::debug!(session = %self.key, "Consumer disposed");
            self.token.cancel();
        }
    }
}

impl MessageSink for ChannelSink<FlvTag> {
    fn write_message(&self, msg: &FlvTag) {
        self.send(msg.clone(), msg.size());
    }
}

impl TsSink for ChannelSink<TsFrame> {
    fn write_ts_frame(&self, frame: &TsFrame) {
        self.send(frame.clone(), frame.data.len());
    }
}

impl RtspSink for ChannelSink<RtspEvent> {
    fn set_sdp(&self, sdp: &SdpInfo) {
        self.send(RtspEvent::Sdp(sdp.clone()), 0);
    }

    fn write_packet(&self, pkt: &AvPacket) {
        self.send(RtspEvent::Packet(pkt.clone()), pkt.payload.len());
    }
}
