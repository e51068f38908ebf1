//! Producer and consumer variants

use std::sync::Arc;

use super::customize::CustomizePubSession;
use super::key::SessionKind;
use super::stat::SessionStat;
use super::{MessageSink, RtspSink, SessionControl, TsSink};

/// The single input of a group
#[derive(Clone)]
pub enum Producer {
    /// Pushes internal messages
    Rtmp(Arc<dyn SessionControl>),
    /// Feeds canonical packets with native timestamps
    Rtsp(Arc<dyn SessionControl>),
    /// GB28181 PS over RTP; canonical packets, optionally synthetic pacing
    Ps(Arc<dyn SessionControl>),
    /// Programmatic producer created by the group
    Customize(Arc<CustomizePubSession>),
    /// Relay pull from a remote server; pushes internal messages
    RelayPull(Arc<dyn SessionControl>),
}

impl Producer {
    pub fn control(&self) -> &dyn SessionControl {
        match self {
            Producer::Rtmp(s) | Producer::Rtsp(s) | Producer::Ps(s) | Producer::RelayPull(s) => {
                s.as_ref()
            }
            Producer::Customize(s) => s.as_ref(),
        }
    }

    pub fn kind(&self) -> SessionKind {
        match self {
            Producer::Rtmp(_) => SessionKind::RtmpPub,
            Producer::Rtsp(_) => SessionKind::RtspPub,
            Producer::Ps(_) => SessionKind::PsPub,
            Producer::Customize(_) => SessionKind::CustomizePub,
            Producer::RelayPull(_) => SessionKind::RtmpPull,
        }
    }

    pub fn unique_key(&self) -> &str {
        self.control().unique_key()
    }

    /// Whether the producer hands over canonical packets instead of messages
    pub fn feeds_packets(&self) -> bool {
        matches!(
            self,
            Producer::Rtsp(_) | Producer::Ps(_) | Producer::Customize(_)
        )
    }

    pub fn is_relay(&self) -> bool {
        matches!(self, Producer::RelayPull(_))
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Producer")
            .field(&self.kind())
            .field(&self.unique_key())
            .finish()
    }
}

/// A consumer to attach, tagged by output protocol
#[derive(Clone)]
pub enum Consumer {
    Rtmp(Arc<dyn MessageSink>),
    HttpFlv(Arc<dyn MessageSink>),
    HttpTs(Arc<dyn TsSink>),
    Rtsp(Arc<dyn RtspSink>),
}

macro_rules! each_consumer {
    ($self:expr, $s:ident => $body:expr) => {
        match $self {
            Consumer::Rtmp($s) | Consumer::HttpFlv($s) => $body,
            Consumer::HttpTs($s) => $body,
            Consumer::Rtsp($s) => $body,
        }
    };
}

impl Consumer {
    pub fn kind(&self) -> SessionKind {
        match self {
            Consumer::Rtmp(_) => SessionKind::RtmpSub,
            Consumer::HttpFlv(_) => SessionKind::FlvSub,
            Consumer::HttpTs(_) => SessionKind::TsSub,
            Consumer::Rtsp(_) => SessionKind::RtspSub,
        }
    }

    pub fn unique_key(&self) -> &str {
        each_consumer!(self, s => s.unique_key())
    }

    pub fn is_alive(&self) -> (bool, bool) {
        each_consumer!(self, s => s.is_alive())
    }

    pub fn update_stat(&self, interval_sec: u32) {
        each_consumer!(self, s => s.update_stat(interval_sec))
    }

    pub fn stat(&self) -> SessionStat {
        each_consumer!(self, s => s.stat())
    }

    pub fn dispose(&self) {
        each_consumer!(self, s => s.dispose())
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Consumer")
            .field(&self.kind())
            .field(&self.unique_key())
            .finish()
    }
}
