//! Push proxy: the group's output relayed to one remote target

use std::sync::Arc;

use super::state::{RelayMachine, RelayState};
use crate::config::BackoffConfig;
use crate::session::MessageSink;

pub struct PushProxy {
    url: String,
    machine: RelayMachine,
    session: Option<Arc<dyn MessageSink>>,
}

impl PushProxy {
    pub fn new(url: impl Into<String>, backoff: BackoffConfig) -> Self {
        Self {
            url: url.into(),
            machine: RelayMachine::new(backoff),
            session: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> RelayState {
        self.machine.state()
    }

    pub fn machine_mut(&mut self) -> &mut RelayMachine {
        &mut self.machine
    }

    /// The connected sink, while pushing
    pub fn session(&self) -> Option<&Arc<dyn MessageSink>> {
        self.session.as_ref().filter(|_| self.machine.is_active())
    }

    pub fn is_pushing(&self) -> bool {
        self.session().is_some()
    }

    /// Mark the attempt `generation` connected
    ///
    /// Returns `false` (and leaves `sink` untouched) for a stale attempt.
    pub fn on_connected(&mut self, generation: u64, sink: Arc<dyn MessageSink>) -> bool {
        if !self.machine.on_connected(generation) {
            return false;
        }
        self.session = Some(sink);
        true
    }

    /// Dispose the sink and schedule a retry
    pub fn on_lost(&mut self, tick: u32) {
        if let Some(session) = self.session.take() {
            session.dispose();
        }
        self.machine.on_lost(tick);
    }

    /// Dispose the sink and go idle. Returns whether a push was running.
    pub fn stop(&mut self) -> bool {
        let was_running = self.machine.is_running();
        if let Some(session) = self.session.take() {
            session.dispose();
        }
        self.machine.stop();
        was_running
    }
}

impl std::fmt::Debug for PushProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushProxy")
            .field("url", &self.url)
            .field("state", &self.machine.state())
            .field("session", &self.session.as_ref().map(|s| s.unique_key().to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::FlvTag;
    use crate::session::{ChannelSink, SessionControl, SessionKind};

    #[test]
    fn test_connect_then_lose() {
        let mut proxy = PushProxy::new("rtmp://edge/live/a", BackoffConfig::default());
        let gen = proxy.machine_mut().begin_connect();
        let (sink, _rx) = ChannelSink::<FlvTag>::new(SessionKind::RtmpPush, 4);

        assert!(proxy.on_connected(gen, sink.clone()));
        assert!(proxy.is_pushing());

        proxy.on_lost(7);
        assert!(!proxy.is_pushing());
        assert!(sink.is_disposed());
        assert_eq!(proxy.state(), RelayState::Retrying { retry_at: 8 });
        assert!(sink.unique_key().starts_with("RTMPPUSH"));
    }

    #[test]
    fn test_stale_connect_rejected() {
        let mut proxy = PushProxy::new("rtmp://edge/live/a", BackoffConfig::default());
        let gen = proxy.machine_mut().begin_connect();
        assert!(proxy.stop());

        let (sink, _rx) = ChannelSink::<FlvTag>::new(SessionKind::RtmpPush, 4);
        assert!(!proxy.on_connected(gen, sink));
        assert!(!proxy.is_pushing());
        assert!(!proxy.stop());
    }
}
