//! Pull proxy: a remote producer feeding the group
//!
//! The pulled session attaches through the normal producer slot as
//! [`Producer::RelayPull`](crate::session::Producer::RelayPull), so it obeys
//! the single-producer rule like any local producer.

use super::state::{RelayMachine, RelayState};
use crate::config::RelayPullConfig;

/// What the group should do with the pull this tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullAction {
    None,
    /// Issue a connect attempt with this generation
    Connect { url: String, generation: u64 },
    /// The pull has had no consumers for too long
    Stop,
}

#[derive(Debug)]
pub struct PullProxy {
    /// `None` when pulling is not configured for this stream
    url: Option<String>,
    on_demand: bool,
    stop_no_consumer_timeout: u32,
    machine: RelayMachine,
    no_consumer_since: Option<u32>,
}

impl PullProxy {
    pub fn new(config: &RelayPullConfig, app: &str, stream: &str) -> Self {
        Self {
            url: config.pull_url(app, stream),
            on_demand: config.on_demand,
            stop_no_consumer_timeout: config.stop_no_consumer_timeout_sec,
            machine: RelayMachine::new(config.backoff.clone()),
            no_consumer_since: None,
        }
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn is_configured(&self) -> bool {
        self.url.is_some()
    }

    pub fn state(&self) -> RelayState {
        self.machine.state()
    }

    pub fn machine_mut(&mut self) -> &mut RelayMachine {
        &mut self.machine
    }

    /// Connecting, pulling or waiting to retry
    pub fn is_alive(&self) -> bool {
        self.machine.is_running()
    }

    /// Decide the next step
    ///
    /// `has_local_producer` is a non-relay producer; `has_consumers` counts
    /// every output session.
    pub fn poll(&mut self, tick: u32, has_local_producer: bool, has_consumers: bool) -> PullAction {
        let Some(url) = &self.url else {
            return PullAction::None;
        };

        if has_local_producer {
            if self.machine.is_running() {
                tracing::info!(url = %url, "Local producer present, relay pull stopped");
                self.machine.stop();
            }
            self.no_consumer_since = None;
            return PullAction::None;
        }

        let wanted = !self.on_demand || has_consumers;
        if !wanted {
            match self.machine.state() {
                RelayState::Active => {
                    let since = *self.no_consumer_since.get_or_insert(tick);
                    if tick.saturating_sub(since) >= self.stop_no_consumer_timeout {
                        self.no_consumer_since = None;
                        return PullAction::Stop;
                    }
                }
                RelayState::Retrying { .. } | RelayState::Failed => self.machine.stop(),
                _ => {}
            }
            return PullAction::None;
        }

        self.no_consumer_since = None;
        if self.machine.should_connect(tick) {
            let url = url.clone();
            let generation = self.machine.begin_connect();
            return PullAction::Connect { url, generation };
        }
        PullAction::None
    }
}
