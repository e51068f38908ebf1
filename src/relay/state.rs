//! Connect/retry state machine shared by pull and push proxies
//!
//! ```text
//! Idle ──> Connecting ──> Active
//!  ^           │            │
//!  │           v            v
//!  └─ stop ── Retrying <────┘ ──> Failed (retries exhausted)
//! ```
//!
//! Time is measured in group ticks. Every connect attempt gets a generation
//! id; results carrying an older id are stale and ignored.

use serde::Serialize;

use crate::config::BackoffConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RelayState {
    Idle,
    Connecting,
    Active,
    /// Waiting for `retry_at` before the next attempt
    Retrying { retry_at: u32 },
    /// Retries exhausted; only `stop` leaves this state
    Failed,
}

#[derive(Debug, Clone)]
pub struct RelayMachine {
    state: RelayState,
    /// Consecutive failures since the last successful connect
    failures: u32,
    generation: u64,
    backoff: BackoffConfig,
}

impl RelayMachine {
    pub fn new(backoff: BackoffConfig) -> Self {
        Self {
            state: RelayState::Idle,
            failures: 0,
            generation: 0,
            backoff,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_active(&self) -> bool {
        self.state == RelayState::Active
    }

    /// Connecting, active, or waiting to retry
    pub fn is_running(&self) -> bool {
        matches!(
            self.state,
            RelayState::Connecting | RelayState::Active | RelayState::Retrying { .. }
        )
    }

    /// Whether an attempt should be issued at `tick`
    pub fn should_connect(&self, tick: u32) -> bool {
        match self.state {
            RelayState::Idle => true,
            RelayState::Retrying { retry_at } => tick >= retry_at,
            _ => false,
        }
    }

    /// Enter `Connecting`; returns the attempt's generation
    pub fn begin_connect(&mut self) -> u64 {
        self.generation += 1;
        self.state = RelayState::Connecting;
        self.generation
    }

    /// Returns `false` for a stale result
    pub fn on_connected(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.state != RelayState::Connecting {
            return false;
        }
        self.state = RelayState::Active;
        self.failures = 0;
        true
    }

    /// Returns `false` for a stale result
    pub fn on_failed(&mut self, generation: u64, tick: u32) -> bool {
        if generation != self.generation || self.state != RelayState::Connecting {
            return false;
        }
        self.schedule_retry(tick);
        true
    }

    /// An active connection went away
    pub fn on_lost(&mut self, tick: u32) {
        if self.state == RelayState::Active {
            self.generation += 1;
            self.schedule_retry(tick);
        }
    }

    /// Relay no longer needed. In-flight attempts become stale.
    pub fn stop(&mut self) {
        self.generation += 1;
        self.state = RelayState::Idle;
        self.failures = 0;
    }

    fn schedule_retry(&mut self, tick: u32) {
        self.failures += 1;
        if self.backoff.allows_retry(self.failures) {
            let delay = self.backoff.delay_for(self.failures);
            self.state = RelayState::Retrying {
                retry_at: tick.saturating_add(delay),
            };
        } else {
            self.state = RelayState::Failed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(max_retries: u32) -> RelayMachine {
        RelayMachine::new(BackoffConfig {
            initial_sec: 2,
            max_sec: 8,
            max_retries,
        })
    }

    #[test]
    fn test_connect_and_lose() {
        let mut m = machine(0);
        assert!(m.should_connect(0));

        let gen = m.begin_connect();
        assert_eq!(m.state(), RelayState::Connecting);
        assert!(!m.should_connect(1));
        assert!(m.on_connected(gen));
        assert!(m.is_active());

        m.on_lost(10);
        assert_eq!(m.state(), RelayState::Retrying { retry_at: 12 });
        assert!(!m.should_connect(11));
        assert!(m.should_connect(12));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut m = machine(0);
        let mut retry_ats = Vec::new();
        for tick in [0u32, 100, 200, 300] {
            let gen = m.begin_connect();
            assert!(m.on_failed(gen, tick));
            if let RelayState::Retrying { retry_at } = m.state() {
                retry_ats.push(retry_at - tick);
            }
        }
        assert_eq!(retry_ats, vec![2, 4, 8, 8]);
    }

    #[test]
    fn test_retries_exhausted() {
        let mut m = machine(2);
        let gen = m.begin_connect();
        m.on_failed(gen, 0);
        assert!(matches!(m.state(), RelayState::Retrying { .. }));

        let gen = m.begin_connect();
        m.on_failed(gen, 5);
        assert_eq!(m.state(), RelayState::Failed);
        assert!(!m.should_connect(1000));

        m.stop();
        assert_eq!(m.state(), RelayState::Idle);
        assert_eq!(m.failures(), 0);
    }

    #[test]
    fn test_stale_results_ignored() {
        let mut m = machine(0);
        let old = m.begin_connect();
        m.stop();
        let new = m.begin_connect();

        assert!(!m.on_connected(old));
        assert!(!m.on_failed(old, 0));
        assert_eq!(m.state(), RelayState::Connecting);
        assert!(m.on_connected(new));
    }
}
