//! Per-session traffic counters and statistics

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;

use super::key::SessionKind;

/// Snapshot reported by `GetStat`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStat {
    pub session_id: String,
    /// "RTMP", "RTSP", "FLV", "TS", "PS", "CUSTOMIZE"
    pub protocol: String,
    /// "PUB", "SUB", "PULL" or "PUSH"
    pub base_type: String,
    pub remote_addr: String,
    /// Unix time in milliseconds
    pub start_time_ms: u64,
    pub read_bytes_sum: u64,
    pub wrote_bytes_sum: u64,
    /// Rate over the last stat interval, in kbit/s
    pub read_bitrate_kbits: u64,
    pub write_bitrate_kbits: u64,
}

impl SessionStat {
    pub fn new(session_id: &str, kind: SessionKind) -> Self {
        let base_type = match kind {
            SessionKind::RtmpPull => "PULL",
            SessionKind::RtmpPush => "PUSH",
            k => match k.role() {
                Some(super::key::SessionRole::Producer) => "PUB",
                Some(super::key::SessionRole::Consumer) => "SUB",
                None => "",
            },
        };
        Self {
            session_id: session_id.to_string(),
            protocol: kind.protocol().to_string(),
            base_type: base_type.to_string(),
            ..Default::default()
        }
    }

    /// Bitrate in the direction the session carries media
    pub fn bitrate_kbits(&self) -> u64 {
        self.read_bitrate_kbits.max(self.write_bitrate_kbits)
    }
}

#[derive(Debug, Default)]
struct RateState {
    prev_read: u64,
    prev_wrote: u64,
    read_kbits: u64,
    write_kbits: u64,
}

/// Byte counters shared between a session's I/O context and the hub
///
/// Liveness is "bytes moved since the previous check"; every call to
/// [`TrafficCounter::is_alive`] starts a new check window.
#[derive(Debug)]
pub struct TrafficCounter {
    read_bytes: AtomicU64,
    wrote_bytes: AtomicU64,
    checked_read: AtomicU64,
    checked_wrote: AtomicU64,
    rate: Mutex<RateState>,
    start_time_ms: u64,
}

impl Default for TrafficCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl TrafficCounter {
    pub fn new() -> Self {
        let start_time_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            read_bytes: AtomicU64::new(0),
            wrote_bytes: AtomicU64::new(0),
            checked_read: AtomicU64::new(0),
            checked_wrote: AtomicU64::new(0),
            rate: Mutex::new(RateState::default()),
            start_time_ms,
        }
    }

    pub fn add_read(&self, n: usize) {
        self.read_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_wrote(&self, n: usize) {
        self.wrote_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn read_bytes(&self) -> u64 {
        self.read_bytes.load(Ordering::Relaxed)
    }

    pub fn wrote_bytes(&self) -> u64 {
        self.wrote_bytes.load(Ordering::Relaxed)
    }

    /// (read advanced, write advanced) since the previous call
    pub fn is_alive(&self) -> (bool, bool) {
        let read = self.read_bytes();
        let wrote = self.wrote_bytes();
        let prev_read = self.checked_read.swap(read, Ordering::Relaxed);
        let prev_wrote = self.checked_wrote.swap(wrote, Ordering::Relaxed);
        (read != prev_read, wrote != prev_wrote)
    }

    /// Recompute bitrates over the last `interval_sec`
    pub fn update_stat(&self, interval_sec: u32) {
        let interval = interval_sec.max(1) as u64;
        let read = self.read_bytes();
        let wrote = self.wrote_bytes();

        let mut rate = self.rate.lock();
        rate.read_kbits = read.saturating_sub(rate.prev_read) * 8 / 1000 / interval;
        rate.write_kbits = wrote.saturating_sub(rate.prev_wrote) * 8 / 1000 / interval;
        rate.prev_read = read;
        rate.prev_wrote = wrote;
    }

    /// Fill the traffic fields of `stat`
    pub fn fill_stat(&self, stat: &mut SessionStat) {
        let rate = self.rate.lock();
        stat.start_time_ms = self.start_time_ms;
        stat.read_bytes_sum = self.read_bytes();
        stat.wrote_bytes_sum = self.wrote_bytes();
        stat.read_bitrate_kbits = rate.read_kbits;
        stat.write_bitrate_kbits = rate.write_kbits;
    }
}
