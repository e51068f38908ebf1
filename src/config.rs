//! Hub configuration
//!
//! Loaded from JSON by the embedding server (file handling stays outside this
//! crate) or built in code with the chainable setters.

use serde::Deserialize;

use crate::error::Result;

/// Per-group behavior shared by every stream group of a server
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Produce segment-ready frames for HTTP-TS consumers
    pub httpts_enable: bool,

    /// Produce SDP and packets for RTSP consumers
    pub rtsp_enable: bool,

    /// Segment output
    pub hls: HlsConfig,

    /// GOPs retained for internal-message consumers (RTMP, HTTP-FLV, push relays)
    pub message_gop_num: usize,

    /// GOPs retained for segment consumers (HTTP-TS)
    pub segment_gop_num: usize,

    /// Frames kept per GOP before dropping until the next keyframe
    pub max_frames_per_gop: usize,

    /// Liveness sweep interval in ticks (0 disables the sweep)
    pub check_session_alive_interval_sec: u32,

    /// Statistics recompute interval in ticks (0 disables it)
    pub calc_session_stat_interval_sec: u32,

    /// GB28181 (PS over RTP) producer
    pub ps_pub: PsPubConfig,

    /// Programmatic producer
    pub customize_pub: CustomizePubConfig,

    /// Ticks per second of producer-supplied packet timestamps
    pub timestamp_time_base: u32,

    pub relay_pull: RelayPullConfig,

    pub relay_push: RelayPushConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            httpts_enable: true,
            rtsp_enable: true,
            hls: HlsConfig::default(),
            message_gop_num: 2,
            segment_gop_num: 1,
            max_frames_per_gop: 1500,
            check_session_alive_interval_sec: 10,
            calc_session_stat_interval_sec: 5,
            ps_pub: PsPubConfig::default(),
            customize_pub: CustomizePubConfig::default(),
            timestamp_time_base: 1000,
            relay_pull: RelayPullConfig::default(),
            relay_push: RelayPushConfig::default(),
        }
    }
}

/// Segment (HLS) output settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HlsConfig {
    pub enable: bool,
    /// Minimum fragment duration; a fragment closes on the first keyframe past it
    pub fragment_duration_ms: u32,
    /// Ask the observer to remove segment files when the producer leaves
    pub cleanup_on_idle: bool,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            enable: false,
            fragment_duration_ms: 3000,
            cleanup_on_idle: true,
        }
    }
}

/// Constant-increment timestamps for producers without usable clocks
///
/// An approximation: frames are assumed to arrive at exactly this cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyntheticPacing {
    pub video_fps: u32,
    pub audio_sample_rate: u32,
    pub audio_samples_per_frame: u32,
}

impl Default for SyntheticPacing {
    fn default() -> Self {
        Self {
            video_fps: 25,
            audio_sample_rate: 44100,
            audio_samples_per_frame: 1024,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PsPubConfig {
    /// Seconds without read activity before the producer is disposed (0 = never)
    pub timeout_sec: u32,
    pub pacing: Option<SyntheticPacing>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct CustomizePubConfig {
    pub pacing: Option<SyntheticPacing>,
}

/// Retry schedule for relay connections, in ticks
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_sec: u32,
    pub max_sec: u32,
    /// Attempts before giving up (0 = retry forever)
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_sec: 1,
            max_sec: 30,
            max_retries: 0,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `attempt` (1-based), doubling up to `max_sec`
    pub fn delay_for(&self, attempt: u32) -> u32 {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.initial_sec.max(1).saturating_mul(1 << shift);
        delay.min(self.max_sec.max(1))
    }

    /// Whether another attempt is allowed after `failures` failures
    pub fn allows_retry(&self, failures: u32) -> bool {
        self.max_retries == 0 || failures < self.max_retries
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RelayPullConfig {
    pub enable: bool,
    /// Remote URL with `{app}` and `{stream}` placeholders
    pub url_template: String,
    /// Pull only while consumers are attached
    pub on_demand: bool,
    /// Ticks without consumers before an on-demand pull is stopped
    pub stop_no_consumer_timeout_sec: u32,
    pub backoff: BackoffConfig,
}

impl Default for RelayPullConfig {
    fn default() -> Self {
        Self {
            enable: false,
            url_template: String::new(),
            on_demand: true,
            stop_no_consumer_timeout_sec: 10,
            backoff: BackoffConfig::default(),
        }
    }
}

impl RelayPullConfig {
    /// Remote URL for a stream, if pulling is configured
    pub fn pull_url(&self, app: &str, stream: &str) -> Option<String> {
        if !self.enable || self.url_template.is_empty() {
            return None;
        }
        Some(render_url_template(&self.url_template, app, stream))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RelayPushConfig {
    pub enable: bool,
    /// Remote URLs with `{app}` and `{stream}` placeholders
    pub targets: Vec<String>,
    pub backoff: BackoffConfig,
}

impl RelayPushConfig {
    pub fn target_urls(&self, app: &str, stream: &str) -> Vec<String> {
        if !self.enable {
            return Vec::new();
        }
        self.targets
            .iter()
            .map(|t| render_url_template(t, app, stream))
            .collect()
    }
}

fn render_url_template(template: &str, app: &str, stream: &str) -> String {
    template.replace("{app}", app).replace("{stream}", stream)
}

impl HubConfig {
    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Enable or disable HTTP-TS output
    pub fn httpts(mut self, enable: bool) -> Self {
        self.httpts_enable = enable;
        self
    }

    /// Enable or disable RTSP output
    pub fn rtsp(mut self, enable: bool) -> Self {
        self.rtsp_enable = enable;
        self
    }

    /// Enable or disable HLS segment notifications
    pub fn hls(mut self, enable: bool) -> Self {
        self.hls.enable = enable;
        self
    }

    pub fn fragment_duration_ms(mut self, ms: u32) -> Self {
        self.hls.fragment_duration_ms = ms;
        self
    }

    /// Set the internal-message cache capacity in GOPs
    pub fn message_gop_num(mut self, num: usize) -> Self {
        self.message_gop_num = num;
        self
    }

    /// Set the segment cache capacity in GOPs
    pub fn segment_gop_num(mut self, num: usize) -> Self {
        self.segment_gop_num = num;
        self
    }

    pub fn max_frames_per_gop(mut self, num: usize) -> Self {
        self.max_frames_per_gop = num;
        self
    }

    /// Set the liveness sweep interval
    pub fn check_session_alive_interval(mut self, ticks: u32) -> Self {
        self.check_session_alive_interval_sec = ticks;
        self
    }

    /// Set the statistics interval
    pub fn calc_session_stat_interval(mut self, ticks: u32) -> Self {
        self.calc_session_stat_interval_sec = ticks;
        self
    }

    pub fn ps_pub_timeout(mut self, secs: u32) -> Self {
        self.ps_pub.timeout_sec = secs;
        self
    }

    pub fn customize_pub_pacing(mut self, pacing: SyntheticPacing) -> Self {
        self.customize_pub.pacing = Some(pacing);
        self
    }

    pub fn timestamp_time_base(mut self, ticks_per_sec: u32) -> Self {
        self.timestamp_time_base = ticks_per_sec.max(1);
        self
    }

    pub fn relay_pull(mut self, relay_pull: RelayPullConfig) -> Self {
        self.relay_pull = relay_pull;
        self
    }

    pub fn relay_push(mut self, relay_push: RelayPushConfig) -> Self {
        self.relay_push = relay_push;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HubConfig::default();

        assert!(config.httpts_enable);
        assert!(config.rtsp_enable);
        assert!(!config.hls.enable);
        assert_eq!(config.message_gop_num, 2);
        assert_eq!(config.check_session_alive_interval_sec, 10);
        assert_eq!(config.calc_session_stat_interval_sec, 5);
        assert_eq!(config.timestamp_time_base, 1000);
        assert!(!config.relay_pull.enable);
        assert!(config.relay_push.targets.is_empty());
    }

    #[test]
    fn test_from_json_partial() {
        let config = HubConfig::from_json_str(
            r#"{
                "message_gop_num": 3,
                "hls": { "enable": true },
                "ps_pub": { "timeout_sec": 30, "pacing": { "video_fps": 30 } },
                "relay_pull": { "enable": true, "url_template": "rtmp://origin/{app}/{stream}" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.message_gop_num, 3);
        assert!(config.hls.enable);
        assert_eq!(config.hls.fragment_duration_ms, 3000);
        assert_eq!(config.ps_pub.timeout_sec, 30);

        let pacing = config.ps_pub.pacing.unwrap();
        assert_eq!(pacing.video_fps, 30);
        assert_eq!(pacing.audio_sample_rate, 44100);

        assert_eq!(
            config.relay_pull.pull_url("live", "cam1").as_deref(),
            Some("rtmp://origin/live/cam1")
        );
    }

    #[test]
    fn test_from_json_invalid() {
        let err = HubConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, crate::error::Error::Json(_)));
    }

    #[test]
    fn test_pull_url_requires_enable() {
        let pull = RelayPullConfig {
            url_template: "rtmp://origin/{app}/{stream}".into(),
            ..Default::default()
        };
        assert_eq!(pull.pull_url("live", "a"), None);
    }

    #[test]
    fn test_push_targets() {
        let push = RelayPushConfig {
            enable: true,
            targets: vec![
                "rtmp://edge1/{app}/{stream}".into(),
                "rtmp://edge2/{app}/{stream}".into(),
            ],
            ..Default::default()
        };
        assert_eq!(
            push.target_urls("live", "s"),
            vec!["rtmp://edge1/live/s", "rtmp://edge2/live/s"]
        );

        let disabled = RelayPushConfig {
            enable: false,
            ..push
        };
        assert!(disabled.target_urls("live", "s").is_empty());
    }

    #[test]
    fn test_backoff_schedule() {
        let backoff = BackoffConfig {
            initial_sec: 2,
            max_sec: 10,
            max_retries: 3,
        };
        assert_eq!(backoff.delay_for(1), 2);
        assert_eq!(backoff.delay_for(2), 4);
        assert_eq!(backoff.delay_for(3), 8);
        assert_eq!(backoff.delay_for(4), 10);
        assert!(backoff.allows_retry(2));
        assert!(!backoff.allows_retry(3));

        assert!(BackoffConfig::default().allows_retry(u32::MAX));
    }

    #[test]
    fn test_builder_chaining() {
        let config = HubConfig::default()
            .httpts(false)
            .rtsp(false)
            .hls(true)
            .fragment_duration_ms(2000)
            .message_gop_num(1)
            .segment_gop_num(0)
            .check_session_alive_interval(5)
            .calc_session_stat_interval(1)
            .ps_pub_timeout(20)
            .timestamp_time_base(90000);

        assert!(!config.httpts_enable);
        assert!(!config.rtsp_enable);
        assert!(config.hls.enable);
        assert_eq!(config.hls.fragment_duration_ms, 2000);
        assert_eq!(config.message_gop_num, 1);
        assert_eq!(config.segment_gop_num, 0);
        assert_eq!(config.check_session_alive_interval_sec, 5);
        assert_eq!(config.calc_session_stat_interval_sec, 1);
        assert_eq!(config.ps_pub.timeout_sec, 20);
        assert_eq!(config.timestamp_time_base, 90000);
    }

    #[test]
    fn test_time_base_never_zero() {
        let config = HubConfig::default().timestamp_time_base(0);
        assert_eq!(config.timestamp_time_base, 1);
    }
}
