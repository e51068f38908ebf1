#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use relay_hub::media::{h264, AvcConfig, FlvTag, VideoCodec};
use relay_hub::remux::SegmentInfo;
use relay_hub::session::{gen_unique_key, TrafficCounter};
use relay_hub::{
    ChannelSink, GroupObserver, HubConfig, IngestHandle, MessageSink, NoopObserver, RelayConnector,
    RelayError, SessionControl, SessionKind, SessionStat, StreamGroup, StreamKey,
};

pub const SPS: &[u8] = &[0x67, 0x64, 0x00, 0x1F, 0xAC];
pub const PPS: &[u8] = &[0x68, 0xEF, 0x38];
pub const IDR: &[u8] = &[0x65, 0x88, 0x84];
pub const SLICE: &[u8] = &[0x41, 0x9A, 0x02];

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn new_group(config: HubConfig) -> Arc<StreamGroup> {
    StreamGroup::new(
        StreamKey::new("live", "test"),
        Arc::new(config),
        Arc::new(NoopObserver),
        None,
    )
}

pub fn avcc(nalus: &[&[u8]]) -> Bytes {
    let mut out = BytesMut::new();
    for n in nalus {
        h264::put_avcc(&mut out, n);
    }
    out.freeze()
}

pub fn video_header() -> FlvTag {
    let config =
        AvcConfig::from_parameter_sets(Bytes::from_static(SPS), Bytes::from_static(PPS)).unwrap();
    FlvTag::video_sequence_header(VideoCodec::Avc, 0, &config.raw)
}

pub fn video_frame(ts: u32, keyframe: bool) -> FlvTag {
    let nalu = if keyframe { IDR } else { SLICE };
    FlvTag::video_nalus(VideoCodec::Avc, ts, keyframe, 0, &avcc(&[nalu]))
}

/// `sizes[i]` frames per GOP at 40 ms spacing, first frame of each GOP a keyframe
pub fn gops(start_ts: u32, sizes: &[usize]) -> Vec<FlvTag> {
    let mut ts = start_ts;
    let mut out = Vec::new();
    for &size in sizes {
        for i in 0..size {
            out.push(video_frame(ts, i == 0));
            ts += 40;
        }
    }
    out
}

pub fn drain<T>(rx: &mut mpsc::Receiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(item) = rx.try_recv() {
        out.push(item);
    }
    out
}

/// Poll `cond` until it holds, yielding to spawned tasks in between
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

/// Producer session whose read activity the test drives by hand
pub struct TestSession {
    key: String,
    kind: SessionKind,
    pub traffic: TrafficCounter,
    disposed: AtomicBool,
}

impl TestSession {
    pub fn new(kind: SessionKind) -> Arc<Self> {
        Self::with_key(kind, gen_unique_key(kind))
    }

    pub fn with_key(kind: SessionKind, key: String) -> Arc<Self> {
        Arc::new(Self {
            key,
            kind,
            traffic: TrafficCounter::new(),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl SessionControl for TestSession {
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
        self.traffic.fill_stat(&mut stat);
        stat
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}

/// Connector that succeeds or fails on demand and records what it created
#[derive(Default)]
pub struct MockConnector {
    pub fail: AtomicBool,
    /// Targets refused even when `fail` is clear
    pub fail_urls: Mutex<Vec<String>>,
    /// Fed through the ingest handle before `pull` resolves
    pub early_frames: Mutex<Vec<FlvTag>>,
    pub early_accepted: Mutex<Vec<bool>>,
    pub pull_calls: AtomicUsize,
    pub push_calls: AtomicUsize,
    pub pulled: Mutex<Vec<(Arc<TestSession>, IngestHandle)>>,
    pub pushed: Mutex<Vec<(Arc<ChannelSink<FlvTag>>, mpsc::Receiver<FlvTag>)>>,
}

#[async_trait]
impl RelayConnector for MockConnector {
    async fn pull(
        &self,
        url: &str,
        session_key: &str,
        ingest: IngestHandle,
    ) -> Result<Arc<dyn SessionControl>, RelayError> {
        self.pull_calls.fetch_add(1, Ordering::SeqCst);
        let early: Vec<FlvTag> = self.early_frames.lock().drain(..).collect();
        for msg in early {
            let accepted = ingest.feed_message(msg);
            self.early_accepted.lock().push(accepted);
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(RelayError::Connect {
                url: url.to_string(),
                reason: "refused".into(),
            });
        }
        let session = TestSession::with_key(SessionKind::RtmpPull, session_key.to_string());
        self.pulled.lock().push((session.clone(), ingest));
        Ok(session)
    }

    async fn push(&self, url: &str, _session_key: &str) -> Result<Arc<dyn MessageSink>, RelayError> {
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) || self.fail_urls.lock().iter().any(|u| u == url) {
            return Err(RelayError::Connect {
                url: url.to_string(),
                reason: "refused".into(),
            });
        }
        let (sink, rx) = ChannelSink::<FlvTag>::new(SessionKind::RtmpPush, 256);
        self.pushed.lock().push((sink.clone(), rx));
        Ok(sink)
    }
}

/// Observer that records event names
#[derive(Default)]
pub struct RecordingObserver {
    pub events: Mutex<Vec<String>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl GroupObserver for RecordingObserver {
    fn cleanup_segments_if_needed(&self, app: &str, stream: &str) {
        self.events.lock().push(format!("cleanup {app}/{stream}"));
    }

    fn on_segment_produced(&self, _app: &str, _stream: &str, info: &SegmentInfo) {
        self.events.lock().push(format!("segment {}", info.sequence));
    }

    fn on_relay_pull_start(&self, _app: &str, _stream: &str, url: &str) {
        self.events.lock().push(format!("pull start {url}"));
    }

    fn on_relay_pull_stop(&self, _app: &str, _stream: &str, url: &str) {
        self.events.lock().push(format!("pull stop {url}"));
    }

    fn on_relay_push_stop(&self, _app: &str, _stream: &str, url: &str) {
        self.events.lock().push(format!("push stop {url}"));
    }
}
