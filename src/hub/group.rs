//! Stream group
//!
//! One [`StreamGroup`] exists per (app, stream) pair. It owns the producer
//! slot, the consumer sets of every output protocol, the remuxers, both
//! history caches and the relay proxies. Everything lives behind a single
//! [`parking_lot::Mutex`]; every control operation and every ingested frame
//! takes it for its full duration, so cache replay for a joining consumer can
//! never interleave with live fan-out.
//!
//! The lock is never held across an `.await`. Relay connects run on spawned
//! tasks and re-enter through a weak reference once they resolve.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::ingest::IngestHandle;
use super::observer::GroupObserver;
use super::stat::GroupStat;
use super::stream_key::StreamKey;
use crate::cache::GopCache;
use crate::config::HubConfig;
use crate::error::{HubError, RelayError};
use crate::media::{AvPacket, FlvTag, VideoCodec};
use crate::relay::{PullAction, PullProxy, PushProxy, RelayConnector, RelayState};
use crate::remux::{
    AvPacketToFlvRemuxer, FlvToMpegtsRemuxer, FlvToRtspRemuxer, RtspOutput, TimestampPolicy,
    TsFrame,
};
use crate::session::{
    gen_unique_key, Consumer, CustomizePubSession, MessageSink, Producer, RtspSink,
    SessionControl, SessionKind, TsSink,
};

type SessionSet<S> = HashMap<String, Arc<S>>;

/// Upper bound on frames a connecting relay pull may feed before it owns the slot
const PENDING_PULL_MAX_FRAMES: usize = 1024;

/// A relay pull whose connect has not resolved yet
struct PendingPull {
    session_key: String,
    frames: Vec<FlvTag>,
}

struct GroupInner {
    producer: Option<Producer>,

    /// Present while a packet-feeding producer is attached
    av_remuxer: Option<AvPacketToFlvRemuxer>,
    /// Present while a producer is attached and HTTP-TS or HLS is enabled
    ts_remuxer: Option<FlvToMpegtsRemuxer>,
    /// Present while a producer is attached and RTSP is enabled
    rtsp_remuxer: Option<FlvToRtspRemuxer>,

    message_cache: GopCache<FlvTag>,
    segment_cache: GopCache<TsFrame>,

    rtmp_subs: SessionSet<dyn MessageSink>,
    httpflv_subs: SessionSet<dyn MessageSink>,
    httpts_subs: SessionSet<dyn TsSink>,
    rtsp_subs: SessionSet<dyn RtspSink>,
    /// RTSP consumers that attached before the SDP was known
    rtsp_waiting: SessionSet<dyn RtspSink>,

    pull: PullProxy,
    /// Frames the connecting pull fed before it took the producer slot
    pending_pull: Option<PendingPull>,
    pushes: HashMap<String, PushProxy>,

    /// Tick of the last PS producer timeout check
    ps_prev_check_tick: Option<u32>,
    last_tick: u32,
    disposed: bool,
}

impl GroupInner {
    fn is_producer(&self, session_key: &str) -> bool {
        self.producer
            .as_ref()
            .is_some_and(|p| p.unique_key() == session_key)
    }

    /// Hold a frame from the connecting relay pull until its connect resolves
    fn buffer_pending_pull(&mut self, session_key: &str, msg: FlvTag) -> bool {
        if self.producer.is_some() {
            return false;
        }
        let Some(pending) = self
            .pending_pull
            .as_mut()
            .filter(|p| p.session_key == session_key)
        else {
            return false;
        };
        if pending.frames.len() < PENDING_PULL_MAX_FRAMES {
            pending.frames.push(msg);
        } else {
            tracing::debug!(session = %session_key, "Relay pull not attached yet, frame dropped");
        }
        true
    }

    fn take_pending_pull(&mut self, session_key: &str) -> Vec<FlvTag> {
        match self.pending_pull.take() {
            Some(p) if p.session_key == session_key => p.frames,
            other => {
                self.pending_pull = other;
                Vec::new()
            }
        }
    }

    fn has_local_producer(&self) -> bool {
        self.producer.as_ref().is_some_and(|p| !p.is_relay())
    }

    fn has_in_session(&self) -> bool {
        self.producer.is_some()
    }

    fn has_sub_session(&self) -> bool {
        !self.rtmp_subs.is_empty()
            || !self.httpflv_subs.is_empty()
            || !self.httpts_subs.is_empty()
            || !self.rtsp_subs.is_empty()
            || !self.rtsp_waiting.is_empty()
    }

    fn push_session_num(&self) -> usize {
        self.pushes.values().filter(|p| p.is_pushing()).count()
    }

    fn has_out_session(&self) -> bool {
        self.has_sub_session() || self.push_session_num() > 0
    }

    fn is_total_empty(&self) -> bool {
        !self.has_in_session() && !self.has_out_session()
    }

    fn out_session_num(&self) -> usize {
        self.rtmp_subs.len()
            + self.httpflv_subs.len()
            + self.httpts_subs.len()
            + self.rtsp_subs.len()
            + self.rtsp_waiting.len()
            + self.push_session_num()
    }
}

pub struct StreamGroup {
    unique_key: String,
    key: StreamKey,
    config: Arc<HubConfig>,
    observer: Arc<dyn GroupObserver>,
    connector: Option<Arc<dyn RelayConnector>>,
    token: CancellationToken,
    weak_self: Weak<StreamGroup>,
    inner: Mutex<GroupInner>,
}

impl StreamGroup {
    pub fn new(
        key: StreamKey,
        config: Arc<HubConfig>,
        observer: Arc<dyn GroupObserver>,
        connector: Option<Arc<dyn RelayConnector>>,
    ) -> Arc<Self> {
        let unique_key = gen_unique_key(SessionKind::Group);
        let pushes = config
            .relay_push
            .target_urls(&key.app, &key.name)
            .into_iter()
            .map(|url| {
                let proxy = PushProxy::new(url.clone(), config.relay_push.backoff.clone());
                (url, proxy)
            })
            .collect();

        let inner = GroupInner {
            producer: None,
            av_remuxer: None,
            ts_remuxer: None,
            rtsp_remuxer: None,
            message_cache: GopCache::with_frame_limit(
                "message",
                config.message_gop_num,
                config.max_frames_per_gop,
            ),
            segment_cache: GopCache::with_frame_limit(
                "segment",
                config.segment_gop_num,
                config.max_frames_per_gop,
            ),
            rtmp_subs: HashMap::new(),
            httpflv_subs: HashMap::new(),
            httpts_subs: HashMap::new(),
            rtsp_subs: HashMap::new(),
            rtsp_waiting: HashMap::new(),
            pull: PullProxy::new(&config.relay_pull, &key.app, &key.name),
            pending_pull: None,
            pushes,
            ps_prev_check_tick: None,
            last_tick: 0,
            disposed: false,
        };

        tracing::info!(group = %unique_key, stream = %key, "Group created");

        Arc::new_cyclic(|weak| Self {
            unique_key,
            key,
            config,
            observer,
            connector,
            token: CancellationToken::new(),
            weak_self: weak.clone(),
            inner: Mutex::new(inner),
        })
    }

    pub fn unique_key(&self) -> &str {
        &self.unique_key
    }

    pub fn stream_key(&self) -> &StreamKey {
        &self.key
    }

    pub fn app_name(&self) -> &str {
        &self.key.app
    }

    pub fn stream_name(&self) -> &str {
        &self.key.name
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Resolves once the group is disposed
    pub async fn run_loop(&self) {
        self.token.cancelled().await;
        tracing::debug!(group = %self.unique_key, "Run loop exited");
    }

    pub fn is_disposed(&self) -> bool {
        self.token.is_cancelled()
    }

    // ------------------------------------------------------------------
    // Attach / detach
    // ------------------------------------------------------------------

    /// Attach the single producer
    ///
    /// Fails with [`HubError::ProducerAlreadyPresent`] while any producer,
    /// relay pulls included, is attached.
    pub fn attach_producer(&self, producer: Producer) -> Result<IngestHandle, HubError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        self.check_producer_slot(inner)?;
        Ok(self.add_in(inner, producer))
    }

    /// Create and attach a programmatic producer
    pub fn attach_customize_pub(&self) -> Result<Arc<CustomizePubSession>, HubError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        self.check_producer_slot(inner)?;

        let key = gen_unique_key(SessionKind::CustomizePub);
        let ingest = IngestHandle::new(self.weak_self.clone(), &key);
        let session = Arc::new(CustomizePubSession::new(key, ingest));
        self.add_in(inner, Producer::Customize(session.clone()));
        Ok(session)
    }

    /// Attach a consumer
    ///
    /// Cached headers and GOPs are written to the consumer before it joins
    /// the live set.
    pub fn attach_consumer(&self, consumer: Consumer) -> Result<(), HubError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.disposed {
            return Err(HubError::Disposed(self.unique_key.clone()));
        }

        let session_key = consumer.unique_key().to_string();
        tracing::info!(
            group = %self.unique_key,
            stream = %self.key,
            session = %session_key,
            kind = %consumer.kind(),
            "Consumer attached"
        );

        match consumer {
            Consumer::Rtmp(s) => {
                replay_messages(&inner.message_cache, s.as_ref());
                inner.rtmp_subs.insert(session_key, s);
            }
            Consumer::HttpFlv(s) => {
                replay_messages(&inner.message_cache, s.as_ref());
                inner.httpflv_subs.insert(session_key, s);
            }
            Consumer::HttpTs(s) => {
                for frame in inner.segment_cache.replayable() {
                    s.write_ts_frame(&frame);
                }
                inner.httpts_subs.insert(session_key, s);
            }
            Consumer::Rtsp(s) => {
                let remuxer = inner
                    .rtsp_remuxer
                    .as_ref()
                    .and_then(|r| r.sdp().map(|sdp| (r, sdp)));
                match remuxer {
                    Some((remuxer, sdp)) => {
                        s.set_sdp(sdp);
                        for tag in inner.message_cache.replayable() {
                            match remuxer.tag_to_packet(&tag) {
                                Ok(Some(pkt)) => s.write_packet(&pkt),
                                Ok(None) => {}
                                Err(e) => {
                                    tracing::debug!(session = %session_key, error = %e, "Replay frame skipped")
                                }
                            }
                        }
                        inner.rtsp_subs.insert(session_key, s);
                    }
                    None => {
                        inner.rtsp_waiting.insert(session_key, s);
                    }
                }
            }
        }

        let tick = inner.last_tick;
        self.tick_pull(inner, tick);
        Ok(())
    }

    /// Remove a session that is going away on its own
    ///
    /// The session is disposed (idempotently) and its routing entry dropped.
    pub fn detach_session(&self, session_id: &str) -> bool {
        let Some(kind) = SessionKind::from_unique_key(session_id) else {
            return false;
        };
        let mut guard = self.inner.lock();
        let found = self.remove_session(&mut guard, kind, session_id);
        if found {
            tracing::info!(group = %self.unique_key, session = %session_id, "Session detached");
        }
        found
    }

    /// Dispose a session by id
    ///
    /// The id prefix selects which set is searched. Returns whether a session
    /// matched.
    pub fn kick_session(&self, session_id: &str) -> Result<bool, HubError> {
        let Some(kind) = SessionKind::from_unique_key(session_id) else {
            tracing::error!(
                group = %self.unique_key,
                session = %session_id,
                "Kick session with invalid id format"
            );
            return Err(HubError::InvalidSessionId(session_id.to_string()));
        };

        tracing::info!(group = %self.unique_key, session = %session_id, "Kick session");
        let mut guard = self.inner.lock();
        Ok(self.remove_session(&mut guard, kind, session_id))
    }

    // ------------------------------------------------------------------
    // Ingest
    // ------------------------------------------------------------------

    pub(crate) fn is_producer(&self, session_key: &str) -> bool {
        self.inner.lock().is_producer(session_key)
    }

    pub(crate) fn ingest_message(&self, session_key: &str, msg: FlvTag) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if !inner.is_producer(session_key) {
            return inner.buffer_pending_pull(session_key, msg);
        }
        self.broadcast(inner, msg);
        true
    }

    pub(crate) fn ingest_packet(&self, session_key: &str, pkt: &AvPacket) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if !inner.is_producer(session_key) {
            return false;
        }
        let Some(remuxer) = inner.av_remuxer.as_mut() else {
            tracing::debug!(session = %session_key, "Producer does not feed packets, dropped");
            return false;
        };
        match remuxer.feed_packet(pkt) {
            Ok(tags) => {
                for tag in tags {
                    self.broadcast(inner, tag);
                }
            }
            Err(e) => tracing::warn!(
                group = %self.unique_key,
                payload = pkt.payload_type.name(),
                ts = pkt.timestamp,
                error = %e,
                "Packet dropped"
            ),
        }
        true
    }

    pub(crate) fn ingest_audio_config(&self, session_key: &str, asc: &[u8]) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if !inner.is_producer(session_key) {
            return false;
        }
        let Some(remuxer) = inner.av_remuxer.as_mut() else {
            return false;
        };
        match remuxer.feed_audio_config(asc) {
            Ok(Some(tag)) => self.broadcast(inner, tag),
            Ok(None) => {}
            Err(e) => tracing::warn!(group = %self.unique_key, error = %e, "Audio config rejected"),
        }
        true
    }

    // ------------------------------------------------------------------
    // Periodic work
    // ------------------------------------------------------------------

    /// Advance relays, sweep dead sessions and refresh statistics
    ///
    /// `tick` is a monotonically increasing second count.
    pub fn tick(&self, tick: u32) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.disposed {
            return;
        }
        inner.last_tick = tick;

        self.tick_pull(inner, tick);
        self.start_push_if_needed(inner, tick);
        self.dispose_inactive_sessions(inner, tick);

        let calc = self.config.calc_session_stat_interval_sec;
        if calc != 0 && tick % calc == 0 {
            self.update_all_session_stat(inner, calc);
        }
    }

    /// Dispose every session and stop the run loop
    ///
    /// A second call does nothing.
    pub fn dispose(&self) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.disposed {
            tracing::debug!(group = %self.unique_key, "Group already disposed");
            return;
        }
        inner.disposed = true;
        tracing::info!(group = %self.unique_key, stream = %self.key, "Group disposed");
        self.token.cancel();

        if let Some(producer) = &inner.producer {
            producer.control().dispose();
        }
        dispose_all(&mut inner.rtmp_subs);
        dispose_all(&mut inner.httpflv_subs);
        dispose_all(&mut inner.httpts_subs);
        dispose_all(&mut inner.rtsp_subs);
        dispose_all(&mut inner.rtsp_waiting);

        self.del_in(inner);
        self.stop_pushes(inner);
        inner.pushes.clear();
        inner.pull.machine_mut().stop();
        inner.pending_pull = None;
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Snapshot with at most `max_per_family` sessions per consumer family
    pub fn get_stat(&self, max_per_family: usize) -> GroupStat {
        let inner = self.inner.lock();

        let (stat_pub, stat_pull) = match &inner.producer {
            Some(p) if p.is_relay() => (None, Some(p.control().stat())),
            Some(p) => (Some(p.control().stat()), None),
            None => (None, None),
        };

        let mut stat_subs = Vec::new();
        stat_subs.extend(inner.rtmp_subs.values().take(max_per_family).map(|s| s.stat()));
        stat_subs.extend(inner.httpflv_subs.values().take(max_per_family).map(|s| s.stat()));
        stat_subs.extend(inner.httpts_subs.values().take(max_per_family).map(|s| s.stat()));
        stat_subs.extend(
            inner
                .rtsp_subs
                .values()
                .chain(inner.rtsp_waiting.values())
                .take(max_per_family)
                .map(|s| s.stat()),
        );
        let stat_pushes = inner
            .pushes
            .values()
            .filter_map(|p| p.session())
            .take(max_per_family)
            .map(|s| s.stat())
            .collect();

        let video_codec = match inner.message_cache.video_header().and_then(|h| h.video_codec()) {
            Some(VideoCodec::Avc) => "H264",
            Some(VideoCodec::Hevc) => "H265",
            _ => "",
        };
        let audio_codec = if inner.message_cache.audio_header().is_some() {
            "AAC"
        } else {
            ""
        };

        GroupStat {
            unique_key: self.unique_key.clone(),
            app_name: self.key.app.clone(),
            stream_name: self.key.name.clone(),
            video_codec: video_codec.to_string(),
            audio_codec: audio_codec.to_string(),
            stat_pub,
            stat_pull,
            stat_subs,
            stat_pushes,
        }
    }

    pub fn stringify_debug_stats(&self, max_per_family: usize) -> String {
        serde_json::to_string(&self.get_stat(max_per_family)).unwrap_or_default()
    }

    /// No producer, no consumer, no active relay
    pub fn is_total_empty(&self) -> bool {
        self.inner.lock().is_total_empty()
    }

    /// Empty and not trying to pull; the registry may drop the group
    pub fn is_inactive(&self) -> bool {
        let inner = self.inner.lock();
        inner.is_total_empty() && !inner.pull.is_alive()
    }

    /// A producer or relay pull is attached
    pub fn has_in_session(&self) -> bool {
        self.inner.lock().has_in_session()
    }

    /// A consumer or active push exists
    pub fn has_out_session(&self) -> bool {
        self.inner.lock().has_out_session()
    }

    /// Consumers (waiting RTSP included) plus active pushes
    pub fn out_session_num(&self) -> usize {
        self.inner.lock().out_session_num()
    }

    pub fn producer_key(&self) -> Option<String> {
        self.inner
            .lock()
            .producer
            .as_ref()
            .map(|p| p.unique_key().to_string())
    }

    pub fn pull_state(&self) -> RelayState {
        self.inner.lock().pull.state()
    }

    pub fn push_state(&self, url: &str) -> Option<RelayState> {
        self.inner.lock().pushes.get(url).map(|p| p.state())
    }

    // ------------------------------------------------------------------
    // Internals, called with the lock held
    // ------------------------------------------------------------------

    fn check_producer_slot(&self, inner: &GroupInner) -> Result<(), HubError> {
        if inner.disposed {
            return Err(HubError::Disposed(self.unique_key.clone()));
        }
        if let Some(existing) = &inner.producer {
            tracing::warn!(
                group = %self.unique_key,
                stream = %self.key,
                existing = %existing.unique_key(),
                "Producer already present, attach rejected"
            );
            return Err(HubError::ProducerAlreadyPresent {
                stream: self.key.to_string(),
                existing: existing.unique_key().to_string(),
            });
        }
        Ok(())
    }

    fn timestamp_policy(&self, producer: &Producer) -> TimestampPolicy {
        let pacing = match producer {
            Producer::Ps(_) => self.config.ps_pub.pacing,
            Producer::Customize(_) => self.config.customize_pub.pacing,
            _ => None,
        };
        pacing.map_or(
            TimestampPolicy::Native {
                time_base: self.config.timestamp_time_base,
            },
            TimestampPolicy::Synthetic,
        )
    }

    fn add_in(&self, inner: &mut GroupInner, producer: Producer) -> IngestHandle {
        let session_key = producer.unique_key().to_string();
        tracing::info!(
            group = %self.unique_key,
            stream = %self.key,
            session = %session_key,
            kind = %producer.kind(),
            "Producer attached"
        );

        inner.av_remuxer = producer
            .feeds_packets()
            .then(|| AvPacketToFlvRemuxer::new(self.timestamp_policy(&producer)));
        if self.config.httpts_enable || self.config.hls.enable {
            inner.ts_remuxer = Some(FlvToMpegtsRemuxer::new(self.config.hls.fragment_duration_ms));
        }
        if self.config.rtsp_enable {
            inner.rtsp_remuxer = Some(FlvToRtspRemuxer::new());
        }
        inner.ps_prev_check_tick = None;

        let local = !producer.is_relay();
        inner.producer = Some(producer);
        if local {
            let tick = inner.last_tick;
            self.start_push_if_needed(inner, tick);
        }

        IngestHandle::new(self.weak_self.clone(), &session_key)
    }

    /// Drop the producer and everything derived from it
    fn del_in(&self, inner: &mut GroupInner) {
        let Some(producer) = inner.producer.take() else {
            return;
        };
        tracing::info!(
            group = %self.unique_key,
            stream = %self.key,
            session = %producer.unique_key(),
            "Producer detached"
        );

        inner.av_remuxer = None;
        inner.ts_remuxer = None;
        inner.rtsp_remuxer = None;
        inner.message_cache.reset();
        inner.segment_cache.reset();
        inner.ps_prev_check_tick = None;

        // RTSP consumers need the next producer's SDP before any packet
        let promoted = std::mem::take(&mut inner.rtsp_subs);
        inner.rtsp_waiting.extend(promoted);

        if self.config.hls.enable && self.config.hls.cleanup_on_idle {
            self.observer
                .cleanup_segments_if_needed(&self.key.app, &self.key.name);
        }

        if producer.is_relay() {
            let tick = inner.last_tick;
            inner.pull.machine_mut().on_lost(tick);
            if let Some(url) = inner.pull.url() {
                self.observer
                    .on_relay_pull_stop(&self.key.app, &self.key.name, url);
            }
        } else {
            self.stop_pushes(inner);
        }
    }

    fn remove_session(&self, inner: &mut GroupInner, kind: SessionKind, session_id: &str) -> bool {
        match kind {
            SessionKind::RtmpPub
            | SessionKind::RtspPub
            | SessionKind::PsPub
            | SessionKind::CustomizePub
            | SessionKind::RtmpPull => {
                let matched = inner
                    .producer
                    .as_ref()
                    .is_some_and(|p| p.kind() == kind && p.unique_key() == session_id);
                if matched {
                    if let Some(producer) = &inner.producer {
                        producer.control().dispose();
                    }
                    self.del_in(inner);
                }
                matched
            }
            SessionKind::RtmpSub => remove_consumer(&mut inner.rtmp_subs, session_id),
            SessionKind::FlvSub => remove_consumer(&mut inner.httpflv_subs, session_id),
            SessionKind::TsSub => remove_consumer(&mut inner.httpts_subs, session_id),
            SessionKind::RtspSub => {
                remove_consumer(&mut inner.rtsp_subs, session_id)
                    || remove_consumer(&mut inner.rtsp_waiting, session_id)
            }
            SessionKind::RtmpPush => {
                let tick = inner.last_tick;
                let proxy = inner
                    .pushes
                    .values_mut()
                    .find(|p| p.session().is_some_and(|s| s.unique_key() == session_id));
                match proxy {
                    Some(proxy) => {
                        proxy.on_lost(tick);
                        true
                    }
                    None => false,
                }
            }
            SessionKind::Group => false,
        }
    }

    /// Fan one internal message out to every output and cache it
    fn broadcast(&self, inner: &mut GroupInner, msg: FlvTag) {
        for s in inner.rtmp_subs.values() {
            s.write_message(&msg);
        }
        for s in inner.httpflv_subs.values() {
            s.write_message(&msg);
        }
        for proxy in inner.pushes.values() {
            if let Some(s) = proxy.session() {
                s.write_message(&msg);
            }
        }

        if let Some(remuxer) = inner.ts_remuxer.as_mut() {
            match remuxer.feed(&msg) {
                Ok(Some(out)) => {
                    if let Some(info) = &out.closed_segment {
                        if self.config.hls.enable {
                            self.observer
                                .on_segment_produced(&self.key.app, &self.key.name, info);
                        }
                    }
                    for s in inner.httpts_subs.values() {
                        s.write_ts_frame(&out.frame);
                    }
                    inner.segment_cache.append_frame(out.frame);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    group = %self.unique_key,
                    ts = msg.timestamp,
                    error = %e,
                    "Segment remux failed, frame dropped"
                ),
            }
        }

        if let Some(remuxer) = inner.rtsp_remuxer.as_mut() {
            match remuxer.feed(&msg) {
                Ok(outputs) => {
                    for out in outputs {
                        match out {
                            RtspOutput::SdpReady(sdp) => {
                                for (key, s) in inner.rtsp_waiting.drain() {
                                    tracing::debug!(session = %key, "RTSP consumer promoted");
                                    s.set_sdp(&sdp);
                                    inner.rtsp_subs.insert(key, s);
                                }
                            }
                            RtspOutput::Packet(pkt) => {
                                for s in inner.rtsp_subs.values() {
                                    s.write_packet(&pkt);
                                }
                            }
                        }
                    }
                }
                Err(e) => tracing::warn!(
                    group = %self.unique_key,
                    ts = msg.timestamp,
                    error = %e,
                    "RTSP remux failed, frame dropped"
                ),
            }
        }

        inner.message_cache.append_frame(msg);
    }

    fn dispose_inactive_sessions(&self, inner: &mut GroupInner, tick: u32) {
        // PS producers run on their own timeout
        let ps = match &inner.producer {
            Some(Producer::Ps(s)) => Some(s.clone()),
            _ => None,
        };
        let ps_timeout = self.config.ps_pub.timeout_sec;
        if let Some(ps) = ps.filter(|_| ps_timeout != 0) {
            let due = inner
                .ps_prev_check_tick
                .map_or(true, |prev| tick.saturating_sub(prev) >= ps_timeout);
            if due {
                inner.ps_prev_check_tick = Some(tick);
                let (read_alive, _) = ps.is_alive();
                if !read_alive {
                    tracing::warn!(group = %self.unique_key, session = %ps.unique_key(), "Session timeout");
                    ps.dispose();
                    self.del_in(inner);
                }
            }
        }

        let interval = self.config.check_session_alive_interval_sec;
        if interval == 0 || tick % interval != 0 {
            return;
        }

        let dead_producer = match &inner.producer {
            Some(p @ (Producer::Rtmp(_) | Producer::Rtsp(_) | Producer::RelayPull(_))) => {
                let (read_alive, _) = p.control().is_alive();
                if !read_alive {
                    tracing::warn!(group = %self.unique_key, session = %p.unique_key(), "Session timeout");
                    p.control().dispose();
                }
                !read_alive
            }
            _ => false,
        };
        if dead_producer {
            self.del_in(inner);
        }

        sweep_consumers(&self.unique_key, &mut inner.rtmp_subs);
        sweep_consumers(&self.unique_key, &mut inner.httpflv_subs);
        sweep_consumers(&self.unique_key, &mut inner.httpts_subs);
        sweep_consumers(&self.unique_key, &mut inner.rtsp_subs);
        sweep_consumers(&self.unique_key, &mut inner.rtsp_waiting);

        for proxy in inner.pushes.values_mut() {
            let dead = proxy
                .session()
                .filter(|s| !s.is_alive().1)
                .map(|s| s.unique_key().to_string());
            if let Some(session) = dead {
                tracing::warn!(group = %self.unique_key, session = %session, "Session timeout");
                proxy.on_lost(tick);
            }
        }
    }

    fn update_all_session_stat(&self, inner: &GroupInner, interval_sec: u32) {
        if let Some(producer) = &inner.producer {
            producer.control().update_stat(interval_sec);
        }
        for s in inner.rtmp_subs.values() {
            s.update_stat(interval_sec);
        }
        for s in inner.httpflv_subs.values() {
            s.update_stat(interval_sec);
        }
        for s in inner.httpts_subs.values() {
            s.update_stat(interval_sec);
        }
        for s in inner.rtsp_subs.values().chain(inner.rtsp_waiting.values()) {
            s.update_stat(interval_sec);
        }
        for s in inner.pushes.values().filter_map(|p| p.session()) {
            s.update_stat(interval_sec);
        }
    }

    // ------------------------------------------------------------------
    // Relay pull
    // ------------------------------------------------------------------

    fn tick_pull(&self, inner: &mut GroupInner, tick: u32) {
        let has_local = inner.has_local_producer();
        let has_consumers = inner.has_sub_session();
        match inner.pull.poll(tick, has_local, has_consumers) {
            PullAction::None => {}
            PullAction::Connect { url, generation } => {
                self.spawn_pull(inner, url, generation, tick)
            }
            PullAction::Stop => {
                tracing::info!(group = %self.unique_key, "No consumers left, relay pull stopped");
                if let Some(producer) = inner.producer.as_ref().filter(|p| p.is_relay()) {
                    producer.control().dispose();
                }
                self.del_in(inner);
                inner.pull.machine_mut().stop();
                inner.pending_pull = None;
            }
        }
    }

    fn spawn_pull(&self, inner: &mut GroupInner, url: String, generation: u64, tick: u32) {
        let Some(connector) = self.connector.clone() else {
            self.pull_failed(inner, generation, tick, &RelayError::NotConfigured);
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.pull_failed(inner, generation, tick, &RelayError::NoRuntime);
            return;
        };

        let session_key = gen_unique_key(SessionKind::RtmpPull);
        tracing::info!(group = %self.unique_key, url = %url, session = %session_key, "Relay pull connecting");

        inner.pending_pull = Some(PendingPull {
            session_key: session_key.clone(),
            frames: Vec::new(),
        });
        let ingest = IngestHandle::new(self.weak_self.clone(), &session_key);
        let group = self.weak_self.clone();
        runtime.spawn(async move {
            let result = connector.pull(&url, &session_key, ingest).await;
            match group.upgrade() {
                Some(group) => group.on_pull_result(generation, &url, &session_key, result),
                None => {
                    if let Ok(session) = result {
                        session.dispose();
                    }
                }
            }
        });
    }

    fn on_pull_result(
        &self,
        generation: u64,
        url: &str,
        session_key: &str,
        result: Result<Arc<dyn SessionControl>, RelayError>,
    ) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let tick = inner.last_tick;
        let pending = inner.take_pending_pull(session_key);

        let session = match result {
            Ok(session) => session,
            Err(e) => {
                self.pull_failed(inner, generation, tick, &e);
                return;
            }
        };

        if inner.disposed || !inner.pull.machine_mut().on_connected(generation) {
            tracing::debug!(group = %self.unique_key, session = %session_key, "Stale relay pull discarded");
            session.dispose();
            return;
        }
        if session.unique_key() != session_key {
            tracing::warn!(
                group = %self.unique_key,
                expected = %session_key,
                actual = %session.unique_key(),
                "Relay pull session key mismatch"
            );
            session.dispose();
            inner.pull.machine_mut().on_lost(tick);
            return;
        }
        if inner.producer.is_some() {
            tracing::info!(group = %self.unique_key, session = %session_key, "Producer slot taken, relay pull discarded");
            session.dispose();
            inner.pull.machine_mut().stop();
            return;
        }

        self.add_in(inner, Producer::RelayPull(session));
        self.observer
            .on_relay_pull_start(&self.key.app, &self.key.name, url);
        if !pending.is_empty() {
            tracing::debug!(group = %self.unique_key, frames = pending.len(), "Relay pull early frames flushed");
        }
        for msg in pending {
            self.broadcast(inner, msg);
        }
    }

    fn pull_failed(&self, inner: &mut GroupInner, generation: u64, tick: u32, err: &RelayError) {
        if !inner.pull.machine_mut().on_failed(generation, tick) {
            return;
        }
        let state = inner.pull.state();
        tracing::warn!(group = %self.unique_key, error = %err, state = ?state, "Relay pull failed");
        if state == RelayState::Failed {
            if let Some(url) = inner.pull.url() {
                self.observer
                    .on_relay_pull_stop(&self.key.app, &self.key.name, url);
            }
        }
    }

    // ------------------------------------------------------------------
    // Relay push
    // ------------------------------------------------------------------

    fn start_push_if_needed(&self, inner: &mut GroupInner, tick: u32) {
        if inner.pushes.is_empty() {
            return;
        }
        if !inner.has_local_producer() {
            self.stop_pushes(inner);
            return;
        }

        let mut attempts = Vec::new();
        for (url, proxy) in inner.pushes.iter_mut() {
            if proxy.machine_mut().should_connect(tick) {
                attempts.push((url.clone(), proxy.machine_mut().begin_connect()));
            }
        }
        for (url, generation) in attempts {
            self.spawn_push(inner, url, generation, tick);
        }
    }

    fn stop_pushes(&self, inner: &mut GroupInner) {
        for (url, proxy) in inner.pushes.iter_mut() {
            if proxy.stop() {
                tracing::info!(group = %self.unique_key, url = %url, "Relay push stopped");
                self.observer
                    .on_relay_push_stop(&self.key.app, &self.key.name, url);
            }
        }
    }

    fn spawn_push(&self, inner: &mut GroupInner, url: String, generation: u64, tick: u32) {
        let Some(connector) = self.connector.clone() else {
            self.push_failed(inner, &url, generation, tick, &RelayError::NotConfigured);
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.push_failed(inner, &url, generation, tick, &RelayError::NoRuntime);
            return;
        };

        let session_key = gen_unique_key(SessionKind::RtmpPush);
        tracing::info!(group = %self.unique_key, url = %url, session = %session_key, "Relay push connecting");

        let group = self.weak_self.clone();
        runtime.spawn(async move {
            let result = connector.push(&url, &session_key).await;
            match group.upgrade() {
                Some(group) => group.on_push_result(&url, generation, result),
                None => {
                    if let Ok(session) = result {
                        session.dispose();
                    }
                }
            }
        });
    }

    fn on_push_result(
        &self,
        url: &str,
        generation: u64,
        result: Result<Arc<dyn MessageSink>, RelayError>,
    ) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let tick = inner.last_tick;

        let sink = match result {
            Ok(sink) => sink,
            Err(e) => {
                self.push_failed(inner, url, generation, tick, &e);
                return;
            }
        };

        if inner.disposed || !inner.has_local_producer() {
            tracing::debug!(group = %self.unique_key, url = %url, "No local producer, relay push discarded");
            sink.dispose();
            return;
        }
        let Some(proxy) = inner.pushes.get_mut(url) else {
            sink.dispose();
            return;
        };
        if !proxy.on_connected(generation, sink.clone()) {
            tracing::debug!(group = %self.unique_key, url = %url, "Stale relay push discarded");
            sink.dispose();
            return;
        }

        tracing::info!(group = %self.unique_key, url = %url, session = %sink.unique_key(), "Relay push started");
        replay_messages(&inner.message_cache, sink.as_ref());
    }

    fn push_failed(
        &self,
        inner: &mut GroupInner,
        url: &str,
        generation: u64,
        tick: u32,
        err: &RelayError,
    ) {
        let Some(proxy) = inner.pushes.get_mut(url) else {
            return;
        };
        if !proxy.machine_mut().on_failed(generation, tick) {
            return;
        }
        let state = proxy.state();
        tracing::warn!(group = %self.unique_key, url = %url, error = %err, state = ?state, "Relay push failed");
        if state == RelayState::Failed {
            self.observer
                .on_relay_push_stop(&self.key.app, &self.key.name, url);
        }
    }
}

impl std::fmt::Debug for StreamGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamGroup")
            .field("unique_key", &self.unique_key)
            .field("stream", &self.key)
            .finish()
    }
}

fn replay_messages(cache: &GopCache<FlvTag>, sink: &dyn MessageSink) {
    for tag in cache.replayable() {
        sink.write_message(&tag);
    }
}

fn remove_consumer<S: SessionControl + ?Sized>(set: &mut SessionSet<S>, session_id: &str) -> bool {
    match set.remove(session_id) {
        Some(session) => {
            session.dispose();
            true
        }
        None => false,
    }
}

fn dispose_all<S: SessionControl + ?Sized>(set: &mut SessionSet<S>) {
    for (_, session) in set.drain() {
        session.dispose();
    }
}

/// Dispose and drop consumers whose write side has not advanced since the last sweep
fn sweep_consumers<S: SessionControl + ?Sized>(group: &str, set: &mut SessionSet<S>) {
    set.retain(|key, session| {
        let (_, write_alive) = session.is_alive();
        if !write_alive {
            tracing::warn!(group = %group, session = %key, "Session timeout");
            session.dispose();
        }
        write_alive
    });
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use bytes::{Bytes, BytesMut};

    use super::*;
    use crate::hub::NoopObserver;
    use crate::media::h264;
    use crate::session::{ChannelSink, SessionStat, TrafficCounter};

    struct StubProducer {
        key: String,
        kind: SessionKind,
        traffic: TrafficCounter,
        disposed: AtomicBool,
    }

    impl StubProducer {
        fn new(kind: SessionKind) -> Arc<Self> {
            Arc::new(Self {
                key: gen_unique_key(kind),
                kind,
                traffic: TrafficCounter::new(),
                disposed: AtomicBool::new(false),
            })
        }
    }

    impl SessionControl for StubProducer {
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
            SessionStat::new(&self.key, self.kind)
        }
        fn dispose(&self) {
            self.disposed.store(true, Ordering::SeqCst);
        }
    }

    fn group(config: HubConfig) -> Arc<StreamGroup> {
        StreamGroup::new(
            StreamKey::new("live", "test"),
            Arc::new(config),
            Arc::new(NoopObserver),
            None,
        )
    }

    fn keyframe(ts: u32) -> FlvTag {
        let mut body = BytesMut::new();
        h264::put_avcc(&mut body, &[0x65, 0x88]);
        FlvTag::video_nalus(VideoCodec::Avc, ts, true, 0, &body)
    }

    #[test]
    fn test_producer_conflict() {
        let group = group(HubConfig::default());
        let p1 = StubProducer::new(SessionKind::RtmpPub);
        let p2 = StubProducer::new(SessionKind::RtspPub);

        group.attach_producer(Producer::Rtmp(p1.clone())).unwrap();
        let err = group.attach_producer(Producer::Rtsp(p2.clone())).unwrap_err();
        assert!(matches!(err, HubError::ProducerAlreadyPresent { .. }));
        assert_eq!(group.producer_key().as_deref(), Some(p1.unique_key()));

        assert!(group.kick_session(&p1.key).unwrap());
        assert!(p1.disposed.load(Ordering::SeqCst));
        group.attach_producer(Producer::Rtsp(p2)).unwrap();
    }

    #[test]
    fn test_kick_invalid_id() {
        let group = group(HubConfig::default());
        assert_eq!(
            group.kick_session("BOGUS1"),
            Err(HubError::InvalidSessionId("BOGUS1".into()))
        );
        assert_eq!(group.kick_session("RTMPSUB999999"), Ok(false));
    }

    #[test]
    fn test_stale_handle_ignored() {
        let group = group(HubConfig::default());
        let p1 = StubProducer::new(SessionKind::RtmpPub);
        let handle = group.attach_producer(Producer::Rtmp(p1.clone())).unwrap();
        assert!(handle.is_attached());
        assert!(handle.feed_message(keyframe(0)));

        group.detach_session(&p1.key);
        assert!(!handle.is_attached());
        assert!(!handle.feed_message(keyframe(40)));
    }

    #[test]
    fn test_packets_rejected_from_message_producer() {
        let group = group(HubConfig::default());
        let p = StubProducer::new(SessionKind::RtmpPub);
        let handle = group.attach_producer(Producer::Rtmp(p)).unwrap();
        let pkt = AvPacket::new(crate::media::PayloadType::Aac, 0, Bytes::from_static(&[0x21]));
        assert!(!handle.feed_packet(&pkt));
    }

    #[test]
    fn test_ps_timeout_on_own_schedule() {
        let config = HubConfig::default()
            .ps_pub_timeout(3)
            .check_session_alive_interval(0);
        let group = group(config);
        let ps = StubProducer::new(SessionKind::PsPub);
        group.attach_producer(Producer::Ps(ps.clone())).unwrap();

        // First check happens immediately and sees the initial read
        ps.traffic.add_read(10);
        group.tick(1);
        assert!(group.has_in_session());

        // Not due yet at tick 3
        group.tick(3);
        assert!(group.has_in_session());

        group.tick(4);
        assert!(!group.has_in_session());
        assert!(ps.disposed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_waiting_rtsp_promoted_on_sdp() {
        let group = group(HubConfig::default());
        let (rtsp, mut rx) = ChannelSink::<crate::session::RtspEvent>::new(SessionKind::RtspSub, 16);
        group.attach_consumer(Consumer::Rtsp(rtsp)).unwrap();
        assert_eq!(group.out_session_num(), 1);

        let p = StubProducer::new(SessionKind::RtmpPub);
        let handle = group.attach_producer(Producer::Rtmp(p)).unwrap();
        let config = crate::media::AvcConfig::from_parameter_sets(
            Bytes::from_static(&[0x67, 0x64, 0x00, 0x1F, 0xAC]),
            Bytes::from_static(&[0x68, 0xEF, 0x38]),
        )
        .unwrap();
        handle.feed_message(FlvTag::video_sequence_header(VideoCodec::Avc, 0, &config.raw));
        handle.feed_message(keyframe(0));

        assert!(matches!(rx.try_recv(), Ok(crate::session::RtspEvent::Sdp(_))));
        assert!(matches!(rx.try_recv(), Ok(crate::session::RtspEvent::Packet(_))));
        assert_eq!(group.out_session_num(), 1);
    }

    #[test]
    fn test_rtsp_consumer_waits_again_after_producer_leaves() {
        use crate::session::RtspEvent;

        let group = group(HubConfig::default());
        let (rtsp, mut rx) = ChannelSink::<RtspEvent>::new(SessionKind::RtspSub, 16);
        group.attach_consumer(Consumer::Rtsp(rtsp.clone())).unwrap();
        let config = crate::media::AvcConfig::from_parameter_sets(
            Bytes::from_static(&[0x67, 0x64, 0x00, 0x1F, 0xAC]),
            Bytes::from_static(&[0x68, 0xEF, 0x38]),
        )
        .unwrap();

        let first = StubProducer::new(SessionKind::RtmpPub);
        let handle = group.attach_producer(Producer::Rtmp(first.clone())).unwrap();
        handle.feed_message(FlvTag::video_sequence_header(VideoCodec::Avc, 0, &config.raw));
        handle.feed_message(keyframe(0));
        assert!(matches!(rx.try_recv(), Ok(RtspEvent::Sdp(_))));
        assert!(matches!(rx.try_recv(), Ok(RtspEvent::Packet(_))));

        assert!(group.detach_session(&first.key));
        assert_eq!(group.out_session_num(), 1);
        assert!(group.inner.lock().rtsp_waiting.contains_key(rtsp.unique_key()));

        // Nothing reaches the consumer until the new SDP
        let second = StubProducer::new(SessionKind::RtmpPub);
        let handle = group.attach_producer(Producer::Rtmp(second)).unwrap();
        handle.feed_message(keyframe(40));
        assert!(rx.try_recv().is_err());

        handle.feed_message(FlvTag::video_sequence_header(VideoCodec::Avc, 80, &config.raw));
        handle.feed_message(keyframe(80));
        assert!(matches!(rx.try_recv(), Ok(RtspEvent::Sdp(_))));
        assert!(matches!(rx.try_recv(), Ok(RtspEvent::Packet(_))));
        assert!(group.inner.lock().rtsp_subs.contains_key(rtsp.unique_key()));
    }

    #[test]
    fn test_stat_caps_each_family() {
        let group = group(HubConfig::default());
        let mut keep = Vec::new();
        for _ in 0..3 {
            let (s, rx) = ChannelSink::<FlvTag>::new(SessionKind::RtmpSub, 4);
            group.attach_consumer(Consumer::Rtmp(s)).unwrap();
            keep.push(rx);
            let (s, rx) = ChannelSink::<FlvTag>::new(SessionKind::FlvSub, 4);
            group.attach_consumer(Consumer::HttpFlv(s)).unwrap();
            keep.push(rx);
        }

        let stat = group.get_stat(2);
        assert_eq!(stat.stat_subs.len(), 4);
        assert_eq!(stat.app_name, "live");
        assert!(group.stringify_debug_stats(1).contains("\"stream_name\":\"test\""));
    }

    #[test]
    fn test_dispose_twice() {
        let group = group(HubConfig::default());
        let p = StubProducer::new(SessionKind::RtmpPub);
        group.attach_producer(Producer::Rtmp(p.clone())).unwrap();
        let (s, _rx) = ChannelSink::<FlvTag>::new(SessionKind::RtmpSub, 4);
        group.attach_consumer(Consumer::Rtmp(s.clone())).unwrap();

        group.dispose();
        group.dispose();
        assert!(group.is_disposed());
        assert!(group.is_total_empty());
        assert!(p.disposed.load(Ordering::SeqCst));
        assert!(s.is_disposed());

        let (late, _rx) = ChannelSink::<FlvTag>::new(SessionKind::RtmpSub, 4);
        assert!(matches!(
            group.attach_consumer(Consumer::Rtmp(late)),
            Err(HubError::Disposed(_))
        ));
    }
}
