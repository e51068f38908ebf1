//! Canonical packet to internal message
//!
//! Packet-oriented producers (RTSP, GB28181 PS, programmatic) hand over raw
//! access units. This remuxer pulls parameter sets out of the video stream,
//! emits a sequence header whenever they change, and turns every remaining
//! access unit into an [`FlvTag`] on a millisecond clock shared by both
//! media types.

use bytes::{Bytes, BytesMut};

use crate::config::SyntheticPacing;
use crate::error::{MediaError, Result};
use crate::media::aac::AudioSpecificConfig;
use crate::media::h264::{self, NaluType};
use crate::media::{hevc, AvPacket, AvcConfig, FlvTag, HevcConfig, PayloadType, VideoCodec};

/// How output timestamps are derived
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampPolicy {
    /// Use packet timestamps, expressed in `time_base` ticks per second
    Native { time_base: u32 },
    /// Ignore packet timestamps and advance by a constant per-frame step
    Synthetic(SyntheticPacing),
}

impl Default for TimestampPolicy {
    fn default() -> Self {
        TimestampPolicy::Native { time_base: 1000 }
    }
}

/// Rebases to the first packet of either media type and keeps each media
/// type non-decreasing.
#[derive(Debug, Default)]
struct MediaClock {
    base: Option<i64>,
    last_video: u32,
    last_audio: u32,
}

impl MediaClock {
    fn rebase(&mut self, raw: i64, time_base: u32) -> i64 {
        let base = *self.base.get_or_insert(raw);
        let delta = raw.saturating_sub(base).max(0) as i128;
        (delta * 1000 / time_base.max(1) as i128) as i64
    }

    fn clamp(&mut self, ms: i64, video: bool) -> u32 {
        let ms = ms.clamp(0, u32::MAX as i64) as u32;
        let last = if video {
            &mut self.last_video
        } else {
            &mut self.last_audio
        };
        if ms < *last {
            tracing::debug!(ms, last = *last, video, "Timestamp went backwards, clamped");
        }
        *last = (*last).max(ms);
        *last
    }
}

#[derive(Debug, Default, Clone)]
struct ParameterSets {
    vps: Option<Bytes>,
    sps: Option<Bytes>,
    pps: Option<Bytes>,
}

impl ParameterSets {
    fn is_empty(&self) -> bool {
        self.vps.is_none() && self.sps.is_none() && self.pps.is_none()
    }

    /// `self` with every set present in `newer` replaced
    fn merged(&self, newer: ParameterSets) -> ParameterSets {
        ParameterSets {
            vps: newer.vps.or_else(|| self.vps.clone()),
            sps: newer.sps.or_else(|| self.sps.clone()),
            pps: newer.pps.or_else(|| self.pps.clone()),
        }
    }
}

/// Canonical packets in, internal messages out
#[derive(Debug, Default)]
pub struct AvPacketToFlvRemuxer {
    policy: TimestampPolicy,
    clock: MediaClock,
    video_codec: Option<PayloadType>,
    params: ParameterSets,
    /// Configuration record of the last emitted video sequence header
    video_record: Option<Bytes>,
    audio_config: Option<AudioSpecificConfig>,
    video_frames: u64,
    audio_frames: u64,
}

impl AvPacketToFlvRemuxer {
    pub fn new(policy: TimestampPolicy) -> Self {
        Self {
            policy,
            ..Default::default()
        }
    }

    pub fn policy(&self) -> TimestampPolicy {
        self.policy
    }

    pub fn has_audio_config(&self) -> bool {
        self.audio_config.is_some()
    }

    pub fn has_video_header(&self) -> bool {
        self.video_record.is_some()
    }

    /// Set the out-of-band AudioSpecificConfig
    ///
    /// Returns the AAC sequence header to broadcast, or `None` when the config
    /// is unchanged.
    pub fn feed_audio_config(&mut self, asc: &[u8]) -> Result<Option<FlvTag>> {
        if self
            .audio_config
            .as_ref()
            .is_some_and(|c| c.raw.as_ref() == asc)
        {
            return Ok(None);
        }
        let config = AudioSpecificConfig::parse(Bytes::copy_from_slice(asc))?;
        tracing::debug!(
            profile = config.profile().map_or("unknown", |p| p.name()),
            sample_rate = config.sampling_frequency,
            channels = config.channels(),
            "Audio config set"
        );
        let tag = FlvTag::aac_sequence_header(self.clock.last_audio, asc);
        self.audio_config = Some(config);
        Ok(Some(tag))
    }

    /// Convert one access unit
    ///
    /// Video may yield a sequence header followed by the frame. Video that
    /// arrives before any complete set of parameter sets yields nothing.
    pub fn feed_packet(&mut self, pkt: &AvPacket) -> Result<Vec<FlvTag>> {
        if pkt.payload.is_empty() {
            return Err(MediaError::EmptyPayload.into());
        }
        match pkt.payload_type {
            PayloadType::Aac => self.feed_audio(pkt).map(|tag| vec![tag]),
            PayloadType::Avc | PayloadType::Hevc => self.feed_video(pkt),
        }
    }

    fn feed_audio(&mut self, pkt: &AvPacket) -> Result<FlvTag> {
        let Some(config) = &self.audio_config else {
            return Err(MediaError::MissingAudioConfig.into());
        };

        let ms = match self.policy {
            TimestampPolicy::Native { time_base } => self.clock.rebase(pkt.timestamp, time_base),
            TimestampPolicy::Synthetic(pacing) => {
                let samples = if pacing.audio_samples_per_frame > 0 {
                    pacing.audio_samples_per_frame
                } else {
                    config.samples_per_frame()
                };
                let rate = pacing.audio_sample_rate.max(1) as i64;
                let ms = self.audio_frames as i64 * samples as i64 * 1000 / rate;
                self.audio_frames += 1;
                ms
            }
        };
        let ts = self.clock.clamp(ms, false);
        Ok(FlvTag::aac_raw(ts, &pkt.payload))
    }

    fn feed_video(&mut self, pkt: &AvPacket) -> Result<Vec<FlvTag>> {
        if self.video_codec != Some(pkt.payload_type) {
            if self.video_codec.is_some() {
                tracing::info!(codec = pkt.payload_type.name(), "Video codec changed");
            }
            self.video_codec = Some(pkt.payload_type);
            self.params = ParameterSets::default();
            self.video_record = None;
        }

        let is_hevc = pkt.payload_type == PayloadType::Hevc;
        let nalus = h264::split_avcc(&pkt.payload, 4)?;

        // Parameter sets are only committed once they form a valid record
        let mut incoming = ParameterSets::default();
        let mut keyframe = false;
        let mut body = BytesMut::with_capacity(pkt.payload.len());
        for nalu in nalus {
            if is_hevc {
                let t = hevc::nalu_type(nalu[0]);
                match t {
                    hevc::NALU_TYPE_VPS => incoming.vps = Some(nalu),
                    hevc::NALU_TYPE_SPS => incoming.sps = Some(nalu),
                    hevc::NALU_TYPE_PPS => incoming.pps = Some(nalu),
                    hevc::NALU_TYPE_AUD => {}
                    _ => {
                        keyframe |= hevc::is_keyframe(t);
                        h264::put_avcc(&mut body, &nalu);
                    }
                }
            } else {
                match NaluType::from_byte(nalu[0]) {
                    Some(NaluType::Sps) => incoming.sps = Some(nalu),
                    Some(NaluType::Pps) => incoming.pps = Some(nalu),
                    Some(NaluType::Aud) => {}
                    t => {
                        keyframe |= t.is_some_and(|t| t.is_keyframe());
                        h264::put_avcc(&mut body, &nalu);
                    }
                }
            }
        }

        let mut out = Vec::with_capacity(2);

        let (ms, cts) = match self.policy {
            TimestampPolicy::Native { time_base } => {
                let dts = self.clock.rebase(pkt.timestamp, time_base);
                let offset = pkt.presentation_timestamp().saturating_sub(pkt.timestamp) as i128;
                let cts = offset * 1000 / time_base.max(1) as i128;
                (dts, cts.clamp(-(1 << 23), (1 << 23) - 1) as i32)
            }
            TimestampPolicy::Synthetic(pacing) => {
                let ms = self.video_frames as i64 * 1000 / pacing.video_fps.max(1) as i64;
                (ms, 0)
            }
        };
        let ts = self.clock.clamp(ms, true);

        if !incoming.is_empty() {
            let params = self.params.merged(incoming);
            // A malformed set drops this access unit; the last good ones stay
            if let Some(header) = self.build_sequence_header(&params, is_hevc, ts)? {
                out.push(header);
            }
            self.params = params;
        }

        if body.is_empty() {
            return Ok(out);
        }
        if self.video_record.is_none() {
            tracing::debug!(ts, "Video before parameter sets, dropped");
            return Ok(out);
        }

        let codec = if is_hevc {
            VideoCodec::Hevc
        } else {
            VideoCodec::Avc
        };
        if matches!(self.policy, TimestampPolicy::Synthetic(_)) {
            self.video_frames += 1;
        }
        out.push(FlvTag::video_nalus(codec, ts, keyframe, cts, &body));
        Ok(out)
    }

    /// Emit a sequence header when the parameter sets are complete and differ
    /// from the last emitted ones
    fn build_sequence_header(
        &mut self,
        params: &ParameterSets,
        is_hevc: bool,
        ts: u32,
    ) -> Result<Option<FlvTag>> {
        let record = if is_hevc {
            let (Some(vps), Some(sps), Some(pps)) = (&params.vps, &params.sps, &params.pps) else {
                return Ok(None);
            };
            HevcConfig::from_parameter_sets(vps.clone(), sps.clone(), pps.clone())?.raw
        } else {
            let (Some(sps), Some(pps)) = (&params.sps, &params.pps) else {
                return Ok(None);
            };
            AvcConfig::from_parameter_sets(sps.clone(), pps.clone())?.raw
        };

        if self.video_record.as_ref() == Some(&record) {
            return Ok(None);
        }

        let codec = if is_hevc {
            VideoCodec::Hevc
        } else {
            VideoCodec::Avc
        };
        let tag = FlvTag::video_sequence_header(codec, ts, &record);
        self.video_record = Some(record);
        Ok(Some(tag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: &[u8] = &[0x67, 0x64, 0x00, 0x1F, 0xAC];
    const PPS: &[u8] = &[0x68, 0xEF, 0x38];
    const IDR: &[u8] = &[0x65, 0x88, 0x84];
    const SLICE: &[u8] = &[0x41, 0x9A, 0x02];

    fn avcc(nalus: &[&[u8]]) -> Bytes {
        let mut out = BytesMut::new();
        for n in nalus {
            h264::put_avcc(&mut out, n);
        }
        out.freeze()
    }

    #[test]
    fn test_keyframe_with_parameter_sets() {
        let mut remuxer = AvPacketToFlvRemuxer::default();
        let pkt = AvPacket::new(PayloadType::Avc, 0, avcc(&[SPS, PPS, IDR]));

        let tags = remuxer.feed_packet(&pkt).unwrap();
        assert_eq!(tags.len(), 2);
        assert!(tags[0].is_avc_sequence_header());
        assert!(tags[1].is_key_nalu());
        assert_eq!(tags[1].video_body().unwrap(), avcc(&[IDR]));

        // Same parameter sets again: no new header
        let pkt = AvPacket::new(PayloadType::Avc, 40, avcc(&[SPS, PPS, IDR]));
        let tags = remuxer.feed_packet(&pkt).unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].timestamp, 40);
    }

    #[test]
    fn test_bad_parameter_set_keeps_last_good_header() {
        let mut remuxer = AvPacketToFlvRemuxer::default();
        remuxer
            .feed_packet(&AvPacket::new(PayloadType::Avc, 0, avcc(&[SPS, PPS, IDR])))
            .unwrap();

        let bad_sps: &[u8] = &[0x67, 0x64];
        let pkt = AvPacket::new(PayloadType::Avc, 40, avcc(&[bad_sps, PPS, IDR]));
        assert!(remuxer.feed_packet(&pkt).is_err());

        for ts in [80, 120, 160] {
            let tags = remuxer
                .feed_packet(&AvPacket::new(PayloadType::Avc, ts, avcc(&[SLICE])))
                .unwrap();
            assert_eq!(tags.len(), 1);
            assert_eq!(tags[0].timestamp, ts as u32);
        }

        // A valid change afterwards still produces a new header
        let sps2: &[u8] = &[0x67, 0x4D, 0x00, 0x28, 0xAC];
        let tags = remuxer
            .feed_packet(&AvPacket::new(PayloadType::Avc, 200, avcc(&[sps2, PPS, IDR])))
            .unwrap();
        assert_eq!(tags.len(), 2);
        assert!(tags[0].is_avc_sequence_header());
    }

    #[test]
    fn test_video_before_parameter_sets_dropped() {
        let mut remuxer = AvPacketToFlvRemuxer::default();
        let pkt = AvPacket::new(PayloadType::Avc, 0, avcc(&[SLICE]));
        assert!(remuxer.feed_packet(&pkt).unwrap().is_empty());
        assert!(!remuxer.has_video_header());
    }

    #[test]
    fn test_audio_requires_config() {
        let mut remuxer = AvPacketToFlvRemuxer::default();
        let pkt = AvPacket::new(PayloadType::Aac, 0, Bytes::from_static(&[0x21, 0x00]));
        let err = remuxer.feed_packet(&pkt).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Media(MediaError::MissingAudioConfig)
        ));

        let header = remuxer.feed_audio_config(&[0x12, 0x10]).unwrap().unwrap();
        assert!(header.is_aac_sequence_header());
        assert!(remuxer.feed_audio_config(&[0x12, 0x10]).unwrap().is_none());

        let tags = remuxer.feed_packet(&pkt).unwrap();
        assert_eq!(tags[0].aac_body().unwrap().as_ref(), &[0x21, 0x00]);
    }

    #[test]
    fn test_invalid_audio_config_rejected() {
        let mut remuxer = AvPacketToFlvRemuxer::default();
        assert!(remuxer.feed_audio_config(&[0x12]).is_err());
        assert!(!remuxer.has_audio_config());
    }

    #[test]
    fn test_empty_payload_rejected() {
        let mut remuxer = AvPacketToFlvRemuxer::default();
        let pkt = AvPacket::new(PayloadType::Avc, 0, Bytes::new());
        assert!(remuxer.feed_packet(&pkt).is_err());
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let mut remuxer = AvPacketToFlvRemuxer::default();
        let pkt = AvPacket::new(
            PayloadType::Avc,
            0,
            Bytes::from_static(&[0x00, 0x00, 0x00, 0x09, 0x65]),
        );
        assert!(remuxer.feed_packet(&pkt).is_err());
    }

    #[test]
    fn test_native_time_base_and_rebase() {
        let mut remuxer = AvPacketToFlvRemuxer::new(TimestampPolicy::Native { time_base: 90000 });
        let first = AvPacket::new(PayloadType::Avc, 900_000, avcc(&[SPS, PPS, IDR]));
        let tags = remuxer.feed_packet(&first).unwrap();
        assert_eq!(tags[1].timestamp, 0);

        let next = AvPacket::new(PayloadType::Avc, 903_600, avcc(&[SLICE])).with_pts(907_200);
        let tags = remuxer.feed_packet(&next).unwrap();
        assert_eq!(tags[0].timestamp, 40);
        assert_eq!(tags[0].composition_time(), 40);
    }

    #[test]
    fn test_backwards_timestamp_clamped() {
        let mut remuxer = AvPacketToFlvRemuxer::default();
        remuxer
            .feed_packet(&AvPacket::new(PayloadType::Avc, 100, avcc(&[SPS, PPS, IDR])))
            .unwrap();
        remuxer
            .feed_packet(&AvPacket::new(PayloadType::Avc, 200, avcc(&[SLICE])))
            .unwrap();
        let tags = remuxer
            .feed_packet(&AvPacket::new(PayloadType::Avc, 150, avcc(&[SLICE])))
            .unwrap();
        assert_eq!(tags[0].timestamp, 100);
    }

    #[test]
    fn test_synthetic_pacing() {
        let pacing = SyntheticPacing {
            video_fps: 25,
            audio_sample_rate: 48000,
            audio_samples_per_frame: 1024,
        };
        let mut remuxer = AvPacketToFlvRemuxer::new(TimestampPolicy::Synthetic(pacing));
        remuxer.feed_audio_config(&[0x11, 0x90]).unwrap();

        let mut video_ts = Vec::new();
        for i in 0..3 {
            let nalus: &[&[u8]] = if i == 0 { &[SPS, PPS, IDR] } else { &[SLICE] };
            // Producer timestamps are garbage and must be ignored
            let tags = remuxer
                .feed_packet(&AvPacket::new(PayloadType::Avc, 7, avcc(nalus)))
                .unwrap();
            video_ts.push(tags.last().map(|t| t.timestamp).unwrap());
        }
        assert_eq!(video_ts, vec![0, 40, 80]);

        let mut audio_ts = Vec::new();
        for _ in 0..3 {
            let tags = remuxer
                .feed_packet(&AvPacket::new(
                    PayloadType::Aac,
                    0,
                    Bytes::from_static(&[0x21]),
                ))
                .unwrap();
            audio_ts.push(tags[0].timestamp);
        }
        assert_eq!(audio_ts, vec![0, 21, 42]);
    }

    #[test]
    fn test_hevc_parameter_sets() {
        let vps: &[u8] = &[0x40, 0x01, 0x0C, 0x01];
        let sps: &[u8] = &[
            0x42, 0x01, 0x01, 0x01, 0x60, 0x00, 0x00, 0x03, 0x00, 0x90, 0x00, 0x00, 0x03, 0x00,
            0x00, 0x5D,
        ];
        let pps: &[u8] = &[0x44, 0x01, 0xC1];
        let idr: &[u8] = &[0x26, 0x01, 0xAF];

        let mut remuxer = AvPacketToFlvRemuxer::default();
        let tags = remuxer
            .feed_packet(&AvPacket::new(PayloadType::Hevc, 0, avcc(&[vps, sps, pps, idr])))
            .unwrap();
        assert_eq!(tags.len(), 2);
        assert!(tags[0].is_hevc_sequence_header());
        assert!(tags[1].is_key_nalu());
        assert_eq!(tags[1].video_codec(), Some(VideoCodec::Hevc));
    }
}
