//! Internal message to RTSP
//!
//! RTSP consumers need an SDP describing both tracks before the first RTP
//! packet. The SDP is built from the sequence headers once the first media
//! frame arrives; afterwards each media message becomes an [`AvPacket`] with
//! millisecond timestamps for the consumer's RTP packetizer.

use bytes::{Bytes, BytesMut};

use super::VideoParams;
use crate::error::{MediaError, Result};
use crate::media::aac::AudioSpecificConfig;
use crate::media::{h264, AvPacket, FlvTag, PayloadType};

/// Track description for an RTSP session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpInfo {
    pub video_codec: Option<PayloadType>,
    /// VPS (H.265 only), SPS and PPS in that order
    pub video_parameter_sets: Vec<Bytes>,
    /// AudioSpecificConfig
    pub audio_config: Option<Bytes>,
    pub audio_sample_rate: u32,
    pub audio_channels: u8,
}

impl SdpInfo {
    pub fn has_video(&self) -> bool {
        self.video_codec.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.audio_config.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtspOutput {
    /// Emitted once, before the first packet
    SdpReady(SdpInfo),
    Packet(AvPacket),
}

#[derive(Debug, Default)]
pub struct FlvToRtspRemuxer {
    video: Option<VideoParams>,
    audio: Option<AudioSpecificConfig>,
    sdp: Option<SdpInfo>,
}

impl FlvToRtspRemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sdp(&self) -> Option<&SdpInfo> {
        self.sdp.as_ref()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn feed(&mut self, tag: &FlvTag) -> Result<Vec<RtspOutput>> {
        if tag.is_metadata() {
            return Ok(Vec::new());
        }
        if tag.is_video_sequence_header() {
            self.video = Some(VideoParams::from_sequence_header(tag)?);
            self.warn_if_announced("video");
            return Ok(Vec::new());
        }
        if tag.is_aac_sequence_header() {
            let asc = tag.aac_body().ok_or(MediaError::InvalidAacPacket)?;
            self.audio = Some(AudioSpecificConfig::parse(asc)?);
            self.warn_if_announced("audio");
            return Ok(Vec::new());
        }

        let mut out = Vec::with_capacity(2);
        if self.sdp.is_none() {
            if self.video.is_none() && self.audio.is_none() {
                return Ok(out);
            }
            let sdp = self.build_sdp();
            tracing::debug!(
                video = sdp.has_video(),
                audio = sdp.has_audio(),
                "SDP ready"
            );
            self.sdp = Some(sdp.clone());
            out.push(RtspOutput::SdpReady(sdp));
        }

        if let Some(pkt) = self.tag_to_packet(tag)? {
            out.push(RtspOutput::Packet(pkt));
        }
        Ok(out)
    }

    /// Convert a media message using the headers seen so far
    ///
    /// Headers, metadata and tracks without a known config yield `None`.
    pub fn tag_to_packet(&self, tag: &FlvTag) -> Result<Option<AvPacket>> {
        if tag.is_sequence_header() || tag.is_metadata() {
            return Ok(None);
        }

        if tag.is_video() {
            let Some(params) = &self.video else {
                return Ok(None);
            };
            let Some(body) = tag.video_body() else {
                return Ok(None);
            };
            let payload = match params.nalu_length_size() {
                4 => body,
                n => {
                    let mut repacked = BytesMut::with_capacity(body.len() + 8);
                    for nalu in h264::split_avcc(&body, n)? {
                        h264::put_avcc(&mut repacked, &nalu);
                    }
                    repacked.freeze()
                }
            };
            let ts = tag.timestamp as i64;
            let mut pkt = AvPacket::new(params.payload_type(), ts, payload);
            let cts = tag.composition_time();
            if cts != 0 {
                pkt = pkt.with_pts(ts + cts as i64);
            }
            return Ok(Some(pkt));
        }

        if tag.is_audio() && self.audio.is_some() {
            let Some(raw) = tag.aac_body() else {
                return Ok(None);
            };
            return Ok(Some(AvPacket::new(
                PayloadType::Aac,
                tag.timestamp as i64,
                raw,
            )));
        }

        Ok(None)
    }

    fn build_sdp(&self) -> SdpInfo {
        let video_parameter_sets = match &self.video {
            Some(VideoParams::Avc(c)) => c.sps.iter().chain(c.pps.iter()).cloned().collect(),
            Some(VideoParams::Hevc(c)) => c
                .vps
                .iter()
                .chain(c.sps.iter())
                .chain(c.pps.iter())
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        SdpInfo {
            video_codec: self.video.as_ref().map(|v| v.payload_type()),
            video_parameter_sets,
            audio_config: self.audio.as_ref().map(|a| a.raw.clone()),
            audio_sample_rate: self.audio.as_ref().map_or(0, |a| a.sampling_frequency),
            audio_channels: self.audio.as_ref().map_or(0, |a| a.channels()),
        }
    }

    fn warn_if_announced(&self, track: &str) {
        if self.sdp.is_some() {
            tracing::warn!(track, "Sequence header changed after SDP was sent");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{AvcConfig, VideoCodec};

    const SPS: &[u8] = &[0x67, 0x64, 0x00, 0x1F, 0xAC];
    const PPS: &[u8] = &[0x68, 0xEF, 0x38];

    fn video_header() -> FlvTag {
        let config =
            AvcConfig::from_parameter_sets(Bytes::from_static(SPS), Bytes::from_static(PPS))
                .unwrap();
        FlvTag::video_sequence_header(VideoCodec::Avc, 0, &config.raw)
    }

    fn keyframe(ts: u32, cts: i32) -> FlvTag {
        let mut body = BytesMut::new();
        h264::put_avcc(&mut body, &[0x65, 0x88]);
        FlvTag::video_nalus(VideoCodec::Avc, ts, true, cts, &body)
    }

    #[test]
    fn test_sdp_emitted_once_before_first_packet() {
        let mut remuxer = FlvToRtspRemuxer::new();
        assert!(remuxer.feed(&video_header()).unwrap().is_empty());
        assert!(remuxer
            .feed(&FlvTag::aac_sequence_header(0, &[0x12, 0x10]))
            .unwrap()
            .is_empty());
        assert!(remuxer.sdp().is_none());

        let out = remuxer.feed(&keyframe(0, 0)).unwrap();
        assert_eq!(out.len(), 2);
        let RtspOutput::SdpReady(sdp) = &out[0] else {
            panic!("expected SDP first");
        };
        assert_eq!(sdp.video_codec, Some(PayloadType::Avc));
        assert_eq!(sdp.video_parameter_sets.len(), 2);
        assert_eq!(sdp.audio_sample_rate, 44100);
        assert_eq!(sdp.audio_channels, 2);
        assert!(matches!(out[1], RtspOutput::Packet(_)));

        let out = remuxer.feed(&FlvTag::aac_raw(23, &[0x21])).unwrap();
        assert_eq!(out.len(), 1);
        let RtspOutput::Packet(pkt) = &out[0] else {
            panic!("expected packet");
        };
        assert_eq!(pkt.payload_type, PayloadType::Aac);
        assert_eq!(pkt.timestamp, 23);
    }

    #[test]
    fn test_media_without_headers_dropped() {
        let mut remuxer = FlvToRtspRemuxer::new();
        assert!(remuxer.feed(&keyframe(0, 0)).unwrap().is_empty());
        assert!(remuxer.sdp().is_none());
    }

    #[test]
    fn test_packet_carries_pts() {
        let mut remuxer = FlvToRtspRemuxer::new();
        remuxer.feed(&video_header()).unwrap();
        let pkt = remuxer.tag_to_packet(&keyframe(40, 80)).unwrap().unwrap();
        assert_eq!(pkt.timestamp, 40);
        assert_eq!(pkt.presentation_timestamp(), 120);
        assert_eq!(pkt.payload.as_ref(), &[0, 0, 0, 2, 0x65, 0x88]);
    }

    #[test]
    fn test_reset_clears_sdp() {
        let mut remuxer = FlvToRtspRemuxer::new();
        remuxer.feed(&video_header()).unwrap();
        remuxer.feed(&keyframe(0, 0)).unwrap();
        assert!(remuxer.sdp().is_some());

        remuxer.reset();
        assert!(remuxer.sdp().is_none());
    }
}
