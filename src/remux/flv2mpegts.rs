//! Internal message to segment-ready frames
//!
//! Produces elementary-stream frames ready for MPEG-TS packetization:
//! Annex-B video (access unit delimiter first, parameter sets in-band on
//! keyframes) and ADTS audio, with 90 kHz timestamps. The TS packetizer and
//! segment file writer live with the consumer.
//!
//! Fragment boundaries are tracked here: once the open fragment is at least
//! `fragment_duration_ms` long, the next keyframe closes it.

use bytes::{BufMut, Bytes, BytesMut};

use super::VideoParams;
use crate::error::{MediaError, Result};
use crate::media::aac::AudioSpecificConfig;
use crate::media::h264::{self, NaluType, START_CODE};
use crate::media::{hevc, FlvTag, PayloadType};

/// PMT stream types
pub const STREAM_TYPE_H264: u8 = 0x1B;
pub const STREAM_TYPE_H265: u8 = 0x24;
pub const STREAM_TYPE_AAC: u8 = 0x0F;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsMedia {
    Video,
    Audio,
}

/// One elementary-stream frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsFrame {
    pub media: TsMedia,
    /// PMT stream type
    pub stream_type: u8,
    /// Presentation timestamp, 90 kHz
    pub pts: u64,
    /// Decode timestamp, 90 kHz
    pub dts: u64,
    pub keyframe: bool,
    /// Annex-B access unit or ADTS frame
    pub data: Bytes,
}

impl TsFrame {
    pub fn dts_ms(&self) -> u64 {
        self.dts / 90
    }
}

/// A fragment that has just been closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    /// Monotonic fragment number within this producer's lifetime
    pub sequence: u64,
    pub start_dts_ms: u32,
    pub duration_ms: u32,
    pub frame_count: usize,
}

/// Result of feeding one media message
#[derive(Debug, Clone)]
pub struct TsOutput {
    pub frame: TsFrame,
    /// Set on the frame that opens a new fragment
    pub closed_segment: Option<SegmentInfo>,
}

#[derive(Debug)]
struct OpenSegment {
    sequence: u64,
    start_ms: u32,
    frames: usize,
}

#[derive(Debug)]
pub struct FlvToMpegtsRemuxer {
    fragment_duration_ms: u32,
    video: Option<VideoParams>,
    audio: Option<AudioSpecificConfig>,
    segment: Option<OpenSegment>,
    next_sequence: u64,
}

impl FlvToMpegtsRemuxer {
    pub fn new(fragment_duration_ms: u32) -> Self {
        Self {
            fragment_duration_ms,
            video: None,
            audio: None,
            segment: None,
            next_sequence: 0,
        }
    }

    /// Forget codec configuration and fragment state
    pub fn reset(&mut self) {
        self.video = None;
        self.audio = None;
        self.segment = None;
        self.next_sequence = 0;
    }

    /// Convert one internal message
    ///
    /// Headers and metadata update state and yield nothing; so do video
    /// frames that arrive before the video header.
    pub fn feed(&mut self, tag: &FlvTag) -> Result<Option<TsOutput>> {
        if tag.is_metadata() {
            return Ok(None);
        }
        if tag.is_video_sequence_header() {
            self.video = Some(VideoParams::from_sequence_header(tag)?);
            return Ok(None);
        }
        if tag.is_aac_sequence_header() {
            let asc = tag.aac_body().ok_or(MediaError::InvalidAacPacket)?;
            self.audio = Some(AudioSpecificConfig::parse(asc)?);
            return Ok(None);
        }

        let frame = if tag.is_video() {
            match self.video_frame(tag)? {
                Some(frame) => frame,
                None => return Ok(None),
            }
        } else if tag.is_audio() {
            self.audio_frame(tag)?
        } else {
            return Ok(None);
        };

        let closed_segment = self.track_segment(&frame, tag.timestamp);
        Ok(Some(TsOutput {
            frame,
            closed_segment,
        }))
    }

    fn video_frame(&self, tag: &FlvTag) -> Result<Option<TsFrame>> {
        let Some(params) = &self.video else {
            tracing::debug!(ts = tag.timestamp, "Video before header, dropped");
            return Ok(None);
        };
        let body = tag.video_body().ok_or(MediaError::InvalidAvcPacket)?;
        let nalus = h264::split_avcc(&body, params.nalu_length_size())?;
        let keyframe = tag.is_key_nalu();
        let is_hevc = params.payload_type() == PayloadType::Hevc;

        let mut out = BytesMut::with_capacity(body.len() + 64);
        out.put_slice(&START_CODE);
        if is_hevc {
            out.put_slice(&hevc::AUD_NALU);
        } else {
            out.put_slice(&h264::AUD_NALU);
        }
        if keyframe {
            out.put_slice(&params.annexb_parameter_sets());
        }
        for nalu in nalus {
            let skip = if is_hevc {
                let t = hevc::nalu_type(nalu[0]);
                t == hevc::NALU_TYPE_AUD || (keyframe && hevc::is_parameter_set(t))
            } else {
                match NaluType::from_byte(nalu[0]) {
                    Some(NaluType::Aud) => true,
                    Some(t) => keyframe && t.is_parameter_set(),
                    None => false,
                }
            };
            if skip {
                continue;
            }
            out.put_slice(&START_CODE);
            out.put_slice(&nalu);
        }

        let dts = tag.timestamp as u64 * 90;
        let pts = (tag.timestamp as i64 + tag.composition_time() as i64).max(0) as u64 * 90;
        Ok(Some(TsFrame {
            media: TsMedia::Video,
            stream_type: if is_hevc {
                STREAM_TYPE_H265
            } else {
                STREAM_TYPE_H264
            },
            pts,
            dts,
            keyframe,
            data: out.freeze(),
        }))
    }

    fn audio_frame(&self, tag: &FlvTag) -> Result<TsFrame> {
        let Some(config) = &self.audio else {
            return Err(MediaError::MissingAudioConfig.into());
        };
        let raw = tag.aac_body().ok_or(MediaError::InvalidAacPacket)?;
        let ts = tag.timestamp as u64 * 90;
        Ok(TsFrame {
            media: TsMedia::Audio,
            stream_type: STREAM_TYPE_AAC,
            pts: ts,
            dts: ts,
            keyframe: false,
            data: config.to_adts_frame(&raw),
        })
    }

    /// Video streams cut on keyframes; audio-only streams cut on any frame
    fn track_segment(&mut self, frame: &TsFrame, ts: u32) -> Option<SegmentInfo> {
        let boundary = match frame.media {
            TsMedia::Video => frame.keyframe,
            TsMedia::Audio => self.video.is_none(),
        };

        if let Some(seg) = self.segment.as_mut() {
            let elapsed = ts.saturating_sub(seg.start_ms);
            if !boundary || elapsed < self.fragment_duration_ms {
                seg.frames += 1;
                return None;
            }
        } else if !boundary {
            return None;
        }

        let closed = self.segment.take().map(|seg| SegmentInfo {
            sequence: seg.sequence,
            start_dts_ms: seg.start_ms,
            duration_ms: ts.saturating_sub(seg.start_ms),
            frame_count: seg.frames,
        });
        self.segment = Some(OpenSegment {
            sequence: self.next_sequence,
            start_ms: ts,
            frames: 1,
        });
        self.next_sequence += 1;
        closed
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

    fn frame(ts: u32, keyframe: bool) -> FlvTag {
        let nalu: &[u8] = if keyframe { &[0x65, 0x88] } else { &[0x41, 0x9A] };
        let mut body = BytesMut::new();
        h264::put_avcc(&mut body, nalu);
        FlvTag::video_nalus(VideoCodec::Avc, ts, keyframe, 0, &body)
    }

    #[test]
    fn test_keyframe_carries_aud_and_parameter_sets() {
        let mut remuxer = FlvToMpegtsRemuxer::new(3000);
        assert!(remuxer.feed(&video_header()).unwrap().is_none());

        let out = remuxer.feed(&frame(40, true)).unwrap().unwrap();
        let data = out.frame.data;
        assert_eq!(&data[..6], &[0, 0, 0, 1, 0x09, 0xF0]);
        assert_eq!(&data[6..10], &START_CODE);
        assert_eq!(&data[10..10 + SPS.len()], SPS);
        assert!(data.ends_with(&[0, 0, 0, 1, 0x65, 0x88]));
        assert_eq!(out.frame.dts, 40 * 90);
        assert_eq!(out.frame.stream_type, STREAM_TYPE_H264);
        assert!(out.frame.keyframe);

        let out = remuxer.feed(&frame(80, false)).unwrap().unwrap();
        assert_eq!(out.frame.data.len(), 6 + 6);
    }

    #[test]
    fn test_video_before_header_dropped() {
        let mut remuxer = FlvToMpegtsRemuxer::new(3000);
        assert!(remuxer.feed(&frame(0, true)).unwrap().is_none());
    }

    #[test]
    fn test_audio_to_adts() {
        let mut remuxer = FlvToMpegtsRemuxer::new(3000);
        assert!(remuxer.feed(&FlvTag::aac_raw(0, &[0x21])).is_err());

        remuxer
            .feed(&FlvTag::aac_sequence_header(0, &[0x12, 0x10]))
            .unwrap();
        let out = remuxer.feed(&FlvTag::aac_raw(23, &[0x21])).unwrap().unwrap();
        assert_eq!(out.frame.media, TsMedia::Audio);
        assert_eq!(out.frame.data.len(), 8);
        assert_eq!(out.frame.data[0], 0xFF);
        assert_eq!(out.frame.pts, 23 * 90);
    }

    #[test]
    fn test_fragment_closes_on_keyframe_after_duration() {
        let mut remuxer = FlvToMpegtsRemuxer::new(1000);
        remuxer.feed(&video_header()).unwrap();

        let mut closed = Vec::new();
        for i in 0..75u32 {
            let ts = i * 40;
            let keyframe = i % 25 == 0;
            if let Some(out) = remuxer.feed(&frame(ts, keyframe)).unwrap() {
                closed.extend(out.closed_segment);
            }
        }

        assert_eq!(closed.len(), 2);
        assert_eq!(closed[0].sequence, 0);
        assert_eq!(closed[0].start_dts_ms, 0);
        assert_eq!(closed[0].duration_ms, 1000);
        assert_eq!(closed[0].frame_count, 25);
        assert_eq!(closed[1].sequence, 1);
        assert_eq!(closed[1].start_dts_ms, 1000);
    }

    #[test]
    fn test_reset_forgets_config() {
        let mut remuxer = FlvToMpegtsRemuxer::new(1000);
        remuxer.feed(&video_header()).unwrap();
        remuxer.reset();
        assert!(remuxer.feed(&frame(0, true)).unwrap().is_none());
    }
}
