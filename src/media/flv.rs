//! Internal fan-out message
//!
//! Every producer's stream is normalized into FLV-style tags: the payload of an
//! RTMP audio/video/data message without the 11-byte FLV tag header. HTTP-FLV
//! and RTMP consumers take these as-is; the segment and RTSP remuxers start
//! from them.
//!
//! Video tag body:
//! ```text
//! +----------+----------+------------+----------------+
//! | FrameType| CodecID  | PacketType | CompositionTime| NALUs (AVCC) / config record
//! | (4 bits) | (4 bits) | (1 byte)   | (SI24)         |
//! +----------+----------+------------+----------------+
//! ```
//!
//! Audio tag body (AAC only):
//! ```text
//! +-----------+---------+----------+----------+---------+
//! |SoundFormat|SoundRate|SoundSize |SoundType | AACType | AudioSpecificConfig / raw frame
//! +-----------+---------+----------+----------+---------+
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::aac::AacPacketType;
use super::h264::AvcPacketType;

/// AAC, 44 kHz, 16-bit, stereo. Fixed for AAC regardless of the real format.
const AAC_SOUND_BYTE: u8 = 0xAF;

const VIDEO_HEADER_LEN: usize = 5;
const AUDIO_HEADER_LEN: usize = 2;

/// FLV tag type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlvTagType {
    Audio,
    Video,
    Script,
}

/// One internal message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlvTag {
    /// Tag type
    pub tag_type: FlvTagType,
    /// Decode timestamp in milliseconds
    pub timestamp: u32,
    /// Tag body (including codec headers)
    pub data: Bytes,
}

/// Video frame type (upper 4 bits of first byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFrameType {
    /// Keyframe (for AVC, a seekable frame)
    Keyframe = 1,
    /// Inter frame (for AVC, a non-seekable frame)
    InterFrame = 2,
    /// Disposable inter frame (H.263 only)
    DisposableInterFrame = 3,
    /// Generated keyframe (reserved for server use)
    GeneratedKeyframe = 4,
    /// Video info/command frame
    VideoInfoFrame = 5,
}

impl VideoFrameType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match (b >> 4) & 0x0F {
            1 => Some(VideoFrameType::Keyframe),
            2 => Some(VideoFrameType::InterFrame),
            3 => Some(VideoFrameType::DisposableInterFrame),
            4 => Some(VideoFrameType::GeneratedKeyframe),
            5 => Some(VideoFrameType::VideoInfoFrame),
            _ => None,
        }
    }

    pub fn is_keyframe(&self) -> bool {
        matches!(
            self,
            VideoFrameType::Keyframe | VideoFrameType::GeneratedKeyframe
        )
    }
}

/// Video codec ID (lower 4 bits of first byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    /// Sorenson H.263
    SorensonH263 = 2,
    /// Screen video
    ScreenVideo = 3,
    /// VP6
    Vp6 = 4,
    /// VP6 with alpha
    Vp6Alpha = 5,
    /// Screen video v2
    ScreenVideoV2 = 6,
    /// AVC (H.264)
    Avc = 7,
    /// HEVC (H.265), codec id 12 as used by legacy FLV extensions
    Hevc = 12,
    /// AV1
    Av1 = 13,
}

impl VideoCodec {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b & 0x0F {
            2 => Some(VideoCodec::SorensonH263),
            3 => Some(VideoCodec::ScreenVideo),
            4 => Some(VideoCodec::Vp6),
            5 => Some(VideoCodec::Vp6Alpha),
            6 => Some(VideoCodec::ScreenVideoV2),
            7 => Some(VideoCodec::Avc),
            12 => Some(VideoCodec::Hevc),
            13 => Some(VideoCodec::Av1),
            _ => None,
        }
    }

    /// Codecs whose payload is length-prefixed NAL units
    pub fn is_nalu_based(&self) -> bool {
        matches!(self, VideoCodec::Avc | VideoCodec::Hevc)
    }
}

/// Audio format (upper 4 bits of first byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    /// Linear PCM, platform endian
    LinearPcmPlatform = 0,
    /// ADPCM
    Adpcm = 1,
    /// MP3
    Mp3 = 2,
    /// Linear PCM, little endian
    LinearPcmLe = 3,
    /// Nellymoser 16kHz mono
    Nellymoser16kMono = 4,
    /// Nellymoser 8kHz mono
    Nellymoser8kMono = 5,
    /// Nellymoser
    Nellymoser = 6,
    /// G.711 A-law
    G711ALaw = 7,
    /// G.711 mu-law
    G711MuLaw = 8,
    /// AAC
    Aac = 10,
    /// Speex
    Speex = 11,
    /// MP3 8kHz
    Mp38k = 14,
    /// Device-specific sound
    DeviceSpecific = 15,
}

impl AudioFormat {
    pub fn from_byte(b: u8) -> Option<Self> {
        match (b >> 4) & 0x0F {
            0 => Some(AudioFormat::LinearPcmPlatform),
            1 => Some(AudioFormat::Adpcm),
            2 => Some(AudioFormat::Mp3),
            3 => Some(AudioFormat::LinearPcmLe),
            4 => Some(AudioFormat::Nellymoser16kMono),
            5 => Some(AudioFormat::Nellymoser8kMono),
            6 => Some(AudioFormat::Nellymoser),
            7 => Some(AudioFormat::G711ALaw),
            8 => Some(AudioFormat::G711MuLaw),
            10 => Some(AudioFormat::Aac),
            11 => Some(AudioFormat::Speex),
            14 => Some(AudioFormat::Mp38k),
            15 => Some(AudioFormat::DeviceSpecific),
            _ => None,
        }
    }
}

impl FlvTag {
    /// Create a new video tag
    pub fn video(timestamp: u32, data: Bytes) -> Self {
        Self {
            tag_type: FlvTagType::Video,
            timestamp,
            data,
        }
    }

    /// Create a new audio tag
    pub fn audio(timestamp: u32, data: Bytes) -> Self {
        Self {
            tag_type: FlvTagType::Audio,
            timestamp,
            data,
        }
    }

    /// Create a script data (metadata) tag
    pub fn script(timestamp: u32, data: Bytes) -> Self {
        Self {
            tag_type: FlvTagType::Script,
            timestamp,
            data,
        }
    }

    /// Video sequence header carrying a decoder configuration record
    pub fn video_sequence_header(codec: VideoCodec, timestamp: u32, record: &[u8]) -> Self {
        let mut data = BytesMut::with_capacity(VIDEO_HEADER_LEN + record.len());
        data.put_u8(0x10 | codec as u8);
        data.put_u8(0x00);
        data.put_slice(&[0, 0, 0]);
        data.put_slice(record);
        Self::video(timestamp, data.freeze())
    }

    /// Video frame from length-prefixed NAL units
    pub fn video_nalus(
        codec: VideoCodec,
        timestamp: u32,
        keyframe: bool,
        composition_time: i32,
        avcc: &[u8],
    ) -> Self {
        let frame_type = if keyframe { 0x10 } else { 0x20 };
        let cts = composition_time.to_be_bytes();

        let mut data = BytesMut::with_capacity(VIDEO_HEADER_LEN + avcc.len());
        data.put_u8(frame_type | codec as u8);
        data.put_u8(0x01);
        data.put_slice(&cts[1..]);
        data.put_slice(avcc);
        Self::video(timestamp, data.freeze())
    }

    /// AAC sequence header carrying an AudioSpecificConfig
    pub fn aac_sequence_header(timestamp: u32, asc: &[u8]) -> Self {
        let mut data = BytesMut::with_capacity(AUDIO_HEADER_LEN + asc.len());
        data.put_u8(AAC_SOUND_BYTE);
        data.put_u8(0x00);
        data.put_slice(asc);
        Self::audio(timestamp, data.freeze())
    }

    /// Raw AAC frame
    pub fn aac_raw(timestamp: u32, raw: &[u8]) -> Self {
        let mut data = BytesMut::with_capacity(AUDIO_HEADER_LEN + raw.len());
        data.put_u8(AAC_SOUND_BYTE);
        data.put_u8(0x01);
        data.put_slice(raw);
        Self::audio(timestamp, data.freeze())
    }

    /// Check if this is a video tag
    pub fn is_video(&self) -> bool {
        self.tag_type == FlvTagType::Video
    }

    /// Check if this is an audio tag
    pub fn is_audio(&self) -> bool {
        self.tag_type == FlvTagType::Audio
    }

    pub fn is_metadata(&self) -> bool {
        self.tag_type == FlvTagType::Script
    }

    /// For video tags, get the frame type
    pub fn video_frame_type(&self) -> Option<VideoFrameType> {
        if self.is_video() && !self.data.is_empty() {
            VideoFrameType::from_byte(self.data[0])
        } else {
            None
        }
    }

    /// For video tags, get the codec
    pub fn video_codec(&self) -> Option<VideoCodec> {
        if self.is_video() && !self.data.is_empty() {
            VideoCodec::from_byte(self.data[0])
        } else {
            None
        }
    }

    /// For audio tags, get the format
    pub fn audio_format(&self) -> Option<AudioFormat> {
        if self.is_audio() && !self.data.is_empty() {
            AudioFormat::from_byte(self.data[0])
        } else {
            None
        }
    }

    /// Check if the frame type nibble marks a keyframe
    ///
    /// Sequence headers carry the keyframe nibble too; see
    /// [`FlvTag::is_key_nalu`] for decodable keyframes only.
    pub fn is_keyframe(&self) -> bool {
        self.video_frame_type()
            .map(|ft| ft.is_keyframe())
            .unwrap_or(false)
    }

    /// Keyframe carrying picture data (not a sequence header)
    pub fn is_key_nalu(&self) -> bool {
        self.is_keyframe() && !self.is_video_sequence_header()
    }

    /// Check if this is an AVC sequence header
    pub fn is_avc_sequence_header(&self) -> bool {
        self.is_video_sequence_header() && self.video_codec() == Some(VideoCodec::Avc)
    }

    pub fn is_hevc_sequence_header(&self) -> bool {
        self.is_video_sequence_header() && self.video_codec() == Some(VideoCodec::Hevc)
    }

    /// AVC or HEVC decoder configuration record
    pub fn is_video_sequence_header(&self) -> bool {
        if self.is_video() && self.data.len() >= 2 {
            let nalu_based = self
                .video_codec()
                .map(|c| c.is_nalu_based())
                .unwrap_or(false);
            nalu_based
                && AvcPacketType::from_byte(self.data[1]) == Some(AvcPacketType::SequenceHeader)
        } else {
            false
        }
    }

    /// Check if this is an AAC sequence header
    pub fn is_aac_sequence_header(&self) -> bool {
        if self.is_audio() && self.data.len() >= 2 {
            let format = AudioFormat::from_byte(self.data[0]);
            format == Some(AudioFormat::Aac)
                && AacPacketType::from_byte(self.data[1]) == Some(AacPacketType::SequenceHeader)
        } else {
            false
        }
    }

    pub fn is_sequence_header(&self) -> bool {
        self.is_video_sequence_header() || self.is_aac_sequence_header()
    }

    /// Signed 24-bit composition time offset (pts - dts) in milliseconds
    pub fn composition_time(&self) -> i32 {
        if !self.is_video() || self.data.len() < VIDEO_HEADER_LEN {
            return 0;
        }
        let raw = ((self.data[2] as i32) << 16) | ((self.data[3] as i32) << 8) | self.data[4] as i32;
        // sign-extend from 24 bits
        (raw << 8) >> 8
    }

    /// Payload after the codec header: the config record for sequence
    /// headers, length-prefixed NAL units otherwise
    pub fn video_body(&self) -> Option<Bytes> {
        let nalu_based = self
            .video_codec()
            .map(|c| c.is_nalu_based())
            .unwrap_or(false);
        if nalu_based && self.data.len() >= VIDEO_HEADER_LEN {
            Some(self.data.slice(VIDEO_HEADER_LEN..))
        } else {
            None
        }
    }

    /// AudioSpecificConfig or raw AAC frame
    pub fn aac_body(&self) -> Option<Bytes> {
        if self.audio_format() == Some(AudioFormat::Aac) && self.data.len() >= AUDIO_HEADER_LEN {
            Some(self.data.slice(AUDIO_HEADER_LEN..))
        } else {
            None
        }
    }

    /// Get the size of the tag data
    pub fn size(&self) -> usize {
        self.data.len()
    }
}
