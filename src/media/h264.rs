//! H.264/AVC helpers
//!
//! Internal messages carry H.264 in AVCC format (length-prefixed NAL units).
//! Segment output needs Annex-B (start-code delimited), so this module also
//! converts between the two.
//!
//! AVCDecoderConfigurationRecord (sequence header):
//! ```text
//! configurationVersion (1) | AVCProfileIndication (1) | profile_compatibility (1)
//! | AVCLevelIndication (1) | lengthSizeMinusOne (1, lower 2 bits)
//! | numOfSPS (1, lower 5 bits) | { spsLength (2) | spsNALUnit }*
//! | numOfPPS (1) | { ppsLength (2) | ppsNALUnit }*
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{MediaError, Result};

/// Annex-B start code
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Access unit delimiter NAL unit (primary_pic_type = any)
pub const AUD_NALU: [u8; 2] = [0x09, 0xF0];

/// AVC packet type (second byte of an AVC video tag)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvcPacketType {
    /// Sequence header (AVCDecoderConfigurationRecord)
    SequenceHeader = 0,
    /// NAL units
    Nalu = 1,
    /// End of sequence
    EndOfSequence = 2,
}

impl AvcPacketType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(AvcPacketType::SequenceHeader),
            1 => Some(AvcPacketType::Nalu),
            2 => Some(AvcPacketType::EndOfSequence),
            _ => None,
        }
    }
}

/// NAL unit type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaluType {
    /// Non-IDR slice
    Slice = 1,
    /// Slice data partition A
    SlicePartA = 2,
    /// Slice data partition B
    SlicePartB = 3,
    /// Slice data partition C
    SlicePartC = 4,
    /// IDR slice (keyframe)
    Idr = 5,
    /// Supplemental enhancement information
    Sei = 6,
    /// Sequence parameter set
    Sps = 7,
    /// Picture parameter set
    Pps = 8,
    /// Access unit delimiter
    Aud = 9,
    /// End of sequence
    EndSeq = 10,
    /// End of stream
    EndStream = 11,
    /// Filler data
    Filler = 12,
}

impl NaluType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b & 0x1F {
            1 => Some(NaluType::Slice),
            2 => Some(NaluType::SlicePartA),
            3 => Some(NaluType::SlicePartB),
            4 => Some(NaluType::SlicePartC),
            5 => Some(NaluType::Idr),
            6 => Some(NaluType::Sei),
            7 => Some(NaluType::Sps),
            8 => Some(NaluType::Pps),
            9 => Some(NaluType::Aud),
            10 => Some(NaluType::EndSeq),
            11 => Some(NaluType::EndStream),
            12 => Some(NaluType::Filler),
            _ => None,
        }
    }

    pub fn is_keyframe(&self) -> bool {
        matches!(self, NaluType::Idr)
    }

    pub fn is_parameter_set(&self) -> bool {
        matches!(self, NaluType::Sps | NaluType::Pps)
    }
}

/// AVC decoder configuration (from sequence header)
#[derive(Debug, Clone)]
pub struct AvcConfig {
    /// AVC profile (66=Baseline, 77=Main, 100=High, etc.)
    pub profile: u8,
    /// Profile compatibility flags
    pub compatibility: u8,
    /// AVC level (e.g., 31 = 3.1)
    pub level: u8,
    /// NALU length size in bytes (usually 4)
    pub nalu_length_size: u8,
    /// Sequence Parameter Sets
    pub sps: Vec<Bytes>,
    /// Picture Parameter Sets
    pub pps: Vec<Bytes>,
    /// Raw AVCDecoderConfigurationRecord bytes
    pub raw: Bytes,
}

impl AvcConfig {
    /// Parse from AVCDecoderConfigurationRecord
    pub fn parse(data: Bytes) -> Result<Self> {
        if data.len() < 7 {
            return Err(MediaError::InvalidAvcPacket.into());
        }

        let raw = data.clone();
        let mut data = data;

        let version = data.get_u8();
        if version != 1 {
            return Err(MediaError::InvalidAvcPacket.into());
        }

        let profile = data.get_u8();
        let compatibility = data.get_u8();
        let level = data.get_u8();
        let nalu_length_size = (data.get_u8() & 0x03) + 1;

        let num_sps = (data.get_u8() & 0x1F) as usize;
        let sps = read_parameter_sets(&mut data, num_sps)?;

        if data.is_empty() {
            return Err(MediaError::InvalidAvcPacket.into());
        }
        let num_pps = data.get_u8() as usize;
        let pps = read_parameter_sets(&mut data, num_pps)?;

        Ok(AvcConfig {
            profile,
            compatibility,
            level,
            nalu_length_size,
            sps,
            pps,
            raw,
        })
    }

    /// Build a configuration record from one SPS and one PPS
    ///
    /// Profile, compatibility and level are copied from SPS bytes 1..4.
    pub fn from_parameter_sets(sps: Bytes, pps: Bytes) -> Result<Self> {
        if sps.len() < 4 || pps.is_empty() {
            return Err(MediaError::InvalidAvcPacket.into());
        }

        let (profile, compatibility, level) = (sps[1], sps[2], sps[3]);

        let mut record = BytesMut::with_capacity(11 + sps.len() + pps.len());
        record.put_u8(0x01);
        record.put_u8(profile);
        record.put_u8(compatibility);
        record.put_u8(level);
        record.put_u8(0xFF); // 6 reserved bits + lengthSizeMinusOne = 3
        record.put_u8(0xE1); // 3 reserved bits + one SPS
        record.put_u16(sps.len() as u16);
        record.put_slice(&sps);
        record.put_u8(0x01);
        record.put_u16(pps.len() as u16);
        record.put_slice(&pps);

        Ok(AvcConfig {
            profile,
            compatibility,
            level,
            nalu_length_size: 4,
            sps: vec![sps],
            pps: vec![pps],
            raw: record.freeze(),
        })
    }

    /// Parameter sets in Annex-B form, SPS first
    pub fn annexb_parameter_sets(&self) -> Bytes {
        let mut out = BytesMut::new();
        for nalu in self.sps.iter().chain(self.pps.iter()) {
            out.put_slice(&START_CODE);
            out.put_slice(nalu);
        }
        out.freeze()
    }
}

pub(crate) fn read_parameter_sets(data: &mut Bytes, count: usize) -> Result<Vec<Bytes>> {
    let mut sets = Vec::with_capacity(count);
    for _ in 0..count {
        if data.len() < 2 {
            return Err(MediaError::InvalidAvcPacket.into());
        }
        let len = data.get_u16() as usize;
        if data.len() < len {
            return Err(MediaError::TruncatedNalu {
                needed: len,
                available: data.len(),
            }
            .into());
        }
        sets.push(data.copy_to_bytes(len));
    }
    Ok(sets)
}

/// Split length-prefixed NAL units
///
/// Unlike a lenient iterator, a length that points past the end of the buffer
/// is an error so the caller can drop the whole access unit.
pub fn split_avcc(data: &Bytes, length_size: u8) -> Result<Vec<Bytes>> {
    let length_size = length_size as usize;
    if !(1..=4).contains(&length_size) {
        return Err(MediaError::InvalidAvcPacket.into());
    }

    let mut nalus = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        if offset + length_size > data.len() {
            return Err(MediaError::TruncatedNalu {
                needed: length_size,
                available: data.len() - offset,
            }
            .into());
        }

        let mut len = 0usize;
        for i in 0..length_size {
            len = (len << 8) | data[offset + i] as usize;
        }
        offset += length_size;

        if offset + len > data.len() {
            return Err(MediaError::TruncatedNalu {
                needed: len,
                available: data.len() - offset,
            }
            .into());
        }
        if len > 0 {
            nalus.push(data.slice(offset..offset + len));
        }
        offset += len;
    }
    Ok(nalus)
}

/// Append each NAL unit to `out` with a 4-byte length prefix
pub fn put_avcc(out: &mut BytesMut, nalu: &[u8]) {
    out.put_u32(nalu.len() as u32);
    out.put_slice(nalu);
}
