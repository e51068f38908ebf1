//! H.265/HEVC helpers
//!
//! HEVCDecoderConfigurationRecord layout used here:
//! ```text
//! configurationVersion (1) | profile_space/tier/profile_idc (1)
//! | profile_compatibility_flags (4) | constraint_indicator_flags (6) | level_idc (1)
//! | min_spatial_segmentation (2) | parallelismType (1) | chromaFormat (1)
//! | bitDepthLuma (1) | bitDepthChroma (1) | avgFrameRate (2)
//! | constantFrameRate/numTemporalLayers/temporalIdNested/lengthSizeMinusOne (1)
//! | numOfArrays (1) | { type (1) | numNalus (2) | { len (2) | nalu }* }*
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::h264::{read_parameter_sets, START_CODE};
use crate::error::{MediaError, Result};

pub const NALU_TYPE_VPS: u8 = 32;
pub const NALU_TYPE_SPS: u8 = 33;
pub const NALU_TYPE_PPS: u8 = 34;
pub const NALU_TYPE_AUD: u8 = 35;

/// Access unit delimiter NAL unit (pic_type = any)
pub const AUD_NALU: [u8; 3] = [0x46, 0x01, 0x50];

const RECORD_HEADER_LEN: usize = 23;

/// NAL unit type from the first header byte
pub fn nalu_type(b: u8) -> u8 {
    (b >> 1) & 0x3F
}

/// BLA, IDR and CRA pictures
pub fn is_keyframe(nalu_type: u8) -> bool {
    (16..=21).contains(&nalu_type)
}

pub fn is_parameter_set(nalu_type: u8) -> bool {
    matches!(nalu_type, NALU_TYPE_VPS | NALU_TYPE_SPS | NALU_TYPE_PPS)
}

/// HEVC decoder configuration
#[derive(Debug, Clone)]
pub struct HevcConfig {
    pub nalu_length_size: u8,
    pub vps: Vec<Bytes>,
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
    /// Raw HEVCDecoderConfigurationRecord bytes
    pub raw: Bytes,
}

impl HevcConfig {
    pub fn parse(data: Bytes) -> Result<Self> {
        if data.len() < RECORD_HEADER_LEN || data[0] != 1 {
            return Err(MediaError::InvalidHevcPacket.into());
        }

        let raw = data.clone();
        let nalu_length_size = (data[21] & 0x03) + 1;
        let num_arrays = data[22];

        let mut rest = data.slice(RECORD_HEADER_LEN..);
        let mut config = HevcConfig {
            nalu_length_size,
            vps: Vec::new(),
            sps: Vec::new(),
            pps: Vec::new(),
            raw,
        };

        for _ in 0..num_arrays {
            if rest.len() < 3 {
                return Err(MediaError::InvalidHevcPacket.into());
            }
            let array_type = rest.get_u8() & 0x3F;
            let count = rest.get_u16() as usize;
            let sets = read_parameter_sets(&mut rest, count)?;
            match array_type {
                NALU_TYPE_VPS => config.vps.extend(sets),
                NALU_TYPE_SPS => config.sps.extend(sets),
                NALU_TYPE_PPS => config.pps.extend(sets),
                _ => {}
            }
        }

        Ok(config)
    }

    /// Build a configuration record from one VPS, SPS and PPS
    ///
    /// The 12-byte general profile_tier_level is copied from the SPS right after
    /// its 2-byte NAL header and the sub-layer byte. Chroma format and bit depths
    /// are written as 4:2:0 8-bit.
    pub fn from_parameter_sets(vps: Bytes, sps: Bytes, pps: Bytes) -> Result<Self> {
        if sps.len() < 15 || vps.is_empty() || pps.is_empty() {
            return Err(MediaError::InvalidHevcPacket.into());
        }
        let ptl = &sps[3..15];

        let mut record =
            BytesMut::with_capacity(RECORD_HEADER_LEN + 15 + vps.len() + sps.len() + pps.len());
        record.put_u8(0x01);
        record.put_slice(ptl);
        record.put_u16(0xF000);
        record.put_u8(0xFC);
        record.put_u8(0xFD);
        record.put_u8(0xF8);
        record.put_u8(0xF8);
        record.put_u16(0);
        record.put_u8(0x0F);
        record.put_u8(3);
        for (nalu_type, nalu) in [
            (NALU_TYPE_VPS, &vps),
            (NALU_TYPE_SPS, &sps),
            (NALU_TYPE_PPS, &pps),
        ] {
            record.put_u8(0x80 | nalu_type);
            record.put_u16(1);
            record.put_u16(nalu.len() as u16);
            record.put_slice(nalu);
        }

        Ok(HevcConfig {
            nalu_length_size: 4,
            vps: vec![vps],
            sps: vec![sps],
            pps: vec![pps],
            raw: record.freeze(),
        })
    }

    /// Parameter sets in Annex-B form: VPS, SPS, PPS
    pub fn annexb_parameter_sets(&self) -> Bytes {
        let mut out = BytesMut::new();
        for nalu in self.vps.iter().chain(self.sps.iter()).chain(self.pps.iter()) {
            out.put_slice(&START_CODE);
            out.put_slice(nalu);
        }
        out.freeze()
    }
}
