//! AVC sequence-header parsing.
//!
//! Recorded streams advertise their coded picture size only inside the SPS
//! NAL unit of the AVCDecoderConfigurationRecord, so the analyser parses the
//! first SPS to recover the real resolution. Only the fields up to
//! `frame_crop_*` are read; VUI parameters are ignored.

use std::io;

use crate::resolution::Resolution;

/// NAL unit type for a sequence parameter set.
const NAL_UNIT_TYPE_SPS: u8 = 7;

/// An MSB-first bit reader over a byte slice, with Exp-Golomb support.
struct BitReader<'a> {
    data: &'a [u8],
    pos: usize, // absolute bit position
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_bit(&mut self) -> io::Result<bool> {
        let byte = self.data.get(self.pos / 8).ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "SPS bitstream exhausted")
        })?;
        let bit = (byte >> (7 - (self.pos % 8))) & 1;
        self.pos += 1;
        Ok(bit == 1)
    }

    fn read_bits(&mut self, count: u32) -> io::Result<u32> {
        debug_assert!(count <= 32);
        let mut value = 0u32;
        for _ in 0..count {
            value = (value << 1) | self.read_bit()? as u32;
        }
        Ok(value)
    }

    fn read_u8(&mut self) -> io::Result<u8> {
        Ok(self.read_bits(8)? as u8)
    }

    /// ue(v): unsigned Exp-Golomb.
    fn read_ue(&mut self) -> io::Result<u64> {
        let mut leading_zeros = 0u32;
        while !self.read_bit()? {
            leading_zeros += 1;
            if leading_zeros > 63 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "Exp-Golomb code too long",
                ));
            }
        }

        let mut result: u64 = 1;
        for _ in 0..leading_zeros {
            result = (result << 1) | self.read_bit()? as u64;
        }
        Ok(result - 1)
    }

    /// se(v): signed Exp-Golomb.
    fn read_se(&mut self) -> io::Result<i64> {
        let code = self.read_ue()?;
        if code % 2 == 0 {
            Ok(-((code / 2) as i64))
        } else {
            Ok((code / 2) as i64 + 1)
        }
    }
}

/// The subset of an H.264 SPS needed to derive the coded picture size.
/// ISO/IEC 14496-10, 7.3.2.1.1.
#[derive(Debug, Clone, PartialEq)]
pub struct Sps {
    pub profile_idc: u8,
    pub level_idc: u8,
    pub chroma_format_idc: u64,
    pub separate_colour_plane_flag: bool,
    pub pic_width_in_mbs_minus1: u64,
    pub pic_height_in_map_units_minus1: u64,
    pub frame_mbs_only_flag: bool,
    pub frame_crop_left_offset: u64,
    pub frame_crop_right_offset: u64,
    pub frame_crop_top_offset: u64,
    pub frame_crop_bottom_offset: u64,
}

impl Sps {
    /// Parse an SPS from its RBSP bytes (emulation prevention already
    /// removed), starting at the NAL header byte.
    pub fn parse(rbsp: &[u8]) -> io::Result<Self> {
        let mut r = BitReader::new(rbsp);

        if r.read_bit()? {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "forbidden_zero_bit set in SPS NAL header",
            ));
        }
        let _nal_ref_idc = r.read_bits(2)?;
        let nal_unit_type = r.read_bits(5)? as u8;
        if nal_unit_type != NAL_UNIT_TYPE_SPS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("NAL unit type {nal_unit_type} is not an SPS"),
            ));
        }

        let profile_idc = r.read_u8()?;
        let _constraint_flags = r.read_u8()?;
        let level_idc = r.read_u8()?;
        let _seq_parameter_set_id = r.read_ue()?;

        // High-profile family carries chroma/bit-depth/scaling info before
        // the frame geometry. Defaults per 7.4.2.1.1 otherwise.
        let mut chroma_format_idc = 1;
        let mut separate_colour_plane_flag = false;
        if matches!(
            profile_idc,
            100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
        ) {
            chroma_format_idc = r.read_ue()?;
            if chroma_format_idc == 3 {
                separate_colour_plane_flag = r.read_bit()?;
            }
            let _bit_depth_luma_minus8 = r.read_ue()?;
            let _bit_depth_chroma_minus8 = r.read_ue()?;
            let _qpprime_y_zero_transform_bypass_flag = r.read_bit()?;
            if r.read_bit()? {
                // seq_scaling_matrix_present_flag
                let list_count = if chroma_format_idc != 3 { 8 } else { 12 };
                for i in 0..list_count {
                    if r.read_bit()? {
                        skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                    }
                }
            }
        }

        let _log2_max_frame_num_minus4 = r.read_ue()?;
        let pic_order_cnt_type = r.read_ue()?;
        if pic_order_cnt_type == 0 {
            let _log2_max_pic_order_cnt_lsb_minus4 = r.read_ue()?;
        } else if pic_order_cnt_type == 1 {
            let _delta_pic_order_always_zero_flag = r.read_bit()?;
            let _offset_for_non_ref_pic = r.read_se()?;
            let _offset_for_top_to_bottom_field = r.read_se()?;
            let num_ref_frames_in_pic_order_cnt_cycle = r.read_ue()?;
            for _ in 0..num_ref_frames_in_pic_order_cnt_cycle {
                let _offset_for_ref_frame = r.read_se()?;
            }
        }

        let _max_num_ref_frames = r.read_ue()?;
        let _gaps_in_frame_num_value_allowed_flag = r.read_bit()?;

        let pic_width_in_mbs_minus1 = r.read_ue()?;
        let pic_height_in_map_units_minus1 = r.read_ue()?;
        let frame_mbs_only_flag = r.read_bit()?;
        if !frame_mbs_only_flag {
            let _mb_adaptive_frame_field_flag = r.read_bit()?;
        }
        let _direct_8x8_inference_flag = r.read_bit()?;

        let mut frame_crop_left_offset = 0;
        let mut frame_crop_right_offset = 0;
        let mut frame_crop_top_offset = 0;
        let mut frame_crop_bottom_offset = 0;
        if r.read_bit()? {
            // frame_cropping_flag
            frame_crop_left_offset = r.read_ue()?;
            frame_crop_right_offset = r.read_ue()?;
            frame_crop_top_offset = r.read_ue()?;
            frame_crop_bottom_offset = r.read_ue()?;
        }

        Ok(Sps {
            profile_idc,
            level_idc,
            chroma_format_idc,
            separate_colour_plane_flag,
            pic_width_in_mbs_minus1,
            pic_height_in_map_units_minus1,
            frame_mbs_only_flag,
            frame_crop_left_offset,
            frame_crop_right_offset,
            frame_crop_top_offset,
            frame_crop_bottom_offset,
        })
    }

    /// Derive the display size via the cropping formulas of 7.4.2.1.1 with
    /// (SubWidthC, SubHeightC) from Table 6-1.
    pub fn resolution(&self) -> Resolution {
        let chroma_array_type = if self.separate_colour_plane_flag {
            0
        } else {
            self.chroma_format_idc
        };

        let (sub_width_c, sub_height_c) = match self.chroma_format_idc {
            1 => (2, 2),
            2 => (2, 1),
            _ => (1, 1),
        };

        let frame_mbs_only = self.frame_mbs_only_flag as u64;
        let (crop_unit_x, crop_unit_y) = if chroma_array_type == 0 {
            (1, 2 - frame_mbs_only)
        } else {
            (sub_width_c, sub_height_c * (2 - frame_mbs_only))
        };

        let width = (self.pic_width_in_mbs_minus1 + 1) * 16
            - crop_unit_x * (self.frame_crop_left_offset + self.frame_crop_right_offset);
        let height = (2 - frame_mbs_only) * (self.pic_height_in_map_units_minus1 + 1) * 16
            - crop_unit_y * (self.frame_crop_top_offset + self.frame_crop_bottom_offset);

        Resolution {
            width: width as u32,
            height: height as u32,
        }
    }
}

fn skip_scaling_list(r: &mut BitReader, size: usize) -> io::Result<()> {
    let mut last_scale: i64 = 8;
    let mut next_scale: i64 = 8;
    for _ in 0..size {
        if next_scale != 0 {
            let delta_scale = r.read_se()?;
            next_scale = (last_scale + delta_scale + 256) % 256;
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Ok(())
}

/// Remove emulation-prevention bytes: `00 00 03` becomes `00 00`.
pub fn strip_emulation_prevention(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0usize;
    for &byte in data {
        if zeros >= 2 && byte == 0x03 {
            zeros = 0;
            continue;
        }
        if byte == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }
        out.push(byte);
    }
    out
}

/// Extract the first SPS from an AVCDecoderConfigurationRecord and derive
/// the coded picture size.
///
/// `config` is the record itself, i.e. the video tag body with its 5-byte
/// tag header already removed.
pub fn extract_resolution(config: &[u8]) -> io::Result<Resolution> {
    let sps = extract_first_sps(config)?;
    Ok(Sps::parse(&strip_emulation_prevention(&sps))?.resolution())
}

/// Pull the first SPS NAL unit out of an AVCDecoderConfigurationRecord
/// (ISO/IEC 14496-15, 5.2.4.1.1).
pub fn extract_first_sps(config: &[u8]) -> io::Result<Vec<u8>> {
    if config.len() < 7 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "AVC configuration record too short",
        ));
    }
    if config[0] != 1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported AVC configuration version: {}", config[0]),
        ));
    }

    let num_sps = config[5] & 0x1F;
    if num_sps == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "AVC configuration record carries no SPS",
        ));
    }

    let sps_len = u16::from_be_bytes([config[6], config[7]]) as usize;
    let start = 8;
    let end = start + sps_len;
    if end > config.len() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "truncated SPS in AVC configuration record",
        ));
    }

    Ok(config[start..end].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    // High-profile 1080p SPS as found in the wild (contains emulation
    // prevention bytes).
    const SPS_1080P: &[u8] = &[
        0x67, 0x64, 0x00, 0x28, 0xAC, 0xD9, 0x40, 0x78, 0x02, 0x27, 0xE5, 0x84, 0x00, 0x00, 0x03,
        0x00, 0x04, 0x00, 0x00, 0x03, 0x00, 0xF0, 0x3C, 0x60, 0xC6, 0x58,
    ];

    #[test]
    fn test_parse_1080p_sps() {
        let rbsp = strip_emulation_prevention(SPS_1080P);
        let sps = Sps::parse(&rbsp).unwrap();

        assert_eq!(sps.profile_idc, 100);
        assert_eq!(sps.chroma_format_idc, 1);
        assert_eq!(sps.pic_width_in_mbs_minus1, 119);
        assert_eq!(sps.pic_height_in_map_units_minus1, 67);
        assert!(sps.frame_mbs_only_flag);
        assert_eq!(sps.frame_crop_bottom_offset, 4);

        let res = sps.resolution();
        assert_eq!(res.width, 1920);
        assert_eq!(res.height, 1080);
    }

    #[test]
    fn test_strip_emulation_prevention() {
        assert_eq!(
            strip_emulation_prevention(&[0x00, 0x00, 0x03, 0x00, 0x01]),
            vec![0x00, 0x00, 0x00, 0x01]
        );
        // 0x03 not preceded by two zeros is kept.
        assert_eq!(
            strip_emulation_prevention(&[0x00, 0x03, 0x00]),
            vec![0x00, 0x03, 0x00]
        );
    }

    #[test]
    fn test_extract_resolution_from_configuration_record() {
        let mut record = vec![
            0x01, // configurationVersion
            0x64, 0x00, 0x28, // profile, compat, level
            0xFF, // lengthSizeMinusOne
            0xE1, // 1 SPS
        ];
        record.extend_from_slice(&(SPS_1080P.len() as u16).to_be_bytes());
        record.extend_from_slice(SPS_1080P);
        record.push(0x01); // 1 PPS
        record.extend_from_slice(&4u16.to_be_bytes());
        record.extend_from_slice(&[0x68, 0xCE, 0x38, 0x80]);

        let res = extract_resolution(&record).unwrap();
        assert_eq!(res.width, 1920);
        assert_eq!(res.height, 1080);
    }

    #[test]
    fn test_bad_configuration_version_rejected() {
        assert!(extract_first_sps(&[0x02, 0, 0, 0, 0xFF, 0xE1, 0x00, 0x00]).is_err());
    }
}
