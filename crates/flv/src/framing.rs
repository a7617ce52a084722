use crate::tag::FlvTagType;
use std::io;

pub const PREV_TAG_SIZE_FIELD_SIZE: usize = 4;
pub const TAG_HEADER_SIZE: usize = 11;

/// The fixed 11-byte tag header, decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedTagHeader {
    pub tag_type: FlvTagType,
    pub is_filtered: bool,
    pub data_size: u32,
    pub timestamp_ms: u32,
    pub stream_id: u32,
}

pub fn parse_prev_tag_size(bytes: [u8; PREV_TAG_SIZE_FIELD_SIZE]) -> u32 {
    u32::from_be_bytes(bytes)
}

/// Decode the 11-byte tag header: flags (filter bit + 5-bit type), UI24 data
/// size, UI24 timestamp plus extended byte, UI24 stream id.
pub fn parse_tag_header_bytes(bytes: [u8; TAG_HEADER_SIZE]) -> io::Result<ParsedTagHeader> {
    let tag_type_byte = bytes[0];
    let tag_type = FlvTagType::from(tag_type_byte & 0x1F);
    let is_filtered = (tag_type_byte & 0x20) != 0;

    let data_size = ((bytes[1] as u32) << 16) | ((bytes[2] as u32) << 8) | (bytes[3] as u32);

    // TimestampExtended carries the high byte.
    let timestamp_ms = ((bytes[7] as u32) << 24)
        | ((bytes[4] as u32) << 16)
        | ((bytes[5] as u32) << 8)
        | (bytes[6] as u32);

    let stream_id = ((bytes[8] as u32) << 16) | ((bytes[9] as u32) << 8) | (bytes[10] as u32);

    Ok(ParsedTagHeader {
        tag_type,
        is_filtered,
        data_size,
        timestamp_ms,
        stream_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_header_round_trip() {
        let encoded =
            crate::encode::encode_tag_header_bytes(FlvTagType::Video, 0x0004_1234, 0x0123_4567, 0)
                .unwrap();
        let parsed = parse_tag_header_bytes(encoded).unwrap();

        assert_eq!(parsed.tag_type, FlvTagType::Video);
        assert!(!parsed.is_filtered);
        assert_eq!(parsed.data_size, 0x0004_1234);
        assert_eq!(parsed.timestamp_ms, 0x0123_4567);
        assert_eq!(parsed.stream_id, 0);
    }

    #[test]
    fn test_filter_bit_detected() {
        let mut bytes = [0u8; TAG_HEADER_SIZE];
        bytes[0] = 0x20 | 9;
        let parsed = parse_tag_header_bytes(bytes).unwrap();
        assert!(parsed.is_filtered);
        assert_eq!(parsed.tag_type, FlvTagType::Video);
    }

    #[test]
    fn test_extended_timestamp_byte_is_high_order() {
        let mut bytes = [0u8; TAG_HEADER_SIZE];
        bytes[0] = 8;
        bytes[4] = 0xAB;
        bytes[5] = 0xCD;
        bytes[6] = 0xEF;
        bytes[7] = 0x01; // extended byte
        let parsed = parse_tag_header_bytes(bytes).unwrap();
        assert_eq!(parsed.timestamp_ms, 0x01AB_CDEF);
    }
}
