//! Tag factories shared by the operator tests.

use bytes::Bytes;
use flv::data::FlvData;
use flv::header::FlvHeader;
use flv::tag::{FlvTag, FlvTagType};

pub fn create_test_header() -> FlvData {
    FlvData::Header(FlvHeader::new(true, true))
}

pub fn create_video_only_header() -> FlvData {
    FlvData::Header(FlvHeader::new(false, true))
}

/// An AVC NALU tag; key frames get frame type 1, inter frames type 2.
pub fn create_video_tag(timestamp: u32, keyframe: bool) -> FlvData {
    let first = if keyframe { 0x17 } else { 0x27 };
    FlvData::Tag(FlvTag {
        timestamp_ms: timestamp,
        stream_id: 0,
        tag_type: FlvTagType::Video,
        data: Bytes::from(vec![first, 0x01, 0x00, 0x00, 0x00, (timestamp % 251) as u8]),
    })
}

/// A video tag with caller-controlled payload tail, for byte-equality tests.
pub fn create_video_tag_with_payload(timestamp: u32, keyframe: bool, payload: &[u8]) -> FlvData {
    let first = if keyframe { 0x17 } else { 0x27 };
    let mut data = vec![first, 0x01, 0x00, 0x00, 0x00];
    data.extend_from_slice(payload);
    FlvData::Tag(FlvTag {
        timestamp_ms: timestamp,
        stream_id: 0,
        tag_type: FlvTagType::Video,
        data: Bytes::from(data),
    })
}

pub fn create_audio_tag(timestamp: u32) -> FlvData {
    FlvData::Tag(FlvTag {
        timestamp_ms: timestamp,
        stream_id: 0,
        tag_type: FlvTagType::Audio,
        data: Bytes::from(vec![0xAF, 0x01, 0x21, 0x10, (timestamp % 251) as u8]),
    })
}

pub fn create_video_sequence_header(timestamp: u32) -> FlvData {
    create_video_sequence_header_with(timestamp, 0x42)
}

/// Sequence header whose trailing byte is caller-controlled so tests can
/// simulate a parameter change.
pub fn create_video_sequence_header_with(timestamp: u32, marker: u8) -> FlvData {
    FlvData::Tag(FlvTag {
        timestamp_ms: timestamp,
        stream_id: 0,
        tag_type: FlvTagType::Video,
        data: Bytes::from(vec![
            0x17, 0x00, 0x00, 0x00, 0x00, // keyframe + AVC sequence header
            0x01, 0x64, 0x00, 0x28, 0xFF, 0xE1, marker,
        ]),
    })
}

pub fn create_audio_sequence_header(timestamp: u32) -> FlvData {
    create_audio_sequence_header_with(timestamp, 0x10)
}

pub fn create_audio_sequence_header_with(timestamp: u32, marker: u8) -> FlvData {
    FlvData::Tag(FlvTag {
        timestamp_ms: timestamp,
        stream_id: 0,
        tag_type: FlvTagType::Audio,
        data: Bytes::from(vec![0xAF, 0x00, 0x12, marker]),
    })
}

pub fn create_metadata_tag(timestamp: u32) -> FlvData {
    let script = flv::ScriptData {
        name: flv::ON_METADATA.to_string(),
        data: vec![amf0::Amf0Value::EcmaArray(
            vec![
                ("duration".into(), amf0::Amf0Value::Number(0.0)),
                ("framerate".into(), amf0::Amf0Value::Number(30.0)),
            ]
            .into(),
        )],
    };
    FlvData::Tag(FlvTag {
        timestamp_ms: timestamp,
        stream_id: 0,
        tag_type: FlvTagType::ScriptData,
        data: Bytes::from(script.to_bytes().unwrap()),
    })
}

pub fn create_avc_end_of_sequence(timestamp: u32) -> FlvData {
    FlvData::Tag(FlvTag {
        timestamp_ms: timestamp,
        stream_id: 0,
        tag_type: FlvTagType::Video,
        data: Bytes::from(vec![0x17, 0x02, 0x00, 0x00, 0x00]),
    })
}

/// Extract the timestamps of every tag in a result set.
pub fn tag_timestamps(items: &[FlvData]) -> Vec<u32> {
    items
        .iter()
        .filter_map(|item| match item {
            FlvData::Tag(tag) => Some(tag.timestamp_ms),
            _ => None,
        })
        .collect()
}
