use std::fmt;
use std::io;

use bytes::Bytes;

use crate::audio::{AacPacketType, AudioDataHeader, SoundFormat};
use crate::avc;
use crate::resolution::Resolution;
use crate::script::ScriptData;
use crate::video::{AvcPacketType, VideoCodecId, VideoDataHeader, VideoFrameType};

/// An FLV tag with a copy-free `Bytes` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct FlvTag {
    /// Timestamp in milliseconds (24 bits + extended byte on the wire)
    pub timestamp_ms: u32,
    /// StreamID, always 0 in files
    pub stream_id: u32,
    pub tag_type: FlvTagType,
    /// Tag body, excluding the 11-byte tag header
    pub data: Bytes,
}

impl FlvTag {
    /// On-wire size of the tag: 11-byte header plus body.
    pub fn size(&self) -> usize {
        self.data.len() + 11
    }

    pub fn is_script_tag(&self) -> bool {
        matches!(self.tag_type, FlvTagType::ScriptData)
    }

    pub fn is_audio_tag(&self) -> bool {
        matches!(self.tag_type, FlvTagType::Audio)
    }

    pub fn is_video_tag(&self) -> bool {
        matches!(self.tag_type, FlvTagType::Video)
    }

    /// True when tags carry the same payload (type, size and bytes),
    /// timestamps ignored. This is the identity used for reconnect
    /// deduplication.
    pub fn body_equals(&self, other: &FlvTag) -> bool {
        self.tag_type == other.tag_type && self.data == other.data
    }

    /// CRC32 of the tag body.
    pub fn body_crc32(&self) -> u32 {
        crc32fast::hash(&self.data)
    }

    pub fn is_key_frame(&self) -> bool {
        if self.tag_type != FlvTagType::Video || self.data.is_empty() {
            return false;
        }
        (self.data[0] >> 4) & 0x0F == VideoFrameType::KeyFrame as u8
    }

    pub fn is_video_sequence_header(&self) -> bool {
        if self.tag_type != FlvTagType::Video || self.data.len() < 2 {
            return false;
        }
        let codec_id = self.data[0] & 0x0F;
        (codec_id == VideoCodecId::Avc as u8 || codec_id == VideoCodecId::LegacyHevc as u8)
            && self.data[1] == AvcPacketType::SequenceHeader as u8
    }

    /// AAC tags signal the sequence header with packet type 0 in the second
    /// body byte.
    pub fn is_audio_sequence_header(&self) -> bool {
        if self.tag_type != FlvTagType::Audio || self.data.len() < 2 {
            return false;
        }
        (self.data[0] >> 4) & 0x0F == SoundFormat::Aac as u8
            && self.data[1] == AacPacketType::SequenceHeader as u8
    }

    pub fn is_sequence_header(&self) -> bool {
        self.is_video_sequence_header() || self.is_audio_sequence_header()
    }

    pub fn is_avc_end_of_sequence(&self) -> bool {
        if self.tag_type != FlvTagType::Video || self.data.len() < 2 {
            return false;
        }
        let codec_id = self.data[0] & 0x0F;
        (codec_id == VideoCodecId::Avc as u8 || codec_id == VideoCodecId::LegacyHevc as u8)
            && self.data[1] == AvcPacketType::EndOfSequence as u8
    }

    /// True for a key frame carried as an AVC/HEVC NALU packet.
    pub fn is_key_frame_nalu(&self) -> bool {
        if !self.is_key_frame() || self.data.len() < 2 {
            return false;
        }
        let codec_id = self.data[0] & 0x0F;
        (codec_id == VideoCodecId::Avc as u8 || codec_id == VideoCodecId::LegacyHevc as u8)
            && self.data[1] == AvcPacketType::Nalu as u8
    }

    pub fn decode_audio_header(&self) -> io::Result<AudioDataHeader> {
        if self.tag_type != FlvTagType::Audio {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "tag is not an audio tag",
            ));
        }
        AudioDataHeader::parse(&self.data)
    }

    pub fn decode_video_header(&self) -> io::Result<VideoDataHeader> {
        if self.tag_type != FlvTagType::Video {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "tag is not a video tag",
            ));
        }
        VideoDataHeader::parse(&self.data)
    }

    pub fn decode_script(&self) -> io::Result<ScriptData> {
        if self.tag_type != FlvTagType::ScriptData {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "tag is not a script tag",
            ));
        }
        ScriptData::parse(&self.data)
    }

    pub fn audio_codec(&self) -> Option<SoundFormat> {
        if self.tag_type != FlvTagType::Audio {
            return None;
        }
        SoundFormat::try_from((self.data.first()? >> 4) & 0x0F).ok()
    }

    pub fn video_codec(&self) -> Option<VideoCodecId> {
        if self.tag_type != FlvTagType::Video {
            return None;
        }
        VideoCodecId::try_from(self.data.first()? & 0x0F).ok()
    }

    /// Extract the coded picture size from an AVC sequence header tag.
    pub fn video_resolution(&self) -> Option<Resolution> {
        if !self.is_video_sequence_header() || self.data.len() <= 5 {
            return None;
        }
        avc::extract_resolution(&self.data[5..]).ok()
    }
}

/// FLV tag type, low 5 bits of the tag header's first byte.
///
/// Defined by video_file_format_spec_v10.pdf; the supported types are
/// Audio(8), Video(9) and ScriptData(18).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlvTagType {
    Audio,
    Video,
    ScriptData,
    Unknown(u8),
}

impl From<u8> for FlvTagType {
    fn from(value: u8) -> Self {
        match value {
            8 => FlvTagType::Audio,
            9 => FlvTagType::Video,
            18 => FlvTagType::ScriptData,
            _ => FlvTagType::Unknown(value),
        }
    }
}

impl From<FlvTagType> for u8 {
    fn from(value: FlvTagType) -> Self {
        match value {
            FlvTagType::Audio => 8,
            FlvTagType::Video => 9,
            FlvTagType::ScriptData => 18,
            FlvTagType::Unknown(val) => val,
        }
    }
}

impl fmt::Display for FlvTagType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlvTagType::Audio => write!(f, "Audio"),
            FlvTagType::Video => write!(f, "Video"),
            FlvTagType::ScriptData => write!(f, "Script"),
            FlvTagType::Unknown(value) => write!(f, "Unknown({value})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(tag_type: FlvTagType, data: &[u8]) -> FlvTag {
        FlvTag {
            timestamp_ms: 0,
            stream_id: 0,
            tag_type,
            data: Bytes::copy_from_slice(data),
        }
    }

    #[test]
    fn test_sequence_header_detection() {
        let avc_seq = tag(FlvTagType::Video, &[0x17, 0x00, 0x00, 0x00, 0x00]);
        assert!(avc_seq.is_video_sequence_header());
        assert!(avc_seq.is_key_frame());
        assert!(!avc_seq.is_key_frame_nalu());

        let avc_nalu = tag(FlvTagType::Video, &[0x17, 0x01, 0x00, 0x00, 0x00]);
        assert!(!avc_nalu.is_video_sequence_header());
        assert!(avc_nalu.is_key_frame_nalu());

        let aac_seq = tag(FlvTagType::Audio, &[0xAF, 0x00, 0x12, 0x10]);
        assert!(aac_seq.is_audio_sequence_header());

        let aac_raw = tag(FlvTagType::Audio, &[0xAF, 0x01, 0x21]);
        assert!(!aac_raw.is_audio_sequence_header());
    }

    #[test]
    fn test_avc_end_of_sequence_detection() {
        let eos = tag(FlvTagType::Video, &[0x17, 0x02, 0x00, 0x00, 0x00]);
        assert!(eos.is_avc_end_of_sequence());
        assert!(!eos.is_key_frame_nalu());
    }

    #[test]
    fn test_body_equality_ignores_timestamp() {
        let a = FlvTag {
            timestamp_ms: 100,
            ..tag(FlvTagType::Video, &[0x27, 0x01, 0x00, 0x00, 0x00, 0xAB])
        };
        let b = FlvTag {
            timestamp_ms: 7500,
            ..tag(FlvTagType::Video, &[0x27, 0x01, 0x00, 0x00, 0x00, 0xAB])
        };
        assert!(a.body_equals(&b));
        assert_ne!(a, b);

        let c = tag(FlvTagType::Audio, &[0x27, 0x01, 0x00, 0x00, 0x00, 0xAB]);
        assert!(!a.body_equals(&c));
    }

    #[test]
    fn test_tag_size() {
        let t = tag(FlvTagType::Video, &[0u8; 100]);
        assert_eq!(t.size(), 111);
    }
}
