//! Video tag payload header parsing.
//!
//! The first body byte packs frame type and codec id; AVC adds a packet type
//! byte and a signed 24-bit composition time offset.

use std::fmt;
use std::io;

/// FrameType, upper 4 bits of the first body byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFrameType {
    KeyFrame = 1,
    InterFrame = 2,
    DisposableInterFrame = 3,
    GeneratedKeyFrame = 4,
    CommandFrame = 5,
}

impl TryFrom<u8> for VideoFrameType {
    type Error = io::Error;

    fn try_from(value: u8) -> io::Result<Self> {
        match value {
            1 => Ok(Self::KeyFrame),
            2 => Ok(Self::InterFrame),
            3 => Ok(Self::DisposableInterFrame),
            4 => Ok(Self::GeneratedKeyFrame),
            5 => Ok(Self::CommandFrame),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown video frame type: {other}"),
            )),
        }
    }
}

/// CodecID, lower 4 bits of the first body byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodecId {
    SorensonH263 = 2,
    ScreenVideo = 3,
    On2Vp6 = 4,
    On2Vp6Alpha = 5,
    ScreenVideo2 = 6,
    Avc = 7,
    /// HEVC carried with the legacy codec id used by Chinese live platforms.
    LegacyHevc = 12,
}

impl TryFrom<u8> for VideoCodecId {
    type Error = io::Error;

    fn try_from(value: u8) -> io::Result<Self> {
        match value {
            2 => Ok(Self::SorensonH263),
            3 => Ok(Self::ScreenVideo),
            4 => Ok(Self::On2Vp6),
            5 => Ok(Self::On2Vp6Alpha),
            6 => Ok(Self::ScreenVideo2),
            7 => Ok(Self::Avc),
            12 => Ok(Self::LegacyHevc),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown video codec id: {other}"),
            )),
        }
    }
}

impl fmt::Display for VideoCodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// AVCPacketType, second body byte for AVC/HEVC tags.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvcPacketType {
    SequenceHeader = 0,
    Nalu = 1,
    EndOfSequence = 2,
}

impl TryFrom<u8> for AvcPacketType {
    type Error = io::Error;

    fn try_from(value: u8) -> io::Result<Self> {
        match value {
            0 => Ok(Self::SequenceHeader),
            1 => Ok(Self::Nalu),
            2 => Ok(Self::EndOfSequence),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown AVC packet type: {other}"),
            )),
        }
    }
}

/// The parsed fixed portion of a video tag body.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoDataHeader {
    pub frame_type: VideoFrameType,
    pub codec_id: VideoCodecId,
    /// Present for AVC/HEVC tags only.
    pub avc_packet_type: Option<AvcPacketType>,
    /// SI24 composition time offset, present for AVC/HEVC tags only.
    pub composition_time: Option<i32>,
}

impl VideoDataHeader {
    /// Parse the 1- or 5-byte video header from the start of a tag body.
    pub fn parse(data: &[u8]) -> io::Result<Self> {
        let first = *data.first().ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "empty video tag body")
        })?;

        let frame_type = VideoFrameType::try_from((first >> 4) & 0x0F)?;
        let codec_id = VideoCodecId::try_from(first & 0x0F)?;

        let (avc_packet_type, composition_time) =
            if matches!(codec_id, VideoCodecId::Avc | VideoCodecId::LegacyHevc) {
                if data.len() < 5 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "truncated AVC video tag",
                    ));
                }
                let packet_type = AvcPacketType::try_from(data[1])?;
                // Sign-extend the 24-bit offset.
                let raw = ((data[2] as i32) << 16) | ((data[3] as i32) << 8) | (data[4] as i32);
                let cts = (raw << 8) >> 8;
                (Some(packet_type), Some(cts))
            } else {
                (None, None)
            };

        Ok(Self {
            frame_type,
            codec_id,
            avc_packet_type,
            composition_time,
        })
    }

    /// Size of this header inside the tag body: 5 for AVC/HEVC, 1 otherwise.
    pub fn header_size(&self) -> usize {
        if self.avc_packet_type.is_some() {
            5
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0x17, VideoFrameType::KeyFrame, VideoCodecId::Avc)]
    #[case(0x27, VideoFrameType::InterFrame, VideoCodecId::Avc)]
    #[case(0x1C, VideoFrameType::KeyFrame, VideoCodecId::LegacyHevc)]
    #[case(0x37, VideoFrameType::DisposableInterFrame, VideoCodecId::Avc)]
    fn test_first_byte_unpacking(
        #[case] first: u8,
        #[case] frame_type: VideoFrameType,
        #[case] codec_id: VideoCodecId,
    ) {
        let header = VideoDataHeader::parse(&[first, 0x01, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(header.frame_type, frame_type);
        assert_eq!(header.codec_id, codec_id);
    }

    #[test]
    fn test_parse_avc_keyframe_nalu() {
        let header = VideoDataHeader::parse(&[0x17, 0x01, 0x00, 0x00, 0x42]).unwrap();
        assert_eq!(header.frame_type, VideoFrameType::KeyFrame);
        assert_eq!(header.codec_id, VideoCodecId::Avc);
        assert_eq!(header.avc_packet_type, Some(AvcPacketType::Nalu));
        assert_eq!(header.composition_time, Some(0x42));
        assert_eq!(header.header_size(), 5);
    }

    #[test]
    fn test_parse_avc_sequence_header() {
        let header = VideoDataHeader::parse(&[0x17, 0x00, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(header.avc_packet_type, Some(AvcPacketType::SequenceHeader));
    }

    #[test]
    fn test_negative_composition_time() {
        let header = VideoDataHeader::parse(&[0x27, 0x01, 0xFF, 0xFF, 0xFE]).unwrap();
        assert_eq!(header.frame_type, VideoFrameType::InterFrame);
        assert_eq!(header.composition_time, Some(-2));
    }

    #[test]
    fn test_non_avc_has_one_byte_header() {
        let header = VideoDataHeader::parse(&[0x22, 0xAA]).unwrap();
        assert_eq!(header.codec_id, VideoCodecId::SorensonH263);
        assert_eq!(header.header_size(), 1);
        assert_eq!(header.avc_packet_type, None);
    }

    #[test]
    fn test_truncated_avc_rejected() {
        assert!(VideoDataHeader::parse(&[0x17, 0x01]).is_err());
    }
}
