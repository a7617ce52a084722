//! Audio tag payload header parsing.
//!
//! The first byte of an audio tag body packs sound format, rate, size and
//! channel layout; AAC adds a second byte distinguishing the sequence header
//! from raw frames.

use std::fmt;
use std::io;

/// SoundFormat, upper 4 bits of the first body byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoundFormat {
    LinearPcmPlatform = 0,
    Adpcm = 1,
    Mp3 = 2,
    LinearPcmLe = 3,
    Nellymoser16kMono = 4,
    Nellymoser8kMono = 5,
    Nellymoser = 6,
    G711ALaw = 7,
    G711MuLaw = 8,
    Aac = 10,
    Speex = 11,
    Mp38k = 14,
    DeviceSpecific = 15,
}

impl TryFrom<u8> for SoundFormat {
    type Error = io::Error;

    fn try_from(value: u8) -> io::Result<Self> {
        match value {
            0 => Ok(Self::LinearPcmPlatform),
            1 => Ok(Self::Adpcm),
            2 => Ok(Self::Mp3),
            3 => Ok(Self::LinearPcmLe),
            4 => Ok(Self::Nellymoser16kMono),
            5 => Ok(Self::Nellymoser8kMono),
            6 => Ok(Self::Nellymoser),
            7 => Ok(Self::G711ALaw),
            8 => Ok(Self::G711MuLaw),
            10 => Ok(Self::Aac),
            11 => Ok(Self::Speex),
            14 => Ok(Self::Mp38k),
            15 => Ok(Self::DeviceSpecific),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown sound format: {other}"),
            )),
        }
    }
}

impl fmt::Display for SoundFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// SoundRate, 2 bits. AAC is always signalled as 44 kHz here; the real rate
/// lives in the AudioSpecificConfig.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoundRate {
    Hz5512 = 0,
    Hz11025 = 1,
    Hz22050 = 2,
    Hz44100 = 3,
}

impl SoundRate {
    pub fn hz(&self) -> u32 {
        match self {
            Self::Hz5512 => 5512,
            Self::Hz11025 => 11025,
            Self::Hz22050 => 22050,
            Self::Hz44100 => 44100,
        }
    }
}

/// AAC packet type, second body byte when the format is AAC.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AacPacketType {
    SequenceHeader = 0,
    Raw = 1,
}

/// The parsed fixed portion of an audio tag body.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioDataHeader {
    pub sound_format: SoundFormat,
    pub sound_rate: SoundRate,
    /// true = 16-bit samples, false = 8-bit
    pub sound_size_16bit: bool,
    /// true = stereo, false = mono
    pub stereo: bool,
    pub aac_packet_type: Option<AacPacketType>,
}

impl AudioDataHeader {
    /// Parse the 1- or 2-byte audio header from the start of a tag body.
    pub fn parse(data: &[u8]) -> io::Result<Self> {
        let first = *data.first().ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "empty audio tag body")
        })?;

        let sound_format = SoundFormat::try_from((first >> 4) & 0x0F)?;
        let sound_rate = match (first >> 2) & 0x03 {
            0 => SoundRate::Hz5512,
            1 => SoundRate::Hz11025,
            2 => SoundRate::Hz22050,
            _ => SoundRate::Hz44100,
        };
        let sound_size_16bit = (first >> 1) & 0x01 == 1;
        let stereo = first & 0x01 == 1;

        let aac_packet_type = if sound_format == SoundFormat::Aac {
            let second = *data.get(1).ok_or_else(|| {
                io::Error::new(io::ErrorKind::UnexpectedEof, "truncated AAC audio tag")
            })?;
            match second {
                0 => Some(AacPacketType::SequenceHeader),
                1 => Some(AacPacketType::Raw),
                other => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("unknown AAC packet type: {other}"),
                    ));
                }
            }
        } else {
            None
        };

        Ok(Self {
            sound_format,
            sound_rate,
            sound_size_16bit,
            stereo,
            aac_packet_type,
        })
    }

    /// Size of this header inside the tag body: 2 for AAC, 1 otherwise.
    pub fn header_size(&self) -> usize {
        if self.sound_format == SoundFormat::Aac {
            2
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aac_raw() {
        // 0xAF = AAC, 44kHz, 16-bit, stereo; 0x01 = raw frame
        let header = AudioDataHeader::parse(&[0xAF, 0x01, 0x21, 0x10]).unwrap();
        assert_eq!(header.sound_format, SoundFormat::Aac);
        assert_eq!(header.sound_rate, SoundRate::Hz44100);
        assert!(header.sound_size_16bit);
        assert!(header.stereo);
        assert_eq!(header.aac_packet_type, Some(AacPacketType::Raw));
        assert_eq!(header.header_size(), 2);
    }

    #[test]
    fn test_parse_aac_sequence_header() {
        let header = AudioDataHeader::parse(&[0xAF, 0x00, 0x12, 0x10]).unwrap();
        assert_eq!(header.aac_packet_type, Some(AacPacketType::SequenceHeader));
    }

    #[test]
    fn test_parse_mp3_has_one_byte_header() {
        // 0x2E = MP3, 44kHz, 16-bit, mono
        let header = AudioDataHeader::parse(&[0x2E, 0xFF]).unwrap();
        assert_eq!(header.sound_format, SoundFormat::Mp3);
        assert!(!header.stereo);
        assert_eq!(header.aac_packet_type, None);
        assert_eq!(header.header_size(), 1);
    }

    #[test]
    fn test_truncated_aac_rejected() {
        assert!(AudioDataHeader::parse(&[0xAF]).is_err());
    }
}
