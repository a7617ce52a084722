use std::io;
use std::io::Read;

use byteorder::{BigEndian, ReadBytesExt};

pub const FLV_HEADER_SIZE: usize = 9;
// DataOffset is a 32-bit field but is 9 for every real-world FLV. Bound it
// so a bogus header cannot make us skip unbounded data.
const MAX_DATA_OFFSET: u32 = 64 * 1024;

/// The 9-byte FLV file header.
#[derive(Debug, Clone, PartialEq)]
pub struct FlvHeader {
    /// 3-byte signature, always 'FLV'
    pub signature: u32,
    /// Format version, 1 for legacy FLV
    pub version: u8,
    /// TypeFlagsAudio
    pub has_audio: bool,
    /// TypeFlagsVideo
    pub has_video: bool,
    /// Length of this header, always 9
    pub data_offset: u32,
}

impl FlvHeader {
    /// Creates a new header with the given audio/video flags; signature and
    /// version are fixed.
    pub fn new(has_audio: bool, has_video: bool) -> Self {
        FlvHeader {
            signature: 0x464C56,
            version: 0x01,
            has_audio,
            has_video,
            data_offset: FLV_HEADER_SIZE as u32,
        }
    }

    /// Parses the FLV header from a byte stream, advancing the reader to
    /// `data_offset`.
    pub fn parse<R: Read>(reader: &mut R) -> io::Result<Self> {
        let signature = reader.read_u24::<BigEndian>()?;
        if signature != 0x464C56 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid FLV signature",
            ));
        }

        let version = reader.read_u8()?;
        if version != 0x01 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported FLV version: {version}"),
            ));
        }

        // Reserved flag bits (7..=3 and 1) must be zero.
        let flags = reader.read_u8()?;
        if (flags & 0b1111_1010) != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid FLV header flags: 0x{flags:02X}"),
            ));
        }

        let has_audio = (flags & 0b0000_0100) != 0;
        let has_video = (flags & 0b0000_0001) != 0;

        let data_offset = reader.read_u32::<BigEndian>()?;
        if !(FLV_HEADER_SIZE as u32..=MAX_DATA_OFFSET).contains(&data_offset) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid FLV DataOffset: {data_offset}"),
            ));
        }

        // Skip any extended header bytes.
        let extra = (data_offset as usize).saturating_sub(FLV_HEADER_SIZE);
        if extra > 0 {
            let mut limited = reader.take(extra as u64);
            io::copy(&mut limited, &mut io::sink())?;
            if limited.limit() != 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "unexpected EOF while skipping extended FLV header",
                ));
            }
        }

        Ok(FlvHeader {
            signature,
            version,
            has_audio,
            has_video,
            data_offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use std::io::Cursor;

    fn header_bytes(flags: u8) -> Vec<u8> {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(b"FLV");
        buffer.push(0x01);
        buffer.push(flags);
        buffer.write_u32::<BigEndian>(9).unwrap();
        buffer
    }

    #[test]
    fn test_valid_flv_header() {
        let buffer = header_bytes(0x05);
        let mut reader = Cursor::new(&buffer[..]);

        let header = FlvHeader::parse(&mut reader).unwrap();

        assert_eq!(header.signature, 0x464C56);
        assert_eq!(header.version, 0x01);
        assert!(header.has_audio);
        assert!(header.has_video);
        assert_eq!(header.data_offset, 9);
        assert_eq!(reader.position(), 9);
    }

    #[test]
    fn test_invalid_signature_rejected() {
        let mut buffer = header_bytes(0x05);
        buffer[0..3].copy_from_slice(b"ABC");

        let mut reader = Cursor::new(&buffer[..]);
        assert!(FlvHeader::parse(&mut reader).is_err());
    }

    #[test]
    fn test_reserved_flag_bits_rejected() {
        let buffer = header_bytes(0xFF);
        let mut reader = Cursor::new(&buffer[..]);
        assert!(FlvHeader::parse(&mut reader).is_err());
    }

    #[test]
    fn test_video_only_flags() {
        let buffer = header_bytes(0x01);
        let mut reader = Cursor::new(&buffer[..]);
        let header = FlvHeader::parse(&mut reader).unwrap();
        assert!(!header.has_audio);
        assert!(header.has_video);
    }
}
