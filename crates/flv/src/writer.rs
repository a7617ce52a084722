//! Synchronous FLV writing.
//!
//! The writer mirrors the parser exactly: for every tag it emits the 11-byte
//! header, the body, and a back-pointer equal to the tag size, so parse →
//! write reproduces the input byte for byte.

use std::io::{self, Write};

use crate::encode;
use crate::header::FlvHeader;
use crate::tag::FlvTag;

pub struct FlvWriter<W> {
    inner: W,
    bytes_written: u64,
}

impl<W: Write> FlvWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            bytes_written: 0,
        }
    }

    /// Total bytes emitted so far. The analyser uses this as the file
    /// position for the keyframe index.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Write the file header followed by PreviousTagSize0.
    pub fn write_header(&mut self, header: &FlvHeader) -> io::Result<()> {
        let bytes = encode::encode_header_bytes(header)?;
        self.inner.write_all(&bytes)?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    /// Write one tag and its back-pointer. Returns the byte offset at which
    /// the tag starts.
    pub fn write_tag(&mut self, tag: &FlvTag) -> io::Result<u64> {
        let offset = self.bytes_written;

        let header = encode::encode_tag_header_bytes(
            tag.tag_type,
            tag.data.len() as u32,
            tag.timestamp_ms,
            tag.stream_id,
        )?;
        self.inner.write_all(&header)?;
        self.inner.write_all(&tag.data)?;

        let back_pointer = encode::encode_prev_tag_size_bytes(tag.size() as u32);
        self.inner.write_all(&back_pointer)?;

        self.bytes_written += (tag.size() + back_pointer.len()) as u64;
        Ok(offset)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::FlvTagType;
    use bytes::Bytes;

    #[test]
    fn test_back_pointer_equals_tag_size() {
        let mut writer = FlvWriter::new(Vec::new());
        writer.write_header(&FlvHeader::new(false, true)).unwrap();

        let tag = FlvTag {
            timestamp_ms: 42,
            stream_id: 0,
            tag_type: FlvTagType::Video,
            data: Bytes::from_static(&[0x27, 0x01, 0x00, 0x00, 0x00, 0xAA, 0xBB]),
        };
        let offset = writer.write_tag(&tag).unwrap();
        assert_eq!(offset, 13);

        let bytes = writer.into_inner();
        let back_pointer = u32::from_be_bytes(bytes[bytes.len() - 4..].try_into().unwrap());
        assert_eq!(back_pointer, tag.size() as u32);
        assert_eq!(back_pointer, 11 + 7);
    }

    #[test]
    fn test_header_emits_zero_back_pointer() {
        let mut writer = FlvWriter::new(Vec::new());
        writer.write_header(&FlvHeader::new(true, true)).unwrap();
        let bytes = writer.into_inner();
        assert_eq!(bytes.len(), 13);
        assert_eq!(&bytes[9..], &[0, 0, 0, 0]);
        assert_eq!(&bytes[0..3], b"FLV");
        assert_eq!(bytes[4], 0x05);
    }
}
