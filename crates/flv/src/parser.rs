//! Synchronous FLV stream parsing.
//!
//! [`FlvStreamParser`] pulls `FlvData` items out of any `Read`, which is how
//! the recorder consumes the HTTP byte stream: the reader side blocks on the
//! network while the iterator hands tags to the processing chain.

use std::io::{self, Read};

use bytes::{Bytes, BytesMut};

use crate::data::FlvData;
use crate::error::FlvError;
use crate::framing;
use crate::header::FlvHeader;
use crate::tag::FlvTag;

/// How to treat the PreviousTagSize field while parsing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PrevTagSizeMode {
    /// Ignore mismatches (fastest, most tolerant).
    #[default]
    Ignore,
    /// Log mismatches but continue parsing.
    Warn,
    /// Treat any mismatch as a corrupted stream.
    Strict,
}

/// How to treat a tag truncated by end-of-stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EofMode {
    /// A truncated trailing tag ends the stream silently. Live captures are
    /// almost always cut off mid-tag.
    #[default]
    Tolerant,
    /// A truncated trailing tag is an error.
    Strict,
}

/// Stateless helpers for parsing FLV pieces.
pub struct FlvParser;

impl FlvParser {
    pub fn parse_header<R: Read>(reader: &mut R) -> io::Result<FlvHeader> {
        FlvHeader::parse(reader)
    }

    /// Parse a single tag (header + body). Returns `None` on clean EOF.
    pub fn parse_tag<R: Read>(reader: &mut R) -> Result<Option<FlvTag>, FlvError> {
        let mut header_bytes = [0u8; framing::TAG_HEADER_SIZE];
        match reader.read_exact(&mut header_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let header = framing::parse_tag_header_bytes(header_bytes)?;
        if header.is_filtered {
            return Err(FlvError::FilteredTag(header.timestamp_ms));
        }

        let mut body = BytesMut::zeroed(header.data_size as usize);
        match reader.read_exact(&mut body) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        Ok(Some(FlvTag {
            timestamp_ms: header.timestamp_ms,
            stream_id: header.stream_id,
            tag_type: header.tag_type,
            data: body.freeze(),
        }))
    }
}

/// An iterator over the `FlvData` items of a byte stream.
pub struct FlvStreamParser<R> {
    reader: R,
    prev_tag_size_mode: PrevTagSizeMode,
    eof_mode: EofMode,
    header_parsed: bool,
    expected_prev_tag_size: u32,
    finished: bool,
}

impl<R: Read> FlvStreamParser<R> {
    pub fn new(reader: R) -> Self {
        Self::with_modes(reader, PrevTagSizeMode::default(), EofMode::default())
    }

    pub fn with_modes(reader: R, prev_tag_size_mode: PrevTagSizeMode, eof_mode: EofMode) -> Self {
        Self {
            reader,
            prev_tag_size_mode,
            eof_mode,
            header_parsed: false,
            expected_prev_tag_size: 0,
            finished: false,
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    fn next_item(&mut self) -> Result<Option<FlvData>, FlvError> {
        if !self.header_parsed {
            let header = FlvParser::parse_header(&mut self.reader).map_err(|e| {
                if e.kind() == io::ErrorKind::InvalidData {
                    FlvError::StreamCorrupted(e.to_string())
                } else {
                    FlvError::Io(e)
                }
            })?;
            self.header_parsed = true;
            self.expected_prev_tag_size = 0;
            return Ok(Some(FlvData::Header(header)));
        }

        // PreviousTagSize precedes every tag.
        let mut prev_buf = [0u8; framing::PREV_TAG_SIZE_FIELD_SIZE];
        match self.reader.read_exact(&mut prev_buf) {
            Ok(()) => {
                let prev_tag_size = framing::parse_prev_tag_size(prev_buf);
                if prev_tag_size != self.expected_prev_tag_size {
                    match self.prev_tag_size_mode {
                        PrevTagSizeMode::Ignore => {}
                        PrevTagSizeMode::Warn => {
                            tracing::debug!(
                                expected = self.expected_prev_tag_size,
                                got = prev_tag_size,
                                "PreviousTagSize mismatch"
                            );
                        }
                        PrevTagSizeMode::Strict => {
                            return Err(FlvError::StreamCorrupted(format!(
                                "PreviousTagSize mismatch (expected {}, got {prev_tag_size})",
                                self.expected_prev_tag_size
                            )));
                        }
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        match FlvParser::parse_tag(&mut self.reader)? {
            Some(tag) => {
                self.expected_prev_tag_size = tag.size() as u32;
                Ok(Some(FlvData::Tag(tag)))
            }
            None => {
                if self.eof_mode == EofMode::Strict {
                    Err(FlvError::StreamCorrupted(
                        "stream truncated mid-tag".to_string(),
                    ))
                } else {
                    Ok(None)
                }
            }
        }
    }
}

impl<R: Read> Iterator for FlvStreamParser<R> {
    type Item = Result<FlvData, FlvError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_item() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Parse an in-memory FLV buffer into its items. Used by the postprocessor's
/// validity scan and by tests.
pub fn parse_all(data: &[u8]) -> Result<Vec<FlvData>, FlvError> {
    FlvStreamParser::new(io::Cursor::new(Bytes::copy_from_slice(data))).collect()
}
