use thiserror::Error;

/// Errors produced while reading or writing FLV streams.
#[derive(Debug, Error)]
pub enum FlvError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed data inside an otherwise well-framed tag.
    #[error("FLV data error: {0}")]
    DataError(String),

    /// The byte stream itself is broken (bad signature, impossible sizes,
    /// truncated framing). Recovery requires a new stream.
    #[error("FLV stream corrupted: {0}")]
    StreamCorrupted(String),

    /// The Filter bit is set; encrypted payloads are not supported.
    #[error("encrypted FLV tag (filter bit set) at timestamp {0}ms")]
    FilteredTag(u32),
}

impl FlvError {
    /// Whether the error invalidates the remainder of the byte stream.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FlvError::StreamCorrupted(_) | FlvError::Io(_))
    }
}
