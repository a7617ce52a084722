use thiserror::Error;

#[derive(Debug, Error)]
pub enum HlsError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("playlist error: {0}")]
    Playlist(String),

    #[error("segment size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("segment crc32 mismatch: expected {expected:08x}, got {actual:08x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("remux failed: {0}")]
    Remux(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel closed")]
    ChannelClosed,

    #[error("cancelled")]
    Cancelled,
}

impl HlsError {
    /// Structural errors mean the bytes are wrong; the fetch may be retried
    /// but a persistent mismatch calls for a different stream.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            HlsError::SizeMismatch { .. } | HlsError::CrcMismatch { .. }
        )
    }
}
