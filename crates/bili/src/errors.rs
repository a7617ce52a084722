use thiserror::Error;

use crate::models::{QualityNumber, StreamCodec, StreamFormat};

pub type Result<T, E = BiliError> = std::result::Result<T, E>;

/// Errors from the playback REST API.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The endpoint answered with a non-zero business code.
    #[error("api request error: code {code}, message: {message}")]
    Request { code: i64, message: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected response shape: {0}")]
    Malformed(String),
}

/// Errors while resolving a live stream URL. The variants encode the
/// fallback ladder: quality errors retry at 10000, format errors walk
/// fmp4 -> ts -> flv, codec and network errors retry as-is, room state
/// errors are terminal.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("no stream available ({format}/{codec}/{quality})")]
    NoStreamAvailable {
        format: StreamFormat,
        codec: StreamCodec,
        quality: QualityNumber,
    },

    #[error("no stream format available ({format}/{codec}/{quality})")]
    NoStreamFormatAvailable {
        format: StreamFormat,
        codec: StreamCodec,
        quality: QualityNumber,
    },

    #[error("no stream codec available ({format}/{codec}/{quality})")]
    NoStreamCodecAvailable {
        format: StreamFormat,
        codec: StreamCodec,
        quality: QualityNumber,
    },

    #[error("no stream quality available ({format}/{codec}/{quality})")]
    NoStreamQualityAvailable {
        format: StreamFormat,
        codec: StreamCodec,
        quality: QualityNumber,
    },

    #[error("no alternative stream available ({format}/{codec}/{quality})")]
    NoAlternativeStreamAvailable {
        format: StreamFormat,
        codec: StreamCodec,
        quality: QualityNumber,
    },

    #[error("live room is hidden")]
    RoomHidden,

    #[error("live room is locked")]
    RoomLocked,

    #[error("live room is encrypted")]
    RoomEncrypted,

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl StreamError {
    /// Room-state errors cannot be retried around.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamError::RoomHidden | StreamError::RoomLocked | StreamError::RoomEncrypted
        )
    }
}

/// Errors from the chat WebSocket client.
#[derive(Debug, Error)]
pub enum WsError {
    /// AUTH_REPLY carried code -101: the token expired and danmu info must
    /// be refreshed.
    #[error("authentication token expired")]
    TokenExpired,

    #[error("authentication failed with code {0}")]
    AuthFailed(i64),

    #[error("read timed out")]
    ReadTimeout,

    #[error("websocket closed")]
    Closed,

    #[error("unexpected frame: {0}")]
    UnexpectedFrame(String),

    #[error("frame decode error: {0}")]
    Decode(String),

    #[error("retries exhausted after {0} attempts")]
    RetriesExhausted(usize),

    #[error("websocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Umbrella error for callers that do not care about the subsystem.
#[derive(Debug, Error)]
pub enum BiliError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Ws(#[from] WsError),
}
