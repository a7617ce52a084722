use std::io;
use std::str::Utf8Error;

use thiserror::Error;

use crate::Amf0Marker;

/// Errors produced while decoding AMF0 data.
#[derive(Debug, Error)]
pub enum Amf0ReadError {
    /// A marker byte that is not defined by the AMF0 specification.
    #[error("unknown marker: {0}")]
    UnknownMarker(u8),
    /// A marker that is defined but that this decoder does not handle.
    #[error("unsupported type: {0:?}")]
    UnsupportedType(Amf0Marker),
    /// A string payload was not valid UTF-8.
    #[error("string parse error: {0}")]
    StringParseError(#[from] Utf8Error),
    /// The decoded marker did not match the caller's expectation.
    #[error("wrong type: expected {expected:?}, got {got:?}")]
    WrongType {
        /// The expected marker.
        expected: Amf0Marker,
        /// The marker actually found.
        got: Amf0Marker,
    },
    /// Underlying reader failure or truncated input.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Errors produced while encoding AMF0 data.
#[derive(Debug, Error)]
pub enum Amf0WriteError {
    /// A normal string longer than a u16 length prefix allows.
    #[error("normal string too long")]
    NormalStringTooLong,
    /// A value that this encoder does not handle.
    #[error("unsupported type: {0:?}")]
    UnsupportedType(Amf0Marker),
    /// Underlying writer failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
