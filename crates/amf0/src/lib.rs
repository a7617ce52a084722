//! A small AMF0 encoder and decoder.
//!
//! Covers the subset of AMF0 that appears in FLV `onMetaData` script tags:
//! number, boolean, string, long string, object, null, undefined, reference,
//! ecma array, strict array and date. Object properties preserve insertion
//! order, so re-encoding a decoded value reproduces the original bytes.
//!
//! ```rust
//! # fn test() -> Result<(), Box<dyn std::error::Error>> {
//! use amf0::{Amf0Decoder, Amf0Encoder};
//! # let bytes = &[0x01, 0x01];
//! # let mut writer = Vec::new();
//! let mut reader = Amf0Decoder::new(bytes);
//! let value = reader.decode()?;
//! Amf0Encoder::encode(&mut writer, &value)?;
//! # assert_eq!(writer, bytes);
//! # Ok(())
//! # }
//! # test().expect("test failed");
//! ```

mod decode;
mod define;
mod encode;
mod errors;

pub use crate::decode::Amf0Decoder;
pub use crate::define::{Amf0Marker, Amf0Value};
pub use crate::encode::Amf0Encoder;
pub use crate::errors::{Amf0ReadError, Amf0WriteError};
