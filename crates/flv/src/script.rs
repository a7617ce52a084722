//! FLV script tag payloads.
//!
//! Script tags carry a method name and AMF0-encoded arguments. The only
//! name that matters for recording is `onMetaData`; `onJoinPoint` is a
//! private name used to mark reconnect seams inside recorded streams.

use std::io;

use amf0::{Amf0Decoder, Amf0Encoder, Amf0Marker, Amf0Value};

/// The standard metadata script name.
pub const ON_METADATA: &str = "onMetaData";

/// Private script name marking a reconnect seam inside a recording.
pub const ON_JOIN_POINT: &str = "onJoinPoint";

/// A decoded script tag payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptData {
    /// The method name, e.g. `onMetaData`
    pub name: String,
    /// The AMF0 arguments following the name
    pub data: Vec<Amf0Value<'static>>,
}

impl ScriptData {
    /// Parse a script tag body.
    pub fn parse(data: &[u8]) -> io::Result<Self> {
        let mut reader = Amf0Decoder::new(data);

        let name = match reader.decode_with_type(Amf0Marker::String) {
            Ok(Amf0Value::String(name)) => name.into_owned(),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "invalid script data name",
                ));
            }
        };

        let (values, err) = reader.decode_all();
        if let Some(err) = err {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid script data body: {err}"),
            ));
        }

        Ok(Self {
            name,
            data: values.into_iter().map(|v| v.to_owned()).collect(),
        })
    }

    /// Serialize back into a script tag body.
    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        Amf0Encoder::encode_string(&mut out, &self.name)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        for value in &self.data {
            Amf0Encoder::encode(&mut out, value)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        }
        Ok(out)
    }

    /// The first argument, which for `onMetaData` is the metadata
    /// object/array.
    pub fn value(&self) -> Option<&Amf0Value<'static>> {
        self.data.first()
    }

    pub fn is_metadata(&self) -> bool {
        self.name == ON_METADATA
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_on_metadata() {
        let mut body = vec![0x02, 0x00, 0x0A];
        body.extend_from_slice(b"onMetaData");
        body.push(0x05);

        let script = ScriptData::parse(&body).unwrap();
        assert_eq!(script.name, "onMetaData");
        assert!(script.is_metadata());
        assert_eq!(script.data, vec![Amf0Value::Null]);
    }

    #[test]
    fn test_round_trip_preserves_bytes() {
        let script = ScriptData {
            name: ON_METADATA.to_string(),
            data: vec![Amf0Value::EcmaArray(
                vec![
                    ("duration".into(), Amf0Value::Number(0.0)),
                    ("width".into(), Amf0Value::Number(1920.0)),
                    ("height".into(), Amf0Value::Number(1080.0)),
                ]
                .into(),
            )],
        };

        let bytes = script.to_bytes().unwrap();
        let parsed = ScriptData::parse(&bytes).unwrap();
        assert_eq!(parsed, script);
        assert_eq!(parsed.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_missing_name_rejected() {
        // Body starts with a number marker instead of a string name.
        let mut body = vec![0x00];
        body.extend_from_slice(&1.0_f64.to_be_bytes());
        assert!(ScriptData::parse(&body).is_err());
    }
}
