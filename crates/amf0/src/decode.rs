use std::borrow::Cow;
use std::io;

use super::{Amf0Marker, Amf0ReadError, Amf0Value};

/// An AMF0 decoder.
///
/// The decoder reads from a borrowed byte slice and returns values that
/// borrow from it, so decoding a script tag does not copy the payload.
pub struct Amf0Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Amf0Decoder<'a> {
    /// Create a new AMF0 decoder.
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Check if the decoder has reached the end of the AMF0 data.
    pub const fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], Amf0ReadError> {
        let end = self.pos + len;
        if end > self.data.len() {
            return Err(Amf0ReadError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "not enough data",
            )));
        }
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn read_u8(&mut self) -> Result<u8, Amf0ReadError> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16_be(&mut self) -> Result<u16, Amf0ReadError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_u24_be(&mut self) -> Result<u32, Amf0ReadError> {
        let bytes = self.read_bytes(3)?;
        Ok(u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]))
    }

    fn read_u32_be(&mut self) -> Result<u32, Amf0ReadError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_i16_be(&mut self) -> Result<i16, Amf0ReadError> {
        let bytes = self.read_bytes(2)?;
        Ok(i16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_f64_be(&mut self) -> Result<f64, Amf0ReadError> {
        let bytes = self.read_bytes(8)?;
        Ok(f64::from_be_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    /// Read all the encoded values from the decoder.
    /// Returns both successfully decoded values and any error that occurred.
    pub fn decode_all(&mut self) -> (Vec<Amf0Value<'a>>, Option<Amf0ReadError>) {
        let mut results = vec![];

        while !self.is_empty() {
            match self.decode() {
                Ok(value) => results.push(value),
                Err(err) => return (results, Some(err)),
            }
        }

        (results, None)
    }

    /// Read the next encoded value from the decoder.
    pub fn decode(&mut self) -> Result<Amf0Value<'a>, Amf0ReadError> {
        let marker_byte = self.read_u8()?;
        let marker = Amf0Marker::try_from(marker_byte).map_err(Amf0ReadError::UnknownMarker)?;

        match marker {
            Amf0Marker::Number => Ok(Amf0Value::Number(self.read_f64_be()?)),
            Amf0Marker::Boolean => Ok(Amf0Value::Boolean(self.read_u8()? > 0)),
            Amf0Marker::String => Ok(Amf0Value::String(self.read_string()?)),
            Amf0Marker::Object => Ok(Amf0Value::Object(self.read_object()?.into())),
            Amf0Marker::Null => Ok(Amf0Value::Null),
            Amf0Marker::Undefined => Ok(Amf0Value::Undefined),
            Amf0Marker::Reference => Ok(Amf0Value::Reference(self.read_u16_be()?)),
            Amf0Marker::EcmaArray => Ok(Amf0Value::EcmaArray(self.read_ecma_array()?.into())),
            Amf0Marker::StrictArray => Ok(Amf0Value::StrictArray(self.read_strict_array()?.into())),
            Amf0Marker::Date => self.read_date(),
            Amf0Marker::LongString => Ok(Amf0Value::LongString(self.read_long_string()?)),
            _ => Err(Amf0ReadError::UnsupportedType(marker)),
        }
    }

    /// Read the next encoded value and check that it matches the specified
    /// marker.
    pub fn decode_with_type(
        &mut self,
        specified_marker: Amf0Marker,
    ) -> Result<Amf0Value<'a>, Amf0ReadError> {
        if self.pos >= self.data.len() {
            return Err(Amf0ReadError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "not enough data",
            )));
        }

        let marker_byte = self.data[self.pos];
        let marker = Amf0Marker::try_from(marker_byte).map_err(Amf0ReadError::UnknownMarker)?;

        if marker != specified_marker {
            return Err(Amf0ReadError::WrongType {
                expected: specified_marker,
                got: marker,
            });
        }

        self.decode()
    }

    fn read_string(&mut self) -> Result<Cow<'a, str>, Amf0ReadError> {
        let len = self.read_u16_be()? as usize;
        let bytes = self.read_bytes(len)?;
        Ok(Cow::Borrowed(std::str::from_utf8(bytes)?))
    }

    fn read_long_string(&mut self) -> Result<Cow<'a, str>, Amf0ReadError> {
        let len = self.read_u32_be()? as usize;
        let bytes = self.read_bytes(len)?;
        Ok(Cow::Borrowed(std::str::from_utf8(bytes)?))
    }

    fn is_read_object_eof(&mut self) -> Result<bool, Amf0ReadError> {
        if self.pos + 3 > self.data.len() {
            return Ok(false);
        }

        let saved_pos = self.pos;
        let value = self.read_u24_be()?;

        if Amf0Marker::is_object_end_u24(value) {
            Ok(true)
        } else {
            self.pos = saved_pos;
            Ok(false)
        }
    }

    fn read_object(&mut self) -> Result<Vec<(Cow<'a, str>, Amf0Value<'a>)>, Amf0ReadError> {
        let mut properties = Vec::new();

        loop {
            if self.is_read_object_eof()? {
                break;
            }

            let key = self.read_string()?;
            let val = self.decode()?;

            properties.push((key, val));
        }

        Ok(properties)
    }

    fn read_ecma_array(&mut self) -> Result<Vec<(Cow<'a, str>, Amf0Value<'a>)>, Amf0ReadError> {
        let len = self.read_u32_be()?;

        let mut properties = Vec::new();

        for _ in 0..len {
            let key = self.read_string()?;
            let val = self.decode()?;
            properties.push((key, val));
        }

        // Some muxers omit the trailing object-end sequence after the declared
        // count; consume it when present.
        let _ = self.is_read_object_eof()?;

        Ok(properties)
    }

    fn read_strict_array(&mut self) -> Result<Vec<Amf0Value<'a>>, Amf0ReadError> {
        let len = self.read_u32_be()?;

        let mut values = Vec::with_capacity(len as usize);

        for _ in 0..len {
            values.push(self.decode()?);
        }

        Ok(values)
    }

    fn read_date(&mut self) -> Result<Amf0Value<'a>, Amf0ReadError> {
        let timestamp = self.read_f64_be()?;
        let timezone = self.read_i16_be()?;
        Ok(Amf0Value::Date {
            timestamp,
            timezone,
        })
    }
}

impl<'a> Iterator for Amf0Decoder<'a> {
    type Item = Result<Amf0Value<'a>, Amf0ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_empty() {
            return None;
        }

        Some(self.decode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Amf0Encoder;

    #[test]
    fn test_reader_bool() {
        let amf0_bool = vec![0x01, 0x01];
        let mut amf_reader = Amf0Decoder::new(&amf0_bool);
        let value = amf_reader.decode_with_type(Amf0Marker::Boolean).unwrap();
        assert_eq!(value, Amf0Value::Boolean(true));
    }

    #[test]
    fn test_reader_number() {
        let mut amf0_number = vec![0x00];
        amf0_number.extend_from_slice(&772.161_f64.to_be_bytes());

        let mut amf_reader = Amf0Decoder::new(&amf0_number);
        let value = amf_reader.decode_with_type(Amf0Marker::Number).unwrap();
        assert_eq!(value, Amf0Value::Number(772.161));
    }

    #[test]
    fn test_reader_string() {
        let mut amf0_string = vec![0x02, 0x00, 0x0b];
        amf0_string.extend_from_slice(b"Hello World");

        let mut amf_reader = Amf0Decoder::new(&amf0_string);
        let value = amf_reader.decode_with_type(Amf0Marker::String).unwrap();
        assert_eq!(value, Amf0Value::String(Cow::Borrowed("Hello World")));
    }

    #[test]
    fn test_reader_object_preserves_order() {
        let mut amf0_object = vec![0x03];
        for key in ["zz", "aa", "mm"] {
            amf0_object.extend_from_slice(&[0x00, 0x02]);
            amf0_object.extend_from_slice(key.as_bytes());
            amf0_object.push(0x05);
        }
        amf0_object.extend_from_slice(&[0x00, 0x00, 0x09]);

        let mut amf_reader = Amf0Decoder::new(&amf0_object);
        let value = amf_reader.decode_with_type(Amf0Marker::Object).unwrap();

        let keys: Vec<_> = value
            .properties()
            .unwrap()
            .iter()
            .map(|(k, _)| k.as_ref().to_string())
            .collect();
        assert_eq!(keys, ["zz", "aa", "mm"]);
    }

    #[test]
    fn test_reader_ecma_array_with_and_without_object_end() {
        let mut body = vec![0x08, 0x00, 0x00, 0x00, 0x01];
        body.extend_from_slice(&[0x00, 0x04]);
        body.extend_from_slice(b"test");
        body.push(0x05);

        let expected = Amf0Value::EcmaArray(vec![("test".into(), Amf0Value::Null)].into());

        let mut reader = Amf0Decoder::new(&body);
        assert_eq!(reader.decode().unwrap().to_owned(), expected);

        body.extend_from_slice(&[0x00, 0x00, 0x09]);
        let mut reader = Amf0Decoder::new(&body);
        assert_eq!(reader.decode().unwrap().to_owned(), expected);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_reader_reference() {
        let amf0_ref = vec![0x07, 0x00, 0x03];
        let mut amf_reader = Amf0Decoder::new(&amf0_ref);
        assert_eq!(amf_reader.decode().unwrap(), Amf0Value::Reference(3));
    }

    #[test]
    fn test_reader_invalid_marker() {
        let amf0_unsupported_marker = vec![Amf0Marker::Unsupported as u8];
        let mut amf_reader = Amf0Decoder::new(&amf0_unsupported_marker);
        let result = amf_reader.decode();

        assert!(matches!(
            result,
            Err(Amf0ReadError::UnsupportedType(Amf0Marker::Unsupported))
        ));
    }

    #[test]
    fn test_truncated_input_returns_error() {
        let truncated = vec![0x00, 0x40, 0x59, 0x00];
        let mut reader = Amf0Decoder::new(&truncated);
        assert!(matches!(reader.decode(), Err(Amf0ReadError::Io(_))));

        let truncated_str = vec![0x02, 0x00, 0x0b, b'H', b'e', b'l'];
        let mut reader = Amf0Decoder::new(&truncated_str);
        assert!(matches!(reader.decode(), Err(Amf0ReadError::Io(_))));
    }

    // dump(load(bytes)) == bytes over every value type that appears in
    // onMetaData payloads.
    #[test]
    fn test_metadata_round_trip_is_byte_exact() {
        let value = Amf0Value::EcmaArray(
            vec![
                ("duration".into(), Amf0Value::Number(120.5)),
                ("hasVideo".into(), Amf0Value::Boolean(true)),
                ("title".into(), Amf0Value::String("live".into())),
                (
                    "description".into(),
                    Amf0Value::LongString("a long description".into()),
                ),
                (
                    "keyframes".into(),
                    Amf0Value::Object(
                        vec![
                            (
                                "times".into(),
                                Amf0Value::StrictArray(
                                    vec![Amf0Value::Number(0.0), Amf0Value::Number(4.2)].into(),
                                ),
                            ),
                            (
                                "filepositions".into(),
                                Amf0Value::StrictArray(
                                    vec![Amf0Value::Number(13.0), Amf0Value::Number(1024.0)]
                                        .into(),
                                ),
                            ),
                        ]
                        .into(),
                    ),
                ),
                (
                    "datetime".into(),
                    Amf0Value::Date {
                        timestamp: 1234567890.0,
                        timezone: 0,
                    },
                ),
                ("extra".into(), Amf0Value::Null),
            ]
            .into(),
        );

        let mut bytes = Vec::new();
        Amf0Encoder::encode(&mut bytes, &value).unwrap();

        let mut decoder = Amf0Decoder::new(&bytes);
        let decoded = decoder.decode().unwrap();
        assert!(decoder.is_empty());
        assert_eq!(decoded, value);

        let mut re_encoded = Vec::new();
        Amf0Encoder::encode(&mut re_encoded, &decoded).unwrap();
        assert_eq!(re_encoded, bytes);
    }
}
