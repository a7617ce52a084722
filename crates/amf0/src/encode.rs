use std::borrow::Cow;
use std::io;

use byteorder::{BigEndian, WriteBytesExt};

use super::define::Amf0Marker;
use super::{Amf0Value, Amf0WriteError};

/// Write an AMF property key (u16 length prefix + raw bytes).
macro_rules! write_amf_property_key {
    ($writer:expr, $key:expr) => {
        $writer.write_u16::<BigEndian>($key.len() as u16)?;
        $writer.write_all($key.as_bytes())?;
    };
}

/// AMF0 encoder.
///
/// The encoder is the exact inverse of [`crate::Amf0Decoder`]: encoding a
/// decoded value reproduces the bytes it was decoded from.
pub struct Amf0Encoder;

impl Amf0Encoder {
    /// Encode a generic AMF0 value.
    pub fn encode(writer: &mut impl io::Write, value: &Amf0Value) -> Result<(), Amf0WriteError> {
        match value {
            Amf0Value::Number(val) => Self::encode_number(writer, *val),
            Amf0Value::Boolean(val) => Self::encode_bool(writer, *val),
            Amf0Value::String(val) => Self::encode_string(writer, val),
            Amf0Value::Object(val) => Self::encode_object(writer, val),
            Amf0Value::Null => Self::encode_null(writer),
            Amf0Value::Undefined => Self::encode_undefined(writer),
            Amf0Value::Reference(idx) => Self::encode_reference(writer, *idx),
            Amf0Value::EcmaArray(val) => Self::encode_ecma_array(writer, val),
            Amf0Value::StrictArray(val) => Self::encode_strict_array(writer, val),
            Amf0Value::Date {
                timestamp,
                timezone,
            } => Self::encode_date(writer, *timestamp, *timezone),
            Amf0Value::LongString(val) => Self::encode_long_string(writer, val),
        }
    }

    /// Write the object-end marker sequence (u24 0x000009).
    pub fn object_eof(writer: &mut impl io::Write) -> Result<(), Amf0WriteError> {
        writer.write_u24::<BigEndian>(Amf0Marker::ObjectEnd as u32)?;
        Ok(())
    }

    /// Encode an AMF0 number.
    pub fn encode_number(writer: &mut impl io::Write, value: f64) -> Result<(), Amf0WriteError> {
        writer.write_u8(Amf0Marker::Number as u8)?;
        writer.write_f64::<BigEndian>(value)?;
        Ok(())
    }

    /// Encode an AMF0 boolean.
    pub fn encode_bool(writer: &mut impl io::Write, value: bool) -> Result<(), Amf0WriteError> {
        writer.write_u8(Amf0Marker::Boolean as u8)?;
        writer.write_u8(value as u8)?;
        Ok(())
    }

    /// Encode an AMF0 string.
    pub fn encode_string(writer: &mut impl io::Write, value: &str) -> Result<(), Amf0WriteError> {
        if value.len() > (u16::MAX as usize) {
            return Err(Amf0WriteError::NormalStringTooLong);
        }

        writer.write_u8(Amf0Marker::String as u8)?;
        write_amf_property_key!(writer, value);
        Ok(())
    }

    /// Encode an AMF0 long string.
    pub fn encode_long_string(
        writer: &mut impl io::Write,
        value: &str,
    ) -> Result<(), Amf0WriteError> {
        writer.write_u8(Amf0Marker::LongString as u8)?;
        writer.write_u32::<BigEndian>(value.len() as u32)?;
        writer.write_all(value.as_bytes())?;
        Ok(())
    }

    /// Encode an AMF0 null.
    pub fn encode_null(writer: &mut impl io::Write) -> Result<(), Amf0WriteError> {
        writer.write_u8(Amf0Marker::Null as u8)?;
        Ok(())
    }

    /// Encode an AMF0 undefined.
    pub fn encode_undefined(writer: &mut impl io::Write) -> Result<(), Amf0WriteError> {
        writer.write_u8(Amf0Marker::Undefined as u8)?;
        Ok(())
    }

    /// Encode an AMF0 reference.
    pub fn encode_reference(
        writer: &mut impl io::Write,
        index: u16,
    ) -> Result<(), Amf0WriteError> {
        writer.write_u8(Amf0Marker::Reference as u8)?;
        writer.write_u16::<BigEndian>(index)?;
        Ok(())
    }

    /// Encode an AMF0 object, preserving property order.
    pub fn encode_object(
        writer: &mut impl io::Write,
        properties: &[(Cow<'_, str>, Amf0Value<'_>)],
    ) -> Result<(), Amf0WriteError> {
        writer.write_u8(Amf0Marker::Object as u8)?;
        for (key, value) in properties {
            write_amf_property_key!(writer, key);
            Self::encode(writer, value)?;
        }

        Self::object_eof(writer)?;
        Ok(())
    }

    /// Encode an AMF0 ecma array, preserving property order.
    pub fn encode_ecma_array(
        writer: &mut impl io::Write,
        properties: &[(Cow<'_, str>, Amf0Value<'_>)],
    ) -> Result<(), Amf0WriteError> {
        writer.write_u8(Amf0Marker::EcmaArray as u8)?;
        writer.write_u32::<BigEndian>(properties.len() as u32)?;
        for (key, value) in properties {
            write_amf_property_key!(writer, key);
            Self::encode(writer, value)?;
        }

        // Associative arrays also terminate with the object-end sequence.
        Self::object_eof(writer)?;
        Ok(())
    }

    /// Encode an AMF0 strict array.
    pub fn encode_strict_array(
        writer: &mut impl io::Write,
        values: &[Amf0Value<'_>],
    ) -> Result<(), Amf0WriteError> {
        writer.write_u8(Amf0Marker::StrictArray as u8)?;
        writer.write_u32::<BigEndian>(values.len() as u32)?;
        for value in values {
            Self::encode(writer, value)?;
        }
        Ok(())
    }

    /// Encode an AMF0 date (f64 milliseconds + i16 timezone).
    pub fn encode_date(
        writer: &mut impl io::Write,
        timestamp: f64,
        timezone: i16,
    ) -> Result<(), Amf0WriteError> {
        writer.write_u8(Amf0Marker::Date as u8)?;
        writer.write_f64::<BigEndian>(timestamp)?;
        writer.write_i16::<BigEndian>(timezone)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_number() {
        let mut expected = vec![0x00];
        expected.extend_from_slice(&772.161_f64.to_be_bytes());

        let mut buf = Vec::<u8>::new();
        Amf0Encoder::encode_number(&mut buf, 772.161).unwrap();
        assert_eq!(buf, expected);
    }

    #[test]
    fn test_write_string() {
        let mut buf = Vec::<u8>::new();
        Amf0Encoder::encode_string(&mut buf, "Hello World").unwrap();

        let mut expected = vec![0x02, 0x00, 0x0b];
        expected.extend_from_slice(b"Hello World");
        assert_eq!(buf, expected);
    }

    #[test]
    fn test_write_object_terminates_with_eof_marker() {
        let mut buf = Vec::<u8>::new();
        Amf0Encoder::encode_object(&mut buf, &[("test".into(), Amf0Value::Null)]).unwrap();

        let mut expected = vec![0x03, 0x00, 0x04];
        expected.extend_from_slice(b"test");
        expected.push(0x05);
        expected.extend_from_slice(&[0x00, 0x00, 0x09]);
        assert_eq!(buf, expected);
    }

    #[test]
    fn test_oversized_string_rejected() {
        let long = "x".repeat(u16::MAX as usize + 1);
        let mut buf = Vec::<u8>::new();
        let result = Amf0Encoder::encode_string(&mut buf, &long);
        assert!(matches!(result, Err(Amf0WriteError::NormalStringTooLong)));
    }
}
