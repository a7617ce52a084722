use std::borrow::Cow;

/// AMF0 marker bytes.
/// Defined in amf0_spec_121207.pdf section 2.1
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum Amf0Marker {
    /// number-marker
    Number = 0x00,
    /// boolean-marker
    Boolean = 0x01,
    /// string-marker
    String = 0x02,
    /// object-marker
    Object = 0x03,
    /// movieclip-marker (reserved, not supported)
    MovieClipMarker = 0x04,
    /// null-marker
    Null = 0x05,
    /// undefined-marker
    Undefined = 0x06,
    /// reference-marker
    Reference = 0x07,
    /// ecma-array-marker
    EcmaArray = 0x08,
    /// object-end-marker
    ObjectEnd = 0x09,
    /// strict-array-marker
    StrictArray = 0x0a,
    /// date-marker
    Date = 0x0b,
    /// long-string-marker
    LongString = 0x0c,
    /// unsupported-marker
    Unsupported = 0x0d,
    /// recordset-marker (reserved, not supported)
    Recordset = 0x0e,
    /// xml-document-marker
    XmlDocument = 0x0f,
    /// typed-object-marker
    TypedObject = 0x10,
    /// avmplus-object-marker (AMF3 escape)
    AVMPlusObject = 0x11,
}

impl TryFrom<u8> for Amf0Marker {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0x00 => Ok(Self::Number),
            0x01 => Ok(Self::Boolean),
            0x02 => Ok(Self::String),
            0x03 => Ok(Self::Object),
            0x04 => Ok(Self::MovieClipMarker),
            0x05 => Ok(Self::Null),
            0x06 => Ok(Self::Undefined),
            0x07 => Ok(Self::Reference),
            0x08 => Ok(Self::EcmaArray),
            0x09 => Ok(Self::ObjectEnd),
            0x0a => Ok(Self::StrictArray),
            0x0b => Ok(Self::Date),
            0x0c => Ok(Self::LongString),
            0x0d => Ok(Self::Unsupported),
            0x0e => Ok(Self::Recordset),
            0x0f => Ok(Self::XmlDocument),
            0x10 => Ok(Self::TypedObject),
            0x11 => Ok(Self::AVMPlusObject),
            other => Err(other),
        }
    }
}

impl Amf0Marker {
    /// Check if a u24 value is the object-end marker sequence (0x000009).
    pub fn is_object_end_u24(value: u32) -> bool {
        value == 0x000009
    }
}

/// A decoded AMF0 value.
///
/// Object and ecma-array properties are kept as ordered key/value pairs so
/// that encoding reproduces the original byte layout.
#[derive(PartialEq, Clone, Debug)]
pub enum Amf0Value<'a> {
    /// Number type, section 2.2
    Number(f64),
    /// Boolean type, section 2.3
    Boolean(bool),
    /// String type, section 2.4
    String(Cow<'a, str>),
    /// Object type, section 2.5
    Object(Cow<'a, [(Cow<'a, str>, Amf0Value<'a>)]>),
    /// Null type, section 2.7
    Null,
    /// Undefined type, section 2.8
    Undefined,
    /// Reference type, section 2.9 (index into a reference table)
    Reference(u16),
    /// EcmaArray type, section 2.10
    EcmaArray(Cow<'a, [(Cow<'a, str>, Amf0Value<'a>)]>),
    /// StrictArray type, section 2.12
    StrictArray(Cow<'a, [Amf0Value<'a>]>),
    /// Date type, section 2.13
    Date {
        /// Milliseconds since the Unix epoch
        timestamp: f64,
        /// Timezone offset, reserved, should be 0x0000
        timezone: i16,
    },
    /// LongString type, section 2.14
    LongString(Cow<'a, str>),
}

impl<'a> Amf0Value<'a> {
    /// Get the marker of the value.
    pub fn marker(&self) -> Amf0Marker {
        match self {
            Self::Number(_) => Amf0Marker::Number,
            Self::Boolean(_) => Amf0Marker::Boolean,
            Self::String(_) => Amf0Marker::String,
            Self::Object(_) => Amf0Marker::Object,
            Self::Null => Amf0Marker::Null,
            Self::Undefined => Amf0Marker::Undefined,
            Self::Reference(_) => Amf0Marker::Reference,
            Self::EcmaArray(_) => Amf0Marker::EcmaArray,
            Self::StrictArray(_) => Amf0Marker::StrictArray,
            Self::Date { .. } => Amf0Marker::Date,
            Self::LongString(_) => Amf0Marker::LongString,
        }
    }

    /// The number payload, if this is a `Number`.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The string payload, if this is a `String` or `LongString`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::LongString(s) => Some(s.as_ref()),
            _ => None,
        }
    }

    /// The boolean payload, if this is a `Boolean`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// The ordered properties, if this is an `Object` or `EcmaArray`.
    pub fn properties(&self) -> Option<&[(Cow<'a, str>, Amf0Value<'a>)]> {
        match self {
            Self::Object(props) | Self::EcmaArray(props) => Some(props.as_ref()),
            _ => None,
        }
    }

    /// Look up a property by key in an `Object` or `EcmaArray`.
    pub fn get(&self, key: &str) -> Option<&Amf0Value<'a>> {
        self.properties()?
            .iter()
            .find(|(k, _)| k.as_ref() == key)
            .map(|(_, v)| v)
    }

    /// Get a deep-copied value with `'static` lifetime.
    pub fn to_owned(&self) -> Amf0Value<'static> {
        match self {
            Self::String(s) => Amf0Value::String(Cow::Owned(s.to_string())),
            Self::LongString(s) => Amf0Value::LongString(Cow::Owned(s.to_string())),
            Self::Object(o) => Amf0Value::Object(
                o.iter()
                    .map(|(k, v)| (Cow::Owned(k.to_string()), v.to_owned()))
                    .collect(),
            ),
            Self::EcmaArray(o) => Amf0Value::EcmaArray(
                o.iter()
                    .map(|(k, v)| (Cow::Owned(k.to_string()), v.to_owned()))
                    .collect(),
            ),
            Self::StrictArray(a) => {
                Amf0Value::StrictArray(a.iter().map(|v| v.to_owned()).collect())
            }
            Self::Number(n) => Amf0Value::Number(*n),
            Self::Boolean(b) => Amf0Value::Boolean(*b),
            Self::Null => Amf0Value::Null,
            Self::Undefined => Amf0Value::Undefined,
            Self::Reference(idx) => Amf0Value::Reference(*idx),
            Self::Date {
                timestamp,
                timezone,
            } => Amf0Value::Date {
                timestamp: *timestamp,
                timezone: *timezone,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker() {
        let cases = [
            (Amf0Value::Number(1.0), Amf0Marker::Number),
            (Amf0Value::Boolean(true), Amf0Marker::Boolean),
            (Amf0Value::String(Cow::Borrowed("test")), Amf0Marker::String),
            (Amf0Value::Null, Amf0Marker::Null),
            (Amf0Value::Undefined, Amf0Marker::Undefined),
            (
                Amf0Value::Date {
                    timestamp: 0.0,
                    timezone: 0,
                },
                Amf0Marker::Date,
            ),
            (
                Amf0Value::LongString(Cow::Borrowed("test")),
                Amf0Marker::LongString,
            ),
        ];

        for (value, marker) in cases {
            assert_eq!(value.marker(), marker);
        }
    }

    #[test]
    fn test_property_lookup() {
        let value = Amf0Value::EcmaArray(
            vec![
                ("duration".into(), Amf0Value::Number(12.5)),
                ("title".into(), Amf0Value::String("x".into())),
            ]
            .into(),
        );

        assert_eq!(
            value.get("duration").and_then(|v| v.as_number()),
            Some(12.5)
        );
        assert_eq!(value.get("title").and_then(|v| v.as_str()), Some("x"));
        assert!(value.get("missing").is_none());
    }

    #[test]
    fn test_to_owned_deep_copies() {
        let value = Amf0Value::Object(Cow::Borrowed(&[(
            Cow::Borrowed("test"),
            Amf0Value::LongString(Cow::Borrowed("test")),
        )]));
        let owned = value.to_owned();
        assert_eq!(
            owned,
            Amf0Value::Object(Cow::Owned(vec![(
                "test".to_string().into(),
                Amf0Value::LongString(Cow::Owned("test".to_string()))
            )]))
        );
    }
}
