//! Typed plaintext values and their tagged byte encoding.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroizing;

const TAG_TEXT: u8 = 0x01;
const TAG_INTEGER: u8 = 0x02;
const TAG_FLOAT: u8 = 0x03;
const TAG_BOOLEAN: u8 = 0x04;

/// A scalar value belonging to one column.
///
/// Serialized untagged, so JSON `"a@x.com"`, `42`, `1.5` and `true` map to the
/// obvious variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlaintextValue {
    /// Boolean
    Boolean(bool),
    /// Signed integer
    Integer(i64),
    /// Floating point number
    Float(f64),
    /// UTF-8 text
    Text(String),
}

impl PlaintextValue {
    /// Encodes the value as `[tag:1][bytes]`.
    ///
    /// The buffer is zeroed on drop since it holds plaintext.
    #[must_use]
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(9));
        match self {
            Self::Text(s) => {
                out.push(TAG_TEXT);
                out.extend_from_slice(s.as_bytes());
            }
            Self::Integer(n) => {
                out.push(TAG_INTEGER);
                out.extend_from_slice(&n.to_be_bytes());
            }
            Self::Float(x) => {
                out.push(TAG_FLOAT);
                out.extend_from_slice(&x.to_bits().to_be_bytes());
            }
            Self::Boolean(b) => {
                out.push(TAG_BOOLEAN);
                out.push(u8::from(*b));
            }
        }
        out
    }

    /// Decodes a value produced by [`to_bytes`](Self::to_bytes).
    ///
    /// # Errors
    ///
    /// Returns `Error::IntegrityViolation` if the tag is unknown or the body has
    /// the wrong length or encoding.
    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        let (&tag, body) = data
            .split_first()
            .ok_or_else(|| Error::IntegrityViolation("empty plaintext encoding".to_string()))?;

        match tag {
            TAG_TEXT => String::from_utf8(body.to_vec())
                .map(Self::Text)
                .map_err(|_| Error::IntegrityViolation("text value is not UTF-8".to_string())),
            TAG_INTEGER => fixed::<8>(body).map(|b| Self::Integer(i64::from_be_bytes(b))),
            TAG_FLOAT => {
                fixed::<8>(body).map(|b| Self::Float(f64::from_bits(u64::from_be_bytes(b))))
            }
            TAG_BOOLEAN => match body {
                [0] => Ok(Self::Boolean(false)),
                [1] => Ok(Self::Boolean(true)),
                _ => Err(Error::IntegrityViolation("invalid boolean encoding".to_string())),
            },
            other => Err(Error::IntegrityViolation(format!("unknown value tag: {other:#04x}"))),
        }
    }

    /// Text used for pattern matching: text as-is, other scalars in display form.
    #[must_use]
    pub fn search_text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Returns the text if this is a text value.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Name of the variant, for diagnostics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::Boolean(_) => "boolean",
        }
    }
}

fn fixed<const N: usize>(body: &[u8]) -> Result<[u8; N], Error> {
    body.try_into().map_err(|_| {
        Error::IntegrityViolation(format!("expected {N} value bytes, got {}", body.len()))
    })
}

impl fmt::Display for PlaintextValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Integer(n) => write!(f, "{n}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Boolean(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for PlaintextValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for PlaintextValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for PlaintextValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for PlaintextValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for PlaintextValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for PlaintextValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

/// Conversion between a struct field and an optional plaintext value.
///
/// Used by `#[derive(Model)]`. `None` means the column is absent from the record.
pub trait FieldValue: Sized {
    /// Converts the field into a plaintext value, or `None` to omit the column.
    fn into_plain(self) -> Option<PlaintextValue>;

    /// Rebuilds the field from a decrypted column.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRecord` if the value is missing or has another type.
    fn from_plain(column: &str, value: Option<PlaintextValue>) -> Result<Self, Error>;
}

fn mismatch(column: &str, expected: &str, value: Option<&PlaintextValue>) -> Error {
    match value {
        Some(v) => Error::InvalidRecord(format!(
            "column {column}: expected {expected}, found {}",
            v.kind()
        )),
        None => Error::InvalidRecord(format!("column {column}: missing {expected} value")),
    }
}

impl FieldValue for String {
    fn into_plain(self) -> Option<PlaintextValue> {
        Some(PlaintextValue::Text(self))
    }

    fn from_plain(column: &str, value: Option<PlaintextValue>) -> Result<Self, Error> {
        match value {
            Some(PlaintextValue::Text(s)) => Ok(s),
            other => Err(mismatch(column, "text", other.as_ref())),
        }
    }
}

impl FieldValue for i64 {
    fn into_plain(self) -> Option<PlaintextValue> {
        Some(PlaintextValue::Integer(self))
    }

    fn from_plain(column: &str, value: Option<PlaintextValue>) -> Result<Self, Error> {
        match value {
            Some(PlaintextValue::Integer(n)) => Ok(n),
            other => Err(mismatch(column, "integer", other.as_ref())),
        }
    }
}

impl FieldValue for f64 {
    fn into_plain(self) -> Option<PlaintextValue> {
        Some(PlaintextValue::Float(self))
    }

    fn from_plain(column: &str, value: Option<PlaintextValue>) -> Result<Self, Error> {
        match value {
            Some(PlaintextValue::Float(x)) => Ok(x),
            #[allow(clippy::cast_precision_loss)]
            Some(PlaintextValue::Integer(n)) => Ok(n as f64),
            other => Err(mismatch(column, "float", other.as_ref())),
        }
    }
}

impl FieldValue for bool {
    fn into_plain(self) -> Option<PlaintextValue> {
        Some(PlaintextValue::Boolean(self))
    }

    fn from_plain(column: &str, value: Option<PlaintextValue>) -> Result<Self, Error> {
        match value {
            Some(PlaintextValue::Boolean(b)) => Ok(b),
            other => Err(mismatch(column, "boolean", other.as_ref())),
        }
    }
}

impl<T: FieldValue> FieldValue for Option<T> {
    fn into_plain(self) -> Option<PlaintextValue> {
        self.and_then(FieldValue::into_plain)
    }

    fn from_plain(column: &str, value: Option<PlaintextValue>) -> Result<Self, Error> {
        value.map(|v| T::from_plain(column, Some(v))).transpose()
    }
}
