//! Single named, typed value and its flat byte encoding.
//!
//! Numeric types are fixed width little-endian (INT=4, LONG=8, FLOAT=4,
//! DOUBLE=8). STRING is raw UTF-8, STRING_ARRAY joins items with
//! [`STRING_ARRAY_SEPARATOR`], VECTOR packs little-endian f32s.

use super::RecordError;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value as JsonValue};

/// Joins STRING_ARRAY items. Not allowed inside an item.
pub const STRING_ARRAY_SEPARATOR: u8 = 0x01;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Int = 0,
    Long = 1,
    Float = 2,
    Double = 3,
    String = 4,
    Vector = 5,
    StringArray = 8,
}

impl DataType {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Result<Self, RecordError> {
        match tag {
            0 => Ok(DataType::Int),
            1 => Ok(DataType::Long),
            2 => Ok(DataType::Float),
            3 => Ok(DataType::Double),
            4 => Ok(DataType::String),
            5 => Ok(DataType::Vector),
            8 => Ok(DataType::StringArray),
            other => Err(RecordError::Decode(format!("unknown datatype tag {}", other))),
        }
    }

    /// Byte width for fixed-width numeric types, `None` for variable ones.
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            DataType::Int | DataType::Float => Some(4),
            DataType::Long | DataType::Double => Some(8),
            DataType::String | DataType::StringArray | DataType::Vector => None,
        }
    }
}

/// Decoded form of a field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    StringArray(Vec<String>),
    Vector(Vec<f32>),
}

impl FieldValue {
    pub fn datatype(&self) -> DataType {
        match self {
            FieldValue::Int(_) => DataType::Int,
            FieldValue::Long(_) => DataType::Long,
            FieldValue::Float(_) => DataType::Float,
            FieldValue::Double(_) => DataType::Double,
            FieldValue::String(_) => DataType::String,
            FieldValue::StringArray(_) => DataType::StringArray,
            FieldValue::Vector(_) => DataType::Vector,
        }
    }

    fn into_bytes(self) -> Vec<u8> {
        match self {
            FieldValue::Int(v) => v.to_le_bytes().to_vec(),
            FieldValue::Long(v) => v.to_le_bytes().to_vec(),
            FieldValue::Float(v) => v.to_le_bytes().to_vec(),
            FieldValue::Double(v) => v.to_le_bytes().to_vec(),
            FieldValue::String(s) => s.into_bytes(),
            FieldValue::StringArray(items) => {
                let mut buf = Vec::new();
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        buf.push(STRING_ARRAY_SEPARATOR);
                    }
                    buf.extend_from_slice(item.as_bytes());
                }
                buf
            }
            FieldValue::Vector(values) => crate::memory::layout::encode_vector(&values),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub datatype: DataType,
    pub value: Vec<u8>,
}

impl Field {
    /// Encode a typed value. Callers keep separators out of array items.
    pub fn new(name: impl Into<String>, value: FieldValue) -> Self {
        Self {
            name: name.into(),
            datatype: value.datatype(),
            value: value.into_bytes(),
        }
    }

    /// Wrap already-encoded bytes without checking them.
    pub fn from_raw(name: impl Into<String>, datatype: DataType, value: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            datatype,
            value,
        }
    }

    pub fn int(name: impl Into<String>, v: i32) -> Self {
        Self::new(name, FieldValue::Int(v))
    }

    pub fn long(name: impl Into<String>, v: i64) -> Self {
        Self::new(name, FieldValue::Long(v))
    }

    pub fn float(name: impl Into<String>, v: f32) -> Self {
        Self::new(name, FieldValue::Float(v))
    }

    pub fn double(name: impl Into<String>, v: f64) -> Self {
        Self::new(name, FieldValue::Double(v))
    }

    pub fn string(name: impl Into<String>, v: impl Into<String>) -> Self {
        Self::new(name, FieldValue::String(v.into()))
    }

    pub fn string_array<I, S>(name: impl Into<String>, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            name,
            FieldValue::StringArray(items.into_iter().map(Into::into).collect()),
        )
    }

    pub fn vector(name: impl Into<String>, values: &[f32]) -> Self {
        Self::new(name, FieldValue::Vector(values.to_vec()))
    }

    pub fn is_vector(&self) -> bool {
        self.datatype == DataType::Vector
    }

    /// Check the stored byte length against the declared type.
    pub fn validate(&self) -> Result<(), RecordError> {
        match self.datatype.fixed_width() {
            Some(width) if self.value.len() != width => Err(RecordError::Decode(format!(
                "field {}: {:?} needs {} bytes, found {}",
                self.name,
                self.datatype,
                width,
                self.value.len()
            ))),
            None if self.datatype == DataType::Vector && self.value.len() % 4 != 0 => {
                Err(RecordError::Decode(format!(
                    "field {}: vector payload of {} bytes is not a whole number of floats",
                    self.name,
                    self.value.len()
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn decode(&self) -> Result<FieldValue, RecordError> {
        self.validate()?;
        let bytes = self.value.as_slice();
        let value = match self.datatype {
            DataType::Int => FieldValue::Int(i32::from_le_bytes(fixed(bytes)?)),
            DataType::Long => FieldValue::Long(i64::from_le_bytes(fixed(bytes)?)),
            DataType::Float => FieldValue::Float(f32::from_le_bytes(fixed(bytes)?)),
            DataType::Double => FieldValue::Double(f64::from_le_bytes(fixed(bytes)?)),
            DataType::String => FieldValue::String(self.utf8(bytes)?),
            DataType::StringArray => {
                let items = if bytes.is_empty() {
                    Vec::new()
                } else {
                    bytes
                        .split(|&b| b == STRING_ARRAY_SEPARATOR)
                        .map(|item| self.utf8(item))
                        .collect::<Result<Vec<_>, _>>()?
                };
                FieldValue::StringArray(items)
            }
            DataType::Vector => FieldValue::Vector(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
        };
        Ok(value)
    }

    /// Display projection used by `Document::to_json`.
    pub fn to_json_value(&self) -> Result<JsonValue, RecordError> {
        Ok(match self.decode()? {
            FieldValue::Int(v) => JsonValue::from(v),
            FieldValue::Long(v) => JsonValue::from(v),
            FieldValue::Float(v) => float_json(v),
            FieldValue::Double(v) => Number::from_f64(v).map_or(JsonValue::Null, JsonValue::Number),
            FieldValue::String(s) => JsonValue::String(s),
            FieldValue::StringArray(items) => {
                JsonValue::Array(items.into_iter().map(JsonValue::String).collect())
            }
            FieldValue::Vector(values) => {
                JsonValue::Array(values.into_iter().map(float_json).collect())
            }
        })
    }

    fn utf8(&self, bytes: &[u8]) -> Result<String, RecordError> {
        String::from_utf8(bytes.to_vec()).map_err(|e| {
            RecordError::Decode(format!("field {}: invalid UTF-8: {}", self.name, e))
        })
    }
}

fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N], RecordError> {
    bytes
        .try_into()
        .map_err(|_| {
            RecordError::Decode(format!("expected {} bytes, found {}", N, bytes.len()))
        })
}

/// f32 goes through its shortest decimal form so 3.14f32 prints as 3.14
/// rather than its widened f64 value.
fn float_json(v: f32) -> JsonValue {
    v.to_string()
        .parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map_or(JsonValue::Null, JsonValue::Number)
}
