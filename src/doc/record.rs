//! Document record: table fields plus vector fields keyed by `_id`.

use super::{DataType, Field, RecordError, Schema};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;

/// Name of the field that carries the document key.
pub const ID_FIELD: &str = "_id";

/// Non-fatal problems found while decoding; the affected field is dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeWarning {
    #[error("Unknown field {0}")]
    UnknownField(String),
    #[error("Field {name} declared as {declared:?} but encoded as {actual:?}")]
    TypeMismatch {
        name: String,
        declared: DataType,
        actual: DataType,
    },
    #[error("Malformed field {name}: {reason}")]
    Malformed { name: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct Decoded {
    pub document: Document,
    pub warnings: Vec<DecodeWarning>,
}

/// Fields are kept in sorted maps; enumeration order carries no meaning.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    key: String,
    table_fields: BTreeMap<String, Field>,
    vector_fields: BTreeMap<String, Field>,
}

#[derive(Serialize)]
struct WireFieldRef<'a> {
    name: &'a str,
    datatype: u8,
    value: &'a [u8],
}

#[derive(Deserialize)]
struct WireField {
    name: String,
    datatype: u8,
    value: Vec<u8>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty when the document carries no `_id`.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Insert or replace a field by name. A STRING `_id` field also sets
    /// the key.
    pub fn add_field(&mut self, field: Field) {
        if let Some(key) = Self::key_of(&field) {
            self.key = key;
        }
        self.insert(field);
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.table_fields
            .get(name)
            .or_else(|| self.vector_fields.get(name))
    }

    pub fn table_fields(&self) -> &BTreeMap<String, Field> {
        &self.table_fields
    }

    pub fn vector_fields(&self) -> &BTreeMap<String, Field> {
        &self.vector_fields
    }

    /// Decoded values of a VECTOR field.
    pub fn vector(&self, name: &str) -> Result<Option<Vec<f32>>, RecordError> {
        let Some(field) = self.vector_fields.get(name) else {
            return Ok(None);
        };
        match field.decode()? {
            super::FieldValue::Vector(values) => Ok(Some(values)),
            _ => Ok(None),
        }
    }

    pub fn len(&self) -> usize {
        self.table_fields.len() + self.vector_fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encode every field, table fields first, as `(name, tag, value)`.
    pub fn serialize(&self) -> Result<Vec<u8>, RecordError> {
        let wire: Vec<WireFieldRef<'_>> = self
            .table_fields
            .values()
            .chain(self.vector_fields.values())
            .map(|f| WireFieldRef {
                name: &f.name,
                datatype: f.datatype.tag(),
                value: &f.value,
            })
            .collect();
        bincode::serialize(&wire).map_err(|e| RecordError::Serialization(e.to_string()))
    }

    /// Decode a buffer produced by [`Document::serialize`].
    ///
    /// Fields missing from `schema`, declared with another type, or with a
    /// malformed payload are dropped and reported as warnings. The `_id`
    /// field always sets the key, whether or not the schema knows it.
    pub fn deserialize(buf: &[u8], schema: Option<&dyn Schema>) -> Result<Decoded, RecordError> {
        let Some(schema) = schema else {
            tracing::error!("document decode attempted without a schema");
            return Err(RecordError::NoSchema);
        };

        let mut document = Document::new();
        let mut warnings = Vec::new();
        if buf.is_empty() {
            return Ok(Decoded { document, warnings });
        }

        let wire: Vec<WireField> =
            bincode::deserialize(buf).map_err(|e| RecordError::Decode(e.to_string()))?;

        for wf in wire {
            let datatype = match DataType::from_tag(wf.datatype) {
                Ok(datatype) => datatype,
                Err(e) => {
                    warnings.push(DecodeWarning::Malformed {
                        name: wf.name,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            let field = Field::from_raw(wf.name, datatype, wf.value);

            if let Some(key) = Self::key_of(&field) {
                document.key = key;
            }

            match schema.field_type(&field.name) {
                None => {
                    warnings.push(DecodeWarning::UnknownField(field.name));
                    continue;
                }
                Some(declared) if declared != datatype => {
                    warnings.push(DecodeWarning::TypeMismatch {
                        name: field.name,
                        declared,
                        actual: datatype,
                    });
                    continue;
                }
                Some(_) => {}
            }

            if let Err(e) = field.validate() {
                warnings.push(DecodeWarning::Malformed {
                    name: field.name,
                    reason: e.to_string(),
                });
                continue;
            }
            document.insert(field);
        }

        for warning in &warnings {
            warn!(key = %document.key, "{}", warning);
        }
        Ok(Decoded { document, warnings })
    }

    /// Flat JSON preview: `{"_id": key, <field>: <value>, ...}`.
    pub fn to_json(&self) -> Result<String, RecordError> {
        let mut map = Map::new();
        map.insert(ID_FIELD.to_string(), JsonValue::String(self.key.clone()));
        for field in self.table_fields.values().chain(self.vector_fields.values()) {
            if field.name == ID_FIELD {
                continue;
            }
            map.insert(field.name.clone(), field.to_json_value()?);
        }
        serde_json::to_string(&JsonValue::Object(map))
            .map_err(|e| RecordError::Serialization(e.to_string()))
    }

    fn key_of(field: &Field) -> Option<String> {
        (field.name == ID_FIELD && field.datatype == DataType::String)
            .then(|| String::from_utf8_lossy(&field.value).into_owned())
    }

    fn insert(&mut self, field: Field) {
        let (target, other) = if field.is_vector() {
            (&mut self.vector_fields, &mut self.table_fields)
        } else {
            (&mut self.table_fields, &mut self.vector_fields)
        };
        other.remove(&field.name);
        target.insert(field.name.clone(), field);
    }
}
