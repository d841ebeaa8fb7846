//! Document records and the typed field codec that produces the byte
//! payloads persisted by the storage layer.

pub mod field;
pub mod record;
pub mod schema;

pub use field::{DataType, Field, FieldValue, STRING_ARRAY_SEPARATOR};
pub use record::{DecodeWarning, Decoded, Document, ID_FIELD};
pub use schema::{Schema, TableSchema};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("Decode failed: {0}")]
    Decode(String),
    #[error("Serialization failed: {0}")]
    Serialization(String),
    #[error("No schema available to validate document fields")]
    NoSchema,
}
