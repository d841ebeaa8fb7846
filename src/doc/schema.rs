//! Field-name to declared-type mapping consulted while decoding documents.

use super::DataType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub trait Schema: Send + Sync {
    fn field_type(&self, name: &str) -> Option<DataType>;

    fn contains(&self, name: &str) -> bool {
        self.field_type(name).is_some()
    }
}

/// Map-backed schema, loadable from TOML as `[fields]` name = "type".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    fields: HashMap<String, DataType>,
}

impl TableSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: impl Into<String>, datatype: DataType) -> Self {
        self.add_field(name, datatype);
        self
    }

    pub fn add_field(&mut self, name: impl Into<String>, datatype: DataType) {
        self.fields.insert(name.into(), datatype);
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl Schema for TableSchema {
    fn field_type(&self, name: &str) -> Option<DataType> {
        self.fields.get(name).copied()
    }
}
