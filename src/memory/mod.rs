//! In-memory working set of raw vectors and their on-disk byte layout.
//! Vectors live in a flat array indexed by vid; persistence is handled by
//! `crate::io`.

pub mod layout;
pub mod raw_vector;

pub use raw_vector::{MemoryRawVector, RawVectorError, VectorMeta};
