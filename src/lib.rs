//! Persistence core for raw vector collections.
//!
//! Documents arrive as [`doc::Document`] records; their vector fields are
//! appended to a [`memory::MemoryRawVector`] and made durable by a
//! [`io::RawVectorIo`] implementation. [`io::MemoryRawVectorIo`] keeps one
//! key per vector in a [`kv::KvStore`] and drains new vectors in the
//! background through an [`io::AsyncFlusher`].

pub mod config;
pub mod doc;
pub mod io;
pub mod kv;
pub mod memory;

pub use config::{ConfigError, StoreConfig};
pub use doc::{Document, Field, RecordError};
pub use io::{
    AsyncFlusher, FlushOnce, FlushOutcome, FlushTarget, MemoryRawVectorIo, RawVectorIo,
    StoreError,
};
pub use memory::{MemoryRawVector, VectorMeta};
