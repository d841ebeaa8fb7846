//! Ordered byte-key/byte-value persistence consumed by the raw-vector
//! store through the [`KvStore`] trait.
//!
//! [`SegmentStore`] is the bundled engine: append-only segment files with an
//! in-memory ordered index rebuilt on open.

pub mod record;
pub mod segment;

pub use crate::config::{CompressionType, SegmentConfig};
pub use segment::{SegmentStore, StorageMetricsSnapshot};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, KvError>;

#[derive(Error, Debug)]
pub enum KvError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Corrupted record in {segment} at offset {offset}: {reason}")]
    Corruption {
        segment: String,
        offset: u64,
        reason: String,
    },
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Value of {size} bytes exceeds the {max} byte limit")]
    ValueTooLarge { size: usize, max: usize },
}

/// Ordered key-value storage. Writes are serialized by the implementation;
/// concurrent writers to one key resolve last-writer-wins.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>>;

    /// Entries with `start <= key < end`, ascending by key.
    async fn scan(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Bytes, Bytes)>>;

    /// Greatest key starting with `prefix`.
    async fn last_key(&self, prefix: &[u8]) -> Result<Option<Bytes>>;

    /// Make every acknowledged write durable.
    async fn sync(&self) -> Result<()>;

    /// Reclaim space held by overwritten values when worthwhile. Returns
    /// whether any work was done.
    async fn maybe_compact(&self) -> Result<bool> {
        Ok(false)
    }
}

/// Smallest key greater than every key starting with `prefix`, or `None`
/// when no such key exists (prefix is empty or all `0xff`).
pub(crate) fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}
