//! Raw vector persistence: the storage contract, the periodic flusher and
//! the memory-backed store that ties them to a key-value backend.
//!
//! A store plays three roles, each a trait: [`RawVectorIo`] (what gets
//! persisted), [`FlushTarget`] (what a flusher drains) and [`FlushOnce`]
//! (one flush step, implemented for every target).

pub mod flusher;
pub mod memory;

pub use flusher::{AsyncFlusher, FlushOutcome};
pub use memory::MemoryRawVectorIo;

use crate::kv::KvError;
use crate::memory::RawVectorError;
use async_trait::async_trait;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[source] KvError),
    #[error("Corrupted vector data: {0}")]
    Corruption(String),
    #[error("Store is not initialized")]
    NotInitialized,
    #[error(transparent)]
    RawVector(#[from] RawVectorError),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Flusher task failed: {0}")]
    Flusher(String),
}

impl From<KvError> for StoreError {
    fn from(err: KvError) -> Self {
        match err {
            KvError::Corruption { .. } => StoreError::Corruption(err.to_string()),
            other => StoreError::Io(other),
        }
    }
}

/// Storage contract for fixed-dimension vectors addressed by vid.
#[async_trait]
pub trait RawVectorIo: Send + Sync {
    /// Open backing resources. Calling it again is a no-op.
    async fn init(&self) -> Result<()>;

    /// Persist vids `[start_vid, end_vid)`. Each vid is an idempotent
    /// overwrite; vids written before a failure stay written.
    async fn dump(&self, start_vid: u64, end_vid: u64) -> Result<()>;

    /// Number of vids durable on disk.
    async fn get_disk_vec_num(&self) -> Result<u64>;

    /// Rebuild the in-memory vids `[0, vec_num)` from disk.
    async fn load(&self, vec_num: u64) -> Result<()>;

    /// Re-persist the in-memory value of one vid.
    async fn update(&self, vid: u64) -> Result<()>;
}

/// A store whose newly ingested vectors can be drained by an [`AsyncFlusher`].
pub trait FlushTarget: RawVectorIo {
    /// Vids currently readable from memory.
    fn next_vid(&self) -> u64;

    fn flusher(&self) -> &AsyncFlusher;
}

/// Single-shot flush driver.
#[async_trait]
pub trait FlushOnce {
    async fn flush_once(&self) -> Result<FlushOutcome>;
}

#[async_trait]
impl<T: FlushTarget + ?Sized> FlushOnce for T {
    async fn flush_once(&self) -> Result<FlushOutcome> {
        self.flusher().flush_once(self).await
    }
}

#[cfg(test)]
mod tests;
