//! [`RawVectorIo`] for an in-memory raw vector, persisted to a [`KvStore`].

use super::{AsyncFlusher, FlushOnce, FlushTarget, RawVectorIo, Result, StoreError};
use crate::config::StoreConfig;
use crate::kv::{KvStore, SegmentStore};
use crate::memory::layout::{
    decode_vector, encode_vector, meta_key, vector_key, vector_key_range, vid_from_key,
    VECTOR_PREFIX,
};
use crate::memory::{MemoryRawVector, RawVectorError};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, instrument, warn};

/// Meta key holding the count of contiguously durable vids.
const DISK_VEC_NUM_KEY: &str = "disk_vec_num";
/// Vids read per scan while loading.
const LOAD_BATCH: u64 = 8192;

pub struct MemoryRawVectorIo {
    raw_vector: Arc<MemoryRawVector>,
    config: StoreConfig,
    backend: Option<Arc<dyn KvStore>>,
    kv: OnceCell<Arc<dyn KvStore>>,
    disk_vec_num: Mutex<u64>,
    flusher: AsyncFlusher,
}

impl MemoryRawVectorIo {
    /// Store persisting under `config.data_dir/<collection name>`.
    pub fn new(raw_vector: Arc<MemoryRawVector>, config: StoreConfig) -> Self {
        Self::build(raw_vector, config, None)
    }

    /// Store persisting to an already opened backend.
    pub fn with_backend(
        raw_vector: Arc<MemoryRawVector>,
        config: StoreConfig,
        kv: Arc<dyn KvStore>,
    ) -> Self {
        Self::build(raw_vector, config, Some(kv))
    }

    fn build(
        raw_vector: Arc<MemoryRawVector>,
        config: StoreConfig,
        backend: Option<Arc<dyn KvStore>>,
    ) -> Self {
        let flusher = AsyncFlusher::new(raw_vector.meta().name.clone());
        Self {
            raw_vector,
            config,
            backend,
            kv: OnceCell::new(),
            disk_vec_num: Mutex::new(0),
            flusher,
        }
    }

    pub fn name(&self) -> &str {
        &self.raw_vector.meta().name
    }

    pub fn raw_vector(&self) -> &Arc<MemoryRawVector> {
        &self.raw_vector
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Persist the current in-memory value of `vid`.
    pub async fn put(&self, vid: u64) -> Result<()> {
        let kv = self.kv()?;
        let bytes = self
            .raw_vector
            .with_vector(vid, encode_vector)
            .ok_or_else(|| RawVectorError::VidOutOfRange {
                vid,
                next_vid: self.raw_vector.next_vid(),
            })?;
        kv.put(&vector_key(vid), &bytes).await?;
        Ok(())
    }

    /// Start periodic flushing of newly added vectors.
    pub fn start_flusher(self: &Arc<Self>) -> Result<()> {
        self.flusher
            .start(Arc::downgrade(self), self.config.flush_interval())
    }

    pub async fn stop_flusher(&self) -> Result<()> {
        self.flusher.stop().await
    }

    /// Stop the flusher, persist whatever is still pending and compact the
    /// backend if it has accumulated enough garbage.
    #[instrument(skip(self), fields(collection = %self.name()))]
    pub async fn close(&self) -> Result<()> {
        self.stop_flusher().await?;
        let kv = self.kv()?;
        self.flush_once().await?;
        kv.sync().await?;
        if kv.maybe_compact().await? {
            info!("backend compacted on close");
        }
        Ok(())
    }

    fn kv(&self) -> Result<&Arc<dyn KvStore>> {
        self.kv.get().ok_or(StoreError::NotInitialized)
    }

    async fn open_backend(&self) -> Result<Arc<dyn KvStore>> {
        if let Some(kv) = &self.backend {
            return Ok(Arc::clone(kv));
        }
        let dir = self.config.collection_dir(self.name());
        let store = SegmentStore::open(dir, self.config.segment.clone()).await?;
        Ok(Arc::new(store))
    }

    /// Durable count recorded by earlier dumps, or derived from the highest
    /// persisted vid when the counter was never written.
    async fn read_disk_vec_num(kv: &dyn KvStore) -> Result<u64> {
        if let Some(raw) = kv.get(&meta_key(DISK_VEC_NUM_KEY)).await? {
            let bytes: [u8; 8] = raw.as_ref().try_into().map_err(|_| {
                StoreError::Corruption(format!(
                    "{} holds {} bytes, expected 8",
                    DISK_VEC_NUM_KEY,
                    raw.len()
                ))
            })?;
            return Ok(u64::from_le_bytes(bytes));
        }
        match kv.last_key(&[VECTOR_PREFIX]).await? {
            Some(key) => {
                let vid = vid_from_key(&key).ok_or_else(|| {
                    StoreError::Corruption(format!("malformed vector key {:?}", key))
                })?;
                Ok(vid.saturating_add(1))
            }
            None => Ok(0),
        }
    }
}

#[async_trait]
impl RawVectorIo for MemoryRawVectorIo {
    #[instrument(skip(self), fields(collection = %self.name()))]
    async fn init(&self) -> Result<()> {
        if self.kv.initialized() {
            debug!("already initialized");
            return Ok(());
        }
        self.kv
            .get_or_try_init(|| async {
                let kv = self.open_backend().await?;
                let durable = Self::read_disk_vec_num(kv.as_ref()).await?;
                *self.disk_vec_num.lock().await = durable;
                info!(disk_vec_num = durable, "raw vector store initialized");
                Ok::<_, StoreError>(kv)
            })
            .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(collection = %self.name()))]
    async fn dump(&self, start_vid: u64, end_vid: u64) -> Result<()> {
        let kv = self.kv()?;
        if start_vid >= end_vid {
            return Ok(());
        }
        let next_vid = self.raw_vector.next_vid();
        if end_vid > next_vid {
            return Err(RawVectorError::VidOutOfRange {
                vid: end_vid - 1,
                next_vid,
            }
            .into());
        }

        for vid in start_vid..end_vid {
            if let Err(e) = self.put(vid).await {
                warn!(vid, "dump interrupted: {}", e);
                return Err(e);
            }
        }

        let mut durable = self.disk_vec_num.lock().await;
        if start_vid <= *durable && end_vid > *durable {
            kv.put(&meta_key(DISK_VEC_NUM_KEY), &end_vid.to_le_bytes())
                .await?;
            *durable = end_vid;
        }
        if self.config.segment.sync_on_flush {
            kv.sync().await?;
        }
        debug!(count = end_vid - start_vid, disk_vec_num = *durable, "dumped");
        Ok(())
    }

    async fn get_disk_vec_num(&self) -> Result<u64> {
        self.kv()?;
        Ok(*self.disk_vec_num.lock().await)
    }

    #[instrument(skip(self), fields(collection = %self.name()))]
    async fn load(&self, vec_num: u64) -> Result<()> {
        let kv = self.kv()?;
        let dim = self.raw_vector.dimension();
        let vector_size = self.raw_vector.meta().vector_size();

        if vec_num > 0 {
            let last = kv
                .last_key(&[VECTOR_PREFIX])
                .await?
                .and_then(|key| vid_from_key(&key));
            if last.map_or(true, |vid| vid < vec_num - 1) {
                return Err(StoreError::Corruption(format!(
                    "{} vectors requested but the highest vid on disk is {:?}",
                    vec_num, last
                )));
            }
        }

        // grows per batch; vec_num alone does not size the buffer
        let mut flat = Vec::with_capacity(vec_num.min(LOAD_BATCH) as usize * dim);
        let mut expected = 0u64;
        while expected < vec_num {
            let batch_end = vec_num.min(expected.saturating_add(LOAD_BATCH));
            let (start, end) = vector_key_range(expected..batch_end);
            for (key, value) in kv.scan(&start, &end).await? {
                let vid = vid_from_key(&key).ok_or_else(|| {
                    StoreError::Corruption(format!("malformed vector key {:?}", key))
                })?;
                if vid != expected {
                    return Err(StoreError::Corruption(format!(
                        "vector {} is missing on disk",
                        expected
                    )));
                }
                let values = decode_vector(&value, dim).ok_or_else(|| {
                    StoreError::Corruption(format!(
                        "vector {} holds {} bytes, expected {}",
                        vid,
                        value.len(),
                        vector_size
                    ))
                })?;
                flat.extend_from_slice(&values);
                expected += 1;
            }
            if expected < batch_end {
                return Err(StoreError::Corruption(format!(
                    "vector {} is missing on disk",
                    expected
                )));
            }
        }

        self.raw_vector.replace(flat)?;
        self.flusher.reset_boundary(vec_num);
        info!(vec_num, "loaded vectors from disk");
        Ok(())
    }

    async fn update(&self, vid: u64) -> Result<()> {
        self.put(vid).await
    }
}

impl FlushTarget for MemoryRawVectorIo {
    fn next_vid(&self) -> u64 {
        self.raw_vector.next_vid()
    }

    fn flusher(&self) -> &AsyncFlusher {
        &self.flusher
    }
}
