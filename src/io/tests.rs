use super::*;
use crate::config::{SegmentConfig, StoreConfig};
use crate::doc::{DataType, Document, Field, TableSchema};
use crate::kv::{self, KvError, KvStore, SegmentStore};
use crate::memory::layout::{encode_vector, meta_key, vector_key, vid_from_key};
use crate::memory::{MemoryRawVector, VectorMeta};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tokio::sync::{Notify, Semaphore};

const DIM: usize = 4;

fn vector(seed: u64) -> Vec<f32> {
    (0..DIM).map(|i| seed as f32 * 10.0 + i as f32 + 0.25).collect()
}

fn test_config(dir: &TempDir) -> StoreConfig {
    StoreConfig {
        data_dir: dir.path().to_path_buf(),
        flush_interval_ms: 20,
        segment: SegmentConfig::default(),
    }
}

fn raw_vector() -> Arc<MemoryRawVector> {
    Arc::new(MemoryRawVector::new(VectorMeta::new("faces", DIM)))
}

async fn open_store(dir: &TempDir) -> MemoryRawVectorIo {
    let store = MemoryRawVectorIo::new(raw_vector(), test_config(dir));
    store.init().await.unwrap();
    store
}

fn fill(store: &MemoryRawVectorIo, n: u64) {
    for i in 0..n {
        assert_eq!(store.raw_vector().add(&vector(i)).unwrap(), i);
    }
}

fn bits(v: &[f32]) -> Vec<u32> {
    v.iter().map(|x| x.to_bits()).collect()
}

/// Segment store whose vector writes can be made to fail or to block.
struct ControlledKv {
    inner: SegmentStore,
    fail_from_vid: AtomicU64,
    hold: AtomicBool,
    entered: Notify,
    release: Semaphore,
}

impl ControlledKv {
    async fn open(dir: &TempDir) -> Arc<Self> {
        let inner = SegmentStore::open(dir.path().join("kv"), SegmentConfig::default())
            .await
            .unwrap();
        Arc::new(Self {
            inner,
            fail_from_vid: AtomicU64::new(u64::MAX),
            hold: AtomicBool::new(false),
            entered: Notify::new(),
            release: Semaphore::new(0),
        })
    }

    fn fail_from(&self, vid: u64) {
        self.fail_from_vid.store(vid, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl KvStore for ControlledKv {
    async fn put(&self, key: &[u8], value: &[u8]) -> kv::Result<()> {
        if let Some(vid) = vid_from_key(key) {
            if vid >= self.fail_from_vid.load(Ordering::SeqCst) {
                return Err(KvError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "injected write failure",
                )));
            }
            if self.hold.load(Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.acquire().await.unwrap().forget();
            }
        }
        self.inner.put(key, value).await
    }

    async fn get(&self, key: &[u8]) -> kv::Result<Option<Bytes>> {
        self.inner.get(key).await
    }

    async fn scan(&self, start: &[u8], end: &[u8]) -> kv::Result<Vec<(Bytes, Bytes)>> {
        self.inner.scan(start, end).await
    }

    async fn last_key(&self, prefix: &[u8]) -> kv::Result<Option<Bytes>> {
        self.inner.last_key(prefix).await
    }

    async fn sync(&self) -> kv::Result<()> {
        self.inner.sync().await
    }
}

async fn controlled_store(dir: &TempDir) -> (Arc<MemoryRawVectorIo>, Arc<ControlledKv>) {
    let kv = ControlledKv::open(dir).await;
    let store = MemoryRawVectorIo::with_backend(
        raw_vector(),
        test_config(dir),
        Arc::clone(&kv) as Arc<dyn KvStore>,
    );
    store.init().await.unwrap();
    (Arc::new(store), kv)
}

#[tokio::test]
async fn operations_before_init_fail() {
    let dir = tempdir().unwrap();
    let store = MemoryRawVectorIo::new(raw_vector(), test_config(&dir));
    fill(&store, 1);
    assert!(matches!(store.dump(0, 1).await, Err(StoreError::NotInitialized)));
    assert!(matches!(store.get_disk_vec_num().await, Err(StoreError::NotInitialized)));
    assert!(matches!(store.load(0).await, Err(StoreError::NotInitialized)));
    assert!(matches!(store.update(0).await, Err(StoreError::NotInitialized)));

    store.init().await.unwrap();
    store.init().await.unwrap();
    assert_eq!(store.get_disk_vec_num().await.unwrap(), 0);
}

#[tokio::test]
async fn dump_survives_restart() {
    let dir = tempdir().unwrap();
    {
        let store = open_store(&dir).await;
        fill(&store, 5);
        store.dump(0, 5).await.unwrap();
    }

    let store = open_store(&dir).await;
    let on_disk = store.get_disk_vec_num().await.unwrap();
    assert!(on_disk >= 5);
    store.load(5).await.unwrap();
    assert_eq!(store.raw_vector().next_vid(), 5);
    for vid in 0..5 {
        assert_eq!(bits(&store.raw_vector().get(vid).unwrap()), bits(&vector(vid)));
    }
    assert_eq!(store.flusher().boundary(), 5);
}

#[tokio::test]
async fn dump_is_idempotent() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir).await;
    fill(&store, 3);
    store.dump(0, 3).await.unwrap();
    store.dump(0, 3).await.unwrap();
    store.dump(1, 2).await.unwrap();
    assert_eq!(store.get_disk_vec_num().await.unwrap(), 3);

    drop(store);
    let store = open_store(&dir).await;
    store.load(3).await.unwrap();
    for vid in 0..3 {
        assert_eq!(store.raw_vector().get(vid).unwrap(), vector(vid));
    }
}

#[tokio::test]
async fn dump_rejects_vids_not_in_memory() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir).await;
    fill(&store, 2);
    assert!(matches!(
        store.dump(0, 3).await,
        Err(StoreError::RawVector(RawVectorError::VidOutOfRange { vid: 2, next_vid: 2 }))
    ));
    store.dump(2, 2).await.unwrap();
    assert_eq!(store.get_disk_vec_num().await.unwrap(), 0);
}

#[tokio::test]
async fn update_rewrites_persisted_vector() {
    let dir = tempdir().unwrap();
    let replacement = vec![-1.5; DIM];
    {
        let store = open_store(&dir).await;
        fill(&store, 10);
        store.dump(0, 10).await.unwrap();
        store.raw_vector().update(7, &replacement).unwrap();
        store.update(7).await.unwrap();
    }

    let store = open_store(&dir).await;
    store.load(10).await.unwrap();
    assert_eq!(store.raw_vector().get(7).unwrap(), replacement);
    assert_eq!(store.raw_vector().get(6).unwrap(), vector(6));
}

#[tokio::test]
async fn update_past_boundary_does_not_advance_disk_count() {
    let dir = tempdir().unwrap();
    {
        let store = open_store(&dir).await;
        fill(&store, 5);
        store.dump(0, 2).await.unwrap();
        store.update(4).await.unwrap();
        assert_eq!(store.get_disk_vec_num().await.unwrap(), 2);
        // disjoint range leaves the contiguous count alone
        store.dump(3, 5).await.unwrap();
        assert_eq!(store.get_disk_vec_num().await.unwrap(), 2);
    }
    let store = open_store(&dir).await;
    assert_eq!(store.get_disk_vec_num().await.unwrap(), 2);
    assert!(matches!(store.load(5).await, Err(StoreError::Corruption(_))));
}

#[tokio::test]
async fn disk_count_falls_back_to_highest_vid() {
    let dir = tempdir().unwrap();
    let kv = Arc::new(
        SegmentStore::open(dir.path().join("kv"), SegmentConfig::default())
            .await
            .unwrap(),
    );
    for vid in 0..3 {
        kv.put(&vector_key(vid), &encode_vector(&vector(vid)))
            .await
            .unwrap();
    }

    let store = MemoryRawVectorIo::with_backend(raw_vector(), test_config(&dir), kv);
    store.init().await.unwrap();
    assert_eq!(store.get_disk_vec_num().await.unwrap(), 3);
    store.load(3).await.unwrap();
    assert_eq!(store.raw_vector().get(2).unwrap(), vector(2));
}

#[tokio::test]
async fn malformed_disk_count_is_corruption() {
    let dir = tempdir().unwrap();
    let kv = Arc::new(
        SegmentStore::open(dir.path().join("kv"), SegmentConfig::default())
            .await
            .unwrap(),
    );
    kv.put(&meta_key("disk_vec_num"), b"abc").await.unwrap();
    let store = MemoryRawVectorIo::with_backend(raw_vector(), test_config(&dir), kv);
    assert!(matches!(store.init().await, Err(StoreError::Corruption(_))));
}

#[tokio::test]
async fn load_reports_missing_and_truncated_vectors() {
    let dir = tempdir().unwrap();
    let kv = Arc::new(
        SegmentStore::open(dir.path().join("kv"), SegmentConfig::default())
            .await
            .unwrap(),
    );
    for vid in [0u64, 1, 3] {
        kv.put(&vector_key(vid), &encode_vector(&vector(vid)))
            .await
            .unwrap();
    }
    let store = MemoryRawVectorIo::with_backend(
        raw_vector(),
        test_config(&dir),
        Arc::clone(&kv) as Arc<dyn KvStore>,
    );
    store.init().await.unwrap();

    let err = store.load(4).await.unwrap_err();
    assert!(matches!(&err, StoreError::Corruption(msg) if msg.contains("vector 2")));
    assert!(matches!(store.load(5).await, Err(StoreError::Corruption(_))));
    assert_eq!(store.raw_vector().next_vid(), 0);

    kv.put(&vector_key(1), &[0u8; 6]).await.unwrap();
    assert!(matches!(store.load(2).await, Err(StoreError::Corruption(_))));

    store.load(1).await.unwrap();
    assert_eq!(store.raw_vector().next_vid(), 1);
    store.load(0).await.unwrap();
    assert_eq!(store.raw_vector().next_vid(), 0);
}

#[tokio::test]
async fn flush_once_tracks_boundary() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir).await;
    assert_eq!(store.flush_once().await.unwrap(), FlushOutcome::Idle);

    fill(&store, 3);
    assert_eq!(
        store.flush_once().await.unwrap(),
        FlushOutcome::Flushed { start: 0, end: 3 }
    );
    assert_eq!(store.flush_once().await.unwrap(), FlushOutcome::Idle);

    store.raw_vector().add(&vector(3)).unwrap();
    store.raw_vector().add(&vector(4)).unwrap();
    assert_eq!(
        store.flush_once().await.unwrap(),
        FlushOutcome::Flushed { start: 3, end: 5 }
    );
    assert_eq!(store.flusher().boundary(), 5);
    assert_eq!(store.get_disk_vec_num().await.unwrap(), 5);
}

#[tokio::test]
async fn failed_flush_keeps_boundary_and_retries() {
    let dir = tempdir().unwrap();
    let (store, kv) = controlled_store(&dir).await;
    fill(&store, 5);

    kv.fail_from(3);
    let err = store.flush_once().await.unwrap_err();
    assert!(matches!(err, StoreError::Io(KvError::Io(_))));
    assert_eq!(store.flusher().boundary(), 0);
    assert_eq!(store.get_disk_vec_num().await.unwrap(), 0);
    // vids before the failure stay written
    assert!(kv.get(&vector_key(2)).await.unwrap().is_some());
    assert!(kv.get(&vector_key(3)).await.unwrap().is_none());

    kv.fail_from(u64::MAX);
    assert_eq!(
        store.flush_once().await.unwrap(),
        FlushOutcome::Flushed { start: 0, end: 5 }
    );
    assert_eq!(store.get_disk_vec_num().await.unwrap(), 5);
}

#[tokio::test]
async fn concurrent_flush_is_skipped() {
    let dir = tempdir().unwrap();
    let (store, kv) = controlled_store(&dir).await;
    fill(&store, 2);
    kv.hold.store(true, Ordering::SeqCst);

    let first = tokio::spawn({
        let store = Arc::clone(&store);
        async move { store.flush_once().await }
    });
    kv.entered.notified().await;
    assert_eq!(store.flush_once().await.unwrap(), FlushOutcome::Skipped);

    kv.release.add_permits(16);
    assert_eq!(
        first.await.unwrap().unwrap(),
        FlushOutcome::Flushed { start: 0, end: 2 }
    );
    assert_eq!(store.flusher().boundary(), 2);
}

#[tokio::test]
async fn idle_flushes_run_together() {
    let dir = tempdir().unwrap();
    let (store, _kv) = controlled_store(&dir).await;
    let (a, b) = futures::join!(store.flush_once(), store.flush_once());
    let outcomes = [a.unwrap(), b.unwrap()];
    assert!(outcomes
        .iter()
        .all(|o| matches!(o, FlushOutcome::Idle | FlushOutcome::Skipped)));
}

#[tokio::test]
async fn background_flusher_persists_new_vectors() {
    let dir = tempdir().unwrap();
    let store = Arc::new(open_store(&dir).await);
    store.start_flusher().unwrap();
    assert!(store.flusher().is_running());
    assert!(matches!(store.start_flusher(), Err(StoreError::InvalidState(_))));

    fill(&store, 8);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while store.flusher().boundary() < 8 {
        assert!(tokio::time::Instant::now() < deadline, "flusher never caught up");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    store.stop_flusher().await.unwrap();
    assert!(!store.flusher().is_running());
    store.stop_flusher().await.unwrap();
    assert_eq!(store.get_disk_vec_num().await.unwrap(), 8);

    // restartable after a stop
    store.start_flusher().unwrap();
    store.stop_flusher().await.unwrap();
}

#[tokio::test]
async fn stop_waits_for_in_flight_flush() {
    let dir = tempdir().unwrap();
    let (store, kv) = controlled_store(&dir).await;
    fill(&store, 3);
    kv.hold.store(true, Ordering::SeqCst);
    store.start_flusher().unwrap();
    kv.entered.notified().await;

    let stopper = tokio::spawn({
        let store = Arc::clone(&store);
        async move { store.stop_flusher().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!stopper.is_finished());

    kv.release.add_permits(16);
    stopper.await.unwrap().unwrap();
    assert_eq!(store.flusher().boundary(), 3);
    assert_eq!(store.get_disk_vec_num().await.unwrap(), 3);
}

#[test]
fn flusher_requires_runtime() {
    let dir = tempdir().unwrap();
    let store = Arc::new(MemoryRawVectorIo::new(raw_vector(), test_config(&dir)));
    assert!(matches!(store.start_flusher(), Err(StoreError::InvalidState(_))));
}

#[test]
fn close_drains_pending_vectors() {
    let dir = tempdir().unwrap();
    tokio_test::block_on(async {
        let store = Arc::new(open_store(&dir).await);
        fill(&store, 4);
        store.close().await.unwrap();
        assert_eq!(store.get_disk_vec_num().await.unwrap(), 4);
    });

    tokio_test::block_on(async {
        let store = open_store(&dir).await;
        tokio_test::assert_ok!(store.load(4).await);
        assert_eq!(store.raw_vector().get(3).unwrap(), vector(3));
    });
}

#[tokio::test]
async fn documents_feed_the_store() {
    let dir = tempdir().unwrap();
    let schema = TableSchema::new()
        .with_field("_id", DataType::String)
        .with_field("name", DataType::String)
        .with_field("embedding", DataType::Vector);
    {
        let store = open_store(&dir).await;
        for i in 0..3u64 {
            let mut doc = Document::new();
            doc.add_field(Field::string("_id", format!("face-{}", i)));
            doc.add_field(Field::string("name", "scan"));
            doc.add_field(Field::vector("embedding", &vector(i)));
            let wire = doc.serialize().unwrap();

            let decoded = Document::deserialize(&wire, Some(&schema)).unwrap();
            assert!(decoded.warnings.is_empty());
            assert_eq!(decoded.document.key(), format!("face-{}", i));
            let embedding = decoded.document.vector("embedding").unwrap().unwrap();
            assert_eq!(store.raw_vector().add(&embedding).unwrap(), i);
        }
        assert!(matches!(
            store.raw_vector().add(&[1.0]),
            Err(RawVectorError::DimensionMismatch { expected: DIM, actual: 1 })
        ));
        store.flush_once().await.unwrap();
    }

    let store = open_store(&dir).await;
    let n = store.get_disk_vec_num().await.unwrap();
    store.load(n).await.unwrap();
    assert_eq!(n, 3);
    assert_eq!(store.raw_vector().get(1).unwrap(), vector(1));
}

#[test]
fn kv_errors_map_to_store_errors() {
    let corrupt = KvError::Corruption {
        segment: "0000000001.seg".to_string(),
        offset: 64,
        reason: "checksum mismatch".to_string(),
    };
    assert!(matches!(StoreError::from(corrupt), StoreError::Corruption(_)));
    let io = KvError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
    assert!(matches!(StoreError::from(io), StoreError::Io(_)));
    let too_large = KvError::ValueTooLarge { size: 10, max: 1 };
    assert!(matches!(StoreError::from(too_large), StoreError::Io(_)));
}

#[tokio::test]
async fn oversized_disk_count_fails_load_with_corruption() {
    let dir = tempdir().unwrap();
    let kv = Arc::new(
        SegmentStore::open(dir.path().join("kv"), SegmentConfig::default())
            .await
            .unwrap(),
    );
    kv.put(&vector_key(0), &encode_vector(&vector(0)))
        .await
        .unwrap();
    kv.put(&meta_key("disk_vec_num"), &(1u64 << 62).to_le_bytes())
        .await
        .unwrap();

    let store = MemoryRawVectorIo::with_backend(raw_vector(), test_config(&dir), kv);
    store.init().await.unwrap();
    let n = store.get_disk_vec_num().await.unwrap();
    assert_eq!(n, 1 << 62);
    assert!(matches!(store.load(n).await, Err(StoreError::Corruption(_))));
    assert!(matches!(store.load(u64::MAX).await, Err(StoreError::Corruption(_))));
    assert_eq!(store.raw_vector().next_vid(), 0);

    store.load(1).await.unwrap();
    assert_eq!(store.raw_vector().get(0).unwrap(), vector(0));
}

#[tokio::test]
async fn flush_does_not_block_memory_access() {
    let dir = tempdir().unwrap();
    let (store, kv) = controlled_store(&dir).await;
    fill(&store, 2);
    kv.hold.store(true, Ordering::SeqCst);

    let flush = tokio::spawn({
        let store = Arc::clone(&store);
        async move { store.flush_once().await }
    });
    kv.entered.notified().await;

    // the flush is parked inside a backend write
    let raw = Arc::clone(store.raw_vector());
    let access = tokio::task::spawn_blocking(move || (raw.get(0), raw.add(&vector(2))));
    let (first, added) = tokio::time::timeout(Duration::from_secs(2), access)
        .await
        .expect("memory access waited on the flush")
        .unwrap();
    assert_eq!(first, Some(vector(0)));
    assert_eq!(added.unwrap(), 2);

    kv.release.add_permits(16);
    assert_eq!(
        flush.await.unwrap().unwrap(),
        FlushOutcome::Flushed { start: 0, end: 2 }
    );
    assert_eq!(
        store.flush_once().await.unwrap(),
        FlushOutcome::Flushed { start: 2, end: 3 }
    );
}
