//! Log-structured key-value store.
//!
//! Every put appends a framed record to the active segment; an ordered
//! in-memory index maps each live key to its newest record. Segments are
//! named by a zero-padded sequence number and replayed in that order on
//! open, so later writes win.

use super::record::{compress, frame_len, ParseError, StorageRecord};
use super::{prefix_successor, KvError, KvStore, Result, SegmentConfig};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{BufWriter, Read, Seek, SeekFrom, Write},
    ops::Bound,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

const SEGMENT_EXTENSION: &str = "seg";

/// Storage engine metrics
#[derive(Debug, Default)]
struct StorageMetrics {
    read_count: AtomicU64,
    write_count: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    compaction_count: AtomicU64,
}

/// Storage metrics snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct StorageMetricsSnapshot {
    pub read_count: u64,
    pub write_count: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub compaction_count: u64,
    pub segments: usize,
    pub live_keys: usize,
    pub garbage_ratio: f64,
}

/// Where the newest record of a key lives.
#[derive(Debug, Clone, Copy)]
struct Location {
    segment: u64,
    offset: u64,
    len: u64,
}

struct Segment {
    path: PathBuf,
    reader: Mutex<File>,
}

struct ActiveSegment {
    seq: u64,
    writer: BufWriter<File>,
    size: u64,
}

struct SegmentState {
    segments: BTreeMap<u64, Arc<Segment>>,
    active: ActiveSegment,
    index: BTreeMap<Vec<u8>, Location>,
    live_bytes: u64,
    total_bytes: u64,
}

pub struct SegmentStore {
    dir: PathBuf,
    config: SegmentConfig,
    state: RwLock<SegmentState>,
    metrics: StorageMetrics,
}

impl SegmentStore {
    /// Open (or create) the store under `dir`, replaying existing segments.
    #[instrument(skip_all, fields(dir = %dir.as_ref().display()))]
    pub async fn open(dir: impl AsRef<Path>, config: SegmentConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let seqs = Self::list_segments(&dir)?;
        let mut segments = BTreeMap::new();
        let mut index = BTreeMap::new();
        let mut live_bytes = 0u64;
        let mut total_bytes = 0u64;

        for (i, &seq) in seqs.iter().enumerate() {
            let path = Self::segment_path(&dir, seq);
            let is_newest = i + 1 == seqs.len();
            let size = Self::replay_segment(&path, seq, is_newest, &config, &mut index)?;
            total_bytes += size;
            segments.insert(seq, Arc::new(Self::open_reader(path)?));
        }
        for loc in index.values() {
            live_bytes += loc.len;
        }

        let active_seq = seqs.last().copied().unwrap_or(1);
        if seqs.is_empty() {
            let path = Self::segment_path(&dir, active_seq);
            Self::create_file(&path)?;
            segments.insert(active_seq, Arc::new(Self::open_reader(path)?));
        }
        let active = Self::open_writer(&dir, active_seq)?;

        info!(
            segments = segments.len(),
            keys = index.len(),
            bytes = total_bytes,
            "segment store opened"
        );

        Ok(Self {
            dir,
            config,
            state: RwLock::new(SegmentState {
                segments,
                active,
                index,
                live_bytes,
                total_bytes,
            }),
            metrics: StorageMetrics::default(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Share of on-disk bytes held by overwritten records.
    pub async fn garbage_ratio(&self) -> f64 {
        let state = self.state.read().await;
        Self::garbage(&state)
    }

    pub async fn metrics(&self) -> StorageMetricsSnapshot {
        let state = self.state.read().await;
        StorageMetricsSnapshot {
            read_count: self.metrics.read_count.load(Ordering::Relaxed),
            write_count: self.metrics.write_count.load(Ordering::Relaxed),
            bytes_read: self.metrics.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.metrics.bytes_written.load(Ordering::Relaxed),
            compaction_count: self.metrics.compaction_count.load(Ordering::Relaxed),
            segments: state.segments.len(),
            live_keys: state.index.len(),
            garbage_ratio: Self::garbage(&state),
        }
    }

    /// Rewrite all live records into a fresh segment and drop the old ones.
    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    pub async fn compact(&self) -> Result<()> {
        let start = Instant::now();
        let mut state = self.state.write().await;
        state.active.writer.flush()?;

        let new_seq = state.active.seq + 1;
        let new_path = Self::segment_path(&self.dir, new_seq);
        let mut out = BufWriter::new(Self::create_file(&new_path)?);
        let mut new_index = BTreeMap::new();
        let mut offset = 0u64;

        for (key, loc) in state.index.iter() {
            let raw = Self::read_raw(&state, *loc).await?;
            out.write_all(&raw)?;
            new_index.insert(
                key.clone(),
                Location {
                    segment: new_seq,
                    offset,
                    len: loc.len,
                },
            );
            offset += loc.len;
        }
        out.flush()?;
        out.get_ref().sync_data()?;
        drop(out);

        let old: Vec<Arc<Segment>> = state.segments.values().cloned().collect();
        state.segments.clear();
        state
            .segments
            .insert(new_seq, Arc::new(Self::open_reader(new_path)?));
        state.active = Self::open_writer(&self.dir, new_seq)?;
        state.index = new_index;
        state.live_bytes = offset;
        state.total_bytes = offset;

        for segment in old {
            if let Err(e) = fs::remove_file(&segment.path) {
                warn!(path = %segment.path.display(), "failed to remove compacted segment: {}", e);
            }
        }

        self.metrics.compaction_count.fetch_add(1, Ordering::Relaxed);
        info!(
            "compaction completed in {:?}, new size: {} bytes",
            start.elapsed(),
            offset
        );
        Ok(())
    }

    async fn read_value(&self, state: &SegmentState, loc: Location) -> Result<Bytes> {
        let raw = Self::read_raw(state, loc).await?;
        let (record, _) = StorageRecord::parse(&raw, self.config.enable_checksums).map_err(|e| {
            KvError::Corruption {
                segment: Self::segment_path(&self.dir, loc.segment).display().to_string(),
                offset: loc.offset,
                reason: format!("{:?}", e),
            }
        })?;
        self.metrics.read_count.fetch_add(1, Ordering::Relaxed);
        self.metrics.bytes_read.fetch_add(loc.len, Ordering::Relaxed);
        record.decoded_value()
    }

    async fn read_raw(state: &SegmentState, loc: Location) -> Result<Vec<u8>> {
        let segment = state
            .segments
            .get(&loc.segment)
            .ok_or_else(|| KvError::Corruption {
                segment: format!("#{}", loc.segment),
                offset: loc.offset,
                reason: "segment missing from the store".to_string(),
            })?;
        let mut file = segment.reader.lock().await;
        file.seek(SeekFrom::Start(loc.offset))?;
        let mut buf = vec![0u8; loc.len as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn append(&self, state: &mut SegmentState, record: &StorageRecord) -> Result<Location> {
        let size = record.size() as u64;
        if state.active.size > 0 && state.active.size + size > self.config.max_segment_size {
            self.rotate(state)?;
        }

        let mut buffer = BytesMut::with_capacity(record.size());
        record.serialize(&mut buffer);

        let written = state
            .active
            .writer
            .write_all(&buffer)
            .and_then(|_| state.active.writer.flush());
        if let Err(e) = written {
            self.discard_partial_write(state);
            return Err(e.into());
        }

        let loc = Location {
            segment: state.active.seq,
            offset: state.active.size,
            len: size,
        };
        state.active.size += size;
        Ok(loc)
    }

    /// Drop whatever part of a failed append reached the file so that the
    /// next record starts at the tracked offset.
    fn discard_partial_write(&self, state: &mut SegmentState) {
        let seq = state.active.seq;
        let size = state.active.size;
        let replacement = Self::open_writer(&self.dir, seq).and_then(|fresh| {
            fresh.writer.get_ref().set_len(size)?;
            Ok(ActiveSegment { size, ..fresh })
        });
        match replacement {
            Ok(active) => {
                let old = std::mem::replace(&mut state.active, active);
                // into_parts drops the buffered bytes instead of flushing them
                let _ = old.writer.into_parts();
            }
            Err(e) => warn!(seq, "failed to reset active segment after write error: {}", e),
        }
    }

    fn rotate(&self, state: &mut SegmentState) -> Result<()> {
        state.active.writer.flush()?;
        state.active.writer.get_ref().sync_data()?;

        let seq = state.active.seq + 1;
        let path = Self::segment_path(&self.dir, seq);
        Self::create_file(&path)?;
        state
            .segments
            .insert(seq, Arc::new(Self::open_reader(path)?));
        state.active = Self::open_writer(&self.dir, seq)?;
        debug!(seq, "rotated to new segment");
        Ok(())
    }

    fn garbage(state: &SegmentState) -> f64 {
        if state.total_bytes == 0 {
            0.0
        } else {
            1.0 - state.live_bytes as f64 / state.total_bytes as f64
        }
    }

    fn list_segments(dir: &Path) -> Result<Vec<u64>> {
        let mut seqs = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().map_or(true, |ext| ext != SEGMENT_EXTENSION) {
                continue;
            }
            match path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                Some(seq) => seqs.push(seq),
                None => warn!(path = %path.display(), "ignoring unrecognised segment file"),
            }
        }
        seqs.sort_unstable();
        Ok(seqs)
    }

    /// Index every record of one segment. A torn record at the end of the
    /// newest segment is cut off; anything else unreadable is corruption.
    fn replay_segment(
        path: &Path,
        seq: u64,
        is_newest: bool,
        config: &SegmentConfig,
        index: &mut BTreeMap<Vec<u8>, Location>,
    ) -> Result<u64> {
        let data = fs::read(path)?;
        let mut offset = 0usize;

        while offset < data.len() {
            match StorageRecord::parse(&data[offset..], config.enable_checksums) {
                Ok((record, len)) => {
                    index.insert(
                        record.key.to_vec(),
                        Location {
                            segment: seq,
                            offset: offset as u64,
                            len: len as u64,
                        },
                    );
                    offset += len;
                }
                Err(ParseError::Incomplete | ParseError::ChecksumMismatch)
                    if is_newest && Self::is_tail(&data[offset..]) =>
                {
                    warn!(
                        path = %path.display(),
                        offset,
                        dropped = data.len() - offset,
                        "truncating torn record at segment tail"
                    );
                    OpenOptions::new()
                        .write(true)
                        .open(path)?
                        .set_len(offset as u64)?;
                    break;
                }
                Err(e) => {
                    return Err(KvError::Corruption {
                        segment: path.display().to_string(),
                        offset: offset as u64,
                        reason: format!("{:?}", e),
                    })
                }
            }
        }
        Ok(offset as u64)
    }

    /// True when the unreadable bytes are the last record of the file.
    fn is_tail(rest: &[u8]) -> bool {
        match StorageRecord::parse(rest, false) {
            Err(ParseError::Incomplete) => true,
            Ok((_, len)) => len == rest.len(),
            Err(_) => false,
        }
    }

    fn segment_path(dir: &Path, seq: u64) -> PathBuf {
        dir.join(format!("{:010}.{}", seq, SEGMENT_EXTENSION))
    }

    fn create_file(path: &Path) -> Result<File> {
        Ok(OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?)
    }

    fn open_reader(path: PathBuf) -> Result<Segment> {
        let file = File::open(&path)?;
        Ok(Segment {
            path,
            reader: Mutex::new(file),
        })
    }

    fn open_writer(dir: &Path, seq: u64) -> Result<ActiveSegment> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(Self::segment_path(dir, seq))?;
        let size = file.metadata()?.len();
        Ok(ActiveSegment {
            seq,
            writer: BufWriter::new(file),
            size,
        })
    }
}

#[async_trait]
impl KvStore for SegmentStore {
    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if value.len() > self.config.max_value_size {
            return Err(KvError::ValueTooLarge {
                size: value.len(),
                max: self.config.max_value_size,
            });
        }
        let stored = compress(value, self.config.compression)?;
        frame_len(key.len())?;
        frame_len(stored.len())?;
        let record = StorageRecord {
            key: Bytes::copy_from_slice(key),
            value: stored,
            compression: self.config.compression,
            timestamp: chrono::Utc::now().timestamp_micros().max(0) as u64,
        };

        let mut state = self.state.write().await;
        let loc = self.append(&mut state, &record)?;
        state.total_bytes += loc.len;
        state.live_bytes += loc.len;
        if let Some(old) = state.index.insert(key.to_vec(), loc) {
            state.live_bytes -= old.len;
        }

        self.metrics.write_count.fetch_add(1, Ordering::Relaxed);
        self.metrics.bytes_written.fetch_add(loc.len, Ordering::Relaxed);
        Ok(())
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let state = self.state.read().await;
        let Some(loc) = state.index.get(key).copied() else {
            return Ok(None);
        };
        self.read_value(&state, loc).await.map(Some)
    }

    async fn scan(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Bytes, Bytes)>> {
        let state = self.state.read().await;
        if start >= end {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for (key, loc) in state
            .index
            .range::<[u8], _>((Bound::Included(start), Bound::Excluded(end)))
        {
            let value = self.read_value(&state, *loc).await?;
            entries.push((Bytes::copy_from_slice(key), value));
        }
        Ok(entries)
    }

    async fn last_key(&self, prefix: &[u8]) -> Result<Option<Bytes>> {
        let state = self.state.read().await;
        let upper = match prefix_successor(prefix) {
            Some(end) => state
                .index
                .range::<[u8], _>((Bound::Included(prefix), Bound::Excluded(end.as_slice())))
                .next_back(),
            None => state
                .index
                .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
                .next_back(),
        };
        Ok(upper.map(|(key, _)| Bytes::copy_from_slice(key)))
    }

    async fn sync(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.active.writer.flush()?;
        state.active.writer.get_ref().sync_data()?;
        Ok(())
    }

    async fn maybe_compact(&self) -> Result<bool> {
        let ratio = self.garbage_ratio().await;
        if ratio <= f64::from(self.config.compaction_threshold) {
            debug!(
                "skipping compaction, garbage ratio {:.2} within threshold {:.2}",
                ratio, self.config.compaction_threshold
            );
            return Ok(false);
        }
        self.compact().await?;
        Ok(true)
    }
}
