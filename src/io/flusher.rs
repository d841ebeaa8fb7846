//! Background flushing of newly ingested vectors.
//!
//! Each store owns one [`AsyncFlusher`]. A tick calls `dump` for the vids
//! appended since the last successful flush; a failed dump leaves the
//! boundary where it was so the next tick retries the same range.

use super::{FlushOnce, FlushTarget, Result, StoreError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Vids `[start, end)` were dumped.
    Flushed { start: u64, end: u64 },
    /// Nothing new since the last flush.
    Idle,
    /// Another flush of the same store was still running.
    Skipped,
}

struct FlusherTask {
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

pub struct AsyncFlusher {
    name: String,
    last_flushed_vid: AtomicU64,
    in_progress: Mutex<()>,
    task: StdMutex<Option<FlusherTask>>,
}

impl AsyncFlusher {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            last_flushed_vid: AtomicU64::new(0),
            in_progress: Mutex::new(()),
            task: StdMutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Vids `[0, boundary)` have been dumped by this flusher.
    pub fn boundary(&self) -> u64 {
        self.last_flushed_vid.load(Ordering::Acquire)
    }

    pub(crate) fn reset_boundary(&self, vid: u64) {
        self.last_flushed_vid.store(vid, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.task_slot()
            .as_ref()
            .map_or(false, |task| !task.handle.is_finished())
    }

    /// Dump everything appended since the last successful flush.
    pub async fn flush_once<T: FlushTarget + ?Sized>(&self, target: &T) -> Result<FlushOutcome> {
        let Ok(_guard) = self.in_progress.try_lock() else {
            debug!(collection = %self.name, "flush already in progress, skipping");
            return Ok(FlushOutcome::Skipped);
        };

        let start = self.boundary();
        let end = target.next_vid();
        if end <= start {
            return Ok(FlushOutcome::Idle);
        }

        if let Err(e) = target.dump(start, end).await {
            warn!(collection = %self.name, start, end, "flush failed, will retry: {}", e);
            return Err(e);
        }
        self.last_flushed_vid.fetch_max(end, Ordering::AcqRel);
        debug!(collection = %self.name, start, end, "flushed");
        Ok(FlushOutcome::Flushed { start, end })
    }

    /// Spawn the periodic flush task. It holds only a weak reference and
    /// exits on its own once the target is dropped.
    #[instrument(skip(self, target), fields(collection = %self.name))]
    pub fn start<T: FlushTarget + 'static>(
        &self,
        target: Weak<T>,
        interval: Duration,
    ) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            StoreError::InvalidState("the flusher needs a running tokio runtime".to_string())
        })?;
        if interval.is_zero() {
            return Err(StoreError::InvalidState("flush interval must be > 0".to_string()));
        }

        let mut slot = self.task_slot();
        if slot.as_ref().map_or(false, |task| !task.handle.is_finished()) {
            return Err(StoreError::InvalidState(format!(
                "flusher for {} is already running",
                self.name
            )));
        }

        let shutdown = Arc::new(Notify::new());
        let handle = runtime.spawn(run_flusher(
            target,
            interval,
            Arc::clone(&shutdown),
            self.name.clone(),
        ));
        *slot = Some(FlusherTask { handle, shutdown });
        info!(?interval, "flusher started");
        Ok(())
    }

    /// Stop the periodic task, waiting for an in-flight flush to finish.
    pub async fn stop(&self) -> Result<()> {
        let task = self.task_slot().take();
        let Some(task) = task else {
            return Ok(());
        };
        task.shutdown.notify_one();
        task.handle
            .await
            .map_err(|e| StoreError::Flusher(e.to_string()))?;
        info!(collection = %self.name, "flusher stopped");
        Ok(())
    }

    fn task_slot(&self) -> std::sync::MutexGuard<'_, Option<FlusherTask>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for AsyncFlusher {
    fn drop(&mut self) {
        let slot = self.task.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = slot.take() {
            task.shutdown.notify_one();
        }
    }
}

async fn run_flusher<T: FlushTarget + 'static>(
    target: Weak<T>,
    interval: Duration,
    shutdown: Arc<Notify>,
    name: String,
) {
    let mut ticker = time::interval(interval);
    // a tick that fires while a flush is still running is dropped
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(target) = target.upgrade() else {
                    debug!(collection = %name, "store dropped, flusher exiting");
                    break;
                };
                // runs to completion even when shutdown is signalled meanwhile
                if let Err(e) = target.flush_once().await {
                    error!(collection = %name, "periodic flush failed: {}", e);
                }
            }
            _ = shutdown.notified() => break,
        }
    }
}
