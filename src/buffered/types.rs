use super::engine::BufferedTaskHandle;
use anyhow::{bail, Result};
use futures::future::BoxFuture;
use std::fmt;
use std::hash::Hash;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_MAX_BATCH_SIZE: usize = 100;
const DEFAULT_MAX_CONCURRENCY: usize = 4;
const DEFAULT_MAX_RETRIES: usize = 3;
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 3_000;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 250;

/// Work executed by a [`super::BufferedTask`].
pub trait BufferedWorker: Send + Sync + Sized + 'static {
    type Entry: Clone + Send + Sync + fmt::Debug + 'static;
    type Key: Clone + Eq + Hash + Send + Sync + fmt::Debug + 'static;

    /// Identity of an entry. A batch never holds two entries with the same
    /// key, and a key is never in flight twice.
    fn key(&self, entry: &Self::Entry) -> Self::Key;

    /// Folds a newly enqueued entry into a buffered one with the same key.
    fn merge(&self, existing: Self::Entry, _incoming: Self::Entry) -> Self::Entry {
        existing
    }

    fn run(
        &self,
        batch: Vec<Self::Entry>,
        ctx: BatchContext<Self>,
    ) -> BoxFuture<'_, Result<BatchOutcome<Self::Entry>>>;

    /// Called once for every entry dropped after exhausting its retries.
    fn on_discard(&self, _entry: &Self::Entry, _failures: usize) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome<E> {
    Done,
    /// Only these entries failed and should be tried again.
    Retry(Vec<E>),
}

/// Passed to every batch run.
pub struct BatchContext<W: BufferedWorker> {
    pub handle: BufferedTaskHandle<W>,
    pub cancellation: CancellationToken,
    pub batch_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferedTaskConfig {
    pub max_batch_size: usize,
    pub max_concurrency: usize,
    pub max_retries: usize,
    /// Cadence at which partial batches are dispatched. Zero dispatches eagerly.
    pub flush_interval: Duration,
    /// Delay before entries of a failed batch rejoin the buffer.
    pub retry_backoff: Duration,
}

impl Default for BufferedTaskConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
        }
    }
}

impl BufferedTaskConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            bail!("max_batch_size must be greater than 0");
        }
        if self.max_concurrency == 0 {
            bail!("max_concurrency must be greater than 0");
        }
        Ok(())
    }
}

/// Buffered entries and running batches, read under one lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugCount {
    pub buffered: usize,
    pub tasks: usize,
}

impl DebugCount {
    pub fn is_idle(&self) -> bool {
        self.buffered == 0 && self.tasks == 0
    }
}

/// Type-erased view of a running engine used by diagnostics.
pub trait BufferProbe: Send + Sync {
    fn name(&self) -> &'static str;

    fn debug_count(&self) -> BoxFuture<'_, DebugCount>;

    fn stats(&self) -> BufferedTaskStatsSnapshot;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferedTaskStatsSnapshot {
    pub batches: u64,
    pub completed: u64,
    pub retried: u64,
    pub discarded: u64,
    pub panics: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Stop dispatching and wait for running batches to settle.
    Graceful,
    /// Abort running batches.
    Hard,
}
