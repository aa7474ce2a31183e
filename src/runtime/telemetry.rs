use crate::buffered::BufferProbe;
use crate::rpc::ChainRpc;
use crate::storage::ChainStore;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(5);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Counters owned by one fetch orchestrator.
#[derive(Default, Debug)]
pub struct FetchState {
    ranges: AtomicU64,
    blocks: AtomicU64,
    transactions: AtomicU64,
    logs: AtomicU64,
    internal_transactions: AtomicU64,
    addresses: AtomicU64,
    requeued_ranges: AtomicU64,
    rpc_errors: AtomicU64,
    storage_errors: AtomicU64,
}

/// Entity counts of one successful import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportCounts {
    pub blocks: u64,
    pub transactions: u64,
    pub logs: u64,
    pub internal_transactions: u64,
    pub addresses: u64,
}

impl FetchState {
    pub fn record_range(&self, counts: ImportCounts) {
        self.ranges.fetch_add(1, Ordering::Relaxed);
        self.record_import(counts);
    }

    pub fn record_import(&self, counts: ImportCounts) {
        self.blocks.fetch_add(counts.blocks, Ordering::Relaxed);
        self.transactions
            .fetch_add(counts.transactions, Ordering::Relaxed);
        self.logs.fetch_add(counts.logs, Ordering::Relaxed);
        self.internal_transactions
            .fetch_add(counts.internal_transactions, Ordering::Relaxed);
        self.addresses.fetch_add(counts.addresses, Ordering::Relaxed);
    }

    pub fn record_requeue(&self) {
        self.requeued_ranges.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rpc_error(&self) {
        self.rpc_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_storage_error(&self) {
        self.storage_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FetchStateSnapshot {
        FetchStateSnapshot {
            ranges: self.ranges.load(Ordering::Relaxed),
            blocks: self.blocks.load(Ordering::Relaxed),
            transactions: self.transactions.load(Ordering::Relaxed),
            logs: self.logs.load(Ordering::Relaxed),
            internal_transactions: self.internal_transactions.load(Ordering::Relaxed),
            addresses: self.addresses.load(Ordering::Relaxed),
            requeued_ranges: self.requeued_ranges.load(Ordering::Relaxed),
            rpc_errors: self.rpc_errors.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
        }
    }

    pub fn blocks(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }

    pub fn requeued_ranges(&self) -> u64 {
        self.requeued_ranges.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct FetchStateSnapshot {
    pub ranges: u64,
    pub blocks: u64,
    pub transactions: u64,
    pub logs: u64,
    pub internal_transactions: u64,
    pub addresses: u64,
    pub requeued_ranges: u64,
    pub rpc_errors: u64,
    pub storage_errors: u64,
}

pub struct MetricsReporterParams {
    pub fetch_state: Arc<FetchState>,
    pub store: Arc<dyn ChainStore>,
    pub rpc: Arc<dyn ChainRpc>,
    pub buffers: Vec<Arc<dyn BufferProbe>>,
    /// Reporter only logs while this is set.
    pub enabled: Arc<AtomicBool>,
    pub shutdown: CancellationToken,
    pub interval: Duration,
}

/// Spawns a background task that periodically logs persisted counts, import
/// throughput, RPC counters, and buffered-task counters while debug logs are
/// enabled.
pub fn spawn_metrics_reporter(params: MetricsReporterParams) -> JoinHandle<()> {
    let MetricsReporterParams {
        fetch_state,
        store,
        rpc,
        buffers,
        enabled,
        shutdown,
        interval,
    } = params;

    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = fetch_state.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "chainindex::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current_snapshot = fetch_state.snapshot();
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let blocks_delta = current_snapshot
                        .blocks
                        .saturating_sub(last_snapshot.blocks);
                    last_snapshot = current_snapshot;
                    last_tick = Instant::now();

                    if !enabled.load(Ordering::Relaxed) {
                        continue;
                    }

                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        blocks_delta as f64 / elapsed
                    };

                    match store.persisted_counts().await {
                        Ok(persisted) => tracing::info!(
                            target: "chainindex::metrics",
                            blocks = persisted.blocks,
                            transactions = persisted.transactions,
                            internal_transactions = persisted.internal_transactions,
                            logs = persisted.logs,
                            addresses = persisted.addresses,
                            "persisted counts"
                        ),
                        Err(err) => tracing::warn!(
                            target: "chainindex::metrics",
                            error = %err,
                            "failed to read persisted counts"
                        ),
                    }

                    tracing::info!(
                        target: "chainindex::metrics",
                        throughput = format!("{throughput:.2}"),
                        ranges = current_snapshot.ranges,
                        blocks = current_snapshot.blocks,
                        transactions = current_snapshot.transactions,
                        requeued_ranges = current_snapshot.requeued_ranges,
                        rpc_errors = current_snapshot.rpc_errors,
                        storage_errors = current_snapshot.storage_errors,
                        "fetch state snapshot"
                    );

                    if let Some(metrics) = rpc.rpc_metrics() {
                        tracing::info!(
                            target: "chainindex::metrics",
                            requests = metrics.total_requests,
                            errors = metrics.total_errors,
                            timeouts = metrics.total_timeouts,
                            avg_latency_ms = format!("{:.2}", metrics.average_latency_ms),
                            avg_batch_size = format!("{:.1}", metrics.average_batch_size),
                            missing_blocks = metrics.missing_blocks,
                            "rpc counters"
                        );
                    }

                    for buffer in &buffers {
                        let count = buffer.debug_count().await;
                        let stats = buffer.stats();
                        tracing::info!(
                            target: "chainindex::metrics",
                            task = buffer.name(),
                            buffered = count.buffered,
                            tasks = count.tasks,
                            retried = stats.retried,
                            discarded = stats.discarded,
                            "buffered task counters"
                        );
                    }
                }
            }
        }
    })
}
