//! Block fetch orchestration.
//!
//! `BlockFetcher` composes smaller modules so each concern is owned by the
//! component that knows it best:
//! - `sequencer` decides which ranges the catch-up and follow-head loops pull.
//! - `balances` and `internal_transactions` are the buffered follow-up
//!   fetchers fed by every imported range.
//! - `tip` keeps the chain head fresh and extends the follow-head sequence.
//! - `lifecycle` wires run-scoped cancellation, the metrics reporter, and
//!   fatal error propagation.
//! - `pending` polls the pending block when enabled.

use super::backoff::{retry_with_backoff, Backoff};
use super::balances::{balance_requests, BalanceFetcher, BalanceFetcherHandle, BALANCE_FETCHER};
use super::internal_transactions::{
    InternalTransactionFetcher, InternalTransactionFetcherHandle,
    InternalTransactionFetcherParams, INTERNAL_TRANSACTION_FETCHER,
};
use super::lifecycle::{HeadRefreshParams, LifecycleHandles};
use super::pending::PendingTransactionsPoller;
use super::tip::ChainHead;
use crate::addresses::{extract_addresses, EntityBatch, ExtractOptions};
use crate::buffered::{BufferProbe, BufferedTask, DebugCount, ShutdownMode};
use crate::model::{BlockRange, InternalTransaction, Transaction, TransactionRef};
use crate::rpc::{AsyncRpcClient, ChainRpc, FetchedBlocks};
use crate::runtime::config::IndexerConfig;
use crate::runtime::fatal::{FatalErrorHandler, FatalStage};
use crate::runtime::progress::ProgressTracker;
use crate::runtime::telemetry::{FetchState, ImportCounts, MetricsReporterParams};
use crate::sequencer::RangeSequence;
use crate::storage::{BlockImport, ChainStore, PersistedCounts};
use alloy_primitives::B256;
use anyhow::{bail, Context, Error, Result};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const HEAD_FETCH_ATTEMPTS: usize = 5;
const HEAD_FETCH_INITIAL_DELAY: Duration = Duration::from_millis(200);
const HEAD_FETCH_MAX_DELAY: Duration = Duration::from_secs(2);
const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(20);

pub struct BlockFetcher {
    config: IndexerConfig,
    rpc: Arc<dyn ChainRpc>,
    store: Arc<dyn ChainStore>,
    shutdown_root: CancellationToken,
    fetch_state: Arc<FetchState>,
    progress: Arc<ProgressTracker>,
    head: Arc<ChainHead>,
    debug_logs: Arc<AtomicBool>,
    run: Option<RunHandles>,
    lifecycle: Option<LifecycleHandles>,
}

/// Buffered-task counters of both follow-up fetchers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetcherCounts {
    pub balances: DebugCount,
    /// `None` when internal transaction indexing is disabled.
    pub internal_transactions: Option<DebugCount>,
}

/// Where the catch-up and follow-head loops start, derived from the chain
/// head and what the store already holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RangePlan {
    pub catchup: Option<CatchupPlan>,
    pub follow_from: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CatchupPlan {
    pub gaps: Vec<BlockRange>,
    pub start: Option<u64>,
}

struct RunHandles {
    balances: BufferedTask<BalanceFetcher>,
    internal_transactions: Option<BufferedTask<InternalTransactionFetcher>>,
    catchup: Option<Arc<RangeSequence>>,
    follow: Option<Arc<RangeSequence>>,
    loops: Vec<JoinHandle<Result<()>>>,
    pending: Option<JoinHandle<()>>,
}

/// Everything a range loop needs to import one range.
#[derive(Clone)]
struct RangeImporter {
    rpc: Arc<dyn ChainRpc>,
    store: Arc<dyn ChainStore>,
    balances: BalanceFetcherHandle,
    internal_transactions: Option<InternalTransactionFetcherHandle>,
    fatal: FatalErrorHandler,
    fetch_state: Arc<FetchState>,
    progress: Arc<ProgressTracker>,
}

enum RangeFailure {
    /// Upstream or storage failure; the range goes back to the sequence.
    Transient(Error),
    /// Already reported to the fatal handler.
    Fatal(Error),
}

impl BlockFetcher {
    /// Creates a fetcher over the given collaborators with its own root
    /// cancellation token.
    pub fn new(
        config: IndexerConfig,
        rpc: Arc<dyn ChainRpc>,
        store: Arc<dyn ChainStore>,
    ) -> Self {
        Self::with_cancellation_token(config, rpc, store, CancellationToken::new())
    }

    /// Creates a fetcher whose runs derive their cancellation from `shutdown_token`.
    pub fn with_cancellation_token(
        config: IndexerConfig,
        rpc: Arc<dyn ChainRpc>,
        store: Arc<dyn ChainStore>,
        shutdown_token: CancellationToken,
    ) -> Self {
        let debug_logs = Arc::new(AtomicBool::new(config.debug_logs()));
        Self {
            config,
            rpc,
            store,
            shutdown_root: shutdown_token,
            fetch_state: Arc::new(FetchState::default()),
            progress: Arc::new(ProgressTracker::new()),
            head: Arc::new(ChainHead::new(None)),
            debug_logs,
            run: None,
            lifecycle: None,
        }
    }

    /// Builds the JSON-RPC client described by `config`.
    pub fn from_config(config: IndexerConfig, store: Arc<dyn ChainStore>) -> Result<Self> {
        let rpc = AsyncRpcClient::from_config(&config).context("failed to build RPC client")?;
        Ok(Self::new(config, Arc::new(rpc), store))
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    pub fn fetch_state(&self) -> Arc<FetchState> {
        self.fetch_state.clone()
    }

    pub fn progress(&self) -> Arc<ProgressTracker> {
        self.progress.clone()
    }

    /// Last chain head seen by this fetcher.
    pub fn chain_head(&self) -> Option<u64> {
        self.head.current()
    }

    pub fn is_running(&self) -> bool {
        self.run.is_some()
    }

    /// Replaces the root shutdown token used to derive per-run cancellation tokens.
    /// This must only be called while the fetcher is idle (i.e. between `stop` and `start`).
    pub fn replace_shutdown_root(&mut self, shutdown: CancellationToken) {
        debug_assert!(
            self.run.is_none(),
            "shutdown token should not change while the fetcher is running"
        );
        self.shutdown_root = shutdown;
    }

    pub fn enable_debug_logs(&self) {
        self.debug_logs.store(true, Ordering::Relaxed);
        tracing::info!("debug logs enabled");
    }

    pub fn disable_debug_logs(&self) {
        self.debug_logs.store(false, Ordering::Relaxed);
        tracing::info!("debug logs disabled");
    }

    pub fn debug_logs_enabled(&self) -> bool {
        self.debug_logs.load(Ordering::Relaxed)
    }

    /// Entity counts as held by the store.
    pub async fn persisted_counts(&self) -> Result<PersistedCounts> {
        self.store
            .persisted_counts()
            .await
            .context("failed to read persisted counts")
    }

    /// Buffered and running work of the follow-up fetchers, `None` while stopped.
    pub async fn fetcher_counts(&self) -> Option<FetcherCounts> {
        let run = self.run.as_ref()?;
        let internal_transactions = match &run.internal_transactions {
            Some(task) => Some(task.debug_count().await),
            None => None,
        };
        Some(FetcherCounts {
            balances: run.balances.debug_count().await,
            internal_transactions,
        })
    }

    /// Discovers gaps, seeds the follow-up fetchers, and starts the range
    /// loops. Returns an error if the fetcher is already running.
    pub async fn start(&mut self) -> Result<()> {
        if self.run.is_some() {
            bail!("fetcher already running");
        }

        debug_assert!(
            self.config.validate().is_ok(),
            "IndexerConfig should have been validated at construction time"
        );

        let head = self.fetch_initial_head().await?;
        self.head.update(head);
        self.progress.reset();

        let bounds = self
            .store
            .indexed_bounds()
            .await
            .context("failed to read indexed block bounds")?;
        let internal_gaps = match bounds {
            Some(bounds) if self.config.catchup() => self
                .store
                .missing_block_ranges(bounds)
                .await
                .context("failed to read missing block ranges")?,
            _ => Vec::new(),
        };
        let plan = plan_ranges(&self.config, head, bounds, internal_gaps);

        tracing::info!(
            head,
            indexed = ?bounds.map(|range| range.to_string()),
            catchup_gaps = plan.catchup.as_ref().map_or(0, |catchup| catchup.gaps.len()),
            catchup_start = ?plan.catchup.as_ref().and_then(|catchup| catchup.start),
            follow_from = ?plan.follow_from,
            "starting block fetcher"
        );

        let mut lifecycle = LifecycleHandles::new(&self.shutdown_root);
        match self.launch(&mut lifecycle, plan, head).await {
            Ok(run) => {
                self.run = Some(run);
                self.lifecycle = Some(lifecycle);
                Ok(())
            }
            Err(err) => {
                lifecycle.shutdown().await;
                Err(err)
            }
        }
    }

    /// Resolves once both loops are idle and both follow-up fetchers report
    /// nothing buffered and nothing running. Errors if the run is cancelled
    /// first.
    pub async fn wait_until_settled(&self) -> Result<()> {
        let (Some(run), Some(lifecycle)) = (&self.run, &self.lifecycle) else {
            bail!("fetcher is not running");
        };

        let settled = async {
            while !run.is_settled().await {
                tokio::time::sleep(SETTLE_POLL_INTERVAL).await;
            }
        };

        tokio::select! {
            _ = settled => Ok(()),
            _ = lifecycle.run_token.cancelled() => match lifecycle.error() {
                Some(err) => Err(err).context("block processing pipeline aborted"),
                None => bail!("fetcher stopped before settling"),
            },
        }
    }

    /// Stops the pipeline. Buffered follow-up work is abandoned; every write
    /// is idempotent so the next run picks it up again. A fatal error raised
    /// during the run is returned here.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(run) = self.run.take() else {
            return Ok(());
        };

        tracing::info!("stopping block fetcher");

        if let Some(handles) = &self.lifecycle {
            handles.run_token.cancel();
        }

        let pipeline_error = run.shutdown().await;
        tracing::debug!("block fetcher stop: range loops and fetchers joined");

        let lifecycle_error = self.lifecycle.as_ref().and_then(|handles| handles.error());
        if let Some(handles) = self.lifecycle.take() {
            handles.shutdown().await;
        }

        if let Some(err) = pipeline_error.or(lifecycle_error) {
            return Err(err).context("block processing pipeline aborted");
        }

        Ok(())
    }

    async fn fetch_initial_head(&self) -> Result<u64> {
        let rpc = &self.rpc;
        retry_with_backoff(
            Backoff::new(HEAD_FETCH_INITIAL_DELAY, HEAD_FETCH_MAX_DELAY),
            HEAD_FETCH_ATTEMPTS,
            &self.shutdown_root,
            |_| rpc.latest_block_number(),
            |attempt, backoff, err, will_retry| {
                tracing::warn!(
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    will_retry,
                    error = %err,
                    "failed to fetch chain head"
                );
            },
        )
        .await
        .context("failed to fetch chain head")
    }

    async fn launch(
        &self,
        lifecycle: &mut LifecycleHandles,
        plan: RangePlan,
        head: u64,
    ) -> Result<RunHandles> {
        let run_token = lifecycle.run_token.clone();
        let fatal = lifecycle.fatal_handler();

        let balances = BufferedTask::spawn(
            BALANCE_FETCHER,
            Arc::new(BalanceFetcher::new(self.rpc.clone(), self.store.clone())),
            self.config.balance_fetcher_config(),
            &run_token,
        )
        .context("failed to start balance fetcher")?;

        let internal_transactions = if self.config.index_internal_transactions() {
            let worker = InternalTransactionFetcher::new(InternalTransactionFetcherParams {
                rpc: self.rpc.clone(),
                store: self.store.clone(),
                balances: balances.handle(),
                fatal: fatal.clone(),
                fetch_state: self.fetch_state.clone(),
            });
            Some(
                BufferedTask::spawn(
                    INTERNAL_TRANSACTION_FETCHER,
                    Arc::new(worker),
                    self.config.internal_transaction_fetcher_config(),
                    &run_token,
                )
                .context("failed to start internal transaction fetcher")?,
            )
        } else {
            None
        };

        self.seed_fetchers(&balances, internal_transactions.as_ref())
            .await?;

        let batch_size = self.config.blocks_batch_size();
        let catchup = plan
            .catchup
            .map(|catchup| Arc::new(RangeSequence::catchup(catchup.gaps, catchup.start, batch_size)));
        let follow = match plan.follow_from {
            Some(from) => {
                let sequence = Arc::new(RangeSequence::follow_head(from, batch_size));
                sequence.extend_to(head).await;
                Some(sequence)
            }
            None => None,
        };

        let mut buffers: Vec<Arc<dyn BufferProbe>> = vec![Arc::new(balances.handle())];
        if let Some(task) = &internal_transactions {
            buffers.push(Arc::new(task.handle()));
        }
        lifecycle.spawn_metrics_reporter(MetricsReporterParams {
            fetch_state: self.fetch_state.clone(),
            store: self.store.clone(),
            rpc: self.rpc.clone(),
            buffers,
            enabled: self.debug_logs.clone(),
            shutdown: run_token.clone(),
            interval: self.config.metrics_interval(),
        });
        lifecycle.spawn_head_refresher(HeadRefreshParams {
            rpc: self.rpc.clone(),
            head: self.head.clone(),
            follow: follow.clone(),
            interval: self.config.head_refresh_interval(),
        });

        let importer = RangeImporter {
            rpc: self.rpc.clone(),
            store: self.store.clone(),
            balances: balances.handle(),
            internal_transactions: internal_transactions.as_ref().map(|task| task.handle()),
            fatal: fatal.clone(),
            fetch_state: self.fetch_state.clone(),
            progress: self.progress.clone(),
        };

        let retry_backoff = self.config.retry_backoff();
        let mut loops = Vec::new();
        if let Some(sequence) = &catchup {
            loops.push(tokio::spawn(run_range_loop(
                importer.clone(),
                sequence.clone(),
                run_token.clone(),
                retry_backoff,
                "catchup",
            )));
        }
        if let Some(sequence) = &follow {
            loops.push(tokio::spawn(run_range_loop(
                importer,
                sequence.clone(),
                run_token.clone(),
                retry_backoff,
                "follow_head",
            )));
        }

        let pending = self.config.pending_transactions_interval().map(|interval| {
            PendingTransactionsPoller::new(self.rpc.clone(), self.store.clone(), fatal)
                .spawn(interval, run_token.clone())
        });

        Ok(RunHandles {
            balances,
            internal_transactions,
            catchup,
            follow,
            loops,
            pending,
        })
    }

    async fn seed_fetchers(
        &self,
        balances: &BufferedTask<BalanceFetcher>,
        internal_transactions: Option<&BufferedTask<InternalTransactionFetcher>>,
    ) -> Result<()> {
        let requests = self
            .store
            .addresses_without_balance()
            .await
            .context("failed to read addresses without balance")?;
        let seeded_balances = balances.enqueue_all(requests).await;

        let mut seeded_traces = 0;
        if let Some(task) = internal_transactions {
            let transactions = self
                .store
                .transactions_without_internal_transactions()
                .await
                .context("failed to read transactions without internal transactions")?;
            seeded_traces = task.enqueue_all(transactions).await;
        }

        if seeded_balances > 0 || seeded_traces > 0 {
            tracing::info!(
                balances = seeded_balances,
                internal_transactions = seeded_traces,
                "seeded follow-up fetchers from store"
            );
        }
        Ok(())
    }
}

impl Drop for BlockFetcher {
    fn drop(&mut self) {
        if let Some(handles) = &self.lifecycle {
            handles.run_token.cancel();
        }
    }
}

impl RunHandles {
    async fn is_settled(&self) -> bool {
        for sequence in [&self.catchup, &self.follow].into_iter().flatten() {
            if !sequence.is_idle().await {
                return false;
            }
        }
        if let Some(task) = &self.internal_transactions {
            if !task.debug_count().await.is_idle() {
                return false;
            }
        }
        self.balances.debug_count().await.is_idle()
    }

    async fn shutdown(self) -> Option<Error> {
        for sequence in [&self.catchup, &self.follow].into_iter().flatten() {
            sequence.close().await;
        }

        let mut pipeline_error = None;
        for handle in self.loops {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::error!(error = %err, "range loop exited with error");
                    if pipeline_error.is_none() {
                        pipeline_error = Some(err);
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to join range loop task");
                    if pipeline_error.is_none() {
                        pipeline_error = Some(err.into());
                    }
                }
            }
        }

        if let Some(handle) = self.pending {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "pending transactions poller panicked");
            }
        }

        if let Some(task) = &self.internal_transactions {
            task.shutdown(ShutdownMode::Hard).await;
        }
        self.balances.shutdown(ShutdownMode::Hard).await;

        pipeline_error
    }
}

impl RangeImporter {
    async fn import_range(&self, range: BlockRange) -> Result<(), RangeFailure> {
        let fetched = self.rpc.fetch_blocks(range).await.map_err(|err| {
            self.fetch_state.record_rpc_error();
            RangeFailure::Transient(err.context(format!("failed to fetch blocks {range}")))
        })?;

        let FetchedBlocks {
            blocks,
            transactions,
            logs,
            internal_transactions,
        } = fetched;
        let batch = EntityBatch {
            blocks,
            transactions,
            internal_transactions,
            logs,
        };

        let addresses = extract_addresses(&batch, ExtractOptions::default()).map_err(|err| {
            let err = Error::from(err).context(format!("address merge failed for blocks {range}"));
            RangeFailure::Fatal(self.fatal.trigger(FatalStage::BlockImport, err))
        })?;

        let EntityBatch {
            blocks,
            transactions,
            internal_transactions,
            logs,
        } = batch;

        let untraced = match &self.internal_transactions {
            Some(_) => untraced_transactions(&transactions, &internal_transactions),
            None => Vec::new(),
        };
        let requests = balance_requests(&addresses);
        let counts = ImportCounts {
            blocks: blocks.len() as u64,
            transactions: transactions.len() as u64,
            logs: logs.len() as u64,
            internal_transactions: internal_transactions.len() as u64,
            addresses: addresses.len() as u64,
        };

        self.store
            .import_blocks(BlockImport {
                blocks,
                transactions,
                logs,
                internal_transactions,
                addresses,
            })
            .await
            .map_err(|err| {
                self.fetch_state.record_storage_error();
                RangeFailure::Transient(err.context(format!("failed to import blocks {range}")))
            })?;

        self.balances.enqueue_all(requests).await;
        if let Some(task) = &self.internal_transactions {
            task.enqueue_all(untraced).await;
        }

        self.fetch_state.record_range(counts);
        self.progress.mark_completed(range);

        tracing::debug!(
            first_block = range.first(),
            last_block = range.last(),
            transactions = counts.transactions,
            addresses = counts.addresses,
            "imported block range"
        );
        Ok(())
    }
}

#[tracing::instrument(name = "range_loop", skip_all, fields(sequence = name))]
async fn run_range_loop(
    importer: RangeImporter,
    sequence: Arc<RangeSequence>,
    shutdown: CancellationToken,
    retry_backoff: Duration,
    name: &'static str,
) -> Result<()> {
    let mut backoff = Backoff::for_ranges(retry_backoff);

    loop {
        let range = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = sequence.pop_next() => match next {
                Some(range) => range,
                None => break,
            },
        };

        let result = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = importer.import_range(range) => result,
        };

        match result {
            Ok(()) => {
                sequence.complete(range).await;
                backoff.reset();
            }
            Err(RangeFailure::Fatal(err)) => {
                sequence.close().await;
                return Err(err);
            }
            Err(RangeFailure::Transient(err)) => {
                importer.fetch_state.record_requeue();
                tracing::warn!(
                    first_block = range.first(),
                    last_block = range.last(),
                    attempt = backoff.failures() + 1,
                    backoff_ms = backoff.current().as_millis() as u64,
                    error = format!("{err:#}"),
                    "failed to import block range; requeueing"
                );
                sequence.requeue(range).await;
                if backoff.wait(&shutdown).await.is_err() {
                    break;
                }
            }
        }
    }

    tracing::info!("range loop stopped");
    Ok(())
}

/// Mined transactions with no trace among `internal_transactions`.
fn untraced_transactions(
    transactions: &[Transaction],
    internal_transactions: &[InternalTransaction],
) -> Vec<TransactionRef> {
    let traced: HashSet<B256> = internal_transactions
        .iter()
        .filter_map(|itx| itx.transaction_hash)
        .collect();
    transactions
        .iter()
        .filter_map(Transaction::reference)
        .filter(|reference| !traced.contains(&reference.hash))
        .collect()
}

/// Splits the work between the catch-up and follow-head loops.
///
/// Catch-up covers everything up to `head`: internal gaps, the blocks above
/// the highest indexed one, then the walk down from below the lowest indexed
/// block (or from the head on an empty store). Follow-head starts right after
/// `head` when catch-up runs, otherwise where the store left off.
pub(crate) fn plan_ranges(
    config: &IndexerConfig,
    head: u64,
    bounds: Option<BlockRange>,
    internal_gaps: Vec<BlockRange>,
) -> RangePlan {
    let start_block = config.start_block().map(|start| start.min(head));

    let catchup = config.catchup().then(|| {
        let mut gaps = internal_gaps;
        let start = match bounds {
            Some(bounds) => {
                if head > bounds.last() {
                    gaps.push(BlockRange::new(bounds.last() + 1, head));
                }
                start_block.or_else(|| bounds.first().checked_sub(1))
            }
            None => start_block.or(Some(head)),
        };
        CatchupPlan { gaps, start }
    });

    let follow_from = config.follow_head().then(|| {
        if config.catchup() {
            head.saturating_add(1)
        } else {
            start_block
                .or_else(|| bounds.map(|bounds| bounds.last().saturating_add(1)))
                .unwrap_or(head)
        }
    });

    RangePlan {
        catchup,
        follow_from,
    }
}
