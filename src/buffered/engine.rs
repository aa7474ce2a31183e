use super::shared::{BufferState, BufferedTaskStats, Item};
use super::types::{
    BatchContext, BatchOutcome, BufferProbe, BufferedTaskConfig, BufferedTaskStatsSnapshot,
    BufferedWorker, DebugCount, ShutdownMode,
};
use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

struct Shared<W: BufferedWorker> {
    name: &'static str,
    worker: Arc<W>,
    config: BufferedTaskConfig,
    state: Mutex<BufferState<W::Key, W::Entry>>,
    wake: Notify,
    drained: Notify,
    stats: BufferedTaskStats,
    next_batch_id: AtomicU64,
}

/// Cloneable handle for feeding and observing a running engine. Workers get
/// one in their [`BatchContext`] so they can enqueue follow-up work.
pub struct BufferedTaskHandle<W: BufferedWorker> {
    shared: Arc<Shared<W>>,
}

impl<W: BufferedWorker> Clone for BufferedTaskHandle<W> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<W: BufferedWorker> BufferedTaskHandle<W> {
    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    pub async fn enqueue(&self, entry: W::Entry) -> bool {
        self.enqueue_all([entry]).await == 1
    }

    /// Buffers the entries and returns how many were accepted. Nothing is
    /// accepted after shutdown.
    pub async fn enqueue_all<I>(&self, entries: I) -> usize
    where
        I: IntoIterator<Item = W::Entry>,
    {
        let worker = &self.shared.worker;
        let mut accepted = 0;
        {
            let mut state = self.shared.state.lock().await;
            if !state.accepting {
                tracing::debug!(task = self.shared.name, "dropping entries enqueued after shutdown");
                return 0;
            }
            for entry in entries {
                let key = worker.key(&entry);
                state.insert(key, Item::fresh(entry), |existing, incoming| {
                    worker.merge(existing, incoming)
                });
                accepted += 1;
            }
        }

        if accepted > 0 {
            self.shared.wake.notify_one();
        }
        accepted
    }

    pub async fn debug_count(&self) -> DebugCount {
        self.shared.state.lock().await.debug_count()
    }

    pub fn stats(&self) -> BufferedTaskStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Resolves once nothing is buffered and no batch is running.
    pub async fn wait_until_drained(&self) {
        loop {
            let notified = self.shared.drained.notified();
            if self.debug_count().await.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

impl<W: BufferedWorker> BufferProbe for BufferedTaskHandle<W> {
    fn name(&self) -> &'static str {
        self.shared.name
    }

    fn debug_count(&self) -> BoxFuture<'_, DebugCount> {
        Box::pin(BufferedTaskHandle::debug_count(self))
    }

    fn stats(&self) -> BufferedTaskStatsSnapshot {
        self.shared.stats.snapshot()
    }
}

/// Bounded-concurrency executor with a deduplicating buffer and per-entry
/// retries.
pub struct BufferedTask<W: BufferedWorker> {
    handle: BufferedTaskHandle<W>,
    drain: CancellationToken,
    abort: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl<W: BufferedWorker> BufferedTask<W> {
    /// Starts the dispatcher. Cancelling `parent` aborts running batches.
    pub fn spawn(
        name: &'static str,
        worker: Arc<W>,
        config: BufferedTaskConfig,
        parent: &CancellationToken,
    ) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(Shared {
            name,
            worker,
            config,
            state: Mutex::new(BufferState::new()),
            wake: Notify::new(),
            drained: Notify::new(),
            stats: BufferedTaskStats::default(),
            next_batch_id: AtomicU64::new(0),
        });
        let drain = CancellationToken::new();
        let abort = parent.child_token();
        let dispatcher = tokio::spawn(dispatch_loop(shared.clone(), drain.clone(), abort.clone()));

        tracing::debug!(
            task = name,
            max_batch_size = config.max_batch_size,
            max_concurrency = config.max_concurrency,
            "buffered task started"
        );

        Ok(Self {
            handle: BufferedTaskHandle { shared },
            drain,
            abort,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    pub fn handle(&self) -> BufferedTaskHandle<W> {
        self.handle.clone()
    }

    pub async fn enqueue_all<I>(&self, entries: I) -> usize
    where
        I: IntoIterator<Item = W::Entry>,
    {
        self.handle.enqueue_all(entries).await
    }

    pub async fn debug_count(&self) -> DebugCount {
        self.handle.debug_count().await
    }

    pub fn stats(&self) -> BufferedTaskStatsSnapshot {
        self.handle.stats()
    }

    pub async fn wait_until_drained(&self) {
        self.handle.wait_until_drained().await
    }

    /// Stops accepting work and shuts the dispatcher down. Entries still
    /// buffered afterwards are abandoned.
    pub async fn shutdown(&self, mode: ShutdownMode) {
        self.handle.shared.state.lock().await.accepting = false;
        match mode {
            ShutdownMode::Graceful => self.drain.cancel(),
            ShutdownMode::Hard => self.abort.cancel(),
        }

        let dispatcher = self.dispatcher.lock().await.take();
        if let Some(dispatcher) = dispatcher {
            if let Err(err) = dispatcher.await {
                tracing::warn!(task = self.handle.name(), error = %err, "buffered task dispatcher panicked");
            }
        }
    }
}

impl<W: BufferedWorker> Drop for BufferedTask<W> {
    fn drop(&mut self) {
        self.abort.cancel();
    }
}

struct Settlement<W: BufferedWorker> {
    batch_id: u64,
    outcome: Result<BatchOutcome<W::Entry>>,
    panicked: bool,
}

/// Items of every spawned batch, keyed by batch id. Held by the dispatcher so
/// a batch whose task never reports back can still be settled.
type InFlight<W> =
    HashMap<u64, Vec<(<W as BufferedWorker>::Key, Item<<W as BufferedWorker>::Entry>)>>;

async fn dispatch_loop<W: BufferedWorker>(
    shared: Arc<Shared<W>>,
    drain: CancellationToken,
    abort: CancellationToken,
) {
    let flush_interval = shared.config.flush_interval;
    let eager = flush_interval.is_zero();
    let mut ticker = (!eager).then(|| {
        let mut ticker = interval_at(Instant::now() + flush_interval, flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    });
    let mut running: JoinSet<Settlement<W>> = JoinSet::new();
    let mut in_flight: InFlight<W> = HashMap::new();
    let mut flush_pending = false;

    loop {
        let remaining = dispatch_ready(
            &shared,
            &mut running,
            &mut in_flight,
            eager || flush_pending,
            &abort,
        )
        .await;
        if remaining == 0 {
            flush_pending = false;
        }

        tokio::select! {
            _ = abort.cancelled() => {
                abort_running(&shared, &mut running, &mut in_flight).await;
                break;
            }
            _ = drain.cancelled() => {
                drain_running(&shared, &mut running, &mut in_flight, &abort).await;
                break;
            }
            Some(joined) = running.join_next(), if !running.is_empty() => {
                settle_joined(&shared, &running, &mut in_flight, joined).await;
            }
            _ = shared.wake.notified() => {}
            _ = next_tick(&mut ticker) => {
                flush_pending = true;
            }
        }
    }

    shared.drained.notify_waiters();
    tracing::debug!(task = shared.name, "buffered task dispatcher stopped");
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => futures::future::pending::<()>().await,
    }
}

/// Dispatches as many batches as concurrency allows. Partial batches only go
/// out when `flush` is set. Returns the number of entries still eligible.
async fn dispatch_ready<W: BufferedWorker>(
    shared: &Arc<Shared<W>>,
    running: &mut JoinSet<Settlement<W>>,
    in_flight: &mut InFlight<W>,
    flush: bool,
    abort: &CancellationToken,
) -> usize {
    let config = shared.config;
    let mut state = shared.state.lock().await;
    if !state.accepting {
        return 0;
    }

    while state.tasks < config.max_concurrency {
        let eligible = state.eligible();
        if eligible == 0 || (eligible < config.max_batch_size && !flush) {
            break;
        }
        let batch = state.take_batch(config.max_batch_size);
        if batch.is_empty() {
            break;
        }
        state.tasks += 1;
        shared.stats.record_batch();
        let batch_id = spawn_batch(shared, running, &batch, abort);
        in_flight.insert(batch_id, batch);
    }

    state.eligible()
}

fn spawn_batch<W: BufferedWorker>(
    shared: &Arc<Shared<W>>,
    running: &mut JoinSet<Settlement<W>>,
    items: &[(W::Key, Item<W::Entry>)],
    abort: &CancellationToken,
) -> u64 {
    let batch_id = shared.next_batch_id.fetch_add(1, Ordering::Relaxed);
    let entries: Vec<W::Entry> = items.iter().map(|(_, item)| item.entry.clone()).collect();
    let ctx = BatchContext {
        handle: BufferedTaskHandle {
            shared: Arc::clone(shared),
        },
        cancellation: abort.clone(),
        batch_id,
    };
    let worker = Arc::clone(&shared.worker);
    let name = shared.name;
    let backoff = shared.config.retry_backoff;
    let cancellation = abort.clone();

    tracing::trace!(task = name, batch_id, size = entries.len(), "dispatching batch");

    running.spawn(async move {
        // `run` itself may panic before handing back its future.
        let result = AssertUnwindSafe(async move { worker.run(entries, ctx).await })
            .catch_unwind()
            .await;

        let (outcome, panicked) = match result {
            Ok(outcome) => (outcome, false),
            Err(panic_payload) => {
                let panic_msg = panic_message(panic_payload.as_ref());
                tracing::error!(task = name, batch_id, panic = %panic_msg, "buffered batch panicked");
                (
                    Err(anyhow!("batch {batch_id} of {name} panicked: {panic_msg}")),
                    true,
                )
            }
        };

        let failed = !matches!(outcome, Ok(BatchOutcome::Done));
        if failed && !backoff.is_zero() {
            tokio::select! {
                _ = cancellation.cancelled() => {}
                _ = sleep(backoff) => {}
            }
        }

        Settlement {
            batch_id,
            outcome,
            panicked,
        }
    });
    batch_id
}

/// Settles a joined batch task. A task that failed to join settles as a
/// whole-batch failure once no other batch is left to report back.
async fn settle_joined<W: BufferedWorker>(
    shared: &Arc<Shared<W>>,
    running: &JoinSet<Settlement<W>>,
    in_flight: &mut InFlight<W>,
    joined: Result<Settlement<W>, JoinError>,
) {
    match joined {
        Ok(settlement) => settle(shared, in_flight, settlement).await,
        Err(err) => {
            tracing::warn!(task = shared.name, error = %err, "buffered batch task failed to join");
        }
    }

    if running.is_empty() && !in_flight.is_empty() {
        let orphaned: Vec<u64> = in_flight.keys().copied().collect();
        for batch_id in orphaned {
            let settlement = Settlement {
                batch_id,
                outcome: Err(anyhow!("batch {batch_id} of {} never reported back", shared.name)),
                panicked: false,
            };
            settle(shared, in_flight, settlement).await;
        }
    }
}

async fn settle<W: BufferedWorker>(
    shared: &Arc<Shared<W>>,
    in_flight: &mut InFlight<W>,
    settlement: Settlement<W>,
) {
    let Settlement {
        batch_id,
        outcome,
        panicked,
    } = settlement;
    let items = in_flight.remove(&batch_id).unwrap_or_default();
    let worker = &shared.worker;
    let max_retries = shared.config.max_retries;
    let batch_size = items.len();

    let failures_by_key: HashMap<W::Key, usize> = items
        .iter()
        .map(|(key, item)| (key.clone(), item.failures))
        .collect();

    let failed: Vec<(W::Key, W::Entry, usize)> = match outcome {
        Ok(BatchOutcome::Done) => Vec::new(),
        Ok(BatchOutcome::Retry(entries)) => entries
            .into_iter()
            .map(|entry| {
                let key = worker.key(&entry);
                let failures = failures_by_key.get(&key).copied().unwrap_or(0) + 1;
                (key, entry, failures)
            })
            .collect(),
        Err(err) => {
            if panicked {
                shared.stats.record_panic();
            } else {
                tracing::warn!(
                    task = shared.name,
                    batch_id,
                    size = batch_size,
                    error = %err,
                    "buffered batch failed; retrying entries"
                );
            }
            items
                .iter()
                .map(|(key, item)| (key.clone(), item.entry.clone(), item.failures + 1))
                .collect()
        }
    };

    shared
        .stats
        .record_completed(batch_size.saturating_sub(failed.len()));

    let mut retries = Vec::with_capacity(failed.len());
    for (key, entry, failures) in failed {
        if failures > max_retries {
            tracing::error!(
                task = shared.name,
                batch_id,
                failures,
                entry = ?entry,
                "discarding entry after exhausting retries"
            );
            shared.stats.record_discarded();
            worker.on_discard(&entry, failures);
        } else {
            retries.push((key, Item { entry, failures }));
        }
    }
    shared.stats.record_retried(retries.len());

    {
        let mut state = shared.state.lock().await;
        state.release(items.iter().map(|(key, _)| key));
        state.tasks = state.tasks.saturating_sub(1);
        for (key, item) in retries {
            state.insert(key, item, |existing, incoming| {
                worker.merge(existing, incoming)
            });
        }
    }

    shared.wake.notify_one();
    shared.drained.notify_waiters();
}

async fn drain_running<W: BufferedWorker>(
    shared: &Arc<Shared<W>>,
    running: &mut JoinSet<Settlement<W>>,
    in_flight: &mut InFlight<W>,
    abort: &CancellationToken,
) {
    let running_count = running.len();
    if running_count > 0 {
        tracing::info!(task = shared.name, in_flight = running_count, "waiting for running batches to finish");
    }

    loop {
        tokio::select! {
            _ = abort.cancelled() => {
                abort_running(shared, running, in_flight).await;
                return;
            }
            joined = running.join_next() => match joined {
                Some(joined) => settle_joined(shared, running, in_flight, joined).await,
                None => return,
            }
        }
    }
}

async fn abort_running<W: BufferedWorker>(
    shared: &Arc<Shared<W>>,
    running: &mut JoinSet<Settlement<W>>,
    in_flight: &mut InFlight<W>,
) {
    let aborted = running.len();
    running.abort_all();
    while running.join_next().await.is_some() {}
    in_flight.clear();
    shared.state.lock().await.clear_in_flight();
    if aborted > 0 {
        tracing::info!(task = shared.name, in_flight = aborted, "aborted running batches");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
