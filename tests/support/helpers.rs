use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Context, Result};
use chainindex::{
    storage::{BlockImport, InternalTransactionImport},
    AddressBalance, AddressParams, AsyncRpcClient, BalanceRequest, BlockFetcher, BlockRange,
    ChainStore, IndexerConfigBuilder, MemoryStore, PersistedCounts, RpcClientOptions, Transaction,
    TransactionRef,
};
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use tokio::time::{sleep, timeout};
use tracing_subscriber::EnvFilter;

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

/// Client tuned for tests: one attempt per call and short timeouts so range
/// failures surface to the pipeline immediately.
pub fn test_client(url: &str) -> Result<Arc<AsyncRpcClient>> {
    let options = RpcClientOptions {
        max_attempts: 1,
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        request_timeout: Duration::from_secs(2),
        ..RpcClientOptions::default()
    };
    Ok(Arc::new(AsyncRpcClient::with_options(url, None, options)?))
}

/// Builder with intervals short enough for the pipeline to settle quickly.
pub fn fast_config(url: &str) -> IndexerConfigBuilder {
    chainindex::IndexerConfig::builder()
        .rpc_url(url)
        .blocks_batch_size(4)
        .flush_interval(Duration::from_millis(20))
        .retry_backoff(Duration::from_millis(10))
        .head_refresh_interval(Duration::from_millis(50))
        .metrics_interval(Duration::from_millis(100))
}

pub async fn wait_until_settled(fetcher: &BlockFetcher, limit: Duration) -> Result<()> {
    timeout(limit, fetcher.wait_until_settled())
        .await
        .map_err(|_| anyhow!("fetcher did not settle within {limit:?}"))?
        .context("fetcher failed while settling")
}

pub async fn wait_for_blocks(store: &MemoryStore, count: usize, limit: Duration) -> Result<()> {
    let start = Instant::now();
    loop {
        let indexed = store.block_numbers().await.len();
        if indexed >= count {
            return Ok(());
        }
        if start.elapsed() > limit {
            bail!("store did not reach {count} blocks within {limit:?} (indexed: {indexed})");
        }
        sleep(Duration::from_millis(25)).await;
    }
}

pub async fn wait_for_pending(store: &MemoryStore, count: usize, limit: Duration) -> Result<()> {
    let start = Instant::now();
    loop {
        let pending = store.pending_transactions().await.len();
        if pending >= count {
            return Ok(());
        }
        if start.elapsed() > limit {
            bail!("store did not hold {count} pending transactions within {limit:?} (pending: {pending})");
        }
        sleep(Duration::from_millis(25)).await;
    }
}

pub fn assert_is_contiguous(numbers: &[u64]) {
    for window in numbers.windows(2) {
        if let [lhs, rhs] = window {
            assert_eq!(rhs, &(lhs + 1), "block numbers must be contiguous");
        }
    }
}

/// [`MemoryStore`] whose block imports fail a fixed number of times.
pub struct FlakyStore {
    inner: Arc<MemoryStore>,
    remaining_failures: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryStore>, failures: usize) -> Self {
        Self {
            inner,
            remaining_failures: AtomicUsize::new(failures),
        }
    }

    pub fn remaining_failures(&self) -> usize {
        self.remaining_failures.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        self.remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

impl ChainStore for FlakyStore {
    fn import_blocks(&self, import: BlockImport) -> BoxFuture<'_, Result<()>> {
        if self.take_failure() {
            return Box::pin(async { Err(anyhow!("database connection reset")) });
        }
        self.inner.import_blocks(import)
    }

    fn import_internal_transactions(
        &self,
        import: InternalTransactionImport,
    ) -> BoxFuture<'_, Result<()>> {
        self.inner.import_internal_transactions(import)
    }

    fn update_address_balances(&self, balances: Vec<AddressBalance>) -> BoxFuture<'_, Result<()>> {
        self.inner.update_address_balances(balances)
    }

    fn import_pending_transactions(
        &self,
        transactions: Vec<Transaction>,
        addresses: Vec<AddressParams>,
    ) -> BoxFuture<'_, Result<()>> {
        self.inner.import_pending_transactions(transactions, addresses)
    }

    fn persisted_counts(&self) -> BoxFuture<'_, Result<PersistedCounts>> {
        self.inner.persisted_counts()
    }

    fn indexed_bounds(&self) -> BoxFuture<'_, Result<Option<BlockRange>>> {
        self.inner.indexed_bounds()
    }

    fn missing_block_ranges(&self, within: BlockRange) -> BoxFuture<'_, Result<Vec<BlockRange>>> {
        self.inner.missing_block_ranges(within)
    }

    fn addresses_without_balance(&self) -> BoxFuture<'_, Result<Vec<BalanceRequest>>> {
        self.inner.addresses_without_balance()
    }

    fn transactions_without_internal_transactions(
        &self,
    ) -> BoxFuture<'_, Result<Vec<TransactionRef>>> {
        self.inner.transactions_without_internal_transactions()
    }
}
