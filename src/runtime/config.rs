use crate::buffered::BufferedTaskConfig;
use crate::rpc::auth::BasicAuth;
use crate::rpc::options::DEFAULT_RECEIPTS_BATCH_SIZE;
use crate::runtime::telemetry;
use anyhow::{bail, Context, Result};
use std::time::Duration;

const DEFAULT_BLOCKS_BATCH_SIZE: u64 = 10;
const DEFAULT_BALANCES_BATCH_SIZE: usize = 100;
const DEFAULT_BALANCES_CONCURRENCY: usize = 4;
const DEFAULT_INTERNAL_TRANSACTIONS_BATCH_SIZE: usize = 10;
const DEFAULT_INTERNAL_TRANSACTIONS_CONCURRENCY: usize = 4;
const DEFAULT_MAX_RETRIES: usize = 3;
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 3_000;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 250;
const DEFAULT_RPC_TIMEOUT_SECS: u64 = 60;
const DEFAULT_HEAD_REFRESH_INTERVAL_SECS: u64 = 5;

/// Runtime configuration for the indexing pipeline.
///
/// All instances must be constructed via [`IndexerConfig::builder`] or [`IndexerConfig::new`]
/// so invariants are validated before any consumer observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexerConfig {
    rpc_url: String,
    rpc_auth: Option<BasicAuth>,
    start_block: Option<u64>,
    catchup: bool,
    follow_head: bool,
    blocks_batch_size: u64,
    receipts_batch_size: usize,
    balances_batch_size: usize,
    balances_concurrency: usize,
    internal_transactions_batch_size: usize,
    internal_transactions_concurrency: usize,
    index_internal_transactions: bool,
    max_retries: usize,
    flush_interval: Duration,
    retry_backoff: Duration,
    rpc_timeout: Duration,
    metrics_interval: Duration,
    head_refresh_interval: Duration,
    pending_transactions_interval: Option<Duration>,
    debug_logs: bool,
}

pub struct IndexerConfigParams {
    pub rpc_url: String,
    pub rpc_auth: Option<BasicAuth>,
    pub start_block: Option<u64>,
    pub catchup: bool,
    pub follow_head: bool,
    pub blocks_batch_size: u64,
    pub receipts_batch_size: usize,
    pub balances_batch_size: usize,
    pub balances_concurrency: usize,
    pub internal_transactions_batch_size: usize,
    pub internal_transactions_concurrency: usize,
    pub index_internal_transactions: bool,
    pub max_retries: usize,
    pub flush_interval: Duration,
    pub retry_backoff: Duration,
    pub rpc_timeout: Duration,
    pub metrics_interval: Duration,
    pub head_refresh_interval: Duration,
    pub pending_transactions_interval: Option<Duration>,
    pub debug_logs: bool,
}

impl IndexerConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> IndexerConfigBuilder {
        IndexerConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    pub fn new(params: IndexerConfigParams) -> Result<Self> {
        let IndexerConfigParams {
            rpc_url,
            rpc_auth,
            start_block,
            catchup,
            follow_head,
            blocks_batch_size,
            receipts_batch_size,
            balances_batch_size,
            balances_concurrency,
            internal_transactions_batch_size,
            internal_transactions_concurrency,
            index_internal_transactions,
            max_retries,
            flush_interval,
            retry_backoff,
            rpc_timeout,
            metrics_interval,
            head_refresh_interval,
            pending_transactions_interval,
            debug_logs,
        } = params;

        let config = Self {
            rpc_url: trimmed_string(rpc_url),
            rpc_auth: rpc_auth.map(|auth| BasicAuth::new(trimmed_string(auth.user), auth.password)),
            start_block,
            catchup,
            follow_head,
            blocks_batch_size,
            receipts_batch_size,
            balances_batch_size,
            balances_concurrency,
            internal_transactions_batch_size,
            internal_transactions_concurrency,
            index_internal_transactions,
            max_retries,
            flush_interval,
            retry_backoff,
            rpc_timeout,
            metrics_interval,
            head_refresh_interval,
            pending_transactions_interval,
            debug_logs,
        };

        config.validate()?;
        Ok(config)
    }

    /// Full RPC URL (including scheme) of the node.
    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    /// Basic-auth credentials, when the node requires them.
    pub fn rpc_auth(&self) -> Option<&BasicAuth> {
        self.rpc_auth.as_ref()
    }

    /// Block the descending catch-up walk starts from. `None` starts below
    /// the lowest indexed block, or at the chain head on an empty store.
    pub fn start_block(&self) -> Option<u64> {
        self.start_block
    }

    pub fn catchup(&self) -> bool {
        self.catchup
    }

    pub fn follow_head(&self) -> bool {
        self.follow_head
    }

    /// Blocks requested per range.
    pub fn blocks_batch_size(&self) -> u64 {
        self.blocks_batch_size
    }

    pub fn receipts_batch_size(&self) -> usize {
        self.receipts_batch_size
    }

    pub fn balances_batch_size(&self) -> usize {
        self.balances_batch_size
    }

    pub fn balances_concurrency(&self) -> usize {
        self.balances_concurrency
    }

    pub fn internal_transactions_batch_size(&self) -> usize {
        self.internal_transactions_batch_size
    }

    pub fn internal_transactions_concurrency(&self) -> usize {
        self.internal_transactions_concurrency
    }

    /// Whether traces are fetched for imported transactions.
    pub fn index_internal_transactions(&self) -> bool {
        self.index_internal_transactions
    }

    /// Retries granted to a buffered entry before it is discarded.
    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    pub fn retry_backoff(&self) -> Duration {
        self.retry_backoff
    }

    /// Per-request timeout applied to the JSON-RPC client.
    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    /// Interval used by the debug metrics reporter.
    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    /// Interval between `eth_blockNumber` polls feeding the follow-head loop.
    pub fn head_refresh_interval(&self) -> Duration {
        self.head_refresh_interval
    }

    /// Polling cadence for the pending block. `None` disables pending
    /// transaction import.
    pub fn pending_transactions_interval(&self) -> Option<Duration> {
        self.pending_transactions_interval
    }

    /// Whether the periodic debug log starts enabled.
    pub fn debug_logs(&self) -> bool {
        self.debug_logs
    }

    pub fn balance_fetcher_config(&self) -> BufferedTaskConfig {
        BufferedTaskConfig {
            max_batch_size: self.balances_batch_size,
            max_concurrency: self.balances_concurrency,
            max_retries: self.max_retries,
            flush_interval: self.flush_interval,
            retry_backoff: self.retry_backoff,
        }
    }

    pub fn internal_transaction_fetcher_config(&self) -> BufferedTaskConfig {
        BufferedTaskConfig {
            max_batch_size: self.internal_transactions_batch_size,
            max_concurrency: self.internal_transactions_concurrency,
            max_retries: self.max_retries,
            flush_interval: self.flush_interval,
            retry_backoff: self.retry_backoff,
        }
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        validate_url(&self.rpc_url)?;
        if let Some(auth) = &self.rpc_auth {
            ensure_not_empty(&auth.user, "rpc_user")?;
        }

        if !self.catchup && !self.follow_head {
            bail!("at least one of catchup or follow_head must be enabled");
        }

        if self.blocks_batch_size == 0 {
            bail!("blocks_batch_size must be greater than 0");
        }

        if self.receipts_batch_size == 0 {
            bail!("receipts_batch_size must be greater than 0");
        }

        if self.balances_batch_size == 0 {
            bail!("balances_batch_size must be greater than 0");
        }

        if self.balances_concurrency == 0 {
            bail!("balances_concurrency must be greater than 0");
        }

        if self.internal_transactions_batch_size == 0 {
            bail!("internal_transactions_batch_size must be greater than 0");
        }

        if self.internal_transactions_concurrency == 0 {
            bail!("internal_transactions_concurrency must be greater than 0");
        }

        if self.rpc_timeout.is_zero() {
            bail!("rpc_timeout must be greater than 0");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        if self.head_refresh_interval.is_zero() {
            bail!("head_refresh_interval must be greater than 0");
        }

        if self
            .pending_transactions_interval
            .is_some_and(|interval| interval.is_zero())
        {
            bail!("pending_transactions_interval must be greater than 0");
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct IndexerConfigBuilder {
    rpc_url: Option<String>,
    rpc_auth: Option<BasicAuth>,
    start_block: Option<u64>,
    catchup: Option<bool>,
    follow_head: Option<bool>,
    blocks_batch_size: Option<u64>,
    receipts_batch_size: Option<usize>,
    balances_batch_size: Option<usize>,
    balances_concurrency: Option<usize>,
    internal_transactions_batch_size: Option<usize>,
    internal_transactions_concurrency: Option<usize>,
    index_internal_transactions: Option<bool>,
    max_retries: Option<usize>,
    flush_interval: Option<Duration>,
    retry_backoff: Option<Duration>,
    rpc_timeout: Option<Duration>,
    metrics_interval: Option<Duration>,
    head_refresh_interval: Option<Duration>,
    pending_transactions_interval: Option<Duration>,
    debug_logs: Option<bool>,
}

impl IndexerConfigBuilder {
    pub fn rpc_url(mut self, url: impl Into<String>) -> Self {
        self.rpc_url = Some(url.into());
        self
    }

    pub fn rpc_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.rpc_auth = Some(BasicAuth::new(user, password));
        self
    }

    pub fn start_block(mut self, number: u64) -> Self {
        self.start_block = Some(number);
        self
    }

    pub fn catchup(mut self, enabled: bool) -> Self {
        self.catchup = Some(enabled);
        self
    }

    pub fn follow_head(mut self, enabled: bool) -> Self {
        self.follow_head = Some(enabled);
        self
    }

    pub fn blocks_batch_size(mut self, size: u64) -> Self {
        self.blocks_batch_size = Some(size);
        self
    }

    pub fn receipts_batch_size(mut self, size: usize) -> Self {
        self.receipts_batch_size = Some(size);
        self
    }

    pub fn balances_batch_size(mut self, size: usize) -> Self {
        self.balances_batch_size = Some(size);
        self
    }

    pub fn balances_concurrency(mut self, concurrency: usize) -> Self {
        self.balances_concurrency = Some(concurrency);
        self
    }

    pub fn internal_transactions_batch_size(mut self, size: usize) -> Self {
        self.internal_transactions_batch_size = Some(size);
        self
    }

    pub fn internal_transactions_concurrency(mut self, concurrency: usize) -> Self {
        self.internal_transactions_concurrency = Some(concurrency);
        self
    }

    pub fn index_internal_transactions(mut self, enabled: bool) -> Self {
        self.index_internal_transactions = Some(enabled);
        self
    }

    pub fn max_retries(mut self, retries: usize) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = Some(interval);
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = Some(backoff);
        self
    }

    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = Some(timeout);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn head_refresh_interval(mut self, interval: Duration) -> Self {
        self.head_refresh_interval = Some(interval);
        self
    }

    pub fn pending_transactions_interval(mut self, interval: Duration) -> Self {
        self.pending_transactions_interval = Some(interval);
        self
    }

    pub fn debug_logs(mut self, enabled: bool) -> Self {
        self.debug_logs = Some(enabled);
        self
    }

    pub fn build(self) -> Result<IndexerConfig> {
        let params = IndexerConfigParams {
            rpc_url: self.rpc_url.context("rpc_url is required")?,
            rpc_auth: self.rpc_auth,
            start_block: self.start_block,
            catchup: self.catchup.unwrap_or(true),
            follow_head: self.follow_head.unwrap_or(true),
            blocks_batch_size: self.blocks_batch_size.unwrap_or(DEFAULT_BLOCKS_BATCH_SIZE),
            receipts_batch_size: self
                .receipts_batch_size
                .unwrap_or(DEFAULT_RECEIPTS_BATCH_SIZE),
            balances_batch_size: self
                .balances_batch_size
                .unwrap_or(DEFAULT_BALANCES_BATCH_SIZE),
            balances_concurrency: self
                .balances_concurrency
                .unwrap_or(DEFAULT_BALANCES_CONCURRENCY),
            internal_transactions_batch_size: self
                .internal_transactions_batch_size
                .unwrap_or(DEFAULT_INTERNAL_TRANSACTIONS_BATCH_SIZE),
            internal_transactions_concurrency: self
                .internal_transactions_concurrency
                .unwrap_or(DEFAULT_INTERNAL_TRANSACTIONS_CONCURRENCY),
            index_internal_transactions: self.index_internal_transactions.unwrap_or(true),
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            flush_interval: self
                .flush_interval
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS)),
            retry_backoff: self
                .retry_backoff
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS)),
            rpc_timeout: self
                .rpc_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_RPC_TIMEOUT_SECS)),
            metrics_interval: self
                .metrics_interval
                .unwrap_or(telemetry::DEFAULT_METRICS_INTERVAL),
            head_refresh_interval: self
                .head_refresh_interval
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_HEAD_REFRESH_INTERVAL_SECS)),
            pending_transactions_interval: self.pending_transactions_interval,
            debug_logs: self.debug_logs.unwrap_or(false),
        };

        IndexerConfig::new(params)
    }
}

fn trimmed_string(value: String) -> String {
    value.trim().to_owned()
}

fn ensure_not_empty(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!("{field} cannot be empty");
    }
    Ok(())
}

fn validate_url(url: &str) -> Result<()> {
    let url = url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        bail!("rpc_url must start with http:// or https://");
    }
    Ok(())
}
