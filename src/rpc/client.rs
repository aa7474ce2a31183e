//! RPC client for Ethereum JSON-RPC nodes and the `ChainRpc` abstraction the
//! pipeline consumes. Houses `AsyncRpcClient`, its error type, and the
//! fetched-data containers returned by each operation.

use crate::model::{
    AddressBalance, BalanceRequest, Block, BlockRange, InternalTransaction, Log, Transaction,
    TransactionRef,
};
use crate::rpc::auth::{build_headers, BasicAuth};
use crate::rpc::decode::{
    parse_quantity, parse_u256, quantity_param, RpcBlock, RpcReceipt, RpcTraceReplay,
};
use crate::rpc::metrics::{RpcMetrics, RpcMetricsSnapshot};
use crate::rpc::options::RpcClientOptions;
use crate::rpc::retry::{
    RetryContext, BLOCK_NUMBER_RETRY, CONTRACT_CALL_RETRY, FETCH_BALANCES_RETRY,
    FETCH_BLOCKS_RETRY, FETCH_RECEIPTS_RETRY, FETCH_TRACES_RETRY, PENDING_BLOCK_RETRY,
};
use crate::runtime::config::IndexerConfig;
use alloy_primitives::Address;
use anyhow::{anyhow, Context, Result};
use futures::future::BoxFuture;
use jsonrpsee::core::{
    client::{ClientT, Error as JsonRpcError},
    http_helpers::HttpError,
    params::{ArrayParams, BatchRequestBuilder},
};
use jsonrpsee::http_client::transport::Error as HttpTransportError;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
use jsonrpsee::types::ErrorObject;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::{fmt, future::Future, sync::Arc};
use tokio::time::{sleep, timeout, Instant};

#[derive(Debug)]
pub enum RpcError {
    Timeout { method: &'static str },
    /// The node answered `null` for a block number, usually above the head.
    BlockNotFound { number: u64 },
    ResponseTooLarge { method: &'static str },
    MalformedResponse { method: &'static str, reason: String },
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Timeout { method } => write!(f, "rpc method {method} timed out"),
            RpcError::BlockNotFound { number } => {
                write!(f, "block {number} was not found on the node")
            }
            RpcError::ResponseTooLarge { method } => {
                write!(f, "rpc {method} response exceeded HTTP size limits")
            }
            RpcError::MalformedResponse { method, reason } => {
                write!(f, "rpc {method} returned a malformed response: {reason}")
            }
        }
    }
}

impl std::error::Error for RpcError {}

/// Everything fetched for one block range.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedBlocks {
    pub blocks: Vec<Block>,
    pub transactions: Vec<Transaction>,
    pub logs: Vec<Log>,
    /// Traces delivered together with the blocks. Transactions not covered
    /// here are scheduled on the internal transaction fetcher.
    pub internal_transactions: Vec<InternalTransaction>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedInternalTransactions {
    pub internal_transactions: Vec<InternalTransaction>,
    /// Transactions whose traces could not be fetched or decoded.
    pub failed: Vec<TransactionRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedBalances {
    pub balances: Vec<AddressBalance>,
    pub failed: Vec<BalanceRequest>,
}

/// Chain data source behind `BlockFetcher`, `BalanceFetcher`,
/// `InternalTransactionFetcher` and the pending poller.
pub trait ChainRpc: Send + Sync {
    fn fetch_blocks(&self, range: BlockRange) -> BoxFuture<'_, Result<FetchedBlocks>>;

    fn fetch_internal_transactions<'a>(
        &'a self,
        transactions: &'a [TransactionRef],
    ) -> BoxFuture<'a, Result<FetchedInternalTransactions>>;

    fn fetch_balances<'a>(
        &'a self,
        requests: &'a [BalanceRequest],
    ) -> BoxFuture<'a, Result<FetchedBalances>>;

    fn latest_block_number(&self) -> BoxFuture<'_, Result<u64>>;

    fn fetch_pending_transactions(&self) -> BoxFuture<'_, Result<Vec<Transaction>>>;

    /// Transport counters, when the implementation keeps any.
    fn rpc_metrics(&self) -> Option<RpcMetricsSnapshot> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct AsyncRpcClient {
    rpc_url: Arc<String>,
    client: HttpClient,
    options: RpcClientOptions,
    metrics: Arc<RpcMetrics>,
}

impl ChainRpc for AsyncRpcClient {
    fn fetch_blocks(&self, range: BlockRange) -> BoxFuture<'_, Result<FetchedBlocks>> {
        Box::pin(self.fetch_blocks(range))
    }

    fn fetch_internal_transactions<'a>(
        &'a self,
        transactions: &'a [TransactionRef],
    ) -> BoxFuture<'a, Result<FetchedInternalTransactions>> {
        Box::pin(self.fetch_internal_transactions(transactions))
    }

    fn fetch_balances<'a>(
        &'a self,
        requests: &'a [BalanceRequest],
    ) -> BoxFuture<'a, Result<FetchedBalances>> {
        Box::pin(self.fetch_balances(requests))
    }

    fn latest_block_number(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(self.latest_block_number())
    }

    fn fetch_pending_transactions(&self) -> BoxFuture<'_, Result<Vec<Transaction>>> {
        Box::pin(self.fetch_pending_transactions())
    }

    fn rpc_metrics(&self) -> Option<RpcMetricsSnapshot> {
        Some(self.metrics.snapshot())
    }
}

impl AsyncRpcClient {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Self::with_options(url, None, RpcClientOptions::default())
    }

    pub fn with_options(
        url: impl Into<String>,
        auth: Option<BasicAuth>,
        options: RpcClientOptions,
    ) -> Result<Self> {
        options.validate()?;

        let rpc_url = url.into();
        let headers = build_headers(auth.as_ref())?;
        let (max_request_body_size, max_response_body_size) = options.body_limits();

        let client = HttpClientBuilder::default()
            .set_headers(headers)
            .request_timeout(options.request_timeout)
            .max_concurrent_requests(options.max_concurrent_requests)
            .max_request_size(max_request_body_size)
            .max_response_size(max_response_body_size)
            .build(&rpc_url)
            .map_err(|err| anyhow!("failed to build RPC client: {err}"))?;

        Ok(Self {
            rpc_url: Arc::new(rpc_url),
            client,
            options,
            metrics: Arc::new(RpcMetrics::default()),
        })
    }

    pub fn from_config(config: &IndexerConfig) -> Result<Self> {
        config.validate()?;
        let options = RpcClientOptions {
            request_timeout: config.rpc_timeout(),
            receipts_batch_size: config.receipts_batch_size(),
            ..RpcClientOptions::default()
        };
        Self::with_options(config.rpc_url().to_owned(), config.rpc_auth().cloned(), options)
    }

    pub fn endpoint(&self) -> &str {
        &self.rpc_url
    }

    pub fn metrics(&self) -> RpcMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Blocks with full transactions, completed with receipts and logs.
    pub async fn fetch_blocks(&self, range: BlockRange) -> Result<FetchedBlocks> {
        let context = RetryContext::with_blocks(&FETCH_BLOCKS_RETRY, range.first(), range.last());
        let raw_blocks = self
            .retry_with_metrics(
                context,
                || async { self.get_blocks_once(range).await },
                |attempt, blocks: &Vec<RpcBlock>| {
                    tracing::debug!(
                        attempt,
                        blocks = blocks.len(),
                        first_block = range.first(),
                        last_block = range.last(),
                        "eth_getBlockByNumber batch completed"
                    );
                },
            )
            .await?;

        let mut fetched = FetchedBlocks::default();
        for raw in raw_blocks {
            let (block, transactions) = raw
                .into_entities()
                .map_err(|err| malformed("eth_getBlockByNumber", err))?;
            fetched.blocks.push(block);
            fetched.transactions.extend(transactions);
        }

        fetched.logs = self.complete_with_receipts(&mut fetched.transactions).await?;
        Ok(fetched)
    }

    /// Traces per transaction. Failures are reported per transaction rather
    /// than failing the whole call.
    pub async fn fetch_internal_transactions(
        &self,
        transactions: &[TransactionRef],
    ) -> Result<FetchedInternalTransactions> {
        let mut fetched = FetchedInternalTransactions::default();
        if transactions.is_empty() {
            return Ok(fetched);
        }

        let context = RetryContext::with_count(&FETCH_TRACES_RETRY, transactions.len());
        let replies = self
            .retry_with_metrics(
                context,
                || async {
                    let mut batch = BatchRequestBuilder::new();
                    for tx in transactions {
                        batch
                            .insert("trace_replayTransaction", rpc_params![tx.hash, ["trace"]])
                            .context("failed to serialize trace_replayTransaction params")?;
                    }
                    self.execute_batch_entries::<Option<RpcTraceReplay>>(
                        batch,
                        "trace_replayTransaction",
                    )
                    .await
                },
                |_, _| {},
            )
            .await?;

        for (tx, reply) in pair_replies("trace_replayTransaction", transactions, replies) {
            let decoded = reply
                .and_then(|replay| replay.context("node returned no trace"))
                .and_then(|replay| replay.into_entities(*tx));
            match decoded {
                Ok(internal) => fetched.internal_transactions.extend(internal),
                Err(err) => {
                    tracing::debug!(
                        transaction = %tx.hash,
                        block_number = tx.block_number,
                        error = %err,
                        "trace unavailable for transaction"
                    );
                    fetched.failed.push(*tx);
                }
            }
        }

        Ok(fetched)
    }

    /// Balances per request. Failures are reported per request.
    pub async fn fetch_balances(&self, requests: &[BalanceRequest]) -> Result<FetchedBalances> {
        let mut fetched = FetchedBalances::default();
        if requests.is_empty() {
            return Ok(fetched);
        }

        let context = RetryContext::with_count(&FETCH_BALANCES_RETRY, requests.len());
        let replies = self
            .retry_with_metrics(
                context,
                || async {
                    let mut batch = BatchRequestBuilder::new();
                    for request in requests {
                        batch
                            .insert(
                                "eth_getBalance",
                                rpc_params![request.address, quantity_param(request.block_number)],
                            )
                            .context("failed to serialize eth_getBalance params")?;
                    }
                    self.execute_batch_entries::<String>(batch, "eth_getBalance")
                        .await
                },
                |_, _| {},
            )
            .await?;

        for (request, reply) in pair_replies("eth_getBalance", requests, replies) {
            match reply.and_then(|raw| parse_u256(&raw)) {
                Ok(value) => fetched.balances.push(AddressBalance {
                    address: request.address,
                    block_number: request.block_number,
                    value,
                }),
                Err(err) => {
                    tracing::debug!(
                        address = %request.address,
                        block_number = request.block_number,
                        error = %err,
                        "balance unavailable"
                    );
                    fetched.failed.push(*request);
                }
            }
        }

        Ok(fetched)
    }

    pub async fn fetch_balance(&self, request: BalanceRequest) -> Result<AddressBalance> {
        const METHOD: &str = "eth_getBalance";

        let raw: String = self
            .retry_with_metrics(
                RetryContext::new(&FETCH_BALANCES_RETRY),
                || async {
                    self.request_once(
                        METHOD,
                        rpc_params![request.address, quantity_param(request.block_number)],
                    )
                    .await
                },
                |_, _| {},
            )
            .await?;

        Ok(AddressBalance {
            address: request.address,
            block_number: request.block_number,
            value: parse_u256(&raw).map_err(|err| malformed(METHOD, err))?,
        })
    }

    pub async fn latest_block_number(&self) -> Result<u64> {
        const METHOD: &str = "eth_blockNumber";

        let raw: String = self
            .retry_with_metrics(
                RetryContext::new(&BLOCK_NUMBER_RETRY),
                || async { self.request_once(METHOD, rpc_params![]).await },
                |_, _| {},
            )
            .await?;
        let number = parse_quantity(&raw).map_err(|err| malformed(METHOD, err))?;
        tracing::trace!(head = number, "refreshed chain head");
        Ok(number)
    }

    /// Transactions of the node's pending block, without block placement.
    pub async fn fetch_pending_transactions(&self) -> Result<Vec<Transaction>> {
        const METHOD: &str = "eth_getBlockByNumber";

        let block: Option<RpcBlock> = self
            .retry_with_metrics(
                RetryContext::new(&PENDING_BLOCK_RETRY),
                || async { self.request_once(METHOD, rpc_params!["pending", true]).await },
                |_, _| {},
            )
            .await?;

        let Some(block) = block else {
            return Ok(Vec::new());
        };
        let (_, mut transactions) = block
            .into_entities()
            .map_err(|err| malformed(METHOD, err))?;
        for tx in &mut transactions {
            tx.block_number = None;
            tx.block_hash = None;
            tx.index = None;
        }
        Ok(transactions)
    }

    /// Issues `eth_call` against `to` with hex call data built by
    /// [`crate::rpc::contract::encode_call`]. Returns the raw hex result.
    pub async fn call_contract(&self, to: Address, data: &str, block: Option<u64>) -> Result<String> {
        const METHOD: &str = "eth_call";
        let tag = block.map(quantity_param).unwrap_or_else(|| "latest".to_string());

        self.retry_with_metrics(
            RetryContext::new(&CONTRACT_CALL_RETRY),
            || async {
                self.request_once(METHOD, rpc_params![json!({ "to": to, "data": data }), tag.as_str()])
                    .await
            },
            |attempt, _: &String| {
                tracing::trace!(attempt, contract = %to, "eth_call completed");
            },
        )
        .await
    }

    /// Retry loop wrapping RPC operations with metrics, exponential backoff,
    /// and consistent logging.
    async fn retry_with_metrics<T, F, Fut, S>(
        &self,
        context: RetryContext<'_>,
        mut operation: F,
        mut on_success: S,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        S: FnMut(usize, &T),
    {
        let mut attempt = 0;

        loop {
            attempt += 1;
            let start = Instant::now();

            match operation().await {
                Ok(value) => {
                    self.metrics.record_success(start.elapsed());
                    on_success(attempt, &value);
                    return Ok(value);
                }
                Err(err) => {
                    let elapsed = start.elapsed();
                    if let Some(rpc_error) = err.downcast_ref::<RpcError>() {
                        match rpc_error {
                            RpcError::BlockNotFound { number } => {
                                self.metrics.record_missing_block(elapsed);
                                context.log_not_found(attempt, *number);
                                return Err(err);
                            }
                            RpcError::Timeout { method } => {
                                self.metrics.record_timeout(elapsed);
                                let backoff = self.options.retry_delay(attempt);
                                if attempt >= self.options.max_attempts {
                                    context.log_exhausted(attempt, &err);
                                    return Err(err);
                                }
                                context.log_timeout(attempt, method, backoff);
                                sleep(backoff).await;
                                continue;
                            }
                            RpcError::ResponseTooLarge { method } => {
                                self.metrics.record_oversized(elapsed);
                                context.log_oversized(attempt, method);
                                return Err(err);
                            }
                            RpcError::MalformedResponse { .. } => {
                                self.metrics.record_failure(elapsed);
                                context.log_exhausted(attempt, &err);
                                return Err(err);
                            }
                        }
                    }

                    self.metrics.record_failure(elapsed);

                    if attempt >= self.options.max_attempts {
                        context.log_exhausted(attempt, &err);
                        return Err(err);
                    }

                    let backoff = self.options.retry_delay(attempt);
                    context.log_retry(attempt, backoff, &err);
                    sleep(backoff).await;
                }
            }
        }
    }

    async fn get_blocks_once(&self, range: BlockRange) -> Result<Vec<RpcBlock>> {
        let mut batch = BatchRequestBuilder::new();
        for number in range.numbers() {
            batch
                .insert("eth_getBlockByNumber", rpc_params![quantity_param(number), true])
                .context("failed to serialize eth_getBlockByNumber params")?;
        }

        let blocks: Vec<Option<RpcBlock>> =
            self.execute_batch(batch, "eth_getBlockByNumber").await?;
        if blocks.len() as u64 != range.len() {
            return Err(RpcError::MalformedResponse {
                method: "eth_getBlockByNumber",
                reason: format!("expected {} blocks, got {}", range.len(), blocks.len()),
            }
            .into());
        }

        blocks
            .into_iter()
            .zip(range.numbers())
            .map(|(block, number)| block.ok_or_else(|| RpcError::BlockNotFound { number }.into()))
            .collect()
    }

    /// Fills receipt fields on `transactions` in chunks of
    /// `receipts_batch_size` and returns the logs they carry.
    async fn complete_with_receipts(&self, transactions: &mut [Transaction]) -> Result<Vec<Log>> {
        let mut logs = Vec::new();

        for chunk in transactions.chunks_mut(self.options.receipts_batch_size) {
            let hashes = chunk
                .iter()
                .map(|tx| {
                    tx.hash
                        .ok_or_else(|| malformed("eth_getBlockByNumber", anyhow!("transaction without hash")))
                })
                .collect::<Result<Vec<_>>>()?;

            let context = RetryContext::with_count(&FETCH_RECEIPTS_RETRY, hashes.len());
            let receipts = self
                .retry_with_metrics(
                    context,
                    || async {
                        let mut batch = BatchRequestBuilder::new();
                        for hash in &hashes {
                            batch
                                .insert("eth_getTransactionReceipt", rpc_params![hash])
                                .context("failed to serialize eth_getTransactionReceipt params")?;
                        }
                        self.execute_batch::<Option<RpcReceipt>>(batch, "eth_getTransactionReceipt")
                            .await
                    },
                    |_, _| {},
                )
                .await?;

            for ((tx, hash), receipt) in chunk.iter_mut().zip(&hashes).zip(receipts) {
                let receipt = receipt.ok_or_else(|| {
                    malformed("eth_getTransactionReceipt", anyhow!("missing receipt for {hash}"))
                })?;
                if receipt.transaction_hash != *hash {
                    return Err(malformed(
                        "eth_getTransactionReceipt",
                        anyhow!("receipt for {} returned for {hash}", receipt.transaction_hash),
                    ));
                }
                let tx_logs = receipt
                    .apply_to(tx)
                    .map_err(|err| malformed("eth_getTransactionReceipt", err))?;
                logs.extend(tx_logs);
            }
        }

        Ok(logs)
    }

    async fn request_once<R>(&self, method: &'static str, params: ArrayParams) -> Result<R>
    where
        R: DeserializeOwned,
    {
        timeout(self.options.request_timeout, self.client.request(method, params))
            .await
            .map_err(|_| RpcError::Timeout { method })?
            .map_err(|err| map_rpc_error(method, err))
    }

    /// Runs a batch and fails on the first per-entry error.
    async fn execute_batch<'a, R>(
        &self,
        batch: BatchRequestBuilder<'a>,
        label: &'static str,
    ) -> Result<Vec<R>>
    where
        R: DeserializeOwned + fmt::Debug + 'static,
    {
        self.execute_batch_entries(batch, label)
            .await?
            .into_iter()
            .collect()
    }

    /// Runs a batch and keeps per-entry errors in place. Transport failures
    /// and timeouts fail the whole call.
    async fn execute_batch_entries<'a, R>(
        &self,
        batch: BatchRequestBuilder<'a>,
        label: &'static str,
    ) -> Result<Vec<Result<R>>>
    where
        R: DeserializeOwned + fmt::Debug + 'static,
    {
        let response = timeout(
            self.options.request_timeout,
            self.client.batch_request(batch),
        )
        .await
        .map_err(|_| RpcError::Timeout { method: label })?
        .map_err(|err| map_rpc_error(label, err))?;

        let entries: Vec<Result<R>> = response
            .into_iter()
            .map(|entry| entry.map_err(|err| map_rpc_batch_error(label, &err)))
            .collect();

        self.metrics.record_batch(entries.len());
        tracing::debug!(method = label, count = entries.len(), "batch RPC call completed");
        Ok(entries)
    }
}

/// Lines batch replies up with their requests. A request the node left
/// unanswered gets a malformed-response error so it lands in `failed`.
fn pair_replies<'a, R, T>(
    method: &'static str,
    requests: &'a [R],
    replies: Vec<Result<T>>,
) -> Vec<(&'a R, Result<T>)> {
    if replies.len() != requests.len() {
        tracing::warn!(
            method,
            requests = requests.len(),
            replies = replies.len(),
            "batch reply count does not match request count"
        );
    }

    let mut replies = replies.into_iter();
    requests
        .iter()
        .map(|request| {
            let reply = replies.next().unwrap_or_else(|| {
                Err(RpcError::MalformedResponse {
                    method,
                    reason: "no reply in batch response".to_owned(),
                }
                .into())
            });
            (request, reply)
        })
        .collect()
}

fn malformed(method: &'static str, err: anyhow::Error) -> anyhow::Error {
    RpcError::MalformedResponse {
        method,
        reason: format!("{err:#}"),
    }
    .into()
}

fn map_rpc_error(label: &'static str, err: JsonRpcError) -> anyhow::Error {
    if response_too_large(&err) {
        return RpcError::ResponseTooLarge { method: label }.into();
    }
    anyhow!("rpc {label} call failed: {err}")
}

fn map_rpc_batch_error(label: &str, err: &ErrorObject<'_>) -> anyhow::Error {
    if let Some(data) = err.data() {
        anyhow!(
            "rpc {label} call failed (code={}, message={}, data={})",
            err.code(),
            err.message(),
            data.get()
        )
    } else {
        anyhow!(
            "rpc {label} call failed (code={}, message={})",
            err.code(),
            err.message()
        )
    }
}

fn response_too_large(err: &JsonRpcError) -> bool {
    match err {
        JsonRpcError::Transport(inner) => match inner.downcast_ref::<HttpTransportError>() {
            Some(HttpTransportError::Http(http_err)) => matches!(http_err, HttpError::TooLarge),
            Some(HttpTransportError::RequestTooLarge) => true,
            _ => false,
        },
        _ => false,
    }
}
