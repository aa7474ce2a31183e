//! Internal transaction fetcher.

use super::balances::{balance_requests, BalanceFetcherHandle};
use crate::addresses::{extract_addresses, EntityBatch, ExtractOptions};
use crate::buffered::{BatchContext, BatchOutcome, BufferedTaskHandle, BufferedWorker};
use crate::model::TransactionRef;
use crate::rpc::ChainRpc;
use crate::runtime::fatal::{FatalErrorHandler, FatalStage};
use crate::runtime::telemetry::{FetchState, ImportCounts};
use crate::storage::{ChainStore, InternalTransactionImport};
use alloy_primitives::B256;
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use std::collections::HashSet;
use std::sync::Arc;

pub const INTERNAL_TRANSACTION_FETCHER: &str = "internal_transactions";

pub type InternalTransactionFetcherHandle = BufferedTaskHandle<InternalTransactionFetcher>;

pub struct InternalTransactionFetcherParams {
    pub rpc: Arc<dyn ChainRpc>,
    pub store: Arc<dyn ChainStore>,
    pub balances: BalanceFetcherHandle,
    pub fatal: FatalErrorHandler,
    pub fetch_state: Arc<FetchState>,
}

/// Fetches traces of mined transactions, merges the addresses they touch,
/// stores both, and schedules balance fetches for those addresses.
pub struct InternalTransactionFetcher {
    rpc: Arc<dyn ChainRpc>,
    store: Arc<dyn ChainStore>,
    balances: BalanceFetcherHandle,
    fatal: FatalErrorHandler,
    fetch_state: Arc<FetchState>,
}

impl InternalTransactionFetcher {
    pub fn new(params: InternalTransactionFetcherParams) -> Self {
        let InternalTransactionFetcherParams {
            rpc,
            store,
            balances,
            fatal,
            fetch_state,
        } = params;

        Self {
            rpc,
            store,
            balances,
            fatal,
            fetch_state,
        }
    }

    async fn fetch_and_import(
        &self,
        batch: Vec<TransactionRef>,
    ) -> Result<BatchOutcome<TransactionRef>> {
        let fetched = self
            .rpc
            .fetch_internal_transactions(&batch)
            .await
            .context("failed to fetch internal transactions")?;

        let failed: HashSet<B256> = fetched.failed.iter().map(|tx| tx.hash).collect();
        let traced: Vec<TransactionRef> = batch
            .into_iter()
            .filter(|tx| !failed.contains(&tx.hash))
            .collect();

        let entities = EntityBatch {
            internal_transactions: fetched.internal_transactions,
            ..EntityBatch::default()
        };
        let addresses = match extract_addresses(&entities, ExtractOptions::default()) {
            Ok(addresses) => addresses,
            Err(err) => {
                return Err(self
                    .fatal
                    .trigger(FatalStage::InternalTransactions, err.into()));
            }
        };

        let counts = ImportCounts {
            internal_transactions: entities.internal_transactions.len() as u64,
            addresses: addresses.len() as u64,
            ..ImportCounts::default()
        };
        let requests = balance_requests(&addresses);

        if !traced.is_empty() {
            self.store
                .import_internal_transactions(InternalTransactionImport {
                    transactions: traced.clone(),
                    internal_transactions: entities.internal_transactions,
                    addresses,
                })
                .await
                .context("failed to import internal transactions")?;
            self.fetch_state.record_import(counts);
            self.balances.enqueue_all(requests).await;
        }

        tracing::debug!(
            traced = traced.len(),
            failed = fetched.failed.len(),
            internal_transactions = counts.internal_transactions,
            "internal transactions imported"
        );

        if fetched.failed.is_empty() {
            Ok(BatchOutcome::Done)
        } else {
            Ok(BatchOutcome::Retry(fetched.failed))
        }
    }
}

impl BufferedWorker for InternalTransactionFetcher {
    type Entry = TransactionRef;
    type Key = B256;

    fn key(&self, entry: &TransactionRef) -> B256 {
        entry.hash
    }

    fn run(
        &self,
        batch: Vec<TransactionRef>,
        _ctx: BatchContext<Self>,
    ) -> BoxFuture<'_, Result<BatchOutcome<TransactionRef>>> {
        Box::pin(self.fetch_and_import(batch))
    }

    fn on_discard(&self, entry: &TransactionRef, failures: usize) {
        tracing::warn!(
            transaction = %entry.hash,
            block_number = entry.block_number,
            failures,
            "giving up on internal transactions"
        );
    }
}
