//! Address balance fetcher.

use crate::buffered::{BatchContext, BatchOutcome, BufferedTaskHandle, BufferedWorker};
use crate::model::{AddressParams, BalanceRequest};
use crate::rpc::ChainRpc;
use crate::storage::ChainStore;
use alloy_primitives::Address;
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use std::sync::Arc;

pub const BALANCE_FETCHER: &str = "address_balances";

pub type BalanceFetcherHandle = BufferedTaskHandle<BalanceFetcher>;

/// Fetches balances at the block each address was last seen in and stores
/// them. Requests for the same address collapse to the highest block.
pub struct BalanceFetcher {
    rpc: Arc<dyn ChainRpc>,
    store: Arc<dyn ChainStore>,
}

impl BalanceFetcher {
    pub fn new(rpc: Arc<dyn ChainRpc>, store: Arc<dyn ChainStore>) -> Self {
        Self { rpc, store }
    }

    async fn fetch_and_store(
        &self,
        batch: Vec<BalanceRequest>,
    ) -> Result<BatchOutcome<BalanceRequest>> {
        let fetched = self
            .rpc
            .fetch_balances(&batch)
            .await
            .context("failed to fetch address balances")?;

        let stored = fetched.balances.len();
        if !fetched.balances.is_empty() {
            self.store
                .update_address_balances(fetched.balances)
                .await
                .context("failed to store address balances")?;
        }

        tracing::debug!(
            requested = batch.len(),
            stored,
            failed = fetched.failed.len(),
            "address balances fetched"
        );

        if fetched.failed.is_empty() {
            Ok(BatchOutcome::Done)
        } else {
            Ok(BatchOutcome::Retry(fetched.failed))
        }
    }
}

impl BufferedWorker for BalanceFetcher {
    type Entry = BalanceRequest;
    type Key = Address;

    fn key(&self, entry: &BalanceRequest) -> Address {
        entry.address
    }

    fn merge(&self, existing: BalanceRequest, incoming: BalanceRequest) -> BalanceRequest {
        if incoming.block_number > existing.block_number {
            incoming
        } else {
            existing
        }
    }

    fn run(
        &self,
        batch: Vec<BalanceRequest>,
        _ctx: BatchContext<Self>,
    ) -> BoxFuture<'_, Result<BatchOutcome<BalanceRequest>>> {
        Box::pin(self.fetch_and_store(batch))
    }

    fn on_discard(&self, entry: &BalanceRequest, failures: usize) {
        tracing::warn!(
            address = %entry.address,
            block_number = entry.block_number,
            failures,
            "giving up on address balance"
        );
    }
}

/// Balance requests for every address whose block number is known.
pub fn balance_requests(addresses: &[AddressParams]) -> Vec<BalanceRequest> {
    addresses
        .iter()
        .filter_map(BalanceRequest::from_params)
        .collect()
}
