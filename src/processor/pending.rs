//! Pending transaction polling.

use crate::addresses::{extract_addresses, EntityBatch, ExtractOptions};
use crate::rpc::ChainRpc;
use crate::runtime::fatal::{FatalErrorHandler, FatalStage};
use crate::storage::ChainStore;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub(crate) struct PendingTransactionsPoller {
    rpc: Arc<dyn ChainRpc>,
    store: Arc<dyn ChainStore>,
    fatal: FatalErrorHandler,
}

/// Result of one poll.
#[derive(Debug)]
pub(crate) enum PollOutcome {
    Imported(usize),
    Fatal(anyhow::Error),
}

impl PendingTransactionsPoller {
    pub(crate) fn new(
        rpc: Arc<dyn ChainRpc>,
        store: Arc<dyn ChainStore>,
        fatal: FatalErrorHandler,
    ) -> Self {
        Self { rpc, store, fatal }
    }

    pub(crate) fn spawn(self, poll_interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        match self.poll_once().await {
                            Ok(PollOutcome::Imported(count)) => {
                                tracing::debug!(count, "pending transactions imported");
                            }
                            Ok(PollOutcome::Fatal(_)) => break,
                            Err(err) => {
                                tracing::warn!(error = %err, "failed to import pending transactions");
                            }
                        }
                    }
                }
            }

            tracing::info!("pending transactions poller stopped");
        })
    }

    /// Fetches the pending block once and imports its transactions with
    /// addresses extracted in pending mode.
    pub(crate) async fn poll_once(&self) -> Result<PollOutcome> {
        let transactions = self
            .rpc
            .fetch_pending_transactions()
            .await
            .context("failed to fetch pending transactions")?;
        if transactions.is_empty() {
            return Ok(PollOutcome::Imported(0));
        }

        let batch = EntityBatch {
            transactions,
            ..EntityBatch::default()
        };
        let addresses = match extract_addresses(&batch, ExtractOptions::pending()) {
            Ok(addresses) => addresses,
            Err(err) => {
                let err = self.fatal.trigger(FatalStage::PendingTransactions, err.into());
                return Ok(PollOutcome::Fatal(err));
            }
        };

        let count = batch.transactions.len();
        self.store
            .import_pending_transactions(batch.transactions, addresses)
            .await
            .context("failed to store pending transactions")?;
        Ok(PollOutcome::Imported(count))
    }
}
