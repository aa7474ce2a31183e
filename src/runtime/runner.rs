//! Process-level driver: owns the indexer's root cancellation token, starts
//! the block fetcher, and tears it down on Ctrl-C or on a fatal pipeline
//! error. A stopped runner can be started again with a fresh token.

use crate::processor::fetcher::BlockFetcher;
use crate::rpc::ChainRpc;
use crate::runtime::config::IndexerConfig;
use crate::storage::ChainStore;
use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

pub struct Runner {
    fetcher: BlockFetcher,
    root: CancellationToken,
    running: bool,
}

impl Runner {
    pub fn new(config: IndexerConfig, rpc: Arc<dyn ChainRpc>, store: Arc<dyn ChainStore>) -> Self {
        let root = CancellationToken::new();
        Self {
            fetcher: BlockFetcher::with_cancellation_token(config, rpc, store, root.clone()),
            root,
            running: false,
        }
    }

    /// Builds the JSON-RPC client from `config` (URL, auth, timeout).
    pub fn from_config(config: IndexerConfig, store: Arc<dyn ChainStore>) -> Result<Self> {
        let mut fetcher = BlockFetcher::from_config(config, store)?;
        let root = CancellationToken::new();
        fetcher.replace_shutdown_root(root.clone());
        Ok(Self {
            fetcher,
            root,
            running: false,
        })
    }

    /// Token whose cancellation stops the current run. Replaced after every
    /// stop, so callers holding an old clone should fetch it again.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.root.clone()
    }

    pub fn fetcher(&self) -> &BlockFetcher {
        &self.fetcher
    }

    pub async fn start(&mut self) -> Result<()> {
        if !self.running {
            self.fetcher.start().await?;
            self.running = true;
        }
        Ok(())
    }

    /// Cancels the run and waits for the fetcher. Returns the fatal error
    /// that aborted the pipeline, if any.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }

        self.root.cancel();
        let outcome = self.fetcher.stop().await;
        self.running = false;

        self.root = CancellationToken::new();
        self.fetcher.replace_shutdown_root(self.root.clone());
        outcome
    }

    pub async fn run_until_ctrl_c(&mut self) -> Result<()> {
        self.run_until(async {
            match signal::ctrl_c().await {
                Ok(()) => tracing::info!("Ctrl-C received, stopping indexer"),
                Err(err) => {
                    tracing::warn!(error = %err, "failed to listen for Ctrl-C");
                    std::future::pending::<()>().await;
                }
            }
        })
        .await
    }

    /// Runs until `interrupt` resolves or the root token is cancelled, the
    /// latter also happening when a stage reports a fatal error.
    pub async fn run_until<F>(&mut self, interrupt: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        tracing::info!(rpc = self.fetcher.config().rpc_url(), "indexer running");

        let root = self.root.clone();
        tokio::select! {
            _ = interrupt => {}
            _ = root.cancelled() => tracing::info!("indexer cancelled"),
        }

        self.stop().await
    }
}
