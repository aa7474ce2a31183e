//! Lifecycle orchestration for `BlockFetcher`.

use super::tip::{ChainHead, HeadTracker};
use crate::rpc::ChainRpc;
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::telemetry::{self, MetricsReporterParams};
use crate::sequencer::RangeSequence;
use anyhow::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Run-scoped cancellation, fatal error capture, and the background tasks
/// that live exactly as long as one run.
pub(crate) struct LifecycleHandles {
    pub run_token: CancellationToken,
    fatal_handler: FatalErrorHandler,
    metrics_handle: Option<JoinHandle<()>>,
    head_handle: Option<JoinHandle<()>>,
}

pub(crate) struct HeadRefreshParams {
    pub rpc: Arc<dyn ChainRpc>,
    pub head: Arc<ChainHead>,
    pub follow: Option<Arc<RangeSequence>>,
    pub interval: Duration,
}

impl LifecycleHandles {
    pub(crate) fn new(shutdown_root: &CancellationToken) -> Self {
        let run_token = shutdown_root.child_token();
        let fatal_handler = FatalErrorHandler::new(shutdown_root.clone(), run_token.clone());
        Self {
            run_token,
            fatal_handler,
            metrics_handle: None,
            head_handle: None,
        }
    }

    /// Starts the metrics reporter. Its shutdown token is replaced by the
    /// run token.
    pub(crate) fn spawn_metrics_reporter(&mut self, params: MetricsReporterParams) {
        let handle = telemetry::spawn_metrics_reporter(MetricsReporterParams {
            shutdown: self.run_token.clone(),
            ..params
        });
        self.metrics_handle = Some(handle);
    }

    pub(crate) fn spawn_head_refresher(&mut self, params: HeadRefreshParams) {
        let HeadRefreshParams {
            rpc,
            head,
            follow,
            interval,
        } = params;
        let handle =
            HeadTracker::spawn_refresh_loop(rpc, head, follow, interval, self.run_token.clone());
        self.head_handle = Some(handle);
    }

    pub(crate) fn fatal_handler(&self) -> FatalErrorHandler {
        self.fatal_handler.clone()
    }

    pub(crate) fn error(&self) -> Option<Error> {
        self.fatal_handler.error()
    }

    pub(crate) async fn shutdown(mut self) {
        self.run_token.cancel();

        if let Some(handle) = self.metrics_handle.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "metrics reporter task panicked");
            }
        }

        if let Some(handle) = self.head_handle.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "chain head refresher task panicked");
            }
        }
    }
}
