//! Fatal error capture. The first unrecoverable error of a run is kept,
//! labelled with the stage that raised it, and both the run token and the
//! root token are cancelled so every loop winds down.

use anyhow::Error as AnyError;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

/// Pipeline stage in which a fatal error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalStage {
    /// Address merge on a fetched block range.
    BlockImport,
    /// Address merge on fetched traces.
    InternalTransactions,
    /// Address merge on pending transactions.
    PendingTransactions,
}

impl FatalStage {
    pub fn label(self) -> &'static str {
        match self {
            FatalStage::BlockImport => "block import",
            FatalStage::InternalTransactions => "internal transactions",
            FatalStage::PendingTransactions => "pending transactions",
        }
    }
}

impl fmt::Display for FatalStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Cloneable handle shared by every stage of one run.
#[derive(Clone)]
pub struct FatalErrorHandler {
    state: Arc<FatalState>,
}

struct FatalState {
    first: OnceLock<SharedError>,
    root: CancellationToken,
    run: CancellationToken,
}

/// An `anyhow::Error` behind an `Arc` so the captured error can be handed out
/// more than once.
#[derive(Clone)]
struct SharedError(Arc<AnyError>);

impl fmt::Debug for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.0.as_ref(), f)
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // keep the context chain visible
        write!(f, "{:#}", self.0.as_ref())
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.0.as_ref().as_ref())
    }
}

impl FatalErrorHandler {
    pub fn new(root: CancellationToken, run: CancellationToken) -> Self {
        Self {
            state: Arc::new(FatalState {
                first: OnceLock::new(),
                root,
                run,
            }),
        }
    }

    /// Captures `error` as the run's fatal error unless one was already
    /// captured, then cancels the run. The returned error carries the stage
    /// label and is meant to be propagated by the caller.
    pub fn trigger(&self, stage: FatalStage, error: AnyError) -> AnyError {
        let labelled = SharedError(Arc::new(
            error.context(format!("fatal error during {stage}")),
        ));

        match self.state.first.set(labelled.clone()) {
            Ok(()) => {
                tracing::error!(
                    stage = stage.label(),
                    error = %labelled,
                    "fatal pipeline error, shutting down"
                );
                self.state.run.cancel();
                self.state.root.cancel();
                labelled.into()
            }
            Err(late) => {
                tracing::debug!(stage = stage.label(), error = %late, "fatal error after shutdown");
                late.into()
            }
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.state.first.get().is_some()
    }

    pub fn error(&self) -> Option<AnyError> {
        self.state.first.get().cloned().map(AnyError::new)
    }
}
