//! Shared retry context and canned log messages used by the RPC client so
//! every operation reports attempts, timeouts, and exhaustion the same way.

use anyhow::Error;
use std::time::Duration;

macro_rules! log_with_retry_ctx {
    ($level:ident, $ctx:expr, $($rest:tt)*) => {{
        if let Some(blocks) = $ctx.blocks {
            tracing::$level!(
                first_block = blocks.first,
                last_block = blocks.last,
                $($rest)*
            );
        } else if let Some(count) = $ctx.count {
            tracing::$level!(count, $($rest)*);
        } else {
            tracing::$level!($($rest)*);
        }
    }};
}

pub(crate) use log_with_retry_ctx;

#[derive(Clone, Copy)]
struct RetryBlocks {
    first: u64,
    last: u64,
}

/// Log labels describing how one RPC operation reports retries.
#[derive(Clone, Copy)]
pub(crate) struct RetryMessages {
    pub(crate) timeout: &'static str,
    pub(crate) retry: &'static str,
    pub(crate) exhausted: &'static str,
    pub(crate) not_found: Option<&'static str>,
    pub(crate) oversized: Option<&'static str>,
}

/// Passed into `retry_with_metrics` so callers can attach the block range or
/// item count they are working on.
#[derive(Clone, Copy)]
pub(crate) struct RetryContext<'a> {
    blocks: Option<RetryBlocks>,
    count: Option<usize>,
    messages: &'a RetryMessages,
}

impl<'a> RetryContext<'a> {
    pub(crate) fn new(messages: &'a RetryMessages) -> Self {
        Self {
            blocks: None,
            count: None,
            messages,
        }
    }

    pub(crate) fn with_blocks(messages: &'a RetryMessages, first: u64, last: u64) -> Self {
        Self {
            blocks: Some(RetryBlocks { first, last }),
            count: None,
            messages,
        }
    }

    pub(crate) fn with_count(messages: &'a RetryMessages, count: usize) -> Self {
        Self {
            blocks: None,
            count: Some(count),
            messages,
        }
    }

    pub(crate) fn log_timeout(&self, attempt: usize, method: &str, backoff: Duration) {
        log_with_retry_ctx!(
            warn,
            self,
            attempt,
            method,
            backoff_ms = Self::duration_to_millis(backoff),
            "{}",
            self.messages.timeout
        );
    }

    pub(crate) fn log_retry(&self, attempt: usize, backoff: Duration, err: &Error) {
        log_with_retry_ctx!(
            warn,
            self,
            attempt,
            backoff_ms = Self::duration_to_millis(backoff),
            error = %err,
            "{}",
            self.messages.retry
        );
    }

    pub(crate) fn log_exhausted(&self, attempt: usize, err: &Error) {
        log_with_retry_ctx!(error, self, attempt, error = %err, "{}", self.messages.exhausted);
    }

    pub(crate) fn log_not_found(&self, attempt: usize, number: u64) {
        if let Some(message) = self.messages.not_found {
            log_with_retry_ctx!(info, self, attempt, missing_block = number, "{}", message);
        }
    }

    pub(crate) fn log_oversized(&self, attempt: usize, method: &str) {
        if let Some(message) = self.messages.oversized {
            log_with_retry_ctx!(warn, self, attempt, method, "{}", message);
        }
    }

    fn duration_to_millis(backoff: Duration) -> u64 {
        backoff.as_millis().min(u128::from(u64::MAX)) as u64
    }
}

pub(crate) const FETCH_BLOCKS_RETRY: RetryMessages = RetryMessages {
    timeout: "eth_getBlockByNumber batch timed out; will retry",
    retry: "eth_getBlockByNumber batch failed; retrying",
    exhausted: "eth_getBlockByNumber batch exhausted retries",
    not_found: Some("requested block is above the chain head"),
    oversized: Some("eth_getBlockByNumber batch exceeded HTTP size limit; use a smaller range"),
};

pub(crate) const FETCH_RECEIPTS_RETRY: RetryMessages = RetryMessages {
    timeout: "eth_getTransactionReceipt batch timed out; will retry",
    retry: "eth_getTransactionReceipt batch failed; retrying",
    exhausted: "eth_getTransactionReceipt batch exhausted retries",
    not_found: None,
    oversized: Some("receipt batch exceeded HTTP size limit; lower receipts_batch_size"),
};

pub(crate) const FETCH_TRACES_RETRY: RetryMessages = RetryMessages {
    timeout: "trace_replayTransaction batch timed out; will retry",
    retry: "trace_replayTransaction batch failed; retrying",
    exhausted: "trace_replayTransaction batch exhausted retries",
    not_found: None,
    oversized: Some("trace batch exceeded HTTP size limit"),
};

pub(crate) const FETCH_BALANCES_RETRY: RetryMessages = RetryMessages {
    timeout: "eth_getBalance batch timed out; will retry",
    retry: "eth_getBalance batch failed; retrying",
    exhausted: "eth_getBalance batch exhausted retries",
    not_found: None,
    oversized: None,
};

pub(crate) const BLOCK_NUMBER_RETRY: RetryMessages = RetryMessages {
    timeout: "eth_blockNumber timed out; retrying",
    retry: "eth_blockNumber failed; retrying",
    exhausted: "eth_blockNumber exhausted retries",
    not_found: None,
    oversized: None,
};

pub(crate) const PENDING_BLOCK_RETRY: RetryMessages = RetryMessages {
    timeout: "pending block request timed out; retrying",
    retry: "pending block request failed; retrying",
    exhausted: "pending block request exhausted retries",
    not_found: None,
    oversized: Some("pending block exceeded HTTP size limit"),
};

pub(crate) const CONTRACT_CALL_RETRY: RetryMessages = RetryMessages {
    timeout: "eth_call timed out; retrying",
    retry: "eth_call failed; retrying",
    exhausted: "eth_call exhausted retries",
    not_found: None,
    oversized: None,
};
