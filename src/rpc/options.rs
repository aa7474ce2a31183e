//! Transport settings for `AsyncRpcClient`.
//!
//! The defaults target a public archive node: one minute per call, receipts
//! fetched in batches of 250, and three attempts with doubling waits between
//! 200ms and 2s.

use anyhow::{bail, Result};
use std::time::Duration;

pub const DEFAULT_HTTP_BODY_LIMIT_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_RECEIPTS_BATCH_SIZE: usize = 250;

#[derive(Debug, Clone)]
pub struct RpcClientOptions {
    pub request_timeout: Duration,
    pub max_concurrent_requests: usize,
    /// Attempts per logical call, the first one included.
    pub max_attempts: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_request_body_bytes: usize,
    pub max_response_body_bytes: usize,
    /// Receipts requested per JSON-RPC batch when completing transactions.
    pub receipts_batch_size: usize,
}

impl Default for RpcClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            max_concurrent_requests: 256,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
            max_request_body_bytes: DEFAULT_HTTP_BODY_LIMIT_BYTES,
            max_response_body_bytes: DEFAULT_HTTP_BODY_LIMIT_BYTES,
            receipts_batch_size: DEFAULT_RECEIPTS_BATCH_SIZE,
        }
    }
}

impl RpcClientOptions {
    pub(crate) fn validate(&self) -> Result<()> {
        let counts = [
            ("max_concurrent_requests", self.max_concurrent_requests),
            ("max_attempts", self.max_attempts),
            ("max_request_body_bytes", self.max_request_body_bytes),
            ("max_response_body_bytes", self.max_response_body_bytes),
            ("receipts_batch_size", self.receipts_batch_size),
        ];
        if let Some((name, _)) = counts.iter().find(|(_, value)| *value == 0) {
            bail!("{name} must be greater than 0");
        }
        if self.request_timeout.is_zero() {
            bail!("request_timeout must be greater than 0");
        }
        if self.initial_backoff.is_zero() {
            bail!("initial_backoff must be greater than 0");
        }
        if self.max_backoff < self.initial_backoff {
            bail!(
                "max_backoff ({:?}) must not be shorter than initial_backoff ({:?})",
                self.max_backoff,
                self.initial_backoff
            );
        }
        Ok(())
    }

    /// Wait before the attempt following `attempt`: doubles from
    /// `initial_backoff` and saturates at `max_backoff`.
    pub(crate) fn retry_delay(&self, attempt: usize) -> Duration {
        let doublings = attempt.saturating_sub(1).min(31) as u32;
        self.initial_backoff
            .saturating_mul(1u32 << doublings)
            .min(self.max_backoff)
    }

    /// jsonrpsee takes body limits as `u32`.
    pub(crate) fn body_limits(&self) -> (u32, u32) {
        let clamp = |bytes: usize| u32::try_from(bytes).unwrap_or(u32::MAX);
        (
            clamp(self.max_request_body_bytes),
            clamp(self.max_response_body_bytes),
        )
    }
}
