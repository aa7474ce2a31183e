//! Chain head tracking for the follow-head loop.

use crate::rpc::ChainRpc;
use crate::sequencer::RangeSequence;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Latest block number reported by the node. The value is refreshed
/// periodically by a dedicated task.
#[derive(Debug)]
pub struct ChainHead {
    value: AtomicU64,
    ready: AtomicBool,
}

impl ChainHead {
    pub fn new(initial: Option<u64>) -> Self {
        Self {
            value: AtomicU64::new(initial.unwrap_or(0)),
            ready: AtomicBool::new(initial.is_some()),
        }
    }

    pub fn update(&self, number: u64) {
        self.value.store(number, Ordering::SeqCst);
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn current(&self) -> Option<u64> {
        if self.ready.load(Ordering::SeqCst) {
            Some(self.value.load(Ordering::SeqCst))
        } else {
            None
        }
    }
}

pub(crate) struct HeadTracker;

impl HeadTracker {
    /// Polls `latest_block_number` and lets `follow` yield ranges up to the
    /// new head. A head lower than the previous one is recorded but never
    /// rewinds the sequence.
    pub(crate) fn spawn_refresh_loop(
        rpc: Arc<dyn ChainRpc>,
        head: Arc<ChainHead>,
        follow: Option<Arc<RangeSequence>>,
        refresh_interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(refresh_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut last_head = head.current();

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        break;
                    }
                    _ = ticker.tick() => {
                        match rpc.latest_block_number().await {
                            Ok(number) => {
                                head.update(number);
                                if let Some(previous) = last_head {
                                    if number < previous {
                                        tracing::warn!(
                                            head = number,
                                            previous_head = previous,
                                            "chain head moved backwards"
                                        );
                                    }
                                }
                                if let Some(follow) = &follow {
                                    follow.extend_to(number).await;
                                }
                                last_head = Some(number);
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "failed to refresh chain head");
                            }
                        }
                    }
                }
            }

            tracing::info!("chain head refresher stopped");
        })
    }
}
