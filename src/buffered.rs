//! Buffered task engine split across focused submodules:
//! - `types`: the `BufferedWorker` trait, batch outcomes, config, counters
//! - `shared`: the single lock-guarded buffer state plus lifetime stats
//! - `engine`: dispatcher loop, batch tasks, retry settlement, shutdown
//! - `tests`: engine behaviour tests
//!
//! Entries are buffered by key. Full batches dispatch immediately, partial
//! ones on every flush tick, and at most `max_concurrency` batches run at a
//! time. A failed entry is retried up to `max_retries` times and then
//! discarded with an error log.

mod engine;
mod shared;
mod types;


pub use engine::{BufferedTask, BufferedTaskHandle};
pub use types::{
    BatchContext, BatchOutcome, BufferProbe, BufferedTaskConfig, BufferedTaskStatsSnapshot,
    BufferedWorker, DebugCount, ShutdownMode,
};
