pub mod addresses;
pub mod buffered;
pub mod model;
pub mod processor;
pub mod rpc;
pub mod runtime;
pub mod sequencer;
pub mod storage;

pub use addresses::{extract_addresses, EntityBatch, ExtractError, ExtractOptions};
pub use buffered::{
    BatchContext, BatchOutcome, BufferedTask, BufferedTaskConfig, BufferedTaskHandle,
    BufferedWorker, DebugCount, ShutdownMode,
};
pub use model::{
    AddressBalance, AddressParams, BalanceRequest, Block, BlockRange, InternalTransaction,
    InternalTransactionType, Log, Transaction, TransactionRef,
};
pub use processor::balances::BalanceFetcher;
pub use processor::fetcher::{BlockFetcher, FetcherCounts};
pub use processor::internal_transactions::InternalTransactionFetcher;
pub use processor::tip::ChainHead;
pub use rpc::{AsyncRpcClient, BasicAuth, ChainRpc, RpcClientOptions, RpcError};
pub use runtime::config::{IndexerConfig, IndexerConfigBuilder, IndexerConfigParams};
pub use runtime::fatal::{FatalErrorHandler, FatalStage};
pub use runtime::progress::ProgressTracker;
pub use runtime::runner::Runner;
pub use runtime::telemetry::{init_tracing, FetchState, FetchStateSnapshot};
pub use sequencer::{RangeSequence, SequenceConfig, WalkDirection};
pub use storage::{ChainStore, MemoryStore, PersistedCounts};
