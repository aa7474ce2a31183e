//! JSON-RPC plumbing for Ethereum nodes: the `ChainRpc` collaborator trait,
//! the batching `AsyncRpcClient`, authentication, response decoding,
//! contract-call encoding, metrics, and retry policy.

pub mod auth;
pub mod client;
pub mod contract;
mod decode;
pub mod metrics;
pub mod options;
pub mod retry;

pub use auth::BasicAuth;
pub use client::{
    AsyncRpcClient, ChainRpc, FetchedBalances, FetchedBlocks, FetchedInternalTransactions,
    RpcError,
};
pub use contract::{encode_call, selector, AbiValue};
pub use metrics::RpcMetricsSnapshot;
pub use options::RpcClientOptions;
