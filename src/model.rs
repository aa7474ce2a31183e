//! Chain entities exchanged between the RPC layer, the address merge engine,
//! and storage. Raw entity fields are optional so callers can tell a missing
//! value apart from a present one.

pub mod entities;
pub mod range;

pub use entities::{
    AddressBalance, AddressParams, BalanceRequest, Block, InternalTransaction,
    InternalTransactionType, Log, Transaction, TransactionRef,
};
pub use range::BlockRange;
