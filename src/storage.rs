//! Persistence collaborator for the indexing pipeline. Every write is an
//! idempotent upsert keyed by block hash, transaction hash,
//! `(transaction hash, index)` for internal transactions and logs, and
//! address hash, so replaying a range after a failure is safe.

pub mod memory;

use crate::model::{
    AddressBalance, AddressParams, BalanceRequest, Block, BlockRange, InternalTransaction, Log,
    Transaction, TransactionRef,
};
use anyhow::Result;
use futures::future::BoxFuture;

pub use memory::{MemoryStore, StoredAddress};

/// Everything persisted for one fetched block range.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockImport {
    pub blocks: Vec<Block>,
    pub transactions: Vec<Transaction>,
    pub logs: Vec<Log>,
    pub internal_transactions: Vec<InternalTransaction>,
    pub addresses: Vec<AddressParams>,
}

/// Traces fetched for a set of transactions. `transactions` lists every
/// transaction that was traced, including those without sub-calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InternalTransactionImport {
    pub transactions: Vec<TransactionRef>,
    pub internal_transactions: Vec<InternalTransaction>,
    pub addresses: Vec<AddressParams>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistedCounts {
    pub blocks: u64,
    pub transactions: u64,
    pub internal_transactions: u64,
    pub logs: u64,
    pub addresses: u64,
}

pub trait ChainStore: Send + Sync {
    fn import_blocks(&self, import: BlockImport) -> BoxFuture<'_, Result<()>>;

    fn import_internal_transactions(
        &self,
        import: InternalTransactionImport,
    ) -> BoxFuture<'_, Result<()>>;

    /// Stores balances, ignoring values older than the one already held.
    fn update_address_balances(&self, balances: Vec<AddressBalance>) -> BoxFuture<'_, Result<()>>;

    fn import_pending_transactions(
        &self,
        transactions: Vec<Transaction>,
        addresses: Vec<AddressParams>,
    ) -> BoxFuture<'_, Result<()>>;

    fn persisted_counts(&self) -> BoxFuture<'_, Result<PersistedCounts>>;

    /// Lowest and highest indexed block numbers, `None` when nothing is
    /// indexed yet.
    fn indexed_bounds(&self) -> BoxFuture<'_, Result<Option<BlockRange>>>;

    /// Ranges inside `within` with no indexed block, ascending.
    fn missing_block_ranges(&self, within: BlockRange) -> BoxFuture<'_, Result<Vec<BlockRange>>>;

    /// Addresses whose balance has not been fetched at their latest known
    /// block.
    fn addresses_without_balance(&self) -> BoxFuture<'_, Result<Vec<BalanceRequest>>>;

    /// Mined transactions whose traces were never imported.
    fn transactions_without_internal_transactions(
        &self,
    ) -> BoxFuture<'_, Result<Vec<TransactionRef>>>;
}
