use super::{BlockImport, ChainStore, InternalTransactionImport, PersistedCounts};
use crate::model::{
    AddressBalance, AddressParams, BalanceRequest, Block, BlockRange, InternalTransaction, Log,
    Transaction, TransactionRef,
};
use alloy_primitives::{Address, Bytes, B256, U256};
use anyhow::{bail, Context, Result};
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;

/// Address row as held by [`MemoryStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredAddress {
    pub fetched_balance_block_number: Option<u64>,
    pub contract_code: Option<Bytes>,
    pub balance: Option<U256>,
    pub balance_block_number: Option<u64>,
}

#[derive(Debug, Default)]
struct MemoryState {
    blocks: HashMap<B256, Block>,
    block_numbers: BTreeMap<u64, B256>,
    transactions: HashMap<B256, Transaction>,
    pending: HashMap<B256, Transaction>,
    internal_transactions: HashMap<(B256, u64), InternalTransaction>,
    traced: HashSet<B256>,
    logs: HashMap<(B256, u64), Log>,
    addresses: HashMap<Address, StoredAddress>,
}

/// Thread-safe in-memory [`ChainStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn block(&self, number: u64) -> Option<Block> {
        let state = self.state.read().await;
        let hash = state.block_numbers.get(&number)?;
        state.blocks.get(hash).cloned()
    }

    pub async fn block_numbers(&self) -> Vec<u64> {
        self.state.read().await.block_numbers.keys().copied().collect()
    }

    pub async fn transaction(&self, hash: B256) -> Option<Transaction> {
        self.state.read().await.transactions.get(&hash).cloned()
    }

    pub async fn pending_transactions(&self) -> Vec<Transaction> {
        let state = self.state.read().await;
        let mut pending: Vec<Transaction> = state.pending.values().cloned().collect();
        pending.sort_by_key(|tx| tx.hash);
        pending
    }

    pub async fn internal_transactions_of(&self, transaction: B256) -> Vec<InternalTransaction> {
        let state = self.state.read().await;
        let mut found: Vec<InternalTransaction> = state
            .internal_transactions
            .iter()
            .filter(|((hash, _), _)| *hash == transaction)
            .map(|(_, itx)| itx.clone())
            .collect();
        found.sort_by_key(|itx| itx.index);
        found
    }

    pub async fn address(&self, hash: Address) -> Option<StoredAddress> {
        self.state.read().await.addresses.get(&hash).cloned()
    }

    pub async fn logs(&self) -> Vec<Log> {
        let state = self.state.read().await;
        let mut logs: Vec<Log> = state.logs.values().cloned().collect();
        logs.sort_by_key(|log| (log.block_number, log.index));
        logs
    }
}

impl MemoryState {
    fn upsert_addresses(&mut self, addresses: Vec<AddressParams>) {
        for params in addresses {
            let stored = self.addresses.entry(params.hash).or_default();
            stored.fetched_balance_block_number = stored
                .fetched_balance_block_number
                .max(params.fetched_balance_block_number);
            if stored.contract_code.is_none() {
                stored.contract_code = params.contract_code;
            }
        }
    }

    fn upsert_internal_transactions(&mut self, internal: Vec<InternalTransaction>) -> Result<()> {
        for itx in internal {
            let hash = itx
                .transaction_hash
                .context("internal transaction without transaction hash")?;
            let index = itx.index.context("internal transaction without index")?;
            self.traced.insert(hash);
            self.internal_transactions.insert((hash, index), itx);
        }
        Ok(())
    }
}

impl ChainStore for MemoryStore {
    fn import_blocks(&self, import: BlockImport) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.write().await;

            for block in &import.blocks {
                if block.hash.is_none() || block.number.is_none() {
                    bail!("cannot import block without hash and number: {block:?}");
                }
            }
            for tx in &import.transactions {
                if tx.hash.is_none() {
                    bail!("cannot import transaction without hash");
                }
            }
            for log in &import.logs {
                if log.transaction_hash.is_none() || log.index.is_none() {
                    bail!("cannot import log without transaction hash and index");
                }
            }

            for block in import.blocks {
                if let (Some(hash), Some(number)) = (block.hash, block.number) {
                    if let Some(previous) = state.block_numbers.insert(number, hash) {
                        if previous != hash {
                            state.blocks.remove(&previous);
                        }
                    }
                    state.blocks.insert(hash, block);
                }
            }
            for tx in import.transactions {
                if let Some(hash) = tx.hash {
                    state.pending.remove(&hash);
                    state.transactions.insert(hash, tx);
                }
            }
            for log in import.logs {
                if let (Some(tx_hash), Some(index)) = (log.transaction_hash, log.index) {
                    state.logs.insert((tx_hash, index), log);
                }
            }
            state.upsert_internal_transactions(import.internal_transactions)?;
            state.upsert_addresses(import.addresses);
            Ok(())
        })
    }

    fn import_internal_transactions(
        &self,
        import: InternalTransactionImport,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            state.upsert_internal_transactions(import.internal_transactions)?;
            for tx in import.transactions {
                state.traced.insert(tx.hash);
            }
            state.upsert_addresses(import.addresses);
            Ok(())
        })
    }

    fn update_address_balances(&self, balances: Vec<AddressBalance>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            for balance in balances {
                let stored = state.addresses.entry(balance.address).or_default();
                if stored.balance_block_number.map_or(true, |held| held <= balance.block_number) {
                    stored.balance = Some(balance.value);
                    stored.balance_block_number = Some(balance.block_number);
                }
                stored.fetched_balance_block_number = stored
                    .fetched_balance_block_number
                    .max(Some(balance.block_number));
            }
            Ok(())
        })
    }

    fn import_pending_transactions(
        &self,
        transactions: Vec<Transaction>,
        addresses: Vec<AddressParams>,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            for tx in transactions {
                let Some(hash) = tx.hash else {
                    bail!("cannot import pending transaction without hash");
                };
                if !state.transactions.contains_key(&hash) {
                    state.pending.insert(hash, tx);
                }
            }
            state.upsert_addresses(addresses);
            Ok(())
        })
    }

    fn persisted_counts(&self) -> BoxFuture<'_, Result<PersistedCounts>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(PersistedCounts {
                blocks: state.blocks.len() as u64,
                transactions: state.transactions.len() as u64,
                internal_transactions: state.internal_transactions.len() as u64,
                logs: state.logs.len() as u64,
                addresses: state.addresses.len() as u64,
            })
        })
    }

    fn indexed_bounds(&self) -> BoxFuture<'_, Result<Option<BlockRange>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let lowest = state.block_numbers.keys().next().copied();
            let highest = state.block_numbers.keys().next_back().copied();
            Ok(lowest.zip(highest).map(|(low, high)| BlockRange::new(low, high)))
        })
    }

    fn missing_block_ranges(&self, within: BlockRange) -> BoxFuture<'_, Result<Vec<BlockRange>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let mut missing = Vec::new();
            let mut cursor = Some(within.first());

            for &number in state.block_numbers.range(within.first()..=within.last()).map(|(n, _)| n) {
                if let Some(next) = cursor {
                    if number > next {
                        missing.push(BlockRange::new(next, number - 1));
                    }
                }
                cursor = number.checked_add(1);
            }
            if let Some(next) = cursor {
                if next <= within.last() {
                    missing.push(BlockRange::new(next, within.last()));
                }
            }
            Ok(missing)
        })
    }

    fn addresses_without_balance(&self) -> BoxFuture<'_, Result<Vec<BalanceRequest>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let mut requests: Vec<BalanceRequest> = state
                .addresses
                .iter()
                .filter_map(|(hash, stored)| {
                    let block_number = stored.fetched_balance_block_number?;
                    let fetched = stored
                        .balance_block_number
                        .is_some_and(|held| held >= block_number);
                    (!fetched).then_some(BalanceRequest {
                        address: *hash,
                        block_number,
                    })
                })
                .collect();
            requests.sort_by_key(|request| request.address);
            Ok(requests)
        })
    }

    fn transactions_without_internal_transactions(
        &self,
    ) -> BoxFuture<'_, Result<Vec<TransactionRef>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let mut refs: Vec<TransactionRef> = state
                .transactions
                .values()
                .filter(|tx| tx.hash.is_some_and(|hash| !state.traced.contains(&hash)))
                .filter_map(Transaction::reference)
                .collect();
            refs.sort_by_key(|tx| (tx.block_number, tx.index));
            Ok(refs)
        })
    }
}
