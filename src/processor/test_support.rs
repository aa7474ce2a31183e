//! Synthetic chain used by the processor unit tests.

use crate::model::{
    AddressBalance, BalanceRequest, Block, BlockRange, InternalTransaction,
    InternalTransactionType, Log, Transaction, TransactionRef,
};
use crate::rpc::{ChainRpc, FetchedBalances, FetchedBlocks, FetchedInternalTransactions, RpcError};
use alloy_primitives::{Address, B256, U256};
use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

pub(crate) const MINER: u8 = 0xee;
pub(crate) const SENDER: u8 = 0x01;
pub(crate) const LOG_EMITTER: u8 = 0x50;
pub(crate) const TRACE_TARGET: u8 = 0x60;

pub(crate) fn address(byte: u8) -> Address {
    Address::with_last_byte(byte)
}

pub(crate) fn hash_of(tag: u8, number: u64) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[0] = tag;
    bytes[24..].copy_from_slice(&number.to_be_bytes());
    B256::from(bytes)
}

pub(crate) fn transaction_hash(number: u64) -> B256 {
    hash_of(0x11, number)
}

pub(crate) fn recipient(number: u64) -> Address {
    address(2 + (number % 3) as u8)
}

#[derive(Default)]
struct Faults {
    blocks: HashMap<u64, usize>,
    traces: HashMap<B256, usize>,
    balances: HashSet<Address>,
}

/// In-process `ChainRpc` with one transaction and one log per block.
pub(crate) struct StubChain {
    blocks: BTreeMap<u64, Block>,
    head: AtomicU64,
    inline_internal: Mutex<HashMap<u64, Vec<InternalTransaction>>>,
    pending: Mutex<Vec<Transaction>>,
    faults: Mutex<Faults>,
    block_calls: Mutex<Vec<BlockRange>>,
    trace_calls: Mutex<Vec<B256>>,
    balance_calls: Mutex<Vec<BalanceRequest>>,
}

impl StubChain {
    pub(crate) fn with_blocks(numbers: RangeInclusive<u64>) -> Self {
        let head = *numbers.end();
        let blocks = numbers
            .map(|number| {
                let block = Block {
                    number: Some(number),
                    hash: Some(hash_of(0xb0, number)),
                    parent_hash: number.checked_sub(1).map(|parent| hash_of(0xb0, parent)),
                    miner_hash: Some(address(MINER)),
                    timestamp: Some(1_600_000_000 + number),
                    gas_used: Some(21_000),
                    gas_limit: Some(30_000_000),
                };
                (number, block)
            })
            .collect();

        Self {
            blocks,
            head: AtomicU64::new(head),
            inline_internal: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            faults: Mutex::new(Faults::default()),
            block_calls: Mutex::new(Vec::new()),
            trace_calls: Mutex::new(Vec::new()),
            balance_calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn set_head(&self, number: u64) {
        self.head.store(number, Ordering::SeqCst);
    }

    /// Fails every block fetch touching `number` this many times.
    pub(crate) fn fail_block(&self, number: u64, times: usize) {
        self.faults.lock().unwrap().blocks.insert(number, times);
    }

    pub(crate) fn fail_trace(&self, hash: B256, times: usize) {
        self.faults.lock().unwrap().traces.insert(hash, times);
    }

    pub(crate) fn fail_balance(&self, address: Address) {
        self.faults.lock().unwrap().balances.insert(address);
    }

    pub(crate) fn set_inline_internal(&self, number: u64, traces: Vec<InternalTransaction>) {
        self.inline_internal.lock().unwrap().insert(number, traces);
    }

    pub(crate) fn set_pending(&self, transactions: Vec<Transaction>) {
        *self.pending.lock().unwrap() = transactions;
    }

    pub(crate) fn block_calls(&self) -> Vec<BlockRange> {
        self.block_calls.lock().unwrap().clone()
    }

    pub(crate) fn trace_calls(&self) -> Vec<B256> {
        self.trace_calls.lock().unwrap().clone()
    }

    pub(crate) fn balance_calls(&self) -> Vec<BalanceRequest> {
        self.balance_calls.lock().unwrap().clone()
    }

    pub(crate) fn balance_of(request: &BalanceRequest) -> U256 {
        U256::from(request.block_number * 100 + u64::from(request.address[19]))
    }

    fn transaction(number: u64) -> Transaction {
        Transaction {
            hash: Some(transaction_hash(number)),
            block_number: Some(number),
            block_hash: Some(hash_of(0xb0, number)),
            index: Some(0),
            from_address_hash: Some(address(SENDER)),
            to_address_hash: Some(recipient(number)),
            value: Some(U256::from(number)),
            gas: Some(21_000),
            nonce: Some(number),
            status: Some(1),
            gas_used: Some(21_000),
            ..Transaction::default()
        }
    }

    fn log(number: u64) -> Log {
        Log {
            address_hash: Some(address(LOG_EMITTER)),
            block_number: Some(number),
            block_hash: Some(hash_of(0xb0, number)),
            transaction_hash: Some(transaction_hash(number)),
            index: Some(0),
            ..Log::default()
        }
    }

    pub(crate) fn trace(reference: &TransactionRef) -> InternalTransaction {
        InternalTransaction {
            transaction_hash: Some(reference.hash),
            index: Some(0),
            block_number: Some(reference.block_number),
            transaction_index: Some(reference.index),
            kind: Some(InternalTransactionType::Call),
            call_type: Some("call".into()),
            from_address_hash: Some(recipient(reference.block_number)),
            to_address_hash: Some(address(TRACE_TARGET)),
            value: Some(U256::ZERO),
            ..InternalTransaction::default()
        }
    }

    fn take_fault(counter: Option<&mut usize>) -> bool {
        match counter {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

impl ChainRpc for StubChain {
    fn fetch_blocks(&self, range: BlockRange) -> BoxFuture<'_, Result<FetchedBlocks>> {
        Box::pin(async move {
            self.block_calls.lock().unwrap().push(range);
            {
                let mut faults = self.faults.lock().unwrap();
                for number in range.numbers() {
                    if Self::take_fault(faults.blocks.get_mut(&number)) {
                        return Err(anyhow!("injected failure for block {number}"));
                    }
                }
            }

            let mut fetched = FetchedBlocks::default();
            for number in range.numbers() {
                let block = self
                    .blocks
                    .get(&number)
                    .cloned()
                    .ok_or(RpcError::BlockNotFound { number })?;
                fetched.blocks.push(block);
                fetched.transactions.push(Self::transaction(number));
                fetched.logs.push(Self::log(number));
                if let Some(traces) = self.inline_internal.lock().unwrap().get(&number) {
                    fetched.internal_transactions.extend(traces.iter().cloned());
                }
            }
            Ok(fetched)
        })
    }

    fn fetch_internal_transactions<'a>(
        &'a self,
        transactions: &'a [TransactionRef],
    ) -> BoxFuture<'a, Result<FetchedInternalTransactions>> {
        Box::pin(async move {
            let mut fetched = FetchedInternalTransactions::default();
            let mut faults = self.faults.lock().unwrap();
            for reference in transactions {
                self.trace_calls.lock().unwrap().push(reference.hash);
                if Self::take_fault(faults.traces.get_mut(&reference.hash)) {
                    fetched.failed.push(*reference);
                } else {
                    fetched.internal_transactions.push(Self::trace(reference));
                }
            }
            Ok(fetched)
        })
    }

    fn fetch_balances<'a>(
        &'a self,
        requests: &'a [BalanceRequest],
    ) -> BoxFuture<'a, Result<FetchedBalances>> {
        Box::pin(async move {
            let mut fetched = FetchedBalances::default();
            let faults = self.faults.lock().unwrap();
            for request in requests {
                self.balance_calls.lock().unwrap().push(*request);
                if faults.balances.contains(&request.address) {
                    fetched.failed.push(*request);
                } else {
                    fetched.balances.push(AddressBalance {
                        address: request.address,
                        block_number: request.block_number,
                        value: Self::balance_of(request),
                    });
                }
            }
            Ok(fetched)
        })
    }

    fn latest_block_number(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move { Ok(self.head.load(Ordering::SeqCst)) })
    }

    fn fetch_pending_transactions(&self) -> BoxFuture<'_, Result<Vec<Transaction>>> {
        Box::pin(async move { Ok(self.pending.lock().unwrap().clone()) })
    }
}
