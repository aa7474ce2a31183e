use alloy_primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};

/// A block header as indexed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Block {
    pub number: Option<u64>,
    pub hash: Option<B256>,
    pub parent_hash: Option<B256>,
    pub miner_hash: Option<Address>,
    pub timestamp: Option<u64>,
    pub gas_used: Option<u64>,
    pub gas_limit: Option<u64>,
}

/// A transaction, optionally completed with its receipt fields.
///
/// Pending transactions have no `block_number`, `block_hash`, or `index`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Transaction {
    pub hash: Option<B256>,
    pub block_number: Option<u64>,
    pub block_hash: Option<B256>,
    pub index: Option<u64>,
    pub from_address_hash: Option<Address>,
    pub to_address_hash: Option<Address>,
    pub value: Option<U256>,
    pub input: Option<Bytes>,
    pub gas: Option<u64>,
    pub gas_price: Option<U256>,
    pub nonce: Option<u64>,
    pub status: Option<u8>,
    pub gas_used: Option<u64>,
    pub cumulative_gas_used: Option<u64>,
    pub created_contract_address_hash: Option<Address>,
}

impl Transaction {
    /// Reference used to schedule trace fetches, available once the
    /// transaction is mined.
    pub fn reference(&self) -> Option<TransactionRef> {
        Some(TransactionRef {
            hash: self.hash?,
            block_number: self.block_number?,
            index: self.index.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InternalTransactionType {
    Call,
    Create,
    Create2,
    Selfdestruct,
    Reward,
}

/// A sub-call recorded while executing a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InternalTransaction {
    pub transaction_hash: Option<B256>,
    pub index: Option<u64>,
    pub block_number: Option<u64>,
    pub transaction_index: Option<u64>,
    pub trace_address: Vec<u64>,
    #[serde(rename = "type")]
    pub kind: Option<InternalTransactionType>,
    pub call_type: Option<String>,
    pub from_address_hash: Option<Address>,
    pub to_address_hash: Option<Address>,
    pub created_contract_address_hash: Option<Address>,
    pub created_contract_code: Option<Bytes>,
    pub init: Option<Bytes>,
    pub value: Option<U256>,
    pub gas: Option<u64>,
    pub gas_used: Option<u64>,
    pub input: Option<Bytes>,
    pub output: Option<Bytes>,
    pub error: Option<String>,
}

/// An event log emitted by a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Log {
    pub address_hash: Option<Address>,
    pub block_number: Option<u64>,
    pub block_hash: Option<B256>,
    pub transaction_hash: Option<B256>,
    pub index: Option<u64>,
    pub data: Option<Bytes>,
    pub topics: Vec<B256>,
}

/// Upsert parameters for one address, produced by the merge engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressParams {
    pub hash: Address,
    pub fetched_balance_block_number: Option<u64>,
    pub contract_code: Option<Bytes>,
}

/// A mined transaction whose traces still need to be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionRef {
    pub hash: B256,
    pub block_number: u64,
    pub index: u64,
}

/// Balance of `address` to be read as of `block_number`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BalanceRequest {
    pub address: Address,
    pub block_number: u64,
}

impl BalanceRequest {
    pub fn from_params(params: &AddressParams) -> Option<Self> {
        Some(Self {
            address: params.hash,
            block_number: params.fetched_balance_block_number?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressBalance {
    pub address: Address,
    pub block_number: u64,
    pub value: U256,
}
