//! Ethereum JSON-RPC response shapes and their conversion into the indexer's
//! entity types. Quantities arrive as `0x`-prefixed hex strings.

use crate::model::{Block, InternalTransaction, InternalTransactionType, Log, Transaction, TransactionRef};
use alloy_primitives::{Address, Bytes, B256, U256};
use anyhow::{bail, Context, Result};
use serde::Deserialize;

pub(crate) fn quantity_param(value: u64) -> String {
    format!("{value:#x}")
}

pub(crate) fn parse_quantity(raw: &str) -> Result<u64> {
    let digits = strip_hex_prefix(raw)?;
    if digits.is_empty() {
        bail!("empty hex quantity {raw:?}");
    }
    u64::from_str_radix(digits, 16).with_context(|| format!("invalid hex quantity {raw:?}"))
}

pub(crate) fn parse_u256(raw: &str) -> Result<U256> {
    let digits = strip_hex_prefix(raw)?;
    if digits.is_empty() {
        return Ok(U256::ZERO);
    }
    U256::from_str_radix(digits, 16).with_context(|| format!("invalid hex value {raw:?}"))
}

fn strip_hex_prefix(raw: &str) -> Result<&str> {
    raw.strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .with_context(|| format!("hex value {raw:?} is missing the 0x prefix"))
}

fn opt_quantity(raw: Option<&str>, field: &str) -> Result<Option<u64>> {
    raw.map(parse_quantity)
        .transpose()
        .with_context(|| format!("failed to decode {field}"))
}

fn opt_u256(raw: Option<&str>, field: &str) -> Result<Option<U256>> {
    raw.map(parse_u256)
        .transpose()
        .with_context(|| format!("failed to decode {field}"))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RpcBlock {
    pub(crate) number: Option<String>,
    pub(crate) hash: Option<B256>,
    pub(crate) parent_hash: Option<B256>,
    pub(crate) miner: Option<Address>,
    pub(crate) timestamp: Option<String>,
    pub(crate) gas_used: Option<String>,
    pub(crate) gas_limit: Option<String>,
    #[serde(default)]
    pub(crate) transactions: Vec<RpcTransaction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RpcTransaction {
    pub(crate) hash: B256,
    pub(crate) block_number: Option<String>,
    pub(crate) block_hash: Option<B256>,
    pub(crate) transaction_index: Option<String>,
    pub(crate) from: Option<Address>,
    pub(crate) to: Option<Address>,
    pub(crate) value: Option<String>,
    pub(crate) input: Option<Bytes>,
    pub(crate) gas: Option<String>,
    pub(crate) gas_price: Option<String>,
    pub(crate) nonce: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RpcReceipt {
    pub(crate) transaction_hash: B256,
    pub(crate) status: Option<String>,
    pub(crate) gas_used: Option<String>,
    pub(crate) cumulative_gas_used: Option<String>,
    pub(crate) contract_address: Option<Address>,
    #[serde(default)]
    pub(crate) logs: Vec<RpcLog>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RpcLog {
    pub(crate) address: Option<Address>,
    pub(crate) block_number: Option<String>,
    pub(crate) block_hash: Option<B256>,
    pub(crate) transaction_hash: Option<B256>,
    pub(crate) log_index: Option<String>,
    pub(crate) data: Option<Bytes>,
    #[serde(default)]
    pub(crate) topics: Vec<B256>,
}

/// Result of `trace_replayTransaction(hash, ["trace"])`.
#[derive(Debug, Deserialize)]
pub(crate) struct RpcTraceReplay {
    #[serde(default)]
    pub(crate) trace: Vec<RpcTrace>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RpcTrace {
    #[serde(rename = "type")]
    pub(crate) kind: String,
    #[serde(default)]
    pub(crate) action: RpcTraceAction,
    pub(crate) result: Option<RpcTraceResult>,
    pub(crate) error: Option<String>,
    #[serde(default)]
    pub(crate) trace_address: Vec<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RpcTraceAction {
    pub(crate) call_type: Option<String>,
    pub(crate) creation_method: Option<String>,
    pub(crate) from: Option<Address>,
    pub(crate) to: Option<Address>,
    pub(crate) gas: Option<String>,
    pub(crate) input: Option<Bytes>,
    pub(crate) init: Option<Bytes>,
    pub(crate) value: Option<String>,
    pub(crate) address: Option<Address>,
    pub(crate) refund_address: Option<Address>,
    pub(crate) balance: Option<String>,
    pub(crate) author: Option<Address>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RpcTraceResult {
    pub(crate) gas_used: Option<String>,
    pub(crate) output: Option<Bytes>,
    pub(crate) address: Option<Address>,
    pub(crate) code: Option<Bytes>,
}

impl RpcBlock {
    pub(crate) fn into_entities(self) -> Result<(Block, Vec<Transaction>)> {
        let number = opt_quantity(self.number.as_deref(), "block number")?;
        let block = Block {
            number,
            hash: self.hash,
            parent_hash: self.parent_hash,
            miner_hash: self.miner,
            timestamp: opt_quantity(self.timestamp.as_deref(), "block timestamp")?,
            gas_used: opt_quantity(self.gas_used.as_deref(), "block gasUsed")?,
            gas_limit: opt_quantity(self.gas_limit.as_deref(), "block gasLimit")?,
        };

        let transactions = self
            .transactions
            .into_iter()
            .map(|tx| {
                let hash = tx.hash;
                tx.into_entity()
                    .with_context(|| format!("failed to decode transaction {hash}"))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok((block, transactions))
    }
}

impl RpcTransaction {
    fn into_entity(self) -> Result<Transaction> {
        Ok(Transaction {
            hash: Some(self.hash),
            block_number: opt_quantity(self.block_number.as_deref(), "blockNumber")?,
            block_hash: self.block_hash,
            index: opt_quantity(self.transaction_index.as_deref(), "transactionIndex")?,
            from_address_hash: self.from,
            to_address_hash: self.to,
            value: opt_u256(self.value.as_deref(), "value")?,
            input: self.input,
            gas: opt_quantity(self.gas.as_deref(), "gas")?,
            gas_price: opt_u256(self.gas_price.as_deref(), "gasPrice")?,
            nonce: opt_quantity(self.nonce.as_deref(), "nonce")?,
            ..Transaction::default()
        })
    }
}

impl RpcReceipt {
    /// Copies receipt fields onto `transaction` and returns the receipt's logs.
    pub(crate) fn apply_to(self, transaction: &mut Transaction) -> Result<Vec<Log>> {
        let status = opt_quantity(self.status.as_deref(), "receipt status")?;
        transaction.status = status.map(|status| u8::from(status != 0));
        transaction.gas_used = opt_quantity(self.gas_used.as_deref(), "receipt gasUsed")?;
        transaction.cumulative_gas_used =
            opt_quantity(self.cumulative_gas_used.as_deref(), "receipt cumulativeGasUsed")?;
        transaction.created_contract_address_hash = self.contract_address;

        self.logs
            .into_iter()
            .map(|log| -> Result<Log> {
                Ok(Log {
                    address_hash: log.address,
                    block_number: opt_quantity(log.block_number.as_deref(), "log blockNumber")?,
                    block_hash: log.block_hash,
                    transaction_hash: log.transaction_hash.or(Some(self.transaction_hash)),
                    index: opt_quantity(log.log_index.as_deref(), "logIndex")?,
                    data: log.data,
                    topics: log.topics,
                })
            })
            .collect()
    }
}

impl RpcTraceReplay {
    pub(crate) fn into_entities(self, transaction: TransactionRef) -> Result<Vec<InternalTransaction>> {
        self.trace
            .into_iter()
            .enumerate()
            .map(|(index, trace)| trace.into_entity(transaction, index as u64))
            .collect()
    }
}

impl RpcTrace {
    fn into_entity(self, transaction: TransactionRef, index: u64) -> Result<InternalTransaction> {
        let kind = match self.kind.as_str() {
            "call" => InternalTransactionType::Call,
            "create" if self.action.creation_method.as_deref() == Some("create2") => {
                InternalTransactionType::Create2
            }
            "create" => InternalTransactionType::Create,
            "create2" => InternalTransactionType::Create2,
            "suicide" | "selfdestruct" => InternalTransactionType::Selfdestruct,
            "reward" => InternalTransactionType::Reward,
            other => bail!("unsupported trace type {other:?}"),
        };

        let action = self.action;
        let result = self.result;
        let mut internal = InternalTransaction {
            transaction_hash: Some(transaction.hash),
            index: Some(index),
            block_number: Some(transaction.block_number),
            transaction_index: Some(transaction.index),
            trace_address: self.trace_address,
            kind: Some(kind),
            call_type: action.call_type,
            gas: opt_quantity(action.gas.as_deref(), "trace gas")?,
            gas_used: opt_quantity(
                result.as_ref().and_then(|r| r.gas_used.as_deref()),
                "trace gasUsed",
            )?,
            error: self.error,
            ..InternalTransaction::default()
        };

        match kind {
            InternalTransactionType::Call => {
                internal.from_address_hash = action.from;
                internal.to_address_hash = action.to;
                internal.input = action.input;
                internal.value = opt_u256(action.value.as_deref(), "trace value")?;
                internal.output = result.and_then(|r| r.output);
            }
            InternalTransactionType::Create | InternalTransactionType::Create2 => {
                internal.from_address_hash = action.from;
                internal.init = action.init;
                internal.value = opt_u256(action.value.as_deref(), "trace value")?;
                if let Some(result) = result {
                    internal.created_contract_address_hash = result.address;
                    internal.created_contract_code = result.code;
                }
            }
            InternalTransactionType::Selfdestruct => {
                internal.from_address_hash = action.address;
                internal.to_address_hash = action.refund_address;
                internal.value = opt_u256(action.balance.as_deref(), "trace balance")?;
            }
            InternalTransactionType::Reward => {
                internal.to_address_hash = action.author;
                internal.value = opt_u256(action.value.as_deref(), "trace value")?;
            }
        }

        Ok(internal)
    }
}
