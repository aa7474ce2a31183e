use super::error::ExtractError;
use super::rules::{EntityKind, ExtractionRule, SourceField, TargetField};
use crate::model::{AddressParams, Block, InternalTransaction, Log, Transaction};
use alloy_primitives::{Address, Bytes};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractOptions {
    /// Accept records whose block number is unknown, as for pending
    /// transactions. Such addresses carry no `fetched_balance_block_number`.
    pub pending: bool,
}

impl ExtractOptions {
    pub fn pending() -> Self {
        Self { pending: true }
    }
}

/// Value of a single entity field as seen by the rule evaluator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Address(Address),
    Number(u64),
    Code(Bytes),
}

/// An entity that extraction rules can read.
pub trait AddressSource: Serialize {
    const KIND: EntityKind;

    /// Returns the field if it is present and non-null.
    fn field(&self, field: SourceField) -> Option<FieldValue>;
}

impl AddressSource for Block {
    const KIND: EntityKind = EntityKind::Blocks;

    fn field(&self, field: SourceField) -> Option<FieldValue> {
        match field {
            SourceField::Number => self.number.map(FieldValue::Number),
            SourceField::MinerHash => self.miner_hash.map(FieldValue::Address),
            _ => None,
        }
    }
}

impl AddressSource for Transaction {
    const KIND: EntityKind = EntityKind::Transactions;

    fn field(&self, field: SourceField) -> Option<FieldValue> {
        match field {
            SourceField::BlockNumber => self.block_number.map(FieldValue::Number),
            SourceField::FromAddressHash => self.from_address_hash.map(FieldValue::Address),
            SourceField::ToAddressHash => self.to_address_hash.map(FieldValue::Address),
            _ => None,
        }
    }
}

impl AddressSource for InternalTransaction {
    const KIND: EntityKind = EntityKind::InternalTransactions;

    fn field(&self, field: SourceField) -> Option<FieldValue> {
        match field {
            SourceField::BlockNumber => self.block_number.map(FieldValue::Number),
            SourceField::FromAddressHash => self.from_address_hash.map(FieldValue::Address),
            SourceField::ToAddressHash => self.to_address_hash.map(FieldValue::Address),
            SourceField::CreatedContractAddressHash => {
                self.created_contract_address_hash.map(FieldValue::Address)
            }
            SourceField::CreatedContractCode => {
                self.created_contract_code.clone().map(FieldValue::Code)
            }
            _ => None,
        }
    }
}

impl AddressSource for Log {
    const KIND: EntityKind = EntityKind::Logs;

    fn field(&self, field: SourceField) -> Option<FieldValue> {
        match field {
            SourceField::BlockNumber => self.block_number.map(FieldValue::Number),
            SourceField::AddressHash => self.address_hash.map(FieldValue::Address),
            _ => None,
        }
    }
}

/// Accumulates address mentions, keeping one entry per hash in first-seen
/// order.
#[derive(Debug, Default)]
pub struct AddressMerger {
    entries: Vec<AddressParams>,
    positions: HashMap<Address, usize>,
}

impl AddressMerger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Runs every rule of `T`'s kind over each record.
    pub fn extend_from<T: AddressSource>(
        &mut self,
        records: &[T],
        options: ExtractOptions,
    ) -> Result<(), ExtractError> {
        let rules = T::KIND.rules();
        for record in records {
            let mut matched = false;
            for rule in rules {
                if let Some(params) = apply_rule(T::KIND, rule, record, options)? {
                    matched = true;
                    self.push(params)?;
                }
            }

            if !matched {
                return Err(ExtractError::NoMatchingRule {
                    kind: T::KIND,
                    rules,
                    record: render_record(record),
                });
            }
        }
        Ok(())
    }

    pub fn push(&mut self, params: AddressParams) -> Result<(), ExtractError> {
        match self.positions.get(&params.hash) {
            Some(&position) => merge_into(&mut self.entries[position], params),
            None => {
                self.positions.insert(params.hash, self.entries.len());
                self.entries.push(params);
                Ok(())
            }
        }
    }

    pub fn finish(self) -> Vec<AddressParams> {
        self.entries
    }
}

fn apply_rule<T: AddressSource>(
    kind: EntityKind,
    rule: &ExtractionRule,
    record: &T,
    options: ExtractOptions,
) -> Result<Option<AddressParams>, ExtractError> {
    let mut hash = None;
    let mut block_number = None;
    let mut contract_code = None;

    for mapping in rule.mappings() {
        let Some(value) = record.field(mapping.source) else {
            if options.pending && mapping.target == TargetField::FetchedBalanceBlockNumber {
                continue;
            }
            return Ok(None);
        };

        match (mapping.target, value) {
            (TargetField::Hash, FieldValue::Address(address)) => hash = Some(address),
            (TargetField::FetchedBalanceBlockNumber, FieldValue::Number(number)) => {
                block_number = Some(number)
            }
            (TargetField::ContractCode, FieldValue::Code(code)) => contract_code = Some(code),
            (target, value) => {
                return Err(ExtractError::InvalidRecord {
                    kind,
                    reason: format!(
                        "field {} cannot populate {}: {value:?}",
                        mapping.source.as_str(),
                        target.as_str()
                    ),
                });
            }
        }
    }

    Ok(hash.map(|hash| AddressParams {
        hash,
        fetched_balance_block_number: block_number,
        contract_code,
    }))
}

fn merge_into(existing: &mut AddressParams, incoming: AddressParams) -> Result<(), ExtractError> {
    let contract_code = match (existing.contract_code.take(), incoming.contract_code) {
        (Some(current), Some(other)) if current != other => {
            let conflict = ExtractError::ContractCodeConflict {
                hash: existing.hash,
                existing: current.clone(),
                incoming: other,
            };
            existing.contract_code = Some(current);
            return Err(conflict);
        }
        (current, other) => current.or(other),
    };

    existing.contract_code = contract_code;
    // A known block number always wins over an unknown one.
    existing.fetched_balance_block_number = existing
        .fetched_balance_block_number
        .max(incoming.fetched_balance_block_number);
    Ok(())
}

fn render_record<T: Serialize>(record: &T) -> String {
    serde_json::to_string(record).unwrap_or_else(|err| format!("<unserializable record: {err}>"))
}
