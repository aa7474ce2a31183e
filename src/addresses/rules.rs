//! Static extraction rule tables, one per entity kind.

use super::error::ExtractError;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Blocks,
    Transactions,
    InternalTransactions,
    Logs,
}

impl EntityKind {
    /// Evaluation order used when extracting from a whole batch.
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Blocks,
        EntityKind::Transactions,
        EntityKind::InternalTransactions,
        EntityKind::Logs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Blocks => "blocks",
            EntityKind::Transactions => "transactions",
            EntityKind::InternalTransactions => "internal_transactions",
            EntityKind::Logs => "logs",
        }
    }

    pub fn rules(&self) -> &'static [ExtractionRule] {
        match self {
            EntityKind::Blocks => BLOCK_RULES,
            EntityKind::Transactions => TRANSACTION_RULES,
            EntityKind::InternalTransactions => INTERNAL_TRANSACTION_RULES,
            EntityKind::Logs => LOG_RULES,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = ExtractError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| ExtractError::UnknownEntityKind {
                kind: value.to_owned(),
            })
    }
}

/// Entity field read by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceField {
    Number,
    BlockNumber,
    MinerHash,
    FromAddressHash,
    ToAddressHash,
    CreatedContractAddressHash,
    CreatedContractCode,
    AddressHash,
}

impl SourceField {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceField::Number => "number",
            SourceField::BlockNumber => "block_number",
            SourceField::MinerHash => "miner_hash",
            SourceField::FromAddressHash => "from_address_hash",
            SourceField::ToAddressHash => "to_address_hash",
            SourceField::CreatedContractAddressHash => "created_contract_address_hash",
            SourceField::CreatedContractCode => "created_contract_code",
            SourceField::AddressHash => "address_hash",
        }
    }
}

/// Address field written by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetField {
    Hash,
    FetchedBalanceBlockNumber,
    ContractCode,
}

impl TargetField {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetField::Hash => "hash",
            TargetField::FetchedBalanceBlockNumber => "fetched_balance_block_number",
            TargetField::ContractCode => "contract_code",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldMapping {
    pub source: SourceField,
    pub target: TargetField,
}

/// Ordered field mappings that together produce one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionRule(&'static [FieldMapping]);

impl ExtractionRule {
    pub fn mappings(&self) -> &'static [FieldMapping] {
        self.0
    }
}

impl fmt::Display for ExtractionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (idx, mapping) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(
                f,
                "{} -> {}",
                mapping.source.as_str(),
                mapping.target.as_str()
            )?;
        }
        f.write_str("]")
    }
}

const fn map(source: SourceField, target: TargetField) -> FieldMapping {
    FieldMapping { source, target }
}

use SourceField as S;
use TargetField as T;

const BLOCK_RULES: &[ExtractionRule] = &[ExtractionRule(&[
    map(S::Number, T::FetchedBalanceBlockNumber),
    map(S::MinerHash, T::Hash),
])];

const TRANSACTION_RULES: &[ExtractionRule] = &[
    ExtractionRule(&[
        map(S::BlockNumber, T::FetchedBalanceBlockNumber),
        map(S::FromAddressHash, T::Hash),
    ]),
    ExtractionRule(&[
        map(S::BlockNumber, T::FetchedBalanceBlockNumber),
        map(S::ToAddressHash, T::Hash),
    ]),
];

const INTERNAL_TRANSACTION_RULES: &[ExtractionRule] = &[
    ExtractionRule(&[
        map(S::BlockNumber, T::FetchedBalanceBlockNumber),
        map(S::FromAddressHash, T::Hash),
    ]),
    ExtractionRule(&[
        map(S::BlockNumber, T::FetchedBalanceBlockNumber),
        map(S::ToAddressHash, T::Hash),
    ]),
    ExtractionRule(&[
        map(S::BlockNumber, T::FetchedBalanceBlockNumber),
        map(S::CreatedContractAddressHash, T::Hash),
        map(S::CreatedContractCode, T::ContractCode),
    ]),
];

const LOG_RULES: &[ExtractionRule] = &[ExtractionRule(&[
    map(S::BlockNumber, T::FetchedBalanceBlockNumber),
    map(S::AddressHash, T::Hash),
])];
