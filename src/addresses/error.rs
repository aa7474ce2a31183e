use super::rules::{EntityKind, ExtractionRule};
use alloy_primitives::{Address, Bytes};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    /// A record satisfied none of its kind's extraction rules.
    NoMatchingRule {
        kind: EntityKind,
        rules: &'static [ExtractionRule],
        record: String,
    },
    /// Two mentions of the same address carried different contract code.
    ContractCodeConflict {
        hash: Address,
        existing: Bytes,
        incoming: Bytes,
    },
    /// A batch named an entity kind that has no rule table.
    UnknownEntityKind { kind: String },
    /// A record could not be read as its entity kind.
    InvalidRecord { kind: EntityKind, reason: String },
    /// The batch itself was not a mapping of entity kinds to record lists.
    MalformedBatch { reason: String },
}

impl ExtractError {
    /// Contract violations in the input data, as opposed to caller bugs.
    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            ExtractError::NoMatchingRule { .. } | ExtractError::ContractCodeConflict { .. }
        )
    }
}

impl fmt::Display for ExtractError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractError::NoMatchingRule {
                kind,
                rules,
                record,
            } => {
                write!(f, "no extraction rule matched {kind} record {record}; rules: [")?;
                for (idx, rule) in rules.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{rule}")?;
                }
                f.write_str("]")
            }
            ExtractError::ContractCodeConflict {
                hash,
                existing,
                incoming,
            } => write!(
                f,
                "conflicting contract code for address {hash}: {existing} != {incoming}"
            ),
            ExtractError::UnknownEntityKind { kind } => {
                write!(f, "no extraction rules defined for entity kind {kind:?}")
            }
            ExtractError::InvalidRecord { kind, reason } => {
                write!(f, "invalid {kind} record: {reason}")
            }
            ExtractError::MalformedBatch { reason } => write!(f, "malformed entity batch: {reason}"),
        }
    }
}

impl std::error::Error for ExtractError {}
