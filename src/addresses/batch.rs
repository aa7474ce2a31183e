use super::error::ExtractError;
use super::rules::EntityKind;
use crate::model::{Block, InternalTransaction, Log, Transaction};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Entities fetched together, grouped by kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityBatch {
    pub blocks: Vec<Block>,
    pub transactions: Vec<Transaction>,
    pub internal_transactions: Vec<InternalTransaction>,
    pub logs: Vec<Log>,
}

impl EntityBatch {
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
            && self.transactions.is_empty()
            && self.internal_transactions.is_empty()
            && self.logs.is_empty()
    }

    /// Reads a batch from a JSON object keyed by entity kind name, e.g.
    /// `{"blocks": [...], "logs": [...]}`.
    pub fn from_json(value: &Value) -> Result<Self, ExtractError> {
        let object = value
            .as_object()
            .ok_or_else(|| ExtractError::MalformedBatch {
                reason: format!("expected an object keyed by entity kind, got {value}"),
            })?;

        let mut batch = EntityBatch::default();
        for (name, records) in object {
            let kind: EntityKind = name.parse()?;
            match kind {
                EntityKind::Blocks => batch.blocks = decode_records(kind, records)?,
                EntityKind::Transactions => batch.transactions = decode_records(kind, records)?,
                EntityKind::InternalTransactions => {
                    batch.internal_transactions = decode_records(kind, records)?
                }
                EntityKind::Logs => batch.logs = decode_records(kind, records)?,
            }
        }
        Ok(batch)
    }
}

fn decode_records<T: DeserializeOwned>(
    kind: EntityKind,
    records: &Value,
) -> Result<Vec<T>, ExtractError> {
    serde_json::from_value(records.clone()).map_err(|err| ExtractError::InvalidRecord {
        kind,
        reason: err.to_string(),
    })
}
