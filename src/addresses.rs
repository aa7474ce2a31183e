//! Address merge engine.
//!
//! Every entity kind has a fixed list of extraction rules (`rules`). Each rule
//! maps entity fields onto address fields and yields one address mention when
//! all of its source fields are present. Mentions of the same hash inside a
//! batch are merged into one upsert record:
//! - the highest known `fetched_balance_block_number` wins,
//! - contract code is carried forward from whichever mention has it,
//! - two different contract codes for one hash are a fatal conflict.
//!
//! The engine is pure and keeps no state between calls.

mod batch;
mod error;
mod extract;
mod rules;


pub use batch::EntityBatch;
pub use error::ExtractError;
pub use extract::{AddressMerger, AddressSource, ExtractOptions, FieldValue};
pub use rules::{EntityKind, ExtractionRule, FieldMapping, SourceField, TargetField};

use crate::model::AddressParams;

/// Extracts deduplicated address upsert parameters from every entity in the
/// batch, in first-mention order.
pub fn extract_addresses(
    batch: &EntityBatch,
    options: ExtractOptions,
) -> Result<Vec<AddressParams>, ExtractError> {
    let mut merger = AddressMerger::new();
    for kind in EntityKind::ALL {
        match kind {
            EntityKind::Blocks => merger.extend_from(&batch.blocks, options)?,
            EntityKind::Transactions => merger.extend_from(&batch.transactions, options)?,
            EntityKind::InternalTransactions => {
                merger.extend_from(&batch.internal_transactions, options)?
            }
            EntityKind::Logs => merger.extend_from(&batch.logs, options)?,
        }
    }
    Ok(merger.finish())
}
