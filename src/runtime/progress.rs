use crate::model::BlockRange;
use std::sync::atomic::{AtomicU64, Ordering};

const UNINITIALIZED_LOW: u64 = u64::MAX;
const UNINITIALIZED_HIGH: u64 = 0;

/// Tracks which blocks the orchestrator has persisted during this run.
#[derive(Debug)]
pub struct ProgressTracker {
    lowest: AtomicU64,
    highest: AtomicU64,
    any: AtomicU64,
    completed_ranges: AtomicU64,
    completed_blocks: AtomicU64,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            lowest: AtomicU64::new(UNINITIALIZED_LOW),
            highest: AtomicU64::new(UNINITIALIZED_HIGH),
            any: AtomicU64::new(0),
            completed_ranges: AtomicU64::new(0),
            completed_blocks: AtomicU64::new(0),
        }
    }

    pub fn mark_completed(&self, range: BlockRange) {
        self.lowest.fetch_min(range.first(), Ordering::SeqCst);
        self.highest.fetch_max(range.last(), Ordering::SeqCst);
        self.any.store(1, Ordering::SeqCst);
        self.completed_ranges.fetch_add(1, Ordering::SeqCst);
        self.completed_blocks.fetch_add(range.len(), Ordering::SeqCst);
    }

    /// Lowest and highest block completed so far. The span may contain
    /// blocks that are still in flight.
    pub fn completed_span(&self) -> Option<BlockRange> {
        if self.any.load(Ordering::SeqCst) == 0 {
            return None;
        }
        Some(BlockRange::new(
            self.lowest.load(Ordering::SeqCst),
            self.highest.load(Ordering::SeqCst),
        ))
    }

    pub fn lowest_completed(&self) -> Option<u64> {
        self.completed_span().map(|span| span.first())
    }

    pub fn highest_completed(&self) -> Option<u64> {
        self.completed_span().map(|span| span.last())
    }

    pub fn completed_ranges(&self) -> u64 {
        self.completed_ranges.load(Ordering::SeqCst)
    }

    pub fn completed_blocks(&self) -> u64 {
        self.completed_blocks.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.lowest.store(UNINITIALIZED_LOW, Ordering::SeqCst);
        self.highest.store(UNINITIALIZED_HIGH, Ordering::SeqCst);
        self.any.store(0, Ordering::SeqCst);
        self.completed_ranges.store(0, Ordering::SeqCst);
        self.completed_blocks.store(0, Ordering::SeqCst);
    }
}
