use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;

/// Closed interval of block numbers, `first <= last`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRange {
    first: u64,
    last: u64,
}

impl BlockRange {
    /// Builds the closed range spanning both endpoints, in either order.
    pub fn new(a: u64, b: u64) -> Self {
        Self {
            first: a.min(b),
            last: a.max(b),
        }
    }

    pub fn single(number: u64) -> Self {
        Self::new(number, number)
    }

    pub fn first(&self) -> u64 {
        self.first
    }

    pub fn last(&self) -> u64 {
        self.last
    }

    pub fn len(&self) -> u64 {
        (self.last - self.first).saturating_add(1)
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, number: u64) -> bool {
        (self.first..=self.last).contains(&number)
    }

    pub fn numbers(&self) -> RangeInclusive<u64> {
        self.first..=self.last
    }

    /// Splits into chunks of at most `size` blocks, highest chunk first.
    pub fn chunks_descending(&self, size: u64) -> Vec<BlockRange> {
        let size = size.max(1);
        let mut chunks = Vec::with_capacity(self.len().div_ceil(size) as usize);
        let mut upper = self.last;
        loop {
            let lower = upper.saturating_sub(size - 1).max(self.first);
            chunks.push(BlockRange::new(lower, upper));
            if lower == self.first {
                break;
            }
            upper = lower - 1;
        }
        chunks
    }

    /// Splits into chunks of at most `size` blocks, lowest chunk first.
    pub fn chunks_ascending(&self, size: u64) -> Vec<BlockRange> {
        let size = size.max(1);
        let mut chunks = Vec::with_capacity(self.len().div_ceil(size) as usize);
        let mut lower = self.first;
        loop {
            let upper = lower.saturating_add(size - 1).min(self.last);
            chunks.push(BlockRange::new(lower, upper));
            if upper == self.last {
                break;
            }
            lower = upper + 1;
        }
        chunks
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.first, self.last)
    }
}
