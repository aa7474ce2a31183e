//! Range sequencer that decides which block ranges to fetch next.
//!
//! A catch-up sequence first serves the known gaps, then walks from the
//! starting block down to genesis in `batch_size` windows. A follow-head
//! sequence walks upwards and only yields blocks up to the last head passed to
//! [`RangeSequence::extend_to`]. Failed ranges go back to the front of the
//! queue via [`RangeSequence::requeue`].

use crate::model::BlockRange;
use std::collections::VecDeque;
use tokio::sync::{Mutex, Notify};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkDirection {
    /// Newest to oldest, ends at block 0.
    Descending,
    /// Oldest to newest, bounded by the known chain head. Never ends on its own.
    Ascending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceConfig {
    /// Ranges served before the walk starts.
    pub gaps: Vec<BlockRange>,
    /// First block of the walk. `None` serves only the gaps.
    pub start: Option<u64>,
    pub batch_size: u64,
    pub direction: WalkDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceSnapshot {
    pub queued: usize,
    pub outstanding: usize,
    pub next_block: Option<u64>,
    pub capped: bool,
    pub closed: bool,
}

#[derive(Debug)]
enum Walk {
    Descending { next_high: Option<u64> },
    Ascending { next_low: Option<u64>, head: Option<u64> },
}

impl Walk {
    fn next_range(&mut self, batch_size: u64) -> Option<BlockRange> {
        match self {
            Walk::Descending { next_high } => {
                let high = (*next_high)?;
                let low = high.saturating_sub(batch_size - 1);
                *next_high = low.checked_sub(1);
                Some(BlockRange::new(low, high))
            }
            Walk::Ascending { next_low, head } => {
                let low = (*next_low)?;
                let head = (*head)?;
                if low > head {
                    return None;
                }
                let high = low.saturating_add(batch_size - 1).min(head);
                *next_low = high.checked_add(1);
                Some(BlockRange::new(low, high))
            }
        }
    }

    fn is_exhausted(&self) -> bool {
        match self {
            Walk::Descending { next_high } => next_high.is_none(),
            Walk::Ascending { .. } => false,
        }
    }

    fn has_available(&self) -> bool {
        match self {
            Walk::Descending { next_high } => next_high.is_some(),
            Walk::Ascending { next_low, head } => match (next_low, head) {
                (Some(low), Some(head)) => low <= head,
                _ => false,
            },
        }
    }

    fn next_block(&self) -> Option<u64> {
        match self {
            Walk::Descending { next_high } => *next_high,
            Walk::Ascending { next_low, .. } => *next_low,
        }
    }
}

struct SequenceState {
    queue: VecDeque<BlockRange>,
    walk: Walk,
    outstanding: usize,
    capped: bool,
    closed: bool,
}

impl SequenceState {
    fn is_finished(&self) -> bool {
        self.queue.is_empty()
            && self.outstanding == 0
            && (self.capped || self.walk.is_exhausted())
    }
}

pub struct RangeSequence {
    state: Mutex<SequenceState>,
    notify: Notify,
    batch_size: u64,
    direction: WalkDirection,
}

impl RangeSequence {
    pub fn new(config: SequenceConfig) -> Self {
        let batch_size = config.batch_size.max(1);
        let mut gaps = config.gaps;
        let walk = match config.direction {
            WalkDirection::Descending => {
                gaps.sort_by(|a, b| b.last().cmp(&a.last()));
                Walk::Descending {
                    next_high: config.start,
                }
            }
            WalkDirection::Ascending => {
                gaps.sort_by_key(|range| range.first());
                Walk::Ascending {
                    next_low: config.start,
                    head: None,
                }
            }
        };

        let queue = gaps
            .iter()
            .flat_map(|gap| match config.direction {
                WalkDirection::Descending => gap.chunks_descending(batch_size),
                WalkDirection::Ascending => gap.chunks_ascending(batch_size),
            })
            .collect();

        Self {
            state: Mutex::new(SequenceState {
                queue,
                walk,
                outstanding: 0,
                capped: false,
                closed: false,
            }),
            notify: Notify::new(),
            batch_size,
            direction: config.direction,
        }
    }

    /// Gaps first, then newest-to-oldest from `start` down to block 0.
    pub fn catchup(gaps: Vec<BlockRange>, start: Option<u64>, batch_size: u64) -> Self {
        Self::new(SequenceConfig {
            gaps,
            start,
            batch_size,
            direction: WalkDirection::Descending,
        })
    }

    /// Upwards from `from`, bounded by the head set through `extend_to`.
    pub fn follow_head(from: u64, batch_size: u64) -> Self {
        Self::new(SequenceConfig {
            gaps: Vec::new(),
            start: Some(from),
            batch_size,
            direction: WalkDirection::Ascending,
        })
    }

    pub fn batch_size(&self) -> u64 {
        self.batch_size
    }

    pub fn direction(&self) -> WalkDirection {
        self.direction
    }

    /// Waits for the next range. Returns `None` once the sequence is closed.
    ///
    /// Every range returned here must be settled with either [`Self::complete`]
    /// or [`Self::requeue`].
    pub async fn pop_next(&self) -> Option<BlockRange> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                if state.closed {
                    return None;
                }

                if let Some(range) = state.queue.pop_front() {
                    state.outstanding += 1;
                    return Some(range);
                }

                if !state.capped {
                    if let Some(range) = state.walk.next_range(self.batch_size) {
                        state.outstanding += 1;
                        return Some(range);
                    }
                }

                if state.is_finished() {
                    state.closed = true;
                    drop(state);
                    self.notify.notify_waiters();
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Puts a failed range back in front of every range not yet yielded.
    pub async fn requeue(&self, range: BlockRange) {
        let mut state = self.state.lock().await;
        state.outstanding = state.outstanding.saturating_sub(1);
        if !state.closed {
            state.queue.push_front(range);
        }
        drop(state);
        self.notify.notify_waiters();
    }

    pub async fn complete(&self, _range: BlockRange) {
        let mut state = self.state.lock().await;
        state.outstanding = state.outstanding.saturating_sub(1);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Raises the known chain head of a follow-head sequence.
    pub async fn extend_to(&self, head: u64) {
        let mut state = self.state.lock().await;
        if let Walk::Ascending {
            head: current_head, ..
        } = &mut state.walk
        {
            if current_head.map_or(true, |current| head > current) {
                *current_head = Some(head);
            }
        }
        drop(state);
        self.notify.notify_waiters();
    }

    /// Stops generating new ranges. Queued and outstanding ranges still drain,
    /// then the sequence closes.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        state.capped = true;
        drop(state);
        self.notify.notify_waiters();
    }

    /// Closes immediately, dropping every queued range.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.queue.clear();
        drop(state);
        self.notify.notify_waiters();
    }

    /// True when nothing is queued, nothing is outstanding, and the walk has
    /// no range available right now.
    pub async fn is_idle(&self) -> bool {
        let state = self.state.lock().await;
        state.closed
            || (state.queue.is_empty()
                && state.outstanding == 0
                && (state.capped || !state.walk.has_available()))
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    pub async fn snapshot(&self) -> SequenceSnapshot {
        let state = self.state.lock().await;
        SequenceSnapshot {
            queued: state.queue.len(),
            outstanding: state.outstanding,
            next_block: state.walk.next_block(),
            capped: state.capped,
            closed: state.closed,
        }
    }
}
