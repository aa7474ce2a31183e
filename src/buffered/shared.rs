use super::types::{BufferedTaskStatsSnapshot, DebugCount};
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone)]
pub(super) struct Item<E> {
    pub(super) entry: E,
    pub(super) failures: usize,
}

impl<E> Item<E> {
    pub(super) fn fresh(entry: E) -> Self {
        Self { entry, failures: 0 }
    }
}

/// Everything the dispatcher and the enqueuers share. Guarded by a single lock.
pub(super) struct BufferState<K, E> {
    order: VecDeque<K>,
    entries: HashMap<K, Item<E>>,
    in_flight: HashSet<K>,
    pub(super) tasks: usize,
    pub(super) accepting: bool,
}

impl<K, E> BufferState<K, E>
where
    K: Clone + Eq + Hash,
{
    pub(super) fn new() -> Self {
        Self {
            order: VecDeque::new(),
            entries: HashMap::new(),
            in_flight: HashSet::new(),
            tasks: 0,
            accepting: true,
        }
    }

    /// Buffers `item`, merging it into an already buffered entry with the
    /// same key.
    pub(super) fn insert<M>(&mut self, key: K, item: Item<E>, merge: M)
    where
        M: FnOnce(E, E) -> E,
    {
        match self.entries.remove(&key) {
            Some(existing) => {
                let failures = existing.failures.max(item.failures);
                let entry = merge(existing.entry, item.entry);
                self.entries.insert(key, Item { entry, failures });
            }
            None => {
                self.order.push_back(key.clone());
                self.entries.insert(key, item);
            }
        }
    }

    /// Entries whose key is not currently in flight.
    pub(super) fn eligible(&self) -> usize {
        self.order
            .iter()
            .filter(|key| !self.in_flight.contains(*key))
            .count()
    }

    /// Removes up to `max` eligible entries in buffer order and marks their
    /// keys in flight. Held-back entries keep their position.
    pub(super) fn take_batch(&mut self, max: usize) -> Vec<(K, Item<E>)> {
        let mut batch = Vec::with_capacity(max.min(self.order.len()));
        let mut held = Vec::new();

        while batch.len() < max {
            let Some(key) = self.order.pop_front() else {
                break;
            };
            if self.in_flight.contains(&key) {
                held.push(key);
                continue;
            }
            if let Some(item) = self.entries.remove(&key) {
                self.in_flight.insert(key.clone());
                batch.push((key, item));
            }
        }

        for key in held.into_iter().rev() {
            self.order.push_front(key);
        }
        batch
    }

    pub(super) fn release<'a, I>(&mut self, keys: I)
    where
        I: IntoIterator<Item = &'a K>,
        K: 'a,
    {
        for key in keys {
            self.in_flight.remove(key);
        }
    }

    pub(super) fn clear_in_flight(&mut self) {
        self.in_flight.clear();
        self.tasks = 0;
    }

    pub(super) fn debug_count(&self) -> DebugCount {
        DebugCount {
            buffered: self.entries.len(),
            tasks: self.tasks,
        }
    }
}

/// Lifetime counters for one engine instance.
#[derive(Debug, Default)]
pub(super) struct BufferedTaskStats {
    batches: AtomicU64,
    completed: AtomicU64,
    retried: AtomicU64,
    discarded: AtomicU64,
    panics: AtomicU64,
}

impl BufferedTaskStats {
    pub(super) fn record_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn record_completed(&self, count: usize) {
        self.completed.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(super) fn record_retried(&self, count: usize) {
        self.retried.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(super) fn record_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn record_panic(&self) {
        self.panics.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn snapshot(&self) -> BufferedTaskStatsSnapshot {
        BufferedTaskStatsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
        }
    }
}
