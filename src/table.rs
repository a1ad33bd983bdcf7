use std::cmp::Ordering;
use std::collections::hash_map::RandomState;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fmt;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::iface::TimeoutFn;
use crate::state::State;

/// A connection as kept in the table.
pub(crate) struct Entry<K, P, C> {
    pub state: State<C>,
    pub timer: Option<Armed<K, P, C>>,
}

impl<K, P, C> Entry<K, P, C> {
    pub fn new(state: State<C>) -> Self {
        Entry { state, timer: None }
    }
}

/// A timeout waiting in [`Timers`].
pub(crate) struct Armed<K, P, C> {
    pub seq: u64,
    pub fun: TimeoutFn<K, P, C>,
}

pub(crate) type Shard<K, P, C> = HashMap<K, Entry<K, P, C>>;

/// Connection states sharded by identity hash.
pub(crate) struct StateTable<K, P, C> {
    shards: Box<[Mutex<Shard<K, P, C>>]>,
    hasher: RandomState,
}

impl<K: Hash + Eq, P, C> StateTable<K, P, C> {
    pub fn new(shards: usize, capacity: usize) -> Self {
        StateTable {
            shards: (0..shards.max(1))
                .map(|_| Mutex::new(HashMap::with_capacity(capacity)))
                .collect(),
            hasher: RandomState::new(),
        }
    }

    #[cfg(test)]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_of(&self, id: &K) -> usize {
        let mut h = self.hasher.build_hasher();
        id.hash(&mut h);
        (h.finish() % self.shards.len() as u64) as usize
    }

    /// Lock the shard `id` lives in.
    ///
    /// A handler that panicked leaves the shard poisoned. The map itself is
    /// still consistent, so the poison is ignored.
    pub fn lock(&self, id: &K) -> MutexGuard<'_, Shard<K, P, C>> {
        self.lock_index(self.shard_of(id))
    }

    pub fn lock_index(&self, index: usize) -> MutexGuard<'_, Shard<K, P, C>> {
        self.shards[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        (0..self.shards.len()).map(|i| self.lock_index(i).len()).sum()
    }
}

impl<K, P, C> fmt::Debug for StateTable<K, P, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateTable")
            .field("shards", &self.shards.len())
            .finish()
    }
}

/// Deadline ordered queue of armed timeouts.
///
/// Cancelled timeouts are only forgotten in `live`. Their heap entries are
/// skipped when popped, or dropped when the heap is compacted.
pub(crate) struct Timers<K> {
    heap: BinaryHeap<Deadline<K>>,
    live: HashSet<u64>,
    next_seq: u64,
    max: usize,
}

pub(crate) struct Deadline<K> {
    pub at: Instant,
    pub seq: u64,
    pub id: K,
}

impl<K> Timers<K> {
    pub fn new(max: usize) -> Self {
        Timers {
            heap: BinaryHeap::new(),
            live: HashSet::new(),
            next_seq: 0,
            max,
        }
    }

    /// Returns the sequence number of the new timeout, or `None` when
    /// `max` timeouts are already armed.
    pub fn arm(&mut self, id: K, at: Instant) -> Option<u64> {
        if self.live.len() >= self.max {
            return None;
        }

        if self.heap.len() >= self.max.saturating_mul(2).max(64) {
            let live = &self.live;
            self.heap.retain(|d| live.contains(&d.seq));
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.live.insert(seq);
        self.heap.push(Deadline { at, seq, id });
        Some(seq)
    }

    pub fn cancel(&mut self, seq: u64) {
        self.live.remove(&seq);
    }

    /// Pop every live timeout due at or before `now`, earliest first.
    pub fn expired(&mut self, now: Instant) -> Vec<Deadline<K>> {
        let mut due = Vec::new();
        while self.heap.peek().is_some_and(|d| d.at <= now) {
            let Some(d) = self.heap.pop() else {
                break;
            };
            if self.live.remove(&d.seq) {
                due.push(d);
            }
        }
        due
    }

    pub fn armed(&self) -> usize {
        self.live.len()
    }
}

impl<K> PartialEq for Deadline<K> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl<K> Eq for Deadline<K> {}

impl<K> PartialOrd for Deadline<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Deadline<K> {
    // Reversed, BinaryHeap is a max-heap.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<K> fmt::Debug for Timers<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timers")
            .field("armed", &self.live.len())
            .field("queued", &self.heap.len())
            .finish()
    }
}
