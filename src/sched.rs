use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    time::{Duration, Instant},
};

use rand::Rng;

use crate::connection::ConnId;

/// Heap key ordered by `(due_at, id, gen)`; under `Reverse` the earliest due
/// time pops first and equal due times dispatch the lower id first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct HeapKey {
    due_at: Instant,
    id: ConnId,
    gen: u64,
}

struct EntryState {
    interval: Duration,
    gen: u64,
}

/// Decides which connections are due a drip "now", without blocking on any
/// of them. Register/unregister are O(log n); a tick is O(k log n) for k due
/// entries. Unregistered or superseded heap entries are invalidated lazily
/// via the generation counter and skipped when popped.
pub struct DripScheduler {
    heap: BinaryHeap<Reverse<HeapKey>>,
    entries: HashMap<ConnId, EntryState>,
    jitter: Duration,
    next_gen: u64,
}

impl DripScheduler {
    pub fn new(jitter: Duration) -> Self {
        Self {
            heap: BinaryHeap::new(),
            entries: HashMap::new(),
            jitter,
            next_gen: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn register(&mut self, id: ConnId, interval: Duration, now: Instant) {
        self.next_gen += 1;
        let gen = self.next_gen;
        self.entries.insert(id, EntryState { interval, gen });
        let due_at = now + self.jittered(interval);
        self.heap.push(Reverse(HeapKey { due_at, id, gen }));
    }

    /// No-op if the id is absent. The heap entry, if any, goes stale and is
    /// dropped on a later pop.
    pub fn unregister(&mut self, id: ConnId) {
        self.entries.remove(&id);
    }

    /// Re-arms a dispatched entry for `now + interval ± jitter`. No-op for
    /// ids no longer registered.
    pub fn reschedule(&mut self, id: ConnId, now: Instant) {
        let Some(interval) = self.entries.get(&id).map(|state| state.interval) else {
            return;
        };
        self.next_gen += 1;
        let gen = self.next_gen;
        if let Some(state) = self.entries.get_mut(&id) {
            state.gen = gen;
        }
        let due_at = now + self.jittered(interval);
        self.heap.push(Reverse(HeapKey { due_at, id, gen }));
    }

    /// All entries with `due_at <= now`, earliest first, ties by lower id.
    /// Dispatched entries stay registered but are not re-armed until the
    /// caller reports back via `reschedule` or `unregister`; terminality is
    /// only known after the drip resolves.
    pub fn tick(&mut self, now: Instant) -> Vec<ConnId> {
        let mut due = Vec::new();
        while let Some(Reverse(head)) = self.heap.peek() {
            if head.due_at > now {
                break;
            }
            let Some(Reverse(head)) = self.heap.pop() else {
                break;
            };
            match self.entries.get(&head.id) {
                Some(state) if state.gen == head.gen => due.push(head.id),
                _ => {}
            }
        }
        due
    }

    fn jittered(&self, interval: Duration) -> Duration {
        if self.jitter.is_zero() {
            return interval;
        }
        let jitter = self.jitter.as_millis() as i64;
        let offset = rand::thread_rng().gen_range(-jitter..=jitter);
        let millis = interval.as_millis() as i64 + offset;
        Duration::from_millis(millis.max(1) as u64)
    }
}
