//! Thread-safe, priority-by-due-time work queue (spec §4.F).

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::Notify;

use crate::error::ErrorType;

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub url: String,
    pub surt_key: String,
    pub host: String,
    pub enqueued_at: Instant,
    pub earliest_due_at: Instant,
    pub attempt_count: u32,
    pub last_error_type: Option<ErrorType>,
}

impl QueueEntry {
    pub fn new(url: String, surt_key: String, host: String, due_at: Instant) -> Self {
        let now = Instant::now();
        Self {
            url,
            surt_key,
            host,
            enqueued_at: now,
            earliest_due_at: due_at,
            attempt_count: 0,
            last_error_type: None,
        }
    }
}

/// A tie-break sequence number makes insertion order deterministic when two
/// entries share `earliest_due_at` (spec §4.E "ties broken by insertion
/// order").
struct HeapItem {
    due_at: Instant,
    sequence: u64,
    entry: QueueEntry,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.due_at == other.due_at && self.sequence == other.sequence
    }
}
impl Eq for HeapItem {}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest due-time (and,
        // on ties, the earliest sequence number) sorts to the top.
        other
            .due_at
            .cmp(&self.due_at)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}
impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Inner {
    heap: BinaryHeap<HeapItem>,
    index: HashMap<String, Instant>,
    next_sequence: u64,
}

/// Bounded, thread-safe min-heap keyed by `earliest_due_at`, deduplicated by
/// `surt_key`. Producers block (via [`WorkQueue::wait_below_watermark`])
/// when the queue exceeds `high_watermark` until it drains below
/// `low_watermark` (spec §4.F).
pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify_push: Notify,
    notify_drain: Notify,
    high_watermark: usize,
    low_watermark: usize,
}

impl WorkQueue {
    pub fn new(high_watermark: usize, low_watermark: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                index: HashMap::new(),
                next_sequence: 0,
            }),
            notify_push: Notify::new(),
            notify_drain: Notify::new(),
            high_watermark,
            low_watermark,
        }
    }

    /// Pushes `entry`, deduplicating by `surt_key`: if an entry with the
    /// same key is already queued, the earlier of the two due-times wins
    /// and no second entry is added (spec §4.F, invariant 3 in §8).
    pub fn push(&self, entry: QueueEntry) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing_due) = inner.index.get(&entry.surt_key).copied() {
            if entry.earliest_due_at >= existing_due {
                return;
            }
            // A strictly earlier due-time for an already-queued key: the
            // cheapest correct fix is to push a second heap item and let
            // `index` always reflect the minimum; `pop_due` re-checks the
            // index before returning an entry so the stale duplicate is
            // silently dropped when it surfaces.
        }
        inner.index.insert(entry.surt_key.clone(), entry.earliest_due_at);
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.heap.push(HeapItem {
            due_at: entry.earliest_due_at,
            sequence,
            entry,
        });
        drop(inner);
        self.notify_push.notify_waiters();
    }

    /// Pops the earliest-due entry if its due-time is `<= now`, else `None`.
    pub fn pop_due(&self, now: Instant) -> Option<QueueEntry> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            let is_due = matches!(inner.heap.peek(), Some(top) if top.due_at <= now);
            if !is_due {
                return None;
            }
            let item = inner.heap.pop().expect("peeked Some above");
            // Drop stale duplicates: only the item matching the current
            // minimum due-time for its key is live.
            if inner.index.get(&item.entry.surt_key) != Some(&item.due_at) {
                continue;
            }
            inner.index.remove(&item.entry.surt_key);
            let was_over = inner.index.len() + 1 > self.high_watermark;
            let now_at_or_below = inner.index.len() <= self.low_watermark;
            if was_over && now_at_or_below {
                self.notify_drain.notify_waiters();
            }
            return Some(item.entry);
        }
    }

    /// Awaits until an entry is pushed, a timeout elapses, or the queue is
    /// non-empty (used by a worker's `min_sleep_ms` idle wait).
    pub async fn wait_for_push(&self, timeout: std::time::Duration) {
        let notified = self.notify_push.notified();
        tokio::select! {
            _ = notified => {},
            _ = tokio::time::sleep(timeout) => {},
        }
    }

    /// Blocks the caller (a discovery producer) until the queue size drops
    /// to or below `low_watermark`, if it is currently above
    /// `high_watermark` (spec §4.F backpressure).
    pub async fn wait_below_watermark(&self) {
        loop {
            {
                let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                if inner.index.len() <= self.high_watermark {
                    return;
                }
            }
            self.notify_drain.notified().await;
        }
    }

    /// Live entry count, from the dedup index rather than the raw heap —
    /// the heap can hold stale duplicates left behind by a re-push with an
    /// earlier due-time (see `push`).
    pub fn size(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Removes and returns every entry, in arbitrary order (used to persist
    /// remaining work on shutdown, spec §4.I).
    pub fn drain(&self) -> Vec<QueueEntry> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let items: Vec<QueueEntry> = inner
            .heap
            .drain()
            .filter(|item| inner.index.get(&item.entry.surt_key) == Some(&item.due_at))
            .map(|item| item.entry)
            .collect();
        inner.index.clear();
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(surt: &str, due_offset_ms: u64) -> QueueEntry {
        QueueEntry::new(
            format!("https://{surt}/"),
            surt.to_string(),
            surt.to_string(),
            Instant::now() + Duration::from_millis(due_offset_ms),
        )
    }

    #[test]
    fn pop_due_respects_due_time_order() {
        let q = WorkQueue::new(1000, 500);
        q.push(entry("b,example,com)/", 0));
        q.push(entry("a,example,com)/", 0));
        let now = Instant::now() + Duration::from_millis(5);
        let first = q.pop_due(now).unwrap();
        let second = q.pop_due(now).unwrap();
        // Both due already; insertion order (b then a) breaks the tie.
        assert_eq!(first.surt_key, "b,example,com)/");
        assert_eq!(second.surt_key, "a,example,com)/");
    }

    #[test]
    fn pop_due_returns_none_when_nothing_is_due_yet() {
        let q = WorkQueue::new(1000, 500);
        q.push(entry("x", 10_000));
        assert!(q.pop_due(Instant::now()).is_none());
    }

    #[test]
    fn dedup_keeps_earliest_due_time() {
        let q = WorkQueue::new(1000, 500);
        q.push(entry("dup", 5_000));
        q.push(entry("dup", 100));
        assert_eq!(q.size(), 1);
        let now = Instant::now() + Duration::from_millis(200);
        let popped = q.pop_due(now).unwrap();
        assert_eq!(popped.surt_key, "dup");
        assert!(q.is_empty());
    }

    #[test]
    fn dedup_ignores_later_due_time_for_same_key() {
        let q = WorkQueue::new(1000, 500);
        q.push(entry("dup", 100));
        q.push(entry("dup", 5_000));
        assert_eq!(q.size(), 1);
        let now = Instant::now() + Duration::from_millis(200);
        let popped = q.pop_due(now).unwrap();
        assert_eq!(popped.surt_key, "dup");
    }

    #[test]
    fn drain_returns_all_live_entries() {
        let q = WorkQueue::new(1000, 500);
        q.push(entry("a", 0));
        q.push(entry("b", 0));
        let drained = q.drain();
        assert_eq!(drained.len(), 2);
        assert!(q.is_empty());
    }
}
