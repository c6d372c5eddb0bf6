//! Time-windowed collection: every entry carries its own expiry timer.
//!
//! Entries are addressed by an opaque [`EntryId`] handed out on insert. The
//! logical key (for abuse tracking, the caller's address) lives inside the item
//! and is located with a predicate search. Each timer is a tokio task; it
//! removes its entry only if the entry's generation is unchanged, so a refresh
//! that races an expiring timer always wins.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

/// Handle to one entry of a [`TimedEvictionSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(u64);

struct Slot<T> {
    item: T,
    generation: u64,
    timer: JoinHandle<()>,
}

struct Inner<T> {
    entries: HashMap<EntryId, Slot<T>>,
    next_id: u64,
}

/// A set whose entries disappear after a TTL unless refreshed.
///
/// Must be used from within a tokio runtime. Share it between requests behind
/// an `Arc`; all operations take `&self`.
pub struct TimedEvictionSet<T> {
    inner: Arc<Mutex<Inner<T>>>,
    default_ttl: Duration,
}

impl<T: Send + 'static> TimedEvictionSet<T> {
    /// Create an empty set with the given default TTL.
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: HashMap::new(),
                next_id: 0,
            })),
            default_ttl,
        }
    }

    /// TTL used by `refresh` and by `add` without an override.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Insert `item` and start its timer.
    pub fn add(&self, item: T, ttl: Option<Duration>) -> EntryId {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let mut inner = self.inner.lock();
        let id = EntryId(inner.next_id);
        inner.next_id += 1;
        let timer = self.arm(id, 0, ttl);
        inner.entries.insert(
            id,
            Slot {
                item,
                generation: 0,
                timer,
            },
        );
        id
    }

    /// Restart the timer of an entry with the default TTL. `false` if absent.
    pub fn refresh(&self, id: EntryId) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(&id) {
            Some(slot) => {
                slot.timer.abort();
                slot.generation += 1;
                slot.timer = self.arm(id, slot.generation, self.default_ttl);
                true
            }
            None => false,
        }
    }

    /// Cancel the timer and remove the entry. Returns whether it was present.
    pub fn delete(&self, id: EntryId) -> bool {
        let removed = self.inner.lock().entries.remove(&id);
        match removed {
            Some(slot) => {
                slot.timer.abort();
                true
            }
            None => false,
        }
    }

    /// First entry whose item satisfies `matches`.
    pub fn find<F>(&self, matches: F) -> Option<EntryId>
    where
        F: Fn(&T) -> bool,
    {
        self.inner
            .lock()
            .entries
            .iter()
            .find(|(_, slot)| matches(&slot.item))
            .map(|(id, _)| *id)
    }

    /// Whether the entry is still tracked.
    pub fn contains(&self, id: EntryId) -> bool {
        self.inner.lock().entries.contains_key(&id)
    }

    /// Mutate an entry in place without touching its timer.
    pub fn update<R, F>(&self, id: EntryId, f: F) -> Option<R>
    where
        F: FnOnce(&mut T) -> R,
    {
        self.inner
            .lock()
            .entries
            .get_mut(&id)
            .map(|slot| f(&mut slot.item))
    }

    /// Atomically find a matching entry, modify and refresh it, or insert a new one.
    ///
    /// Returns the entry handle and a copy of the item after the operation.
    pub fn upsert<M, I, U>(&self, matches: M, insert: I, modify: U) -> (EntryId, T)
    where
        T: Clone,
        M: Fn(&T) -> bool,
        I: FnOnce() -> T,
        U: FnOnce(&mut T),
    {
        let mut inner = self.inner.lock();
        let existing = inner
            .entries
            .iter()
            .find(|(_, slot)| matches(&slot.item))
            .map(|(id, _)| *id);

        if let Some(id) = existing {
            if let Some(slot) = inner.entries.get_mut(&id) {
                modify(&mut slot.item);
                slot.timer.abort();
                slot.generation += 1;
                slot.timer = self.arm(id, slot.generation, self.default_ttl);
                return (id, slot.item.clone());
            }
        }

        let id = EntryId(inner.next_id);
        inner.next_id += 1;
        let item = insert();
        let snapshot = item.clone();
        let timer = self.arm(id, 0, self.default_ttl);
        inner.entries.insert(
            id,
            Slot {
                item,
                generation: 0,
                timer,
            },
        );
        (id, snapshot)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the set holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of an entry's item.
    pub fn get(&self, id: EntryId) -> Option<T>
    where
        T: Clone,
    {
        self.inner.lock().entries.get(&id).map(|slot| slot.item.clone())
    }

    fn arm(&self, id: EntryId, generation: u64, ttl: Duration) -> JoinHandle<()> {
        let deadline = Instant::now() + ttl;
        let weak: Weak<Mutex<Inner<T>>> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut inner = inner.lock();
            let current = inner.entries.get(&id).map(|slot| slot.generation);
            if current == Some(generation) {
                inner.entries.remove(&id);
                trace!(?id, "entry expired");
            }
        })
    }
}

impl<T> Drop for TimedEvictionSet<T> {
    fn drop(&mut self) {
        for slot in self.inner.lock().entries.values() {
            slot.timer.abort();
        }
    }
}
