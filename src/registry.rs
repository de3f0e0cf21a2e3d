//! Thread-safe snapshot registry with pinning and LRU eviction.
//!
//! Snapshots are addressed by `s-<N>` IDs issued from a counter that never
//! rolls back, so an evicted ID is never reassigned. Entries live in a slab
//! threaded by an intrusive doubly-linked recency list: lookup, insert, pin
//! and unpin are O(1) amortized; eviction is O(K) in the number of pinned
//! entries it has to skip.
//!
//! Eviction is strict LRU among unpinned entries. A pinned entry at the
//! head of the list is rotated to most-recently-used and the scan moves on;
//! when every entry is pinned the scan terminates and the registry
//! transiently exceeds its capacity.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::Snapshot;

const NIL: usize = usize::MAX;

struct Entry {
    id: String,
    snapshot: Arc<Snapshot>,
    pins: u32,
    prev: usize,
    next: usize,
}

struct Inner {
    slots: Vec<Option<Entry>>,
    free: Vec<usize>,
    index: HashMap<String, usize>,
    /// Oldest entry (eviction candidate).
    head: usize,
    /// Newest entry.
    tail: usize,
    len: usize,
    next_serial: u64,
    capacity: usize,
}

impl Inner {
    fn entry(&self, slot: usize) -> &Entry {
        self.slots[slot].as_ref().expect("slot is live")
    }

    fn entry_mut(&mut self, slot: usize) -> &mut Entry {
        self.slots[slot].as_mut().expect("slot is live")
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = {
            let e = self.entry(slot);
            (e.prev, e.next)
        };
        if prev != NIL {
            self.entry_mut(prev).next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.entry_mut(next).prev = prev;
        } else {
            self.tail = prev;
        }
    }

    fn push_tail(&mut self, slot: usize) {
        let old_tail = self.tail;
        {
            let e = self.entry_mut(slot);
            e.prev = old_tail;
            e.next = NIL;
        }
        if old_tail != NIL {
            self.entry_mut(old_tail).next = slot;
        } else {
            self.head = slot;
        }
        self.tail = slot;
    }

    /// Move an entry to most-recently-used.
    fn touch(&mut self, slot: usize) {
        if self.tail != slot {
            self.unlink(slot);
            self.push_tail(slot);
        }
    }

    fn alloc(&mut self, entry: Entry) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(entry);
                slot
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        }
    }

    fn remove(&mut self, slot: usize) {
        self.unlink(slot);
        let entry = self.slots[slot].take().expect("slot is live");
        self.index.remove(&entry.id);
        self.free.push(slot);
        self.len -= 1;
    }

    /// Evict from the head until within capacity or only pinned entries
    /// remain. Bounded by one full rotation so it never loops forever.
    fn evict_over_capacity(&mut self) {
        let mut attempts = self.len;
        while self.len > self.capacity && attempts > 0 {
            attempts -= 1;
            let head = self.head;
            if self.entry(head).pins > 0 {
                self.touch(head);
                continue;
            }
            self.remove(head);
        }
    }
}

/// Registry of captured snapshots, shared by all connection handlers.
pub struct SnapshotRegistry {
    inner: Mutex<Inner>,
}

impl SnapshotRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                free: Vec::new(),
                index: HashMap::new(),
                head: NIL,
                tail: NIL,
                len: 0,
                next_serial: 1,
                capacity,
            }),
        }
    }

    /// Store a snapshot as most-recently-used and return its fresh ID.
    pub fn insert(&self, snapshot: Snapshot) -> String {
        let mut inner = self.inner.lock();
        let id = format!("s-{}", inner.next_serial);
        inner.next_serial += 1;
        let slot = inner.alloc(Entry {
            id: id.clone(),
            snapshot: Arc::new(snapshot),
            pins: 0,
            prev: NIL,
            next: NIL,
        });
        inner.push_tail(slot);
        inner.index.insert(id.clone(), slot);
        inner.len += 1;
        inner.evict_over_capacity();
        id
    }

    /// Pin a snapshot for the duration of one request. The returned guard
    /// unpins on drop; the entry cannot be evicted while pinned.
    pub fn pin(&self, id: &str) -> Option<PinGuard<'_>> {
        let snapshot = {
            let mut inner = self.inner.lock();
            let slot = *inner.index.get(id)?;
            inner.entry_mut(slot).pins += 1;
            inner.touch(slot);
            Arc::clone(&inner.entry(slot).snapshot)
        };
        Some(PinGuard {
            registry: self,
            id: id.to_string(),
            snapshot,
        })
    }

    /// Decrement a pin count. Unpinning an unknown (evicted) ID is a no-op.
    /// Recency is refreshed by pin, not by the matching unpin.
    pub fn unpin(&self, id: &str) {
        let mut inner = self.inner.lock();
        if let Some(&slot) = inner.index.get(id) {
            let entry = inner.entry_mut(slot);
            entry.pins = entry.pins.saturating_sub(1);
        }
    }

    /// Non-pinning read, used when resolving a session's last snapshot.
    pub fn peek(&self, id: &str) -> Option<Arc<Snapshot>> {
        let mut inner = self.inner.lock();
        let slot = *inner.index.get(id)?;
        inner.touch(slot);
        Some(Arc::clone(&inner.entry(slot).snapshot))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current pin count of an entry, if present.
    pub fn pin_count(&self, id: &str) -> Option<u32> {
        let inner = self.inner.lock();
        let slot = *inner.index.get(id)?;
        Some(inner.entry(slot).pins)
    }
}

/// RAII pin on one registry entry. Carries the snapshot out of the registry
/// critical section; drops the pin when the request finishes.
pub struct PinGuard<'a> {
    registry: &'a SnapshotRegistry,
    id: String,
    snapshot: Arc<Snapshot>,
}

impl PinGuard<'_> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot)
    }
}

impl Deref for PinGuard<'_> {
    type Target = Snapshot;

    fn deref(&self) -> &Snapshot {
        &self.snapshot
    }
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        self.registry.unpin(&self.id);
    }
}
