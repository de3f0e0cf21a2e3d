//! Property tests for the snapshot registry: monotonic IDs, pinned
//! durability, and strict LRU survivor sets.

use std::sync::Arc;
use std::thread;

use wininspectd::backend::Snapshot;
use wininspectd::registry::SnapshotRegistry;

fn suffix(id: &str) -> u64 {
    id.strip_prefix("s-").unwrap().parse().unwrap()
}

// ── Monotonic IDs ────────────────────────────────────────────────

#[test]
fn ids_are_strictly_increasing_and_never_reused() {
    let registry = SnapshotRegistry::new(5);
    let mut issued = Vec::new();
    for _ in 0..50 {
        issued.push(registry.insert(Snapshot::default()));
    }
    for pair in issued.windows(2) {
        assert!(
            suffix(&pair[1]) == suffix(&pair[0]) + 1,
            "IDs must increase by one: {} then {}",
            pair[0],
            pair[1]
        );
    }
    // Evicted IDs are gone for good, not reassigned.
    assert!(!registry.contains("s-1"));
    let next = registry.insert(Snapshot::default());
    assert_eq!(suffix(&next), 51);
}

// ── Strict LRU survivors ─────────────────────────────────────────

#[test]
fn survivors_are_exactly_the_last_capacity_inserts() {
    let capacity = 10;
    let registry = SnapshotRegistry::new(capacity);
    let total = 37;
    for _ in 0..total {
        registry.insert(Snapshot::default());
    }
    assert_eq!(registry.len(), capacity);
    for n in 1..=total {
        let id = format!("s-{n}");
        if n > total - capacity as u64 {
            assert!(registry.contains(&id), "{id} should have survived");
        } else {
            assert!(!registry.contains(&id), "{id} should have been evicted");
        }
    }
}

#[test]
fn lookup_rescues_an_entry_from_eviction_order() {
    let registry = SnapshotRegistry::new(3);
    registry.insert(Snapshot::default()); // s-1
    registry.insert(Snapshot::default()); // s-2
    registry.insert(Snapshot::default()); // s-3
    assert!(registry.peek("s-1").is_some()); // s-1 becomes MRU
    registry.insert(Snapshot::default()); // s-4 evicts s-2
    assert!(registry.contains("s-1"));
    assert!(!registry.contains("s-2"));
}

// ── Pinned durability ────────────────────────────────────────────

#[test]
fn pinned_snapshot_outlives_heavy_eviction_pressure() {
    let registry = SnapshotRegistry::new(4);
    registry.insert(Snapshot::default()); // s-1
    let pin = registry.pin("s-1").unwrap();
    for _ in 0..200 {
        registry.insert(Snapshot::default());
        assert!(registry.contains("s-1"), "pinned entry must never be evicted");
    }
    drop(pin);
    for _ in 0..5 {
        registry.insert(Snapshot::default());
    }
    assert!(!registry.contains("s-1"));
}

#[test]
fn pinned_snapshot_survives_concurrent_inserters() {
    let registry = Arc::new(SnapshotRegistry::new(8));
    registry.insert(Snapshot::default()); // s-1
    let pin = registry.pin("s-1").unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let registry = Arc::clone(&registry);
        handles.push(thread::spawn(move || {
            for _ in 0..500 {
                registry.insert(Snapshot::default());
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(registry.contains("s-1"));
    assert_eq!(registry.len(), 8);
    drop(pin);
}

// ── Pin rotation sequence ────────────────────────────────────────

// Capacity 2, pin held across inserts: the pinned head is rotated to
// most-recently-used instead of evicted, the scan takes the next oldest,
// and the registry never loses the pinned entry. After unpin the rotation
// leaves the entry most recent, so the following insert evicts its elder.
#[test]
fn pinned_head_rotates_and_next_oldest_goes() {
    let registry = SnapshotRegistry::new(2);
    registry.insert(Snapshot::default()); // s-1
    registry.insert(Snapshot::default()); // s-2
    let pin = registry.pin("s-1").unwrap();

    registry.insert(Snapshot::default()); // s-3 evicts s-2
    assert!(!registry.contains("s-2"));
    assert!(registry.contains("s-1"));

    registry.insert(Snapshot::default()); // s-4: s-1 rotates, s-3 evicted
    assert!(registry.contains("s-1"));
    assert!(!registry.contains("s-3"));
    assert!(registry.contains("s-4"));

    drop(pin);
    registry.insert(Snapshot::default()); // s-5 evicts the LRU entry, s-4
    assert_eq!(registry.len(), 2);
    assert!(registry.contains("s-5"));
    assert!(!registry.contains("s-4"));
    assert!(registry.contains("s-1"));
}

#[test]
fn fully_pinned_registry_exceeds_capacity_without_looping() {
    let registry = SnapshotRegistry::new(2);
    let mut pins = Vec::new();
    for n in 1..=6 {
        let id = registry.insert(Snapshot::default());
        assert_eq!(id, format!("s-{n}"));
        pins.push(registry.pin(&id).unwrap());
    }
    // All pinned: nothing evictable, insert terminated anyway.
    assert_eq!(registry.len(), 6);
    drop(pins);
    registry.insert(Snapshot::default());
    // One pass of eviction brings it back within bounds.
    assert_eq!(registry.len(), 2);
}
