//! Persistent per-client session records.
//!
//! A session is created the first time a request names its `session_id` and
//! remembers the client's event-poll baseline and subscription across
//! connections. Records are reaped once idle past the configured TTL.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::shutdown::Shutdown;

/// How often the reaper scans for expired sessions.
const REAP_INTERVAL: Duration = Duration::from_secs(60);

/// State remembered for one client-named session.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub last_snapshot_id: Option<String>,
    pub subscribed: bool,
    pub last_activity: Instant,
}

/// All live sessions, keyed by the client-supplied opaque ID.
pub struct SessionTable {
    inner: Mutex<HashMap<String, SessionRecord>>,
    ttl: Duration,
}

impl SessionTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Look up a session, creating it if absent, and refresh its activity
    /// time. Returns a copy of the record.
    pub fn touch_or_create(&self, id: &str) -> SessionRecord {
        let mut sessions = self.inner.lock();
        let record = sessions
            .entry(id.to_string())
            .or_insert_with(|| SessionRecord {
                last_snapshot_id: None,
                subscribed: false,
                last_activity: Instant::now(),
            });
        record.last_activity = Instant::now();
        record.clone()
    }

    /// Record the session's new event-poll baseline.
    pub fn update_last_snapshot(&self, id: &str, snapshot_id: &str) {
        if let Some(record) = self.inner.lock().get_mut(id) {
            record.last_snapshot_id = Some(snapshot_id.to_string());
        }
    }

    /// Flip the session's event subscription. Returns false for an unknown
    /// session.
    pub fn set_subscribed(&self, id: &str, subscribed: bool) -> bool {
        match self.inner.lock().get_mut(id) {
            Some(record) => {
                record.subscribed = subscribed;
                true
            }
            None => false,
        }
    }

    /// Remove a session by name. Returns whether it existed.
    pub fn terminate(&self, id: &str) -> bool {
        self.inner.lock().remove(id).is_some()
    }

    /// Drop sessions idle past the TTL. Returns how many were removed.
    pub fn reap(&self, now: Instant) -> usize {
        let mut sessions = self.inner.lock();
        let before = sessions.len();
        let ttl = self.ttl;
        sessions.retain(|_, record| now.duration_since(record.last_activity) <= ttl);
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Periodic reaper task. Runs until shutdown.
pub async fn run_reaper(sessions: Arc<SessionTable>, shutdown: Shutdown) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(REAP_INTERVAL) => {
                let reaped = sessions.reap(Instant::now());
                if reaped > 0 {
                    tracing::debug!(reaped, "reaped expired sessions");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_creates_then_refreshes() {
        let table = SessionTable::new(Duration::from_secs(60));
        let record = table.touch_or_create("alice");
        assert!(record.last_snapshot_id.is_none());
        assert!(!record.subscribed);
        assert_eq!(table.len(), 1);

        table.update_last_snapshot("alice", "s-7");
        let record = table.touch_or_create("alice");
        assert_eq!(record.last_snapshot_id.as_deref(), Some("s-7"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn terminate_removes_the_record() {
        let table = SessionTable::new(Duration::from_secs(60));
        table.touch_or_create("alice");
        assert!(table.terminate("alice"));
        assert!(!table.terminate("alice"));
        assert!(table.is_empty());
    }

    #[test]
    fn reap_drops_only_idle_sessions() {
        let table = SessionTable::new(Duration::from_millis(50));
        table.touch_or_create("old");
        std::thread::sleep(Duration::from_millis(80));
        table.touch_or_create("fresh");

        let reaped = table.reap(Instant::now());
        assert_eq!(reaped, 1);
        assert_eq!(table.len(), 1);
        // The fresh session survived.
        assert!(!table.set_subscribed("old", true));
        assert!(table.set_subscribed("fresh", true));
    }

    #[test]
    fn subscribe_flag_round_trips() {
        let table = SessionTable::new(Duration::from_secs(60));
        table.touch_or_create("alice");
        assert!(table.set_subscribed("alice", true));
        assert!(table.touch_or_create("alice").subscribed);
        assert!(table.set_subscribed("alice", false));
        assert!(!table.touch_or_create("alice").subscribed);
    }
}
