//! Shared server state passed to every handler.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::logbuf::LogBuffer;
use crate::registry::SnapshotRegistry;
use crate::session::SessionTable;
use crate::shutdown::Shutdown;

/// Configurable limits, CLI-only.
#[derive(Debug, Clone)]
pub struct Limits {
    pub max_snapshots: usize,
    pub max_connections: usize,
    pub session_ttl: Duration,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub max_wait: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_snapshots: 1000,
            max_connections: 32,
            session_ttl: Duration::from_secs(3600),
            request_timeout: Duration::from_millis(5000),
            poll_interval: Duration::from_millis(100),
            max_wait: Duration::from_millis(30_000),
        }
    }
}

/// Everything the connection handlers share: caches, counters, limits and
/// the shutdown signal. One value per process, behind an `Arc`.
pub struct ServerState {
    pub limits: Limits,
    pub registry: SnapshotRegistry,
    pub sessions: Arc<SessionTable>,
    pub active_connections: AtomicUsize,
    pub shutdown: Shutdown,
    pub logs: Arc<LogBuffer>,
    pub read_only: bool,
    pub started_at: Instant,
    /// Advertised in discovery announcements.
    pub tcp_port: u16,
}

impl ServerState {
    pub fn new(limits: Limits, read_only: bool, tcp_port: u16) -> Self {
        let sessions = Arc::new(SessionTable::new(limits.session_ttl));
        Self {
            registry: SnapshotRegistry::new(limits.max_snapshots),
            sessions,
            active_connections: AtomicUsize::new(0),
            shutdown: Shutdown::new(),
            logs: Arc::new(LogBuffer::new()),
            read_only,
            started_at: Instant::now(),
            tcp_port,
            limits,
        }
    }
}

/// RAII slot in the connection budget. Listeners acquire one before
/// spawning a handler and refuse the connection when none is free.
pub struct ConnectionGuard {
    state: Arc<ServerState>,
}

impl ConnectionGuard {
    pub fn try_acquire(state: &Arc<ServerState>) -> Option<Self> {
        let max = state.limits.max_connections;
        let mut current = state.active_connections.load(Ordering::Relaxed);
        loop {
            if current >= max {
                return None;
            }
            match state.active_connections.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Some(Self {
                        state: Arc::clone(state),
                    })
                }
                Err(observed) => current = observed,
            }
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.state.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_max(max_connections: usize) -> Arc<ServerState> {
        let limits = Limits {
            max_connections,
            ..Limits::default()
        };
        Arc::new(ServerState::new(limits, false, 1985))
    }

    #[test]
    fn guard_tracks_the_counter() {
        let state = state_with_max(2);
        let a = ConnectionGuard::try_acquire(&state).unwrap();
        let b = ConnectionGuard::try_acquire(&state).unwrap();
        assert!(ConnectionGuard::try_acquire(&state).is_none());
        drop(a);
        let c = ConnectionGuard::try_acquire(&state);
        assert!(c.is_some());
        drop(b);
        drop(c);
        assert_eq!(state.active_connections.load(Ordering::Relaxed), 0);
    }
}
