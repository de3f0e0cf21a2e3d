//! Bounded in-memory buffer of recent log lines.
//!
//! A `tracing` layer copies every emitted event into a 100-entry ring so
//! `daemon.logs` can serve the recent tail without touching any other
//! subsystem. The buffer has its own lock and no dependencies on the rest
//! of the server state.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Number of entries retained.
pub const LOG_BUFFER_CAPACITY: usize = 100;

/// One captured log line.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp_ms: u64,
    pub level: String,
    pub target: String,
    pub message: String,
}

/// Ring buffer of the most recent [`LOG_BUFFER_CAPACITY`] entries.
#[derive(Default)]
pub struct LogBuffer {
    inner: Mutex<VecDeque<LogEntry>>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: LogEntry) {
        let mut buf = self.inner.lock();
        if buf.len() == LOG_BUFFER_CAPACITY {
            buf.pop_front();
        }
        buf.push_back(entry);
    }

    /// The most recent `count` entries, oldest first.
    pub fn tail(&self, count: usize) -> Vec<LogEntry> {
        let buf = self.inner.lock();
        let skip = buf.len().saturating_sub(count);
        buf.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `tracing` layer feeding a [`LogBuffer`].
pub struct BufferLayer {
    buffer: std::sync::Arc<LogBuffer>,
}

impl BufferLayer {
    pub fn new(buffer: std::sync::Arc<LogBuffer>) -> Self {
        Self { buffer }
    }
}

impl<S: Subscriber> Layer<S> for BufferLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.buffer.push(LogEntry {
            timestamp_ms,
            level: event.metadata().level().to_string(),
            target: event.metadata().target().to_string(),
            message: visitor.message,
        });
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            if !self.message.is_empty() {
                self.message.push(' ');
            }
            let _ = write!(self.message, "{}={value:?}", field.name());
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            if !self.message.is_empty() {
                self.message.push(' ');
            }
            let _ = write!(self.message, "{}={value}", field.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(message: &str) -> LogEntry {
        LogEntry {
            timestamp_ms: 0,
            level: "INFO".to_string(),
            target: "test".to_string(),
            message: message.to_string(),
        }
    }

    #[test]
    fn buffer_is_bounded() {
        let buf = LogBuffer::new();
        for i in 0..LOG_BUFFER_CAPACITY + 20 {
            buf.push(entry(&format!("line {i}")));
        }
        assert_eq!(buf.len(), LOG_BUFFER_CAPACITY);
        let tail = buf.tail(1);
        assert_eq!(tail[0].message, format!("line {}", LOG_BUFFER_CAPACITY + 19));
    }

    #[test]
    fn tail_returns_oldest_first() {
        let buf = LogBuffer::new();
        buf.push(entry("first"));
        buf.push(entry("second"));
        buf.push(entry("third"));
        let tail = buf.tail(2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].message, "second");
        assert_eq!(tail[1].message, "third");
    }

    #[test]
    fn tail_larger_than_buffer_returns_everything() {
        let buf = LogBuffer::new();
        buf.push(entry("only"));
        assert_eq!(buf.tail(100).len(), 1);
    }
}
