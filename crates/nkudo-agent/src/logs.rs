//! Buffered log sink.
//!
//! Actions emit log entries through [`LogSink`]; the buffered
//! implementation queues up to a capacity and counts drops. Dropping never
//! fails an action. The run loop drains the buffer and ships batches to
//! the control plane, backing off when the server reports drops of its
//! own.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

/// One log line attached to an execution.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub execution_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_id: Option<Uuid>,
    pub level: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl LogEntry {
    #[must_use]
    pub fn info(execution_id: Uuid, action_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            execution_id,
            action_id: Some(action_id),
            level: "info".to_owned(),
            message: message.into(),
            at: Utc::now(),
        }
    }

    #[must_use]
    pub fn error(execution_id: Uuid, action_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            execution_id,
            action_id: Some(action_id),
            level: "error".to_owned(),
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Where actions emit their log lines.
#[async_trait::async_trait]
pub trait LogSink: Send + Sync + 'static {
    /// Accept or drop the entry. Never fails.
    async fn emit(&self, entry: LogEntry);
}

/// Bounded in-memory sink drained by the run loop.
pub struct BufferedLogSink {
    capacity: usize,
    queue: Mutex<Vec<LogEntry>>,
    dropped: AtomicU64,
}

impl BufferedLogSink {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queue: Mutex::new(Vec::new()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Take everything queued so far.
    pub async fn drain(&self) -> Vec<LogEntry> {
        std::mem::take(&mut *self.queue.lock().await)
    }

    /// Entries dropped since startup.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Put entries back at the front after a failed ship.
    pub async fn requeue(&self, mut entries: Vec<LogEntry>) {
        let mut queue = self.queue.lock().await;
        entries.append(&mut queue);
        *queue = entries;
        let overflow = queue.len().saturating_sub(self.capacity);
        if overflow > 0 {
            queue.truncate(self.capacity);
            self.dropped.fetch_add(overflow as u64, Ordering::Relaxed);
        }
    }
}

#[async_trait::async_trait]
impl LogSink for BufferedLogSink {
    async fn emit(&self, entry: LogEntry) {
        let mut queue = self.queue.lock().await;
        if queue.len() >= self.capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        queue.push(entry);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn overflow_drops_and_counts() {
        let sink = BufferedLogSink::new(2);
        for n in 0..4 {
            sink.emit(LogEntry::info(
                Uuid::new_v4(),
                Uuid::new_v4(),
                format!("line {n}"),
            ))
            .await;
        }
        assert_eq!(sink.drain().await.len(), 2);
        assert_eq!(sink.dropped(), 2);
    }

    #[tokio::test]
    async fn requeue_preserves_order() {
        let sink = BufferedLogSink::new(10);
        sink.emit(LogEntry::info(Uuid::new_v4(), Uuid::new_v4(), "second"))
            .await;
        let failed = vec![LogEntry::info(Uuid::new_v4(), Uuid::new_v4(), "first")];
        sink.requeue(failed).await;
        let drained = sink.drain().await;
        assert_eq!(drained[0].message, "first");
        assert_eq!(drained[1].message, "second");
    }
}
