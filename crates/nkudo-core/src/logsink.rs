//! Execution log ingest with backpressure.
//!
//! A bounded in-process queue between the south edge and the store. Ingest
//! accepts as many entries as fit (in order) and reports `(accepted,
//! dropped)`; producers must surface drops to their callers. A background
//! flusher drains the queue, batches rows, and writes through the
//! repository with capped exponential backoff on failure.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};

use nkudo_store::models::LogEntryInput;
use nkudo_store::Repository;

/// Outcome of one ingest call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct IngestOutcome {
    pub accepted: u64,
    pub dropped: u64,
}

/// Rows per flush batch.
const FLUSH_BATCH: usize = 128;

/// Backoff steps on flush failure.
const FLUSH_BACKOFF: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

/// Bounded ingest queue. Clone-cheap handle.
#[derive(Clone)]
pub struct LogBuffer {
    tx: mpsc::Sender<LogEntryInput>,
}

impl LogBuffer {
    /// Create a buffer with the given capacity and its flusher half.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, LogFlusher) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self { tx },
            LogFlusher {
                rx: Mutex::new(rx),
            },
        )
    }

    /// Enqueue entries in order until the queue is full. Never errors;
    /// drops are counted and must be surfaced by the caller.
    pub fn ingest(&self, entries: Vec<LogEntryInput>) -> IngestOutcome {
        let mut accepted = 0u64;
        let mut dropped = 0u64;
        for entry in entries {
            match self.tx.try_send(entry) {
                Ok(()) => accepted += 1,
                Err(_) => dropped += 1,
            }
        }
        if dropped > 0 {
            tracing::warn!(accepted, dropped, "log ingest queue full, entries dropped");
        }
        IngestOutcome { accepted, dropped }
    }
}

/// Drains the queue into the repository.
pub struct LogFlusher {
    rx: Mutex<mpsc::Receiver<LogEntryInput>>,
}

impl LogFlusher {
    /// Run until `shutdown` fires, then drain whatever is left.
    pub async fn run(self, repo: Arc<dyn Repository>, mut shutdown: watch::Receiver<bool>) {
        let mut rx = self.rx.lock().await;
        let mut batch: Vec<LogEntryInput> = Vec::with_capacity(FLUSH_BATCH);
        tracing::info!("log flusher started");
        loop {
            tokio::select! {
                received = rx.recv() => {
                    match received {
                        Some(entry) => {
                            batch.push(entry);
                            // Opportunistically fill the batch without waiting.
                            while batch.len() < FLUSH_BATCH {
                                match rx.try_recv() {
                                    Ok(entry) => batch.push(entry),
                                    Err(_) => break,
                                }
                            }
                            flush_with_backoff(&repo, &mut batch, &mut shutdown).await;
                        }
                        None => {
                            tracing::info!("log flusher channel closed");
                            return;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    // Final drain: accept what is already queued, then stop.
                    while let Ok(entry) = rx.try_recv() {
                        batch.push(entry);
                    }
                    if !batch.is_empty() {
                        if let Err(e) = repo.insert_execution_logs(&batch).await {
                            tracing::warn!(error = %e, lost = batch.len(), "final log flush failed");
                        }
                    }
                    tracing::info!("log flusher shutting down");
                    return;
                }
            }
        }
    }
}

/// Write one batch, retrying with bounded exponential backoff. The batch is
/// cleared on success; after the last failed retry it is dropped with a log
/// line (the queue is backpressure, not durable storage).
async fn flush_with_backoff(
    repo: &Arc<dyn Repository>,
    batch: &mut Vec<LogEntryInput>,
    shutdown: &mut watch::Receiver<bool>,
) {
    for (attempt, backoff) in FLUSH_BACKOFF.iter().enumerate() {
        match repo.insert_execution_logs(batch).await {
            Ok(()) => {
                batch.clear();
                return;
            }
            Err(e) => {
                if attempt + 1 == FLUSH_BACKOFF.len() {
                    tracing::error!(
                        error = %e,
                        lost = batch.len(),
                        "log flush failed after retries, dropping batch"
                    );
                    batch.clear();
                    return;
                }
                tracing::debug!(error = %e, attempt = attempt + 1, "log flush failed, retrying");
                tokio::select! {
                    () = tokio::time::sleep(*backoff) => {}
                    _ = shutdown.changed() => return,
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn entry(execution_id: Uuid, message: &str) -> LogEntryInput {
        LogEntryInput {
            execution_id,
            action_id: None,
            level: "info".to_owned(),
            message: message.to_owned(),
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn ingest_reports_accepted_and_dropped() {
        let (buffer, _flusher) = LogBuffer::new(2);
        let exec = Uuid::new_v4();
        let outcome = buffer.ingest(vec![
            entry(exec, "a"),
            entry(exec, "b"),
            entry(exec, "c"),
        ]);
        assert_eq!(
            outcome,
            IngestOutcome {
                accepted: 2,
                dropped: 1,
            }
        );
    }

    #[tokio::test]
    async fn flusher_drains_and_stops_on_shutdown() {
        use nkudo_store::{MemoryRepository, Repository};

        let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
        let (buffer, flusher) = LogBuffer::new(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let exec = Uuid::new_v4();
        let outcome = buffer.ingest(vec![entry(exec, "line-1"), entry(exec, "line-2")]);
        assert_eq!(outcome.accepted, 2);

        let handle = tokio::spawn(flusher.run(repo, shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        // The flusher exits cleanly after its final drain.
        handle.await.unwrap();
    }
}
