//! Persistence collaborator.
//!
//! The engine hands every [`DetectionResult`] to a [`PersistenceHandle`],
//! which enqueues it on a bounded channel and gives up after a short timeout.
//! A dedicated writer thread drains the channel into a [`HistoryStore`].
//! Failures on either side are logged and counted, never propagated to the
//! ingest path.

use crate::error::PersistenceError;
use crate::metrics::PERSISTENCE_FAILURES_TOTAL;
use crate::signal::{DataPoint, DetectionResult};
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, SendTimeoutError, Sender, bounded, select};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// One persisted verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub client_id: String,
    pub point: DataPoint,
    pub result: DetectionResult,
    pub recorded_at: DateTime<Utc>,
}

/// Storage backend for detection history.
pub trait HistoryStore: Send + Sync {
    fn append(&self, record: &PersistedRecord) -> Result<(), PersistenceError>;

    /// Records for `client_id` in arrival order.
    fn history(&self, client_id: &str) -> Result<Vec<PersistedRecord>, PersistenceError>;

    fn flush(&self) -> Result<(), PersistenceError> {
        Ok(())
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process store, used by tests and when no history file is configured.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, Vec<PersistedRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryStore for MemoryStore {
    fn append(&self, record: &PersistedRecord) -> Result<(), PersistenceError> {
        lock(&self.records)
            .entry(record.client_id.clone())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    fn history(&self, client_id: &str) -> Result<Vec<PersistedRecord>, PersistenceError> {
        Ok(lock(&self.records)
            .get(client_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Append-only JSON lines file, one [`PersistedRecord`] per line.
pub struct JsonlStore {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::with_capacity(128 * 1024, file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl HistoryStore for JsonlStore {
    fn append(&self, record: &PersistedRecord) -> Result<(), PersistenceError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        lock(&self.writer).write_all(&line)?;
        Ok(())
    }

    fn history(&self, client_id: &str) -> Result<Vec<PersistedRecord>, PersistenceError> {
        self.flush()?;
        let reader = BufReader::new(File::open(&self.path)?);
        let mut out = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<PersistedRecord>(&line) {
                Ok(record) if record.client_id == client_id => out.push(record),
                Ok(_) => {}
                // A torn final line after a crash should not hide the rest
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = lineno + 1,
                    error = %e,
                    "Skipping unreadable history line."
                ),
            }
        }
        Ok(out)
    }

    fn flush(&self) -> Result<(), PersistenceError> {
        lock(&self.writer).flush()?;
        Ok(())
    }
}

/// Cloneable sender side used by the engine.
#[derive(Clone)]
pub struct PersistenceHandle {
    tx: Sender<PersistedRecord>,
    timeout: Duration,
}

impl PersistenceHandle {
    /// Enqueues a record, waiting at most the configured timeout.
    ///
    /// Returns `false` when the record was not accepted. The failure has
    /// already been logged and counted.
    pub fn append(&self, client_id: &str, point: DataPoint, result: &DetectionResult) -> bool {
        let record = PersistedRecord {
            client_id: client_id.to_string(),
            point,
            result: result.clone(),
            recorded_at: Utc::now(),
        };
        match self.tx.send_timeout(record, self.timeout) {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(r)) => {
                PERSISTENCE_FAILURES_TOTAL.inc();
                warn!(
                    client_id = %r.client_id,
                    sequence = r.result.sequence,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Persistence queue full, result not stored."
                );
                false
            }
            Err(SendTimeoutError::Disconnected(r)) => {
                PERSISTENCE_FAILURES_TOTAL.inc();
                warn!(
                    client_id = %r.client_id,
                    sequence = r.result.sequence,
                    "Persistence writer stopped, result not stored."
                );
                false
            }
        }
    }
}

/// Background thread draining the persistence queue into a store.
pub struct PersistenceWriter {
    shutdown: Sender<()>,
    handle: thread::JoinHandle<()>,
}

impl PersistenceWriter {
    pub fn spawn(
        store: Arc<dyn HistoryStore>,
        capacity: usize,
        timeout: Duration,
    ) -> Result<(PersistenceHandle, Self), PersistenceError> {
        let (tx, rx) = bounded::<PersistedRecord>(capacity.max(1));
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);

        let handle = thread::Builder::new()
            .name("quorum-persistence".into())
            .spawn(move || run_writer(store.as_ref(), rx, shutdown_rx))?;

        Ok((
            PersistenceHandle { tx, timeout },
            Self {
                shutdown: shutdown_tx,
                handle,
            },
        ))
    }

    /// Drains whatever is queued, flushes the store and joins the thread.
    pub fn shutdown(self) {
        drop(self.shutdown);
        if self.handle.join().is_err() {
            warn!("Persistence writer panicked.");
        }
    }
}

fn run_writer(store: &dyn HistoryStore, rx: Receiver<PersistedRecord>, shutdown: Receiver<()>) {
    info!("Persistence writer active.");
    let write = |record: PersistedRecord| {
        if let Err(e) = store.append(&record) {
            PERSISTENCE_FAILURES_TOTAL.inc();
            warn!(
                client_id = %record.client_id,
                sequence = record.result.sequence,
                error = %e,
                "Failed to persist result."
            );
        }
    };

    loop {
        select! {
            recv(rx) -> msg => match msg {
                Ok(record) => write(record),
                Err(_) => break,
            },
            recv(shutdown) -> _ => {
                for record in rx.try_iter() {
                    write(record);
                }
                break;
            }
        }
    }

    if let Err(e) = store.flush() {
        warn!(error = %e, "Failed to flush history store.");
    }
    info!("Persistence writer stopped.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::Tally;

    fn record(seq: u64) -> (DataPoint, DetectionResult) {
        let point = DataPoint::new(seq as f64, seq as f64 * 2.0);
        let result = DetectionResult {
            sequence: seq,
            timestamp: point.timestamp,
            anomaly: seq % 2 == 0,
            tally: Tally::default(),
            votes: Vec::new(),
        };
        (point, result)
    }

    #[test]
    fn test_writer_drains_into_memory_store() {
        let store = Arc::new(MemoryStore::new());
        let (handle, writer) =
            PersistenceWriter::spawn(store.clone(), 16, Duration::from_millis(50)).unwrap();

        for seq in 1..=3 {
            let (point, result) = record(seq);
            assert!(handle.append("a", point, &result));
        }
        let (point, result) = record(1);
        handle.append("b", point, &result);

        writer.shutdown();

        let history = store.history("a").unwrap();
        let seqs: Vec<u64> = history.iter().map(|r| r.result.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(store.history("b").unwrap().len(), 1);
        assert!(store.history("nobody").unwrap().is_empty());
    }

    #[test]
    fn test_append_after_shutdown_reports_failure() {
        let store = Arc::new(MemoryStore::new());
        let (handle, writer) =
            PersistenceWriter::spawn(store, 4, Duration::from_millis(5)).unwrap();
        writer.shutdown();

        let (point, result) = record(1);
        assert!(!handle.append("a", point, &result));
    }

    #[test]
    fn test_jsonl_store_roundtrip_and_filtering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        let store = JsonlStore::open(&path).unwrap();

        for (client, seq) in [("a", 1), ("b", 1), ("a", 2)] {
            let (point, result) = record(seq);
            store
                .append(&PersistedRecord {
                    client_id: client.to_string(),
                    point,
                    result,
                    recorded_at: Utc::now(),
                })
                .unwrap();
        }

        let a = store.history("a").unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(a[1].result.sequence, 2);
        assert!(a[1].result.anomaly);

        // Reopening appends to the same file
        drop(store);
        let reopened = JsonlStore::open(&path).unwrap();
        assert_eq!(reopened.history("b").unwrap().len(), 1);
    }

    #[test]
    fn test_jsonl_store_skips_torn_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        std::fs::write(&path, "{\"client_id\": \"a\", \"poi\n").unwrap();

        let store = JsonlStore::open(&path).unwrap();
        let (point, result) = record(1);
        store
            .append(&PersistedRecord {
                client_id: "a".into(),
                point,
                result,
                recorded_at: Utc::now(),
            })
            .unwrap();
        assert_eq!(store.history("a").unwrap().len(), 1);
    }
}
