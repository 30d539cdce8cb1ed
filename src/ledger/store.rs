// =============================================================================
// EventLedger — append-only, fsync'd, newline-delimited JSON event log
// =============================================================================
//
// Every mutation hits the filesystem before the caller is told it
// succeeded. The log is append-only rather than replace-whole-file, so
// there's no tmp+rename step — instead every write opens in append mode and
// calls `sync_all()` before returning, so a crash mid-write can only ever
// lose the last, not-yet-acknowledged record.
// =============================================================================

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::ledger::event::Event;

/// Append-only store for `Event` records.
///
/// Appends are serialized through a `tokio::sync::Mutex` so concurrent
/// callers (strategy loop, user-stream loop, reconciliation loop) can't
/// interleave partial writes; `sequence_num` assignment and the file write
/// happen atomically with respect to each other.
pub struct EventLedger {
    path: PathBuf,
    file: Mutex<File>,
    next_sequence: AtomicU64,
}

impl EventLedger {
    /// Open (creating if absent) the ledger file at `path` for appending,
    /// and scan it once to determine the next sequence number.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::LedgerIOError(format!("create dir {parent:?}: {e}")))?;
        }

        let existing = Self::read_all_from(&path)?;
        let next_sequence = existing.last().map(|e| e.sequence_num + 1).unwrap_or(0);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| EngineError::LedgerIOError(format!("open {path:?}: {e}")))?;

        Ok(Self {
            path,
            file: Mutex::new(file),
            next_sequence: AtomicU64::new(next_sequence),
        })
    }

    /// Append one event, assigning it the next sequence number. Blocks
    /// until the write is fsync'd; the caller's `?` propagation means no
    /// handler is invoked for an event that didn't actually durably land.
    pub async fn append(&self, mut event: Event) -> Result<Event, EngineError> {
        let seq = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        event.sequence_num = seq;

        let line = serde_json::to_string(&event)
            .map_err(|e| EngineError::LedgerIOError(format!("serialize event: {e}")))?;

        let mut file = self.file.lock().await;
        writeln!(file, "{line}")
            .map_err(|e| EngineError::LedgerIOError(format!("write {:?}: {e}", self.path)))?;
        file.sync_all()
            .map_err(|e| EngineError::LedgerIOError(format!("fsync {:?}: {e}", self.path)))?;

        Ok(event)
    }

    /// Load every well-formed event currently on disk, in append order.
    /// A malformed trailing line (partial write from a crash mid-append)
    /// is logged and dropped rather than treated as a fatal read error;
    /// a malformed line in the *middle* of the file is a corruption bug
    /// and is treated as fatal.
    pub fn load_all(&self) -> Result<Vec<Event>, EngineError> {
        Self::read_all_from(&self.path)
    }

    fn read_all_from(path: &Path) -> Result<Vec<Event>, EngineError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EngineError::LedgerIOError(format!("open {path:?}: {e}"))),
        };

        let reader = BufReader::new(file);
        let lines: Vec<String> = reader
            .lines()
            .collect::<Result<_, _>>()
            .map_err(|e| EngineError::LedgerIOError(format!("read {path:?}: {e}")))?;

        let mut events = Vec::with_capacity(lines.len());
        let last_index = lines.len().saturating_sub(1);
        for (i, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Event>(line) {
                Ok(event) => events.push(event),
                Err(e) if i == last_index => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "dropping malformed trailing ledger record (likely a torn write)"
                    );
                }
                Err(e) => {
                    return Err(EngineError::LedgerIOError(format!(
                        "corrupt ledger record at line {i} of {path:?}: {e}"
                    )));
                }
            }
        }

        info!(path = %path.display(), count = events.len(), "ledger loaded");
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::event::EventType;
    use serde_json::json;

    #[tokio::test]
    async fn append_assigns_monotonic_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = EventLedger::open(dir.path().join("ledger.log")).unwrap();

        let e1 = ledger
            .append(Event::new(EventType::SystemStarted, json!({})))
            .await
            .unwrap();
        let e2 = ledger
            .append(Event::new(EventType::SignalComputed, json!({})))
            .await
            .unwrap();

        assert_eq!(e1.sequence_num, 0);
        assert_eq!(e2.sequence_num, 1);
    }

    #[tokio::test]
    async fn reopen_resumes_sequence_after_existing_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.log");

        {
            let ledger = EventLedger::open(&path).unwrap();
            ledger
                .append(Event::new(EventType::SystemStarted, json!({})))
                .await
                .unwrap();
            ledger
                .append(Event::new(EventType::SignalComputed, json!({})))
                .await
                .unwrap();
        }

        let ledger = EventLedger::open(&path).unwrap();
        let loaded = ledger.load_all().unwrap();
        assert_eq!(loaded.len(), 2);

        let e3 = ledger
            .append(Event::new(EventType::OrderPlaced, json!({})))
            .await
            .unwrap();
        assert_eq!(e3.sequence_num, 2);
    }

    #[tokio::test]
    async fn malformed_trailing_line_is_dropped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.log");

        {
            let ledger = EventLedger::open(&path).unwrap();
            ledger
                .append(Event::new(EventType::SystemStarted, json!({})))
                .await
                .unwrap();
        }

        // Simulate a crash mid-write: append a truncated JSON line.
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(file, "{{\"event_id\":\"not-complete").unwrap();
        }

        let loaded = EventLedger::read_all_from(&path).unwrap();
        assert_eq!(loaded.len(), 1);
    }

    #[test]
    fn missing_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.log");
        let events = EventLedger::read_all_from(&path).unwrap();
        assert!(events.is_empty());
    }
}
