//! Local buffering data store.
//!
//! Data is buffered in memory while the store is started and flushed as JSON
//! Lines into the data directory. Running totals are persisted next to it so
//! `sensus status` can report them across sessions.

use crate::datastore::{DataStoreError, DataStoreSink};
use crate::probe::Datum;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// File holding persisted totals inside the data directory.
pub const STATS_FILE: &str = "datastore_stats.json";

/// Buffering data store with optional on-disk persistence.
#[derive(Debug)]
pub struct LocalDataStore {
    /// Data directory; `None` keeps everything in memory
    data_path: Option<PathBuf>,
    buffer: Mutex<Vec<Datum>>,
    protocol_name: Mutex<Option<String>>,
    running: AtomicBool,
    /// Data accepted over the store's lifetime
    accepted: AtomicU64,
    /// Data written to disk over the store's lifetime
    written: AtomicU64,
    /// Data offered while the store was not started
    rejected: AtomicU64,
}

impl LocalDataStore {
    /// A store that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self {
            data_path: None,
            buffer: Mutex::new(Vec::new()),
            protocol_name: Mutex::new(None),
            running: AtomicBool::new(false),
            accepted: AtomicU64::new(0),
            written: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// A store flushing into `data_path`, picking up totals from earlier sessions.
    pub fn with_path(data_path: PathBuf) -> Self {
        let store = Self {
            data_path: Some(data_path),
            ..Self::in_memory()
        };

        if let Err(e) = store.load_stats() {
            warn!("Could not load previous data store stats: {e}");
        }

        store
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of data waiting to be flushed.
    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Copy of the buffered data.
    pub fn snapshot(&self) -> Vec<Datum> {
        self.buffer.lock().clone()
    }

    /// Remove and return the buffered data without writing it.
    pub fn drain(&self) -> Vec<Datum> {
        std::mem::take(&mut *self.buffer.lock())
    }

    /// Path the given protocol's data is flushed to.
    pub fn data_file(&self, protocol_name: &str) -> Option<PathBuf> {
        self.data_path
            .as_ref()
            .map(|dir| dir.join(format!("data_{}.jsonl", sanitize(protocol_name))))
    }

    /// Write buffered data to disk. In-memory stores keep their buffer.
    ///
    /// Returns the number of data written.
    pub fn flush(&self) -> Result<usize, DataStoreError> {
        let name = self.protocol_name.lock().clone();
        let Some(path) = name.as_deref().and_then(|name| self.data_file(name)) else {
            return Ok(0);
        };

        let data = self.drain();
        if data.is_empty() {
            return Ok(0);
        }

        if let Err(e) = append_lines(&path, &data) {
            // Put the data back so a later flush can retry.
            let mut buffer = self.buffer.lock();
            let newer = std::mem::replace(&mut *buffer, data);
            buffer.extend(newer);
            return Err(e);
        }

        self.written.fetch_add(data.len() as u64, Ordering::Relaxed);
        debug!(count = data.len(), path = %path.display(), "Flushed data");
        Ok(data.len())
    }

    /// Accept a batch of data produced outside any probe, such as script responses.
    ///
    /// Unlike [`DataStoreSink::accept`], a batch offered while the store is
    /// stopped is reported at warn level. Returns the number accepted.
    pub fn accept_batch(&self, source: &str, data: Vec<Datum>) -> usize {
        if !self.is_running() {
            self.rejected.fetch_add(data.len() as u64, Ordering::Relaxed);
            warn!(source, count = data.len(), "Data store is stopped; dropping data");
            return 0;
        }

        let count = data.len();
        self.buffer.lock().extend(data);
        self.accepted.fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    pub fn stats(&self) -> DataStoreStats {
        DataStoreStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            buffered: self.buffered() as u64,
        }
    }

    /// Summary for display.
    pub fn summary(&self) -> String {
        let stats = self.stats();
        format!(
            "Data Store Statistics:\n\
             - Data accepted: {}\n\
             - Data written: {}\n\
             - Data rejected while stopped: {}\n\
             - Data buffered: {}",
            stats.accepted, stats.written, stats.rejected, stats.buffered
        )
    }

    /// Persist running totals into the data directory.
    pub fn save_stats(&self) -> Result<(), DataStoreError> {
        if let Some(ref dir) = self.data_path {
            std::fs::create_dir_all(dir)?;

            let stats = self.stats();
            let persisted = PersistedStats {
                accepted: stats.accepted,
                written: stats.written,
                rejected: stats.rejected,
                last_updated: Utc::now(),
            };

            let json = serde_json::to_string_pretty(&persisted)?;
            std::fs::write(dir.join(STATS_FILE), json)?;
        }
        Ok(())
    }

    fn load_stats(&self) -> Result<(), DataStoreError> {
        if let Some(persisted) = self.data_path.as_deref().map(load_persisted).transpose()?.flatten() {
            self.accepted.store(persisted.accepted, Ordering::Relaxed);
            self.written.store(persisted.written, Ordering::Relaxed);
            self.rejected.store(persisted.rejected, Ordering::Relaxed);
        }
        Ok(())
    }
}

impl DataStoreSink for LocalDataStore {
    fn test(&self) -> Result<(), DataStoreError> {
        let Some(ref dir) = self.data_path else {
            return Ok(());
        };

        std::fs::create_dir_all(dir)
            .map_err(|e| DataStoreError::TestFailed(format!("cannot create {}: {e}", dir.display())))?;

        let probe_file = dir.join(".write_test");
        std::fs::write(&probe_file, b"ok")
            .and_then(|_| std::fs::remove_file(&probe_file))
            .map_err(|e| DataStoreError::TestFailed(format!("{} is not writable: {e}", dir.display())))
    }

    fn start(&self, protocol_name: &str) -> Result<(), DataStoreError> {
        *self.protocol_name.lock() = Some(protocol_name.to_string());
        self.running.store(true, Ordering::SeqCst);
        info!(protocol = protocol_name, "Data store started");
        Ok(())
    }

    fn stop(&self) -> Result<(), DataStoreError> {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        let flushed = self.flush()?;
        self.save_stats()?;

        if was_running {
            info!(flushed, "Data store stopped");
        }
        Ok(())
    }

    fn accept(&self, datum: Datum) {
        if !self.is_running() {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            debug!("Data store not started; dropping datum");
            return;
        }

        self.buffer.lock().push(datum);
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of data store counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataStoreStats {
    pub accepted: u64,
    pub written: u64,
    pub rejected: u64,
    pub buffered: u64,
}

/// Totals format for persistence.
#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedStats {
    pub accepted: u64,
    pub written: u64,
    pub rejected: u64,
    pub last_updated: DateTime<Utc>,
}

/// Read the totals persisted in `data_path`, if any.
pub fn load_persisted(data_path: &Path) -> Result<Option<PersistedStats>, DataStoreError> {
    let path = data_path.join(STATS_FILE);
    if !path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&content)?))
}

fn append_lines(path: &Path, data: &[Datum]) -> Result<(), DataStoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    for datum in data {
        serde_json::to_writer(&mut file, datum)?;
        file.write_all(b"\n")?;
    }
    file.flush()?;
    Ok(())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::DatumKind;

    fn datum(meters: f64) -> Datum {
        Datum::new("altitude", DatumKind::Altitude { meters })
    }

    #[test]
    fn test_rejects_until_started() {
        let store = LocalDataStore::in_memory();
        store.accept(datum(1.0));
        assert_eq!(store.stats().rejected, 1);
        assert_eq!(store.buffered(), 0);

        store.start("test").unwrap();
        store.accept(datum(2.0));
        assert_eq!(store.stats().accepted, 1);
        assert_eq!(store.buffered(), 1);
    }

    #[test]
    fn test_batch_after_stop_is_rejected() {
        let store = LocalDataStore::in_memory();
        store.start("test").unwrap();
        assert_eq!(store.accept_batch("daily", vec![datum(1.0), datum(2.0)]), 2);

        store.stop().unwrap();
        assert_eq!(store.accept_batch("daily", vec![datum(3.0)]), 0);

        let stats = store.stats();
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.rejected, 1);
        assert_eq!(store.buffered(), 2);
    }

    #[test]
    fn test_in_memory_stop_keeps_buffer() {
        let store = LocalDataStore::in_memory();
        store.test().unwrap();
        store.start("test").unwrap();
        store.accept(datum(1.0));
        store.stop().unwrap();

        assert!(!store.is_running());
        assert_eq!(store.snapshot().len(), 1);
    }

    #[test]
    fn test_stop_flushes_jsonl_and_persists_totals() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalDataStore::with_path(dir.path().to_path_buf());
        store.test().unwrap();
        store.start("Study Protocol").unwrap();
        store.accept(datum(1.0));
        store.accept(datum(2.0));
        store.stop().unwrap();

        let file = store.data_file("Study Protocol").unwrap();
        assert!(file.ends_with("data_Study_Protocol.jsonl"));
        let content = std::fs::read_to_string(file).unwrap();
        let lines: Vec<Datum> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(store.buffered(), 0);

        let reopened = LocalDataStore::with_path(dir.path().to_path_buf());
        assert_eq!(reopened.stats().accepted, 2);
        assert_eq!(reopened.stats().written, 2);
    }

    #[test]
    fn test_unwritable_directory_fails_test() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"file").unwrap();

        let store = LocalDataStore::with_path(blocker.join("data"));
        assert!(matches!(store.test(), Err(DataStoreError::TestFailed(_))));
    }

    #[test]
    fn test_summary_format() {
        let summary = LocalDataStore::in_memory().summary();
        assert!(summary.contains("Data accepted"));
        assert!(summary.contains("Data written"));
    }
}
