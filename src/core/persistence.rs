//! Durable history of finished transfers.
//!
//! The registry appends one record per completed transfer (either
//! direction); records are only ever added or removed wholesale.

use crate::core::config::{HISTORY_FILE_NAME, MAX_HISTORY_ENTRIES};
use crate::core::protocol::FileMetadata;
use crate::core::transfer::TransferDirection;
use crate::utils::atomic_write::atomic_write;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TransferHistoryRecord {
    pub id: Uuid,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    pub direction: TransferDirection,
    pub timestamp: DateTime<Utc>,
    /// Saved file (received) or source file (sent), if on disk.
    pub location: Option<PathBuf>,
    /// Hex SHA3-256 of the file contents.
    #[serde(default)]
    pub sha3_256: Option<String>,
}

impl TransferHistoryRecord {
    pub fn new(
        metadata: &FileMetadata,
        direction: TransferDirection,
        location: Option<PathBuf>,
        sha3_256: Option<String>,
    ) -> Self {
        Self {
            id: metadata.id,
            name: metadata.name.clone(),
            mime_type: metadata.mime_type.clone(),
            size: metadata.total_size,
            direction,
            timestamp: Utc::now(),
            location,
            sha3_256,
        }
    }
}

/// Storage for [`TransferHistoryRecord`]s, keyed by id, in insertion order.
pub trait HistoryStore: Send + Sync {
    /// Add a record. A record with the same id is replaced.
    fn append(&self, record: TransferHistoryRecord) -> Result<()>;
    /// Remove the record with `id`; returns whether one existed.
    fn remove(&self, id: &Uuid) -> Result<bool>;
    fn clear(&self) -> Result<()>;
    /// All records, oldest first.
    fn load_all(&self) -> Result<Vec<TransferHistoryRecord>>;
}

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    m.lock().map_err(|_| anyhow!("history lock poisoned"))
}

/// Insert or replace, then evict the oldest entries beyond `capacity`.
fn upsert(entries: &mut Vec<TransferHistoryRecord>, record: TransferHistoryRecord, capacity: usize) {
    if let Some(existing) = entries.iter_mut().find(|r| r.id == record.id) {
        warn!(event = "history_duplicate", id = %record.id, "Replacing existing history record");
        *existing = record;
    } else {
        entries.push(record);
    }
    if entries.len() > capacity {
        let excess = entries.len() - capacity;
        entries.drain(..excess);
    }
}

// ── JSON file store ──────────────────────────────────────────────────────────

/// History kept in a single JSON file, rewritten atomically on every change.
#[derive(Debug)]
pub struct JsonHistoryStore {
    path: PathBuf,
    capacity: usize,
    entries: Mutex<Vec<TransferHistoryRecord>>,
}

impl JsonHistoryStore {
    /// Open `<data_dir>/history.json`.
    pub fn open_in(data_dir: &Path) -> Result<Self> {
        Self::open(data_dir.join(HISTORY_FILE_NAME), MAX_HISTORY_ENTRIES)
    }

    /// Open (or lazily create) the history file at `path`.
    pub fn open(path: PathBuf, capacity: usize) -> Result<Self> {
        let entries: Vec<TransferHistoryRecord> = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("corrupt history file {}", path.display()))?
        } else {
            Vec::new()
        };
        debug!(event = "history_loaded", path = %path.display(), entries = entries.len());

        Ok(Self {
            path,
            capacity,
            entries: Mutex::new(entries),
        })
    }

    fn save(&self, entries: &[TransferHistoryRecord]) -> Result<()> {
        let content = serde_json::to_vec_pretty(entries)?;
        atomic_write(&self.path, &content)
    }
}

impl HistoryStore for JsonHistoryStore {
    fn append(&self, record: TransferHistoryRecord) -> Result<()> {
        let mut entries = lock(&self.entries)?;
        info!(
            event = "history_append",
            id = %record.id,
            name = %record.name,
            direction = %record.direction,
            "Recorded finished transfer"
        );
        upsert(&mut entries, record, self.capacity);
        self.save(&entries)
    }

    fn remove(&self, id: &Uuid) -> Result<bool> {
        let mut entries = lock(&self.entries)?;
        let before = entries.len();
        entries.retain(|r| r.id != *id);
        if entries.len() == before {
            return Ok(false);
        }
        self.save(&entries)?;
        Ok(true)
    }

    fn clear(&self) -> Result<()> {
        let mut entries = lock(&self.entries)?;
        entries.clear();
        self.save(&entries)
    }

    fn load_all(&self) -> Result<Vec<TransferHistoryRecord>> {
        Ok(lock(&self.entries)?.clone())
    }
}

// ── In-memory store ──────────────────────────────────────────────────────────

/// Volatile history; clones share the same entries.
#[derive(Debug, Clone)]
pub struct MemoryHistoryStore {
    capacity: usize,
    entries: Arc<Mutex<Vec<TransferHistoryRecord>>>,
}

impl Default for MemoryHistoryStore {
    fn default() -> Self {
        Self::new(MAX_HISTORY_ENTRIES)
    }
}

impl MemoryHistoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn append(&self, record: TransferHistoryRecord) -> Result<()> {
        let mut entries = lock(&self.entries)?;
        upsert(&mut entries, record, self.capacity);
        Ok(())
    }

    fn remove(&self, id: &Uuid) -> Result<bool> {
        let mut entries = lock(&self.entries)?;
        let before = entries.len();
        entries.retain(|r| r.id != *id);
        Ok(entries.len() != before)
    }

    fn clear(&self) -> Result<()> {
        lock(&self.entries)?.clear();
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<TransferHistoryRecord>> {
        Ok(lock(&self.entries)?.clone())
    }
}
