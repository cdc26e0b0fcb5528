//! Same-day resume bookkeeping.
//!
//! A single JSON file records which work items finished on a given date.
//! A run loads it on start; a file from another day counts as empty.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::NaiveDate;
use imirror_core::error::{MirrorError, Result};
use imirror_core::work::WorkKey;
use serde::{Deserialize, Serialize};

use super::write_atomic;

/// Persisted set of completed work items for one day.
pub trait ProgressStore: Send + Sync {
    /// Items completed on `date`. Empty when nothing was recorded for it.
    fn load(&self, date: NaiveDate) -> Result<BTreeSet<WorkKey>>;

    /// Record `key` as completed on `date`.
    fn mark_done(&self, date: NaiveDate, key: &WorkKey) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProgressFile {
    date: Option<NaiveDate>,
    #[serde(default)]
    done: BTreeSet<WorkKey>,
}

/// Progress kept in a single JSON file.
#[derive(Debug)]
pub struct FileProgressStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileProgressStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn read(&self) -> Result<ProgressFile> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ProgressFile::default())
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&data).map_err(|e| MirrorError::StateCorrupt {
            path: self.path.display().to_string(),
            message: e.to_string(),
        })
    }
}

impl ProgressStore for FileProgressStore {
    fn load(&self, date: NaiveDate) -> Result<BTreeSet<WorkKey>> {
        let file = self.read()?;
        if file.date != Some(date) {
            return Ok(BTreeSet::new());
        }
        Ok(file.done)
    }

    fn mark_done(&self, date: NaiveDate, key: &WorkKey) -> Result<()> {
        // Serialize read-modify-write across concurrent workers
        let _guard = self.lock.lock().map_err(|_| MirrorError::StateCorrupt {
            path: self.path.display().to_string(),
            message: "progress lock poisoned".to_string(),
        })?;

        let mut file = match self.read() {
            Ok(file) if file.date == Some(date) => file,
            Ok(_) => ProgressFile::default(),
            Err(e @ MirrorError::StateCorrupt { .. }) => {
                tracing::warn!(error = %e, "Replacing unreadable progress file");
                ProgressFile::default()
            }
            Err(e) => return Err(e),
        };
        file.date = Some(date);
        file.done.insert(key.clone());

        write_atomic(&self.path, &serde_json::to_string_pretty(&file)?)
    }
}

/// In-memory progress store.
#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    days: Mutex<BTreeMap<NaiveDate, BTreeSet<WorkKey>>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<NaiveDate, BTreeSet<WorkKey>>>> {
        self.days.lock().map_err(|_| MirrorError::StateCorrupt {
            path: "<memory>".to_string(),
            message: "progress lock poisoned".to_string(),
        })
    }
}

impl ProgressStore for MemoryProgressStore {
    fn load(&self, date: NaiveDate) -> Result<BTreeSet<WorkKey>> {
        Ok(self.lock()?.get(&date).cloned().unwrap_or_default())
    }

    fn mark_done(&self, date: NaiveDate, key: &WorkKey) -> Result<()> {
        self.lock()?.entry(date).or_default().insert(key.clone());
        Ok(())
    }
}
