//! Local task store.
//!
//! The store is the on-device materialised view of every trip's tasks. Writes
//! are plain upserts and deletes by id with no field-level merging: the store
//! always holds whatever the caller wrote last. `JsonTaskStore` persists to a
//! single JSON file with an atomic temp-file + rename write; `MemoryTaskStore`
//! keeps the same index without touching disk.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::task::Task;

/// Contract for the durable local task cache.
pub trait TaskStore: Send + Sync {
    /// Insert or wholly replace the task with the same id.
    fn upsert(&self, task: &Task) -> Result<()>;

    /// Remove a task, returning it if it existed.
    fn remove(&self, id: &str) -> Result<Option<Task>>;

    fn get(&self, id: &str) -> Result<Option<Task>>;

    fn get_all(&self) -> Result<Vec<Task>>;

    fn get_by_trip(&self, trip_id: &str) -> Result<Vec<Task>>;

    /// Make the trip's stored tasks exactly `tasks`.
    fn replace_trip(&self, trip_id: &str, tasks: &[Task]) -> Result<()> {
        let keep: BTreeSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        for existing in self.get_by_trip(trip_id)? {
            if !keep.contains(existing.id.as_str()) {
                self.remove(&existing.id)?;
            }
        }
        for task in tasks {
            self.upsert(task)?;
        }
        Ok(())
    }
}

/// Primary map keyed by task id with a secondary trip index.
#[derive(Debug, Default)]
struct TaskIndex {
    tasks: BTreeMap<String, Task>,
    by_trip: BTreeMap<String, BTreeSet<String>>,
}

impl TaskIndex {
    fn from_tasks(tasks: Vec<Task>) -> Self {
        let mut index = TaskIndex::default();
        for task in tasks {
            index.upsert(task);
        }
        index
    }

    fn upsert(&mut self, task: Task) {
        if let Some(previous) = self.tasks.get(&task.id) {
            if previous.trip_id != task.trip_id {
                let old_trip = previous.trip_id.clone();
                self.unlink(&old_trip, &task.id);
            }
        }
        self.by_trip
            .entry(task.trip_id.clone())
            .or_default()
            .insert(task.id.clone());
        self.tasks.insert(task.id.clone(), task);
    }

    fn remove(&mut self, id: &str) -> Option<Task> {
        let task = self.tasks.remove(id)?;
        self.unlink(&task.trip_id, id);
        Some(task)
    }

    fn unlink(&mut self, trip_id: &str, id: &str) {
        if let Some(ids) = self.by_trip.get_mut(trip_id) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_trip.remove(trip_id);
            }
        }
    }

    fn by_trip(&self, trip_id: &str) -> Vec<Task> {
        self.by_trip
            .get(trip_id)
            .map(|ids| ids.iter().filter_map(|id| self.tasks.get(id).cloned()).collect())
            .unwrap_or_default()
    }
}

/// On-disk layout of the store file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    tasks: Vec<Task>,
}

fn lock(index: &Mutex<TaskIndex>) -> Result<MutexGuard<'_, TaskIndex>> {
    index
        .lock()
        .map_err(|_| Error::LocalStore("task index lock poisoned".into()))
}

/// File-backed task store.
#[derive(Debug)]
pub struct JsonTaskStore {
    path: PathBuf,
    index: Mutex<TaskIndex>,
}

impl JsonTaskStore {
    /// Open the store at `path`, starting empty if the file doesn't exist yet.
    pub fn open(path: &Path) -> Result<Self> {
        let tasks = if path.exists() {
            let raw = fs::read_to_string(path)
                .map_err(|e| Error::LocalStore(format!("read {}: {e}", path.display())))?;
            let file: StoreFile = serde_json::from_str(&raw)
                .map_err(|e| Error::LocalStore(format!("parse {}: {e}", path.display())))?;
            file.tasks
        } else {
            Vec::new()
        };
        debug!(path = %path.display(), count = tasks.len(), "Opened local task store");
        Ok(JsonTaskStore {
            path: path.to_path_buf(),
            index: Mutex::new(TaskIndex::from_tasks(tasks)),
        })
    }

    fn save(&self, index: &TaskIndex) -> Result<()> {
        let file = StoreFile {
            tasks: index.tasks.values().cloned().collect(),
        };
        write_atomic(&self.path, &serde_json::to_string_pretty(&file)?)
            .map_err(|e| Error::LocalStore(format!("write {}: {e}", self.path.display())))
    }
}

/// Write `data` to `path` via a temp file and rename.
pub(crate) fn write_atomic(path: &Path, data: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let mut f = File::create(&tmp)?;
    f.write_all(data.as_bytes())?;
    f.sync_all()?;
    fs::rename(tmp, path)
}

impl TaskStore for JsonTaskStore {
    fn upsert(&self, task: &Task) -> Result<()> {
        let mut index = lock(&self.index)?;
        index.upsert(task.clone());
        self.save(&index)
    }

    fn remove(&self, id: &str) -> Result<Option<Task>> {
        let mut index = lock(&self.index)?;
        let removed = index.remove(id);
        if removed.is_some() {
            self.save(&index)?;
        }
        Ok(removed)
    }

    fn get(&self, id: &str) -> Result<Option<Task>> {
        Ok(lock(&self.index)?.tasks.get(id).cloned())
    }

    fn get_all(&self) -> Result<Vec<Task>> {
        Ok(lock(&self.index)?.tasks.values().cloned().collect())
    }

    fn get_by_trip(&self, trip_id: &str) -> Result<Vec<Task>> {
        Ok(lock(&self.index)?.by_trip(trip_id))
    }

    fn replace_trip(&self, trip_id: &str, tasks: &[Task]) -> Result<()> {
        // Single write for the whole trip instead of one per task.
        let mut index = lock(&self.index)?;
        for existing in index.by_trip(trip_id) {
            index.remove(&existing.id);
        }
        for task in tasks {
            index.upsert(task.clone());
        }
        self.save(&index)
    }
}

/// Non-durable task store, used when the file store can't be opened and in tests.
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    index: Mutex<TaskIndex>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for MemoryTaskStore {
    fn upsert(&self, task: &Task) -> Result<()> {
        lock(&self.index)?.upsert(task.clone());
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<Option<Task>> {
        Ok(lock(&self.index)?.remove(id))
    }

    fn get(&self, id: &str) -> Result<Option<Task>> {
        Ok(lock(&self.index)?.tasks.get(id).cloned())
    }

    fn get_all(&self) -> Result<Vec<Task>> {
        Ok(lock(&self.index)?.tasks.values().cloned().collect())
    }

    fn get_by_trip(&self, trip_id: &str) -> Result<Vec<Task>> {
        Ok(lock(&self.index)?.by_trip(trip_id))
    }
}
