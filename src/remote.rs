//! Remote persistence service boundary.
//!
//! The remote store is authoritative. All writes are idempotent by task id:
//! upserting the same record twice, or deleting an already-deleted record, is a
//! no-op beyond the first application.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::task::{Task, TaskPatch};

/// CRUD over task records, keyed by id and queryable by trip.
#[async_trait]
pub trait RemoteTaskStore: Send + Sync {
    /// Authoritative task list for a trip.
    async fn fetch_trip(&self, trip_id: &str) -> Result<Vec<Task>>;

    /// Create or replace a task by id.
    async fn upsert(&self, task: &Task) -> Result<()>;

    /// Apply a field-level change set to an existing task.
    async fn patch(&self, task_id: &str, patch: &TaskPatch) -> Result<()>;

    /// Delete a task; deleting a missing task succeeds.
    async fn delete(&self, task_id: &str) -> Result<()>;
}

/// JSON-over-HTTP client for the remote task service.
///
/// | Operation | Request |
/// |-----------|---------|
/// | fetch     | `GET {base}/trips/{trip_id}/tasks` |
/// | upsert    | `PUT {base}/tasks/{id}` |
/// | patch     | `PATCH {base}/tasks/{id}` |
/// | delete    | `DELETE {base}/tasks/{id}` |
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: Client,
    base_url: String,
}

impl HttpRemote {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::InvalidInput(format!("HTTP client: {e}")))?;
        Ok(HttpRemote {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn task_url(&self, task_id: &str) -> String {
        format!("{}/tasks/{}", self.base_url, task_id)
    }
}

/// Classify a non-success response: client errors are rejections, the rest retryable.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    };
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => Err(Error::Network(message)),
        s if s.is_client_error() => Err(Error::Validation(message)),
        _ => Err(Error::Network(message)),
    }
}

#[async_trait]
impl RemoteTaskStore for HttpRemote {
    #[instrument(skip(self))]
    async fn fetch_trip(&self, trip_id: &str) -> Result<Vec<Task>> {
        let url = format!("{}/trips/{}/tasks", self.base_url, trip_id);
        let response = check_status(self.client.get(&url).send().await?).await?;
        let tasks: Vec<Task> = response.json().await?;
        debug!(count = tasks.len(), "Fetched remote tasks");
        Ok(tasks)
    }

    #[instrument(skip(self, task), fields(task = %task.id))]
    async fn upsert(&self, task: &Task) -> Result<()> {
        let body = task.for_remote();
        check_status(self.client.put(self.task_url(&task.id)).json(&body).send().await?).await?;
        Ok(())
    }

    #[instrument(skip(self, patch))]
    async fn patch(&self, task_id: &str, patch: &TaskPatch) -> Result<()> {
        check_status(self.client.patch(self.task_url(task_id)).json(patch).send().await?).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, task_id: &str) -> Result<()> {
        let response = self.client.delete(self.task_url(task_id)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(response).await?;
        Ok(())
    }
}

/// Stand-in used when no remote is configured: every call is a network failure,
/// so mutations stay queued until a remote becomes available.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisconnectedRemote;

#[async_trait]
impl RemoteTaskStore for DisconnectedRemote {
    async fn fetch_trip(&self, _trip_id: &str) -> Result<Vec<Task>> {
        Err(Error::Network("no remote configured".into()))
    }

    async fn upsert(&self, _task: &Task) -> Result<()> {
        Err(Error::Network("no remote configured".into()))
    }

    async fn patch(&self, _task_id: &str, _patch: &TaskPatch) -> Result<()> {
        Err(Error::Network("no remote configured".into()))
    }

    async fn delete(&self, _task_id: &str) -> Result<()> {
        Err(Error::Network("no remote configured".into()))
    }
}

/// In-process remote with failure injection.
#[derive(Debug, Default)]
pub struct InMemoryRemote {
    tasks: Mutex<BTreeMap<String, Task>>,
    rejected: Mutex<BTreeSet<String>>,
    offline: AtomicBool,
    writes: AtomicUsize,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a record directly in the remote, bypassing the write counter.
    pub fn seed(&self, task: Task) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.insert(task.id.clone(), task.for_remote());
        }
    }

    /// Make every call fail with a network error while `offline` is set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Reject every write touching `task_id` with a validation error.
    pub fn reject(&self, task_id: &str) {
        if let Ok(mut rejected) = self.rejected.lock() {
            rejected.insert(task_id.to_string());
        }
    }

    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.tasks.lock().ok()?.get(task_id).cloned()
    }

    pub fn all(&self) -> Vec<Task> {
        self.tasks
            .lock()
            .map(|tasks| tasks.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of successful writes applied.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_write(&self, task_id: &str) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Network("remote unreachable".into()));
        }
        let rejected = self
            .rejected
            .lock()
            .map_err(|_| Error::Network("remote lock poisoned".into()))?;
        if rejected.contains(task_id) {
            return Err(Error::Validation(format!("task {task_id} rejected")));
        }
        Ok(())
    }

    fn with_tasks<T>(&self, f: impl FnOnce(&mut BTreeMap<String, Task>) -> T) -> Result<T> {
        let mut tasks = self
            .tasks
            .lock()
            .map_err(|_| Error::Network("remote lock poisoned".into()))?;
        Ok(f(&mut tasks))
    }
}

#[async_trait]
impl RemoteTaskStore for InMemoryRemote {
    async fn fetch_trip(&self, trip_id: &str) -> Result<Vec<Task>> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Network("remote unreachable".into()));
        }
        self.with_tasks(|tasks| tasks.values().filter(|t| t.trip_id == trip_id).cloned().collect())
    }

    async fn upsert(&self, task: &Task) -> Result<()> {
        self.check_write(&task.id)?;
        self.with_tasks(|tasks| tasks.insert(task.id.clone(), task.for_remote()))?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn patch(&self, task_id: &str, patch: &TaskPatch) -> Result<()> {
        self.check_write(task_id)?;
        let found = self.with_tasks(|tasks| match tasks.get_mut(task_id) {
            Some(task) => {
                patch.apply(task);
                true
            }
            None => false,
        })?;
        if !found {
            return Err(Error::Validation(format!("task {task_id} does not exist")));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, task_id: &str) -> Result<()> {
        self.check_write(task_id)?;
        self.with_tasks(|tasks| tasks.remove(task_id))?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::NewTask;
    use chrono::Utc;

    #[tokio::test]
    async fn test_in_memory_remote_is_idempotent() {
        let remote = InMemoryRemote::new();
        let task = Task::new("trip", NewTask::titled("Book hotel"), Utc::now());
        remote.upsert(&task).await.unwrap();
        remote.upsert(&task).await.unwrap();
        assert_eq!(remote.fetch_trip("trip").await.unwrap().len(), 1);

        remote.delete(&task.id).await.unwrap();
        remote.delete(&task.id).await.unwrap();
        assert!(remote.fetch_trip("trip").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_in_memory_remote_failure_injection() {
        let remote = InMemoryRemote::new();
        let task = Task::new("trip", NewTask::titled("Book hotel"), Utc::now());

        remote.set_offline(true);
        assert!(matches!(remote.upsert(&task).await, Err(Error::Network(_))));
        remote.set_offline(false);

        remote.reject(&task.id);
        assert!(matches!(remote.upsert(&task).await, Err(Error::Validation(_))));
        assert_eq!(remote.write_count(), 0);
    }

    #[tokio::test]
    async fn test_patch_missing_task_is_rejected() {
        let remote = InMemoryRemote::new();
        let patch = TaskPatch {
            is_completed: Some(true),
            ..Default::default()
        };
        assert!(matches!(remote.patch("ghost", &patch).await, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_disconnected_remote_is_always_retryable() {
        let err = DisconnectedRemote.fetch_trip("trip").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
