//! Durable pending action queue.
//!
//! Every local mutation is appended here before any remote attempt. The queue is
//! the intent log; the local task store is the materialised view. Entries leave
//! the queue only when the remote confirms them (or when explicitly dropped).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::fields::ActionType;
use crate::store::write_atomic;
use crate::task::{Task, TaskPatch};

/// What an action asks the remote to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum ActionPayload {
    Add { task: Task },
    Update { patch: TaskPatch },
    Delete,
}

/// One queued mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAction {
    pub id: String,
    pub trip_id: String,
    pub task_id: String,
    pub payload: ActionPayload,
    pub timestamp: DateTime<Utc>,
    /// Enqueue sequence; breaks timestamp ties.
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Dead-lettered: skipped by flushes until requeued.
    #[serde(default)]
    pub dead: bool,
}

impl PendingAction {
    fn new(trip_id: &str, task_id: &str, payload: ActionPayload, timestamp: DateTime<Utc>) -> Self {
        PendingAction {
            id: Uuid::new_v4().to_string(),
            trip_id: trip_id.to_string(),
            task_id: task_id.to_string(),
            payload,
            timestamp,
            seq: 0,
            attempts: 0,
            next_attempt_at: None,
            last_error: None,
            dead: false,
        }
    }

    pub fn add(task: &Task, timestamp: DateTime<Utc>) -> Self {
        Self::new(
            &task.trip_id,
            &task.id,
            ActionPayload::Add { task: task.for_remote() },
            timestamp,
        )
    }

    pub fn update(trip_id: &str, task_id: &str, patch: TaskPatch, timestamp: DateTime<Utc>) -> Self {
        Self::new(trip_id, task_id, ActionPayload::Update { patch }, timestamp)
    }

    pub fn delete(trip_id: &str, task_id: &str, timestamp: DateTime<Utc>) -> Self {
        Self::new(trip_id, task_id, ActionPayload::Delete, timestamp)
    }

    pub fn action_type(&self) -> ActionType {
        match self.payload {
            ActionPayload::Add { .. } => ActionType::Add,
            ActionPayload::Update { .. } => ActionType::Update,
            ActionPayload::Delete => ActionType::Delete,
        }
    }

    /// Whether a flush at `now` should attempt this action.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.dead && self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

/// Bounded exponential backoff with a dead-letter threshold for rejected actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Validation failures at or beyond this many attempts dead-letter the action.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 8,
            base_backoff: Duration::seconds(30),
            max_backoff: Duration::hours(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `attempts` failures.
    pub fn backoff(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::zero();
        }
        let factor = 1i32.checked_shl(attempts.saturating_sub(1).min(30)).unwrap_or(i32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }
}

/// Result of recording a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Will be retried at the given time.
    Retry(DateTime<Utc>),
    DeadLettered,
    /// The action was no longer in the queue.
    Gone,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueFile {
    #[serde(default)]
    next_seq: u64,
    actions: Vec<PendingAction>,
}

/// Durable, ordered log of unconfirmed mutations.
#[derive(Debug)]
pub struct PendingQueue {
    path: Option<PathBuf>,
    state: Mutex<QueueFile>,
}

impl PendingQueue {
    /// Open the queue file at `path`, starting empty if it doesn't exist yet.
    pub fn open(path: &Path) -> Result<Self> {
        let state = if path.exists() {
            let raw = fs::read_to_string(path)
                .map_err(|e| Error::LocalStore(format!("read {}: {e}", path.display())))?;
            serde_json::from_str(&raw)
                .map_err(|e| Error::LocalStore(format!("parse {}: {e}", path.display())))?
        } else {
            QueueFile::default()
        };
        Ok(PendingQueue {
            path: Some(path.to_path_buf()),
            state: Mutex::new(state),
        })
    }

    /// A queue that lives only for this process.
    pub fn in_memory() -> Self {
        PendingQueue {
            path: None,
            state: Mutex::new(QueueFile::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueFile>> {
        self.state
            .lock()
            .map_err(|_| Error::LocalStore("pending queue lock poisoned".into()))
    }

    fn persist(&self, state: &QueueFile) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        write_atomic(path, &serde_json::to_string_pretty(state)?)
            .map_err(|e| Error::LocalStore(format!("write {}: {e}", path.display())))
    }

    /// Durably append an action.
    ///
    /// Timestamps are clamped so they never run backwards relative to the last
    /// queued entry, keeping timestamp order equal to causal order.
    pub fn enqueue(&self, mut action: PendingAction) -> Result<PendingAction> {
        let mut state = self.lock()?;
        if let Some(latest) = state.actions.iter().map(|a| a.timestamp).max() {
            if action.timestamp < latest {
                action.timestamp = latest;
            }
        }
        action.seq = state.next_seq;
        state.next_seq += 1;
        state.actions.push(action.clone());
        debug!(action = %action.id, task = %action.task_id, kind = ?action.action_type(), "Queued action");
        if let Err(e) = self.persist(&state) {
            warn!(error = %e, "Pending queue not persisted; action kept in memory");
            return Err(e);
        }
        Ok(action)
    }

    /// All entries in ascending (timestamp, seq) order, dead-lettered included.
    pub fn drain_ordered(&self) -> Result<Vec<PendingAction>> {
        let mut actions = self.lock()?.actions.clone();
        actions.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.seq.cmp(&b.seq)));
        Ok(actions)
    }

    /// Remove an action once the remote has confirmed it.
    pub fn remove(&self, action_id: &str) -> Result<bool> {
        let mut state = self.lock()?;
        let before = state.actions.len();
        state.actions.retain(|a| a.id != action_id);
        let removed = state.actions.len() != before;
        if removed {
            self.persist(&state)?;
        }
        Ok(removed)
    }

    pub fn clear(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.actions.clear();
        self.persist(&state)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.actions.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Ordered actions for one trip, dead-lettered included.
    pub fn for_trip(&self, trip_id: &str) -> Result<Vec<PendingAction>> {
        Ok(self
            .drain_ordered()?
            .into_iter()
            .filter(|a| a.trip_id == trip_id)
            .collect())
    }

    /// Record a failed remote attempt and schedule the retry or dead-letter it.
    pub fn record_failure(
        &self,
        action_id: &str,
        error: &Error,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome> {
        let mut state = self.lock()?;
        let Some(action) = state.actions.iter_mut().find(|a| a.id == action_id) else {
            return Ok(FailureOutcome::Gone);
        };
        action.attempts = action.attempts.saturating_add(1);
        action.last_error = Some(error.to_string());

        let outcome = if !error.is_retryable() && action.attempts >= policy.max_attempts {
            action.dead = true;
            action.next_attempt_at = None;
            FailureOutcome::DeadLettered
        } else {
            let at = now + policy.backoff(action.attempts);
            action.next_attempt_at = Some(at);
            FailureOutcome::Retry(at)
        };
        self.persist(&state)?;
        Ok(outcome)
    }

    /// Return a dead-lettered (or backed-off) action to immediate eligibility.
    pub fn requeue(&self, action_id: &str) -> Result<bool> {
        let mut state = self.lock()?;
        let Some(action) = state.actions.iter_mut().find(|a| a.id == action_id) else {
            return Ok(false);
        };
        action.dead = false;
        action.attempts = 0;
        action.next_attempt_at = None;
        self.persist(&state)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::NewTask;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    fn sample_task() -> Task {
        Task::new("trip", NewTask::titled("Renew passport"), at(0))
    }

    #[test]
    fn test_drain_orders_by_timestamp_then_seq() {
        let q = PendingQueue::in_memory();
        let t = sample_task();
        let add = q.enqueue(PendingAction::add(&t, at(10))).unwrap();
        let upd = q
            .enqueue(PendingAction::update("trip", &t.id, TaskPatch::default(), at(10)))
            .unwrap();
        let del = q.enqueue(PendingAction::delete("trip", &t.id, at(20))).unwrap();

        let ids: Vec<String> = q.drain_ordered().unwrap().into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![add.id, upd.id, del.id]);
    }

    #[test]
    fn test_enqueue_clamps_backwards_clock() {
        let q = PendingQueue::in_memory();
        let t = sample_task();
        q.enqueue(PendingAction::add(&t, at(100))).unwrap();
        let later = q
            .enqueue(PendingAction::update("trip", &t.id, TaskPatch::default(), at(50)))
            .unwrap();
        assert_eq!(later.timestamp, at(100));
        let drained = q.drain_ordered().unwrap();
        assert_eq!(drained[0].action_type(), ActionType::Add);
        assert_eq!(drained[1].action_type(), ActionType::Update);
    }

    #[test]
    fn test_remove_and_clear() {
        let q = PendingQueue::in_memory();
        let t = sample_task();
        let a = q.enqueue(PendingAction::add(&t, at(1))).unwrap();
        q.enqueue(PendingAction::delete("trip", &t.id, at(2))).unwrap();
        assert!(q.remove(&a.id).unwrap());
        assert!(!q.remove(&a.id).unwrap());
        assert_eq!(q.len().unwrap(), 1);
        q.clear().unwrap();
        assert!(q.is_empty().unwrap());
    }

    #[test]
    fn test_queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pending_actions.json");
        let t = sample_task();
        {
            let q = PendingQueue::open(&path).unwrap();
            q.enqueue(PendingAction::add(&t, at(1))).unwrap();
            q.enqueue(PendingAction::delete("trip", &t.id, at(2))).unwrap();
        }
        let q = PendingQueue::open(&path).unwrap();
        let drained = q.drain_ordered().unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].payload, ActionPayload::Add { task: t.clone() });
        // Sequence numbering continues after reopen.
        let next = q.enqueue(PendingAction::delete("trip", &t.id, at(3))).unwrap();
        assert_eq!(next.seq, 2);
    }

    #[test]
    fn test_backoff_is_bounded() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::seconds(10),
            max_backoff: Duration::seconds(60),
        };
        assert_eq!(policy.backoff(0), Duration::zero());
        assert_eq!(policy.backoff(1), Duration::seconds(10));
        assert_eq!(policy.backoff(2), Duration::seconds(20));
        assert_eq!(policy.backoff(3), Duration::seconds(40));
        assert_eq!(policy.backoff(4), Duration::seconds(60));
        assert_eq!(policy.backoff(200), Duration::seconds(60));
    }

    #[test]
    fn test_validation_failures_dead_letter_after_max_attempts() {
        let q = PendingQueue::in_memory();
        let policy = RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        };
        let a = q.enqueue(PendingAction::add(&sample_task(), at(0))).unwrap();
        let rejected = Error::Validation("title too long".into());

        let first = q.record_failure(&a.id, &rejected, &policy, at(0)).unwrap();
        assert_eq!(first, FailureOutcome::Retry(at(30)));
        assert!(!q.drain_ordered().unwrap()[0].is_due(at(29)));

        let second = q.record_failure(&a.id, &rejected, &policy, at(30)).unwrap();
        assert_eq!(second, FailureOutcome::DeadLettered);
        let drained = q.drain_ordered().unwrap();
        let stored = &drained[0];
        assert!(stored.dead);
        assert!(!stored.is_due(at(10_000)));
        assert!(q.for_trip("trip").unwrap()[0].dead);
        assert!(q.for_trip("elsewhere").unwrap().is_empty());

        assert!(q.requeue(&a.id).unwrap());
        assert!(q.drain_ordered().unwrap()[0].is_due(at(0)));
    }

    #[test]
    fn test_network_failures_never_dead_letter() {
        let q = PendingQueue::in_memory();
        let policy = RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        };
        let a = q.enqueue(PendingAction::add(&sample_task(), at(0))).unwrap();
        for _ in 0..5 {
            let outcome = q
                .record_failure(&a.id, &Error::Network("offline".into()), &policy, at(0))
                .unwrap();
            assert!(matches!(outcome, FailureOutcome::Retry(_)));
        }
        assert_eq!(q.drain_ordered().unwrap()[0].attempts, 5);
    }
}
