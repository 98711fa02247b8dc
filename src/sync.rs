//! Sync engine: queue replay and reconciliation against the remote store.
//!
//! All passes run behind one async gate. A flush requested while another pass
//! holds the gate is coalesced: it sets a rerun flag and returns immediately, and
//! the pass holding the gate runs once more before releasing. Background
//! failures are logged here and never propagated as fatal.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::queue::{ActionPayload, FailureOutcome, PendingAction, PendingQueue, RetryPolicy};
use crate::remote::RemoteTaskStore;
use crate::rules::{rule_task_id, RuleSet};
use crate::store::TaskStore;
use crate::task::Task;
use crate::trip::TripSnapshot;

/// Tuning for queue replay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncConfig {
    pub retry: RetryPolicy,
}

/// Outcome of one or more flush passes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Actions confirmed by the remote and removed from the queue.
    pub applied: usize,
    /// Actions that failed and were scheduled for retry.
    pub failed: usize,
    /// Actions skipped this pass (backing off, or behind a failed action for the same task).
    pub deferred: usize,
    pub dead_lettered: usize,
    /// Queue length when the pass finished.
    pub remaining: usize,
    /// The request was folded into a pass already in flight.
    pub coalesced: bool,
}

impl FlushReport {
    fn merge(&mut self, other: FlushReport) {
        self.applied += other.applied;
        self.failed += other.failed;
        self.deferred += other.deferred;
        self.dead_lettered += other.dead_lettered;
        self.remaining = other.remaining;
    }
}

/// Reconciles the local store and pending queue with the remote store.
pub struct SyncEngine {
    local: Arc<dyn TaskStore>,
    queue: Arc<PendingQueue>,
    remote: Arc<dyn RemoteTaskStore>,
    rules: RuleSet,
    config: SyncConfig,
    gate: Mutex<()>,
    rerun: AtomicBool,
}

impl SyncEngine {
    pub fn new(
        local: Arc<dyn TaskStore>,
        queue: Arc<PendingQueue>,
        remote: Arc<dyn RemoteTaskStore>,
        rules: RuleSet,
        config: SyncConfig,
    ) -> Self {
        SyncEngine {
            local,
            queue,
            remote,
            rules,
            config,
            gate: Mutex::new(()),
            rerun: AtomicBool::new(false),
        }
    }

    pub fn queue(&self) -> &Arc<PendingQueue> {
        &self.queue
    }

    /// Whether a flush or reconcile pass is currently running.
    pub fn is_syncing(&self) -> bool {
        self.gate.try_lock().is_err()
    }

    /// Replay queued actions against the remote in timestamp order.
    ///
    /// Each confirmed action is removed; a failed action stays queued with its
    /// retry scheduled, later actions for the same task wait behind it, and
    /// actions for other tasks proceed.
    pub async fn flush_queue(&self) -> Result<FlushReport> {
        let mut total = FlushReport::default();
        loop {
            let Ok(guard) = self.gate.try_lock() else {
                self.rerun.store(true, Ordering::SeqCst);
                debug!("Flush coalesced into running pass");
                total.coalesced = true;
                return Ok(total);
            };
            self.rerun.store(false, Ordering::SeqCst);
            let report = self.flush_pass(Utc::now()).await?;
            total.merge(report);
            drop(guard);

            if !self.rerun.swap(false, Ordering::SeqCst) {
                break;
            }
        }
        if total.applied > 0 || total.failed > 0 {
            info!(
                applied = total.applied,
                failed = total.failed,
                dead_lettered = total.dead_lettered,
                remaining = total.remaining,
                "Flushed pending actions"
            );
        }
        Ok(total)
    }

    async fn flush_pass(&self, now: DateTime<Utc>) -> Result<FlushReport> {
        let mut report = FlushReport::default();
        let mut blocked: HashSet<String> = HashSet::new();

        for action in self.queue.drain_ordered()? {
            if blocked.contains(&action.task_id) || !action.is_due(now) {
                blocked.insert(action.task_id.clone());
                report.deferred += 1;
                continue;
            }

            match self.apply_remote(&action).await {
                Ok(()) => {
                    debug!(action = %action.id, task = %action.task_id, kind = ?action.action_type(), "Applied remotely");
                    if let Err(e) = self.queue.remove(&action.id) {
                        warn!(action = %action.id, error = %e, "Confirmed action not removed from queue");
                    }
                    self.mark_synced(&action, now);
                    report.applied += 1;
                }
                Err(err) => {
                    warn!(action = %action.id, task = %action.task_id, error = %err, "Remote apply failed");
                    blocked.insert(action.task_id.clone());
                    match self.queue.record_failure(&action.id, &err, &self.config.retry, now) {
                        Ok(FailureOutcome::DeadLettered) => {
                            warn!(action = %action.id, "Action dead-lettered after repeated rejection");
                            report.dead_lettered += 1;
                        }
                        Ok(_) => report.failed += 1,
                        Err(e) => {
                            warn!(action = %action.id, error = %e, "Failed to record retry state");
                            report.failed += 1;
                        }
                    }
                }
            }
        }

        report.remaining = self.queue.len()?;
        Ok(report)
    }

    async fn apply_remote(&self, action: &PendingAction) -> Result<()> {
        match action.payload {
            ActionPayload::Add { ref task } => self.remote.upsert(task).await,
            ActionPayload::Update { ref patch } => self.remote.patch(&action.task_id, patch).await,
            ActionPayload::Delete => self.remote.delete(&action.task_id).await,
        }
    }

    fn mark_synced(&self, action: &PendingAction, now: DateTime<Utc>) {
        if matches!(action.payload, ActionPayload::Delete) {
            return;
        }
        match self.local.get(&action.task_id) {
            Ok(Some(mut task)) => {
                task.synced_at = Some(now);
                if let Err(e) = self.local.upsert(&task) {
                    warn!(task = %task.id, error = %e, "Could not record sync time locally");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(task = %action.task_id, error = %e, "Local store read failed"),
        }
    }

    /// Produce the canonical task list for a trip.
    ///
    /// Pushes queued work first, then merges the remote list with tasks that
    /// still have live pending actions (local wins for those, pending deletes
    /// hide them), adds tasks newly implied by the trip context, and retires
    /// incomplete generated tasks whose rule no longer applies. The local store
    /// is rewritten for the trip to match the result.
    #[instrument(skip(self, snapshot))]
    pub async fn reconcile(&self, trip_id: &str, snapshot: &TripSnapshot) -> Result<Vec<Task>> {
        let result = {
            let _guard = self.gate.lock().await;
            self.reconcile_locked(trip_id, snapshot).await
        };
        if self.rerun.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.flush_queue().await {
                warn!(error = %e, "Deferred flush after reconcile failed");
            }
        }
        result
    }

    async fn reconcile_locked(&self, trip_id: &str, snapshot: &TripSnapshot) -> Result<Vec<Task>> {
        let now = Utc::now();
        if let Err(e) = self.flush_pass(now).await {
            warn!(error = %e, "Pre-reconcile flush failed");
        }

        let remote_tasks = self.remote.fetch_trip(trip_id).await?;
        let local_tasks: BTreeMap<String, Task> = match self.local.get_by_trip(trip_id) {
            Ok(tasks) => tasks.into_iter().map(|t| (t.id.clone(), t)).collect(),
            Err(e) => {
                warn!(error = %e, "Local store unreadable during reconcile");
                BTreeMap::new()
            }
        };
        // Dead-lettered actions still describe local intent; only flushing skips them.
        let pending = self.queue.for_trip(trip_id)?;

        let mut merged: BTreeMap<String, Task> = remote_tasks
            .into_iter()
            .map(|mut t| {
                t.synced_at = Some(now);
                (t.id.clone(), t)
            })
            .collect();

        // Last pending action per task decides how local intent overlays remote.
        let mut last_pending: BTreeMap<&str, &PendingAction> = BTreeMap::new();
        for action in &pending {
            last_pending.insert(action.task_id.as_str(), action);
        }
        for (task_id, action) in &last_pending {
            match action.payload {
                ActionPayload::Delete => {
                    merged.remove(*task_id);
                }
                ActionPayload::Add { ref task } => {
                    let local = local_tasks.get(*task_id).cloned().unwrap_or_else(|| task.clone());
                    merged.insert(task_id.to_string(), local);
                }
                ActionPayload::Update { ref patch } => {
                    if let Some(local) = local_tasks.get(*task_id) {
                        merged.insert(task_id.to_string(), local.clone());
                    } else if let Some(remote) = merged.get_mut(*task_id) {
                        patch.apply(remote);
                    }
                }
            }
        }

        let mut new_actions = Vec::new();
        if snapshot.trip.id == trip_id {
            let generated = self.rules.generate(snapshot);
            let wanted: BTreeSet<&str> = generated.iter().map(|r| r.rule_id.as_str()).collect();

            let retired: Vec<String> = merged
                .values()
                .filter(|t| !t.is_completed)
                .filter(|t| t.rule_id.as_deref().is_some_and(|r| !wanted.contains(r)))
                .map(|t| t.id.clone())
                .collect();
            for id in retired {
                merged.remove(&id);
                debug!(task = %id, "Retiring generated task");
                new_actions.push(PendingAction::delete(trip_id, &id, now));
            }

            for rule in generated {
                let id = rule_task_id(trip_id, &rule.rule_id);
                let pending_delete = last_pending
                    .get(id.as_str())
                    .is_some_and(|a| matches!(a.payload, ActionPayload::Delete));
                if merged.contains_key(&id) || pending_delete {
                    continue;
                }
                let task = rule.into_task(trip_id, now);
                debug!(task = %task.id, rule = ?task.rule_id, "Generated task from trip context");
                new_actions.push(PendingAction::add(&task, now));
                merged.insert(id, task);
            }
        } else {
            warn!(snapshot_trip = %snapshot.trip.id, "Trip context doesn't match trip; skipping rule generation");
        }

        let tasks: Vec<Task> = merged.into_values().collect();
        if let Err(e) = self.local.replace_trip(trip_id, &tasks) {
            warn!(error = %e, "Local store not updated after reconcile");
        }

        if !new_actions.is_empty() {
            for action in new_actions {
                if let Err(e) = self.queue.enqueue(action) {
                    warn!(error = %e, "Generated change not queued durably");
                }
            }
            if let Err(e) = self.flush_pass(now).await {
                warn!(error = %e, "Post-reconcile flush failed");
            }
        }

        // Re-read so sync stamps from the final flush are reflected.
        let mut canonical = match self.local.get_by_trip(trip_id) {
            Ok(stored) => stored,
            Err(_) => tasks,
        };
        canonical.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        info!(count = canonical.len(), "Reconciled trip tasks");
        Ok(canonical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::remote::InMemoryRemote;
    use crate::store::MemoryTaskStore;
    use crate::task::{NewTask, TaskPatch};
    use crate::trip::{Destination, Trip};
    use chrono::{Duration, NaiveDate};

    struct Harness {
        local: Arc<MemoryTaskStore>,
        queue: Arc<PendingQueue>,
        remote: Arc<InMemoryRemote>,
        engine: SyncEngine,
    }

    fn harness() -> Harness {
        let local = Arc::new(MemoryTaskStore::new());
        let queue = Arc::new(PendingQueue::in_memory());
        let remote = Arc::new(InMemoryRemote::new());
        let config = SyncConfig {
            retry: RetryPolicy {
                max_attempts: 2,
                base_backoff: Duration::zero(),
                max_backoff: Duration::zero(),
            },
        };
        let engine = SyncEngine::new(local.clone(), queue.clone(), remote.clone(), RuleSet::default(), config);
        Harness {
            local,
            queue,
            remote,
            engine,
        }
    }

    fn snapshot(home: Option<&str>) -> TripSnapshot {
        TripSnapshot {
            trip: Trip {
                id: "trip".into(),
                name: "Peru".into(),
                start_date: NaiveDate::from_ymd_opt(2030, 1, 1),
                end_date: None,
                home_country: home.map(str::to_string),
                home_currency: None,
                destinations: vec![Destination {
                    city: "Lima".into(),
                    country: "Peru".into(),
                    currency: None,
                    arrival: None,
                    departure: None,
                    health_advisory: false,
                }],
            },
            accommodations: vec![],
            transports: vec![],
        }
    }

    fn local_task(h: &Harness, title: &str) -> Task {
        let task = Task::new("trip", NewTask::titled(title), Utc::now());
        h.local.upsert(&task).unwrap();
        task
    }

    #[tokio::test]
    async fn test_flush_applies_in_order_and_drains() {
        let h = harness();
        let task = local_task(&h, "Pack");
        h.queue.enqueue(PendingAction::add(&task, Utc::now())).unwrap();
        let patch = TaskPatch {
            is_completed: Some(true),
            ..Default::default()
        };
        h.queue
            .enqueue(PendingAction::update("trip", &task.id, patch, Utc::now()))
            .unwrap();

        let report = h.engine.flush_queue().await.unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(report.remaining, 0);
        assert!(h.remote.get(&task.id).unwrap().is_completed);
        assert!(h.local.get(&task.id).unwrap().unwrap().synced_at.is_some());
    }

    #[tokio::test]
    async fn test_failure_blocks_same_task_but_not_others() {
        let h = harness();
        let rejected = local_task(&h, "Rejected");
        let fine = local_task(&h, "Fine");
        h.remote.reject(&rejected.id);

        h.queue.enqueue(PendingAction::add(&rejected, Utc::now())).unwrap();
        h.queue
            .enqueue(PendingAction::update("trip", &rejected.id, TaskPatch::default(), Utc::now()))
            .unwrap();
        h.queue.enqueue(PendingAction::add(&fine, Utc::now())).unwrap();

        let report = h.engine.flush_queue().await.unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(report.remaining, 2);
        assert!(h.remote.get(&fine.id).is_some());

        // Second rejection reaches max_attempts and dead-letters the ADD.
        let report = h.engine.flush_queue().await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        let third = h.engine.flush_queue().await.unwrap();
        assert_eq!(third.applied, 0);
        assert_eq!(third.deferred, 2);
    }

    #[tokio::test]
    async fn test_network_failure_keeps_action_queued() {
        let h = harness();
        let task = local_task(&h, "Offline");
        h.queue.enqueue(PendingAction::add(&task, Utc::now())).unwrap();
        h.remote.set_offline(true);
        let report = h.engine.flush_queue().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(h.queue.len().unwrap(), 1);

        h.remote.set_offline(false);
        let report = h.engine.flush_queue().await.unwrap();
        assert_eq!(report.applied, 1);
        assert!(h.queue.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_replaying_same_action_twice_is_idempotent() {
        let h = harness();
        let task = local_task(&h, "Twice");
        let action = PendingAction::add(&task, Utc::now());
        h.engine.apply_remote(&action).await.unwrap();
        let once = h.remote.all();
        h.engine.apply_remote(&action).await.unwrap();
        assert_eq!(h.remote.all(), once);
    }

    #[tokio::test]
    async fn test_reconcile_merges_remote_pending_and_rules() {
        let h = harness();
        let remote_only = Task::new("trip", NewTask::titled("From another device"), Utc::now());
        h.remote.seed(remote_only.clone());
        let doomed = Task::new("trip", NewTask::titled("Deleted offline"), Utc::now());
        h.remote.seed(doomed.clone());

        h.remote.set_offline(true);
        let offline_add = local_task(&h, "Added offline");
        h.queue.enqueue(PendingAction::add(&offline_add, Utc::now())).unwrap();
        h.queue.enqueue(PendingAction::delete("trip", &doomed.id, Utc::now())).unwrap();

        // Remote unreachable: reconcile fails and leaves local state alone.
        assert!(matches!(
            h.engine.reconcile("trip", &snapshot(Some("Ireland"))).await,
            Err(Error::Network(_))
        ));
        assert_eq!(h.local.get_by_trip("trip").unwrap().len(), 1);

        h.remote.set_offline(false);
        let tasks = h.engine.reconcile("trip", &snapshot(Some("Ireland"))).await.unwrap();
        let titles: BTreeSet<&str> = tasks.iter().map(|t| t.title.as_str()).collect();
        assert!(titles.contains("From another device"));
        assert!(titles.contains("Added offline"));
        assert!(!titles.contains("Deleted offline"));
        assert!(titles.contains("Check passport validity"));
        assert!(titles.contains("Check visa requirements for Peru"));

        assert!(h.queue.is_empty().unwrap());
        assert!(h.remote.get(&rule_task_id("trip", "passport")).is_some());
        assert_eq!(h.local.get_by_trip("trip").unwrap().len(), tasks.len());
        assert!(tasks.iter().all(|t| t.synced_at.is_some()));
    }

    #[tokio::test]
    async fn test_reconcile_keeps_task_whose_add_was_dead_lettered() {
        let h = harness();
        let task = local_task(&h, "Rejected forever");
        h.remote.reject(&task.id);
        h.queue.enqueue(PendingAction::add(&task, Utc::now())).unwrap();
        h.engine.flush_queue().await.unwrap();
        let report = h.engine.flush_queue().await.unwrap();
        assert_eq!(report.dead_lettered, 1);

        let tasks = h.engine.reconcile("trip", &snapshot(None)).await.unwrap();
        assert!(tasks.iter().any(|t| t.id == task.id));
        assert!(h.local.get(&task.id).unwrap().is_some());
        let queued = h.queue.drain_ordered().unwrap();
        assert_eq!(queued.len(), 1);
        assert!(queued[0].dead);
    }

    #[tokio::test]
    async fn test_reconcile_retires_rules_that_no_longer_apply() {
        let h = harness();
        let first = h.engine.reconcile("trip", &snapshot(Some("Ireland"))).await.unwrap();
        assert!(first.iter().any(|t| t.rule_id.as_deref() == Some("visa:peru")));

        // Complete the passport task; completed generated tasks are kept.
        let passport_id = rule_task_id("trip", "passport");
        let mut passport = h.local.get(&passport_id).unwrap().unwrap();
        passport.is_completed = true;
        h.local.upsert(&passport).unwrap();
        let patch = TaskPatch {
            is_completed: Some(true),
            ..Default::default()
        };
        h.queue
            .enqueue(PendingAction::update("trip", &passport_id, patch, Utc::now()))
            .unwrap();

        // Trip becomes domestic: nothing international is implied any more.
        let second = h.engine.reconcile("trip", &snapshot(None)).await.unwrap();
        let rules: Vec<&str> = second.iter().filter_map(|t| t.rule_id.as_deref()).collect();
        assert_eq!(rules, vec!["passport"]);
        assert!(h.remote.get(&rule_task_id("trip", "visa:peru")).is_none());
        assert!(h.queue.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_reconcile_is_stable_when_nothing_changes() {
        let h = harness();
        let first = h.engine.reconcile("trip", &snapshot(Some("Ireland"))).await.unwrap();
        let writes = h.remote.write_count();
        let second = h.engine.reconcile("trip", &snapshot(Some("Ireland"))).await.unwrap();
        let ids = |ts: &[Task]| ts.iter().map(|t| t.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));
        assert_eq!(h.remote.write_count(), writes);
    }

    #[tokio::test]
    async fn test_flush_coalesces_while_gate_is_held() {
        let h = harness();
        let task = local_task(&h, "Coalesce");
        h.queue.enqueue(PendingAction::add(&task, Utc::now())).unwrap();

        let guard = h.engine.gate.lock().await;
        assert!(h.engine.is_syncing());
        let report = h.engine.flush_queue().await.unwrap();
        assert!(report.coalesced);
        assert_eq!(h.queue.len().unwrap(), 1);
        drop(guard);

        let report = h.engine.flush_queue().await.unwrap();
        assert_eq!(report.applied, 1);
    }
}
