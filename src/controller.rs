//! Checklist controller for the active trip.
//!
//! The controller is the single writer of the in-memory task list. Every
//! mutation applies optimistically in memory, writes the local store, queues a
//! pending action, and (when online) kicks off a background flush. Local store
//! failures are logged and switch the session to in-memory operation.
//!
//! Refresh is split in two: `begin_refresh` serves the local copy immediately and
//! starts a background reconcile; its result is swapped in by `try_apply_refresh`
//! or `finish_refresh`.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::connectivity::Connectivity;
use crate::enrich::TaskEnricher;
use crate::error::{Error, Result};
use crate::fields::Priority;
use crate::gaps::{analyze_gaps, to_standard_gaps, GapInput, PlanningGap};
use crate::queue::{PendingAction, PendingQueue};
use crate::store::TaskStore;
use crate::suggest::{SuggestedTask, SuggestionRequest, SuggestionResponse, SuggestionService};
use crate::sync::{FlushReport, SyncEngine};
use crate::task::{EnrichedTask, NewTask, Task, TaskPatch};
use crate::trip::{Trip, TripSnapshot};

/// Completion summary for the active checklist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub done: usize,
    pub total: usize,
    pub blocking_open: usize,
}

/// Result of a foreground analysis: gaps are always present, suggestions may fail.
#[derive(Debug)]
pub struct Analysis {
    pub gaps: Vec<PlanningGap>,
    pub suggestions: Result<SuggestionResponse>,
}

/// A background reconcile whose result hasn't been applied yet.
struct PendingRefresh {
    trip_id: String,
    rx: oneshot::Receiver<Result<Vec<Task>>>,
}

pub struct ChecklistController {
    trip_id: Option<String>,
    tasks: Vec<Task>,
    is_loading: bool,
    degraded: bool,
    store: Arc<dyn TaskStore>,
    queue: Arc<PendingQueue>,
    engine: Arc<SyncEngine>,
    connectivity: Connectivity,
    enricher: TaskEnricher,
    in_flight: Vec<JoinHandle<()>>,
    pending_refresh: Option<PendingRefresh>,
}

impl ChecklistController {
    pub fn new(
        store: Arc<dyn TaskStore>,
        engine: Arc<SyncEngine>,
        connectivity: Connectivity,
        enricher: TaskEnricher,
    ) -> Self {
        ChecklistController {
            trip_id: None,
            tasks: Vec::new(),
            is_loading: false,
            degraded: false,
            store,
            queue: engine.queue().clone(),
            engine,
            connectivity,
            enricher,
            in_flight: Vec::new(),
            pending_refresh: None,
        }
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn trip_id(&self) -> Option<&str> {
        self.trip_id.as_deref()
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading
    }

    pub fn is_syncing(&self) -> bool {
        self.engine.is_syncing() || self.in_flight.iter().any(|h| !h.is_finished())
    }

    /// Whether the local store failed this session and writes are memory-only.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Resolve a task by id, id prefix, or exact (case-insensitive) title.
    pub fn resolve(&self, identifier: &str) -> Result<&Task> {
        if let Some(task) = self.get(identifier) {
            return Ok(task);
        }
        let wanted = identifier.to_lowercase();
        let matches: Vec<&Task> = self
            .tasks
            .iter()
            .filter(|t| t.id.starts_with(identifier) || t.title.to_lowercase() == wanted)
            .collect();
        match matches.len() {
            0 => Err(Error::NotFound(format!("task '{}'", identifier))),
            1 => Ok(matches[0]),
            n => Err(Error::InvalidInput(format!(
                "'{}' matches {} tasks; use a longer id",
                identifier, n
            ))),
        }
    }

    /// Switch to `trip_id` and load its tasks from the local store.
    ///
    /// Switching to another trip abandons any refresh still running for the old one.
    pub fn load_local(&mut self, trip_id: &str) -> &[Task] {
        if self.trip_id.as_deref() != Some(trip_id) {
            self.pending_refresh = None;
            self.is_loading = false;
        }
        self.trip_id = Some(trip_id.to_string());
        self.tasks = match self.store.get_by_trip(trip_id) {
            Ok(tasks) => tasks,
            Err(e) => {
                self.degrade(&e);
                Vec::new()
            }
        };
        self.tasks
            .sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        &self.tasks
    }

    /// Serve the local copy now and, when online, reconcile in the background.
    pub fn begin_refresh(&mut self, trip_id: &str, snapshot: &TripSnapshot) -> &[Task] {
        self.load_local(trip_id);
        self.pending_refresh = None;
        self.is_loading = false;
        if !self.connectivity.is_online() {
            debug!(trip = trip_id, "Offline; serving local tasks");
            return &self.tasks;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No async runtime; reconcile skipped");
            return &self.tasks;
        };

        let (tx, rx) = oneshot::channel();
        let engine = self.engine.clone();
        let trip = trip_id.to_string();
        let snapshot = snapshot.clone();
        runtime.spawn(async move {
            let result = engine.reconcile(&trip, &snapshot).await;
            // The receiver is gone if the controller moved to another trip.
            let _ = tx.send(result);
        });
        self.pending_refresh = Some(PendingRefresh {
            trip_id: trip_id.to_string(),
            rx,
        });
        self.is_loading = true;
        &self.tasks
    }

    /// Apply the background reconcile if it has finished. Returns whether tasks were replaced.
    pub fn try_apply_refresh(&mut self) -> bool {
        let Some(pending) = self.pending_refresh.as_mut() else {
            return false;
        };
        match pending.rx.try_recv() {
            Ok(result) => {
                let trip_id = pending.trip_id.clone();
                self.pending_refresh = None;
                self.apply_reconciled(&trip_id, result)
            }
            Err(oneshot::error::TryRecvError::Empty) => false,
            Err(oneshot::error::TryRecvError::Closed) => {
                warn!("Reconcile task ended without a result");
                self.pending_refresh = None;
                self.is_loading = false;
                false
            }
        }
    }

    /// Wait for the background reconcile, if any, and apply it.
    pub async fn finish_refresh(&mut self) -> &[Task] {
        if let Some(pending) = self.pending_refresh.take() {
            match pending.rx.await {
                Ok(result) => {
                    self.apply_reconciled(&pending.trip_id, result);
                }
                Err(_) => {
                    warn!(trip = %pending.trip_id, "Reconcile task ended without a result");
                    self.is_loading = false;
                }
            }
        }
        &self.tasks
    }

    /// Replace the in-memory tasks with a reconcile result for `trip_id`.
    ///
    /// Results for a trip that is no longer active are ignored; a failed
    /// reconcile leaves the locally loaded tasks in place.
    pub fn apply_reconciled(&mut self, trip_id: &str, result: Result<Vec<Task>>) -> bool {
        if self.trip_id.as_deref() != Some(trip_id) {
            debug!(trip = trip_id, "Dropping reconcile result for inactive trip");
            return false;
        }
        self.is_loading = false;
        match result {
            Ok(tasks) => {
                self.tasks = tasks;
                true
            }
            Err(e) => {
                warn!(trip = trip_id, error = %e, "Reconcile failed; keeping local tasks");
                false
            }
        }
    }

    /// `begin_refresh` followed by `finish_refresh`.
    pub async fn refresh(&mut self, trip_id: &str, snapshot: &TripSnapshot) -> &[Task] {
        self.begin_refresh(trip_id, snapshot);
        self.finish_refresh().await
    }

    fn active_trip(&self) -> Result<String> {
        self.trip_id
            .clone()
            .ok_or_else(|| Error::InvalidInput("no active trip".into()))
    }

    fn degrade(&mut self, e: &Error) {
        if !self.degraded {
            warn!(error = %e, "Local store unavailable; continuing in memory for this session");
        }
        self.degraded = true;
    }

    fn persist(&mut self, task: &Task) {
        if self.degraded {
            return;
        }
        if let Err(e) = self.store.upsert(task) {
            self.degrade(&e);
        }
    }

    fn unpersist(&mut self, id: &str) {
        if self.degraded {
            return;
        }
        if let Err(e) = self.store.remove(id) {
            self.degrade(&e);
        }
    }

    /// A queue persist failure keeps the action in memory; the store stays in use.
    fn enqueue(&self, action: PendingAction) {
        if let Err(e) = self.queue.enqueue(action) {
            debug!(error = %e, "Queued action is not durable");
        }
    }

    /// Fire-and-forget flush when online and inside a runtime.
    fn schedule_flush(&mut self) {
        if !self.connectivity.is_online() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No async runtime; flush deferred");
            return;
        };
        let engine = self.engine.clone();
        self.in_flight.retain(|h| !h.is_finished());
        self.in_flight.push(runtime.spawn(async move {
            if let Err(e) = engine.flush_queue().await {
                warn!(error = %e, "Background flush failed");
            }
        }));
    }

    /// Wait for background flushes started by earlier mutations.
    pub async fn wait_idle(&mut self) {
        for handle in self.in_flight.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background flush task aborted");
            }
        }
    }

    /// Flush the pending queue now (explicit sync request).
    pub async fn flush_now(&mut self) -> Result<FlushReport> {
        self.wait_idle().await;
        let report = self.engine.flush_queue().await?;
        if let Some(trip_id) = self.trip_id.clone() {
            // Pick up sync stamps without losing in-memory-only state.
            if !self.degraded {
                self.load_local(&trip_id);
            }
        }
        Ok(report)
    }

    pub fn add_task(&mut self, new: NewTask) -> Result<Task> {
        let trip_id = self.active_trip()?;
        if new.title.trim().is_empty() {
            return Err(Error::InvalidInput("task title cannot be empty".into()));
        }
        let now = Utc::now();
        let task = Task::new(&trip_id, new, now);

        self.tasks.push(task.clone());
        self.persist(&task);
        self.enqueue(PendingAction::add(&task, now));
        self.schedule_flush();
        debug!(task = %task.id, "Added task");
        Ok(task)
    }

    /// Add a suggested task after normalising its loosely-typed fields.
    pub fn accept_suggestion(&mut self, suggestion: SuggestedTask) -> Result<Task> {
        self.add_task(suggestion.into_new_task())
    }

    pub fn toggle_task(&mut self, id: &str) -> Result<Task> {
        let done = !self
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("task '{}'", id)))?
            .is_completed;
        self.update_task(
            id,
            TaskPatch {
                is_completed: Some(done),
                ..Default::default()
            },
        )
    }

    pub fn update_task(&mut self, id: &str, mut patch: TaskPatch) -> Result<Task> {
        if patch.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(Error::InvalidInput("task title cannot be empty".into()));
        }
        let now = Utc::now();
        let task = {
            let task = self
                .tasks
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| Error::NotFound(format!("task '{}'", id)))?;
            if patch.is_empty() {
                return Ok(task.clone());
            }
            patch.apply(task);
            task.touch(now);
            patch.updated_at = Some(task.updated_at);
            task.clone()
        };

        self.persist(&task);
        self.enqueue(PendingAction::update(&task.trip_id, &task.id, patch, now));
        self.schedule_flush();
        Ok(task)
    }

    pub fn delete_task(&mut self, id: &str) -> Result<Task> {
        let idx = self
            .tasks
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| Error::NotFound(format!("task '{}'", id)))?;
        let task = self.tasks.remove(idx);
        let now = Utc::now();

        self.unpersist(&task.id);
        self.enqueue(PendingAction::delete(&task.trip_id, &task.id, now));
        self.schedule_flush();
        Ok(task)
    }

    /// Delete every task whose title contains `pattern` (case-insensitive).
    pub fn delete_by_pattern(&mut self, pattern: &str) -> Result<Vec<Task>> {
        let needle = pattern.trim().to_lowercase();
        if needle.is_empty() {
            return Err(Error::InvalidInput("pattern cannot be empty".into()));
        }
        let (removed, kept): (Vec<Task>, Vec<Task>) = std::mem::take(&mut self.tasks)
            .into_iter()
            .partition(|t| t.title.to_lowercase().contains(&needle));
        self.tasks = kept;

        let now = Utc::now();
        for task in &removed {
            self.unpersist(&task.id);
            self.enqueue(PendingAction::delete(&task.trip_id, &task.id, now));
        }
        if !removed.is_empty() {
            self.schedule_flush();
        }
        Ok(removed)
    }

    pub fn enriched(&self, trip: &Trip, today: NaiveDate) -> Vec<EnrichedTask> {
        self.enricher.enrich_all(&self.tasks, trip, today)
    }

    pub fn immediate_gaps(&self, snapshot: &TripSnapshot) -> Vec<PlanningGap> {
        analyze_gaps(&GapInput::new(snapshot, &self.tasks))
    }

    pub fn progress(&self) -> Progress {
        Progress {
            done: self.tasks.iter().filter(|t| t.is_completed).count(),
            total: self.tasks.len(),
            blocking_open: self
                .tasks
                .iter()
                .filter(|t| !t.is_completed && t.priority == Priority::Blocking)
                .count(),
        }
    }

    /// Foreground analysis: immediate gaps plus suggestions from the external service.
    ///
    /// Suggestions duplicating an existing task title are dropped. A service
    /// failure is reported in `Analysis::suggestions` as `Error::Suggestion`.
    pub async fn analyze_now(&self, snapshot: &TripSnapshot, service: &dyn SuggestionService) -> Analysis {
        let gaps = self.immediate_gaps(snapshot);
        let existing_titles: Vec<String> = self.tasks.iter().map(|t| t.title.clone()).collect();
        let request = SuggestionRequest {
            trip: snapshot.trip.clone(),
            existing_titles: existing_titles.clone(),
            gaps: to_standard_gaps(&gaps),
        };

        let suggestions = match service.suggest(&request).await {
            Ok(mut response) => {
                let existing: Vec<String> = existing_titles.iter().map(|t| t.trim().to_lowercase()).collect();
                response
                    .suggested_tasks
                    .retain(|s| !existing.contains(&s.title.trim().to_lowercase()));
                Ok(response)
            }
            Err(Error::Suggestion(msg)) => Err(Error::Suggestion(msg)),
            Err(other) => Err(Error::Suggestion(other.to_string())),
        };
        if let Err(ref e) = suggestions {
            warn!(error = %e, "Suggestion request failed");
        }
        Analysis { gaps, suggestions }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{Category, GapSeverity, GapType};
    use crate::queue::ActionPayload;
    use crate::remote::{InMemoryRemote, RemoteTaskStore};
    use crate::rules::RuleSet;
    use crate::store::MemoryTaskStore;
    use crate::sync::SyncConfig;
    use crate::trip::Destination;
    use async_trait::async_trait;
    use tokio::sync::Notify;

    struct Fixture {
        store: Arc<MemoryTaskStore>,
        queue: Arc<PendingQueue>,
        remote: Arc<InMemoryRemote>,
        connectivity: Connectivity,
        controller: ChecklistController,
    }

    fn controller_with(
        store: Arc<dyn TaskStore>,
        queue: Arc<PendingQueue>,
        remote: Arc<dyn RemoteTaskStore>,
        connectivity: &Connectivity,
    ) -> ChecklistController {
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            queue,
            remote,
            RuleSet::default(),
            SyncConfig::default(),
        ));
        let mut controller =
            ChecklistController::new(store, engine, connectivity.clone(), TaskEnricher::default());
        controller.load_local("trip");
        controller
    }

    fn fixture(online: bool) -> Fixture {
        let store = Arc::new(MemoryTaskStore::new());
        let queue = Arc::new(PendingQueue::in_memory());
        let remote = Arc::new(InMemoryRemote::new());
        let connectivity = Connectivity::new(online);
        let controller = controller_with(store.clone(), queue.clone(), remote.clone(), &connectivity);
        Fixture {
            store,
            queue,
            remote,
            connectivity,
            controller,
        }
    }

    fn snapshot() -> TripSnapshot {
        TripSnapshot {
            trip: Trip {
                id: "trip".into(),
                name: "Kenya".into(),
                start_date: NaiveDate::from_ymd_opt(2031, 2, 1),
                end_date: None,
                home_country: Some("UK".into()),
                home_currency: None,
                destinations: vec![Destination {
                    city: "Nairobi".into(),
                    country: "Kenya".into(),
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

    #[test]
    fn test_offline_mutations_update_memory_store_and_queue() {
        let mut f = fixture(false);
        let task = f.controller.add_task(NewTask::titled("Buy adapter")).unwrap();
        assert_eq!(f.controller.tasks().len(), 1);
        assert_eq!(f.store.get(&task.id).unwrap(), Some(task.clone()));

        let toggled = f.controller.toggle_task(&task.id).unwrap();
        assert!(toggled.is_completed);
        assert!(f.store.get(&task.id).unwrap().unwrap().is_completed);

        let actions = f.queue.drain_ordered().unwrap();
        assert_eq!(actions.len(), 2);
        assert!(matches!(actions[1].payload, ActionPayload::Update { ref patch } if patch.is_completed == Some(true)));
        assert_eq!(f.remote.write_count(), 0);
    }

    #[test]
    fn test_mutations_without_active_trip_or_title_fail() {
        let store = Arc::new(MemoryTaskStore::new());
        let queue = Arc::new(PendingQueue::in_memory());
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            queue,
            Arc::new(InMemoryRemote::new()),
            RuleSet::default(),
            SyncConfig::default(),
        ));
        let mut controller =
            ChecklistController::new(store, engine, Connectivity::new(false), TaskEnricher::default());
        assert!(matches!(controller.add_task(NewTask::titled("x")), Err(Error::InvalidInput(_))));
        controller.load_local("trip");
        assert!(matches!(controller.add_task(NewTask::titled("  ")), Err(Error::InvalidInput(_))));
        assert!(matches!(controller.toggle_task("missing"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_empty_patch_is_not_queued() {
        let mut f = fixture(false);
        let task = f.controller.add_task(NewTask::titled("Pack")).unwrap();
        f.controller.update_task(&task.id, TaskPatch::default()).unwrap();
        assert_eq!(f.queue.len().unwrap(), 1);
    }

    #[test]
    fn test_delete_by_pattern_queues_one_delete_each() {
        let mut f = fixture(false);
        f.controller.add_task(NewTask::titled("Visa for Kenya")).unwrap();
        f.controller.add_task(NewTask::titled("visa photos")).unwrap();
        f.controller.add_task(NewTask::titled("Sunscreen")).unwrap();

        let removed = f.controller.delete_by_pattern("VISA").unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(f.controller.tasks().len(), 1);
        assert_eq!(f.store.get_by_trip("trip").unwrap().len(), 1);
        let deletes = f
            .queue
            .drain_ordered()
            .unwrap()
            .into_iter()
            .filter(|a| matches!(a.payload, ActionPayload::Delete))
            .count();
        assert_eq!(deletes, 2);
        assert!(matches!(f.controller.delete_by_pattern(" "), Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_online_mutation_flushes_in_background() {
        let mut f = fixture(true);
        let task = f.controller.add_task(NewTask::titled("Check-in")).unwrap();
        f.controller.wait_idle().await;
        assert!(f.remote.get(&task.id).is_some());
        assert!(f.queue.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_toggle_offline_then_flush_after_reconnect() {
        let mut f = fixture(false);
        let task = Task::new("trip", NewTask::titled("Renew passport"), Utc::now());
        f.remote.seed(task.clone());
        f.store.upsert(&task).unwrap();
        f.controller.load_local("trip");

        f.controller.toggle_task(&task.id).unwrap();
        let queued = f.queue.drain_ordered().unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].action_type(), crate::fields::ActionType::Update);

        f.connectivity.set_online(true);
        let report = f.controller.flush_now().await.unwrap();
        assert_eq!(report.remaining, 0);
        assert!(f.queue.is_empty().unwrap());
        assert!(f.remote.get(&task.id).unwrap().is_completed);
        assert!(f.controller.get(&task.id).unwrap().synced_at.is_some());
    }

    #[tokio::test]
    async fn test_refresh_keeps_local_state_when_reconcile_fails() {
        let mut f = fixture(true);
        let task = Task::new("trip", NewTask::titled("Local only"), Utc::now());
        f.store.upsert(&task).unwrap();
        f.remote.set_offline(true);

        let tasks = f.controller.refresh("trip", &snapshot()).await;
        assert_eq!(tasks.len(), 1);
        assert!(!f.controller.is_loading());

        f.remote.set_offline(false);
        let tasks = f.controller.refresh("trip", &snapshot()).await.to_vec();
        assert!(tasks.iter().any(|t| t.title == "Check visa requirements for Kenya"));
        // Without a pending action the remote copy is authoritative.
        assert!(!tasks.iter().any(|t| t.title == "Local only"));
    }

    /// Remote whose trip fetch waits until the test opens the gate.
    #[derive(Default)]
    struct GatedRemote {
        inner: InMemoryRemote,
        gate: Notify,
    }

    #[async_trait]
    impl RemoteTaskStore for GatedRemote {
        async fn fetch_trip(&self, trip_id: &str) -> Result<Vec<Task>> {
            self.gate.notified().await;
            self.inner.fetch_trip(trip_id).await
        }

        async fn upsert(&self, task: &Task) -> Result<()> {
            self.inner.upsert(task).await
        }

        async fn patch(&self, task_id: &str, patch: &TaskPatch) -> Result<()> {
            self.inner.patch(task_id, patch).await
        }

        async fn delete(&self, task_id: &str) -> Result<()> {
            self.inner.delete(task_id).await
        }
    }

    /// Store that can be read but refuses every write.
    struct FailingStore;

    impl TaskStore for FailingStore {
        fn upsert(&self, _task: &Task) -> Result<()> {
            Err(Error::LocalStore("disk full".into()))
        }

        fn remove(&self, _id: &str) -> Result<Option<Task>> {
            Err(Error::LocalStore("disk full".into()))
        }

        fn get(&self, _id: &str) -> Result<Option<Task>> {
            Ok(None)
        }

        fn get_all(&self) -> Result<Vec<Task>> {
            Ok(Vec::new())
        }

        fn get_by_trip(&self, _trip_id: &str) -> Result<Vec<Task>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_update_keeps_updated_at_through_sync_and_refresh() {
        let mut f = fixture(true);
        let task = f.controller.add_task(NewTask::titled("Buy adapter")).unwrap();
        f.controller.wait_idle().await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let toggled = f.controller.toggle_task(&task.id).unwrap();
        assert!(toggled.updated_at > task.updated_at);
        f.controller.wait_idle().await;
        assert!(f.queue.is_empty().unwrap());
        assert_eq!(f.remote.get(&task.id).unwrap().updated_at, toggled.updated_at);

        let tasks = f.controller.refresh("trip", &snapshot()).await.to_vec();
        let refreshed = tasks.iter().find(|t| t.id == task.id).unwrap();
        assert!(refreshed.is_completed);
        assert_eq!(refreshed.updated_at, toggled.updated_at);
    }

    #[test]
    fn test_update_action_carries_edit_time() {
        let mut f = fixture(false);
        let task = f.controller.add_task(NewTask::titled("Visa")).unwrap();
        let toggled = f.controller.toggle_task(&task.id).unwrap();
        let actions = f.queue.drain_ordered().unwrap();
        assert!(matches!(
            actions[1].payload,
            ActionPayload::Update { ref patch } if patch.updated_at == Some(toggled.updated_at)
        ));
    }

    #[tokio::test]
    async fn test_refresh_serves_local_tasks_while_reconcile_runs() {
        let store = Arc::new(MemoryTaskStore::new());
        let remote = Arc::new(GatedRemote::default());
        let connectivity = Connectivity::new(true);
        let local = Task::new("trip", NewTask::titled("Already packed"), Utc::now());
        store.upsert(&local).unwrap();
        let mut controller = controller_with(
            store.clone(),
            Arc::new(PendingQueue::in_memory()),
            remote.clone(),
            &connectivity,
        );

        let fast = controller.begin_refresh("trip", &snapshot()).to_vec();
        assert_eq!(fast, vec![local.clone()]);
        assert!(controller.is_loading());

        tokio::task::yield_now().await;
        assert!(!controller.try_apply_refresh());
        assert!(controller.is_loading());
        assert_eq!(controller.tasks(), &[local][..]);

        remote.gate.notify_one();
        let tasks = controller.finish_refresh().await.to_vec();
        assert!(!controller.is_loading());
        assert!(tasks.iter().any(|t| t.title == "Check visa requirements for Kenya"));
        assert!(!controller.try_apply_refresh());
    }

    #[tokio::test]
    async fn test_refresh_result_for_previous_trip_is_dropped() {
        let remote = Arc::new(GatedRemote::default());
        let connectivity = Connectivity::new(true);
        let mut controller = controller_with(
            Arc::new(MemoryTaskStore::new()),
            Arc::new(PendingQueue::in_memory()),
            remote.clone(),
            &connectivity,
        );

        controller.begin_refresh("trip", &snapshot());
        controller.load_local("other");
        assert!(!controller.is_loading());

        remote.gate.notify_one();
        assert!(controller.finish_refresh().await.is_empty());
        assert_eq!(controller.trip_id(), Some("other"));

        let stray = Task::new("trip", NewTask::titled("Stray"), Utc::now());
        assert!(!controller.apply_reconciled("trip", Ok(vec![stray])));
        assert!(controller.tasks().is_empty());
    }

    #[test]
    fn test_store_failure_degrades_without_failing_mutations() {
        let queue = Arc::new(PendingQueue::in_memory());
        let connectivity = Connectivity::new(false);
        let mut controller = controller_with(
            Arc::new(FailingStore),
            queue.clone(),
            Arc::new(InMemoryRemote::new()),
            &connectivity,
        );
        assert!(!controller.is_degraded());

        let task = controller.add_task(NewTask::titled("Buy adapter")).unwrap();
        assert!(controller.is_degraded());
        assert_eq!(controller.tasks().len(), 1);

        assert!(controller.toggle_task(&task.id).unwrap().is_completed);
        assert!(controller.get(&task.id).unwrap().is_completed);

        controller.delete_task(&task.id).unwrap();
        assert!(controller.tasks().is_empty());

        let queued: Vec<_> = queue
            .drain_ordered()
            .unwrap()
            .iter()
            .map(|a| a.action_type())
            .collect();
        assert_eq!(
            queued,
            vec![
                crate::fields::ActionType::Add,
                crate::fields::ActionType::Update,
                crate::fields::ActionType::Delete
            ]
        );
    }

    #[test]
    fn test_queue_persist_failure_keeps_store_in_use() {
        let dir = tempfile::TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();
        let queue = Arc::new(PendingQueue::open(&blocker.join("pending_actions.json")).unwrap());
        let store = Arc::new(MemoryTaskStore::new());
        let connectivity = Connectivity::new(false);
        let mut controller = controller_with(
            store.clone(),
            queue.clone(),
            Arc::new(InMemoryRemote::new()),
            &connectivity,
        );

        let task = controller.add_task(NewTask::titled("Book safari")).unwrap();
        assert!(!controller.is_degraded());
        assert!(store.get(&task.id).unwrap().is_some());
        assert_eq!(queue.len().unwrap(), 1);

        let toggled = controller.toggle_task(&task.id).unwrap();
        assert!(store.get(&task.id).unwrap().unwrap().is_completed);
        assert_eq!(toggled.id, task.id);
        assert_eq!(queue.len().unwrap(), 2);
    }

    #[test]
    fn test_progress_and_gaps() {
        let mut f = fixture(false);
        let mut blocking = NewTask::titled("Visa");
        blocking.priority = Priority::Blocking;
        f.controller.add_task(blocking).unwrap();
        let done = f.controller.add_task(NewTask::titled("Insurance")).unwrap();
        f.controller.toggle_task(&done.id).unwrap();

        assert_eq!(
            f.controller.progress(),
            Progress {
                done: 1,
                total: 2,
                blocking_open: 1
            }
        );

        let gaps = f.controller.immediate_gaps(&snapshot());
        assert!(gaps
            .iter()
            .any(|g| g.gap_type == GapType::Accommodation && g.severity == GapSeverity::Critical));
        assert!(!gaps.iter().any(|g| g.gap_type == GapType::Documentation));
    }

    struct CannedSuggestions(Option<SuggestionResponse>);

    #[async_trait]
    impl SuggestionService for CannedSuggestions {
        async fn suggest(&self, request: &SuggestionRequest) -> Result<SuggestionResponse> {
            assert!(!request.gaps.is_empty());
            self.0.clone().ok_or_else(|| Error::Network("timed out".into()))
        }
    }

    #[tokio::test]
    async fn test_analyze_now_surfaces_failure_but_keeps_gaps() {
        let mut f = fixture(false);
        f.controller.add_task(NewTask::titled("Buy travel insurance")).unwrap();

        let failing = f.controller.analyze_now(&snapshot(), &CannedSuggestions(None)).await;
        assert!(!failing.gaps.is_empty());
        assert!(matches!(failing.suggestions, Err(Error::Suggestion(_))));

        let canned = SuggestionResponse {
            insights: vec!["Rainy season".into()],
            suggested_tasks: vec![
                SuggestedTask {
                    title: "buy travel insurance".into(),
                    description: None,
                    category: None,
                    priority: None,
                    due_date: None,
                },
                SuggestedTask {
                    title: "Yellow fever certificate".into(),
                    description: None,
                    category: Some("medical".into()),
                    priority: Some("critical".into()),
                    due_date: None,
                },
            ],
        };
        let ok = f.controller.analyze_now(&snapshot(), &CannedSuggestions(Some(canned))).await;
        let response = ok.suggestions.unwrap();
        assert_eq!(response.suggested_tasks.len(), 1);

        let accepted = f
            .controller
            .accept_suggestion(response.suggested_tasks[0].clone())
            .unwrap();
        assert_eq!(accepted.category, Category::Health);
        assert_eq!(accepted.priority, Priority::Blocking);
    }

    #[test]
    fn test_enriched_view_is_derived_only() {
        let mut f = fixture(false);
        f.controller.add_task(NewTask::titled("Renew passport")).unwrap();
        let today = NaiveDate::from_ymd_opt(2031, 1, 1).unwrap();
        let enriched = f.controller.enriched(&snapshot().trip, today);
        assert_eq!(enriched.len(), 1);
        assert!(enriched[0].context.why.is_some());
        assert_eq!(f.store.get_by_trip("trip").unwrap()[0], enriched[0].task);
    }
}
