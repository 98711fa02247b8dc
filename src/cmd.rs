//! Command implementations for the CLI interface.
//!
//! Each handler works against a `Session`: the local store, pending queue,
//! sync engine and checklist controller wired up from `Settings`. Handlers print
//! to stdout and exit non-zero on failure.

use std::fmt::Display;
use std::sync::Arc;

use chrono::{Local, NaiveDate};
use clap::Subcommand;
use clap_complete::{generate, Shell};
use tracing::warn;

use crate::config::Settings;
use crate::connectivity::Connectivity;
use crate::controller::ChecklistController;
use crate::display::*;
use crate::enrich::TaskEnricher;
use crate::error::{Error, Result};
use crate::fields::*;
use crate::queue::{PendingAction, PendingQueue};
use crate::remote::{DisconnectedRemote, HttpRemote, RemoteTaskStore};
use crate::rules::RuleSet;
use crate::store::{JsonTaskStore, MemoryTaskStore, TaskStore};
use crate::suggest::HttpSuggestionService;
use crate::sync::SyncEngine;
use crate::task::{NewTask, Task, TaskPatch};
use crate::trip::{discover_trips, most_recent_trip, resolve_trip, TripSnapshot};

#[derive(Subcommand)]
pub enum Commands {
    /// List trips found in the data directory.
    Trips,

    /// Add a new task to the trip checklist.
    Add {
        /// Short title for the task.
        title: String,
        /// Optional longer description.
        #[arg(long)]
        desc: Option<String>,
        /// Due date: YYYY-MM-DD, "today", "tomorrow", "in Nd" or "in Nw".
        #[arg(long)]
        due: Option<String>,
        #[arg(long, value_enum, default_value_t = Category::Other)]
        category: Category,
        #[arg(long, value_enum, default_value_t = Priority::Recommended)]
        priority: Priority,
        /// Flag the task as urgent.
        #[arg(long)]
        urgent: bool,
    },

    /// List tasks with their time window.
    List {
        /// Include completed tasks.
        #[arg(long)]
        all: bool,
        /// Only show tasks in this window.
        #[arg(long, value_enum)]
        window: Option<WindowFilter>,
        #[arg(long, value_enum)]
        category: Option<Category>,
        #[arg(long, value_enum, default_value_t = SortKey::Due)]
        sort: SortKey,
        /// Limit number of results.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// View a task with its guidance.
    View {
        /// Task id, id prefix or exact title.
        id: String,
    },

    /// Toggle a task's completion.
    Toggle {
        /// Task id, id prefix or exact title.
        id: String,
    },

    /// Update fields of a task.
    Update {
        /// Task id, id prefix or exact title.
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        desc: Option<String>,
        /// Remove the description.
        #[arg(long)]
        clear_desc: bool,
        #[arg(long)]
        due: Option<String>,
        /// Remove the due date.
        #[arg(long)]
        clear_due: bool,
        #[arg(long, value_enum)]
        category: Option<Category>,
        #[arg(long, value_enum)]
        priority: Option<Priority>,
        #[arg(long)]
        urgent: Option<bool>,
    },

    /// Delete a task.
    Delete {
        /// Task id, id prefix or exact title.
        id: String,
    },

    /// Delete every task whose title contains the pattern (case-insensitive).
    DeleteMatching {
        pattern: String,
    },

    /// Reconcile the checklist with the remote service and trip rules.
    Refresh,

    /// Replay pending actions against the remote service.
    Sync,

    /// Inspect and manage the pending action queue.
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Show planning gaps for the trip.
    Gaps {
        /// Print gaps as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show gaps and ask the suggestion service for extra tasks.
    Analyze {
        /// Add every suggested task to the checklist.
        #[arg(long)]
        accept: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
pub enum QueueAction {
    /// List queued actions.
    List,
    /// Make a dead-lettered or backed-off action eligible again.
    Requeue {
        /// Action id or prefix.
        id: String,
    },
    /// Discard a queued action.
    Drop {
        /// Action id or prefix.
        id: String,
    },
}

fn exit_with(context: &str, e: impl Display) -> ! {
    eprintln!("{}: {}", context, e);
    std::process::exit(1);
}

/// Store, queue, sync engine and controller for one CLI invocation.
pub struct Session {
    pub settings: Settings,
    pub controller: ChecklistController,
    pub connectivity: Connectivity,
    queue: Arc<PendingQueue>,
}

impl Session {
    pub fn open(settings: Settings) -> Result<Session> {
        let store: Arc<dyn TaskStore> = match JsonTaskStore::open(&settings.tasks_path()) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                warn!(error = %e, "Task store unreadable; using an in-memory store");
                Arc::new(MemoryTaskStore::new())
            }
        };
        let queue = Arc::new(PendingQueue::open(&settings.queue_path())?);

        let (remote, online): (Arc<dyn RemoteTaskStore>, bool) = match settings.remote_url.as_deref() {
            Some(url) if !settings.offline => (Arc::new(HttpRemote::new(url, settings.http_timeout)?), true),
            _ => (Arc::new(DisconnectedRemote), false),
        };
        let connectivity = Connectivity::new(online);

        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            queue.clone(),
            remote,
            RuleSet::default(),
            settings.sync.clone(),
        ));
        let controller = ChecklistController::new(store, engine, connectivity.clone(), TaskEnricher::default());

        Ok(Session {
            settings,
            controller,
            connectivity,
            queue,
        })
    }

    /// Load the named trip (or the most recent one) and make it active.
    pub fn open_trip(&mut self, identifier: Option<&str>) -> Result<TripSnapshot> {
        let trips_dir = self.settings.trips_dir();
        let snapshot = match identifier {
            Some(id) => resolve_trip(id, &trips_dir)?,
            None => match most_recent_trip(&trips_dir)? {
                Some(file) => file.load()?,
                None => {
                    return Err(Error::NotFound(format!(
                        "no trips in {}; add one as <name>_trip.json",
                        trips_dir.display()
                    )))
                }
            },
        };
        self.controller.load_local(&snapshot.trip.id);
        Ok(snapshot)
    }

    fn resolve_task_id(&self, identifier: &str) -> String {
        match self.controller.resolve(identifier) {
            Ok(task) => task.id.clone(),
            Err(e) => exit_with("Error resolving task", e),
        }
    }

    fn sync_note(&self) -> &'static str {
        if self.connectivity.is_online() {
            ""
        } else {
            " (queued for sync)"
        }
    }
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

fn parse_due_or_exit(input: &str) -> NaiveDate {
    match parse_due_input(input, today()) {
        Some(d) => d,
        None => exit_with("Invalid due date", input),
    }
}

/// List trips found in the data directory.
pub fn cmd_trips(settings: &Settings) {
    let trips = match discover_trips(&settings.trips_dir()) {
        Ok(t) => t,
        Err(e) => exit_with("Failed to read trips", e),
    };
    if trips.is_empty() {
        println!("No trips in {}", settings.trips_dir().display());
        return;
    }
    println!("{:<20} {:<12} {:<12} {}", "Trip", "Start", "End", "Destinations");
    for file in trips {
        match file.load() {
            Ok(snapshot) => {
                let trip = snapshot.trip;
                let cities: Vec<&str> = trip.destinations.iter().map(|d| d.city.as_str()).collect();
                println!(
                    "{:<20} {:<12} {:<12} {}",
                    truncate(&file.display_name, 20),
                    trip.start_date.map(|d| d.to_string()).unwrap_or_else(|| "-".into()),
                    trip.end_date.map(|d| d.to_string()).unwrap_or_else(|| "-".into()),
                    if cities.is_empty() { "-".into() } else { cities.join(", ") }
                );
            }
            Err(e) => println!("{:<20} (unreadable: {})", truncate(&file.display_name, 20), e),
        }
    }
}

/// Add a new task to the active trip.
pub async fn cmd_add(
    session: &mut Session,
    title: String,
    desc: Option<String>,
    due: Option<String>,
    category: Category,
    priority: Priority,
    urgent: bool,
) {
    let new = NewTask {
        title,
        description: desc,
        due_date: due.as_deref().map(parse_due_or_exit),
        category,
        priority,
        is_urgent: urgent,
    };
    let task = match session.controller.add_task(new) {
        Ok(t) => t,
        Err(e) => exit_with("Failed to add task", e),
    };
    session.controller.wait_idle().await;
    println!("Added {} {}{}", short_id(&task.id), task.title, session.sync_note());
}

/// List tasks for the active trip.
pub fn cmd_list(
    session: &Session,
    snapshot: &TripSnapshot,
    all: bool,
    window: Option<WindowFilter>,
    category: Option<Category>,
    sort: SortKey,
    limit: Option<usize>,
) {
    let today = today();
    let mut tasks: Vec<_> = session
        .controller
        .enriched(&snapshot.trip, today)
        .into_iter()
        .filter(|t| all || !t.task.is_completed)
        .filter(|t| category.map_or(true, |c| t.task.category == c))
        .filter(|t| match window {
            None => true,
            Some(WindowFilter::Overdue) => t.time_window == TimeWindow::Overdue,
            Some(WindowFilter::General) => t.time_window == TimeWindow::General,
            Some(WindowFilter::Upcoming) => {
                !matches!(t.time_window, TimeWindow::Overdue | TimeWindow::General)
            }
        })
        .collect();

    match sort {
        SortKey::Due => tasks.sort_by(|a, b| {
            (a.task.due_date.unwrap_or(NaiveDate::MAX), priority_rank(a.task.priority))
                .cmp(&(b.task.due_date.unwrap_or(NaiveDate::MAX), priority_rank(b.task.priority)))
        }),
        SortKey::Priority => tasks.sort_by(|a, b| {
            (priority_rank(a.task.priority), a.task.due_date.unwrap_or(NaiveDate::MAX))
                .cmp(&(priority_rank(b.task.priority), b.task.due_date.unwrap_or(NaiveDate::MAX)))
        }),
        SortKey::Category => tasks.sort_by(|a, b| {
            (a.task.category, priority_rank(a.task.priority)).cmp(&(b.task.category, priority_rank(b.task.priority)))
        }),
    }
    if let Some(n) = limit {
        tasks.truncate(n);
    }

    print_table(&tasks, today);

    let progress = session.controller.progress();
    let pending = session.queue.len().unwrap_or(0);
    println!(
        "\n{}/{} done, {} blocking open, {} pending sync",
        progress.done, progress.total, progress.blocking_open, pending
    );
}

/// View a task with its guidance.
pub fn cmd_view(session: &Session, snapshot: &TripSnapshot, id: String) {
    let task_id = session.resolve_task_id(&id);
    let today = today();
    let Some(t) = session
        .controller
        .enriched(&snapshot.trip, today)
        .into_iter()
        .find(|t| t.task.id == task_id)
    else {
        exit_with("Task not found", id);
    };
    let task = &t.task;

    println!("ID:           {}", task.id);
    println!("Title:        {}", task.title);
    println!("Done:         {}", if task.is_completed { "yes" } else { "no" });
    println!("Category:     {}", format_category(task.category));
    println!("Priority:     {}{}", format_priority(task.priority), if task.is_urgent { " (urgent)" } else { "" });
    println!(
        "Due:          {}",
        match task.due_date {
            Some(d) => format!("{d} ({})", format_due_relative(Some(d), today)),
            None => "-".into(),
        }
    );
    println!("Window:       {} - {}", format_window(t.time_window), t.smart_time_window);
    println!("Source:       {}", task.rule_id.as_deref().map(|r| format!("rule {r}")).unwrap_or_else(|| "manual".into()));
    println!("Updated UTC:  {}", task.updated_at.to_rfc3339());
    println!(
        "Synced UTC:   {}",
        task.synced_at.map(|s| s.to_rfc3339()).unwrap_or_else(|| "never".into())
    );
    println!("Description:\n{}\n", task.description.clone().unwrap_or_else(|| "-".into()));

    if t.context.is_empty() {
        return;
    }
    if let Some(ref why) = t.context.why {
        println!("Why:  {}", why);
    }
    if let Some(ref when) = t.context.when {
        println!("When: {}", when);
    }
    if let Some(ref how) = t.context.how {
        println!("How:  {}", how);
    }
    for link in &t.context.links {
        println!("  - {}: {}", link.label, link.url);
    }
}

/// Toggle a task's completion.
pub async fn cmd_toggle(session: &mut Session, id: String) {
    let task_id = session.resolve_task_id(&id);
    let task = match session.controller.toggle_task(&task_id) {
        Ok(t) => t,
        Err(e) => exit_with("Failed to toggle task", e),
    };
    session.controller.wait_idle().await;
    let state = if task.is_completed { "done" } else { "open" };
    println!("{} {} marked {}{}", short_id(&task.id), task.title, state, session.sync_note());
}

/// Update fields of a task.
#[allow(clippy::too_many_arguments)]
pub async fn cmd_update(
    session: &mut Session,
    id: String,
    title: Option<String>,
    desc: Option<String>,
    clear_desc: bool,
    due: Option<String>,
    clear_due: bool,
    category: Option<Category>,
    priority: Option<Priority>,
    urgent: Option<bool>,
) {
    let task_id = session.resolve_task_id(&id);
    let patch = TaskPatch {
        title,
        description: if clear_desc { Some(None) } else { desc.map(Some) },
        due_date: if clear_due {
            Some(None)
        } else {
            due.as_deref().map(|d| Some(parse_due_or_exit(d)))
        },
        is_completed: None,
        is_urgent: urgent,
        category,
        priority,
        updated_at: None,
    };
    if patch.is_empty() {
        println!("Nothing to update.");
        return;
    }
    let task = match session.controller.update_task(&task_id, patch) {
        Ok(t) => t,
        Err(e) => exit_with("Failed to update task", e),
    };
    session.controller.wait_idle().await;
    println!("Updated {} {}{}", short_id(&task.id), task.title, session.sync_note());
}

/// Delete a task.
pub async fn cmd_delete(session: &mut Session, id: String) {
    let task_id = session.resolve_task_id(&id);
    let task = match session.controller.delete_task(&task_id) {
        Ok(t) => t,
        Err(e) => exit_with("Failed to delete task", e),
    };
    session.controller.wait_idle().await;
    println!("Deleted {} {}{}", short_id(&task.id), task.title, session.sync_note());
}

/// Delete every task whose title contains `pattern`.
pub async fn cmd_delete_matching(session: &mut Session, pattern: String) {
    let removed = match session.controller.delete_by_pattern(&pattern) {
        Ok(r) => r,
        Err(e) => exit_with("Failed to delete tasks", e),
    };
    session.controller.wait_idle().await;
    if removed.is_empty() {
        println!("No tasks match '{}'.", pattern);
        return;
    }
    for task in &removed {
        println!("Deleted {} {}", short_id(&task.id), task.title);
    }
    println!("{} task(s) deleted{}", removed.len(), session.sync_note());
}

/// Reconcile the active trip with the remote service and trip rules.
pub async fn cmd_refresh(session: &mut Session, snapshot: &TripSnapshot) {
    if !session.connectivity.is_online() {
        println!("Offline: showing local tasks only.");
    }
    let count = session.controller.refresh(&snapshot.trip.id, snapshot).await.len();
    let progress = session.controller.progress();
    println!(
        "{}: {} task(s), {}/{} done, {} blocking open",
        snapshot.trip.name, count, progress.done, progress.total, progress.blocking_open
    );
}

/// Replay pending actions.
pub async fn cmd_sync(session: &mut Session) {
    if !session.connectivity.is_online() {
        let pending = session.queue.len().unwrap_or(0);
        println!("Offline: {} action(s) waiting for sync.", pending);
        return;
    }
    match session.controller.flush_now().await {
        Ok(report) => {
            println!(
                "Applied {}, failed {}, deferred {}, dead-lettered {}, {} remaining",
                report.applied, report.failed, report.deferred, report.dead_lettered, report.remaining
            );
        }
        Err(e) => exit_with("Sync failed", e),
    }
}

fn action_status(action: &PendingAction) -> String {
    if action.dead {
        "dead".into()
    } else if let Some(at) = action.next_attempt_at {
        format!("retry {}", at.format("%Y-%m-%d %H:%M"))
    } else {
        "ready".into()
    }
}

fn resolve_action_id(queue: &PendingQueue, prefix: &str) -> String {
    let actions = match queue.drain_ordered() {
        Ok(a) => a,
        Err(e) => exit_with("Failed to read queue", e),
    };
    let matches: Vec<&PendingAction> = actions.iter().filter(|a| a.id.starts_with(prefix)).collect();
    match matches.as_slice() {
        [one] => one.id.clone(),
        [] => exit_with("No queued action matches", prefix),
        _ => exit_with("Ambiguous action id", prefix),
    }
}

/// Inspect and manage the pending action queue.
pub fn cmd_queue(session: &Session, action: QueueAction) {
    match action {
        QueueAction::List => {
            let actions = match session.queue.drain_ordered() {
                Ok(a) => a,
                Err(e) => exit_with("Failed to read queue", e),
            };
            if actions.is_empty() {
                println!("Queue is empty.");
                return;
            }
            println!(
                "{:<9} {:<7} {:<9} {:<17} {:<8} {:<22} {}",
                "ID", "Type", "Task", "Queued", "Attempts", "Status", "Last error"
            );
            for a in &actions {
                println!(
                    "{:<9} {:<7} {:<9} {:<17} {:<8} {:<22} {}",
                    short_id(&a.id),
                    format!("{:?}", a.action_type()).to_uppercase(),
                    short_id(&a.task_id),
                    a.timestamp.format("%Y-%m-%d %H:%M"),
                    a.attempts,
                    action_status(a),
                    a.last_error.as_deref().map(|e| truncate(e, 40)).unwrap_or_else(|| "-".into())
                );
            }
        }
        QueueAction::Requeue { id } => {
            let action_id = resolve_action_id(&session.queue, &id);
            match session.queue.requeue(&action_id) {
                Ok(_) => println!("Requeued {}", short_id(&action_id)),
                Err(e) => exit_with("Failed to requeue action", e),
            }
        }
        QueueAction::Drop { id } => {
            let action_id = resolve_action_id(&session.queue, &id);
            match session.queue.remove(&action_id) {
                Ok(_) => println!("Dropped {}", short_id(&action_id)),
                Err(e) => exit_with("Failed to drop action", e),
            }
        }
    }
}

fn print_gaps(gaps: &[crate::gaps::PlanningGap]) {
    if gaps.is_empty() {
        println!("No planning gaps found.");
        return;
    }
    for gap in gaps {
        let severity = match gap.severity {
            GapSeverity::Critical => "CRITICAL",
            GapSeverity::Warning => "warning",
        };
        println!("[{}] {}", severity, gap.description);
        if let Some(ref action) = gap.suggested_action {
            println!("    -> {}", action);
        }
    }
}

/// Show planning gaps for the active trip.
pub fn cmd_gaps(session: &Session, snapshot: &TripSnapshot, json: bool) {
    let gaps = session.controller.immediate_gaps(snapshot);
    if json {
        match serde_json::to_string_pretty(&gaps) {
            Ok(s) => println!("{}", s),
            Err(e) => exit_with("Failed to encode gaps", e),
        }
    } else {
        print_gaps(&gaps);
    }
}

/// Show gaps, then fetch suggestions from the external service.
pub async fn cmd_analyze(session: &mut Session, snapshot: &TripSnapshot, accept: bool) {
    let Some(url) = session.settings.suggest_url.clone().filter(|_| !session.settings.offline) else {
        print_gaps(&session.controller.immediate_gaps(snapshot));
        exit_with("Suggestions unavailable", "set TRIPCHECK_SUGGEST_URL and go online");
    };
    let service = match HttpSuggestionService::new(&url, session.settings.http_timeout) {
        Ok(s) => s,
        Err(e) => exit_with("Failed to create suggestion client", e),
    };

    let analysis = session.controller.analyze_now(snapshot, &service).await;
    print_gaps(&analysis.gaps);

    let response = match analysis.suggestions {
        Ok(r) => r,
        Err(e) => exit_with("Suggestions unavailable", e),
    };
    for insight in &response.insights {
        println!("* {}", insight);
    }
    if response.suggested_tasks.is_empty() {
        println!("No new tasks suggested.");
        return;
    }
    println!("\nSuggested tasks:");
    for s in &response.suggested_tasks {
        println!(
            "  - {} [{} / {}]",
            s.title,
            s.category.as_deref().unwrap_or("-"),
            s.priority.as_deref().unwrap_or("-")
        );
    }

    if accept {
        let mut added: Vec<Task> = Vec::new();
        for s in response.suggested_tasks {
            match session.controller.accept_suggestion(s) {
                Ok(t) => added.push(t),
                Err(e) => eprintln!("Skipping suggestion: {}", e),
            }
        }
        session.controller.wait_idle().await;
        println!("Added {} suggested task(s){}", added.len(), session.sync_note());
    }
}

/// Generate shell completion scripts.
pub fn cmd_completions(shell: Shell) {
    use clap::CommandFactory;
    use crate::cli::Cli;

    let mut app = Cli::command();
    let app_name = app.get_name().to_string();
    generate(shell, &mut app, app_name, &mut std::io::stdout());
}
