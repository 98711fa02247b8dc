//! Task data structures.
//!
//! `Task` is the persisted checklist item shared by the local store, the pending
//! action queue and the remote store. `EnrichedTask` is the derived, never-persisted
//! view produced by the enricher.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::fields::*;

/// A single trip-preparation item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub trip_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub is_completed: bool,
    #[serde(default)]
    pub is_urgent: bool,
    #[serde(default = "default_category")]
    pub category: Category,
    #[serde(default = "default_priority")]
    pub priority: Priority,
    /// Generation rule this task came from; `None` for manually created tasks.
    #[serde(default)]
    pub rule_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Local-only: when the remote last confirmed this record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
}

fn default_category() -> Category {
    Category::Other
}

fn default_priority() -> Priority {
    Priority::Recommended
}

impl Task {
    /// Build a fresh manually-created task with a new id.
    pub fn new(trip_id: &str, new: NewTask, now: DateTime<Utc>) -> Self {
        Task {
            id: Uuid::new_v4().to_string(),
            trip_id: trip_id.to_string(),
            title: new.title.trim().to_string(),
            description: new.description.filter(|d| !d.trim().is_empty()),
            due_date: new.due_date,
            is_completed: false,
            is_urgent: new.is_urgent,
            category: new.category,
            priority: new.priority,
            rule_id: None,
            created_at: now,
            updated_at: now,
            synced_at: None,
        }
    }

    /// Advance `updated_at`, never moving it backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    /// Copy without local-only bookkeeping, as sent to the remote.
    pub fn for_remote(&self) -> Task {
        Task {
            synced_at: None,
            ..self.clone()
        }
    }

    /// Whether the task was produced by a generation rule.
    pub fn is_generated(&self) -> bool {
        self.rule_id.is_some()
    }
}

/// Input for creating a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    #[serde(default = "default_category")]
    pub category: Category,
    #[serde(default = "default_priority")]
    pub priority: Priority,
    #[serde(default)]
    pub is_urgent: bool,
}

impl NewTask {
    pub fn titled(title: &str) -> Self {
        NewTask {
            title: title.to_string(),
            description: None,
            due_date: None,
            category: Category::Other,
            priority: Priority::Recommended,
            is_urgent: false,
        }
    }
}

/// Field-level change set carried by UPDATE actions.
///
/// Outer `None` means "unchanged"; for nullable fields `Some(None)` clears the value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "deserialize_some", skip_serializing_if = "Option::is_none")]
    pub description: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_some", skip_serializing_if = "Option::is_none")]
    pub due_date: Option<Option<NaiveDate>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_completed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_urgent: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    /// Edit time of the change; only ever moves `updated_at` forward.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

fn deserialize_some<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

impl TaskPatch {
    /// No field changes; an edit time alone doesn't count.
    pub fn is_empty(&self) -> bool {
        TaskPatch {
            updated_at: None,
            ..self.clone()
        } == TaskPatch::default()
    }

    /// Apply the change set to `task`. Re-applying the same patch is a no-op.
    pub fn apply(&self, task: &mut Task) {
        if let Some(ref title) = self.title {
            task.title = title.clone();
        }
        if let Some(ref desc) = self.description {
            task.description = desc.clone();
        }
        if let Some(due) = self.due_date {
            task.due_date = due;
        }
        if let Some(done) = self.is_completed {
            task.is_completed = done;
        }
        if let Some(urgent) = self.is_urgent {
            task.is_urgent = urgent;
        }
        if let Some(category) = self.category {
            task.category = category;
        }
        if let Some(priority) = self.priority {
            task.priority = priority;
        }
        if let Some(at) = self.updated_at {
            task.touch(at);
        }
    }
}

/// A hyperlink attached to task guidance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuidanceLink {
    pub label: String,
    pub url: String,
}

/// Contextual guidance for a task: why it matters, when to do it, how to do it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskGuidance {
    pub why: Option<String>,
    pub when: Option<String>,
    pub how: Option<String>,
    #[serde(default)]
    pub links: Vec<GuidanceLink>,
}

impl TaskGuidance {
    pub fn is_empty(&self) -> bool {
        self.why.is_none() && self.when.is_none() && self.how.is_none() && self.links.is_empty()
    }
}

/// A task plus its derived guidance and time-window classification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedTask {
    #[serde(flatten)]
    pub task: Task,
    pub context: TaskGuidance,
    pub time_window: TimeWindow,
    pub smart_time_window: String,
}
