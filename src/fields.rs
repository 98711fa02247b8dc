//! Enumerations and field types for checklist tasks.
//!
//! This module defines the closed vocabularies used to categorise tasks, queue
//! mutations and classify planning gaps, together with the normalisers that map
//! loosely-typed strings (legacy records, suggestion payloads) onto them.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Preparation area a task belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, ValueEnum, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Documentation,
    Health,
    Reservations,
    Packing,
    Financial,
    Tech,
    #[serde(other)]
    Other,
}

/// How much a task gates the trip.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, ValueEnum, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum Priority {
    Blocking,
    Important,
    #[serde(other)]
    Recommended,
}

/// Kind of mutation recorded in the pending action queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionType {
    Add,
    Update,
    Delete,
}

/// Time-window bucket of a task relative to trip start.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TimeWindow {
    General,
    Overdue,
    MonthsBefore,
    WeeksBefore,
    DaysBefore,
    DepartureDay,
}

/// Severity of a detected planning gap.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum GapSeverity {
    Critical,
    Warning,
}

/// Structural element of trip preparation a gap refers to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum GapType {
    Accommodation,
    Transport,
    Documentation,
    Insurance,
}

/// Filter for the `list` command.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum WindowFilter {
    Overdue,
    Upcoming,
    General,
}

/// Sort options for task lists.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SortKey {
    Due,
    Priority,
    Category,
}

/// Map a loosely-typed category string onto the closed `Category` set.
///
/// Unmapped values fall back to `Category::Other`.
pub fn parse_category(s: &str) -> Category {
    match s.trim().to_lowercase().replace(['_', ' '], "-").as_str() {
        "documentation" | "documents" | "document" | "docs" | "paperwork" | "visa" | "passport" => {
            Category::Documentation
        }
        "health" | "medical" | "medicine" | "vaccination" | "vaccinations" | "vaccine" => Category::Health,
        "reservations" | "reservation" | "booking" | "bookings" | "transport" | "accommodation"
        | "lodging" => Category::Reservations,
        "packing" | "pack" | "luggage" | "baggage" => Category::Packing,
        "financial" | "finance" | "finances" | "money" | "budget" | "currency" | "banking" => {
            Category::Financial
        }
        "tech" | "technology" | "electronics" | "connectivity" | "devices" => Category::Tech,
        _ => Category::Other,
    }
}

/// Map a loosely-typed priority string onto the closed `Priority` set.
///
/// Unmapped values fall back to `Priority::Recommended`.
pub fn parse_priority(s: &str) -> Priority {
    match s.trim().to_lowercase().replace(['_', ' '], "-").as_str() {
        "blocking" | "critical" | "high" | "urgent" | "must" | "must-have" => Priority::Blocking,
        "important" | "medium" | "normal" | "should" => Priority::Important,
        _ => Priority::Recommended,
    }
}

/// Format a category for display.
pub fn format_category(c: Category) -> &'static str {
    match c {
        Category::Documentation => "Documents",
        Category::Health => "Health",
        Category::Reservations => "Reservations",
        Category::Packing => "Packing",
        Category::Financial => "Financial",
        Category::Tech => "Tech",
        Category::Other => "Other",
    }
}

/// Format a priority for display.
pub fn format_priority(p: Priority) -> &'static str {
    match p {
        Priority::Blocking => "Blocking",
        Priority::Important => "Important",
        Priority::Recommended => "Recommended",
    }
}

/// Sort rank used when ordering by priority (lower sorts first).
pub fn priority_rank(p: Priority) -> u8 {
    match p {
        Priority::Blocking => 0,
        Priority::Important => 1,
        Priority::Recommended => 2,
    }
}
