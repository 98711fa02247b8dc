//! Trip-level planning gap analysis.
//!
//! Gap analysis is synchronous and network-free so it can populate the
//! "immediate alerts" view before any slower suggestion call returns.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::fields::{Category, GapSeverity, GapType};
use crate::task::Task;
use crate::trip::{same_place, Accommodation, Transport, Trip, TripSnapshot};

/// A structurally missing element of trip preparation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanningGap {
    #[serde(rename = "type")]
    pub gap_type: GapType,
    pub category: Category,
    pub severity: GapSeverity,
    pub description: String,
    #[serde(default)]
    pub suggested_action: Option<String>,
}

/// Snapshots the analysis runs over.
#[derive(Debug, Clone, Copy)]
pub struct GapInput<'a> {
    pub trip: &'a Trip,
    pub accommodations: &'a [Accommodation],
    pub transports: &'a [Transport],
    pub tasks: &'a [Task],
}

impl<'a> GapInput<'a> {
    pub fn new(snapshot: &'a TripSnapshot, tasks: &'a [Task]) -> Self {
        GapInput {
            trip: &snapshot.trip,
            accommodations: &snapshot.accommodations,
            transports: &snapshot.transports,
            tasks,
        }
    }
}

fn any_task_mentions(tasks: &[Task], needles: &[&str]) -> bool {
    tasks.iter().any(|t| {
        let title = t.title.to_lowercase();
        needles.iter().any(|n| title.contains(n))
    })
}

/// Run every structural check and return the gaps, critical ones first.
pub fn analyze_gaps(input: &GapInput<'_>) -> Vec<PlanningGap> {
    let mut gaps = Vec::new();
    let trip = input.trip;

    // Accommodation per destination city.
    let mut seen_cities: Vec<&str> = Vec::new();
    for dest in &trip.destinations {
        if seen_cities.iter().any(|c| same_place(c, &dest.city)) {
            continue;
        }
        seen_cities.push(&dest.city);
        let day_trip = matches!((dest.arrival, dest.departure), (Some(a), Some(d)) if a == d);
        if day_trip {
            continue;
        }
        if !input.accommodations.iter().any(|a| same_place(&a.city, &dest.city)) {
            gaps.push(PlanningGap {
                gap_type: GapType::Accommodation,
                category: Category::Reservations,
                severity: GapSeverity::Critical,
                description: format!("No accommodation booked in {}", dest.city.trim()),
                suggested_action: Some(format!("Book accommodation in {}", dest.city.trim())),
            });
        }
    }

    gaps.extend(uncovered_nights(trip, input.accommodations));

    // Inbound transport per destination city.
    let mut seen_cities: Vec<&str> = Vec::new();
    for dest in &trip.destinations {
        if seen_cities.iter().any(|c| same_place(c, &dest.city)) {
            continue;
        }
        seen_cities.push(&dest.city);
        if !input.transports.iter().any(|t| same_place(&t.to_city, &dest.city)) {
            gaps.push(PlanningGap {
                gap_type: GapType::Transport,
                category: Category::Reservations,
                severity: GapSeverity::Warning,
                description: format!("No transport booked to {}", dest.city.trim()),
                suggested_action: Some(format!("Book transport to {}", dest.city.trim())),
            });
        }
    }

    if trip.has_international_leg() && !any_task_mentions(input.tasks, &["passport", "visa", "esta", "travel authori"]) {
        let countries: Vec<&str> = trip.international_destinations().map(|d| d.country.trim()).collect();
        gaps.push(PlanningGap {
            gap_type: GapType::Documentation,
            category: Category::Documentation,
            severity: GapSeverity::Critical,
            description: format!(
                "International travel to {} with no passport or visa task",
                countries.join(", ")
            ),
            suggested_action: Some("Add tasks to check passport validity and visa requirements".into()),
        });
    }

    if !trip.destinations.is_empty() && !any_task_mentions(input.tasks, &["insurance"]) {
        gaps.push(PlanningGap {
            gap_type: GapType::Insurance,
            category: Category::Financial,
            severity: GapSeverity::Warning,
            description: "No travel insurance coverage planned".into(),
            suggested_action: Some("Buy travel insurance covering medical care and cancellation".into()),
        });
    }

    gaps.sort_by_key(|g| g.severity);
    gaps
}

/// Nights between trip start and end that no dated accommodation covers.
fn uncovered_nights(trip: &Trip, accommodations: &[Accommodation]) -> Vec<PlanningGap> {
    let (Some(start), Some(end)) = (trip.start_date, trip.end_date) else {
        return Vec::new();
    };
    let stays: Vec<(NaiveDate, NaiveDate)> = accommodations
        .iter()
        .filter_map(|a| Some((a.check_in?, a.check_out?)))
        .collect();
    if stays.is_empty() || end <= start {
        return Vec::new();
    }

    let covered = |night: NaiveDate| stays.iter().any(|&(i, o)| night >= i && night < o);
    let mut gaps = Vec::new();
    let mut night = start;
    while night < end {
        if covered(night) {
            night += Duration::days(1);
            continue;
        }
        let from = night;
        while night < end && !covered(night) {
            night += Duration::days(1);
        }
        let count = (night - from).num_days();
        gaps.push(PlanningGap {
            gap_type: GapType::Accommodation,
            category: Category::Reservations,
            severity: GapSeverity::Warning,
            description: format!(
                "{count} night{} without accommodation from {from}",
                if count == 1 { "" } else { "s" }
            ),
            suggested_action: Some(format!("Book a stay covering {from} to {night}")),
        });
    }
    gaps
}

/// Gap shape expected by the suggestion service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StandardGap {
    pub kind: String,
    pub category: String,
    /// `"high"` or `"medium"`.
    pub severity: String,
    pub message: String,
    #[serde(default)]
    pub suggestion: Option<String>,
}

/// Normalise internal gaps into the suggestion service's input contract.
pub fn to_standard_gaps(gaps: &[PlanningGap]) -> Vec<StandardGap> {
    gaps.iter()
        .map(|g| StandardGap {
            kind: match g.gap_type {
                GapType::Accommodation => "accommodation",
                GapType::Transport => "transport",
                GapType::Documentation => "document",
                GapType::Insurance => "insurance",
            }
            .to_string(),
            category: serde_json::to_value(g.category)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| "other".into()),
            severity: match g.severity {
                GapSeverity::Critical => "high",
                GapSeverity::Warning => "medium",
            }
            .to_string(),
            message: g.description.clone(),
            suggestion: g.suggested_action.clone(),
        })
        .collect()
}
