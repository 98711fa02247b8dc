//! Deterministic task generation from trip context.
//!
//! Each rule yields tasks with a stable `rule_id` (and a task id derived from the
//! trip and rule id), so regenerating from the same trip context always produces
//! the same set. Reconciliation uses that set to add newly-implied tasks and
//! retire ones the trip no longer implies.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use uuid::Uuid;

use crate::fields::{Category, Priority};
use crate::trip::{same_place, TransportMode, TripSnapshot};
use crate::task::Task;

/// A task implied by the trip context, before it's materialised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleTask {
    pub rule_id: String,
    pub title: String,
    pub description: Option<String>,
    pub category: Category,
    pub priority: Priority,
    pub due_date: Option<NaiveDate>,
}

impl RuleTask {
    /// Materialise as a `Task` with an id stable for (trip, rule).
    pub fn into_task(self, trip_id: &str, now: DateTime<Utc>) -> Task {
        Task {
            id: rule_task_id(trip_id, &self.rule_id),
            trip_id: trip_id.to_string(),
            title: self.title,
            description: self.description,
            due_date: self.due_date,
            is_completed: false,
            is_urgent: self.priority == Priority::Blocking,
            category: self.category,
            priority: self.priority,
            rule_id: Some(self.rule_id),
            created_at: now,
            updated_at: now,
            synced_at: None,
        }
    }
}

/// Task id for a rule-generated task.
pub fn rule_task_id(trip_id: &str, rule_id: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{trip_id}/{rule_id}").as_bytes()).to_string()
}

/// Lead times (days before departure) used to date generated tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSet {
    pub passport_lead_days: i64,
    pub visa_lead_days: i64,
    pub vaccination_lead_days: i64,
    pub insurance_lead_days: i64,
    pub currency_lead_days: i64,
    pub adapter_lead_days: i64,
}

impl Default for RuleSet {
    fn default() -> Self {
        RuleSet {
            passport_lead_days: 60,
            visa_lead_days: 45,
            vaccination_lead_days: 42,
            insurance_lead_days: 14,
            currency_lead_days: 7,
            adapter_lead_days: 3,
        }
    }
}

fn slug(s: &str) -> String {
    s.trim()
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

impl RuleSet {
    /// Every task the trip context currently implies, in a stable order.
    pub fn generate(&self, snapshot: &TripSnapshot) -> Vec<RuleTask> {
        let trip = &snapshot.trip;
        let before = |days: i64| trip.start_date.map(|d| d - Duration::days(days));
        let mut out = Vec::new();

        if trip.has_international_leg() {
            out.push(RuleTask {
                rule_id: "passport".into(),
                title: "Check passport validity".into(),
                description: Some("Many countries require six months of validity beyond your return date.".into()),
                category: Category::Documentation,
                priority: Priority::Blocking,
                due_date: before(self.passport_lead_days),
            });
            out.push(RuleTask {
                rule_id: "insurance".into(),
                title: "Buy travel insurance".into(),
                description: None,
                category: Category::Financial,
                priority: Priority::Important,
                due_date: before(self.insurance_lead_days),
            });
        }

        let mut countries = BTreeSet::new();
        let mut currencies = BTreeSet::new();
        for dest in &trip.destinations {
            let country = slug(&dest.country);
            let international = trip.is_international(dest);

            if international && countries.insert(country.clone()) {
                out.push(RuleTask {
                    rule_id: format!("visa:{country}"),
                    title: format!("Check visa requirements for {}", dest.country.trim()),
                    description: None,
                    category: Category::Documentation,
                    priority: Priority::Blocking,
                    due_date: before(self.visa_lead_days),
                });
                out.push(RuleTask {
                    rule_id: format!("adapter:{country}"),
                    title: format!("Pack a power adapter for {}", dest.country.trim()),
                    description: None,
                    category: Category::Tech,
                    priority: Priority::Recommended,
                    due_date: before(self.adapter_lead_days),
                });
            }

            if dest.health_advisory {
                let rule_id = format!("vaccination:{country}");
                if !out.iter().any(|r| r.rule_id == rule_id) {
                    out.push(RuleTask {
                        rule_id,
                        title: format!("Check vaccinations for {}", dest.country.trim()),
                        description: None,
                        category: Category::Health,
                        priority: Priority::Blocking,
                        due_date: before(self.vaccination_lead_days),
                    });
                }
            }

            if let (Some(cur), Some(home)) = (dest.currency.as_deref(), trip.home_currency.as_deref()) {
                if !same_place(cur, home) && currencies.insert(cur.trim().to_uppercase()) {
                    out.push(RuleTask {
                        rule_id: format!("currency:{}", slug(cur)),
                        title: format!("Get {} currency", cur.trim().to_uppercase()),
                        description: None,
                        category: Category::Financial,
                        priority: Priority::Recommended,
                        due_date: before(self.currency_lead_days),
                    });
                }
            }
        }

        for transport in &snapshot.transports {
            if transport.mode != TransportMode::Flight {
                continue;
            }
            let Some(departure) = transport.departure_date else {
                continue;
            };
            out.push(RuleTask {
                rule_id: format!("checkin:{}:{}", slug(&transport.to_city), departure),
                title: format!("Online check-in for flight to {}", transport.to_city.trim()),
                description: transport.reference.as_ref().map(|r| format!("Booking reference {r}")),
                category: Category::Reservations,
                priority: Priority::Important,
                due_date: Some(departure - Duration::days(1)),
            });
        }

        out
    }
}
