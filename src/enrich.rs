//! Task enrichment: contextual guidance and time-window classification.
//!
//! Enrichment is a pure function of (task, trip, today) and an immutable
//! `GuidanceTable` supplied at construction. Nothing here is persisted; the
//! result is recomputed on every query.
//!
//! ## Keyword table order
//!
//! Titles are matched case-insensitively against the keyword entries in this
//! fixed order, and the first entry with any matching keyword wins:
//!
//! 1. passport
//! 2. visa
//! 3. insurance
//! 4. vaccination
//! 5. bank
//! 6. currency
//! 7. packing
//! 8. liquids
//! 9. adapter
//! 10. check-in
//! 11. connectivity
//!
//! "Renew passport and visa" therefore gets passport guidance. When nothing
//! matches, the per-category fallback (documentation, health) applies.

use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::fields::{Category, TimeWindow};
use crate::task::{EnrichedTask, GuidanceLink, Task, TaskGuidance};
use crate::trip::Trip;

/// One row of the keyword table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordGuidance {
    /// Name of the entry, for diagnostics.
    pub topic: String,
    /// Lower-case substrings; any one matching selects this entry.
    pub keywords: Vec<String>,
    pub guidance: TaskGuidance,
}

/// Immutable guidance configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuidanceTable {
    pub keywords: Vec<KeywordGuidance>,
    pub category_fallbacks: BTreeMap<Category, TaskGuidance>,
}

fn entry(topic: &str, keywords: &[&str], why: &str, when: &str, how: &str, links: &[(&str, &str)]) -> KeywordGuidance {
    KeywordGuidance {
        topic: topic.to_string(),
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
        guidance: TaskGuidance {
            why: Some(why.to_string()),
            when: Some(when.to_string()),
            how: Some(how.to_string()),
            links: links
                .iter()
                .map(|(label, url)| GuidanceLink {
                    label: label.to_string(),
                    url: url.to_string(),
                })
                .collect(),
        },
    }
}

impl Default for GuidanceTable {
    fn default() -> Self {
        let keywords = vec![
            entry(
                "passport",
                &["passport"],
                "Many countries refuse entry unless your passport is valid for at least six months beyond your return date and has blank pages.",
                "Check at least 3 months before departure; renewals can take 6-10 weeks.",
                "Check the expiry date and free pages, then apply for renewal through your passport office's online service.",
                &[("Passport validity rules", "https://www.iatatravelcentre.com/")],
            ),
            entry(
                "visa",
                &["visa", "esta", "eta ", "entry permit"],
                "Without the right visa or travel authorisation you can be denied boarding.",
                "Apply 4-8 weeks before departure; some visas take longer.",
                "Check the destination's official immigration site for your nationality, then apply online or at the consulate.",
                &[("Entry requirements", "https://www.iatatravelcentre.com/")],
            ),
            entry(
                "insurance",
                &["insurance"],
                "Medical treatment abroad can be very expensive and cancellations are only refundable with cover.",
                "Buy as soon as the trip is booked so cancellation cover applies.",
                "Compare policies for medical, cancellation and baggage cover; keep the policy number offline.",
                &[],
            ),
            entry(
                "vaccination",
                &["vaccin", "immunis", "immuniz", "malaria"],
                "Some destinations require proof of vaccination and some vaccines need several weeks to take effect.",
                "See a travel clinic 6-8 weeks before departure.",
                "Book a travel health appointment and bring your vaccination record.",
                &[],
            ),
            entry(
                "bank",
                &["bank", "credit card", "debit card"],
                "Cards used abroad without notice can be blocked for suspected fraud.",
                "1-2 weeks before departure.",
                "Set a travel notice in your banking app and check foreign transaction fees.",
                &[],
            ),
            entry(
                "currency",
                &["currency", "cash", "exchange money", "foreign exchange"],
                "Card acceptance varies and airport exchange rates are poor.",
                "About a week before departure.",
                "Order a small amount of local cash from your bank or plan to withdraw from an ATM on arrival.",
                &[],
            ),
            entry(
                "packing",
                &["packing", "luggage", "suitcase", "baggage"],
                "Airlines charge for overweight or extra bags and lost items are hard to replace abroad.",
                "Start 2-3 days before departure.",
                "Check your airline's allowance and pack essentials and medication in hand luggage.",
                &[],
            ),
            entry(
                "liquids",
                &["liquid", "toiletr"],
                "Security screening limits liquids in hand luggage to 100 ml containers.",
                "When packing hand luggage.",
                "Use containers of 100 ml or less in a single clear resealable bag.",
                &[],
            ),
            entry(
                "adapter",
                &["adapter", "adaptor", "plug"],
                "Socket types and voltages differ between countries.",
                "Before packing, a few days before departure.",
                "Check the destination's plug type and buy a universal adapter.",
                &[],
            ),
            entry(
                "check-in",
                &["check-in", "check in", "checkin"],
                "Online check-in saves queueing and secures seat choices.",
                "Usually opens 24-48 hours before departure.",
                "Use the airline's app or website with your booking reference and save the boarding pass offline.",
                &[],
            ),
            entry(
                "connectivity",
                &["sim card", "esim", "roaming", "connectivity", "mobile data"],
                "Roaming charges can be high and you'll need data for maps and bookings.",
                "A few days before departure.",
                "Check your roaming plan or buy a local or eSIM data plan before you go.",
                &[],
            ),
        ];

        let mut category_fallbacks = BTreeMap::new();
        category_fallbacks.insert(
            Category::Documentation,
            TaskGuidance {
                why: Some("Missing travel documents are the most common reason for being refused boarding.".into()),
                when: Some("Well before departure; official processing times vary.".into()),
                how: None,
                links: vec![],
            },
        );
        category_fallbacks.insert(
            Category::Health,
            TaskGuidance {
                why: Some("Health preparation protects you when medical care abroad is hard to reach.".into()),
                when: Some("Several weeks before departure.".into()),
                how: None,
                links: vec![],
            },
        );

        GuidanceTable {
            keywords,
            category_fallbacks,
        }
    }
}

impl GuidanceTable {
    /// Guidance for a title/category pair: first keyword match, else category fallback.
    pub fn lookup(&self, title: &str, category: Category) -> TaskGuidance {
        let title = title.to_lowercase();
        self.keywords
            .iter()
            .find(|e| e.keywords.iter().any(|k| title.contains(k.as_str())))
            .map(|e| e.guidance.clone())
            .or_else(|| self.category_fallbacks.get(&category).cloned())
            .unwrap_or_default()
    }
}

/// Classify a task into a time-window bucket and its display label.
///
/// `days_until_trip` drives the bucket; the due date only decides between
/// `general` (no due date), `overdue`, and the trip-relative buckets.
pub fn classify_window(
    due_date: Option<NaiveDate>,
    is_completed: bool,
    trip_start: Option<NaiveDate>,
    today: NaiveDate,
) -> (TimeWindow, &'static str) {
    let Some(due) = due_date else {
        return (TimeWindow::General, "anytime");
    };
    if (due - today).num_days() < 0 && !is_completed {
        return (TimeWindow::Overdue, "overdue");
    }
    let Some(start) = trip_start else {
        return (TimeWindow::General, "anytime");
    };
    match (start - today).num_days() {
        d if d > 30 => (TimeWindow::MonthsBefore, "more than 30 days before"),
        d if d > 14 => (TimeWindow::WeeksBefore, "2 weeks before"),
        d if d > 7 => (TimeWindow::WeeksBefore, "1 week before"),
        d if d > 3 => (TimeWindow::DaysBefore, "this week"),
        d if d > 0 => (TimeWindow::DaysBefore, "eve / 3 days before"),
        _ => (TimeWindow::DepartureDay, "departure day"),
    }
}

/// Derives guidance and time windows for tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskEnricher {
    table: GuidanceTable,
}

impl TaskEnricher {
    pub fn new(table: GuidanceTable) -> Self {
        TaskEnricher { table }
    }

    pub fn enrich(&self, task: &Task, trip: &Trip, today: NaiveDate) -> EnrichedTask {
        let (time_window, label) = classify_window(task.due_date, task.is_completed, trip.start_date, today);
        EnrichedTask {
            task: task.clone(),
            context: self.table.lookup(&task.title, task.category),
            time_window,
            smart_time_window: label.to_string(),
        }
    }

    pub fn enrich_all(&self, tasks: &[Task], trip: &Trip, today: NaiveDate) -> Vec<EnrichedTask> {
        tasks.iter().map(|t| self.enrich(t, trip, today)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::NewTask;
    use chrono::{Duration, Utc};

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()
    }

    fn trip_starting_in(days: i64) -> Trip {
        Trip {
            id: "trip".into(),
            name: "Test".into(),
            start_date: Some(today() + Duration::days(days)),
            end_date: None,
            home_country: None,
            home_currency: None,
            destinations: vec![],
        }
    }

    fn task(title: &str, category: Category, due: Option<NaiveDate>) -> Task {
        let mut input = NewTask::titled(title);
        input.category = category;
        input.due_date = due;
        Task::new("trip", input, Utc::now())
    }

    #[test]
    fn test_renew_passport_scenario() {
        let trip = trip_starting_in(20);
        let start = trip.start_date.unwrap();
        let t = task("Renew passport", Category::Documentation, Some(start - Duration::days(10)));
        let enriched = TaskEnricher::default().enrich(&t, &trip, today());
        assert_eq!(enriched.smart_time_window, "2 weeks before");
        assert_eq!(enriched.time_window, TimeWindow::WeeksBefore);
        assert!(enriched.context.why.unwrap().contains("valid"));
    }

    #[test]
    fn test_no_due_date_is_always_general() {
        let enricher = TaskEnricher::default();
        for days in [-5, 0, 2, 10, 90] {
            for category in [Category::Documentation, Category::Packing, Category::Other] {
                let t = task("Anything", category, None);
                let enriched = enricher.enrich(&t, &trip_starting_in(days), today());
                assert_eq!(enriched.time_window, TimeWindow::General);
            }
        }
    }

    #[test]
    fn test_overdue_regardless_of_category() {
        let enricher = TaskEnricher::default();
        let yesterday = today() - Duration::days(1);
        for category in [Category::Health, Category::Tech, Category::Financial] {
            let t = task("Something", category, Some(yesterday));
            let enriched = enricher.enrich(&t, &trip_starting_in(60), today());
            assert_eq!(enriched.time_window, TimeWindow::Overdue);
        }
    }

    #[test]
    fn test_completed_past_due_is_not_overdue() {
        let mut t = task("Something", Category::Other, Some(today() - Duration::days(3)));
        t.is_completed = true;
        let enriched = TaskEnricher::default().enrich(&t, &trip_starting_in(10), today());
        assert_eq!(enriched.smart_time_window, "1 week before");
    }

    #[test]
    fn test_window_boundaries() {
        let due = Some(today() + Duration::days(1));
        let cases = [
            (31, TimeWindow::MonthsBefore, "more than 30 days before"),
            (30, TimeWindow::WeeksBefore, "2 weeks before"),
            (15, TimeWindow::WeeksBefore, "2 weeks before"),
            (14, TimeWindow::WeeksBefore, "1 week before"),
            (8, TimeWindow::WeeksBefore, "1 week before"),
            (7, TimeWindow::DaysBefore, "this week"),
            (4, TimeWindow::DaysBefore, "this week"),
            (3, TimeWindow::DaysBefore, "eve / 3 days before"),
            (1, TimeWindow::DaysBefore, "eve / 3 days before"),
            (0, TimeWindow::DepartureDay, "departure day"),
            (-2, TimeWindow::DepartureDay, "departure day"),
        ];
        for (days, window, label) in cases {
            let start = Some(today() + Duration::days(days));
            assert_eq!(classify_window(due, false, start, today()), (window, label), "days = {days}");
        }
    }

    #[test]
    fn test_first_keyword_in_table_order_wins() {
        let table = GuidanceTable::default();
        let both = table.lookup("Renew passport and visa", Category::Other);
        let passport = table.lookup("passport", Category::Other);
        assert_eq!(both, passport);

        let adapter = table.lookup("Pack a power adapter for Japan", Category::Tech);
        assert!(adapter.how.unwrap().contains("plug type"));
    }

    #[test]
    fn test_category_fallback_and_empty() {
        let table = GuidanceTable::default();
        let doc = table.lookup("Print boarding docs", Category::Documentation);
        assert!(doc.why.unwrap().contains("refused boarding"));
        assert!(table.lookup("Water the plants", Category::Other).is_empty());
    }

    #[test]
    fn test_injected_table_is_used() {
        let table = GuidanceTable {
            keywords: vec![entry("plants", &["plants"], "They wilt.", "Day before.", "Ask a neighbour.", &[])],
            category_fallbacks: BTreeMap::new(),
        };
        let enricher = TaskEnricher::new(table);
        let t = task("Water the plants", Category::Other, None);
        let enriched = enricher.enrich(&t, &trip_starting_in(5), today());
        assert_eq!(enriched.context.why.as_deref(), Some("They wilt."));
    }
}
