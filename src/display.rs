//! Terminal formatting and date input helpers for the command handlers.

use chrono::{Duration, NaiveDate};

use crate::fields::{format_category, format_priority, TimeWindow};
use crate::task::EnrichedTask;

/// Parse a due date: `YYYY-MM-DD`, "today", "tomorrow", "in Nd" or "in Nw".
///
/// Relative forms are resolved against `today`.
pub fn parse_due_input(s: &str, today: NaiveDate) -> Option<NaiveDate> {
    let s = s.trim().to_lowercase();
    match s.as_str() {
        "today" => return Some(today),
        "tomorrow" => return Some(today + Duration::days(1)),
        _ => {}
    }

    if let Some(rest) = s.strip_prefix("in ") {
        if let Some(nd) = rest.strip_suffix('d') {
            if let Ok(days) = nd.trim().parse::<i64>() {
                return Some(today + Duration::days(days));
            }
        }
        if let Some(nw) = rest.strip_suffix('w') {
            if let Ok(weeks) = nw.trim().parse::<i64>() {
                return Some(today + Duration::weeks(weeks));
            }
        }
    }

    NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()
}

/// Format a due date relative to today ("today", "tomorrow", "in 3d", "2d late").
pub fn format_due_relative(due: Option<NaiveDate>, today: NaiveDate) -> String {
    match due {
        None => "-".into(),
        Some(d) => {
            let days = (d - today).num_days();
            match days {
                0 => "today".into(),
                1 => "tomorrow".into(),
                n if n > 1 => format!("in {}d", n),
                n => format!("{}d late", -n),
            }
        }
    }
}

pub fn format_window(w: TimeWindow) -> &'static str {
    match w {
        TimeWindow::General => "General",
        TimeWindow::Overdue => "Overdue",
        TimeWindow::MonthsBefore => "Months before",
        TimeWindow::WeeksBefore => "Weeks before",
        TimeWindow::DaysBefore => "Days before",
        TimeWindow::DepartureDay => "Departure",
    }
}

/// Truncate a string to a maximum width, adding an ellipsis if needed.
pub fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        s.to_string()
    } else {
        let mut out = String::new();
        for (i, ch) in s.chars().enumerate() {
            if i + 1 >= width {
                out.push('…');
                break;
            }
            out.push(ch);
        }
        out
    }
}

/// Short id prefix shown in tables.
pub fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

pub fn print_table(tasks: &[EnrichedTask], today: NaiveDate) {
    println!(
        "{:<9} {:<4} {:<12} {:<12} {:<10} {:<22} {}",
        "ID", "Done", "Category", "Priority", "Due", "When", "Title"
    );
    for t in tasks {
        let task = &t.task;
        let flag = if task.is_urgent { " !" } else { "" };
        println!(
            "{:<9} {:<4} {:<12} {:<12} {:<10} {:<22} {}{}",
            short_id(&task.id),
            if task.is_completed { "[x]" } else { "[ ]" },
            format_category(task.category),
            format_priority(task.priority),
            format_due_relative(task.due_date, today),
            truncate(&t.smart_time_window, 22),
            task.title,
            flag
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_parse_due_input_forms() {
        let today = day(2030, 5, 10);
        assert_eq!(parse_due_input("today", today), Some(today));
        assert_eq!(parse_due_input("Tomorrow", today), Some(day(2030, 5, 11)));
        assert_eq!(parse_due_input("in 3d", today), Some(day(2030, 5, 13)));
        assert_eq!(parse_due_input("in 2w", today), Some(day(2030, 5, 24)));
        assert_eq!(parse_due_input("2030-06-01", today), Some(day(2030, 6, 1)));
        assert_eq!(parse_due_input("someday", today), None);
    }

    #[test]
    fn test_format_due_relative() {
        let today = day(2030, 5, 10);
        assert_eq!(format_due_relative(None, today), "-");
        assert_eq!(format_due_relative(Some(today), today), "today");
        assert_eq!(format_due_relative(Some(day(2030, 5, 15)), today), "in 5d");
        assert_eq!(format_due_relative(Some(day(2030, 5, 8)), today), "2d late");
    }

    #[test]
    fn test_truncate_and_short_id() {
        assert_eq!(truncate("passport", 20), "passport");
        assert_eq!(truncate("abcdef", 4), "abc…");
        assert_eq!(short_id("1234567890"), "12345678");
        assert_eq!(short_id("abc"), "abc");
    }
}
