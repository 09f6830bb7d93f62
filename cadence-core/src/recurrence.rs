//! Next-due-date calculator.
//!
//! Pure date arithmetic: identical `(rule, last_due)` inputs always yield
//! identical outputs. No clock, no storage. Callers with no prior instance
//! may pass "now" as `last_due`; strict monotonicity guarantees the result
//! lands in the future.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};

use crate::rule::{RecurrencePattern, RecurrenceRule};

/// Compute the due date following `last_due` under `rule`.
///
/// Returns `None` when the rule's `end_date` is set and the computed date
/// would exceed it. The `occurrence_count` bound is number-based, not
/// date-based, and lives in [`recurrence_ended`].
pub fn next_occurrence(rule: &RecurrenceRule, last_due: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let last_date = last_due.date_naive();
    let interval = rule.interval.max(1);

    let date = match rule.pattern {
        RecurrencePattern::Daily => last_date + Duration::days(i64::from(interval)),
        RecurrencePattern::Weekly => next_weekly_date(rule, last_date)?,
        RecurrencePattern::Monthly => {
            let anchor_day = rule.day_of_month.unwrap_or_else(|| last_date.day());
            let (year, month) = add_months(last_date.year(), last_date.month(), interval);
            let day = anchor_day.min(days_in_month(year, month));
            NaiveDate::from_ymd_opt(year, month, day)?
        }
        RecurrencePattern::Yearly => {
            let month = rule.month_of_year.unwrap_or_else(|| last_date.month());
            let anchor_day = rule.day_of_month.unwrap_or_else(|| last_date.day());
            let year = last_date.year() + interval as i32;
            // Feb 29 in a non-leap year snaps to Feb 28 here.
            let day = anchor_day.min(days_in_month(year, month));
            NaiveDate::from_ymd_opt(year, month, day)?
        }
    };

    let due = date.and_time(rule.time_of_day.to_naive()).and_utc();
    match rule.end_date {
        Some(end) if due > end => None,
        _ => Some(due),
    }
}

/// True when `occurrence_count` is set and the instance just completed was
/// the last one allowed. Uses instance numbers, never dates.
pub fn recurrence_ended(rule: &RecurrenceRule, completed_number: u32) -> bool {
    rule.occurrence_count
        .is_some_and(|cap| completed_number >= cap)
}

/// Weekly scan: first date after `last_date` whose weekday is allowed and
/// whose week offset from the week containing `last_date` divides evenly by
/// the interval. Weeks run Monday..Sunday.
fn next_weekly_date(rule: &RecurrenceRule, last_date: NaiveDate) -> Option<NaiveDate> {
    let interval = i64::from(rule.interval.max(1));
    let base_week = week_index(last_date);

    // The first allowed weekday in the next aligned week is at most
    // interval + 1 weeks out, so the scan is bounded.
    let mut date = last_date;
    for _ in 0..(7 * (interval + 1)) {
        date = date.succ_opt()?;
        let weekday = date.weekday().num_days_from_sunday() as u8;
        if !rule.days_of_week.contains(&weekday) {
            continue;
        }
        if (week_index(date) - base_week).rem_euclid(interval) == 0 {
            return Some(date);
        }
    }
    None
}

/// Whole weeks since an arbitrary fixed Monday. Only differences matter.
fn week_index(date: NaiveDate) -> i64 {
    let days = i64::from(date.num_days_from_ce());
    let monday_aligned = days - i64::from(date.weekday().num_days_from_monday());
    monday_aligned.div_euclid(7)
}

fn add_months(year: i32, month: u32, delta: u32) -> (i32, u32) {
    let zero_based = i64::from(year) * 12 + i64::from(month) - 1 + i64::from(delta);
    (
        zero_based.div_euclid(12) as i32,
        (zero_based.rem_euclid(12) + 1) as u32,
    )
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}
