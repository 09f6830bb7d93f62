//! Recurrence rule configuration + validation.
//!
//! A rule is the pattern/interval/day/time/bound tuple a template carries.
//! Validation runs when a template is created or edited; the calculator in
//! `crate::recurrence` assumes it only ever sees rules that passed here.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecurrencePattern {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

/// Wall-clock anchor applied to every computed due date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeOfDay {
    pub hour: u32,
    pub minute: u32,
}

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32) -> Self {
        Self { hour, minute }
    }

    pub(crate) fn to_naive(self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour, self.minute, 0).unwrap_or_default()
    }
}

impl Default for TimeOfDay {
    fn default() -> Self {
        Self { hour: 9, minute: 0 }
    }
}

/// Recurrence configuration held by a template.
///
/// `day_of_month` / `month_of_year` are the anchors captured at template
/// creation; monthly and yearly snapping always works from these, never from
/// the (possibly already snapped) previous instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pub pattern: RecurrencePattern,
    pub interval: u32,
    /// Weekday indices, 0 = Sunday .. 6 = Saturday. Required for weekly.
    pub days_of_week: BTreeSet<u8>,
    pub time_of_day: TimeOfDay,
    pub day_of_month: Option<u32>,
    pub month_of_year: Option<u32>,
    /// Inclusive upper bound on generated due dates.
    pub end_date: Option<DateTime<Utc>>,
    /// Cap on total generated instances, checked against instance numbers.
    pub occurrence_count: Option<u32>,
}

impl RecurrenceRule {
    pub fn new(pattern: RecurrencePattern) -> Self {
        Self {
            pattern,
            interval: 1,
            days_of_week: BTreeSet::new(),
            time_of_day: TimeOfDay::default(),
            day_of_month: None,
            month_of_year: None,
            end_date: None,
            occurrence_count: None,
        }
    }

    pub fn with_interval(mut self, interval: u32) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_days(mut self, days: impl IntoIterator<Item = u8>) -> Self {
        self.days_of_week = days.into_iter().collect();
        self
    }

    pub fn with_time(mut self, hour: u32, minute: u32) -> Self {
        self.time_of_day = TimeOfDay::new(hour, minute);
        self
    }

    pub fn with_end_date(mut self, end: DateTime<Utc>) -> Self {
        self.end_date = Some(end);
        self
    }

    pub fn with_occurrence_count(mut self, count: u32) -> Self {
        self.occurrence_count = Some(count);
        self
    }

    /// Minimal invariants for safe downstream date math.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.interval < 1 {
            return Err(EngineError::InvalidRule("interval must be >= 1".into()));
        }
        if self.pattern == RecurrencePattern::Weekly {
            if self.days_of_week.is_empty() {
                return Err(EngineError::InvalidRule(
                    "weekly pattern requires at least one day of week".into(),
                ));
            }
            if let Some(bad) = self.days_of_week.iter().find(|d| **d > 6) {
                return Err(EngineError::InvalidRule(format!(
                    "day of week index {bad} out of range 0-6"
                )));
            }
        }
        if self.end_date.is_some() && self.occurrence_count.is_some() {
            return Err(EngineError::InvalidRule(
                "end_date and occurrence_count are mutually exclusive".into(),
            ));
        }
        if self.occurrence_count == Some(0) {
            return Err(EngineError::InvalidRule(
                "occurrence_count must be >= 1 when set".into(),
            ));
        }
        if self.time_of_day.hour > 23 || self.time_of_day.minute > 59 {
            return Err(EngineError::InvalidRule(format!(
                "time of day {:02}:{:02} out of range",
                self.time_of_day.hour, self.time_of_day.minute
            )));
        }
        if let Some(day) = self.day_of_month {
            if !(1..=31).contains(&day) {
                return Err(EngineError::InvalidRule(format!(
                    "day of month {day} out of range 1-31"
                )));
            }
        }
        if let Some(month) = self.month_of_year {
            if !(1..=12).contains(&month) {
                return Err(EngineError::InvalidRule(format!(
                    "month {month} out of range 1-12"
                )));
            }
        }
        Ok(())
    }
}
