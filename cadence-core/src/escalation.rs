//! Overdue escalation state machine.
//!
//! One state record per schedulable instance. Transitions are pure mutations
//! over the in-memory record; persistence and the decision of *when* to
//! advance belong to the caller (see `crate::orchestrator`). The machine
//! never consults a clock of its own — every stamping method takes `now`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ordered severity: `Normal < Warning < Critical < Blocking`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationLevel {
    Normal,
    Warning,
    Critical,
    Blocking,
}

impl EscalationLevel {
    /// One level up; Blocking is terminal.
    pub fn next(self) -> Self {
        match self {
            EscalationLevel::Normal => EscalationLevel::Warning,
            EscalationLevel::Warning => EscalationLevel::Critical,
            EscalationLevel::Critical => EscalationLevel::Blocking,
            EscalationLevel::Blocking => EscalationLevel::Blocking,
        }
    }
}

impl std::fmt::Display for EscalationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EscalationLevel::Normal => write!(f, "normal"),
            EscalationLevel::Warning => write!(f, "warning"),
            EscalationLevel::Critical => write!(f, "critical"),
            EscalationLevel::Blocking => write!(f, "blocking"),
        }
    }
}

/// Per-instance overdue severity record.
///
/// Invariants: `blocking_app` implies `level == Blocking`; `level` only moves
/// forward via [`advance`](Self::advance), except a full [`reset`](Self::reset).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationState {
    pub level: EscalationLevel,
    pub notification_count: u32,
    pub last_notified_at: Option<DateTime<Utc>>,
    /// Set once, on the first `mark_overdue` call.
    pub became_overdue_at: Option<DateTime<Utc>>,
    pub coaches_notified: bool,
    pub coaches_notified_at: Option<DateTime<Utc>>,
    pub blocking_app: bool,
    pub blocking_started_at: Option<DateTime<Utc>>,
}

impl Default for EscalationState {
    fn default() -> Self {
        Self {
            level: EscalationLevel::Normal,
            notification_count: 0,
            last_notified_at: None,
            became_overdue_at: None,
            coaches_notified: false,
            coaches_notified_at: None,
            blocking_app: false,
            blocking_started_at: None,
        }
    }
}

impl EscalationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move exactly one level forward. No-op once Blocking is reached;
    /// repeated calls there never re-stamp `blocking_started_at`.
    pub fn advance(&mut self, now: DateTime<Utc>) {
        if self.level == EscalationLevel::Blocking {
            return;
        }
        self.level = self.level.next();
        if self.level == EscalationLevel::Blocking {
            self.blocking_app = true;
            if self.blocking_started_at.is_none() {
                self.blocking_started_at = Some(now);
            }
        }
    }

    /// Stamp `became_overdue_at` on the first call only.
    pub fn mark_overdue(&mut self, now: DateTime<Utc>) {
        if self.became_overdue_at.is_none() {
            self.became_overdue_at = Some(now);
        }
    }

    /// Count a dispatched reminder. Never gated by level.
    pub fn increment_notification(&mut self, now: DateTime<Utc>) {
        self.notification_count += 1;
        self.last_notified_at = Some(now);
    }

    /// Record that coaches were alerted; idempotent.
    pub fn notify_coaches(&mut self, now: DateTime<Utc>) {
        if !self.coaches_notified {
            self.coaches_notified = true;
            self.coaches_notified_at = Some(now);
        }
    }

    /// Back to the initial state, whatever the history. The caller decides
    /// when (task completed, or reassigned to a future due date).
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Alias for [`reset`](Self::reset).
    pub fn clear(&mut self) {
        self.reset();
    }
}
