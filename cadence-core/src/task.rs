//! Template + instance records.
//!
//! A template holds the recurrence rule and the canonical editable fields;
//! instances are the concrete, due-dated tasks generated from it. The
//! template-to-instance link is a nullable back-reference, not ownership:
//! instances can outlive their template under the "unlink" deletion policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::escalation::EscalationState;
use crate::rule::RecurrenceRule;

pub type TemplateId = String;
pub type InstanceId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// The editable fields a template owns and copies onto each new instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateFields {
    pub title: String,
    pub note: Option<String>,
    pub priority: Priority,
    /// Strict-mode tasks may block the consuming app once escalation reaches
    /// the top level.
    pub strict_mode: bool,
    /// Whether completing late requires an explanation to the coach.
    pub requires_explanation: bool,
}

impl TemplateFields {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            note: None,
            priority: Priority::Normal,
            strict_mode: false,
            requires_explanation: false,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn strict(mut self) -> Self {
        self.strict_mode = true;
        self
    }

    pub fn requiring_explanation(mut self) -> Self {
        self.requires_explanation = true;
        self
    }
}

/// Persistent holder of a recurrence rule. Never completed itself; only its
/// instances are.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub id: TemplateId,
    pub owner_id: String,
    pub list_id: String,
    pub fields: TemplateFields,
    pub rule: RecurrenceRule,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Pending,
    Done,
}

/// One concrete, completable task generated from a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub id: InstanceId,
    /// `None` once the owning template was deleted with the unlink policy.
    pub template_id: Option<TemplateId>,
    pub fields: TemplateFields,
    pub due_at: DateTime<Utc>,
    /// 1-based sequence within the template.
    pub instance_number: u32,
    pub status: InstanceStatus,
    pub escalation: EscalationState,
    /// Optimistic-lock counter, bumped by the store on every successful save.
    pub version: u64,
}

impl TaskInstance {
    /// Instance ids are derived, which is what makes regeneration after a
    /// crash idempotent.
    pub fn derived_id(template_id: &str, number: u32) -> InstanceId {
        format!("{template_id}#{number}")
    }

    pub fn is_pending(&self) -> bool {
        self.status == InstanceStatus::Pending
    }

    pub fn minutes_overdue(&self, now: DateTime<Utc>) -> i64 {
        (now - self.due_at).num_minutes().max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn derived_ids_are_stable() {
        assert_eq!(TaskInstance::derived_id("tpl-9", 4), "tpl-9#4");
    }

    #[test]
    fn minutes_overdue_clamps_to_zero_before_due() {
        let due = Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap();
        let inst = TaskInstance {
            id: "t#1".into(),
            template_id: Some("t".into()),
            fields: TemplateFields::new("stretch"),
            due_at: due,
            instance_number: 1,
            status: InstanceStatus::Pending,
            escalation: EscalationState::default(),
            version: 1,
        };
        assert_eq!(inst.minutes_overdue(due - Duration::minutes(30)), 0);
        assert_eq!(inst.minutes_overdue(due + Duration::minutes(90)), 90);
    }

    #[test]
    fn instance_json_roundtrip_is_stable() {
        let inst = TaskInstance {
            id: "t#1".into(),
            template_id: Some("t".into()),
            fields: TemplateFields::new("journal").with_priority(Priority::High),
            due_at: Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap(),
            instance_number: 1,
            status: InstanceStatus::Pending,
            escalation: EscalationState::default(),
            version: 1,
        };
        let json = serde_json::to_string(&inst).unwrap();
        assert!(json.contains("\"status\":\"pending\""));
        assert!(json.contains("\"priority\":\"high\""));

        let back: TaskInstance = serde_json::from_str(&json).unwrap();
        assert_eq!(back, inst);
    }
}
