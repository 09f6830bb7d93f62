//! Template <-> instance orchestration.
//!
//! Creation with per-key deduplication, next-instance generation on
//! completion, edit propagation to pending future instances, and the
//! cascade-vs-unlink deletion policy.

use chrono::{DateTime, Datelike, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::EngineError;
use crate::escalation::EscalationState;
use crate::lock::{KeyedLock, lock_key};
use crate::recurrence::{next_occurrence, recurrence_ended};
use crate::rule::{RecurrencePattern, RecurrenceRule};
use crate::store::TaskStore;
use crate::task::{InstanceStatus, Priority, TaskInstance, TaskTemplate, TemplateFields};

/// Field edits applied to a template. `note: Some(None)` clears the note.
///
/// Only title and note propagate to instances; due dates and recurrence
/// parameters deliberately do not.
#[derive(Debug, Clone, Default)]
pub struct TemplateChanges {
    pub title: Option<String>,
    pub note: Option<Option<String>>,
    pub priority: Option<Priority>,
    pub strict_mode: Option<bool>,
    pub requires_explanation: Option<bool>,
    pub rule: Option<RecurrenceRule>,
}

impl TemplateChanges {
    pub fn retitle(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }
}

/// Retries per instance when edit propagation loses a version race.
const PROPAGATE_RETRIES: u32 = 3;

pub struct TemplateManager<S, L, C> {
    store: S,
    locks: L,
    clock: C,
}

impl<S: TaskStore, L: KeyedLock, C: Clock> TemplateManager<S, L, C> {
    pub fn new(store: S, locks: L, clock: C) -> Self {
        Self {
            store,
            locks,
            clock,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Create a template plus its first instance.
    ///
    /// Serialized per (owner, list, title): concurrent duplicate requests all
    /// resolve to the single pair that won. The first instance's due date is
    /// `first_due` verbatim; it anchors all future recurrence math.
    pub fn create_template(
        &self,
        owner_id: &str,
        list_id: &str,
        fields: TemplateFields,
        rule: RecurrenceRule,
        first_due: DateTime<Utc>,
    ) -> Result<(TaskTemplate, TaskInstance), EngineError> {
        rule.validate()?;
        let key = lock_key(&[owner_id, list_id, &fields.title]);
        self.locks.with_lock(key, || {
            if let Some(existing) = self.store.find_template(owner_id, list_id, &fields.title) {
                let first = self
                    .store
                    .instance_by_number(&existing.id, 1)
                    .ok_or(EngineError::NotFound {
                        kind: "instance",
                        id: TaskInstance::derived_id(&existing.id, 1),
                    })?;
                return Ok((existing, first));
            }

            let rule = anchored(rule, first_due);
            let template = TaskTemplate {
                id: Uuid::new_v4().to_string(),
                owner_id: owner_id.to_string(),
                list_id: list_id.to_string(),
                fields: fields.clone(),
                rule,
                created_at: self.clock.now(),
            };
            let instance = TaskInstance {
                id: TaskInstance::derived_id(&template.id, 1),
                template_id: Some(template.id.clone()),
                fields,
                due_at: first_due,
                instance_number: 1,
                status: InstanceStatus::Pending,
                escalation: EscalationState::default(),
                version: 1,
            };
            self.store.put_template(template.clone());
            self.store.put_instance(instance.clone());
            Ok((template, instance))
        })
    }

    /// Materialize the occurrence following `completed`, or `None` when the
    /// template is gone, unlinked, or its recurrence has ended.
    ///
    /// Idempotent: if the target instance number already exists it is
    /// returned as-is, so replaying a completion after a crash is safe.
    pub fn generate_next(&self, completed: &TaskInstance) -> Option<TaskInstance> {
        let template_id = completed.template_id.as_deref()?;
        let Some(template) = self.store.template(template_id) else {
            debug!(template_id, "template gone, treating recurrence as ended");
            return None;
        };
        if recurrence_ended(&template.rule, completed.instance_number) {
            return None;
        }

        let next_number = completed.instance_number + 1;
        if let Some(existing) = self.store.instance_by_number(template_id, next_number) {
            return Some(existing);
        }

        let due_at = next_occurrence(&template.rule, completed.due_at)?;
        let instance = TaskInstance {
            id: TaskInstance::derived_id(template_id, next_number),
            template_id: Some(template.id.clone()),
            fields: template.fields.clone(),
            due_at,
            instance_number: next_number,
            status: InstanceStatus::Pending,
            escalation: EscalationState::default(),
            version: 1,
        };
        self.store.put_instance(instance.clone());
        Some(instance)
    }

    /// Apply `changes` to the template; title and note also propagate to
    /// every future, not-yet-completed instance. Past or done instances are
    /// never mutated.
    pub fn update_template(
        &self,
        template_id: &str,
        mut changes: TemplateChanges,
    ) -> Result<TaskTemplate, EngineError> {
        let mut template = self
            .store
            .template(template_id)
            .ok_or_else(|| EngineError::TemplateGone(template_id.to_string()))?;

        if let Some(rule) = changes.rule.take() {
            rule.validate()?;
            template.rule = rule;
        }
        if let Some(priority) = changes.priority {
            template.fields.priority = priority;
        }
        if let Some(strict) = changes.strict_mode {
            template.fields.strict_mode = strict;
        }
        if let Some(requires) = changes.requires_explanation {
            template.fields.requires_explanation = requires;
        }
        if let Some(ref title) = changes.title {
            template.fields.title = title.clone();
        }
        if let Some(ref note) = changes.note {
            template.fields.note = note.clone();
        }
        self.store.put_template(template.clone());

        if changes.title.is_some() || changes.note.is_some() {
            let now = self.clock.now();
            for instance in self.store.instances_of(template_id) {
                self.propagate_fields(instance, &changes, now)?;
            }
        }
        Ok(template)
    }

    /// Push title/note onto one future pending instance. A lost version race
    /// is retried against a fresh copy of that instance alone; the rest of
    /// the propagation loop is unaffected.
    fn propagate_fields(
        &self,
        mut instance: TaskInstance,
        changes: &TemplateChanges,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let mut attempts = 0;
        loop {
            if instance.status == InstanceStatus::Done || instance.due_at <= now {
                return Ok(());
            }
            if let Some(ref title) = changes.title {
                instance.fields.title = title.clone();
            }
            if let Some(ref note) = changes.note {
                instance.fields.note = note.clone();
            }
            let id = instance.id.clone();
            match self.store.save_instance(instance) {
                Ok(_) => return Ok(()),
                Err(EngineError::ConcurrentModification(_)) if attempts < PROPAGATE_RETRIES => {
                    attempts += 1;
                    match self.store.instance(&id) {
                        Some(fresh) => instance = fresh,
                        None => return Ok(()),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Delete a template. `cascade` destroys every referencing instance;
    /// otherwise each instance is unlinked first so it survives on its own.
    pub fn delete_template(&self, template_id: &str, cascade: bool) -> Result<(), EngineError> {
        let template = self
            .store
            .template(template_id)
            .ok_or_else(|| EngineError::TemplateGone(template_id.to_string()))?;

        for instance in self.store.instances_of(&template.id) {
            if cascade {
                self.store.remove_instance(&instance.id);
            } else {
                let mut instance = instance;
                instance.template_id = None;
                self.store.save_instance(instance)?;
            }
        }
        self.store.remove_template(&template.id);
        Ok(())
    }
}

/// Capture monthly/yearly anchors from the first due date so later snapping
/// always works from the original day, not a snapped one.
fn anchored(mut rule: RecurrenceRule, first_due: DateTime<Utc>) -> RecurrenceRule {
    match rule.pattern {
        RecurrencePattern::Monthly => {
            if rule.day_of_month.is_none() {
                rule.day_of_month = Some(first_due.day());
            }
        }
        RecurrencePattern::Yearly => {
            if rule.day_of_month.is_none() {
                rule.day_of_month = Some(first_due.day());
            }
            if rule.month_of_year.is_none() {
                rule.month_of_year = Some(first_due.month());
            }
        }
        RecurrencePattern::Daily | RecurrencePattern::Weekly => {}
    }
    rule
}
