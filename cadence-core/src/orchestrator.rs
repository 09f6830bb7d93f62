//! Periodic tick driver.
//!
//! Each tick scans overdue pending instances, drives the escalation state
//! machine according to the configured thresholds, hands notifications to
//! the dispatcher, and on completion events spawns the next occurrence.
//! Per-instance failures are logged and counted, never propagated: a bad
//! instance must not take down the rest of the tick.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::EngineError;
use crate::escalation::{EscalationLevel, EscalationState};
use crate::lock::KeyedLock;
use crate::manager::TemplateManager;
use crate::notify::{NotificationKind, Notifier};
use crate::store::TaskStore;
use crate::task::{InstanceStatus, TaskInstance};

/// Elapsed-overdue-time thresholds and cadences. Configuration, not engine
/// behavior: hosts tune these per deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationPolicy {
    /// Minutes overdue before Warning is warranted.
    pub warning_after_minutes: i64,
    /// Minutes overdue before Critical.
    pub critical_after_minutes: i64,
    /// Minutes overdue before Blocking.
    pub blocking_after_minutes: i64,
    /// Minimum minutes between reminder dispatches per instance.
    pub reminder_cadence_minutes: i64,
    /// Level at which coaches are alerted.
    pub coach_alert_level: EscalationLevel,
    /// Per-instance retries when a save loses a version race.
    pub max_retries: u32,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            warning_after_minutes: 60,
            critical_after_minutes: 24 * 60,
            blocking_after_minutes: 3 * 24 * 60,
            reminder_cadence_minutes: 4 * 60,
            coach_alert_level: EscalationLevel::Critical,
            max_retries: 3,
        }
    }
}

impl EscalationPolicy {
    /// Highest level warranted after `minutes_overdue`.
    pub fn level_for(&self, minutes_overdue: i64) -> EscalationLevel {
        if minutes_overdue >= self.blocking_after_minutes {
            EscalationLevel::Blocking
        } else if minutes_overdue >= self.critical_after_minutes {
            EscalationLevel::Critical
        } else if minutes_overdue >= self.warning_after_minutes {
            EscalationLevel::Warning
        } else {
            EscalationLevel::Normal
        }
    }

    fn reminder_due(&self, state: &EscalationState, now: DateTime<Utc>) -> bool {
        match state.last_notified_at {
            None => true,
            Some(last) => (now - last).num_minutes() >= self.reminder_cadence_minutes,
        }
    }
}

/// Counters for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub scanned: usize,
    pub advanced: usize,
    pub notifications: usize,
    pub errors: usize,
}

#[derive(Debug, Default)]
struct Escalated {
    advanced: usize,
    notified: usize,
}

pub struct Orchestrator<S, L, C, N> {
    manager: TemplateManager<S, L, C>,
    notifier: N,
    policy: EscalationPolicy,
}

impl<S: TaskStore, L: KeyedLock, C: Clock, N: Notifier> Orchestrator<S, L, C, N> {
    pub fn new(manager: TemplateManager<S, L, C>, notifier: N, policy: EscalationPolicy) -> Self {
        Self {
            manager,
            notifier,
            policy,
        }
    }

    pub fn manager(&self) -> &TemplateManager<S, L, C> {
        &self.manager
    }

    pub fn policy(&self) -> &EscalationPolicy {
        &self.policy
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    /// One scan over everything overdue and pending. Each instance is
    /// processed independently; a failure only affects that instance.
    pub fn tick(&self) -> TickReport {
        let now = self.manager.clock().now();
        let mut report = TickReport::default();
        for stale in self.manager.store().due_before(now) {
            report.scanned += 1;
            match self.process_overdue(&stale.id, now) {
                Ok(outcome) => {
                    report.advanced += outcome.advanced;
                    report.notifications += outcome.notified;
                }
                Err(err) => {
                    warn!(instance = %stale.id, error = %err, "tick failed for instance");
                    report.errors += 1;
                }
            }
        }
        report
    }

    /// Completion event from the caller: spawn the next occurrence. The new
    /// instance starts from a clean escalation slate; the completed one's
    /// record stays untouched as history.
    pub fn handle_completion(
        &self,
        completed_id: &str,
    ) -> Result<Option<TaskInstance>, EngineError> {
        let store = self.manager.store();
        let mut completed = store.instance(completed_id).ok_or(EngineError::NotFound {
            kind: "instance",
            id: completed_id.to_string(),
        })?;
        if completed.status == InstanceStatus::Pending {
            completed.status = InstanceStatus::Done;
            completed = store.save_instance(completed)?;
        }

        // A replayed completion finds the successor already materialized; it
        // must stay untouched, escalation history included.
        let successor_existed = completed
            .template_id
            .as_deref()
            .and_then(|tid| store.instance_by_number(tid, completed.instance_number + 1))
            .is_some();

        let Some(mut next) = self.manager.generate_next(&completed) else {
            debug!(instance = completed_id, "recurrence ended, nothing to spawn");
            return Ok(None);
        };
        if !successor_existed && next.escalation != EscalationState::default() {
            // Reassignment path: an existing instance picked up a fresh life.
            next.escalation.reset();
            next = store.save_instance(next)?;
        }
        Ok(Some(next))
    }

    fn process_overdue(&self, id: &str, now: DateTime<Utc>) -> Result<Escalated, EngineError> {
        let mut attempts = 0;
        loop {
            // Reload fresh every attempt: a completion may have raced us.
            let Some(instance) = self.manager.store().instance(id) else {
                return Ok(Escalated::default());
            };
            if instance.status == InstanceStatus::Done || instance.due_at > now {
                return Ok(Escalated::default());
            }
            match self.escalate_one(instance, now) {
                Err(EngineError::ConcurrentModification(_)) if attempts < self.policy.max_retries => {
                    attempts += 1;
                    continue;
                }
                other => return other,
            }
        }
    }

    fn escalate_one(
        &self,
        mut instance: TaskInstance,
        now: DateTime<Utc>,
    ) -> Result<Escalated, EngineError> {
        let minutes_overdue = instance.minutes_overdue(now);
        let target = self.policy.level_for(minutes_overdue);
        let before = instance.escalation.clone();
        let mut events: Vec<NotificationKind> = Vec::new();
        let mut advanced = 0;

        instance.escalation.mark_overdue(now);
        while instance.escalation.level < target {
            instance.escalation.advance(now);
            advanced += 1;
        }
        if instance.escalation.blocking_app && !before.blocking_app {
            events.push(NotificationKind::AppBlocked);
        }
        if instance.escalation.level >= self.policy.coach_alert_level
            && !instance.escalation.coaches_notified
        {
            instance.escalation.notify_coaches(now);
            events.push(NotificationKind::CoachAlert);
        }
        if self.policy.reminder_due(&instance.escalation, now) {
            instance.escalation.increment_notification(now);
            events.push(NotificationKind::Reminder);
        }

        if instance.escalation == before {
            return Ok(Escalated::default());
        }
        let saved = self.manager.store().save_instance(instance)?;

        // Dispatch after the durable fact; delivery is best-effort and never
        // rolls the save back.
        let mut context = BTreeMap::new();
        context.insert("level".to_string(), saved.escalation.level.to_string());
        context.insert(
            "minutes_overdue".to_string(),
            minutes_overdue.to_string(),
        );
        for kind in &events {
            self.notifier.notify(*kind, &saved, &context);
        }

        Ok(Escalated {
            advanced,
            notified: events.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::lock::NamedLocks;
    use crate::notify::RecordingNotifier;
    use crate::rule::{RecurrencePattern, RecurrenceRule};
    use crate::store::MemoryStore;
    use crate::task::TemplateFields;
    use chrono::{Duration, TimeZone};

    type TestOrchestrator =
        Orchestrator<MemoryStore, NamedLocks, FixedClock, RecordingNotifier>;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn policy() -> EscalationPolicy {
        EscalationPolicy {
            warning_after_minutes: 60,
            critical_after_minutes: 180,
            blocking_after_minutes: 600,
            reminder_cadence_minutes: 120,
            coach_alert_level: EscalationLevel::Critical,
            max_retries: 3,
        }
    }

    fn orchestrator() -> TestOrchestrator {
        let manager = TemplateManager::new(
            MemoryStore::new(),
            NamedLocks::new(),
            FixedClock::new(t0()),
        );
        Orchestrator::new(manager, RecordingNotifier::new(), policy())
    }

    fn seed(orch: &TestOrchestrator, rule: RecurrenceRule, due: DateTime<Utc>) -> TaskInstance {
        let (_, instance) = orch
            .manager()
            .create_template("u1", "l1", TemplateFields::new("stretch"), rule, due)
            .unwrap();
        instance
    }

    #[test]
    fn not_yet_overdue_instances_are_left_alone() {
        let orch = orchestrator();
        seed(
            &orch,
            RecurrenceRule::new(RecurrencePattern::Daily),
            t0() + Duration::hours(2),
        );
        let report = orch.tick();
        assert_eq!(report, TickReport::default());
    }

    #[test]
    fn overdue_instance_walks_thresholds_across_ticks() {
        let orch = orchestrator();
        let instance = seed(&orch, RecurrenceRule::new(RecurrencePattern::Daily), t0());
        let clock = orch.manager().clock();

        // 30 minutes overdue: still Normal, but the overdue stamp and a first
        // reminder land.
        clock.set(t0() + Duration::minutes(30));
        let report = orch.tick();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.advanced, 0);
        let state = orch.manager().store().instance(&instance.id).unwrap().escalation;
        assert_eq!(state.level, EscalationLevel::Normal);
        assert_eq!(state.became_overdue_at, Some(t0() + Duration::minutes(30)));
        assert_eq!(state.notification_count, 1);

        // 90 minutes: Warning.
        clock.set(t0() + Duration::minutes(90));
        orch.tick();
        let state = orch.manager().store().instance(&instance.id).unwrap().escalation;
        assert_eq!(state.level, EscalationLevel::Warning);
        // First-call stamp survives later ticks.
        assert_eq!(state.became_overdue_at, Some(t0() + Duration::minutes(30)));

        // 200 minutes: Critical, coaches alerted once.
        clock.set(t0() + Duration::minutes(200));
        orch.tick();
        let state = orch.manager().store().instance(&instance.id).unwrap().escalation;
        assert_eq!(state.level, EscalationLevel::Critical);
        assert!(state.coaches_notified);
        assert_eq!(orch.notifier.count_of(NotificationKind::CoachAlert), 1);

        // 700 minutes: Blocking, app-block notice, coach alert not repeated.
        clock.set(t0() + Duration::minutes(700));
        orch.tick();
        let state = orch.manager().store().instance(&instance.id).unwrap().escalation;
        assert_eq!(state.level, EscalationLevel::Blocking);
        assert!(state.blocking_app);
        assert_eq!(orch.notifier.count_of(NotificationKind::AppBlocked), 1);
        assert_eq!(orch.notifier.count_of(NotificationKind::CoachAlert), 1);

        // Another tick at Blocking changes nothing.
        let stamped = state.blocking_started_at;
        clock.set(t0() + Duration::minutes(760));
        orch.tick();
        let state = orch.manager().store().instance(&instance.id).unwrap().escalation;
        assert_eq!(state.blocking_started_at, stamped);
        assert_eq!(orch.notifier.count_of(NotificationKind::AppBlocked), 1);
    }

    #[test]
    fn very_overdue_instance_jumps_straight_to_target_level() {
        let orch = orchestrator();
        let instance = seed(&orch, RecurrenceRule::new(RecurrencePattern::Daily), t0());
        orch.manager().clock().set(t0() + Duration::minutes(700));

        let report = orch.tick();
        assert_eq!(report.advanced, 3);
        let state = orch.manager().store().instance(&instance.id).unwrap().escalation;
        assert_eq!(state.level, EscalationLevel::Blocking);
    }

    #[test]
    fn reminders_respect_the_cadence() {
        let orch = orchestrator();
        let instance = seed(&orch, RecurrenceRule::new(RecurrencePattern::Daily), t0());
        let clock = orch.manager().clock();

        clock.set(t0() + Duration::minutes(10));
        orch.tick();
        // 30 minutes later: inside the 120-minute cadence, no second reminder.
        clock.set(t0() + Duration::minutes(40));
        orch.tick();
        assert_eq!(orch.notifier.count_of(NotificationKind::Reminder), 1);

        clock.set(t0() + Duration::minutes(135));
        orch.tick();
        assert_eq!(orch.notifier.count_of(NotificationKind::Reminder), 2);

        let state = orch.manager().store().instance(&instance.id).unwrap().escalation;
        assert_eq!(state.notification_count, 2);
    }

    #[test]
    fn completion_spawns_next_and_leaves_history_alone() {
        let orch = orchestrator();
        let instance = seed(&orch, RecurrenceRule::new(RecurrencePattern::Daily), t0());
        let clock = orch.manager().clock();

        // Let it escalate first, then complete it.
        clock.set(t0() + Duration::minutes(200));
        orch.tick();

        let next = orch.handle_completion(&instance.id).unwrap().unwrap();
        assert_eq!(next.instance_number, 2);
        assert_eq!(next.escalation, EscalationState::default());

        let completed = orch.manager().store().instance(&instance.id).unwrap();
        assert_eq!(completed.status, InstanceStatus::Done);
        // Historical escalation record survives.
        assert_eq!(completed.escalation.level, EscalationLevel::Critical);
    }

    #[test]
    fn completion_is_replay_safe() {
        let orch = orchestrator();
        let instance = seed(&orch, RecurrenceRule::new(RecurrencePattern::Daily), t0());

        let a = orch.handle_completion(&instance.id).unwrap().unwrap();
        let b = orch.handle_completion(&instance.id).unwrap().unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(
            orch.manager()
                .store()
                .instances_of(instance.template_id.as_deref().unwrap())
                .len(),
            2
        );
    }

    #[test]
    fn replayed_completion_preserves_successor_escalation() {
        let orch = orchestrator();
        let first = seed(&orch, RecurrenceRule::new(RecurrencePattern::Daily), t0());
        let second = orch.handle_completion(&first.id).unwrap().unwrap();

        // Let the successor accrue real escalation state.
        let overdue_at = second.due_at + Duration::minutes(90);
        orch.manager().clock().set(overdue_at);
        orch.tick();
        let escalated = orch.manager().store().instance(&second.id).unwrap().escalation;
        assert_eq!(escalated.level, EscalationLevel::Warning);
        assert_eq!(escalated.became_overdue_at, Some(overdue_at));

        // Replaying the crash-recovery path is a pure no-op on the successor.
        let replayed = orch.handle_completion(&first.id).unwrap().unwrap();
        assert_eq!(replayed.id, second.id);
        let after = orch.manager().store().instance(&second.id).unwrap().escalation;
        assert_eq!(after, escalated);
    }

    #[test]
    fn completion_after_recurrence_end_spawns_nothing() {
        let orch = orchestrator();
        let first = seed(
            &orch,
            RecurrenceRule::new(RecurrencePattern::Daily).with_occurrence_count(2),
            t0(),
        );
        let second = orch.handle_completion(&first.id).unwrap().unwrap();
        assert_eq!(second.instance_number, 2);
        assert!(orch.handle_completion(&second.id).unwrap().is_none());
    }

    #[test]
    fn done_instances_are_skipped_even_if_scanned() {
        let orch = orchestrator();
        let instance = seed(&orch, RecurrenceRule::new(RecurrencePattern::Daily), t0());
        orch.handle_completion(&instance.id).unwrap();

        orch.manager().clock().set(t0() + Duration::minutes(300));
        let report = orch.tick();
        // Only the freshly spawned #2 is pending, and it is not yet due.
        assert_eq!(report.scanned, 0);
        let done = orch.manager().store().instance(&instance.id).unwrap();
        assert_eq!(done.escalation, EscalationState::default());
    }

    #[test]
    fn scan_snapshot_staleness_is_harmless() {
        let orch = orchestrator();
        let instance = seed(&orch, RecurrenceRule::new(RecurrencePattern::Daily), t0());

        // A racing writer bumps the version after the scan would have
        // snapshotted; processing reloads per instance and proceeds.
        let fresh = orch.manager().store().instance(&instance.id).unwrap();
        orch.manager().store().save_instance(fresh).unwrap();

        orch.manager().clock().set(t0() + Duration::minutes(90));
        let report = orch.tick();
        assert_eq!(report.errors, 0);
        let state = orch.manager().store().instance(&instance.id).unwrap().escalation;
        assert_eq!(state.level, EscalationLevel::Warning);
    }
}
