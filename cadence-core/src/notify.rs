//! Notification dispatch contract.
//!
//! The engine decides *that* a notification is due and what its semantic
//! payload is; transport (APNs/FCM, e-mail, whatever) is the host's problem.
//! Dispatch is fire-and-forget: no return value is consumed, and a failed
//! delivery never rolls back the state transition that triggered it.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::lock::lock_unpoisoned;
use crate::task::{InstanceId, TaskInstance};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Cadenced overdue reminder to the task owner.
    Reminder,
    /// The instance crossed the coach-alert level.
    CoachAlert,
    /// The instance entered Blocking and the consuming app should lock.
    AppBlocked,
}

pub trait Notifier {
    fn notify(
        &self,
        kind: NotificationKind,
        instance: &TaskInstance,
        context: &BTreeMap<String, String>,
    );
}

/// Drops everything on the floor.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(
        &self,
        _kind: NotificationKind,
        _instance: &TaskInstance,
        _context: &BTreeMap<String, String>,
    ) {
    }
}

/// Captures dispatches in memory. Test double, also handy for host-side
/// debugging.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(NotificationKind, InstanceId)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(NotificationKind, InstanceId)> {
        lock_unpoisoned(&self.sent).clone()
    }

    pub fn count_of(&self, kind: NotificationKind) -> usize {
        lock_unpoisoned(&self.sent)
            .iter()
            .filter(|(k, _)| *k == kind)
            .count()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(
        &self,
        kind: NotificationKind,
        instance: &TaskInstance,
        _context: &BTreeMap<String, String>,
    ) {
        lock_unpoisoned(&self.sent).push((kind, instance.id.clone()));
    }
}
