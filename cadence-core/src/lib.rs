//! cadence-core: recurring-task scheduling + overdue escalation engine.
//!
//! The library behind a coached task-management service. It owns the
//! recurrence date math, the per-instance escalation state machine, the
//! template/instance lifecycle, and the periodic tick driver. Auth, CRUD,
//! HTTP, and push transport live in the host and reach the engine through
//! the narrow `TaskStore` / `Clock` / `Notifier` / `KeyedLock` interfaces.

pub mod clock;
pub mod error;
pub mod escalation;
pub mod lock;
pub mod manager;
pub mod notify;
pub mod orchestrator;
pub mod recurrence;
pub mod rule;
pub mod store;
pub mod task;

pub use clock::{Clock, FixedClock, SystemClock};
pub use error::EngineError;
pub use escalation::{EscalationLevel, EscalationState};
pub use lock::{KeyedLock, NamedLocks, lock_key};
pub use manager::{TemplateChanges, TemplateManager};
pub use notify::{NotificationKind, Notifier, NullNotifier, RecordingNotifier};
pub use orchestrator::{EscalationPolicy, Orchestrator, TickReport};
pub use recurrence::{next_occurrence, recurrence_ended};
pub use rule::{RecurrencePattern, RecurrenceRule, TimeOfDay};
pub use store::{MemoryStore, TaskStore};
pub use task::{
    InstanceId, InstanceStatus, Priority, TaskInstance, TaskTemplate, TemplateFields, TemplateId,
};
