//! Engine error kinds.
//!
//! "Recurrence ended" is deliberately not here: `generate_next` models it as
//! an explicit absence (`None`), not a failure.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed recurrence configuration. Rejected at template create/update
    /// time, never at generation time.
    #[error("invalid recurrence rule: {0}")]
    InvalidRule(String),

    /// Stale version on an instance save. Callers retry the single instance,
    /// not the whole tick.
    #[error("concurrent modification of instance {0}")]
    ConcurrentModification(String),

    /// An instance references a template that no longer exists.
    #[error("template {0} no longer exists")]
    TemplateGone(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
}
