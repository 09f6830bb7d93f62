//! Persistence contract + in-memory reference store.
//!
//! The engine is a library; the surrounding service owns the real database.
//! `TaskStore` is the narrow interface it must provide. `MemoryStore` is the
//! reference implementation used by tests and by hosts that keep everything
//! in process.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::error::EngineError;
use crate::lock::lock_unpoisoned;
use crate::task::{InstanceId, InstanceStatus, TaskInstance, TaskTemplate, TemplateId};

pub trait TaskStore {
    fn template(&self, id: &str) -> Option<TaskTemplate>;
    fn put_template(&self, template: TaskTemplate);
    fn remove_template(&self, id: &str);
    /// Template matching the create-dedup key, if one exists.
    fn find_template(&self, owner_id: &str, list_id: &str, title: &str) -> Option<TaskTemplate>;
    /// Templates whose recurrence has not ended as of `now`.
    fn open_templates(&self, now: DateTime<Utc>) -> Vec<TaskTemplate>;

    fn instance(&self, id: &str) -> Option<TaskInstance>;
    /// Insert a brand-new instance under its own id.
    fn put_instance(&self, instance: TaskInstance);
    /// Compare-and-swap save: fails with `ConcurrentModification` when the
    /// stored version no longer matches `instance.version`. On success the
    /// version is bumped and the saved copy returned.
    fn save_instance(&self, instance: TaskInstance) -> Result<TaskInstance, EngineError>;
    fn remove_instance(&self, id: &str);
    /// All instances back-referencing `template_id`, ordered by number.
    fn instances_of(&self, template_id: &str) -> Vec<TaskInstance>;
    fn instance_by_number(&self, template_id: &str, number: u32) -> Option<TaskInstance>;
    /// Pending instances with `due_at <= t`, ordered by due date.
    fn due_before(&self, t: DateTime<Utc>) -> Vec<TaskInstance>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Shelves>,
}

#[derive(Debug, Default)]
struct Shelves {
    templates: HashMap<TemplateId, TaskTemplate>,
    instances: HashMap<InstanceId, TaskInstance>,
}

impl Shelves {
    fn highest_number(&self, template_id: &str) -> u32 {
        self.instances
            .values()
            .filter(|i| i.template_id.as_deref() == Some(template_id))
            .map(|i| i.instance_number)
            .max()
            .unwrap_or(0)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for MemoryStore {
    fn template(&self, id: &str) -> Option<TaskTemplate> {
        lock_unpoisoned(&self.inner).templates.get(id).cloned()
    }

    fn put_template(&self, template: TaskTemplate) {
        lock_unpoisoned(&self.inner)
            .templates
            .insert(template.id.clone(), template);
    }

    fn remove_template(&self, id: &str) {
        lock_unpoisoned(&self.inner).templates.remove(id);
    }

    fn find_template(&self, owner_id: &str, list_id: &str, title: &str) -> Option<TaskTemplate> {
        lock_unpoisoned(&self.inner)
            .templates
            .values()
            .find(|t| t.owner_id == owner_id && t.list_id == list_id && t.fields.title == title)
            .cloned()
    }

    fn open_templates(&self, now: DateTime<Utc>) -> Vec<TaskTemplate> {
        let shelves = lock_unpoisoned(&self.inner);
        shelves
            .templates
            .values()
            .filter(|t| {
                let end_open = t.rule.end_date.is_none_or(|end| end >= now);
                let cap_open = t
                    .rule
                    .occurrence_count
                    .is_none_or(|cap| shelves.highest_number(&t.id) < cap);
                end_open && cap_open
            })
            .cloned()
            .collect()
    }

    fn instance(&self, id: &str) -> Option<TaskInstance> {
        lock_unpoisoned(&self.inner).instances.get(id).cloned()
    }

    fn put_instance(&self, instance: TaskInstance) {
        lock_unpoisoned(&self.inner)
            .instances
            .insert(instance.id.clone(), instance);
    }

    fn save_instance(&self, mut instance: TaskInstance) -> Result<TaskInstance, EngineError> {
        let mut shelves = lock_unpoisoned(&self.inner);
        match shelves.instances.get(&instance.id) {
            None => Err(EngineError::NotFound {
                kind: "instance",
                id: instance.id.clone(),
            }),
            Some(stored) if stored.version != instance.version => {
                Err(EngineError::ConcurrentModification(instance.id.clone()))
            }
            Some(_) => {
                instance.version += 1;
                shelves
                    .instances
                    .insert(instance.id.clone(), instance.clone());
                Ok(instance)
            }
        }
    }

    fn remove_instance(&self, id: &str) {
        lock_unpoisoned(&self.inner).instances.remove(id);
    }

    fn instances_of(&self, template_id: &str) -> Vec<TaskInstance> {
        let shelves = lock_unpoisoned(&self.inner);
        let mut out: Vec<TaskInstance> = shelves
            .instances
            .values()
            .filter(|i| i.template_id.as_deref() == Some(template_id))
            .cloned()
            .collect();
        out.sort_by_key(|i| i.instance_number);
        out
    }

    fn instance_by_number(&self, template_id: &str, number: u32) -> Option<TaskInstance> {
        lock_unpoisoned(&self.inner)
            .instances
            .values()
            .find(|i| i.template_id.as_deref() == Some(template_id) && i.instance_number == number)
            .cloned()
    }

    fn due_before(&self, t: DateTime<Utc>) -> Vec<TaskInstance> {
        let shelves = lock_unpoisoned(&self.inner);
        let mut out: Vec<TaskInstance> = shelves
            .instances
            .values()
            .filter(|i| i.status == InstanceStatus::Pending && i.due_at <= t)
            .cloned()
            .collect();
        // Deterministic tick order.
        out.sort_by(|a, b| a.due_at.cmp(&b.due_at).then_with(|| a.id.cmp(&b.id)));
        out
    }
}
