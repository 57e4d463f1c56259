use super::task::{LogEntry, LogRole, SystemLogEntry, Task};
use crate::pipeline::Stage;
use crate::shared::{now_rfc3339, now_secs, TaskId};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("task `{task_id}` already exists")]
    AlreadyExists { task_id: String },
    #[error("task `{task_id}` not found")]
    NotFound { task_id: String },
}

/// In-memory task store shared between task workers and pollers.
///
/// The lock only ever covers a single map operation. Mutations on unknown ids
/// are ignored because a worker may race the creation of its own task.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<TaskId, Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &self,
        id: TaskId,
        initial_context: Map<String, Value>,
    ) -> Result<Task, RegistryError> {
        let mut tasks = self.write();
        if tasks.contains_key(&id) {
            return Err(RegistryError::AlreadyExists {
                task_id: id.to_string(),
            });
        }
        let task = Task::new(id.clone(), initial_context, now_secs());
        tasks.insert(id, task.clone());
        Ok(task)
    }

    pub fn get(&self, id: &str) -> Result<Task, RegistryError> {
        self.read()
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                task_id: id.to_string(),
            })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().contains_key(id)
    }

    pub fn ids(&self) -> Vec<TaskId> {
        let mut ids = self.read().keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub fn append_log(&self, id: &str, role: LogRole, text: impl Into<String>) {
        let entry = LogEntry {
            role,
            text: text.into(),
            timestamp: now_rfc3339(),
        };
        self.update(id, |task| task.logs.push(entry));
    }

    pub fn append_system_log(&self, id: &str, text: impl Into<String>) {
        let entry = SystemLogEntry {
            text: text.into(),
            timestamp: now_rfc3339(),
        };
        self.update(id, |task| task.system_logs.push(entry));
    }

    pub fn set_status(&self, id: &str, text: impl Into<String>) {
        let status = text.into();
        self.update(id, |task| task.status = status);
    }

    pub fn set_stage(&self, id: &str, stage: Stage) {
        self.update(id, |task| task.stage = stage);
    }

    pub fn set_awaiting_approval(&self, id: &str, gate: Option<&str>) {
        let gate = gate.map(str::to_string);
        self.update(id, |task| task.awaiting_approval = gate);
    }

    pub fn register_artifact(&self, id: &str, reference: impl Into<String>) {
        let reference = reference.into();
        self.update(id, |task| {
            if !task.artifacts.contains(&reference) {
                task.artifacts.push(reference);
            }
        });
    }

    fn update(&self, id: &str, apply: impl FnOnce(&mut Task)) {
        let mut tasks = self.write();
        if let Some(task) = tasks.get_mut(id) {
            apply(task);
            task.updated_at = now_secs();
        }
    }

    // Every write is a single push or assignment, so a poisoned lock still
    // guards whole entries.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<TaskId, Task>> {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<TaskId, Task>> {
        self.tasks.write().unwrap_or_else(PoisonError::into_inner)
    }
}
