use crate::shared::TaskId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::thread::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Running,
    Stopped,
    Error,
}

#[derive(Debug)]
struct WorkerSlot {
    state: WorkerState,
    handle: Option<JoinHandle<()>>,
}

/// Tracks the background worker of each task. A task never has two running
/// workers: `reserve` refuses while one is marked running.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: HashMap<TaskId, WorkerSlot>,
}

impl WorkerRegistry {
    /// Marks the task's worker as running. Returns `false` if it already is.
    pub fn reserve(&mut self, task_id: &TaskId) -> bool {
        match self.workers.get_mut(task_id) {
            Some(slot) if slot.state == WorkerState::Running => false,
            Some(slot) => {
                slot.state = WorkerState::Running;
                slot.handle = None;
                true
            }
            None => {
                self.workers.insert(
                    task_id.clone(),
                    WorkerSlot {
                        state: WorkerState::Running,
                        handle: None,
                    },
                );
                true
            }
        }
    }

    pub fn attach(&mut self, task_id: &TaskId, handle: JoinHandle<()>) {
        if let Some(slot) = self.workers.get_mut(task_id) {
            slot.handle = Some(handle);
        }
    }

    pub fn stop(&mut self, task_id: &str) {
        if let Some(slot) = self.workers.get_mut(task_id) {
            slot.state = WorkerState::Stopped;
        }
    }

    pub fn fail(&mut self, task_id: &str) {
        if let Some(slot) = self.workers.get_mut(task_id) {
            slot.state = WorkerState::Error;
        }
    }

    pub fn state(&self, task_id: &str) -> Option<WorkerState> {
        self.workers.get(task_id).map(|slot| slot.state)
    }

    pub fn take_handle(&mut self, task_id: &str) -> Option<JoinHandle<()>> {
        self.workers
            .get_mut(task_id)
            .and_then(|slot| slot.handle.take())
    }
}
