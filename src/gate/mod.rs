//! One-shot approval gates that park a task worker until an external caller
//! fires them.
//!
//! Each task has at most one live gate. Opening a new gate for a task replaces
//! the previous one, and a waiter on a replaced gate wakes with
//! [`GateError::Superseded`] instead of blocking forever.

use crate::shared::{now_secs, TaskId};
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Mutex, MutexGuard, PoisonError};

pub const CREATE_GATE: &str = "create";
pub const INSERT_GATE: &str = "insert";
pub const REVIEW_GATE: &str = "review";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    #[error("gate `{gate}` for task `{task_id}` was withdrawn before it was fired")]
    Superseded { task_id: String, gate: String },
}

/// Payload delivered to the waiting worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GateSignal {
    pub feedback: Option<String>,
}

impl GateSignal {
    pub fn with_feedback(feedback: impl Into<String>) -> Self {
        Self {
            feedback: Some(feedback.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParkedGate {
    pub task_id: TaskId,
    pub gate: String,
    pub opened_at: i64,
}

#[derive(Debug)]
struct LiveGate {
    name: String,
    opened_at: i64,
    sender: SyncSender<GateSignal>,
}

/// A gate taken out of the live set but not yet signalled. Only its holder
/// can wake the waiter; dropping it unreleased wakes the waiter with
/// [`GateError::Superseded`].
#[derive(Debug)]
pub struct ClaimedGate {
    sender: SyncSender<GateSignal>,
}

impl ClaimedGate {
    pub fn release(self, signal: GateSignal) -> bool {
        // The buffer holds the one signal even if the waiter has not
        // reached `wait` yet.
        self.sender.try_send(signal).is_ok()
    }
}

#[derive(Debug)]
pub struct GateHandle {
    task_id: TaskId,
    gate: String,
    receiver: Receiver<GateSignal>,
}

impl GateHandle {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn gate(&self) -> &str {
        &self.gate
    }

    /// Blocks until the gate is fired. There is no timeout.
    pub fn wait(self) -> Result<GateSignal, GateError> {
        self.receiver.recv().map_err(|_| GateError::Superseded {
            task_id: self.task_id.to_string(),
            gate: self.gate,
        })
    }
}

#[derive(Debug, Default)]
pub struct ApprovalGates {
    live: Mutex<HashMap<TaskId, LiveGate>>,
}

impl ApprovalGates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, task_id: &TaskId, gate_name: &str) -> GateHandle {
        let (sender, receiver) = mpsc::sync_channel(1);
        self.lock().insert(
            task_id.clone(),
            LiveGate {
                name: gate_name.to_string(),
                opened_at: now_secs(),
                sender,
            },
        );
        GateHandle {
            task_id: task_id.clone(),
            gate: gate_name.to_string(),
            receiver,
        }
    }

    pub fn fire(&self, task_id: &str, gate_name: &str) -> bool {
        self.fire_with(task_id, gate_name, GateSignal::default())
    }

    /// Returns `false` when no live gate with this name exists for the task.
    /// A mismatched name leaves the live gate untouched.
    pub fn fire_with(&self, task_id: &str, gate_name: &str, signal: GateSignal) -> bool {
        self.claim(task_id, gate_name)
            .is_some_and(|claimed| claimed.release(signal))
    }

    /// Removes the live gate if it carries `gate_name`. At most one caller
    /// claims a given gate, so work done between `claim` and `release` is
    /// ordered before anything the woken worker does.
    pub fn claim(&self, task_id: &str, gate_name: &str) -> Option<ClaimedGate> {
        let mut live = self.lock();
        match live.get(task_id) {
            Some(gate) if gate.name == gate_name => live.remove(task_id).map(|gate| ClaimedGate {
                sender: gate.sender,
            }),
            _ => None,
        }
    }

    pub fn live_gate(&self, task_id: &str) -> Option<String> {
        self.lock().get(task_id).map(|gate| gate.name.clone())
    }

    pub fn parked(&self) -> Vec<ParkedGate> {
        let mut parked = self
            .lock()
            .iter()
            .map(|(task_id, gate)| ParkedGate {
                task_id: task_id.clone(),
                gate: gate.name.clone(),
                opened_at: gate.opened_at,
            })
            .collect::<Vec<_>>();
        parked.sort_by(|a, b| a.opened_at.cmp(&b.opened_at).then(a.task_id.cmp(&b.task_id)));
        parked
    }

    /// Drops the live gate of a task without firing it and returns its name;
    /// a waiter wakes with [`GateError::Superseded`].
    pub fn discard(&self, task_id: &str) -> Option<String> {
        self.lock().remove(task_id).map(|gate| gate.name)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, LiveGate>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
