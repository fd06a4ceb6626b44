// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Control sessions: where kernels get their commands and post their results.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
};

use log::trace;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use super::{Command, CommandId, CommandResult};
use crate::grid::{Axis, Grid};

/// The kind of process taking part in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    Kernel,
    Solver,
}

/// One worker's view of the shared control session.
pub trait ControlSession {
    /// Is a command waiting? This doesn't block.
    fn wait_for_command(&self) -> bool;

    /// Take the next command, if there is one.
    fn get_command(&self) -> Option<(CommandId, Command)>;

    fn post_result(&self, id: CommandId, result: CommandResult);

    /// The process ID of the `index`th worker with the given role.
    fn worker_by_index(&self, role: WorkerRole, index: usize) -> Option<u32>;

    /// The observation grid of a worker's data.
    fn grid(&self, process_id: u32) -> Option<Grid>;

    /// This worker's position among the workers with its role.
    fn index(&self) -> usize;

    fn process_id(&self) -> u32;

    /// The time axis shared by every worker, if one was registered.
    fn global_time_axis(&self) -> Option<Axis>;
}

#[derive(Debug)]
struct WorkerEntry {
    role: WorkerRole,
    process_id: u32,
    grid: Option<Grid>,
    queue: VecDeque<(CommandId, Command)>,
    results: Vec<(CommandId, CommandResult)>,
}

#[derive(Debug, Default)]
struct SessionState {
    workers: Vec<WorkerEntry>,
    next_id: CommandId,
    global_time_axis: Option<Axis>,
}

/// A control session shared by workers in one process, e.g. on different
/// threads. Commands are broadcast to every kernel.
#[derive(Debug, Clone, Default)]
pub struct MemorySession {
    state: Arc<Mutex<SessionState>>,
}

impl MemorySession {
    pub fn new() -> MemorySession {
        MemorySession::default()
    }

    fn lock(&self) -> MutexGuard<SessionState> {
        // A worker that panicked can't leave the state half-updated.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a worker and get its handle on the session.
    pub fn add_worker(&self, role: WorkerRole, process_id: u32, grid: Option<Grid>) -> WorkerSession {
        let mut state = self.lock();
        state.workers.push(WorkerEntry {
            role,
            process_id,
            grid,
            queue: VecDeque::new(),
            results: vec![],
        });
        WorkerSession {
            session: self.clone(),
            slot: state.workers.len() - 1,
        }
    }

    /// Queue a command for every kernel.
    pub fn post_command(&self, command: Command) -> CommandId {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        for worker in state
            .workers
            .iter_mut()
            .filter(|w| w.role == WorkerRole::Kernel)
        {
            worker.queue.push_back((id, command.clone()));
        }
        trace!("Posted command {id} ({})", command.name());
        id
    }

    pub fn set_global_time_axis(&self, axis: Axis) {
        self.lock().global_time_axis = Some(axis);
    }

    /// The results a worker has posted so far, in order.
    pub fn results(&self, process_id: u32) -> Vec<(CommandId, CommandResult)> {
        self.lock()
            .workers
            .iter()
            .find(|w| w.process_id == process_id)
            .map(|w| w.results.clone())
            .unwrap_or_default()
    }

    /// The number of commands a worker hasn't taken yet.
    pub fn pending(&self, process_id: u32) -> usize {
        self.lock()
            .workers
            .iter()
            .find(|w| w.process_id == process_id)
            .map(|w| w.queue.len())
            .unwrap_or(0)
    }
}

/// A worker's handle on a [`MemorySession`].
#[derive(Debug, Clone)]
pub struct WorkerSession {
    session: MemorySession,
    slot: usize,
}

impl WorkerSession {
    pub fn session(&self) -> &MemorySession {
        &self.session
    }
}

impl ControlSession for WorkerSession {
    fn wait_for_command(&self) -> bool {
        !self.session.lock().workers[self.slot].queue.is_empty()
    }

    fn get_command(&self) -> Option<(CommandId, Command)> {
        self.session.lock().workers[self.slot].queue.pop_front()
    }

    fn post_result(&self, id: CommandId, result: CommandResult) {
        self.session.lock().workers[self.slot]
            .results
            .push((id, result));
    }

    fn worker_by_index(&self, role: WorkerRole, index: usize) -> Option<u32> {
        self.session
            .lock()
            .workers
            .iter()
            .filter(|w| w.role == role)
            .nth(index)
            .map(|w| w.process_id)
    }

    fn grid(&self, process_id: u32) -> Option<Grid> {
        self.session
            .lock()
            .workers
            .iter()
            .find(|w| w.process_id == process_id)
            .and_then(|w| w.grid.clone())
    }

    fn index(&self) -> usize {
        let state = self.session.lock();
        let role = state.workers[self.slot].role;
        state.workers[..self.slot]
            .iter()
            .filter(|w| w.role == role)
            .count()
    }

    fn process_id(&self) -> u32 {
        self.session.lock().workers[self.slot].process_id
    }

    fn global_time_axis(&self) -> Option<Axis> {
        self.session.lock().global_time_axis.clone()
    }
}
