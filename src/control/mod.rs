// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Driving a kernel with commands from a control session.
//!
//! [`ProcessControl`] polls the session, runs each command through a
//! [`CommandHandler`] and posts the result. It stops after `Finalize`, or
//! with an error as soon as any command fails.

mod command;
mod error;
mod kernel;
mod session;
#[cfg(test)]
mod tests;

pub use command::{
    ApplyCommand, ApplyOp, Command, CommandHandler, CommandId, CommandResult, InitializeCommand,
    NextChunkCommand, ResultStatus, SolveCommand,
};
pub use error::ControlError;
pub use kernel::KernelControl;
pub use session::{ControlSession, MemorySession, WorkerRole, WorkerSession};

use std::{thread, time::Duration};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use strum_macros::Display;

use crate::constants::{DEFAULT_MAX_POLL_INTERVAL_MS, DEFAULT_POLL_INTERVAL_MS};

/// How the control session is polled while waiting for commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// The first delay between polls \[milliseconds\].
    pub poll_interval_ms: u64,

    /// The delay doubles after every empty poll up to this value
    /// \[milliseconds\].
    pub max_poll_interval_ms: u64,

    /// Give up after this many consecutive empty polls. Wait forever if not
    /// given.
    pub max_polls: Option<u64>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_poll_interval_ms: DEFAULT_MAX_POLL_INTERVAL_MS,
            max_polls: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ControlState {
    Undefined,
    /// Waiting for a command.
    Wait,
    /// Running a command.
    Run,
    Finished,
}

/// The control loop of one worker.
pub struct ProcessControl<S: ControlSession> {
    session: S,
    config: ControlConfig,
    state: ControlState,
    history: Vec<ControlState>,
}

impl<S: ControlSession> ProcessControl<S> {
    pub fn new(session: S, config: ControlConfig) -> ProcessControl<S> {
        ProcessControl {
            session,
            config,
            state: ControlState::Undefined,
            history: vec![ControlState::Undefined],
        }
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    /// Every state the loop has been in, in order.
    pub fn history(&self) -> &[ControlState] {
        &self.history
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    fn set_state(&mut self, state: ControlState) {
        if state != self.state {
            debug!("Control state {} -> {state}", self.state);
            self.state = state;
            self.history.push(state);
        }
    }

    /// Run commands until `Finalize`. Returns the number of commands run.
    ///
    /// # Errors
    ///
    /// Fails if a command fails or if polling gives up.
    pub fn run(&mut self, handler: &mut dyn CommandHandler) -> Result<usize, ControlError> {
        let min_delay = Duration::from_millis(self.config.poll_interval_ms);
        let max_delay = Duration::from_millis(self.config.max_poll_interval_ms).max(min_delay);
        let mut delay = min_delay;
        let mut polls = 0;
        let mut commands = 0;

        self.set_state(ControlState::Wait);
        loop {
            let next = if self.session.wait_for_command() {
                self.session.get_command()
            } else {
                None
            };
            let (id, command) = match next {
                Some(next) => next,
                None => {
                    polls += 1;
                    if let Some(max) = self.config.max_polls {
                        if polls >= max {
                            self.set_state(ControlState::Finished);
                            return Err(ControlError::PollTimeout(polls));
                        }
                    }
                    thread::sleep(delay);
                    delay = (delay * 2).min(max_delay);
                    continue;
                }
            };
            polls = 0;
            delay = min_delay;

            self.set_state(ControlState::Run);
            let result = command.dispatch(handler, &self.session);
            self.session.post_result(id, result.clone());
            commands += 1;

            if !result.is_ok() {
                self.set_state(ControlState::Finished);
                return Err(ControlError::CommandFailed {
                    command: command.name(),
                    message: result.message,
                });
            }
            if let Command::Finalize = command {
                self.set_state(ControlState::Finished);
                info!("Finished after {commands} commands");
                return Ok(commands);
            }
            self.set_state(ControlState::Wait);
        }
    }
}
