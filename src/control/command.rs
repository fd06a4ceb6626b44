// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The commands a kernel can be sent, and their results.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::{ControlError, ControlSession};
use crate::{
    coordinator::CellSize,
    estimate::Variant,
    grid::Interval,
    model::ModelConfig,
    selection::BaselineSelection,
    solver::SolverOptions,
};

/// Identifies a command within a control session.
pub type CommandId = u64;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitializeCommand {
    pub model: ModelConfig,

    /// The baselines every later command is restricted to.
    pub baselines: BaselineSelection,

    /// The correlations every later command is restricted to. Empty means
    /// all of them.
    pub correlations: Vec<String>,

    /// The address of the aggregator of this kernel's calibration group.
    pub aggregator: Option<String>,

    /// The number of kernels in each calibration group. If empty, every
    /// kernel solves on its own.
    pub calibration_groups: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextChunkCommand {
    /// The time range to load \[s\].
    pub time: Interval<f64>,

    /// The frequency range to load \[Hz\]; everything if not given.
    #[serde(default)]
    pub freq: Option<Interval<f64>>,
}

/// The payload of the commands that apply a model to the samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplyCommand {
    pub baselines: BaselineSelection,
    pub correlations: Vec<String>,

    /// Write the result to this column. If not given, only the samples in
    /// memory are changed.
    pub output_column: Option<String>,

    pub write_flags: bool,

    /// Use this model instead of the one given to `Initialize`.
    pub model: Option<ModelConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolveCommand {
    /// Glob patterns of the parameters to solve for.
    pub parms: Vec<String>,

    /// Glob patterns of parameters to keep fixed.
    pub excluded: Vec<String>,

    pub cell_size: CellSize,
    pub baselines: BaselineSelection,
    pub correlations: Vec<String>,

    /// The number of solution time-cells solved together.
    pub chunk_size: usize,

    /// Start each chunk from the previous chunk's solutions.
    pub propagate: bool,

    pub variant: Variant,
    pub options: SolverOptions,
}

/// How a model is applied to the samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOp {
    /// Replace the samples with the model.
    Predict,
    Subtract,
    Add,
    /// Multiply the samples by the inverse of the instrumental model.
    Correct,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Initialize(InitializeCommand),
    Finalize,
    NextChunk(NextChunkCommand),
    Predict(ApplyCommand),
    Subtract(ApplyCommand),
    Add(ApplyCommand),
    Correct(ApplyCommand),
    Solve(SolveCommand),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Initialize(_) => "initialize",
            Command::Finalize => "finalize",
            Command::NextChunk(_) => "next_chunk",
            Command::Predict(_) => "predict",
            Command::Subtract(_) => "subtract",
            Command::Add(_) => "add",
            Command::Correct(_) => "correct",
            Command::Solve(_) => "solve",
        }
    }

    /// Run the handler for this command. Handler failures become an error
    /// result.
    pub fn dispatch(
        &self,
        handler: &mut dyn CommandHandler,
        session: &dyn ControlSession,
    ) -> CommandResult {
        debug!("Running command '{}'", self.name());
        let result = match self {
            Command::Initialize(cmd) => handler.initialize(cmd, session),
            Command::Finalize => handler.finalize(session),
            Command::NextChunk(cmd) => handler.next_chunk(cmd, session),
            Command::Predict(cmd) => handler.apply(ApplyOp::Predict, cmd, session),
            Command::Subtract(cmd) => handler.apply(ApplyOp::Subtract, cmd, session),
            Command::Add(cmd) => handler.apply(ApplyOp::Add, cmd, session),
            Command::Correct(cmd) => handler.apply(ApplyOp::Correct, cmd, session),
            Command::Solve(cmd) => handler.solve(cmd, session),
        };
        match result {
            Ok(()) => CommandResult::ok(),
            Err(e) => {
                warn!("Command '{}' failed: {e}", self.name());
                CommandResult::error(e.to_string())
            }
        }
    }
}

/// Carries out commands.
pub trait CommandHandler {
    fn initialize(
        &mut self,
        cmd: &InitializeCommand,
        session: &dyn ControlSession,
    ) -> Result<(), ControlError>;

    fn finalize(&mut self, session: &dyn ControlSession) -> Result<(), ControlError>;

    fn next_chunk(
        &mut self,
        cmd: &NextChunkCommand,
        session: &dyn ControlSession,
    ) -> Result<(), ControlError>;

    fn apply(
        &mut self,
        op: ApplyOp,
        cmd: &ApplyCommand,
        session: &dyn ControlSession,
    ) -> Result<(), ControlError>;

    fn solve(&mut self, cmd: &SolveCommand, session: &dyn ControlSession)
        -> Result<(), ControlError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResultStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub status: ResultStatus,
    pub message: String,
}

impl CommandResult {
    pub fn ok() -> CommandResult {
        CommandResult {
            status: ResultStatus::Ok,
            message: String::new(),
        }
    }

    pub fn error(message: String) -> CommandResult {
        CommandResult {
            status: ResultStatus::Error,
            message,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResultStatus::Ok
    }
}
