// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error type for all selfcal-related errors. This should be the *only* error
//! enum that is publicly visible from the binary.

use thiserror::Error;

use crate::{
    control::ControlError,
    coordinator::{CoordinatorError, LinkError},
    grid::GridError,
    model::ModelError,
    selection::SelectionError,
    store::StoreError,
};

/// The *only* publicly visible error from selfcal. Each variant carries the
/// message of the error it was made from; the variant says which part of the
/// system is to blame.
#[derive(Error, Debug)]
pub enum SelfcalError {
    /// An error related to run files.
    #[error("{0}\n\nRun files are TOML or JSON and must describe the grid, the stations, the correlations, the parameters and the commands to run.")]
    RunFile(String),

    /// A command failed or the control loop gave up.
    #[error("{0}")]
    Control(String),

    /// An error related to solving, locally or with an aggregator.
    #[error("{0}")]
    Solve(String),

    /// An error talking to an aggregator or to the members of a calibration
    /// group.
    #[error("{0}\n\nCheck that the aggregator is listening and that every member of the calibration group is running.")]
    Link(String),

    /// An error related to the sample or parameter stores.
    #[error("{0}")]
    Store(String),

    /// A generic error that can't be clarified further, e.g. IO errors.
    #[error("{0}")]
    Generic(String),
}

// When changing the error propagation below, ensure `Self::from(e)` uses the
// correct `e`!

impl From<ControlError> for SelfcalError {
    fn from(e: ControlError) -> Self {
        let s = e.to_string();
        match e {
            ControlError::Coordinator(e) => Self::from(e),
            ControlError::Link(e) => Self::from(e),
            ControlError::Store(e) => Self::from(e),
            ControlError::Selection(_)
            | ControlError::Model(_)
            | ControlError::Estimate(_)
            | ControlError::NotInitialised
            | ControlError::NoChunk
            | ControlError::FreqRange { .. }
            | ControlError::EmptyRange { .. }
            | ControlError::NoAggregator
            | ControlError::NoBaselines
            | ControlError::PollTimeout(_)
            | ControlError::CommandFailed { .. } => Self::Control(s),
        }
    }
}

impl From<CoordinatorError> for SelfcalError {
    fn from(e: CoordinatorError) -> Self {
        let s = e.to_string();
        match e {
            CoordinatorError::Link(e) => Self::from(e),
            _ => Self::Solve(s),
        }
    }
}

impl From<LinkError> for SelfcalError {
    fn from(e: LinkError) -> Self {
        Self::Link(e.to_string())
    }
}

impl From<StoreError> for SelfcalError {
    fn from(e: StoreError) -> Self {
        Self::Store(e.to_string())
    }
}

impl From<ModelError> for SelfcalError {
    fn from(e: ModelError) -> Self {
        Self::RunFile(e.to_string())
    }
}

impl From<SelectionError> for SelfcalError {
    fn from(e: SelectionError) -> Self {
        Self::RunFile(e.to_string())
    }
}

impl From<GridError> for SelfcalError {
    fn from(e: GridError) -> Self {
        Self::RunFile(e.to_string())
    }
}

impl From<serde_json::Error> for SelfcalError {
    fn from(e: serde_json::Error) -> Self {
        Self::Generic(e.to_string())
    }
}

impl From<std::io::Error> for SelfcalError {
    fn from(e: std::io::Error) -> Self {
        Self::Generic(e.to_string())
    }
}
