// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

use crate::{
    coordinator::{CoordinatorError, LinkError},
    estimate::EstimateError,
    grid::Interval,
    model::ModelError,
    selection::SelectionError,
    store::StoreError,
};

/// Errors from running commands and the control loop.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("No Initialize command has been received")]
    NotInitialised,

    #[error("No samples are loaded; a NextChunk command must come first")]
    NoChunk,

    #[error("The requested frequency range {requested:?} Hz isn't inside the local data ({available:?} Hz)")]
    FreqRange {
        requested: Interval<f64>,
        available: Interval<f64>,
    },

    #[error("No {what} cells of the local data lie inside {range:?}")]
    EmptyRange {
        what: &'static str,
        range: Interval<f64>,
    },

    #[error("Calibration groups were given, but no aggregator to solve with")]
    NoAggregator,

    #[error("None of the selected baselines are in the data")]
    NoBaselines,

    #[error("No command arrived after polling the control session {0} times")]
    PollTimeout(u64),

    #[error("Command '{command}' failed: {message}")]
    CommandFailed {
        command: &'static str,
        message: String,
    },

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Estimate(#[from] EstimateError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error(transparent)]
    Link(#[from] LinkError),
}
