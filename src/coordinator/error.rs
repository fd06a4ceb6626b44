// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

use crate::{estimate::EstimateError, grid::GridError, grid::Location};

/// Errors talking to the aggregator.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Couldn't connect to the aggregator at {addr} after {attempts} attempts: {source}")]
    Connect {
        addr: String,
        attempts: u32,
        source: std::io::Error,
    },

    #[error("Not connected to an aggregator")]
    NotConnected,

    #[error("The aggregator connection was closed")]
    Closed,

    #[error("Expected a {expected} message, but got {got}")]
    Unexpected { expected: &'static str, got: String },

    #[error("Received a message of {0} bytes; that's too big")]
    FrameTooLarge(u32),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error(transparent)]
    IO(#[from] std::io::Error),
}

/// Errors from setting up or running a solve.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("No coefficients to solve for; parameters {include:?} excluding {exclude:?} match nothing")]
    NoSolvables {
        include: Vec<String>,
        exclude: Vec<String>,
    },

    #[error("The coordinator wasn't initialised before running")]
    NotInitialised,

    #[error("Worker {index} isn't part of any calibration group; the group sizes {sizes:?} cover {total} workers")]
    NotInGroup {
        index: usize,
        sizes: Vec<usize>,
        total: usize,
    },

    #[error("Calibration groups can't be empty")]
    EmptyGroup,

    #[error("The control session has no kernel with index {0}")]
    UnknownWorker(usize),

    #[error("The control session has no grid for process {0}")]
    NoGrid(u32),

    #[error("A global solve needs a connection to an aggregator")]
    NoLink,

    #[error("The time range of the data doesn't overlap the solution time axis")]
    NoTimeOverlap,

    #[error("Cell {cell} has {got} unknowns, but it was started with {expected}")]
    UnknownCount {
        cell: Location,
        expected: usize,
        got: usize,
    },

    #[error("Expected contributions from {expected} members, got {got}")]
    MemberCount { expected: usize, got: usize },

    #[error(transparent)]
    Estimate(#[from] EstimateError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Grid(#[from] GridError),
}
