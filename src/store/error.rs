// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors associated with parameter and sample stores.

use thiserror::Error;

use crate::grid::{GridError, Location};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("There is no parameter with handle {0}")]
    InvalidParm(usize),

    #[error("Parameter '{name}' already has a different solution grid; a parameter's grid can only be set once")]
    GridMismatch { name: String },

    #[error("Parameter '{name}' has no solution grid; its coefficients can't be addressed per cell")]
    NoGrid { name: String },

    #[error("Cell {cell} is outside the solution grid of parameter '{name}'")]
    OutOfGrid { name: String, cell: Location },

    #[error("Parameter '{name}' has {expected} coefficients, but {got} were supplied")]
    CoeffCount {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("Parameter '{0}' is defined more than once")]
    DuplicateParm(String),

    #[error("No sample column named '{0}'")]
    UnknownColumn(String),

    #[error("Sample selection {start}..={end} is outside the observation grid")]
    Selection { start: Location, end: Location },

    #[error("Sample array has shape {got:?}, but {expected:?} was expected")]
    Shape {
        expected: (usize, usize, usize, usize),
        got: (usize, usize, usize, usize),
    },

    #[error(transparent)]
    Grid(#[from] GridError),
}
