// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

use crate::{
    coordinator::LinkError, model::ModelError, selection::SelectionError, store::StoreError,
};

/// Errors that stop an estimation pass. Per-sample and per-cell problems are
/// counted instead.
#[derive(Error, Debug)]
pub enum EstimateError {
    #[error("The robust epsilon schedule must be positive and non-increasing; got {0:?}")]
    InvalidSchedule(Vec<f64>),

    #[error("Unknown parameter '{0}'")]
    UnknownParm(String),

    #[error("The solve step dropped cell {0}")]
    MissingCell(crate::grid::Location),

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Link(#[from] LinkError),
}
