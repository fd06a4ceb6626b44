// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error type for all model-related errors.

use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Station '{0}' is not known to the model")]
    UnknownStation(String),

    #[error("Baseline ({0}, {1}) refers to a station that doesn't exist")]
    InvalidBaseline(usize, usize),

    #[error("Model baseline index {index} is out of range; the model has {count} baselines")]
    BaselineIndex { index: usize, count: usize },

    #[error("The model has no evaluation grid; one must be set before evaluating")]
    NoEvaluationGrid,

    #[error("Point source with a non-positive reference frequency ({0} Hz)")]
    InvalidRefFreq(f64),

    #[error("The model's domain of validity is empty")]
    EmptyDomain,

    #[error(transparent)]
    Store(#[from] StoreError),
}
