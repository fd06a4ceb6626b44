// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

/// Errors from parsing baseline, correlation and parameter selections.
#[derive(Error, Debug)]
pub enum SelectionError {
    #[error("Unrecognised baseline filter '{0}'; expected one of AUTO, CROSS or ALL")]
    UnknownFilter(String),

    #[error("Got {station1} patterns for the first station but {station2} for the second; these must be equal")]
    PatternCountMismatch { station1: usize, station2: usize },

    #[error("Invalid station pattern '{pattern}': {source}")]
    InvalidRegex {
        pattern: String,
        source: regex::Error,
    },

    #[error("The baseline selection is empty")]
    EmptyBaselineSelection,

    #[error("Unrecognised correlation '{0}'")]
    UnknownCorrelation(String),

    #[error("None of the requested correlations {requested:?} are available")]
    EmptyCorrelationSelection { requested: Vec<String> },

    #[error("Invalid parameter pattern '{pattern}': {source}")]
    InvalidGlob {
        pattern: String,
        source: glob::PatternError,
    },
}
