// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Stores of model coefficients ([`ParameterStore`]) and observed samples
//! ([`SampleStore`]), along with in-memory implementations of both.

mod error;
mod memory;

pub use error::StoreError;
pub use memory::{
    CellValues, MemoryParmStore, MemorySampleStore, ParmDefinition, ParmValues, DEFAULT_COLUMN,
};

use ndarray::prelude::*;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

use crate::{
    c64,
    grid::{Grid, Location, Range2},
};

/// A handle to a parameter inside a [`ParameterStore`].
pub type ParmId = usize;

/// Holds the coefficients of every model parameter.
///
/// Before a parameter has a solution grid, all of its cells share its default
/// coefficients. Once a grid is set, coefficients are addressed per cell of
/// that grid; the grid can't be changed afterwards.
pub trait ParameterStore {
    /// Get the handle of a parameter by name.
    fn get(&self, name: &str) -> Option<ParmId>;

    fn name(&self, id: ParmId) -> Result<&str, StoreError>;

    /// The names of all parameters, in handle order.
    fn names(&self) -> Vec<&str>;

    fn coeff_count(&self, id: ParmId) -> Result<usize, StoreError>;

    fn grid(&self, id: ParmId) -> Result<Option<&Grid>, StoreError>;

    /// Set the solution grid of the given parameters. Setting a grid on a
    /// parameter that already has a *different* grid is an error.
    fn set_grid(&mut self, grid: &Grid, ids: &[ParmId]) -> Result<(), StoreError>;

    fn coeff(&self, id: ParmId, cell: Location) -> Result<Vec<f64>, StoreError>;

    fn set_coeff(&mut self, id: ParmId, cell: Location, values: &[f64]) -> Result<(), StoreError>;

    /// Persist any pending changes.
    fn flush(&mut self) -> Result<(), StoreError>;
}

/// A feed (receptor) polarisation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, EnumIter,
)]
pub enum Feed {
    X,
    Y,
    R,
    L,
}

/// A correlation product of two feeds.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumString,
    EnumIter,
    Serialize,
    Deserialize,
)]
pub enum Correlation {
    XX,
    XY,
    YX,
    YY,
    RR,
    RL,
    LR,
    LL,
}

impl Correlation {
    /// The feeds of the first and second station.
    pub fn feeds(self) -> (Feed, Feed) {
        match self {
            Correlation::XX => (Feed::X, Feed::X),
            Correlation::XY => (Feed::X, Feed::Y),
            Correlation::YX => (Feed::Y, Feed::X),
            Correlation::YY => (Feed::Y, Feed::Y),
            Correlation::RR => (Feed::R, Feed::R),
            Correlation::RL => (Feed::R, Feed::L),
            Correlation::LR => (Feed::L, Feed::R),
            Correlation::LL => (Feed::L, Feed::L),
        }
    }

    pub fn is_parallel_hand(self) -> bool {
        let (a, b) = self.feeds();
        a == b
    }
}

/// A pair of station indices.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Baseline(pub usize, pub usize);

impl Baseline {
    pub fn is_auto(&self) -> bool {
        self.0 == self.1
    }

    /// The same baseline with the lower station index first.
    pub fn normalised(self) -> Baseline {
        if self.0 <= self.1 {
            self
        } else {
            Baseline(self.1, self.0)
        }
    }
}

/// What a [`SampleStore`] holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleInfo {
    pub grid: Grid,
    pub stations: Vec<String>,
    pub baselines: Vec<Baseline>,
    pub correlations: Vec<Correlation>,
}

impl SampleInfo {
    /// The expected shape of sample arrays covering the whole grid.
    pub fn dims(&self) -> (usize, usize, usize, usize) {
        let (num_freqs, num_times) = self.grid.shape();
        (
            self.baselines.len(),
            num_times,
            num_freqs,
            self.correlations.len(),
        )
    }
}

/// A block of samples read from a [`SampleStore`]. All arrays are dimensioned
/// `[baseline][time][freq][correlation]`.
#[derive(Debug, Clone)]
pub struct SampleChunk {
    /// The grid of the samples; a subset of the store's grid.
    pub grid: Grid,

    /// The store-grid cell of `grid`'s origin.
    pub offset: Location,

    pub samples: Array4<c64>,

    /// `true` means flagged.
    pub flags: Array4<bool>,

    pub covariance: Array4<f64>,
}

impl SampleChunk {
    /// The store-grid cells covered by this chunk.
    pub fn cells(&self) -> Range2 {
        let (num_freqs, num_times) = self.grid.shape();
        Range2::new(
            self.offset,
            Location::new(
                self.offset.freq + num_freqs - 1,
                self.offset.time + num_times - 1,
            ),
        )
    }

    pub fn num_baselines(&self) -> usize {
        self.samples.len_of(Axis(0))
    }

    pub fn num_correlations(&self) -> usize {
        self.samples.len_of(Axis(3))
    }
}

/// Holds observed samples in named columns. Flags and covariances are shared
/// by all columns.
pub trait SampleStore {
    fn info(&self) -> &SampleInfo;

    /// Read the samples of the store-grid cells in `selection`.
    fn read(&self, selection: &Range2, column: &str) -> Result<SampleChunk, StoreError>;

    /// Write a chunk back. Columns that don't exist yet are created.
    fn write(
        &mut self,
        chunk: &SampleChunk,
        column: &str,
        write_flags: bool,
    ) -> Result<(), StoreError>;
}
