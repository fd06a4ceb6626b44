// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Models that turn coefficients into predicted samples and their partial
//! derivatives.

mod error;
mod gain;

pub use error::ModelError;
pub use gain::{gain_parm_name, GainModel, GainModelFactory, PartKind};

use indexmap::IndexMap;
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    c64,
    grid::{Box2, Grid},
    store::{Baseline, Correlation, ParameterStore, ParmId},
};

/// Identifies one coefficient of one parameter. The same key refers to that
/// coefficient in every solution cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoeffKey {
    pub parm: ParmId,
    pub coeff: usize,
}

/// The model prediction for one correlation of one baseline. Arrays are
/// dimensioned `[time][freq]` over the evaluation grid.
#[derive(Debug, Clone)]
pub struct ModelElement {
    pub value: Array2<c64>,

    /// Samples the model can't predict. `None` means nothing is flagged.
    pub flags: Option<Array2<bool>>,

    /// Partial derivatives with respect to the solvable coefficients the
    /// element depends on.
    pub partials: IndexMap<CoeffKey, Array2<c64>>,
}

impl ModelElement {
    pub fn has_flags(&self) -> bool {
        self.flags.is_some()
    }
}

/// The model prediction for one baseline.
#[derive(Debug, Clone)]
pub struct ModelResult {
    /// The whole baseline is flagged; `elements` should be ignored.
    pub flagged: bool,

    /// One element per model correlation.
    pub elements: Vec<ModelElement>,
}

/// A point source at the phase centre.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointSource {
    /// Stokes I flux density \[Jy\].
    pub flux: f64,

    #[serde(default)]
    pub spectral_index: f64,

    /// The frequency at which `flux` applies \[Hz\]. Without one, the flux
    /// density is flat.
    #[serde(default)]
    pub ref_freq: Option<f64>,
}

/// Describes which model to build.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// The sky. If empty, a 1 Jy flat-spectrum point source is used.
    pub sources: Vec<PointSource>,

    /// Leave out the station gains; the model is just the sky.
    pub no_gains: bool,

    /// Where the model is valid. Unbounded if not given.
    pub domain: Option<Box2>,

    /// Stations whose baselines are completely flagged by the model.
    pub flagged_stations: Vec<String>,
}

/// Predicts samples for a fixed set of baselines and correlations.
pub trait Model {
    fn baselines(&self) -> &[Baseline];

    fn correlations(&self) -> &[Correlation];

    /// The frequency/time region in which the model is valid.
    fn domain(&self) -> Box2;

    /// The names of all parameters the model depends on.
    fn parameters(&self) -> Vec<String>;

    /// Restrict evaluation to the given grid. Cached results are discarded.
    fn set_evaluation_grid(&mut self, grid: Grid);

    fn evaluation_grid(&self) -> Option<&Grid>;

    /// Set the parameters for which partial derivatives are computed.
    fn set_solvables(&mut self, parms: &[ParmId]);

    /// Evaluate the model for the baseline with index `baseline` (into
    /// [`Model::baselines`]).
    ///
    /// # Errors
    ///
    /// This function will return an error if no evaluation grid has been set,
    /// if the baseline index is invalid or if the parameter store fails.
    fn evaluate(
        &mut self,
        baseline: usize,
        parms: &dyn ParameterStore,
    ) -> Result<&ModelResult, ModelError>;

    /// Coefficient values have changed; cached results are stale.
    fn solvables_changed(&mut self);

    /// Drop everything cached.
    fn clear_expressions(&mut self);
}

/// Builds models for a selection of baselines.
pub trait ModelFactory {
    /// A model predicting the samples.
    fn make_forward(
        &self,
        config: &ModelConfig,
        baselines: &[Baseline],
        correlations: &[Correlation],
    ) -> Result<Box<dyn Model>, ModelError>;

    /// A model of the multiplicative correction that undoes the instrumental
    /// part of the forward model.
    fn make_inverse(
        &self,
        config: &ModelConfig,
        baselines: &[Baseline],
        correlations: &[Correlation],
    ) -> Result<Box<dyn Model>, ModelError>;
}
