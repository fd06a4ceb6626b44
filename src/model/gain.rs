// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Station gains applied to a sky of point sources at the phase centre.
//!
//! For a baseline between stations `p` and `q` and the correlation of feeds
//! `a` and `b`, the forward model is
//!
//! `V = g_pa conj(g_qb) S`
//!
//! where `S` is the sky (zero for cross-hand correlations, as the sky is
//! unpolarised). Each complex gain is made of two parameters,
//! `Gain:<feed>:Real:<station>` and `Gain:<feed>:Imag:<station>`. A
//! parameter's coefficients are those of a polynomial in the frequency offset
//! from the centre of its solution cell, normalised by the cell width.
//! Parameters missing from the store take the value of a unity gain.

use std::collections::{hash_map::Entry, HashMap, HashSet};

use indexmap::IndexMap;
use log::debug;
use ndarray::prelude::*;
use strum_macros::{Display, EnumString};

use super::{
    CoeffKey, Model, ModelConfig, ModelElement, ModelError, ModelFactory, ModelResult, PointSource,
};
use crate::{
    c64,
    grid::{Box2, Grid, Location},
    store::{Baseline, Correlation, Feed, ParameterStore, ParmId},
};

/// Which part of a complex gain a parameter holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
pub enum PartKind {
    Real,
    Imag,
}

pub fn gain_parm_name(feed: Feed, part: PartKind, station: &str) -> String {
    format!("Gain:{feed}:{part}:{station}")
}

/// Makes [`GainModel`]s for a fixed set of stations.
#[derive(Debug, Clone)]
pub struct GainModelFactory {
    stations: Vec<String>,
}

impl GainModelFactory {
    pub fn new(stations: Vec<String>) -> GainModelFactory {
        GainModelFactory { stations }
    }
}

impl ModelFactory for GainModelFactory {
    fn make_forward(
        &self,
        config: &ModelConfig,
        baselines: &[Baseline],
        correlations: &[Correlation],
    ) -> Result<Box<dyn Model>, ModelError> {
        let model = GainModel::new(&self.stations, config, baselines, correlations, false)?;
        Ok(Box::new(model))
    }

    fn make_inverse(
        &self,
        config: &ModelConfig,
        baselines: &[Baseline],
        correlations: &[Correlation],
    ) -> Result<Box<dyn Model>, ModelError> {
        let model = GainModel::new(&self.stations, config, baselines, correlations, true)?;
        Ok(Box::new(model))
    }
}

/// A parameter sampled over the evaluation grid.
struct Sampled {
    /// `[time][freq]`
    values: Array2<f64>,

    /// `false` where the parameter isn't defined.
    valid: Array2<bool>,

    /// For solvable parameters, the handle and the derivative of the value
    /// with respect to each coefficient.
    derivatives: Option<(ParmId, Vec<Array2<f64>>)>,
}

#[derive(Debug)]
pub struct GainModel {
    stations: Vec<String>,
    baselines: Vec<Baseline>,
    correlations: Vec<Correlation>,
    sources: Vec<PointSource>,
    no_gains: bool,
    inverse: bool,
    domain: Box2,
    flagged_stations: HashSet<usize>,

    grid: Option<Grid>,
    solvables: HashSet<ParmId>,
    cache: HashMap<usize, ModelResult>,
}

impl GainModel {
    /// # Errors
    ///
    /// This function will return an error if a baseline refers to a station
    /// that doesn't exist, if a flagged station isn't known, if a source has a
    /// non-positive reference frequency or if the domain is empty.
    pub fn new(
        stations: &[String],
        config: &ModelConfig,
        baselines: &[Baseline],
        correlations: &[Correlation],
        inverse: bool,
    ) -> Result<GainModel, ModelError> {
        for &Baseline(p, q) in baselines {
            if p >= stations.len() || q >= stations.len() {
                return Err(ModelError::InvalidBaseline(p, q));
            }
        }
        let flagged_stations = config
            .flagged_stations
            .iter()
            .map(|name| {
                stations
                    .iter()
                    .position(|s| s == name)
                    .ok_or_else(|| ModelError::UnknownStation(name.clone()))
            })
            .collect::<Result<HashSet<_>, _>>()?;
        for source in &config.sources {
            if let Some(ref_freq) = source.ref_freq {
                if !(ref_freq > 0.0) {
                    return Err(ModelError::InvalidRefFreq(ref_freq));
                }
            }
        }
        let domain = config.domain.unwrap_or_else(Box2::unbounded);
        if domain.is_empty() {
            return Err(ModelError::EmptyDomain);
        }

        Ok(GainModel {
            stations: stations.to_vec(),
            baselines: baselines.to_vec(),
            correlations: correlations.to_vec(),
            sources: config.sources.clone(),
            no_gains: config.no_gains,
            inverse,
            domain,
            flagged_stations,
            grid: None,
            solvables: HashSet::new(),
            cache: HashMap::new(),
        })
    }

    pub fn is_inverse(&self) -> bool {
        self.inverse
    }

    /// The (Stokes I) sky brightness at `freq`.
    fn sky(&self, freq: f64) -> f64 {
        if self.sources.is_empty() {
            return 1.0;
        }
        self.sources
            .iter()
            .map(|s| match s.ref_freq {
                Some(ref_freq) => s.flux * (freq / ref_freq).powf(s.spectral_index),
                None => s.flux,
            })
            .sum()
    }

    fn sample_parm(
        &self,
        grid: &Grid,
        parms: &dyn ParameterStore,
        name: &str,
        default: f64,
    ) -> Result<Sampled, ModelError> {
        let (num_freqs, num_times) = grid.shape();
        let dim = (num_times, num_freqs);
        let id = match parms.get(name) {
            Some(id) => id,
            None => {
                return Ok(Sampled {
                    values: Array2::from_elem(dim, default),
                    valid: Array2::from_elem(dim, true),
                    derivatives: None,
                })
            }
        };

        let num_coeffs = parms.coeff_count(id)?;
        let parm_grid = parms.grid(id)?;
        let mut values = Array2::zeros(dim);
        let mut valid = Array2::from_elem(dim, true);
        let mut derivatives = if self.solvables.contains(&id) {
            Some(vec![Array2::zeros(dim); num_coeffs])
        } else {
            None
        };

        let mut coeff_cache: HashMap<Location, Vec<f64>> = HashMap::new();
        for t in 0..num_times {
            let time = grid.time().center(t);
            for f in 0..num_freqs {
                let freq = grid.freq().center(f);
                let (cell, x) = match parm_grid {
                    None => (Location::default(), 0.0),
                    Some(pg) => match pg.locate(freq, time) {
                        Ok(cell) => {
                            let x = (freq - pg.freq().center(cell.freq))
                                / pg.freq().width(cell.freq);
                            (cell, x)
                        }
                        Err(_) => {
                            valid[[t, f]] = false;
                            continue;
                        }
                    },
                };
                let coeff = match coeff_cache.entry(cell) {
                    Entry::Occupied(e) => e.into_mut(),
                    Entry::Vacant(e) => e.insert(parms.coeff(id, cell)?),
                };

                let mut value = 0.0;
                let mut xk = 1.0;
                for (k, c) in coeff.iter().enumerate() {
                    value += c * xk;
                    if let Some(d) = derivatives.as_mut() {
                        d[k][[t, f]] = xk;
                    }
                    xk *= x;
                }
                values[[t, f]] = value;
            }
        }

        Ok(Sampled {
            values,
            valid,
            derivatives: derivatives.map(|d| (id, d)),
        })
    }

    /// The complex gain of `station`'s `feed`.
    fn sample_gain(
        &self,
        grid: &Grid,
        parms: &dyn ParameterStore,
        feed: Feed,
        station: usize,
    ) -> Result<(Sampled, Sampled), ModelError> {
        let name = &self.stations[station];
        let re = self.sample_parm(grid, parms, &gain_parm_name(feed, PartKind::Real, name), 1.0)?;
        let im = self.sample_parm(grid, parms, &gain_parm_name(feed, PartKind::Imag, name), 0.0)?;
        Ok((re, im))
    }

    fn compute(
        &self,
        baseline: usize,
        parms: &dyn ParameterStore,
    ) -> Result<ModelResult, ModelError> {
        let grid = self.grid.as_ref().ok_or(ModelError::NoEvaluationGrid)?;
        let Baseline(p, q) = *self
            .baselines
            .get(baseline)
            .ok_or(ModelError::BaselineIndex {
                index: baseline,
                count: self.baselines.len(),
            })?;
        if self.flagged_stations.contains(&p) || self.flagged_stations.contains(&q) {
            return Ok(ModelResult {
                flagged: true,
                elements: vec![],
            });
        }

        let (num_freqs, num_times) = grid.shape();
        let dim = (num_times, num_freqs);
        let sky = Array1::from_shape_fn(num_freqs, |f| self.sky(grid.freq().center(f)));

        let mut elements = Vec::with_capacity(self.correlations.len());
        for corr in &self.correlations {
            let (feed_p, feed_q) = corr.feeds();
            let sky = if corr.is_parallel_hand() {
                sky.clone()
            } else {
                Array1::zeros(num_freqs)
            };

            if self.no_gains {
                let value = if self.inverse {
                    Array2::from_elem(dim, c64::new(1.0, 0.0))
                } else {
                    Array2::from_shape_fn(dim, |(_, f)| c64::new(sky[f], 0.0))
                };
                elements.push(ModelElement {
                    value,
                    flags: None,
                    partials: IndexMap::new(),
                });
                continue;
            }

            let (re_p, im_p) = self.sample_gain(grid, parms, feed_p, p)?;
            let (re_q, im_q) = self.sample_gain(grid, parms, feed_q, q)?;
            let g_p = Array2::from_shape_fn(dim, |i| c64::new(re_p.values[i], im_p.values[i]));
            let g_q = Array2::from_shape_fn(dim, |i| c64::new(re_q.values[i], im_q.values[i]));
            let mut valid = Array2::from_shape_fn(dim, |i| {
                re_p.valid[i] && im_p.valid[i] && re_q.valid[i] && im_q.valid[i]
            });

            let (value, partials) = if self.inverse {
                let value = Array2::from_shape_fn(dim, |i| {
                    let g = g_p[i] * g_q[i].conj();
                    if g.norm_sqr() > 0.0 {
                        g.inv()
                    } else {
                        valid[i] = false;
                        c64::new(0.0, 0.0)
                    }
                });
                (value, IndexMap::new())
            } else {
                let value =
                    Array2::from_shape_fn(dim, |(t, f)| g_p[[t, f]] * g_q[[t, f]].conj() * sky[f]);

                // d/d(re_p) = conj(g_q) S, d/d(im_p) = i conj(g_q) S,
                // d/d(re_q) = g_p S, d/d(im_q) = -i g_p S.
                let i = c64::new(0.0, 1.0);
                let d_p = Array2::from_shape_fn(dim, |(t, f)| g_q[[t, f]].conj() * sky[f]);
                let d_q = Array2::from_shape_fn(dim, |(t, f)| g_p[[t, f]] * sky[f]);
                let mut partials: IndexMap<CoeffKey, Array2<c64>> = IndexMap::new();
                for (sampled, factor) in [
                    (&re_p, c64::new(1.0, 0.0)),
                    (&im_p, i),
                ] {
                    add_partials(&mut partials, sampled, &d_p, factor);
                }
                for (sampled, factor) in [(&re_q, c64::new(1.0, 0.0)), (&im_q, -i)] {
                    add_partials(&mut partials, sampled, &d_q, factor);
                }
                (value, partials)
            };

            let flags = if valid.iter().all(|&v| v) {
                None
            } else {
                valid.mapv_inplace(|v| !v);
                Some(valid)
            };
            elements.push(ModelElement {
                value,
                flags,
                partials,
            });
        }

        Ok(ModelResult {
            flagged: false,
            elements,
        })
    }
}

/// Accumulate `factor * d * dvalue/dc_k` for every coefficient `k` of a
/// solvable parameter. Contributions to the same coefficient (e.g. on
/// auto-correlations) are summed.
fn add_partials(
    partials: &mut IndexMap<CoeffKey, Array2<c64>>,
    sampled: &Sampled,
    d: &Array2<c64>,
    factor: c64,
) {
    let (id, derivatives) = match &sampled.derivatives {
        Some(x) => x,
        None => return,
    };
    for (k, dk) in derivatives.iter().enumerate() {
        let key = CoeffKey {
            parm: *id,
            coeff: k,
        };
        let partial = partials
            .entry(key)
            .or_insert_with(|| Array2::zeros(d.raw_dim()));
        azip!((p in partial, &d in d, &x in dk) *p += factor * d * x);
    }
}

impl Model for GainModel {
    fn baselines(&self) -> &[Baseline] {
        &self.baselines
    }

    fn correlations(&self) -> &[Correlation] {
        &self.correlations
    }

    fn domain(&self) -> Box2 {
        self.domain
    }

    fn parameters(&self) -> Vec<String> {
        if self.no_gains {
            return vec![];
        }
        let mut names = vec![];
        for &Baseline(p, q) in &self.baselines {
            for corr in &self.correlations {
                let (feed_p, feed_q) = corr.feeds();
                for (feed, station) in [(feed_p, p), (feed_q, q)] {
                    for part in [PartKind::Real, PartKind::Imag] {
                        let name = gain_parm_name(feed, part, &self.stations[station]);
                        if !names.contains(&name) {
                            names.push(name);
                        }
                    }
                }
            }
        }
        names
    }

    fn set_evaluation_grid(&mut self, grid: Grid) {
        self.grid = Some(grid);
        self.cache.clear();
    }

    fn evaluation_grid(&self) -> Option<&Grid> {
        self.grid.as_ref()
    }

    fn set_solvables(&mut self, parms: &[ParmId]) {
        self.solvables = parms.iter().copied().collect();
        self.cache.clear();
    }

    fn evaluate(
        &mut self,
        baseline: usize,
        parms: &dyn ParameterStore,
    ) -> Result<&ModelResult, ModelError> {
        if !self.cache.contains_key(&baseline) {
            let result = self.compute(baseline, parms)?;
            self.cache.insert(baseline, result);
        }
        self.cache
            .get(&baseline)
            .ok_or(ModelError::BaselineIndex {
                index: baseline,
                count: self.baselines.len(),
            })
    }

    fn solvables_changed(&mut self) {
        self.cache.clear();
    }

    fn clear_expressions(&mut self) {
        debug!("Clearing {} cached model results", self.cache.len());
        self.cache.clear();
    }
}
