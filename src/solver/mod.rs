// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The per-cell least-squares solver.
//!
//! Condition equations are accumulated into normal equations
//! ([`NormalEquations`]); once per iteration, [`CellSolver::iterate`] takes a
//! damped (Levenberg-Marquardt) Gauss-Newton step on the cell's coefficients
//! and classifies the cell.


use log::trace;
use nalgebra::{DMatrix, DVector};
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter};

use crate::constants::{
    DEFAULT_EPSILON_DERIVATIVE, DEFAULT_EPSILON_VALUE, DEFAULT_LM_FACTOR, DEFAULT_MAX_ITERATIONS,
    LM_FACTOR_STEP, MAX_LM_FACTOR, SVD_TOLERANCE,
};

/// Options controlling each cell's solver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    /// The maximum number of iterations before a cell gives up.
    pub max_iterations: u32,

    /// A cell has converged when its (relative) solution increment drops
    /// below this value.
    pub epsilon_value: f64,

    /// A cell has converged when the largest derivative of its cost function
    /// drops below this value.
    pub epsilon_derivative: f64,

    /// The initial Levenberg-Marquardt damping factor. Zero gives plain
    /// Gauss-Newton steps.
    pub lm_factor: f64,

    /// Solve the normal equations with a singular-value decomposition
    /// (tolerating rank deficiency) rather than a Cholesky decomposition.
    pub use_svd: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            epsilon_value: DEFAULT_EPSILON_VALUE,
            epsilon_derivative: DEFAULT_EPSILON_DERIVATIVE,
            lm_factor: DEFAULT_LM_FACTOR,
            use_svd: false,
        }
    }
}

/// The state of a cell after an iteration. Everything other than `NotReady`
/// is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, Serialize, Deserialize)]
pub enum SolverStatus {
    NotReady,
    /// The solution increment or the derivative level dropped below its
    /// threshold.
    Converged,
    MaxIterations,
    /// The damping factor exceeded its limit without the fit improving.
    NoReduction,
    Singular,
}

impl SolverStatus {
    pub fn is_terminal(self) -> bool {
        self != SolverStatus::NotReady
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            SolverStatus::NotReady => 0,
            SolverStatus::Converged => 1,
            SolverStatus::MaxIterations => 2,
            SolverStatus::NoReduction => 3,
            SolverStatus::Singular => 4,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Option<SolverStatus> {
        Some(match v {
            0 => SolverStatus::NotReady,
            1 => SolverStatus::Converged,
            2 => SolverStatus::MaxIterations,
            3 => SolverStatus::NoReduction,
            4 => SolverStatus::Singular,
            _ => return None,
        })
    }
}

/// Normal equations `A x = b` accumulated from weighted condition equations,
/// along with the weighted sum of squared residuals.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalEquations {
    matrix: Array2<f64>,
    rhs: Array1<f64>,
    chi2: f64,
    count: u64,
}

impl NormalEquations {
    pub fn new(num_unknowns: usize) -> NormalEquations {
        NormalEquations {
            matrix: Array2::zeros((num_unknowns, num_unknowns)),
            rhs: Array1::zeros(num_unknowns),
            chi2: 0.0,
            count: 0,
        }
    }

    /// Re-assemble normal equations from their raw parts (e.g. after
    /// decoding them off the wire).
    pub fn from_parts(
        num_unknowns: usize,
        matrix: Vec<f64>,
        rhs: Vec<f64>,
        chi2: f64,
        count: u64,
    ) -> Option<NormalEquations> {
        if rhs.len() != num_unknowns {
            return None;
        }
        let matrix = Array2::from_shape_vec((num_unknowns, num_unknowns), matrix).ok()?;
        Some(NormalEquations {
            matrix,
            rhs: Array1::from(rhs),
            chi2,
            count,
        })
    }

    pub fn num_unknowns(&self) -> usize {
        self.rhs.len()
    }

    /// The number of condition equations accumulated.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn chi2(&self) -> f64 {
        self.chi2
    }

    pub fn matrix(&self) -> ArrayView2<f64> {
        self.matrix.view()
    }

    pub fn rhs(&self) -> ArrayView1<f64> {
        self.rhs.view()
    }

    pub fn clear(&mut self) {
        self.matrix.fill(0.0);
        self.rhs.fill(0.0);
        self.chi2 = 0.0;
        self.count = 0;
    }

    /// Add one condition equation `sum_k d_k dx_{i_k} = residual` with the
    /// given weight. `indices` and `derivatives` are parallel; only the
    /// unknowns the equation depends on need to be listed.
    pub fn add(&mut self, indices: &[usize], derivatives: &[f64], weight: f64, residual: f64) {
        debug_assert_eq!(indices.len(), derivatives.len());
        for (&i, &di) in indices.iter().zip(derivatives) {
            let wdi = weight * di;
            self.rhs[i] += wdi * residual;
            for (&j, &dj) in indices.iter().zip(derivatives) {
                self.matrix[[i, j]] += wdi * dj;
            }
        }
        self.chi2 += weight * residual * residual;
        self.count += 1;
    }

    /// Add another set of normal equations for the same unknowns to these.
    pub fn merge(&mut self, other: &NormalEquations) {
        assert_eq!(
            self.num_unknowns(),
            other.num_unknowns(),
            "cannot merge normal equations with different numbers of unknowns"
        );
        self.matrix += &other.matrix;
        self.rhs += &other.rhs;
        self.chi2 += other.chi2;
        self.count += other.count;
    }

    /// Solve `(A + lambda diag(A)) x = b`. `None` is returned if the system is
    /// singular.
    fn solve_damped(&self, lambda: f64, use_svd: bool) -> Option<Vec<f64>> {
        let n = self.num_unknowns();
        let a = DMatrix::from_fn(n, n, |i, j| {
            let v = self.matrix[[i, j]];
            if i == j {
                v * (1.0 + lambda)
            } else {
                v
            }
        });
        let b = DVector::from_iterator(n, self.rhs.iter().copied());

        let x = if use_svd {
            let svd = a.svd(true, true);
            let max_sv = svd.singular_values.max();
            if !(max_sv > 0.0) {
                return None;
            }
            svd.solve(&b, SVD_TOLERANCE * max_sv).ok()?
        } else {
            a.cholesky()?.solve(&b)
        };
        if x.iter().all(|v| v.is_finite()) {
            Some(x.iter().copied().collect())
        } else {
            None
        }
    }
}

/// The last accepted linearisation point.
#[derive(Debug, Clone)]
struct Accepted {
    coeff: Vec<f64>,
    equations: NormalEquations,
}

/// A Levenberg-Marquardt solver for the coefficients of one cell.
#[derive(Debug, Clone)]
pub struct CellSolver {
    options: SolverOptions,
    equations: NormalEquations,
    lambda: f64,
    iteration: u32,
    status: SolverStatus,
    accepted: Option<Accepted>,
}

impl CellSolver {
    pub fn new(num_unknowns: usize, options: SolverOptions) -> CellSolver {
        CellSolver {
            options,
            equations: NormalEquations::new(num_unknowns),
            lambda: options.lm_factor,
            iteration: 0,
            status: SolverStatus::NotReady,
            accepted: None,
        }
    }

    pub fn num_unknowns(&self) -> usize {
        self.equations.num_unknowns()
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    pub fn status(&self) -> SolverStatus {
        self.status
    }

    /// The number of iterations taken since creation or the last reset.
    pub fn iterations(&self) -> u32 {
        self.iteration
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    pub fn equations(&self) -> &NormalEquations {
        &self.equations
    }

    pub fn equations_mut(&mut self) -> &mut NormalEquations {
        &mut self.equations
    }

    /// Forget everything; the next iteration starts from scratch.
    pub fn reset(&mut self) {
        self.equations.clear();
        self.lambda = self.options.lm_factor;
        self.iteration = 0;
        self.status = SolverStatus::NotReady;
        self.accepted = None;
    }

    /// Take one step using the equations accumulated since the last call,
    /// updating `coeff` in place. The accumulated equations are cleared.
    ///
    /// If the fit got worse than at the last accepted point, the step is
    /// rejected: `coeff` reverts to the accepted values and a more strongly
    /// damped step is taken from there.
    pub fn iterate(&mut self, coeff: &mut [f64]) -> SolverStatus {
        assert_eq!(coeff.len(), self.num_unknowns());
        if self.status.is_terminal() {
            self.equations.clear();
            return self.status;
        }
        self.status = self.step(coeff);
        self.equations.clear();
        self.status
    }

    fn step(&mut self, coeff: &mut [f64]) -> SolverStatus {
        if self.equations.is_empty() {
            return SolverStatus::Singular;
        }
        self.iteration += 1;

        let worse = match &self.accepted {
            Some(acc) => self.equations.chi2 > acc.equations.chi2,
            None => false,
        };
        if worse {
            // Can't be None, checked above.
            if let Some(acc) = &self.accepted {
                coeff.copy_from_slice(&acc.coeff);
            }
            self.lambda *= LM_FACTOR_STEP;
            if self.lambda > MAX_LM_FACTOR {
                return SolverStatus::NoReduction;
            }
            trace!("Step rejected; damping increased to {:e}", self.lambda);
        } else {
            if self.accepted.is_some() {
                self.lambda /= LM_FACTOR_STEP;
            }
            self.accepted = Some(Accepted {
                coeff: coeff.to_vec(),
                equations: self.equations.clone(),
            });
        }
        let equations = match &self.accepted {
            Some(acc) => &acc.equations,
            None => return SolverStatus::Singular,
        };

        let derivative_level = equations.rhs.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
        if derivative_level <= self.options.epsilon_derivative {
            return SolverStatus::Converged;
        }

        let dx = match equations.solve_damped(self.lambda, self.options.use_svd) {
            Some(dx) => dx,
            None => return SolverStatus::Singular,
        };
        let mut dx_norm = 0.0;
        let mut x_norm = 0.0;
        for (c, d) in coeff.iter_mut().zip(dx.iter()) {
            *c += d;
            dx_norm += d * d;
            x_norm += *c * *c;
        }
        let (dx_norm, x_norm): (f64, f64) = (dx_norm.sqrt(), x_norm.sqrt());

        if dx_norm <= self.options.epsilon_value * (x_norm + self.options.epsilon_value) {
            SolverStatus::Converged
        } else if self.iteration >= self.options.max_iterations {
            SolverStatus::MaxIterations
        } else {
            SolverStatus::NotReady
        }
    }
}
