// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Useful constants.

All constants *must* be double precision; coefficients, cell boundaries and
normal equations are all handled in double precision.
 */

/// Relative tolerance used when deciding whether two cell boundaries coincide.
pub const GRID_TOLERANCE: f64 = 1e-12;

/// Default maximum number of solver iterations per cell.
pub const DEFAULT_MAX_ITERATIONS: u32 = 50;

/// Default threshold on the (relative) solution increment; below it a cell is
/// considered converged.
pub const DEFAULT_EPSILON_VALUE: f64 = 1e-8;

/// Default threshold on the derivative level (the largest element of the
/// right-hand side of the normal equations).
pub const DEFAULT_EPSILON_DERIVATIVE: f64 = 1e-8;

/// Default Levenberg-Marquardt damping factor.
pub const DEFAULT_LM_FACTOR: f64 = 1e-3;

/// The damping factor is never allowed to grow beyond this value; if it does,
/// the cell is declared [`crate::solver::SolverStatus::NoReduction`].
pub const MAX_LM_FACTOR: f64 = 1e10;

/// The multiplicative change of the damping factor after a (un)successful step.
pub const LM_FACTOR_STEP: f64 = 10.0;

/// Singular values (relative to the largest) below this are treated as zero
/// when solving via SVD.
pub const SVD_TOLERANCE: f64 = 1e-12;

/// The annealing schedule of the robust (IRLS) estimator.
pub const DEFAULT_EPSILON_SCHEDULE: [f64; 3] = [1e-4, 1e-5, 1e-6];

/// Default number of solution time-cells held in memory at once.
pub const DEFAULT_CELL_CHUNK_SIZE: usize = 1;

/// Initial delay between polls of the control session \[milliseconds\].
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10;

/// The poll delay doubles until it reaches this value \[milliseconds\].
pub const DEFAULT_MAX_POLL_INTERVAL_MS: u64 = 1000;

/// How many times a worker tries to connect to the aggregator before giving
/// up.
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 5;

/// The initial delay between aggregator connection attempts \[milliseconds\].
pub const DEFAULT_CONNECT_BACKOFF_MS: u64 = 100;
