// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
A distributed, grid-based least-squares calibration kernel for interferometric
data.

Each kernel process holds a time/frequency slice of observed samples and a
parametric model. Model coefficients are estimated over a (usually coarser)
solution grid, either by each kernel on its own or jointly by a calibration
group of kernels feeding a central aggregator. Kernels are driven by
[`control::ProcessControl`], which pulls commands from a shared control
session.
 */

pub mod constants;
pub mod control;
pub mod coordinator;
pub mod estimate;
pub mod grid;
pub mod mapper;
pub mod model;
pub mod selection;
pub mod solver;
pub mod store;

mod cli;

pub use cli::{Selfcal, SelfcalError};

use crossbeam_utils::atomic::AtomicCell;

/// Complex double-precision numbers; samples and model values use these.
#[allow(non_camel_case_types)]
pub type c64 = num_complex::Complex<f64>;

/// Are progress bars being drawn? This should only ever be enabled by the
/// binary.
pub(crate) static PROGRESS_BARS: AtomicCell<bool> = AtomicCell::new(false);
