// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors associated with axes and grids.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GridError {
    #[error("An axis must have at least one cell")]
    EmptyAxis,

    #[error("Cell widths must be positive and finite; got {width}")]
    InvalidWidth { width: f64 },

    #[error("Got {centers} cell centres but {widths} cell widths")]
    LengthMismatch { centers: usize, widths: usize },

    #[error("Cell {index} is not contiguous with its predecessor (or is out of order)")]
    NotContiguous { index: usize },

    #[error("Value {value} is outside of the axis range [{start}, {end}]")]
    OutOfRange { value: f64, start: f64, end: f64 },

    #[error("Cell index {index} is out of bounds for an axis of {size} cells")]
    Index { index: usize, size: usize },

    #[error("Cannot subset cells {first}..={last}; the first index is bigger than the last")]
    InvertedSubset { first: usize, last: usize },

    #[error("Cannot compress an axis by a factor of zero")]
    ZeroCompression,

    #[error("Compressing {size} cells by a factor of {factor} would drop {dropped} trailing cells")]
    UnevenCompression {
        size: usize,
        factor: usize,
        dropped: usize,
    },

    #[error("Cannot compress {size} cells by a factor of {factor}; the factor is bigger than the axis")]
    CompressionTooLarge { size: usize, factor: usize },
}
