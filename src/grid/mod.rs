// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! One-dimensional cell partitions ([`Axis`]) and the two-dimensional
//! frequency-time [`Grid`]s built out of them.
//!
//! Everything here is immutable coordinate algebra. When the resolution or
//! selection of a grid changes, a new grid is made.

mod error;
#[cfg(test)]
mod tests;

pub use error::GridError;

use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::constants::GRID_TOLERANCE;

/// Are two cell boundaries numerically coincident?
pub fn near(a: f64, b: f64) -> bool {
    if a == b {
        return true;
    }
    if !(a.is_finite() && b.is_finite()) {
        return false;
    }
    (a - b).abs() <= GRID_TOLERANCE * a.abs().max(b.abs())
}

/// An inclusive interval. An interval whose `start` is bigger than its `end`
/// is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval<T> {
    pub start: T,
    pub end: T,
}

impl<T> Interval<T> {
    pub const fn new(start: T, end: T) -> Interval<T> {
        Interval { start, end }
    }
}

impl<T: PartialOrd> Interval<T> {
    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }
}

impl Interval<usize> {
    /// The canonical empty index interval.
    pub const EMPTY: Interval<usize> = Interval { start: 1, end: 0 };

    /// The number of indices in the interval.
    pub fn len(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            self.end - self.start + 1
        }
    }

    pub fn contains(&self, i: usize) -> bool {
        !self.is_empty() && self.start <= i && i <= self.end
    }

    /// The overlap of two index intervals (possibly empty).
    pub fn intersect(&self, other: &Interval<usize>) -> Interval<usize> {
        let i = Interval::new(self.start.max(other.start), self.end.min(other.end));
        if i.is_empty() {
            Interval::EMPTY
        } else {
            i
        }
    }

    pub fn iter(&self) -> RangeInclusive<usize> {
        // An empty RangeInclusive has start > end too.
        self.start..=self.end
    }
}

impl Interval<f64> {
    /// The width of the interval; zero or negative widths indicate a
    /// degenerate interval.
    pub fn width(&self) -> f64 {
        self.end - self.start
    }

    pub fn intersect(&self, other: &Interval<f64>) -> Interval<f64> {
        Interval::new(self.start.max(other.start), self.end.min(other.end))
    }
}

/// A cell address inside a [`Grid`].
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Location {
    pub freq: usize,
    pub time: usize,
}

impl Location {
    pub const fn new(freq: usize, time: usize) -> Location {
        Location { freq, time }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.freq, self.time)
    }
}

/// A rectangular block of cell indices, i.e. a pair of index intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range2 {
    pub freq: Interval<usize>,
    pub time: Interval<usize>,
}

impl Range2 {
    pub const EMPTY: Range2 = Range2 {
        freq: Interval::EMPTY,
        time: Interval::EMPTY,
    };

    pub fn new(start: Location, end: Location) -> Range2 {
        Range2 {
            freq: Interval::new(start.freq, end.freq),
            time: Interval::new(start.time, end.time),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.freq.is_empty() || self.time.is_empty()
    }

    /// The number of cells covered.
    pub fn count(&self) -> usize {
        self.freq.len() * self.time.len()
    }

    pub fn start(&self) -> Location {
        Location::new(self.freq.start, self.time.start)
    }

    pub fn end(&self) -> Location {
        Location::new(self.freq.end, self.time.end)
    }

    pub fn contains(&self, loc: Location) -> bool {
        self.freq.contains(loc.freq) && self.time.contains(loc.time)
    }

    pub fn intersect(&self, other: &Range2) -> Range2 {
        let r = Range2 {
            freq: self.freq.intersect(&other.freq),
            time: self.time.intersect(&other.time),
        };
        if r.is_empty() {
            Range2::EMPTY
        } else {
            r
        }
    }

    /// The position of `loc` in the row-major (time slowest, frequency
    /// fastest) ordering of this block.
    pub fn linear_index(&self, loc: Location) -> usize {
        debug_assert!(self.contains(loc));
        (loc.time - self.time.start) * self.freq.len() + (loc.freq - self.freq.start)
    }

    /// Iterate over the locations of this block; time is the slowest-varying
    /// index.
    pub fn iter(&self) -> impl Iterator<Item = Location> + '_ {
        let freq = self.freq;
        let time = if self.is_empty() {
            Interval::EMPTY
        } else {
            self.time
        };
        time.iter()
            .flat_map(move |t| freq.iter().map(move |f| Location::new(f, t)))
    }
}

/// A real-valued rectangle in (frequency, time) space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Box2 {
    pub freq: Interval<f64>,
    pub time: Interval<f64>,
}

impl Box2 {
    pub const fn new(freq: Interval<f64>, time: Interval<f64>) -> Box2 {
        Box2 { freq, time }
    }

    /// A box that covers everything.
    pub const fn unbounded() -> Box2 {
        Box2 {
            freq: Interval::new(f64::NEG_INFINITY, f64::INFINITY),
            time: Interval::new(f64::NEG_INFINITY, f64::INFINITY),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.freq.width() <= 0.0 || self.time.width() <= 0.0
    }

    pub fn intersect(&self, other: &Box2) -> Box2 {
        Box2 {
            freq: self.freq.intersect(&other.freq),
            time: self.time.intersect(&other.time),
        }
    }

    /// Does `other` lie within this box (with boundary tolerance)?
    pub fn contains(&self, other: &Box2) -> bool {
        let inside = |outer: &Interval<f64>, inner: &Interval<f64>| {
            (inner.start >= outer.start || near(inner.start, outer.start))
                && (inner.end <= outer.end || near(inner.end, outer.end))
        };
        inside(&self.freq, &other.freq) && inside(&self.time, &other.time)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum AxisKind {
    Regular {
        /// The lower boundary of the first cell.
        start: f64,
        width: f64,
        count: usize,
    },
    Irregular {
        lower: Vec<f64>,
        upper: Vec<f64>,
    },
}

/// An ordered, contiguous partition of a one-dimensional range into cells.
///
/// Cells are indexed from zero and satisfy `lower(i) <= upper(i) <=
/// lower(i+1)` (with adjacent boundaries coinciding).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "AxisDef", into = "AxisDef")]
pub struct Axis {
    kind: AxisKind,
}

/// The serialisable description of an [`Axis`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AxisDef {
    Regular { start: f64, width: f64, count: usize },
    Irregular { centers: Vec<f64>, widths: Vec<f64> },
}

impl TryFrom<AxisDef> for Axis {
    type Error = GridError;

    fn try_from(def: AxisDef) -> Result<Axis, GridError> {
        match def {
            AxisDef::Regular {
                start,
                width,
                count,
            } => Axis::regular(start, width, count),
            AxisDef::Irregular { centers, widths } => Axis::irregular(&centers, &widths),
        }
    }
}

impl From<Axis> for AxisDef {
    fn from(axis: Axis) -> AxisDef {
        match axis.kind {
            AxisKind::Regular {
                start,
                width,
                count,
            } => AxisDef::Regular {
                start,
                width,
                count,
            },
            AxisKind::Irregular { lower, upper } => AxisDef::Irregular {
                centers: lower
                    .iter()
                    .zip(upper.iter())
                    .map(|(l, u)| 0.5 * (l + u))
                    .collect(),
                widths: lower
                    .iter()
                    .zip(upper.iter())
                    .map(|(l, u)| u - l)
                    .collect(),
            },
        }
    }
}

impl Axis {
    /// An axis of `count` cells of equal `width`, the first of which starts at
    /// `start`.
    pub fn regular(start: f64, width: f64, count: usize) -> Result<Axis, GridError> {
        if count == 0 {
            return Err(GridError::EmptyAxis);
        }
        if !(width.is_finite() && width > 0.0) || !start.is_finite() {
            return Err(GridError::InvalidWidth { width });
        }
        Ok(Axis {
            kind: AxisKind::Regular {
                start,
                width,
                count,
            },
        })
    }

    /// An axis from explicit cell centres and widths. The cells must be
    /// ordered and contiguous.
    pub fn irregular(centers: &[f64], widths: &[f64]) -> Result<Axis, GridError> {
        if centers.len() != widths.len() {
            return Err(GridError::LengthMismatch {
                centers: centers.len(),
                widths: widths.len(),
            });
        }
        let (lower, upper) = centers
            .iter()
            .zip(widths)
            .map(|(&c, &w)| (c - 0.5 * w, c + 0.5 * w))
            .unzip();
        Axis::from_bounds(lower, upper, widths)
    }

    fn from_bounds(lower: Vec<f64>, upper: Vec<f64>, widths: &[f64]) -> Result<Axis, GridError> {
        if lower.is_empty() {
            return Err(GridError::EmptyAxis);
        }
        if let Some(&width) = widths.iter().find(|w| !(w.is_finite() && **w > 0.0)) {
            return Err(GridError::InvalidWidth { width });
        }
        for i in 1..lower.len() {
            if !near(lower[i], upper[i - 1]) {
                return Err(GridError::NotContiguous { index: i });
            }
        }
        Ok(Axis {
            kind: AxisKind::Irregular { lower, upper },
        })
    }

    pub fn is_regular(&self) -> bool {
        matches!(self.kind, AxisKind::Regular { .. })
    }

    /// The number of cells.
    pub fn size(&self) -> usize {
        match &self.kind {
            AxisKind::Regular { count, .. } => *count,
            AxisKind::Irregular { lower, .. } => lower.len(),
        }
    }

    /// The lower boundary of cell `i`. Panics if `i` is out of bounds.
    pub fn lower(&self, i: usize) -> f64 {
        match &self.kind {
            AxisKind::Regular {
                start,
                width,
                count,
            } => {
                assert!(i < *count, "cell index {i} out of bounds ({count})");
                start + i as f64 * width
            }
            AxisKind::Irregular { lower, .. } => lower[i],
        }
    }

    /// The upper boundary of cell `i`. Panics if `i` is out of bounds.
    pub fn upper(&self, i: usize) -> f64 {
        match &self.kind {
            AxisKind::Regular {
                start,
                width,
                count,
            } => {
                assert!(i < *count, "cell index {i} out of bounds ({count})");
                start + (i + 1) as f64 * width
            }
            AxisKind::Irregular { upper, .. } => upper[i],
        }
    }

    pub fn center(&self, i: usize) -> f64 {
        0.5 * (self.lower(i) + self.upper(i))
    }

    pub fn width(&self, i: usize) -> f64 {
        self.upper(i) - self.lower(i)
    }

    /// The full range covered by the axis.
    pub fn range(&self) -> Interval<f64> {
        Interval::new(self.lower(0), self.upper(self.size() - 1))
    }

    /// Find the index of the cell containing `x`.
    ///
    /// If `x` lies on the boundary between two cells, the right-hand cell is
    /// returned when `bias_right` is set, otherwise the left-hand cell.
    /// `hint` is a cell index at which to start searching; it only affects
    /// performance.
    pub fn locate(&self, x: f64, bias_right: bool, hint: usize) -> Result<usize, GridError> {
        let range = self.range();
        let below = x < range.start && !near(x, range.start);
        let above = x > range.end && !near(x, range.end);
        if below || above || x.is_nan() {
            return Err(GridError::OutOfRange {
                value: x,
                start: range.start,
                end: range.end,
            });
        }

        let last = self.size() - 1;
        let mut i = match &self.kind {
            AxisKind::Regular { start, width, .. } => {
                let i = ((x - start) / width).floor();
                if i < 0.0 {
                    0
                } else {
                    (i as usize).min(last)
                }
            }
            AxisKind::Irregular { upper, .. } => {
                // The first cell whose upper boundary lies beyond x.
                let hint = if hint <= last && x >= self.lower(hint) {
                    hint
                } else {
                    0
                };
                (hint + upper[hint..].partition_point(|&u| u <= x)).min(last)
            }
        };

        if bias_right {
            if i < last && near(x, self.upper(i)) {
                i += 1;
            }
        } else if i > 0 && near(x, self.lower(i)) {
            i -= 1;
        }
        Ok(i)
    }

    /// The sub-axis made up of cells `first..=last`.
    pub fn subset(&self, first: usize, last: usize) -> Result<Axis, GridError> {
        let size = self.size();
        for index in [first, last] {
            if index >= size {
                return Err(GridError::Index { index, size });
            }
        }
        if first > last {
            return Err(GridError::InvertedSubset { first, last });
        }

        let kind = match &self.kind {
            AxisKind::Regular { width, .. } => AxisKind::Regular {
                start: self.lower(first),
                width: *width,
                count: last - first + 1,
            },
            AxisKind::Irregular { lower, upper } => AxisKind::Irregular {
                lower: lower[first..=last].to_vec(),
                upper: upper[first..=last].to_vec(),
            },
        };
        Ok(Axis { kind })
    }

    /// Merge every `factor` adjacent cells into one. Fails if `factor` does
    /// not evenly divide the number of cells; see
    /// [`Axis::compress_truncating`] to drop the remainder instead.
    pub fn compress(&self, factor: usize) -> Result<Axis, GridError> {
        let size = self.size();
        if factor != 0 && size % factor != 0 {
            return Err(GridError::UnevenCompression {
                size,
                factor,
                dropped: size % factor,
            });
        }
        self.compress_truncating(factor).map(|(axis, _)| axis)
    }

    /// Merge every `factor` adjacent cells into one, dropping a trailing
    /// partial group. The number of dropped cells is returned alongside the
    /// new axis.
    pub fn compress_truncating(&self, factor: usize) -> Result<(Axis, usize), GridError> {
        let size = self.size();
        if factor == 0 {
            return Err(GridError::ZeroCompression);
        }
        if factor > size {
            return Err(GridError::CompressionTooLarge { size, factor });
        }
        let count = size / factor;
        let dropped = size - count * factor;

        let axis = match &self.kind {
            AxisKind::Regular { start, width, .. } => Axis::regular(*start, width * factor as f64, count)?,
            AxisKind::Irregular { lower, upper } => {
                let new_lower: Vec<f64> = (0..count).map(|i| lower[i * factor]).collect();
                let new_upper: Vec<f64> = (0..count).map(|i| upper[(i + 1) * factor - 1]).collect();
                let widths: Vec<f64> = new_lower
                    .iter()
                    .zip(new_upper.iter())
                    .map(|(l, u)| u - l)
                    .collect();
                Axis::from_bounds(new_lower, new_upper, &widths)?
            }
        };
        Ok((axis, dropped))
    }
}

/// A two-dimensional grid: a frequency axis crossed with a time axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grid {
    freq: Axis,
    time: Axis,
}

impl Grid {
    pub fn new(freq: Axis, time: Axis) -> Grid {
        Grid { freq, time }
    }

    pub fn freq(&self) -> &Axis {
        &self.freq
    }

    pub fn time(&self) -> &Axis {
        &self.time
    }

    /// (number of frequency cells, number of time cells)
    pub fn shape(&self) -> (usize, usize) {
        (self.freq.size(), self.time.size())
    }

    pub fn num_cells(&self) -> usize {
        self.freq.size() * self.time.size()
    }

    /// All cell indices of this grid.
    pub fn cells(&self) -> Range2 {
        Range2::new(
            Location::new(0, 0),
            Location::new(self.freq.size() - 1, self.time.size() - 1),
        )
    }

    /// Restrict both axes to the cells between `start` and `end` (inclusive).
    pub fn subset(&self, start: Location, end: Location) -> Result<Grid, GridError> {
        Ok(Grid {
            freq: self.freq.subset(start.freq, end.freq)?,
            time: self.time.subset(start.time, end.time)?,
        })
    }

    pub fn subset_range(&self, range: &Range2) -> Result<Grid, GridError> {
        self.subset(range.start(), range.end())
    }

    /// The real-valued extent of the grid.
    pub fn bounding_box(&self) -> Box2 {
        Box2::new(self.freq.range(), self.time.range())
    }

    /// The real-valued extent of one cell.
    pub fn cell_box(&self, loc: Location) -> Box2 {
        Box2::new(
            Interval::new(self.freq.lower(loc.freq), self.freq.upper(loc.freq)),
            Interval::new(self.time.lower(loc.time), self.time.upper(loc.time)),
        )
    }

    /// The cell containing the point (`freq`, `time`).
    pub fn locate(&self, freq: f64, time: f64) -> Result<Location, GridError> {
        Ok(Location::new(
            self.freq.locate(freq, true, 0)?,
            self.time.locate(time, true, 0)?,
        ))
    }
}
