// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Index maps between the three grids involved in a solve.
//!
//! * The *observation* grid is the grid of the samples held by a worker.
//! * The *evaluation* grid is the part of the observation grid that lies
//!   completely inside the model's domain of validity.
//! * The *solution* grid is the (usually coarser) grid over which the model
//!   coefficients are estimated.
//!
//! An empty intersection between any of these is not an error; it simply
//! means there is nothing to do, and callers must check
//! [`GridMapper::is_selection_empty`] before starting an estimation pass.

#[cfg(test)]
mod tests;

use log::{debug, trace};

use crate::grid::{near, Axis, Box2, Grid, Interval, Location, Range2};

/// The maximal contiguous range of `axis` cells that lie *completely* inside
/// `interval`.
///
/// A boundary cell is only included if its own boundary coincides with the
/// interval's boundary (within tolerance). The empty interval is returned if
/// no cell qualifies, including when `interval` has zero or negative width.
pub fn find_contained_cell_range(axis: &Axis, interval: Interval<f64>) -> Interval<usize> {
    if interval.width() <= 0.0 || near(interval.start, interval.end) {
        return Interval::EMPTY;
    }
    let overlap = axis.range().intersect(&interval);
    if overlap.width() <= 0.0 || near(overlap.start, overlap.end) {
        return Interval::EMPTY;
    }

    let (mut start, mut end) = match (
        axis.locate(overlap.start, true, 0),
        axis.locate(overlap.end, false, 0),
    ) {
        (Ok(s), Ok(e)) => (s, e),
        // Can't happen, the overlap is inside the axis range.
        _ => return Interval::EMPTY,
    };

    let lower = axis.lower(start);
    if lower < interval.start && !near(lower, interval.start) {
        start += 1;
    }
    let upper = axis.upper(end);
    if upper > interval.end && !near(upper, interval.end) {
        match end.checked_sub(1) {
            Some(e) => end = e,
            None => return Interval::EMPTY,
        }
    }

    if start > end {
        Interval::EMPTY
    } else {
        Interval::new(start, end)
    }
}

/// A monotonic map from the cells of one axis onto the cells of another.
#[derive(Debug, Clone, PartialEq)]
pub struct AxisMap {
    /// The cells of the source axis whose centres lie inside the target axis.
    pub domain: Interval<usize>,

    /// The cells of the target axis that are hit.
    pub target: Interval<usize>,

    /// For each source cell in `domain` (offset by `domain.start`), the index
    /// of the target cell containing its centre, relative to `target.start`.
    pub index: Vec<usize>,
}

impl AxisMap {
    fn empty() -> AxisMap {
        AxisMap {
            domain: Interval::EMPTY,
            target: Interval::EMPTY,
            index: vec![],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// The (absolute) target cell of source cell `i`.
    pub fn target_of(&self, i: usize) -> Option<usize> {
        if !self.domain.contains(i) {
            return None;
        }
        Some(self.target.start + self.index[i - self.domain.start])
    }

    /// The source cells mapping onto the *relative* target cells
    /// `rel.start..=rel.end`, found by binary search.
    fn source_range(&self, rel: Interval<usize>) -> Interval<usize> {
        let lo = self.index.partition_point(|&v| v < rel.start);
        let hi = self.index.partition_point(|&v| v <= rel.end);
        if hi <= lo {
            Interval::EMPTY
        } else {
            Interval::new(self.domain.start + lo, self.domain.start + hi - 1)
        }
    }
}

/// Map each cell of `from` onto the cell of `to` that contains its centre.
pub fn make_axis_map(from: &Axis, to: &Axis) -> AxisMap {
    let to_range = to.range();
    let overlap = from.range().intersect(&to_range);
    if overlap.width() <= 0.0 || near(overlap.start, overlap.end) {
        return AxisMap::empty();
    }

    let (mut first, mut last) = match (
        from.locate(overlap.start, true, 0),
        from.locate(overlap.end, false, 0),
    ) {
        (Ok(f), Ok(l)) => (f, l),
        _ => return AxisMap::empty(),
    };
    let inside = |c: f64| {
        (c >= to_range.start || near(c, to_range.start))
            && (c <= to_range.end || near(c, to_range.end))
    };
    while first <= last && !inside(from.center(first)) {
        first += 1;
    }
    while last >= first && !inside(from.center(last)) {
        if last == 0 {
            return AxisMap::empty();
        }
        last -= 1;
    }
    if first > last {
        return AxisMap::empty();
    }

    let mut absolute = Vec::with_capacity(last - first + 1);
    let mut hint = 0;
    for i in first..=last {
        match to.locate(from.center(i), true, hint) {
            Ok(j) => {
                absolute.push(j);
                hint = j;
            }
            Err(_) => return AxisMap::empty(),
        }
    }
    let target = Interval::new(absolute[0], absolute[absolute.len() - 1]);
    AxisMap {
        domain: Interval::new(first, last),
        target,
        index: absolute.into_iter().map(|j| j - target.start).collect(),
    }
}

/// The result of [`GridMapper::set_cell_selection`]: the same block of cells
/// expressed in the coordinates of each grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellSelection {
    /// Selected cells of the solution grid.
    pub solution: Range2,

    /// `solution`, relative to the first solution cell covered by the
    /// evaluation grid.
    pub relative: Range2,

    /// Evaluation-grid cells belonging to the selected solution cells.
    pub eval: Range2,

    /// Observation-grid cells belonging to the selected solution cells.
    pub obs: Range2,
}

impl CellSelection {
    pub const EMPTY: CellSelection = CellSelection {
        solution: Range2::EMPTY,
        relative: Range2::EMPTY,
        eval: Range2::EMPTY,
        obs: Range2::EMPTY,
    };

    pub fn is_empty(&self) -> bool {
        self.solution.is_empty()
    }

    /// The number of selected solution cells.
    pub fn count(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            self.solution.count()
        }
    }
}

/// Reconciles the observation, evaluation and solution grids.
#[derive(Debug, Clone)]
pub struct GridMapper {
    obs_grid: Grid,
    sol_grid: Grid,
    domain: Box2,

    eval_grid: Option<Grid>,
    /// The observation-grid cell at the evaluation grid's origin.
    eval_offset: Location,

    freq_map: AxisMap,
    time_map: AxisMap,

    /// The solution-grid cells intersected by the evaluation grid
    /// (`evalStart..=evalEnd`).
    eval_cells: Range2,

    intersection_empty: bool,
    selection: CellSelection,
}

impl GridMapper {
    /// Set up the maps. Initially the entire solution grid is selected.
    pub fn new(obs_grid: Grid, domain: Box2, sol_grid: Grid) -> GridMapper {
        let mut mapper = GridMapper {
            obs_grid,
            sol_grid,
            domain,
            eval_grid: None,
            eval_offset: Location::default(),
            freq_map: AxisMap::empty(),
            time_map: AxisMap::empty(),
            eval_cells: Range2::EMPTY,
            intersection_empty: true,
            selection: CellSelection::EMPTY,
        };
        mapper.make_eval_grid();
        mapper.make_cell_map();
        let all = mapper.sol_grid.cells();
        mapper.set_cell_selection(all.start(), all.end());
        mapper
    }

    /// The evaluation grid is the part of the observation grid that is fully
    /// contained in the model domain.
    fn make_eval_grid(&mut self) {
        let freq = find_contained_cell_range(self.obs_grid.freq(), self.domain.freq);
        let time = find_contained_cell_range(self.obs_grid.time(), self.domain.time);
        if freq.is_empty() || time.is_empty() {
            debug!("Observation grid and model domain do not intersect");
            self.eval_grid = None;
            self.intersection_empty = true;
            return;
        }

        let range = Range2 { freq, time };
        self.eval_offset = range.start();
        self.eval_grid = self.obs_grid.subset_range(&range).ok();
        self.intersection_empty = self.eval_grid.is_none();
    }

    fn make_cell_map(&mut self) {
        let eval_grid = match &self.eval_grid {
            Some(g) => g,
            None => return,
        };
        self.freq_map = make_axis_map(eval_grid.freq(), self.sol_grid.freq());
        self.time_map = make_axis_map(eval_grid.time(), self.sol_grid.time());
        if self.freq_map.is_empty() || self.time_map.is_empty() {
            debug!("Evaluation grid and solution grid do not intersect");
            self.intersection_empty = true;
            self.eval_cells = Range2::EMPTY;
            return;
        }
        self.intersection_empty = false;
        self.eval_cells = Range2 {
            freq: self.freq_map.target,
            time: self.time_map.target,
        };
    }

    /// Select the solution cells `start..=end`. The selection is clipped
    /// against the solution cells that the evaluation grid covers; if nothing
    /// remains, the selection is empty.
    pub fn set_cell_selection(&mut self, start: Location, end: Location) {
        self.selection = self.compute_selection(Range2::new(start, end));
        trace!("Cell selection: {:?}", self.selection);
    }

    fn compute_selection(&self, requested: Range2) -> CellSelection {
        if self.intersection_empty {
            return CellSelection::EMPTY;
        }
        let solution = requested.intersect(&self.eval_cells);
        if solution.is_empty() {
            return CellSelection::EMPTY;
        }

        let origin = self.eval_cells.start();
        let relative = Range2::new(
            Location::new(
                solution.freq.start - origin.freq,
                solution.time.start - origin.time,
            ),
            Location::new(
                solution.freq.end - origin.freq,
                solution.time.end - origin.time,
            ),
        );
        let eval = Range2 {
            freq: self.freq_map.source_range(relative.freq),
            time: self.time_map.source_range(relative.time),
        };
        if eval.is_empty() {
            // The selected solution cells are finer than the evaluation grid
            // and no cell centre falls inside them.
            return CellSelection::EMPTY;
        }
        let obs = Range2::new(
            Location::new(
                eval.freq.start + self.eval_offset.freq,
                eval.time.start + self.eval_offset.time,
            ),
            Location::new(
                eval.freq.end + self.eval_offset.freq,
                eval.time.end + self.eval_offset.time,
            ),
        );

        CellSelection {
            solution,
            relative,
            eval,
            obs,
        }
    }

    pub fn selection(&self) -> &CellSelection {
        &self.selection
    }

    pub fn is_selection_empty(&self) -> bool {
        self.selection.is_empty()
    }

    pub fn selected_cell_count(&self) -> usize {
        self.selection.count()
    }

    pub fn is_intersection_empty(&self) -> bool {
        self.intersection_empty
    }

    /// The solution-grid cells covered by the evaluation grid.
    pub fn eval_cells(&self) -> Range2 {
        self.eval_cells
    }

    pub fn eval_grid(&self) -> Option<&Grid> {
        self.eval_grid.as_ref()
    }

    pub fn eval_offset(&self) -> Location {
        self.eval_offset
    }

    pub fn freq_map(&self) -> &AxisMap {
        &self.freq_map
    }

    pub fn time_map(&self) -> &AxisMap {
        &self.time_map
    }

    pub fn obs_grid(&self) -> &Grid {
        &self.obs_grid
    }

    pub fn sol_grid(&self) -> &Grid {
        &self.sol_grid
    }

    /// The part of the observation grid the model needs to be evaluated on
    /// for the current selection.
    pub fn request_grid(&self) -> Option<Grid> {
        if self.selection.is_empty() {
            return None;
        }
        self.obs_grid.subset_range(&self.selection.obs).ok()
    }

    /// The solution cell that the observation cell `obs` contributes to, if
    /// any.
    pub fn solution_cell(&self, obs: Location) -> Option<Location> {
        if self.intersection_empty {
            return None;
        }
        let eval_freq = obs.freq.checked_sub(self.eval_offset.freq)?;
        let eval_time = obs.time.checked_sub(self.eval_offset.time)?;
        Some(Location::new(
            self.freq_map.target_of(eval_freq)?,
            self.time_map.target_of(eval_time)?,
        ))
    }
}
