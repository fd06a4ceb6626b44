// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Running a solve, either entirely in this process or together with the
//! other members of a calibration group.
//!
//! A [`LocalCoordinator`] solves the cells covering this worker's data with
//! its own [`CellEstimator`]. A [`GlobalCoordinator`] is used when several
//! workers share one frequency range: every member builds condition
//! equations from its own samples and sends them to an [`Aggregator`], which
//! merges them per cell, solves, and sends the new coefficients back.

mod aggregator;
mod error;
mod link;
pub mod wire;

pub use aggregator::{Aggregator, AggregatorStats};
pub use error::{CoordinatorError, LinkError};
pub use link::{
    channel_link, AggregatorLink, ChannelAggregatorLink, ChannelMemberEndpoint, MemberEndpoint,
    TcpAggregatorLink, TcpMemberEndpoint,
};

use std::{collections::HashMap, ops::Range};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    control::{ControlSession, WorkerRole},
    estimate::{Cell, CellEstimator, EstimateError, ProcessStats, SolveStep, Variant},
    grid::{Axis, Grid, GridError, Location},
    mapper::{find_contained_cell_range, make_axis_map},
    model::Model,
    solver::SolverOptions,
    store::{ParameterStore, SampleChunk},
};
use wire::{CellEquations, PartialEquations};

/// The size of a solution cell in observation cells. 0 means the whole
/// axis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CellSize {
    pub freq: usize,
    pub time: usize,
}

/// Everything a coordinator needs to know about a solve.
#[derive(Debug, Clone, PartialEq)]
pub struct SolveSetup {
    /// Glob patterns of the parameters to solve for.
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub cell_size: CellSize,
    /// Matched `(data, model)` baseline indices.
    pub baselines: Vec<(usize, usize)>,
    /// Matched `(data, model)` correlation indices.
    pub correlations: Vec<(usize, usize)>,
    pub chunk_size: usize,
    pub propagate: bool,
    pub variant: Variant,
    pub options: SolverOptions,
}

/// Sets up and runs a solve over one chunk of data.
pub trait SolveCoordinator {
    /// Work out the solution grid. `data_grid` is the grid of all the
    /// samples this worker holds, not just the loaded chunk, so every solve
    /// with the same cell size ends up on the same grid.
    fn init(
        &mut self,
        setup: SolveSetup,
        data_grid: &Grid,
        session: &dyn ControlSession,
    ) -> Result<(), CoordinatorError>;

    fn solution_grid(&self) -> Option<&Grid>;

    /// Solve, writing the coefficients to `parms`.
    fn run(
        &mut self,
        chunk: &SampleChunk,
        model: &mut dyn Model,
        parms: &mut dyn ParameterStore,
    ) -> Result<ProcessStats, CoordinatorError>;
}

/// Merge every `factor` cells of `axis`; 0 or anything bigger than the axis
/// merges everything.
pub fn compress_axis(axis: &Axis, factor: usize, what: &str) -> Result<Axis, GridError> {
    let factor = if factor == 0 || factor > axis.size() {
        axis.size()
    } else {
        factor
    };
    let (compressed, dropped) = axis.compress_truncating(factor)?;
    if dropped > 0 {
        warn!("The last {dropped} {what} cells don't fill a solution cell and won't be solved for");
    }
    Ok(compressed)
}

/// The solution grid of a local solve.
pub fn make_solution_grid(data_grid: &Grid, cell_size: CellSize) -> Result<Grid, GridError> {
    Ok(Grid::new(
        compress_axis(data_grid.freq(), cell_size.freq, "frequency")?,
        compress_axis(data_grid.time(), cell_size.time, "time")?,
    ))
}

/// The calibration groups, as consecutive runs of kernel indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRoster {
    groups: Vec<Range<usize>>,
}

impl GroupRoster {
    /// # Errors
    ///
    /// Fails if any group is empty.
    pub fn new(sizes: &[usize]) -> Result<GroupRoster, CoordinatorError> {
        let mut groups = Vec::with_capacity(sizes.len());
        let mut start = 0;
        for &size in sizes {
            if size == 0 {
                return Err(CoordinatorError::EmptyGroup);
            }
            groups.push(start..start + size);
            start += size;
        }
        Ok(GroupRoster { groups })
    }

    pub fn num_workers(&self) -> usize {
        self.groups.last().map(|g| g.end).unwrap_or(0)
    }

    /// The group of kernel `index`, and its position within that group.
    pub fn locate(&self, index: usize) -> Option<(usize, usize)> {
        self.groups
            .iter()
            .position(|g| g.contains(&index))
            .map(|group| (group, index - self.groups[group].start))
    }

    /// The kernel indices of a group.
    pub fn group(&self, group: usize) -> Option<Range<usize>> {
        self.groups.get(group).cloned()
    }

    /// Locate `index`, failing if it isn't in any group.
    pub fn member_of(&self, index: usize, sizes: &[usize]) -> Result<(usize, usize), CoordinatorError> {
        self.locate(index).ok_or_else(|| CoordinatorError::NotInGroup {
            index,
            sizes: sizes.to_vec(),
            total: self.num_workers(),
        })
    }
}

fn run_estimator(
    setup: &SolveSetup,
    sol_grid: &Grid,
    chunk: &SampleChunk,
    model: &mut dyn Model,
    parms: &mut dyn ParameterStore,
    step: Option<&mut dyn SolveStep>,
) -> Result<ProcessStats, CoordinatorError> {
    let mut estimator = CellEstimator::new(
        chunk,
        model,
        parms,
        sol_grid.clone(),
        setup.baselines.clone(),
        setup.correlations.clone(),
        setup.variant.clone(),
        setup.options,
    );
    if estimator.set_solvables(&setup.include, &setup.exclude)? == 0 {
        return Err(CoordinatorError::NoSolvables {
            include: setup.include.clone(),
            exclude: setup.exclude.clone(),
        });
    }
    // Only the solution cells holding the chunk's timesteps are solved.
    let time = make_axis_map(chunk.grid.time(), sol_grid.time()).target;
    if time.is_empty() {
        return Err(CoordinatorError::NoTimeOverlap);
    }
    estimator.set_cell_selection(
        Location::new(0, time.start),
        Location::new(sol_grid.freq().size() - 1, time.end),
    );
    estimator.set_cell_chunk_size(setup.chunk_size);
    estimator.set_propagate(setup.propagate);
    let stats = match step {
        Some(step) => estimator.process_with(step)?,
        None => estimator.process()?,
    };
    estimator.dump_stats();
    Ok(stats)
}

/// Solves this worker's cells on its own.
#[derive(Debug, Default)]
pub struct LocalCoordinator {
    setup: Option<SolveSetup>,
    sol_grid: Option<Grid>,
}

impl LocalCoordinator {
    pub fn new() -> LocalCoordinator {
        LocalCoordinator::default()
    }
}

impl SolveCoordinator for LocalCoordinator {
    fn init(
        &mut self,
        setup: SolveSetup,
        data_grid: &Grid,
        _session: &dyn ControlSession,
    ) -> Result<(), CoordinatorError> {
        let grid = make_solution_grid(data_grid, setup.cell_size)?;
        debug!("Solution grid has {:?} cells", grid.shape());
        self.sol_grid = Some(grid);
        self.setup = Some(setup);
        Ok(())
    }

    fn solution_grid(&self) -> Option<&Grid> {
        self.sol_grid.as_ref()
    }

    fn run(
        &mut self,
        chunk: &SampleChunk,
        model: &mut dyn Model,
        parms: &mut dyn ParameterStore,
    ) -> Result<ProcessStats, CoordinatorError> {
        match (&self.setup, &self.sol_grid) {
            (Some(setup), Some(grid)) => run_estimator(setup, grid, chunk, model, parms, None),
            _ => Err(CoordinatorError::NotInitialised),
        }
    }
}

/// Solves together with the rest of a calibration group through an
/// aggregator.
pub struct GlobalCoordinator<'l> {
    group_sizes: Vec<usize>,
    link: &'l mut dyn AggregatorLink,
    setup: Option<SolveSetup>,
    sol_grid: Option<Grid>,
}

impl<'l> GlobalCoordinator<'l> {
    pub fn new(group_sizes: Vec<usize>, link: &'l mut dyn AggregatorLink) -> GlobalCoordinator<'l> {
        GlobalCoordinator {
            group_sizes,
            link,
            setup: None,
            sol_grid: None,
        }
    }
}

/// The frequency axis spanning a whole calibration group, in solution cells
/// of `cell_size` channels. Channels that don't fill a last solution cell are
/// dropped with a warning.
fn group_freq_axis(
    start: f64,
    end: f64,
    channel_width: f64,
    cell_size: usize,
) -> Result<Axis, GridError> {
    // Tolerate rounding in the span.
    let num_channels = ((end - start) / channel_width).round().max(1.0) as usize;
    let channels = Axis::regular(start, channel_width, num_channels)?;
    compress_axis(&channels, cell_size, "frequency")
}

impl SolveCoordinator for GlobalCoordinator<'_> {
    fn init(
        &mut self,
        setup: SolveSetup,
        data_grid: &Grid,
        session: &dyn ControlSession,
    ) -> Result<(), CoordinatorError> {
        let roster = GroupRoster::new(&self.group_sizes)?;
        let (group, member) = roster.member_of(session.index(), &self.group_sizes)?;
        let members = roster
            .group(group)
            .ok_or(CoordinatorError::UnknownWorker(session.index()))?;

        let grid_of = |index: usize| -> Result<Grid, CoordinatorError> {
            let pid = session
                .worker_by_index(WorkerRole::Kernel, index)
                .ok_or(CoordinatorError::UnknownWorker(index))?;
            session.grid(pid).ok_or(CoordinatorError::NoGrid(pid))
        };
        let first = grid_of(members.start)?;
        let last = grid_of(members.end - 1)?;
        let start = first.freq().lower(0);
        let end = last.freq().upper(last.freq().size() - 1);
        let freq = group_freq_axis(start, end, first.freq().width(0), setup.cell_size.freq)?;

        let time = match session.global_time_axis() {
            Some(axis) => {
                let cells = find_contained_cell_range(&axis, data_grid.time().range());
                if cells.is_empty() {
                    return Err(CoordinatorError::NoTimeOverlap);
                }
                axis.subset(cells.start, cells.end)?
            }
            None => data_grid.time().clone(),
        };
        let time = compress_axis(&time, setup.cell_size.time, "time")?;

        info!(
            "Member {member} of calibration group {group} ({} members) solving {:.3} - {:.3} MHz",
            members.len(),
            start / 1e6,
            end / 1e6
        );
        self.sol_grid = Some(Grid::new(freq, time));
        self.setup = Some(setup);
        Ok(())
    }

    fn solution_grid(&self) -> Option<&Grid> {
        self.sol_grid.as_ref()
    }

    fn run(
        &mut self,
        chunk: &SampleChunk,
        model: &mut dyn Model,
        parms: &mut dyn ParameterStore,
    ) -> Result<ProcessStats, CoordinatorError> {
        let (setup, grid) = match (&self.setup, &self.sol_grid) {
            (Some(setup), Some(grid)) => (setup, grid),
            _ => return Err(CoordinatorError::NotInitialised),
        };
        if !self.link.is_connected() {
            return Err(CoordinatorError::NoLink);
        }
        let mut step = GlobalStep {
            link: &mut *self.link,
            options: setup.options,
            schedule_len: setup.variant.schedule_len() as u32,
        };
        run_estimator(setup, grid, chunk, model, parms, Some(&mut step))
    }
}

/// Sends the equations of each pass to the aggregator and takes its solution.
struct GlobalStep<'l> {
    link: &'l mut dyn AggregatorLink,
    options: SolverOptions,
    schedule_len: u32,
}

impl SolveStep for GlobalStep<'_> {
    fn step(&mut self, cells: &mut [Cell]) -> Result<bool, EstimateError> {
        let mut sent: Vec<Location> = vec![];
        let mut equations = vec![];
        for cell in cells.iter_mut().filter(|c| !c.is_done()) {
            sent.push(cell.location);
            equations.push(CellEquations {
                location: cell.location,
                coeff: cell.coeff.clone(),
                equations: cell.solver.equations().clone(),
            });
            cell.solver.equations_mut().clear();
        }
        self.link.send_partial_equations(PartialEquations {
            options: self.options,
            schedule_len: self.schedule_len,
            cells: equations,
        })?;

        let update = self.link.receive_update()?;
        let index: HashMap<Location, usize> = cells
            .iter()
            .enumerate()
            .map(|(i, c)| (c.location, i))
            .collect();
        for cell_update in update.cells {
            if let Some(&i) = index.get(&cell_update.location) {
                let cell = &mut cells[i];
                cell.coeff = cell_update.coeff;
                cell.status = cell_update.status;
                cell.epsilon_index = cell_update.epsilon_index as usize;
                sent.retain(|l| *l != cell_update.location);
            }
        }
        match sent.first() {
            Some(&missing) => Err(EstimateError::MissingCell(missing)),
            None => Ok(update.chunk_done),
        }
    }

    fn steps_empty_chunks(&self) -> bool {
        true
    }
}
