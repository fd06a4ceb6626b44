// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The aggregator of a calibration group: merges every member's normal
//! equations for the shared cells and solves them.

use std::collections::BTreeMap;

use log::{debug, info, trace};

use super::{
    link::MemberEndpoint,
    wire::{CellUpdate, Message, PartialEquations, Update},
    CoordinatorError, LinkError,
};
use crate::{
    estimate::step_cell,
    grid::Location,
    solver::{CellSolver, SolverStatus},
};

#[derive(Debug)]
struct AggregatorCell {
    coeff: Vec<f64>,
    solver: CellSolver,
    epsilon_index: usize,
    status: SolverStatus,
}

/// What an [`Aggregator`] did over a whole run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    pub rounds: u64,
    pub chunks: u64,
    /// Process IDs of the members, by member index.
    pub members: Vec<u32>,
}

/// Owns the solvers of the cells a calibration group shares.
#[derive(Debug)]
pub struct Aggregator {
    group_size: usize,
    cells: BTreeMap<Location, AggregatorCell>,
    stats: AggregatorStats,
}

impl Aggregator {
    pub fn new(group_size: usize) -> Aggregator {
        Aggregator {
            group_size,
            cells: BTreeMap::new(),
            stats: AggregatorStats::default(),
        }
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    pub fn stats(&self) -> &AggregatorStats {
        &self.stats
    }

    /// Merge one round of contributions, one per member, and take a solver
    /// step for every unfinished cell. Cells are started from the
    /// coefficients of the first member that reports them. When every cell
    /// is finished, the chunk is over and the next round starts afresh.
    ///
    /// # Errors
    ///
    /// Fails if the wrong number of contributions is given or members
    /// disagree on the number of unknowns of a cell.
    pub fn round(&mut self, contributions: &[PartialEquations]) -> Result<Update, CoordinatorError> {
        if contributions.len() != self.group_size {
            return Err(CoordinatorError::MemberCount {
                expected: self.group_size,
                got: contributions.len(),
            });
        }
        let schedule_len = contributions
            .iter()
            .map(|c| c.schedule_len as usize)
            .max()
            .unwrap_or(1);

        for contribution in contributions {
            for cell in &contribution.cells {
                let n = cell.equations.num_unknowns();
                let entry = self
                    .cells
                    .entry(cell.location)
                    .or_insert_with(|| AggregatorCell {
                        coeff: cell.coeff.clone(),
                        solver: CellSolver::new(n, contribution.options),
                        epsilon_index: 0,
                        status: SolverStatus::NotReady,
                    });
                if entry.solver.num_unknowns() != n || entry.coeff.len() != n {
                    return Err(CoordinatorError::UnknownCount {
                        cell: cell.location,
                        expected: entry.solver.num_unknowns(),
                        got: n,
                    });
                }
                if !entry.status.is_terminal() {
                    entry.solver.equations_mut().merge(&cell.equations);
                }
            }
        }

        for cell in self.cells.values_mut().filter(|c| !c.status.is_terminal()) {
            cell.status = step_cell(
                &mut cell.solver,
                &mut cell.coeff,
                &mut cell.epsilon_index,
                schedule_len,
            );
        }
        self.stats.rounds += 1;

        let cells: Vec<CellUpdate> = self
            .cells
            .iter()
            .map(|(location, cell)| CellUpdate {
                location: *location,
                coeff: cell.coeff.clone(),
                status: cell.status,
                epsilon_index: cell.epsilon_index as u32,
            })
            .collect();
        let chunk_done = self.cells.values().all(|c| c.status.is_terminal());
        trace!(
            "Round {}: {} cells, chunk done: {chunk_done}",
            self.stats.rounds,
            cells.len()
        );
        if chunk_done {
            debug!("Chunk finished with {} cells", cells.len());
            self.cells.clear();
            self.stats.chunks += 1;
        }
        Ok(Update { cells, chunk_done })
    }

    /// Serve a whole run: wait for every member to identify itself, then
    /// answer rounds of equations until every member says it's done.
    ///
    /// # Errors
    ///
    /// Fails if a connection fails, a member sends something unexpected or
    /// leaves while others are still solving.
    pub fn serve<E: MemberEndpoint>(
        &mut self,
        endpoints: &mut [E],
    ) -> Result<AggregatorStats, CoordinatorError> {
        if endpoints.len() != self.group_size {
            return Err(CoordinatorError::MemberCount {
                expected: self.group_size,
                got: endpoints.len(),
            });
        }

        let mut members = vec![0; self.group_size];
        for endpoint in endpoints.iter_mut() {
            match endpoint.recv()? {
                Message::Identify(id) => {
                    debug!("Member {} is process {}", id.member, id.process_id);
                    if let Some(slot) = members.get_mut(id.member as usize) {
                        *slot = id.process_id;
                    }
                }
                other => {
                    return Err(LinkError::Unexpected {
                        expected: "identify",
                        got: other.name().to_string(),
                    }
                    .into())
                }
            }
        }
        self.stats.members = members;
        info!("All {} members of the calibration group are connected", self.group_size);

        loop {
            let mut contributions = Vec::with_capacity(self.group_size);
            let mut finished = 0;
            for endpoint in endpoints.iter_mut() {
                match endpoint.recv()? {
                    Message::Equations(partial) => contributions.push(partial),
                    Message::Done => finished += 1,
                    other => {
                        return Err(LinkError::Unexpected {
                            expected: "equations",
                            got: other.name().to_string(),
                        }
                        .into())
                    }
                }
            }
            if finished == endpoints.len() {
                break;
            }
            if finished > 0 {
                return Err(LinkError::Closed.into());
            }

            let update = Message::Update(self.round(&contributions)?);
            for endpoint in endpoints.iter_mut() {
                endpoint.send(&update)?;
            }
        }

        info!(
            "Calibration group finished after {} rounds over {} chunks",
            self.stats.rounds, self.stats.chunks
        );
        Ok(self.stats.clone())
    }
}
