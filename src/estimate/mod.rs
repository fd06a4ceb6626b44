// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-cell weighted least-squares estimation of model coefficients over a
//! solution grid.
//!
//! A [`CellEstimator`] walks the selected solution cells in chunks of time
//! cells. For every chunk it loads the current coefficients of each cell,
//! then repeatedly evaluates the model, turns every unflagged sample into
//! condition equations for the cell owning it, and lets a [`SolveStep`]
//! update the coefficients until every cell has a terminal status.

mod error;

pub use error::EstimateError;

use std::{
    collections::HashMap,
    ops::Range,
    time::{Duration, Instant},
};

use indexmap::IndexMap;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use itertools::Itertools;
use log::{debug, info, trace, warn};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use vec1::Vec1;

use crate::{
    c64,
    constants::{DEFAULT_CELL_CHUNK_SIZE, DEFAULT_EPSILON_SCHEDULE},
    grid::{Grid, Interval, Location, Range2},
    mapper::{AxisMap, CellSelection, GridMapper},
    model::{CoeffKey, Model, ModelResult},
    selection::select_parameters,
    solver::{CellSolver, SolverOptions, SolverStatus},
    store::{ParameterStore, ParmId, SampleChunk},
    PROGRESS_BARS,
};

/// How the standard variant forms a residual from an observed and a
/// predicted sample.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum StandardResidual {
    /// `|observed| - Re(predicted)`, one equation per sample.
    #[default]
    #[strum(serialize = "amplitude_minus_real")]
    AmplitudeMinusReal,

    /// `observed - predicted`, one equation each for the real and imaginary
    /// parts.
    #[strum(serialize = "complex")]
    Complex,
}

/// The weighting scheme of the condition equations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Variant {
    /// Weights are the inverse sample covariance.
    Standard {
        #[serde(default)]
        residual: StandardResidual,
    },

    /// Iteratively reweighted least squares: the inverse covariance is
    /// divided by `sqrt(|residual| + epsilon)`, with `epsilon` stepping
    /// through `schedule`.
    Robust {
        #[serde(default = "default_schedule")]
        schedule: Vec1<f64>,
    },
}

impl Default for Variant {
    fn default() -> Self {
        Variant::Standard {
            residual: StandardResidual::default(),
        }
    }
}

pub fn default_schedule() -> Vec1<f64> {
    let mut schedule = Vec1::new(DEFAULT_EPSILON_SCHEDULE[0]);
    schedule.extend(DEFAULT_EPSILON_SCHEDULE[1..].iter().copied());
    schedule
}

impl Variant {
    /// The robust variant with the default epsilon schedule.
    pub fn robust() -> Variant {
        Variant::Robust {
            schedule: default_schedule(),
        }
    }

    /// The number of passes a cell makes before it's done; 1 for the
    /// standard variant.
    pub fn schedule_len(&self) -> usize {
        match self {
            Variant::Standard { .. } => 1,
            Variant::Robust { schedule } => schedule.len(),
        }
    }

    /// The epsilon values, empty for the standard variant.
    pub fn schedule(&self) -> &[f64] {
        match self {
            Variant::Standard { .. } => &[],
            Variant::Robust { schedule } => schedule.as_slice(),
        }
    }

    /// Check that a robust schedule is positive and non-increasing.
    ///
    /// # Errors
    ///
    /// Returns [`EstimateError::InvalidSchedule`] if it isn't.
    pub fn validate(&self) -> Result<(), EstimateError> {
        let schedule = self.schedule();
        let positive = schedule.iter().all(|e| e.is_finite() && *e > 0.0);
        let descending = schedule.windows(2).all(|w| w[1] <= w[0]);
        if positive && descending {
            Ok(())
        } else {
            Err(EstimateError::InvalidSchedule(schedule.to_vec()))
        }
    }
}

/// The solver state of one solution cell.
#[derive(Debug, Clone)]
pub struct Cell {
    pub location: Location,

    /// All free coefficients of the cell, grouped by parameter.
    pub coeff: Vec<f64>,

    pub solver: CellSolver,

    /// Where the cell is in the robust epsilon schedule.
    pub epsilon_index: usize,

    /// The overall status. For the robust variant this stays `NotReady` until
    /// the last epsilon is done.
    pub status: SolverStatus,
}

impl Cell {
    pub fn is_done(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Take one solver step for a cell and return its overall status. A cell
/// that is done with the current epsilon moves on to the next one with a
/// fresh solver; only after the last one is the cell done.
pub fn step_cell(
    solver: &mut CellSolver,
    coeff: &mut [f64],
    epsilon_index: &mut usize,
    schedule_len: usize,
) -> SolverStatus {
    let status = solver.iterate(coeff);
    if status.is_terminal() && *epsilon_index + 1 < schedule_len {
        trace!(
            "Moving to epsilon index {} after {status}",
            *epsilon_index + 1
        );
        *epsilon_index += 1;
        solver.reset();
        SolverStatus::NotReady
    } else {
        status
    }
}

/// Turns the condition equations gathered in one pass into new coefficients.
pub trait SolveStep {
    /// Update the coefficients and statuses of `cells` from the equations
    /// held by their solvers. Returns `true` once the chunk is finished.
    fn step(&mut self, cells: &mut [Cell]) -> Result<bool, EstimateError>;

    /// Whether chunks without selected cells must still be stepped through
    /// (with no cells) until they're finished.
    fn steps_empty_chunks(&self) -> bool {
        false
    }
}

/// Solves every cell in this process.
#[derive(Debug, Clone)]
pub struct LocalStep {
    schedule_len: usize,
}

impl LocalStep {
    pub fn new(variant: &Variant) -> LocalStep {
        LocalStep {
            schedule_len: variant.schedule_len(),
        }
    }
}

impl SolveStep for LocalStep {
    fn step(&mut self, cells: &mut [Cell]) -> Result<bool, EstimateError> {
        for cell in cells.iter_mut().filter(|c| !c.is_done()) {
            cell.status = step_cell(
                &mut cell.solver,
                &mut cell.coeff,
                &mut cell.epsilon_index,
                self.schedule_len,
            );
        }
        Ok(cells.iter().all(Cell::is_done))
    }
}

/// Sample counters accumulated over every pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SampleCounters {
    pub total: u64,
    pub flagged: u64,
    pub invalid_value: u64,
    pub invalid_partial: u64,
    /// The number of condition equations generated.
    pub equations: u64,
    /// Baselines the model flagged completely.
    pub skipped_baselines: u64,
}

/// Scratch buffers and counters used while building condition equations.
#[derive(Debug, Default)]
pub struct ProcContext {
    /// Positions in the cell coefficient vector of the solvable partials of
    /// the current element.
    positions: Vec<usize>,
    re: Vec<f64>,
    im: Vec<f64>,

    pub counters: SampleCounters,
    /// Invalid samples per data correlation.
    pub invalid_per_corr: Vec<u64>,
    pub timers: IndexMap<&'static str, Duration>,
}

impl ProcContext {
    pub fn new(num_correlations: usize) -> ProcContext {
        ProcContext {
            invalid_per_corr: vec![0; num_correlations],
            ..Default::default()
        }
    }

    fn add_time(&mut self, phase: &'static str, elapsed: Duration) {
        *self.timers.entry(phase).or_default() += elapsed;
    }
}

/// What happened in one chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkSummary {
    /// The solution-grid time cells of the chunk.
    pub time: Interval<usize>,
    pub cells: usize,
    pub iterations: u32,
    pub statuses: IndexMap<SolverStatus, usize>,
}

/// Statistics of a [`CellEstimator::process`] run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessStats {
    pub chunks: Vec<ChunkSummary>,
    pub chunks_skipped: usize,
    pub iterations: u64,
    pub samples: SampleCounters,
    pub invalid_per_correlation: IndexMap<String, u64>,
    pub timers: IndexMap<String, Duration>,
    pub elapsed: Duration,
}

impl ProcessStats {
    /// The number of cells with each final status, over all chunks.
    pub fn status_counts(&self) -> IndexMap<SolverStatus, usize> {
        let mut counts = IndexMap::new();
        for (status, n) in self.chunks.iter().flat_map(|c| c.statuses.iter()) {
            *counts.entry(*status).or_default() += n;
        }
        counts
    }

    pub fn samples_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.samples.total as f64 / secs
        } else {
            0.0
        }
    }
}

fn make_chunk_progress_bar(num_chunks: usize, message: String) -> ProgressBar {
    ProgressBar::with_draw_target(
        Some(num_chunks as _),
        if PROGRESS_BARS.load() {
            ProgressDrawTarget::stdout()
        } else {
            ProgressDrawTarget::hidden()
        },
    )
    .with_style(
        ProgressStyle::default_bar()
            .template("{msg}: [{wide_bar:.blue}] {pos:3}/{len:3} ({elapsed_precise}<{eta_precise})")
            .expect("the progress bar template is a valid constant")
            .progress_chars("=> "),
    )
    .with_position(0)
    .with_message(message)
}

/// Estimates the coefficients of the solvable parameters in each cell of a
/// solution grid, using the samples of one chunk of observed data.
pub struct CellEstimator<'a> {
    chunk: &'a SampleChunk,
    model: &'a mut dyn Model,
    parms: &'a mut dyn ParameterStore,
    mapper: GridMapper,

    /// Matched `(data, model)` baseline indices.
    baselines: Vec<(usize, usize)>,
    /// Matched `(data, model)` correlation indices.
    correlations: Vec<(usize, usize)>,
    variant: Variant,
    options: SolverOptions,

    solvables: Vec<ParmId>,
    /// Where each solvable parameter's coefficients are in a cell's
    /// coefficient vector.
    parm_slices: Vec<(ParmId, Range<usize>)>,
    coeff_index: IndexMap<CoeffKey, usize>,

    requested: Range2,
    chunk_size: usize,
    propagate: bool,

    cells: Vec<Cell>,
    ctx: ProcContext,
    stats: ProcessStats,
}

impl<'a> CellEstimator<'a> {
    /// Set up an estimator over `sol_grid`. The observed samples in `chunk`
    /// are matched to the model through the `baselines` and `correlations`
    /// correspondence lists. Nothing is solvable until
    /// [`CellEstimator::set_solvables`] is called.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chunk: &'a SampleChunk,
        model: &'a mut dyn Model,
        parms: &'a mut dyn ParameterStore,
        sol_grid: Grid,
        baselines: Vec<(usize, usize)>,
        correlations: Vec<(usize, usize)>,
        variant: Variant,
        options: SolverOptions,
    ) -> CellEstimator<'a> {
        let mapper = GridMapper::new(chunk.grid.clone(), model.domain(), sol_grid);
        let requested = mapper.sol_grid().cells();
        let ctx = ProcContext::new(chunk.num_correlations());
        CellEstimator {
            chunk,
            model,
            parms,
            mapper,
            baselines,
            correlations,
            variant,
            options,
            solvables: vec![],
            parm_slices: vec![],
            coeff_index: IndexMap::new(),
            requested,
            chunk_size: DEFAULT_CELL_CHUNK_SIZE,
            propagate: false,
            cells: vec![],
            ctx,
            stats: ProcessStats::default(),
        }
    }

    /// Make the model parameters matching any of the `include` glob patterns
    /// (and none of `exclude`) solvable. Only parameters known to the
    /// parameter store can be solved for. Returns the number of free
    /// coefficients per cell.
    ///
    /// # Errors
    ///
    /// Fails if a pattern is invalid or the parameter store can't describe a
    /// parameter.
    pub fn set_solvables(
        &mut self,
        include: &[String],
        exclude: &[String],
    ) -> Result<usize, EstimateError> {
        let names = self.model.parameters();
        let selected = select_parameters(&names, include, exclude)?;

        self.solvables.clear();
        self.parm_slices.clear();
        self.coeff_index.clear();
        let mut n = 0;
        for name in &selected {
            let id = match self.parms.get(name) {
                Some(id) => id,
                None => {
                    debug!("'{name}' is not in the parameter store; not solving for it");
                    continue;
                }
            };
            let count = self.parms.coeff_count(id)?;
            for coeff in 0..count {
                self.coeff_index.insert(CoeffKey { parm: id, coeff }, n + coeff);
            }
            self.parm_slices.push((id, n..n + count));
            self.solvables.push(id);
            n += count;
        }

        if n == 0 {
            warn!("The parameter selection {include:?} (excluding {exclude:?}) matches no coefficients");
        } else {
            debug!(
                "{} solvable parameters with {n} coefficients per cell",
                self.solvables.len()
            );
        }
        self.model.set_solvables(&self.solvables);
        self.ctx.positions.reserve(n);
        self.ctx.re.reserve(n);
        self.ctx.im.reserve(n);
        Ok(n)
    }

    /// Restrict estimation to the solution cells `start..=end`.
    pub fn set_cell_selection(&mut self, start: Location, end: Location) {
        self.requested = Range2::new(start, end);
        self.mapper.set_cell_selection(start, end);
    }

    /// The number of time cells solved at once. 0 is treated as 1.
    pub fn set_cell_chunk_size(&mut self, size: usize) {
        self.chunk_size = size.max(1);
    }

    /// Start each chunk from the solutions at the end of the previous one.
    pub fn set_propagate(&mut self, propagate: bool) {
        self.propagate = propagate;
    }

    pub fn is_selection_empty(&self) -> bool {
        self.mapper.is_selection_empty()
    }

    pub fn mapper(&self) -> &GridMapper {
        &self.mapper
    }

    pub fn solvables(&self) -> &[ParmId] {
        &self.solvables
    }

    pub fn num_coeffs(&self) -> usize {
        self.coeff_index.len()
    }

    pub fn coeff_index(&self) -> &IndexMap<CoeffKey, usize> {
        &self.coeff_index
    }

    pub fn variant(&self) -> &Variant {
        &self.variant
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    /// The cells of the chunk being solved.
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    /// Solve every selected cell with the local solver.
    ///
    /// # Errors
    ///
    /// Fails if the model or the parameter store fails. Numerical problems
    /// with samples or cells are counted, not reported as errors.
    pub fn process(&mut self) -> Result<ProcessStats, EstimateError> {
        let mut step = LocalStep::new(&self.variant);
        self.process_with(&mut step)
    }

    /// Solve every selected cell, with `step` producing new coefficients
    /// after each pass.
    ///
    /// # Errors
    ///
    /// Fails if the model, the parameter store or `step` fails.
    pub fn process_with(&mut self, step: &mut dyn SolveStep) -> Result<ProcessStats, EstimateError> {
        let start = Instant::now();
        self.stats = ProcessStats::default();
        self.ctx = ProcContext::new(self.chunk.num_correlations());
        let participate = step.steps_empty_chunks();
        let solving = self.num_coeffs() > 0;

        let requested = self.requested.intersect(&self.mapper.sol_grid().cells());
        self.mapper
            .set_cell_selection(requested.start(), requested.end());
        if !participate {
            if !solving {
                info!("No free coefficients; nothing to solve");
                return Ok(self.stats.clone());
            }
            if self.mapper.is_selection_empty() {
                info!("The cell selection doesn't intersect the data; nothing to solve");
                return Ok(self.stats.clone());
            }
        }

        if solving {
            let sol_grid = self.mapper.sol_grid().clone();
            self.parms.set_grid(&sol_grid, &self.solvables)?;
        }

        let chunk_starts: Vec<usize> = if requested.is_empty() {
            vec![]
        } else {
            requested.time.iter().step_by(self.chunk_size).collect()
        };
        let progress = make_chunk_progress_bar(chunk_starts.len(), "Solving".to_string());
        let mut previous: HashMap<usize, Vec<f64>> = HashMap::new();
        for t0 in chunk_starts {
            let t1 = (t0 + self.chunk_size - 1).min(requested.time.end);
            self.mapper.set_cell_selection(
                Location::new(requested.freq.start, t0),
                Location::new(requested.freq.end, t1),
            );
            debug!(
                "Chunk of time cells {t0}..={t1}: {} cells selected",
                self.mapper.selected_cell_count()
            );

            if !solving || self.mapper.is_selection_empty() {
                if participate {
                    while !step.step(&mut [])? {}
                }
                debug!("Skipping chunk {t0}..={t1}");
                self.stats.chunks_skipped += 1;
                progress.inc(1);
                continue;
            }

            self.start_chunk(&previous)?;
            let mut iterations = 0;
            loop {
                let done = self.iterate(step)?;
                iterations += 1;
                if done {
                    break;
                }
            }

            let mut statuses = IndexMap::new();
            for cell in &self.cells {
                *statuses.entry(cell.status).or_default() += 1;
            }
            info!(
                "Time cells {t0}..={t1}: {} cells after {iterations} iterations ({})",
                self.cells.len(),
                statuses
                    .iter()
                    .map(|(status, n)| format!("{n} {status}"))
                    .join(", ")
            );
            self.stats.chunks.push(ChunkSummary {
                time: Interval::new(t0, t1),
                cells: self.cells.len(),
                iterations,
                statuses,
            });

            if self.propagate {
                let last = self.mapper.selection().solution.time.end;
                for cell in self.cells.iter().filter(|c| c.location.time == last) {
                    previous.insert(cell.location.freq, cell.coeff.clone());
                }
            }
            progress.inc(1);
        }
        progress.abandon_with_message("Finished solving");

        self.cells.clear();
        self.finish_stats(start.elapsed());
        Ok(self.stats.clone())
    }

    /// Make a cell for every selected location, starting from the stored
    /// coefficients (or the previous chunk's, when propagating), and point the
    /// model at the samples of the selection.
    fn start_chunk(&mut self, previous: &HashMap<usize, Vec<f64>>) -> Result<(), EstimateError> {
        let selection = self.mapper.selection().solution;
        let n = self.num_coeffs();
        self.cells.clear();
        for location in selection.iter() {
            let coeff = match previous.get(&location.freq) {
                Some(coeff) if self.propagate => coeff.clone(),
                _ => {
                    let mut coeff = Vec::with_capacity(n);
                    for (id, _) in &self.parm_slices {
                        coeff.extend(self.parms.coeff(*id, location)?);
                    }
                    coeff
                }
            };
            self.cells.push(Cell {
                location,
                coeff,
                solver: CellSolver::new(n, self.options),
                epsilon_index: 0,
                status: SolverStatus::NotReady,
            });
        }
        if let Some(grid) = self.mapper.request_grid() {
            self.model.set_evaluation_grid(grid);
        }
        Ok(())
    }

    /// One pass over the current chunk: build the condition equations of
    /// every matched baseline, let `step` update the cells, then write the
    /// coefficients back and tell the model they changed. Returns `true` once
    /// the chunk is finished.
    ///
    /// # Errors
    ///
    /// Fails if the model, the parameter store or `step` fails.
    pub fn iterate(&mut self, step: &mut dyn SolveStep) -> Result<bool, EstimateError> {
        let now = Instant::now();
        self.build_equations()?;
        self.ctx.add_time("equations", now.elapsed());

        let now = Instant::now();
        let done = step.step(&mut self.cells)?;
        self.ctx.add_time("solve", now.elapsed());

        let now = Instant::now();
        for cell in &self.cells {
            for (id, range) in &self.parm_slices {
                self.parms
                    .set_coeff(*id, cell.location, &cell.coeff[range.clone()])?;
            }
        }
        self.model.solvables_changed();
        self.ctx.add_time("write", now.elapsed());

        self.stats.iterations += 1;
        Ok(done)
    }

    fn build_equations(&mut self) -> Result<(), EstimateError> {
        let selection = *self.mapper.selection();
        if selection.is_empty() || self.cells.is_empty() {
            return Ok(());
        }
        let setup = PassSetup {
            chunk: self.chunk,
            selection: &selection,
            freq_map: self.mapper.freq_map(),
            time_map: self.mapper.time_map(),
            variant: &self.variant,
            coeff_index: &self.coeff_index,
            correlations: &self.correlations,
        };
        for &(data_bl, model_bl) in &self.baselines {
            let now = Instant::now();
            let result = self.model.evaluate(model_bl, &*self.parms)?;
            self.ctx.add_time("model", now.elapsed());
            if result.flagged {
                trace!("Baseline {data_bl} is flagged by the model; skipping");
                self.ctx.counters.skipped_baselines += 1;
                continue;
            }
            proc_expr(&mut self.ctx, &setup, &mut self.cells, data_bl, result);
        }
        Ok(())
    }

    fn finish_stats(&mut self, elapsed: Duration) {
        self.stats.samples = self.ctx.counters.clone();
        let model_corrs = self.model.correlations();
        self.stats.invalid_per_correlation = self
            .correlations
            .iter()
            .map(|&(data, model)| {
                let name = model_corrs
                    .get(model)
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| data.to_string());
                (name, self.ctx.invalid_per_corr[data])
            })
            .collect();
        self.stats.timers = self
            .ctx
            .timers
            .iter()
            .map(|(phase, t)| (phase.to_string(), *t))
            .collect();
        self.stats.elapsed = elapsed;
    }

    /// Log the statistics of the last [`CellEstimator::process`] run and
    /// return them.
    pub fn dump_stats(&self) -> ProcessStats {
        let stats = &self.stats;
        info!(
            "Solved {} chunks ({} skipped) in {} iterations",
            stats.chunks.len(),
            stats.chunks_skipped,
            stats.iterations
        );
        info!(
            "Samples: {} total, {} flagged, {} with invalid values, {} with invalid partials",
            stats.samples.total,
            stats.samples.flagged,
            stats.samples.invalid_value,
            stats.samples.invalid_partial
        );
        info!(
            "{} condition equations; {} baselines flagged by the model",
            stats.samples.equations, stats.samples.skipped_baselines
        );
        for (corr, n) in stats.invalid_per_correlation.iter().filter(|(_, n)| **n > 0) {
            info!("  {corr}: {n} invalid samples");
        }
        info!(
            "Throughput: {:.0} samples/s over {:.3} s",
            stats.samples_per_second(),
            stats.elapsed.as_secs_f64()
        );
        for (phase, t) in &stats.timers {
            info!("  {phase:>9}: {:.3} s", t.as_secs_f64());
        }
        for (status, n) in stats.status_counts() {
            info!("  {status}: {n} cells");
        }
        stats.clone()
    }
}

/// Everything [`proc_expr`] needs that stays fixed during a pass.
struct PassSetup<'p> {
    chunk: &'p SampleChunk,
    selection: &'p CellSelection,
    freq_map: &'p AxisMap,
    time_map: &'p AxisMap,
    variant: &'p Variant,
    coeff_index: &'p IndexMap<CoeffKey, usize>,
    correlations: &'p [(usize, usize)],
}

/// Turn the samples of one baseline into condition equations for the cells
/// that own them.
fn proc_expr(
    ctx: &mut ProcContext,
    setup: &PassSetup,
    cells: &mut [Cell],
    data_bl: usize,
    result: &ModelResult,
) {
    let sel = setup.selection;
    let (ntime, nfreq) = (sel.obs.time.len(), sel.obs.freq.len());

    for &(data_corr, model_corr) in setup.correlations {
        let element = &result.elements[model_corr];
        ctx.positions.clear();
        let mut partials: Vec<&Array2<c64>> = vec![];
        for (key, partial) in &element.partials {
            if let Some(&pos) = setup.coeff_index.get(key) {
                ctx.positions.push(pos);
                partials.push(partial);
            }
        }
        let n = partials.len();
        ctx.re.resize(n, 0.0);
        ctx.im.resize(n, 0.0);

        for t in 0..ntime {
            let cell_time = setup.time_map.target_of(sel.eval.time.start + t);
            for f in 0..nfreq {
                ctx.counters.total += 1;
                let idx = [
                    data_bl,
                    sel.obs.time.start + t,
                    sel.obs.freq.start + f,
                    data_corr,
                ];
                let model_flagged = element.flags.as_ref().map_or(false, |fl| fl[(t, f)]);
                if setup.chunk.flags[idx] || model_flagged {
                    ctx.counters.flagged += 1;
                    continue;
                }

                let location = match (setup.freq_map.target_of(sel.eval.freq.start + f), cell_time)
                {
                    (Some(freq), Some(time)) => Location::new(freq, time),
                    _ => continue,
                };
                if !sel.solution.contains(location) {
                    continue;
                }
                let cell = &mut cells[sel.solution.linear_index(location)];
                if cell.is_done() {
                    continue;
                }

                let observed = setup.chunk.samples[idx];
                let predicted = element.value[(t, f)];
                let covariance = setup.chunk.covariance[idx];
                let residual = observed - predicted;
                if !residual.re.is_finite()
                    || !residual.im.is_finite()
                    || !covariance.is_finite()
                    || covariance <= 0.0
                {
                    ctx.counters.invalid_value += 1;
                    ctx.invalid_per_corr[data_corr] += 1;
                    continue;
                }

                let mut valid = true;
                for (k, partial) in partials.iter().enumerate() {
                    let d = partial[(t, f)];
                    if !d.re.is_finite() || !d.im.is_finite() {
                        valid = false;
                        break;
                    }
                    ctx.re[k] = d.re;
                    ctx.im[k] = d.im;
                }
                if !valid {
                    ctx.counters.invalid_partial += 1;
                    ctx.invalid_per_corr[data_corr] += 1;
                    continue;
                }

                let weight = 1.0 / covariance;
                match setup.variant {
                    Variant::Standard {
                        residual: StandardResidual::AmplitudeMinusReal,
                    } => {
                        cell.solver.equations_mut().add(
                            &ctx.positions,
                            &ctx.re,
                            weight,
                            observed.norm() - predicted.re,
                        );
                        ctx.counters.equations += 1;
                    }
                    Variant::Standard {
                        residual: StandardResidual::Complex,
                    } => {
                        let equations = cell.solver.equations_mut();
                        equations.add(&ctx.positions, &ctx.re, weight, residual.re);
                        equations.add(&ctx.positions, &ctx.im, weight, residual.im);
                        ctx.counters.equations += 2;
                    }
                    Variant::Robust { schedule } => {
                        let epsilon = schedule
                            .get(cell.epsilon_index)
                            .copied()
                            .unwrap_or(*schedule.last());
                        let weight = weight / (residual.norm() + epsilon).sqrt();
                        let equations = cell.solver.equations_mut();
                        equations.add(&ctx.positions, &ctx.re, weight, residual.re);
                        equations.add(&ctx.positions, &ctx.im, weight, residual.im);
                        ctx.counters.equations += 2;
                    }
                }
            }
        }
    }
}
