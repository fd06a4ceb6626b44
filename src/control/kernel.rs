// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The command handler of a kernel: holds a slice of the samples and
//! predicts, corrects and solves with it.

use log::{debug, info};

use super::{
    ApplyCommand, ApplyOp, CommandHandler, ControlError, ControlSession, InitializeCommand,
    NextChunkCommand, SolveCommand,
};
use crate::{
    coordinator::{
        AggregatorLink, GlobalCoordinator, GroupRoster, LocalCoordinator, SolveCoordinator,
        SolveSetup, TcpAggregatorLink,
    },
    estimate::ProcessStats,
    grid::{near, Interval, Range2},
    mapper::{find_contained_cell_range, GridMapper},
    model::{ModelConfig, ModelFactory},
    selection::{
        make_baseline_mask, make_correlation_mask, make_correspondence, BaselineMask,
        BaselineSelection, CorrelationMask, SelectionError,
    },
    store::{Baseline, Correlation, ParameterStore, SampleChunk, SampleStore, DEFAULT_COLUMN},
};

/// What `Initialize` established.
#[derive(Debug)]
struct KernelSetup {
    model: ModelConfig,
    baselines: BaselineMask,
    correlations: CorrelationMask,
    calibration_groups: Vec<usize>,
}

/// Runs commands against a sample store and a parameter store.
pub struct KernelControl<'a> {
    samples: &'a mut dyn SampleStore,
    parms: &'a mut dyn ParameterStore,
    factory: &'a dyn ModelFactory,
    link: Option<Box<dyn AggregatorLink>>,
    column: String,

    setup: Option<KernelSetup>,
    chunk: Option<SampleChunk>,
    solves: Vec<ProcessStats>,
}

impl<'a> KernelControl<'a> {
    pub fn new(
        samples: &'a mut dyn SampleStore,
        parms: &'a mut dyn ParameterStore,
        factory: &'a dyn ModelFactory,
    ) -> KernelControl<'a> {
        KernelControl {
            samples,
            parms,
            factory,
            link: None,
            column: DEFAULT_COLUMN.to_string(),
            setup: None,
            chunk: None,
            solves: vec![],
        }
    }

    /// Use this link to the aggregator instead of connecting to the address
    /// given to `Initialize`.
    pub fn with_link(mut self, link: Box<dyn AggregatorLink>) -> KernelControl<'a> {
        self.link = Some(link);
        self
    }

    /// Read samples from this column.
    pub fn with_column(mut self, column: String) -> KernelControl<'a> {
        self.column = column;
        self
    }

    /// The samples loaded by the last `NextChunk`.
    pub fn chunk(&self) -> Option<&SampleChunk> {
        self.chunk.as_ref()
    }

    /// The statistics of every solve so far.
    pub fn solve_stats(&self) -> &[ProcessStats] {
        &self.solves
    }

    fn setup(&self) -> Result<&KernelSetup, ControlError> {
        self.setup.as_ref().ok_or(ControlError::NotInitialised)
    }

    /// The baselines and correlations of the data picked by a command,
    /// within those picked by `Initialize`.
    fn select(
        &self,
        baselines: &BaselineSelection,
        correlations: &[String],
    ) -> Result<(Vec<Baseline>, Vec<Correlation>), ControlError> {
        let setup = self.setup()?;
        let info = self.samples.info();

        let mask = make_baseline_mask(baselines, &info.stations)?;
        let baselines: Vec<Baseline> = info
            .baselines
            .iter()
            .copied()
            .filter(|&b| setup.baselines.contains(b) && mask.contains(b))
            .collect();
        if baselines.is_empty() {
            return Err(ControlError::NoBaselines);
        }

        let mask = make_correlation_mask(correlations, &info.correlations)?;
        let selected: Vec<Correlation> = info
            .correlations
            .iter()
            .copied()
            .filter(|&c| setup.correlations.contains(c) && mask.contains(c))
            .collect();
        if selected.is_empty() {
            return Err(SelectionError::EmptyCorrelationSelection {
                requested: correlations.to_vec(),
            }
            .into());
        }
        Ok((baselines, selected))
    }

    /// `(data, model)` index pairs of the selected baselines and
    /// correlations.
    fn correspondence(
        &self,
        baselines: &[Baseline],
        correlations: &[Correlation],
    ) -> (Vec<(usize, usize)>, Vec<(usize, usize)>) {
        let info = self.samples.info();
        (
            make_correspondence(&info.baselines, baselines),
            make_correspondence(&info.correlations, correlations),
        )
    }
}

impl CommandHandler for KernelControl<'_> {
    fn initialize(
        &mut self,
        cmd: &InitializeCommand,
        session: &dyn ControlSession,
    ) -> Result<(), ControlError> {
        let info = self.samples.info();
        let baselines = make_baseline_mask(&cmd.baselines, &info.stations)?;
        let correlations = make_correlation_mask(&cmd.correlations, &info.correlations)?;
        // Make sure the model can be built before anything is run with it.
        self.factory.make_forward(
            &cmd.model,
            &baselines.apply(&info.baselines),
            &correlations.apply(&info.correlations),
        )?;
        info!(
            "Initialised with {} baselines and {} correlations",
            baselines.len(),
            correlations.len()
        );

        if !cmd.calibration_groups.is_empty() {
            let roster = GroupRoster::new(&cmd.calibration_groups)?;
            let (group, member) = roster.member_of(session.index(), &cmd.calibration_groups)?;
            if self.link.is_none() {
                let addr = cmd.aggregator.as_ref().ok_or(ControlError::NoAggregator)?;
                self.link = Some(Box::new(TcpAggregatorLink::new(addr.clone())));
            }
            if let Some(link) = self.link.as_mut() {
                link.connect()?;
                link.identify(session.process_id(), member)?;
            }
            info!(
                "Kernel {} is member {member} of calibration group {group}",
                session.index()
            );
        }

        self.setup = Some(KernelSetup {
            model: cmd.model.clone(),
            baselines,
            correlations,
            calibration_groups: cmd.calibration_groups.clone(),
        });
        Ok(())
    }

    fn finalize(&mut self, _session: &dyn ControlSession) -> Result<(), ControlError> {
        if let Some(link) = self.link.as_mut() {
            if link.is_connected() {
                link.close()?;
            }
        }
        debug!("Finalised after {} solves", self.solves.len());
        Ok(())
    }

    fn next_chunk(
        &mut self,
        cmd: &NextChunkCommand,
        _session: &dyn ControlSession,
    ) -> Result<(), ControlError> {
        self.setup()?;
        let grid = &self.samples.info().grid;

        let freq = match cmd.freq {
            Some(requested) => {
                let available = grid.freq().range();
                let starts_inside =
                    requested.start >= available.start || near(requested.start, available.start);
                let ends_inside =
                    requested.end <= available.end || near(requested.end, available.end);
                if !(starts_inside && ends_inside) {
                    return Err(ControlError::FreqRange {
                        requested,
                        available,
                    });
                }
                let cells = find_contained_cell_range(grid.freq(), requested);
                if cells.is_empty() {
                    return Err(ControlError::EmptyRange {
                        what: "frequency",
                        range: requested,
                    });
                }
                cells
            }
            None => Interval::new(0, grid.freq().size() - 1),
        };
        let time = find_contained_cell_range(grid.time(), cmd.time);
        if time.is_empty() {
            return Err(ControlError::EmptyRange {
                what: "time",
                range: cmd.time,
            });
        }

        let chunk = self.samples.read(&Range2 { freq, time }, &self.column)?;
        debug!(
            "Loaded time cells {}..={} and frequency cells {}..={} from column {}",
            time.start, time.end, freq.start, freq.end, self.column
        );
        self.chunk = Some(chunk);
        Ok(())
    }

    fn apply(
        &mut self,
        op: ApplyOp,
        cmd: &ApplyCommand,
        _session: &dyn ControlSession,
    ) -> Result<(), ControlError> {
        let (baselines, correlations) = self.select(&cmd.baselines, &cmd.correlations)?;
        let config = match &cmd.model {
            Some(config) => config.clone(),
            None => self.setup()?.model.clone(),
        };
        let mut model = match op {
            ApplyOp::Correct => self
                .factory
                .make_inverse(&config, &baselines, &correlations)?,
            _ => self
                .factory
                .make_forward(&config, &baselines, &correlations)?,
        };
        let (baseline_pairs, corr_pairs) = self.correspondence(&baselines, &correlations);

        let chunk = self.chunk.as_mut().ok_or(ControlError::NoChunk)?;
        let mapper = GridMapper::new(chunk.grid.clone(), model.domain(), chunk.grid.clone());
        let grid = match mapper.request_grid() {
            Some(grid) => grid,
            None => {
                info!("The model isn't valid anywhere in the loaded samples; nothing to do for {op:?}");
                return Ok(());
            }
        };
        let obs = mapper.selection().obs;
        model.set_evaluation_grid(grid);

        for &(data_bl, model_bl) in &baseline_pairs {
            let result = model.evaluate(model_bl, &*self.parms)?;
            for &(data_corr, model_corr) in &corr_pairs {
                let element = if result.flagged {
                    None
                } else {
                    result.elements.get(model_corr)
                };
                for t in obs.time.iter() {
                    for f in obs.freq.iter() {
                        let index = [data_bl, t, f, data_corr];
                        let at = [t - obs.time.start, f - obs.freq.start];
                        let element = match element {
                            Some(e) if !e.flags.as_ref().map(|flags| flags[at]).unwrap_or(false) => e,
                            _ => {
                                chunk.flags[index] = true;
                                continue;
                            }
                        };
                        let value = element.value[at];
                        let sample = &mut chunk.samples[index];
                        match op {
                            ApplyOp::Predict => *sample = value,
                            ApplyOp::Subtract => *sample -= value,
                            ApplyOp::Add => *sample += value,
                            ApplyOp::Correct => *sample *= value,
                        }
                    }
                }
            }
        }
        debug!(
            "{op:?}: {} baselines, {} correlations",
            baseline_pairs.len(),
            corr_pairs.len()
        );

        if let Some(column) = &cmd.output_column {
            self.samples.write(chunk, column, cmd.write_flags)?;
            debug!("Wrote the result to column {column}");
        }
        Ok(())
    }

    fn solve(
        &mut self,
        cmd: &SolveCommand,
        session: &dyn ControlSession,
    ) -> Result<(), ControlError> {
        cmd.variant.validate()?;
        let (baselines, correlations) = self.select(&cmd.baselines, &cmd.correlations)?;
        let setup = self.setup()?;
        let groups = setup.calibration_groups.clone();
        let mut model = self
            .factory
            .make_forward(&setup.model, &baselines, &correlations)?;
        let (baseline_pairs, corr_pairs) = self.correspondence(&baselines, &correlations);
        let solve = SolveSetup {
            include: cmd.parms.clone(),
            exclude: cmd.excluded.clone(),
            cell_size: cmd.cell_size,
            baselines: baseline_pairs,
            correlations: corr_pairs,
            chunk_size: cmd.chunk_size,
            propagate: cmd.propagate,
            variant: cmd.variant.clone(),
            options: cmd.options,
        };

        // The solution grid covers all of this kernel's samples; the chunk
        // only picks which of its cells get solved.
        let data_grid = self.samples.info().grid.clone();
        let chunk = self.chunk.as_ref().ok_or(ControlError::NoChunk)?;
        let stats = if groups.is_empty() {
            let mut coordinator = LocalCoordinator::new();
            coordinator.init(solve, &data_grid, session)?;
            coordinator.run(chunk, model.as_mut(), &mut *self.parms)?
        } else {
            let link = self.link.as_mut().ok_or(ControlError::NoAggregator)?;
            let mut coordinator = GlobalCoordinator::new(groups, link.as_mut());
            coordinator.init(solve, &data_grid, session)?;
            coordinator.run(chunk, model.as_mut(), &mut *self.parms)?
        };
        self.parms.flush()?;
        self.solves.push(stats);
        Ok(())
    }
}
