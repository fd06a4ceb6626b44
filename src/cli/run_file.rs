// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Run files. A run file describes a simulated kernel: the observation grid
//! and stations, the sky and gains the samples are made from, the initial
//! parameter values and the commands to run. They can be TOML or JSON; the
//! file extension says which.

use std::{
    collections::HashSet,
    fs::File,
    io::Read,
    path::Path,
    str::FromStr,
};

use itertools::Itertools;
use log::{debug, info};
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};

use super::SelfcalError;
use crate::{
    c64,
    control::{Command, ControlConfig, MemorySession, WorkerRole, WorkerSession},
    grid::{Axis, Grid},
    model::{GainModelFactory, ModelConfig, ModelFactory},
    store::{
        Baseline, Correlation, MemoryParmStore, MemorySampleStore, ParmDefinition, SampleInfo,
    },
};

#[derive(Debug, Display, EnumIter, EnumString)]
pub(super) enum RunFileType {
    #[strum(serialize = "toml")]
    Toml,
    #[strum(serialize = "json")]
    Json,
}

/// Another kernel of the same calibration group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(super) struct PeerKernel {
    pub(super) process_id: u32,
    pub(super) grid: Grid,
}

/// Where this kernel sits among the kernels of a control session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(super) struct GroupFile {
    /// The index of this kernel; it is inserted among `peers` here.
    pub(super) index: usize,

    #[serde(default)]
    pub(super) peers: Vec<PeerKernel>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(super) struct RunFile {
    pub(super) grid: Grid,

    pub(super) stations: Vec<String>,

    /// Every pair of stations, autos included, if not given.
    #[serde(default)]
    pub(super) baselines: Option<Vec<Baseline>>,

    pub(super) correlations: Vec<Correlation>,

    /// The sky the samples are made from.
    #[serde(default)]
    pub(super) sky: ModelConfig,

    /// The values the samples are made with. Parameters not listed here take
    /// their initial values.
    #[serde(default)]
    pub(super) true_parms: Vec<ParmDefinition>,

    /// The initial parameter values.
    #[serde(default)]
    pub(super) parms: Vec<ParmDefinition>,

    #[serde(default)]
    pub(super) control: ControlConfig,

    /// Defaults to the ID of this process.
    #[serde(default)]
    pub(super) process_id: Option<u32>,

    #[serde(default)]
    pub(super) group: Option<GroupFile>,

    /// The time axis shared by the calibration groups.
    #[serde(default)]
    pub(super) global_time: Option<Axis>,

    pub(super) commands: Vec<Command>,
}

/// Read a run file, deciding on the format from the file extension.
pub(super) fn read_run_file(path: &Path) -> Result<RunFile, SelfcalError> {
    debug!("Attempting to parse run file {}", path.display());

    let run_file_type = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .and_then(|e| RunFileType::from_str(&e).ok());

    let mut contents = String::new();
    let run: RunFile = match run_file_type {
        Some(RunFileType::Toml) => {
            debug!("Parsing toml file...");
            let mut fh = File::open(path)?;
            fh.read_to_string(&mut contents)?;
            toml::from_str(&contents).map_err(|err| {
                SelfcalError::RunFile(format!(
                    "Couldn't decode toml structure from {}:\n{err}",
                    path.display()
                ))
            })?
        }
        Some(RunFileType::Json) => {
            debug!("Parsing json file...");
            let mut fh = File::open(path)?;
            fh.read_to_string(&mut contents)?;
            serde_json::from_str(&contents).map_err(|err| {
                SelfcalError::RunFile(format!(
                    "Couldn't decode json structure from {}:\n{err}",
                    path.display()
                ))
            })?
        }
        None => {
            return Err(SelfcalError::RunFile(format!(
                "Run file '{}' doesn't have a recognised file extension! Valid extensions are: {}",
                path.display(),
                RunFileType::iter().join(", ")
            )))
        }
    };
    run.validate()?;
    Ok(run)
}

impl RunFile {
    fn validate(&self) -> Result<(), SelfcalError> {
        if self.stations.is_empty() {
            return Err(SelfcalError::RunFile("No stations were given".to_string()));
        }
        if self.correlations.is_empty() {
            return Err(SelfcalError::RunFile(
                "No correlations were given".to_string(),
            ));
        }
        if self.commands.is_empty() {
            return Err(SelfcalError::RunFile("No commands were given".to_string()));
        }
        if let Some(baselines) = &self.baselines {
            if baselines.is_empty() {
                return Err(SelfcalError::RunFile("No baselines were given".to_string()));
            }
            if let Some(b) = baselines
                .iter()
                .find(|b| b.0 >= self.stations.len() || b.1 >= self.stations.len())
            {
                return Err(SelfcalError::RunFile(format!(
                    "Baseline ({}, {}) refers to a station that doesn't exist; there are {} stations",
                    b.0,
                    b.1,
                    self.stations.len()
                )));
            }
        }
        if let Some(group) = &self.group {
            if group.index > group.peers.len() {
                return Err(SelfcalError::RunFile(format!(
                    "Kernel index {} is out of range; there are {} peers",
                    group.index,
                    group.peers.len()
                )));
            }
            let mut seen = HashSet::new();
            seen.insert(self.process_id());
            for peer in &group.peers {
                if !seen.insert(peer.process_id) {
                    return Err(SelfcalError::RunFile(format!(
                        "Process ID {} is used by more than one kernel",
                        peer.process_id
                    )));
                }
            }
        }
        Ok(())
    }

    pub(super) fn process_id(&self) -> u32 {
        self.process_id.unwrap_or_else(std::process::id)
    }

    pub(super) fn sample_info(&self) -> SampleInfo {
        let baselines = match &self.baselines {
            Some(baselines) => baselines.clone(),
            None => (0..self.stations.len())
                .tuple_combinations()
                .map(|(p, q)| Baseline(p, q))
                .chain((0..self.stations.len()).map(|p| Baseline(p, p)))
                .sorted()
                .collect(),
        };
        SampleInfo {
            grid: self.grid.clone(),
            stations: self.stations.clone(),
            baselines,
            correlations: self.correlations.clone(),
        }
    }

    pub(super) fn initial_parms(&self) -> Result<MemoryParmStore, SelfcalError> {
        Ok(MemoryParmStore::from_definitions(&self.parms)?)
    }

    /// The initial parameters, with the true values where they are given.
    fn true_parms(&self) -> Result<MemoryParmStore, SelfcalError> {
        let mut defs: Vec<ParmDefinition> = self
            .parms
            .iter()
            .map(|p| {
                self.true_parms
                    .iter()
                    .find(|t| t.name == p.name)
                    .unwrap_or(p)
                    .clone()
            })
            .collect();
        defs.extend(
            self.true_parms
                .iter()
                .filter(|t| !self.parms.iter().any(|p| p.name == t.name))
                .cloned(),
        );
        Ok(MemoryParmStore::from_definitions(&defs)?)
    }

    /// Predict the samples of every baseline from the sky and the true
    /// parameter values. Samples the model can't predict are flagged.
    pub(super) fn make_samples(&self) -> Result<MemorySampleStore, SelfcalError> {
        let info = self.sample_info();
        let truth = self.true_parms()?;
        let factory = GainModelFactory::new(self.stations.clone());
        let mut model = factory.make_forward(&self.sky, &info.baselines, &info.correlations)?;
        model.set_evaluation_grid(info.grid.clone());

        let dims = info.dims();
        let mut samples = Array4::from_elem(dims, c64::new(0.0, 0.0));
        let mut flags = Array4::from_elem(dims, false);
        for b in 0..info.baselines.len() {
            let result = model.evaluate(b, &truth)?;
            if result.flagged {
                flags.slice_mut(s![b, .., .., ..]).fill(true);
                continue;
            }
            for (c, element) in result.elements.iter().enumerate() {
                samples.slice_mut(s![b, .., .., c]).assign(&element.value);
                if let Some(f) = &element.flags {
                    flags.slice_mut(s![b, .., .., c]).assign(f);
                }
            }
        }
        let num_flagged = flags.iter().filter(|f| **f).count();
        debug!(
            "Made {} samples ({num_flagged} flagged) from {} true parameters",
            samples.len(),
            self.true_parms.len()
        );

        Ok(MemorySampleStore::new(info, samples)?.with_flags(flags)?)
    }

    /// Set up a control session holding every kernel and queue the commands.
    /// Returns the session and this kernel's handle on it.
    pub(super) fn make_session(&self) -> (MemorySession, WorkerSession) {
        let session = MemorySession::new();
        let process_id = self.process_id();
        let worker = match &self.group {
            None => session.add_worker(WorkerRole::Kernel, process_id, Some(self.grid.clone())),
            Some(group) => {
                let (before, after) = group.peers.split_at(group.index);
                for peer in before {
                    session.add_worker(WorkerRole::Kernel, peer.process_id, Some(peer.grid.clone()));
                }
                let worker =
                    session.add_worker(WorkerRole::Kernel, process_id, Some(self.grid.clone()));
                for peer in after {
                    session.add_worker(WorkerRole::Kernel, peer.process_id, Some(peer.grid.clone()));
                }
                worker
            }
        };
        if let Some(axis) = &self.global_time {
            session.set_global_time_axis(axis.clone());
        }
        for command in &self.commands {
            session.post_command(command.clone());
        }
        (session, worker)
    }

    /// Print high-level information on what the run file describes.
    pub(super) fn describe(&self, path: &Path) {
        let info = self.sample_info();
        let (num_freqs, num_times) = self.grid.shape();
        let freqs = self.grid.freq().range();
        let times = self.grid.time().range();
        info!("Run file: {}", path.display());
        info!(
            "Grid: {num_freqs} channels ({:.3}-{:.3} MHz), {num_times} timesteps ({}-{} s)",
            freqs.start / 1e6,
            freqs.end / 1e6,
            times.start,
            times.end
        );
        info!(
            "{} stations, {} baselines, correlations {}",
            info.stations.len(),
            info.baselines.len(),
            info.correlations.iter().join(", ")
        );
        info!(
            "{} parameters ({} with true values)",
            self.parms.len(),
            self.true_parms.len()
        );
        if let Some(group) = &self.group {
            info!(
                "Kernel {} of a session with {} kernels",
                group.index,
                group.peers.len() + 1
            );
        }
        info!(
            "Commands: {}",
            self.commands.iter().map(|c| c.name()).join(", ")
        );
    }
}
