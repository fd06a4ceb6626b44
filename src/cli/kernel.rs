// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Run a simulated kernel from a run file.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::PathBuf,
};

use clap::Parser;
use log::{debug, info, warn};
use serde::Serialize;

use super::{
    run_file::{read_run_file, RunFile},
    SelfcalError,
};
use crate::{
    control::{CommandId, CommandResult, KernelControl, ProcessControl},
    estimate::ProcessStats,
    model::GainModelFactory,
    store::ParmValues,
};

#[derive(Parser, Debug)]
pub(super) struct KernelArgs {
    /// The run file describing the kernel and its commands. Supported
    /// formats: toml, json
    #[clap(name = "RUN_FILE", parse(from_os_str))]
    run_file: PathBuf,

    /// Write the final parameter values, command results and solve
    /// statistics to this JSON file.
    #[clap(short, long, parse(from_os_str))]
    output: Option<PathBuf>,

    /// Read samples from this column instead of "DATA".
    #[clap(long)]
    column: Option<String>,
}

/// What a kernel run leaves behind.
#[derive(Debug, Serialize)]
struct KernelReport {
    process_id: u32,
    commands: usize,
    results: Vec<(CommandId, CommandResult)>,
    solves: Vec<ProcessStats>,
    parms: Vec<ParmValues>,
}

impl KernelArgs {
    pub(super) fn run(self, dry_run: bool) -> Result<(), SelfcalError> {
        let run = read_run_file(&self.run_file)?;
        run.describe(&self.run_file);
        if dry_run {
            // Make sure everything can be built from the run file.
            run.make_samples()?;
            run.initial_parms()?;
            info!("Dry run; not running any commands");
            return Ok(());
        }

        let report = run_kernel(&run, self.column)?;
        for parm in &report.parms {
            for cell in &parm.cells {
                debug!("{} {}: {:?}", parm.name, cell.cell, cell.values);
            }
        }
        if let Some(output) = self.output {
            let mut f = BufWriter::new(File::create(&output)?);
            serde_json::to_writer_pretty(&mut f, &report)?;
            f.flush()?;
            info!("Wrote {}", output.display());
        }
        Ok(())
    }
}

fn run_kernel(run: &RunFile, column: Option<String>) -> Result<KernelReport, SelfcalError> {
    let mut samples = run.make_samples()?;
    let mut parms = run.initial_parms()?;
    let factory = GainModelFactory::new(run.stations.clone());
    let (session, worker) = run.make_session();
    let process_id = run.process_id();

    let (result, solves) = {
        let mut kernel = KernelControl::new(&mut samples, &mut parms, &factory);
        if let Some(column) = column {
            kernel = kernel.with_column(column);
        }
        let mut control = ProcessControl::new(worker, run.control);
        let result = control.run(&mut kernel);
        (result, kernel.solve_stats().to_vec())
    };

    let results = session.results(process_id);
    for (id, r) in &results {
        if !r.is_ok() {
            warn!("Command {id} failed: {}", r.message);
        }
    }
    let commands = result?;
    for (i, stats) in solves.iter().enumerate() {
        info!(
            "Solve {}: {} chunks, {} iterations, {:.0} samples/s",
            i + 1,
            stats.chunks.len(),
            stats.iterations,
            stats.samples_per_second()
        );
    }

    Ok(KernelReport {
        process_id,
        commands,
        results,
        solves,
        parms: parms.values(),
    })
}
