// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use approx::assert_abs_diff_eq;
use ndarray::prelude::*;

use super::*;
use crate::{
    c64,
    coordinator::CellSize,
    estimate::{StandardResidual, Variant},
    grid::{Axis, Grid, Interval, Location},
    model::GainModelFactory,
    selection::BaselineSelection,
    store::{
        Baseline, Correlation, MemoryParmStore, MemorySampleStore, ParameterStore, SampleInfo,
    },
};

const GAIN_A: c64 = c64::new(1.2, 0.3);

fn stations() -> Vec<String> {
    vec!["A".to_string(), "B".to_string()]
}

/// 4 channels of 1 MHz and 4 timesteps of 10 s, both autos and the cross
/// baseline, XX and YY.
fn info() -> SampleInfo {
    SampleInfo {
        grid: Grid::new(
            Axis::regular(100e6, 1e6, 4).unwrap(),
            Axis::regular(0.0, 10.0, 4).unwrap(),
        ),
        stations: stations(),
        baselines: vec![Baseline(0, 0), Baseline(0, 1), Baseline(1, 1)],
        correlations: vec![Correlation::XX, Correlation::YY],
    }
}

/// A 1 Jy source seen with an X gain of `GAIN_A` on A; every other gain is 1.
fn samples() -> MemorySampleStore {
    let info = info();
    let mut data = Array4::from_elem(info.dims(), c64::new(1.0, 0.0));
    data.slice_mut(s![0, .., .., 0])
        .fill(c64::new(GAIN_A.norm_sqr(), 0.0));
    data.slice_mut(s![1, .., .., 0]).fill(GAIN_A);
    MemorySampleStore::new(info, data).unwrap()
}

fn parms(gain_a: c64) -> MemoryParmStore {
    let mut store = MemoryParmStore::new();
    for (name, value) in [
        ("Gain:X:Real:A", gain_a.re),
        ("Gain:X:Imag:A", gain_a.im),
        ("Gain:X:Real:B", 1.0),
        ("Gain:X:Imag:B", 0.0),
    ] {
        store.add(name, vec![value]).unwrap();
    }
    store
}

fn fast_polling() -> ControlConfig {
    ControlConfig {
        poll_interval_ms: 1,
        max_poll_interval_ms: 2,
        max_polls: Some(5),
    }
}

fn next_chunk() -> Command {
    Command::NextChunk(NextChunkCommand {
        time: Interval::new(0.0, 40.0),
        freq: None,
    })
}

fn solve_a() -> Command {
    Command::Solve(SolveCommand {
        parms: vec!["Gain:X:*:A".to_string()],
        cell_size: CellSize { freq: 0, time: 1 },
        correlations: vec!["XX".to_string()],
        chunk_size: 2,
        variant: Variant::Standard {
            residual: StandardResidual::Complex,
        },
        ..Default::default()
    })
}

/// Queue `commands` for a single kernel and run it.
fn run_kernel(
    commands: Vec<Command>,
    samples: &mut MemorySampleStore,
    parms: &mut MemoryParmStore,
) -> (Result<usize, ControlError>, MemorySession, Vec<ControlState>) {
    let session = MemorySession::new();
    let worker = session.add_worker(WorkerRole::Kernel, 100, Some(info().grid));
    for command in commands {
        session.post_command(command);
    }
    let factory = GainModelFactory::new(stations());
    let mut kernel = KernelControl::new(samples, parms, &factory);
    let mut control = ProcessControl::new(worker, fast_polling());
    let result = control.run(&mut kernel);
    (result, session, control.history().to_vec())
}

#[test]
fn test_finalize_while_waiting() {
    let mut samples = samples();
    let mut parms = parms(c64::new(1.0, 0.0));
    let (result, session, history) = run_kernel(vec![Command::Finalize], &mut samples, &mut parms);

    assert_eq!(result.unwrap(), 1);
    assert_eq!(
        history,
        vec![
            ControlState::Undefined,
            ControlState::Wait,
            ControlState::Run,
            ControlState::Finished
        ]
    );
    let results = session.results(100);
    assert_eq!(results.len(), 1);
    assert!(results[0].1.is_ok());
}

#[test]
fn test_commands_after_finalize_are_not_run() {
    let mut samples = samples();
    let mut parms = parms(c64::new(1.0, 0.0));
    let (result, session, history) = run_kernel(
        vec![Command::Finalize, next_chunk()],
        &mut samples,
        &mut parms,
    );

    assert_eq!(result.unwrap(), 1);
    assert_eq!(
        history
            .iter()
            .filter(|s| **s == ControlState::Run)
            .count(),
        1
    );
    assert_eq!(session.pending(100), 1);
}

#[test]
fn test_empty_auto_selection_is_an_error() {
    let mut samples = samples();
    let mut parms = parms(c64::new(1.0, 0.0));
    let initialize = Command::Initialize(InitializeCommand {
        baselines: BaselineSelection {
            station1: vec!["A".to_string()],
            station2: vec!["B".to_string()],
            filter: "AUTO".to_string(),
        },
        ..Default::default()
    });
    let (result, session, history) = run_kernel(
        vec![initialize, Command::Finalize],
        &mut samples,
        &mut parms,
    );

    match result {
        Err(ControlError::CommandFailed { command, message }) => {
            assert_eq!(command, "initialize");
            assert!(message.contains("empty"), "{message}");
        }
        other => panic!("expected a failed command, got {other:?}"),
    }
    let results = session.results(100);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].1.status, ResultStatus::Error);
    // Finalize was never taken.
    assert_eq!(session.pending(100), 1);
    assert_eq!(history.last(), Some(&ControlState::Finished));
}

#[test]
fn test_unknown_filter_is_an_error() {
    let mut samples = samples();
    let mut parms = parms(c64::new(1.0, 0.0));
    let initialize = Command::Initialize(InitializeCommand {
        baselines: BaselineSelection {
            filter: "SOME".to_string(),
            ..Default::default()
        },
        ..Default::default()
    });
    let (result, _, _) = run_kernel(vec![initialize], &mut samples, &mut parms);
    assert!(matches!(
        result,
        Err(ControlError::CommandFailed {
            command: "initialize",
            ..
        })
    ));
}

#[test]
fn test_kernel_solves_gains() {
    let mut samples = samples();
    let mut parms = parms(c64::new(1.0, 0.0));
    let commands = vec![
        Command::Initialize(InitializeCommand::default()),
        next_chunk(),
        solve_a(),
        Command::Finalize,
    ];
    let (result, session, _) = run_kernel(commands, &mut samples, &mut parms);

    assert_eq!(result.unwrap(), 4);
    assert!(session.results(100).iter().all(|(_, r)| r.is_ok()));
    assert_eq!(parms.flush_count(), 1);
    let re = parms.get("Gain:X:Real:A").unwrap();
    let im = parms.get("Gain:X:Imag:A").unwrap();
    for t in 0..4 {
        let cell = Location::new(0, t);
        assert_abs_diff_eq!(parms.coeff(re, cell).unwrap()[0], GAIN_A.re, epsilon = 1e-6);
        assert_abs_diff_eq!(parms.coeff(im, cell).unwrap()[0], GAIN_A.im, epsilon = 1e-6);
    }
}

fn next_chunk_between(start: f64, end: f64) -> Command {
    Command::NextChunk(NextChunkCommand {
        time: Interval::new(start, end),
        freq: None,
    })
}

#[test]
fn test_kernel_solves_chunk_by_chunk() {
    let mut samples = samples();
    let mut parms = parms(c64::new(1.0, 0.0));
    let commands = vec![
        Command::Initialize(InitializeCommand::default()),
        next_chunk_between(0.0, 20.0),
        solve_a(),
        next_chunk_between(20.0, 40.0),
        solve_a(),
        Command::Finalize,
    ];
    let (result, session, _) = run_kernel(commands, &mut samples, &mut parms);

    assert_eq!(result.unwrap(), 6);
    let results = session.results(100);
    assert_eq!(results.len(), 6);
    assert!(results.iter().all(|(_, r)| r.is_ok()), "{results:?}");
    assert_eq!(parms.flush_count(), 2);
    let re = parms.get("Gain:X:Real:A").unwrap();
    let im = parms.get("Gain:X:Imag:A").unwrap();
    for t in 0..4 {
        let cell = Location::new(0, t);
        assert_abs_diff_eq!(parms.coeff(re, cell).unwrap()[0], GAIN_A.re, epsilon = 1e-6);
        assert_abs_diff_eq!(parms.coeff(im, cell).unwrap()[0], GAIN_A.im, epsilon = 1e-6);
    }
}

#[test]
fn test_solve_only_touches_the_loaded_chunk() {
    let mut samples = samples();
    let mut parms = parms(c64::new(1.0, 0.0));
    let commands = vec![
        Command::Initialize(InitializeCommand::default()),
        next_chunk_between(0.0, 20.0),
        solve_a(),
        Command::Finalize,
    ];
    let (result, _, _) = run_kernel(commands, &mut samples, &mut parms);

    assert_eq!(result.unwrap(), 4);
    let re = parms.get("Gain:X:Real:A").unwrap();
    for t in 0..2 {
        let cell = Location::new(0, t);
        assert_abs_diff_eq!(parms.coeff(re, cell).unwrap()[0], GAIN_A.re, epsilon = 1e-6);
    }
    // The solution grid covers all the data, but the later time cells
    // haven't been solved yet.
    for t in 2..4 {
        assert_eq!(parms.coeff(re, Location::new(0, t)).unwrap(), vec![1.0]);
    }
}

#[test]
fn test_solve_needs_a_chunk() {
    let mut samples = samples();
    let mut parms = parms(c64::new(1.0, 0.0));
    let commands = vec![
        Command::Initialize(InitializeCommand::default()),
        solve_a(),
        Command::Finalize,
    ];
    let (result, _, _) = run_kernel(commands, &mut samples, &mut parms);
    match result {
        Err(ControlError::CommandFailed { command, message }) => {
            assert_eq!(command, "solve");
            assert_eq!(message, ControlError::NoChunk.to_string());
        }
        other => panic!("expected a failed solve, got {other:?}"),
    }
}

#[test]
fn test_solve_with_nothing_matching() {
    let mut samples = samples();
    let mut parms = parms(c64::new(1.0, 0.0));
    let solve = Command::Solve(SolveCommand {
        parms: vec!["Phase:*".to_string()],
        ..Default::default()
    });
    let commands = vec![
        Command::Initialize(InitializeCommand::default()),
        next_chunk(),
        solve,
    ];
    let (result, _, _) = run_kernel(commands, &mut samples, &mut parms);
    assert!(matches!(
        result,
        Err(ControlError::CommandFailed {
            command: "solve",
            ..
        })
    ));
}

#[test]
fn test_next_chunk_outside_the_data() {
    let mut samples = samples();
    let mut parms = parms(c64::new(1.0, 0.0));
    let commands = vec![
        Command::Initialize(InitializeCommand::default()),
        Command::NextChunk(NextChunkCommand {
            time: Interval::new(0.0, 40.0),
            freq: Some(Interval::new(99e6, 102e6)),
        }),
    ];
    let (result, _, _) = run_kernel(commands, &mut samples, &mut parms);
    assert!(matches!(
        result,
        Err(ControlError::CommandFailed {
            command: "next_chunk",
            ..
        })
    ));
}

#[test]
fn test_next_chunk_selects_contained_cells() {
    let mut samples = samples();
    let mut parms = parms(c64::new(1.0, 0.0));
    let factory = GainModelFactory::new(stations());
    let session = MemorySession::new();
    let worker = session.add_worker(WorkerRole::Kernel, 1, None);
    let mut kernel = KernelControl::new(&mut samples, &mut parms, &factory);

    kernel
        .initialize(&InitializeCommand::default(), &worker)
        .unwrap();
    kernel
        .next_chunk(
            &NextChunkCommand {
                time: Interval::new(5.0, 30.0),
                freq: Some(Interval::new(101e6, 103e6)),
            },
            &worker,
        )
        .unwrap();
    let chunk = kernel.chunk().unwrap();
    // Only time cells 1 and 2 lie completely inside 5-30 s.
    assert_eq!(chunk.offset, Location::new(1, 1));
    assert_eq!(chunk.grid.shape(), (2, 2));
}

#[test]
fn test_subtract_with_true_gains() {
    let mut samples = samples();
    let mut parms = parms(GAIN_A);
    let commands = vec![
        Command::Initialize(InitializeCommand::default()),
        next_chunk(),
        Command::Subtract(ApplyCommand {
            output_column: Some("RESIDUAL".to_string()),
            ..Default::default()
        }),
        Command::Finalize,
    ];
    let (result, _, _) = run_kernel(commands, &mut samples, &mut parms);
    assert_eq!(result.unwrap(), 4);

    let residual = samples.column("RESIDUAL").unwrap();
    for v in residual.slice(s![1, .., .., ..]).iter() {
        assert_abs_diff_eq!(v.norm(), 0.0, epsilon = 1e-12);
    }
    // Autos aren't in the default (cross) selection.
    for v in residual.slice(s![0, .., .., 0]).iter() {
        assert_abs_diff_eq!(v.re, GAIN_A.norm_sqr(), epsilon = 1e-12);
    }
}

#[test]
fn test_correct_and_predict() {
    let mut samples = samples();
    let mut parms = parms(GAIN_A);
    let commands = vec![
        Command::Initialize(InitializeCommand::default()),
        next_chunk(),
        Command::Correct(ApplyCommand {
            correlations: vec!["XX".to_string()],
            output_column: Some("CORRECTED".to_string()),
            ..Default::default()
        }),
        Command::Predict(ApplyCommand {
            output_column: Some("MODEL".to_string()),
            ..Default::default()
        }),
        Command::Finalize,
    ];
    let (result, _, _) = run_kernel(commands, &mut samples, &mut parms);
    assert_eq!(result.unwrap(), 5);

    let corrected = samples.column("CORRECTED").unwrap();
    for v in corrected.slice(s![1, .., .., 0]).iter() {
        assert_abs_diff_eq!(v.re, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(v.im, 0.0, epsilon = 1e-12);
    }
    let model = samples.column("MODEL").unwrap();
    for v in model.slice(s![1, .., .., 0]).iter() {
        assert_abs_diff_eq!(v.re, GAIN_A.re, epsilon = 1e-12);
        assert_abs_diff_eq!(v.im, GAIN_A.im, epsilon = 1e-12);
    }
    assert!(!samples.flags().iter().any(|&f| f));
}

#[test]
fn test_flagged_station_flags_samples() {
    let mut samples = samples();
    let mut parms = parms(GAIN_A);
    let mut config = crate::model::ModelConfig::default();
    config.flagged_stations = vec!["B".to_string()];
    let commands = vec![
        Command::Initialize(InitializeCommand::default()),
        next_chunk(),
        Command::Predict(ApplyCommand {
            output_column: Some("MODEL".to_string()),
            write_flags: true,
            model: Some(config),
            ..Default::default()
        }),
        Command::Finalize,
    ];
    let (result, _, _) = run_kernel(commands, &mut samples, &mut parms);
    assert_eq!(result.unwrap(), 4);
    assert!(samples.flags().slice(s![1, .., .., ..]).iter().all(|&f| f));
    assert!(!samples.flags().slice(s![0, .., .., ..]).iter().any(|&f| f));
}

#[test]
fn test_poll_timeout() {
    let session = MemorySession::new();
    let worker = session.add_worker(WorkerRole::Kernel, 7, None);
    let mut samples = samples();
    let mut parms = parms(c64::new(1.0, 0.0));
    let factory = GainModelFactory::new(stations());
    let mut kernel = KernelControl::new(&mut samples, &mut parms, &factory);
    let mut control = ProcessControl::new(worker, fast_polling());

    let result = control.run(&mut kernel);
    assert!(matches!(result, Err(ControlError::PollTimeout(5))));
    assert_eq!(control.state(), ControlState::Finished);
    assert!(!control.history().contains(&ControlState::Run));
}

#[test]
fn test_global_solve_needs_an_aggregator() {
    let mut samples = samples();
    let mut parms = parms(c64::new(1.0, 0.0));
    let initialize = Command::Initialize(InitializeCommand {
        calibration_groups: vec![1],
        ..Default::default()
    });
    let (result, _, _) = run_kernel(vec![initialize], &mut samples, &mut parms);
    match result {
        Err(ControlError::CommandFailed { message, .. }) => {
            assert_eq!(message, ControlError::NoAggregator.to_string())
        }
        other => panic!("expected a failed initialize, got {other:?}"),
    }
}

#[test]
fn test_session_roles_and_indices() {
    let session = MemorySession::new();
    let k0 = session.add_worker(WorkerRole::Kernel, 10, None);
    let s0 = session.add_worker(WorkerRole::Solver, 20, None);
    let k1 = session.add_worker(WorkerRole::Kernel, 11, Some(info().grid));

    assert_eq!(k0.index(), 0);
    assert_eq!(k1.index(), 1);
    assert_eq!(s0.index(), 0);
    assert_eq!(k1.worker_by_index(WorkerRole::Kernel, 1), Some(11));
    assert_eq!(k1.worker_by_index(WorkerRole::Solver, 0), Some(20));
    assert_eq!(k1.worker_by_index(WorkerRole::Kernel, 2), None);
    assert_eq!(k0.grid(11), Some(info().grid));
    assert_eq!(k0.grid(10), None);

    // Commands only go to kernels.
    session.post_command(Command::Finalize);
    assert!(k0.wait_for_command());
    assert!(k1.wait_for_command());
    assert!(!s0.wait_for_command());
    assert_eq!(k0.get_command(), Some((0, Command::Finalize)));
    assert!(!k0.wait_for_command());
}

#[test]
fn test_commands_from_json() {
    let json = r#"[
        {"type": "initialize", "calibration_groups": [2, 2], "aggregator": "localhost:4000"},
        {"type": "next_chunk", "time": {"start": 0.0, "end": 40.0}},
        {"type": "solve", "parms": ["Gain:*"], "cell_size": {"time": 2},
         "variant": {"type": "robust"}},
        {"type": "subtract", "output_column": "RESIDUAL"},
        {"type": "finalize"}
    ]"#;
    let commands: Vec<Command> = serde_json::from_str(json).unwrap();
    assert_eq!(commands.len(), 5);
    match &commands[0] {
        Command::Initialize(init) => {
            assert_eq!(init.calibration_groups, vec![2, 2]);
            assert_eq!(init.aggregator.as_deref(), Some("localhost:4000"));
            assert_eq!(init.baselines.filter, "CROSS");
        }
        other => panic!("unexpected {other:?}"),
    }
    match &commands[2] {
        Command::Solve(solve) => {
            assert_eq!(solve.cell_size, CellSize { freq: 0, time: 2 });
            assert_eq!(solve.variant.schedule_len(), 3);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(commands[3].name(), "subtract");
    assert_eq!(commands[4], Command::Finalize);
}
