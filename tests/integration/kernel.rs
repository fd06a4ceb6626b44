// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Tests running a whole kernel from a run file.

use std::fs::File;

use approx::assert_abs_diff_eq;
use indoc::indoc;
use serde_json::Value;
use tempfile::TempDir;

use crate::*;

/// Two stations seen with an X gain of 1.2+0.3i on A over 4 channels and 4
/// timesteps. The gains of A are solved for every timestep.
const SOLVE_A: &str = indoc! {r#"
    {
        "grid": {
            "freq": {"type": "regular", "start": 100e6, "width": 1e6, "count": 4},
            "time": {"type": "regular", "start": 0.0, "width": 10.0, "count": 4}
        },
        "stations": ["A", "B"],
        "correlations": ["XX", "YY"],
        "true_parms": [
            {"name": "Gain:X:Real:A", "values": [1.2]},
            {"name": "Gain:X:Imag:A", "values": [0.3]}
        ],
        "parms": [
            {"name": "Gain:X:Real:A", "values": [1.0]},
            {"name": "Gain:X:Imag:A", "values": [0.0]},
            {"name": "Gain:X:Real:B", "values": [1.0]},
            {"name": "Gain:X:Imag:B", "values": [0.0]}
        ],
        "control": {"poll_interval_ms": 1, "max_poll_interval_ms": 2, "max_polls": 5},
        "process_id": 7,
        "commands": [
            {"type": "initialize"},
            {"type": "next_chunk", "time": {"start": 0.0, "end": 40.0}},
            {"type": "solve", "parms": ["Gain:X:*:A"], "correlations": ["XX"],
             "cell_size": {"freq": 0, "time": 1}, "chunk_size": 2,
             "variant": {"type": "standard", "residual": "complex"}},
            {"type": "finalize"}
        ]
    }
"#};

fn parm<'a>(report: &'a Value, name: &str) -> &'a Value {
    report["parms"]
        .as_array()
        .unwrap()
        .iter()
        .find(|p| p["name"] == name)
        .unwrap_or_else(|| panic!("no parameter {name} in the report"))
}

#[test]
fn test_kernel_solves_gains() {
    let tmp_dir = TempDir::new().unwrap();
    let run_file = write_run_file("run.json", tmp_dir.path(), SOLVE_A);
    let output = tmp_dir.path().join("report.json");

    let result = selfcal()
        .args([
            "--no-progress-bars",
            "kernel",
            &format!("{}", run_file.display()),
            "--output",
            &format!("{}", output.display()),
        ])
        .ok();
    let (stdout, stderr) = get_cmd_output(result);
    assert!(stderr.is_empty(), "stdout: {stdout}\nstderr: {stderr}");

    let report: Value = serde_json::from_reader(File::open(&output).unwrap()).unwrap();
    assert_eq!(report["process_id"], 7);
    assert_eq!(report["commands"], 4);
    let results = report["results"].as_array().unwrap();
    assert_eq!(results.len(), 4);
    assert!(results.iter().all(|r| r[1]["status"] == "OK"));
    assert_eq!(report["solves"].as_array().unwrap().len(), 1);

    for (name, expected) in [("Gain:X:Real:A", 1.2), ("Gain:X:Imag:A", 0.3)] {
        let cells = parm(&report, name)["cells"].as_array().unwrap();
        assert_eq!(cells.len(), 4, "{name}");
        for cell in cells {
            let value = cell["values"][0].as_f64().unwrap();
            assert_abs_diff_eq!(value, expected, epsilon = 1e-6);
        }
    }
    // B was never solved for.
    assert!(parm(&report, "Gain:X:Real:B")["cells"]
        .as_array()
        .unwrap()
        .is_empty());
}

#[test]
fn test_failed_command_stops_the_kernel() {
    let tmp_dir = TempDir::new().unwrap();
    // Solving before any samples are loaded.
    let contents = SOLVE_A.replace(
        r#"{"type": "next_chunk", "time": {"start": 0.0, "end": 40.0}},"#,
        "",
    );
    assert_ne!(contents, SOLVE_A);
    let run_file = write_run_file("run.json", tmp_dir.path(), &contents);
    let output = tmp_dir.path().join("report.json");

    let result = selfcal()
        .args([
            "--no-progress-bars",
            "kernel",
            &format!("{}", run_file.display()),
            "--output",
            &format!("{}", output.display()),
        ])
        .ok();
    assert!(result.is_err());
    let (_, stderr) = get_cmd_output(result);
    assert!(stderr.contains("solve"), "{stderr}");
    assert!(stderr.contains("NextChunk"), "{stderr}");
    assert!(!output.exists());
}

#[test]
fn test_next_chunk_outside_the_data() {
    let tmp_dir = TempDir::new().unwrap();
    let contents = SOLVE_A.replace(
        r#""time": {"start": 0.0, "end": 40.0}}"#,
        r#""time": {"start": 0.0, "end": 40.0}, "freq": {"start": 90e6, "end": 104e6}}"#,
    );
    assert_ne!(contents, SOLVE_A);
    let run_file = write_run_file("run.json", tmp_dir.path(), &contents);

    let result = selfcal()
        .args(["--no-progress-bars", "kernel", &format!("{}", run_file.display())])
        .ok();
    assert!(result.is_err());
    let (_, stderr) = get_cmd_output(result);
    assert!(stderr.contains("next_chunk"), "{stderr}");
}
