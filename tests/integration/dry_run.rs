// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Tests of reading run files.

use indoc::indoc;
use tempfile::TempDir;

use crate::*;

const TOML_RUN: &str = indoc! {r#"
    stations = ["A", "B", "C"]
    correlations = ["XX", "YY"]

    [grid.freq]
    type = "regular"
    start = 150.0e6
    width = 40.0e3
    count = 8

    [grid.time]
    type = "regular"
    start = 0.0
    width = 2.0
    count = 5

    [[parms]]
    name = "Gain:X:Real:A"
    values = [1.0]

    [[commands]]
    type = "initialize"

    [[commands]]
    type = "finalize"
"#};

#[test]
fn test_dry_run_toml() {
    let tmp_dir = TempDir::new().unwrap();
    let run_file = write_run_file("run.toml", tmp_dir.path(), TOML_RUN);

    let result = selfcal()
        .args(["--no-progress-bars", "dry-run", &format!("{}", run_file.display())])
        .ok();
    let ok = result.is_ok();
    let (stdout, stderr) = get_cmd_output(result);
    assert!(ok, "stdout: {stdout}\nstderr: {stderr}");
    // 3 cross baselines and 3 autos.
    assert!(stdout.contains("3 stations, 6 baselines"), "{stdout}");
    assert!(stdout.contains("initialize, finalize"), "{stdout}");
    assert!(stdout.contains("Dry run"), "{stdout}");
}

#[test]
fn test_unrecognised_extension() {
    let tmp_dir = TempDir::new().unwrap();
    let run_file = write_run_file("run.yaml", tmp_dir.path(), TOML_RUN);

    let result = selfcal()
        .args(["--no-progress-bars", "dry-run", &format!("{}", run_file.display())])
        .ok();
    assert!(result.is_err());
    let (_, stderr) = get_cmd_output(result);
    assert!(stderr.contains("recognised file extension"), "{stderr}");
    assert!(stderr.contains("toml, json"), "{stderr}");
}

#[test]
fn test_malformed_run_file() {
    let tmp_dir = TempDir::new().unwrap();
    let run_file = write_run_file("run.json", tmp_dir.path(), "{\"stations\": [\"A\"]}");

    let result = selfcal()
        .args(["--no-progress-bars", "dry-run", &format!("{}", run_file.display())])
        .ok();
    assert!(result.is_err());
    let (_, stderr) = get_cmd_output(result);
    assert!(stderr.contains("Couldn't decode json"), "{stderr}");
}

#[test]
fn test_baselines_must_refer_to_stations() {
    let tmp_dir = TempDir::new().unwrap();
    let contents = TOML_RUN.replace(
        "correlations = [\"XX\", \"YY\"]",
        "correlations = [\"XX\", \"YY\"]\nbaselines = [[0, 1], [0, 3]]",
    );
    let run_file = write_run_file("run.toml", tmp_dir.path(), &contents);

    let result = selfcal()
        .args(["--no-progress-bars", "dry-run", &format!("{}", run_file.display())])
        .ok();
    assert!(result.is_err());
    let (_, stderr) = get_cmd_output(result);
    assert!(stderr.contains("Baseline (0, 3)"), "{stderr}");
}
