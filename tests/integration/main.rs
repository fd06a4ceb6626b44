// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Integration tests.
//!
//! Some help for laying out these tests was taken from:
//! https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html

mod dry_run;
mod kernel;

use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
    process::Output,
    str::from_utf8,
};

use assert_cmd::{output::OutputError, Command};

fn selfcal() -> Command {
    Command::cargo_bin("selfcal").unwrap()
}

fn get_cmd_output(result: Result<Output, OutputError>) -> (String, String) {
    let output = match result {
        Ok(o) => o,
        Err(o) => o.as_output().unwrap().clone(),
    };
    (
        from_utf8(&output.stdout).unwrap().to_string(),
        from_utf8(&output.stderr).unwrap().to_string(),
    )
}

fn make_file_in_dir<T: AsRef<Path>, U: AsRef<Path>>(filename: T, dir: U) -> (PathBuf, File) {
    let path = dir.as_ref().join(filename);
    let f = File::create(&path).expect("couldn't make file");
    (path, f)
}

/// Write `contents` to a new file in `dir` and return its path.
fn write_run_file<U: AsRef<Path>>(filename: &str, dir: U, contents: &str) -> PathBuf {
    let (path, mut f) = make_file_in_dir(filename, dir);
    f.write_all(contents.as_bytes()).unwrap();
    path
}

#[test]
fn test_help() {
    let (stdout, _) = get_cmd_output(selfcal().arg("--help").ok());
    assert!(stdout.contains("kernel"), "{stdout}");
    assert!(stdout.contains("aggregator"), "{stdout}");
    assert!(stdout.contains("dry-run"), "{stdout}");
}

#[test]
fn test_no_subcommand_is_an_error() {
    let result = selfcal().ok();
    assert!(result.is_err());
}

#[test]
fn test_aggregator_needs_a_group() {
    let result = selfcal()
        .args(["--no-progress-bars", "aggregator", "--listen", "127.0.0.1:0", "--group-size", "0"])
        .ok();
    assert!(result.is_err());
    let (_, stderr) = get_cmd_output(result);
    assert!(stderr.contains("at least 1"), "{stderr}");
}
