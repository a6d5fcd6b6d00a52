// vim: tw=80
use std::{fs, path::PathBuf, process::Command};

use assert_cmd::prelude::*;
use tempfile::{Builder, TempDir};

pub fn dmmp() -> Command {
    Command::cargo_bin("dmmp").unwrap()
}

/// Write a scenario file into a fresh temporary directory
pub fn scenario(yaml: &str) -> (PathBuf, TempDir) {
    let tempdir = Builder::new()
        .prefix("dmmp_integration_test")
        .tempdir()
        .unwrap();
    let path = tempdir.path().join("scenario.yaml");
    fs::write(&path, yaml).unwrap();
    (path, tempdir)
}
