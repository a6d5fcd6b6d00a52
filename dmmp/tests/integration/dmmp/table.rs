// vim: tw=80
use assert_cmd::prelude::*;
use predicates::prelude::*;
use rstest::rstest;

use super::dmmp;

#[rstest]
#[case("0 0 2 1 round-robin 0 2 1 sda 1000 sdb 1000 queue-length 0 1 1 sdc 128")]
#[case("1 queue_if_no_path 0 1 1 round-robin 0 1 0 sda")]
#[case("0 0 0 0")]
fn canonical(#[case] table: &str) {
    dmmp()
        .args(["table", table])
        .assert()
        .success()
        .stdout(format!("{table}\n"));
}

/// Tokens may be split over several arguments, and extra whitespace is
/// dropped.
#[test]
fn normalize() {
    dmmp()
        .args(["table", "0  0", "1", "1", "round-robin 0 1 0", "  sda"])
        .assert()
        .success()
        .stdout("0 0 1 1 round-robin 0 1 0 sda\n");
}

#[rstest]
#[case("0 0 1 1 round-robin 0 0 0", "invalid number of paths")]
#[case("1 frobnicate 0 0 0", "unrecognised multipath feature request")]
#[case("0 0 1 2 round-robin 0 1 0 sda", "invalid initial priority group")]
fn invalid(#[case] table: &str, #[case] msg: &str) {
    dmmp()
        .args(["table", table])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains(msg));
}
