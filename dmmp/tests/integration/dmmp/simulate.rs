// vim: tw=80
use assert_cmd::prelude::*;
use predicates::prelude::*;

use super::dmmp;
use crate::util::scenario;

#[test]
fn enoent() {
    dmmp()
        .args(["simulate", "/nonexistent/scenario.yaml"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("No such file or directory"));
}

#[test]
fn failover() {
    let (path, _tempdir) = scenario("\
table: 0 0 2 1 round-robin 0 2 0 sda sdb round-robin 0 1 0 sdc
steps:
  - io: 2
  - fail_device: sda
  - io: 1
  - fail_device: sdb
  - io: 1
  - status: table
");
    dmmp()
        .arg("simulate")
        .arg(&path)
        .assert()
        .success()
        .stdout("\
io 0: sda
io 1: sda
io 2: sdb
io 3: sdc
0 0 2 2 round-robin 0 2 1 sda 1000 sdb 1000 round-robin 0 1 1 sdc 1000
");
}

#[test]
fn invalid_scenario() {
    let (path, _tempdir) = scenario("steps: []\n");
    dmmp()
        .arg("simulate")
        .arg(&path)
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("invalid scenario"));
}

#[test]
fn messages() {
    let (path, _tempdir) = scenario("\
table: 0 0 2 1 round-robin 0 1 0 sda round-robin 0 1 0 sdb
steps:
  - message: switch_group 2
  - io: 1
  - message: switch_group 3
  - message: fail_path sdz
");
    dmmp()
        .arg("simulate")
        .arg(&path)
        .assert()
        .success()
        .stdout("\
message switch_group 2: ok
io 0: sdb
message switch_group 3: invalid PG number
message fail_path sdz: no path uses device sdz
");
}

#[test]
fn queued_io_failed_at_teardown() {
    let (path, _tempdir) = scenario("\
table: 1 queue_if_no_path 0 1 1 round-robin 0 1 0 sda
steps:
  - message: fail_path sda
  - io: 1
");
    dmmp()
        .arg("simulate")
        .arg(&path)
        .assert()
        .success()
        .stdout("message fail_path sda: ok\nio 0: queued\nio 0: error EIO\n");
}
