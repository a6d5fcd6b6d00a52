// vim: tw=80
use assert_cmd::prelude::*;

use super::dmmp;

#[test]
fn list() {
    dmmp()
        .arg("selectors")
        .assert()
        .success()
        .stdout("queue-length\nround-robin\n");
}
