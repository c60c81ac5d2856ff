use assert_cmd::Command;
use predicates::prelude::*;

/// Every subcommand except `config` refuses to run without a config file.
#[test]
fn status_without_config_exits_one() {
    let dir = tempfile::tempdir().expect("tempdir");
    Command::cargo_bin("hyperdrive")
        .expect("binary")
        .current_dir(dir.path())
        .arg("status")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("config\" first"));
}

#[test]
fn smk_status_without_config_exits_one() {
    let dir = tempfile::tempdir().expect("tempdir");
    Command::cargo_bin("hyperdrive")
        .expect("binary")
        .current_dir(dir.path())
        .args(["smk-status", "some-job"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("config\" first"));
}

#[test]
fn help_lists_every_subcommand() {
    let assert = Command::cargo_bin("hyperdrive")
        .expect("binary")
        .arg("--help")
        .assert()
        .success();
    let output = String::from_utf8_lossy(&assert.get_output().stdout).into_owned();
    for subcommand in [
        "config",
        "snakemake",
        "submit-job",
        "smk-status",
        "status",
        "clean-cache",
        "kill",
        "log",
    ] {
        assert!(output.contains(subcommand), "missing {subcommand} in:\n{output}");
    }
}
