//! Behavioural tests for the `galley` lifecycle subcommands.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::str::contains;

#[path = "common/project.rs"]
mod project;

use project::{DUMMY_MATRIX, Workspace};

fn galley(workspace: &Workspace) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("galley");
    cmd.current_dir(workspace.root());
    cmd.env_remove("GALLEY_STATE_DIR");
    cmd.env_remove("GALLEY_PROJECT_FILE");
    cmd.env_remove("GALLEY_CONFIG_PATH");
    cmd.env("RUST_LOG", "warn");
    cmd
}

#[test]
fn list_shows_every_instance_as_not_created() {
    let workspace = Workspace::new(DUMMY_MATRIX);

    galley(&workspace)
        .arg("list")
        .assert()
        .success()
        .stdout(contains("default-ubuntu"))
        .stdout(contains("default-centos"))
        .stdout(contains("<Not Created>"));
}

#[test]
fn converge_persists_state_and_list_reports_it() {
    let workspace = Workspace::new(DUMMY_MATRIX);

    galley(&workspace)
        .args(["converge", "default-ubuntu"])
        .assert()
        .success();

    assert_eq!(workspace.state_files(), vec!["default-ubuntu.json"]);
    galley(&workspace)
        .args(["list", "ubuntu"])
        .assert()
        .success()
        .stdout(contains("converge"));
}

#[test]
fn test_all_in_parallel_leaves_no_state_behind() {
    let workspace = Workspace::new(DUMMY_MATRIX);

    galley(&workspace)
        .args(["test", "all", "--parallel", "--concurrency", "2"])
        .assert()
        .success();

    assert!(workspace.state_files().is_empty(), "{:?}", workspace.state_files());
}

#[test]
fn unmatched_filter_exits_with_one() {
    let workspace = Workspace::new(DUMMY_MATRIX);

    galley(&workspace)
        .args(["verify", "windows"])
        .assert()
        .code(1)
        .stderr(contains("no instances match 'windows'"));
}

#[test]
fn invalid_destroy_mode_exits_with_one() {
    let workspace = Workspace::new(DUMMY_MATRIX);

    galley(&workspace)
        .args(["test", "--destroy", "sometimes"])
        .assert()
        .code(1)
        .stderr(contains("destroy mode must be one of passing, always, never"));

    assert!(workspace.state_files().is_empty());
}

#[test]
fn failing_instance_fails_the_run_but_keeps_its_state() {
    let workspace = Workspace::new(
        r#"
[driver]
name = "dummy"

[transport]
name = "exec"

[[platforms]]
name = "ubuntu"

[[platforms]]
name = "centos"

[[platforms]]
name = "broken"
[platforms.driver]
fail_on = "verify"

[[suites]]
name = "default"
run_list = []
"#,
    );

    galley(&workspace)
        .args(["test", "--parallel"])
        .assert()
        .code(1)
        .stderr(contains("1 of 3 instances failed"));

    assert_eq!(workspace.state_files(), vec!["default-broken.json"]);
}

#[test]
fn unknown_driver_is_reported_before_anything_runs() {
    let workspace = Workspace::new("[driver]\nname = \"vagrant\"\n[[platforms]]\nname = \"u\"\n");

    galley(&workspace)
        .arg("create")
        .assert()
        .code(1)
        .stderr(contains("unknown driver 'vagrant'"));
}
