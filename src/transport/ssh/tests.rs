//! Unit tests for the SSH adapter.

use std::fs;
use std::sync::Arc;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::test_support::{CommandInvocation, ScriptedRunner};
use crate::transport::{CachedTransport, Transport};

#[fixture]
fn runner() -> ScriptedRunner {
    ScriptedRunner::new()
}

fn call(calls: &[CommandInvocation], index: usize) -> &CommandInvocation {
    calls
        .get(index)
        .unwrap_or_else(|| panic!("expected invocation {index}, got {}", calls.len()))
}

fn options() -> SshOptions {
    SshOptions {
        connection_retries: 3,
        connection_retry_sleep: 2,
        max_wait_until_ready: 4,
        control_dir: Some("/tmp/galley-test".to_owned()),
        ..SshOptions::default()
    }
}

fn state() -> State {
    let mut state = State::new();
    state.set("hostname", "192.0.2.10");
    state.set("username", "ubuntu");
    state.set("port", 2222);
    state
}

fn transport(runner: &ScriptedRunner, options: SshOptions) -> CachedTransport<SshAdapter> {
    CachedTransport::new(SshAdapter::with_runner(options, Arc::new(runner.clone())))
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn connection_retries_refused_probes_until_success(runner: ScriptedRunner) {
    runner.push_output(Some(255), "", "ssh: connect to host 192.0.2.10 port 2222: Connection refused");
    runner.push_output(Some(255), "", "Connection reset by peer");
    runner.push_success();
    let transport = transport(&runner, options());
    let started = tokio::time::Instant::now();

    transport
        .connection(&state())
        .await
        .unwrap_or_else(|err| panic!("connection: {err}"));

    let calls = runner.invocations();
    assert_eq!(calls.len(), 3);
    assert_eq!(started.elapsed(), Duration::from_secs(4));
    let probe = call(&calls, 0).command_string();
    assert!(probe.starts_with("ssh -p 2222"), "{probe}");
    assert!(probe.contains("ControlMaster=auto"), "{probe}");
    assert!(probe.contains("ControlPath=/tmp/galley-test/galley-"), "{probe}");
    assert!(probe.ends_with("ubuntu@192.0.2.10 true"), "{probe}");
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn connection_gives_up_after_configured_retries(runner: ScriptedRunner) {
    for _ in 0..5 {
        runner.push_output(Some(255), "", "ssh: connect to host h port 22: Connection timed out");
    }
    let transport = transport(&runner, options());

    let err = transport
        .connection(&state())
        .await
        .expect_err("connection should fail");

    assert!(matches!(
        err,
        TransportError::Connection {
            kind: ConnectionErrorKind::Timeout,
            ..
        }
    ));
    assert_eq!(runner.invocations().len(), 3);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn unclassified_ssh_failures_are_not_retried(runner: ScriptedRunner) {
    runner.push_output(
        Some(255),
        "",
        "ssh: Could not resolve hostname nowhere: Name or service not known",
    );
    let transport = transport(&runner, options());

    let err = transport
        .connection(&state())
        .await
        .expect_err("connection should fail");

    assert!(matches!(
        err,
        TransportError::CommandFailed {
            exit_code: Some(255),
            ..
        }
    ));
    assert_eq!(runner.invocations().len(), 1);
}

#[rstest]
#[tokio::test]
async fn execute_forces_a_tty_and_surfaces_exit_codes(runner: ScriptedRunner) {
    runner.push_success();
    runner.push_success();
    runner.push_exit_code(42);
    runner.push_missing_exit_code();
    let transport = transport(&runner, options());
    let connection = transport
        .connection(&state())
        .await
        .unwrap_or_else(|err| panic!("connection: {err}"));

    connection
        .execute("uname -a")
        .await
        .unwrap_or_else(|err| panic!("execute: {err}"));
    connection
        .execute("   ")
        .await
        .unwrap_or_else(|err| panic!("blank execute: {err}"));
    let failed = connection.execute("exit 42").await.expect_err("exit 42");
    let killed = connection.execute("sleep 600").await.expect_err("killed");

    assert_eq!(failed, TransportError::command_failed(Some(42), "exit 42"));
    assert_eq!(killed, TransportError::command_failed(None, "sleep 600"));
    let calls = runner.invocations();
    assert_eq!(calls.len(), 4, "blank commands must not reach ssh");
    assert!(call(&calls, 1).args.iter().any(|arg| arg == "-tt"));
    assert!(call(&calls, 1).command_string().ends_with("ubuntu@192.0.2.10 uname -a"));
}

#[rstest]
#[tokio::test]
async fn scp_upload_streams_sink_protocol(runner: ScriptedRunner) {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let sandbox = Utf8PathBuf::from_path_buf(tmp.path().join("sandbox"))
        .unwrap_or_else(|path| panic!("utf8: {}", path.display()));
    fs::create_dir_all(&sandbox).unwrap_or_else(|err| panic!("mkdir: {err}"));
    fs::write(sandbox.join("run.sh"), "echo hi").unwrap_or_else(|err| panic!("write: {err}"));
    runner.push_success();
    runner.push_success();
    runner.push_success();
    let transport = transport(&runner, options());
    let connection = transport
        .connection(&state())
        .await
        .unwrap_or_else(|err| panic!("connection: {err}"));

    connection
        .upload(&[sandbox], "/tmp/galley")
        .await
        .unwrap_or_else(|err| panic!("upload: {err}"));

    let calls = runner.invocations();
    assert_eq!(calls.len(), 3);
    assert!(call(&calls, 1).command_string().ends_with("mkdir -p /tmp/galley"));
    assert!(call(&calls, 2).command_string().ends_with("scp -r -t /tmp/galley"));
    let input = call(&calls, 2).input.clone().unwrap_or_default();
    let text = String::from_utf8_lossy(&input);
    assert!(text.starts_with("D0"), "{text}");
    assert!(text.contains(" 0 sandbox\nC0"), "{text}");
    assert!(text.ends_with("E\n"), "{text}");
}

#[rstest]
#[tokio::test]
async fn tar_upload_falls_back_to_scp_when_unpacking_fails(runner: ScriptedRunner) {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let file = Utf8PathBuf::from_path_buf(tmp.path().join("dna.json"))
        .unwrap_or_else(|path| panic!("utf8: {}", path.display()));
    fs::write(&file, "{}").unwrap_or_else(|err| panic!("write: {err}"));
    runner.push_success();
    runner.push_success();
    runner.push_output(Some(2), "", "tar: command not found");
    runner.push_success();
    let transport = transport(
        &runner,
        SshOptions {
            compression: UploadMode::Tar,
            ..options()
        },
    );
    let connection = transport
        .connection(&state())
        .await
        .unwrap_or_else(|err| panic!("connection: {err}"));

    connection
        .upload(&[file], "/tmp/galley")
        .await
        .unwrap_or_else(|err| panic!("upload: {err}"));

    let calls = runner.invocations();
    assert_eq!(calls.len(), 4);
    assert!(call(&calls, 2).command_string().ends_with("tar -xzf - -C /tmp/galley"));
    assert!(call(&calls, 3).command_string().ends_with("scp -t /tmp/galley"));
    let input = call(&calls, 3).input.clone().unwrap_or_default();
    assert!(input.starts_with(b"C0"));
    assert!(input.ends_with(b" 2 dna.json\n{}\0"));
}

#[rstest]
#[tokio::test]
async fn close_stops_the_control_master_once(runner: ScriptedRunner) {
    runner.push_success();
    runner.push_success();
    let transport = transport(&runner, options());
    let connection = transport
        .connection(&state())
        .await
        .unwrap_or_else(|err| panic!("connection: {err}"));

    connection
        .close()
        .await
        .unwrap_or_else(|err| panic!("close: {err}"));
    connection
        .close()
        .await
        .unwrap_or_else(|err| panic!("second close: {err}"));

    let calls = runner.invocations();
    assert_eq!(calls.len(), 2);
    assert!(call(&calls, 1).command_string().contains("-O exit ubuntu@192.0.2.10"));
}

#[test]
fn fingerprint_requires_a_hostname_and_falls_back_to_options() {
    let adapter = SshAdapter::with_runner(options(), Arc::new(ScriptedRunner::new()));

    let missing = adapter.fingerprint(&State::new()).expect_err("no hostname");
    assert!(matches!(missing, TransportError::Config { .. }));

    let mut minimal = State::new();
    minimal.set("hostname", "example.test");
    let fingerprint = adapter
        .fingerprint(&minimal)
        .unwrap_or_else(|err| panic!("fingerprint: {err}"));
    assert_eq!(
        fingerprint,
        SshFingerprint {
            hostname: "example.test".to_owned(),
            port: 22,
            username: "root".to_owned(),
            ssh_key: None,
        }
    );
}

#[test]
fn login_command_carries_identity_and_destination() {
    let adapter = SshAdapter::with_runner(
        SshOptions {
            ssh_key: Some("/keys/id_ed25519".to_owned()),
            forward_agent: true,
            ..options()
        },
        Arc::new(ScriptedRunner::new()),
    );
    let transport = CachedTransport::new(adapter);

    let login = transport
        .login_command(&state())
        .unwrap_or_else(|err| panic!("login: {err}"));

    assert_eq!(login.program, "ssh");
    assert_eq!(login.args.first().map(String::as_str), Some("-p"));
    assert!(login.args.windows(2).any(|pair| pair == ["-i", "/keys/id_ed25519"]));
    assert!(login.args.iter().any(|arg| arg == "-A"));
    assert_eq!(login.args.last().map(String::as_str), Some("ubuntu@192.0.2.10"));
}
