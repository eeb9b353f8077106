//! Provisioner and verifier contract.
//!
//! Both share one shape: build a local sandbox, then run a fixed sequence of
//! optional commands on the instance with the sandbox uploaded in between.
//! The sequence lives in [`run_stage`]; a [`Stage`] only says what to run.

use std::ffi::OsString;
use std::fmt;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use tempfile::TempDir;
use tracing::{Instrument, debug, info_span, warn};

use crate::driver::ActionError;
use crate::instance::Instance;
use crate::state::State;
use crate::transport::runner::{CommandRequest, CommandRunner, ProcessCommandRunner};

/// Default remote directory sandboxes are uploaded to.
pub const DEFAULT_ROOT_PATH: &str = "/tmp/galley";

/// Local scratch directory whose top-level entries are uploaded to the
/// stage's remote root. Removed when dropped.
#[derive(Debug)]
pub struct Sandbox {
    _dir: TempDir,
    path: Utf8PathBuf,
}

impl Sandbox {
    /// Creates an empty sandbox.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError::Sandbox`] when the directory cannot be created.
    pub fn new(prefix: &str) -> Result<Self, ActionError> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("galley-{prefix}-"))
            .tempdir()
            .map_err(|err| sandbox_error(Utf8Path::new(prefix), &err))?;
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).map_err(|path| {
            ActionError::Sandbox {
                path: path.display().to_string(),
                message: "sandbox path is not UTF-8".to_owned(),
            }
        })?;
        Ok(Self { _dir: dir, path })
    }

    /// Local directory backing the sandbox.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Writes `contents` to `relative` inside the sandbox.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError::Sandbox`] on I/O failure.
    pub fn write(&self, relative: &str, contents: impl AsRef<[u8]>) -> Result<(), ActionError> {
        let target = self.path.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|err| sandbox_error(parent, &err))?;
        }
        fs::write(&target, contents).map_err(|err| sandbox_error(&target, &err))
    }

    /// Copies a file or directory tree into the sandbox under `relative`.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError::Sandbox`] on I/O failure.
    pub fn copy_in(&self, source: &Utf8Path, relative: &str) -> Result<(), ActionError> {
        copy_tree(source, &self.path.join(relative))
    }

    /// Top-level entries, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError::Sandbox`] when the directory cannot be listed.
    pub fn entries(&self) -> Result<Vec<Utf8PathBuf>, ActionError> {
        let mut entries = self
            .path
            .read_dir_utf8()
            .map_err(|err| sandbox_error(&self.path, &err))?
            .map(|entry| entry.map(|entry| entry.path().to_path_buf()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| sandbox_error(&self.path, &err))?;
        entries.sort();
        Ok(entries)
    }
}

fn copy_tree(source: &Utf8Path, target: &Utf8Path) -> Result<(), ActionError> {
    let metadata = fs::metadata(source).map_err(|err| sandbox_error(source, &err))?;
    if !metadata.is_dir() {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|err| sandbox_error(parent, &err))?;
        }
        fs::copy(source, target).map_err(|err| sandbox_error(source, &err))?;
        return Ok(());
    }
    fs::create_dir_all(target).map_err(|err| sandbox_error(target, &err))?;
    for entry in source
        .read_dir_utf8()
        .map_err(|err| sandbox_error(source, &err))?
    {
        let entry = entry.map_err(|err| sandbox_error(source, &err))?;
        copy_tree(entry.path(), &target.join(entry.file_name()))?;
    }
    Ok(())
}

fn sandbox_error(path: &Utf8Path, err: &std::io::Error) -> ActionError {
    ActionError::Sandbox {
        path: path.to_string(),
        message: err.to_string(),
    }
}

/// A provisioner or verifier.
///
/// Command accessors return `None` for steps the stage does not need.
pub trait Stage: Send + Sync + fmt::Debug {
    /// Plugin name, for example `shell`.
    fn name(&self) -> &str;

    /// Remote directory the sandbox is uploaded to.
    fn root_path(&self) -> &str {
        DEFAULT_ROOT_PATH
    }

    /// Builds the local sandbox for `instance`.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError::Sandbox`] when the sandbox cannot be populated.
    fn create_sandbox(&self, instance: &Instance) -> Result<Sandbox, ActionError> {
        Sandbox::new(instance.name())
    }

    /// Installs the tool the stage drives.
    fn install_command(&self, _instance: &Instance) -> Option<String> {
        None
    }

    /// Prepares the remote root before the upload.
    fn init_command(&self, _instance: &Instance) -> Option<String> {
        None
    }

    /// Runs after the upload, before the main command.
    fn prepare_command(&self, _instance: &Instance) -> Option<String> {
        None
    }

    /// The main command.
    fn run_command(&self, _instance: &Instance) -> Option<String> {
        None
    }

    /// A command run on the local host instead of the instance.
    fn local_command(&self, _instance: &Instance, _state: &State) -> Option<CommandRequest> {
        None
    }

    /// Disposes of the sandbox.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError::Sandbox`] when cleanup fails.
    fn cleanup_sandbox(&self, sandbox: Sandbox) -> Result<(), ActionError> {
        drop(sandbox);
        Ok(())
    }
}

/// Runs `stage` for `instance`: sandbox creation under the context's sandbox
/// lock, then install, init, upload, prepare, and run on the instance, then
/// any local command, then sandbox cleanup.
///
/// No connection is opened when the stage has nothing to run remotely.
///
/// # Errors
///
/// Returns the first [`ActionError`] raised by any step. The sandbox is
/// cleaned up either way.
pub async fn run_stage(
    instance: &Instance,
    state: &State,
    stage: &dyn Stage,
) -> Result<(), ActionError> {
    let span = info_span!("stage", stage = stage.name());
    async move {
        let sandbox = {
            let _guard = instance.context().lock_sandbox().await;
            stage.create_sandbox(instance)?
        };

        let result = run_steps(instance, state, stage, &sandbox).await;
        if let Err(err) = stage.cleanup_sandbox(sandbox) {
            warn!(error = %err, "failed to clean up sandbox");
        }
        result
    }
    .instrument(span)
    .await
}

async fn run_steps(
    instance: &Instance,
    state: &State,
    stage: &dyn Stage,
    sandbox: &Sandbox,
) -> Result<(), ActionError> {
    let entries = sandbox.entries()?;
    let before_upload: Vec<String> = [stage.install_command(instance), stage.init_command(instance)]
        .into_iter()
        .flatten()
        .collect();
    let after_upload: Vec<String> = [stage.prepare_command(instance), stage.run_command(instance)]
        .into_iter()
        .flatten()
        .collect();

    if !(before_upload.is_empty() && entries.is_empty() && after_upload.is_empty()) {
        let connection = instance.transport().connection(state).await?;
        for command in &before_upload {
            connection.execute(command).await?;
        }
        if !entries.is_empty() {
            debug!(files = entries.len(), root = stage.root_path(), "uploading sandbox");
            connection.upload(&entries, stage.root_path()).await?;
        }
        for command in &after_upload {
            connection.execute(command).await?;
        }
    }

    if let Some(request) = stage.local_command(instance, state) {
        run_local(request).await?;
    }
    Ok(())
}

async fn run_local(request: CommandRequest) -> Result<(), ActionError> {
    let command = std::iter::once(request.program.clone())
        .chain(
            request
                .args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        )
        .collect::<Vec<_>>()
        .join(" ");
    debug!(command, "running local command");
    let output = ProcessCommandRunner.run(request.streaming()).await?;
    if output.is_success() {
        return Ok(());
    }
    Err(ActionError::LocalCommand {
        command,
        status: output
            .code
            .map_or_else(|| "no exit status".to_owned(), |code| format!("exit code {code}")),
    })
}

/// Environment exported to local verifier commands.
#[must_use]
pub fn instance_env(instance: &Instance, state: &State) -> Vec<(String, String)> {
    let mut env = vec![
        ("GALLEY_INSTANCE_NAME".to_owned(), instance.name().to_owned()),
        ("GALLEY_SUITE_NAME".to_owned(), instance.suite().name().to_owned()),
        (
            "GALLEY_PLATFORM_NAME".to_owned(),
            instance.platform().name().to_owned(),
        ),
    ];
    for key in ["hostname", "port", "username"] {
        let value = state
            .get_str(key)
            .map(str::to_owned)
            .or_else(|| state.get_u64(key).map(|number| number.to_string()));
        if let Some(value) = value {
            env.push((format!("GALLEY_{}", key.to_uppercase()), value));
        }
    }
    env
}

/// Stage that does nothing, optionally failing on purpose.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DummyStage {
    /// Fail every run.
    pub fail: bool,
}

impl Stage for DummyStage {
    fn name(&self) -> &str {
        "dummy"
    }

    fn create_sandbox(&self, instance: &Instance) -> Result<Sandbox, ActionError> {
        if self.fail {
            return Err(ActionError::Failed(format!(
                "dummy stage failed on {} as configured",
                instance.name()
            )));
        }
        Sandbox::new(instance.name())
    }
}

/// Options accepted by the `shell` provisioner and verifier.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ShellOptions {
    /// Local script copied into the sandbox and run.
    pub script: Option<String>,
    /// Inline command run instead of a script.
    pub command: Option<String>,
    /// Remote root directory.
    pub root_path: Option<String>,
    /// Run on the instance rather than locally. Provisioners always run on
    /// the instance; verifiers default to the local host.
    pub remote_exec: Option<bool>,
}

/// Runs a script or an inline command.
///
/// Remotely, the script is uploaded with the suite's data directory and
/// run with `sh`. Locally, the command runs through `sh -c` with the
/// variables from [`instance_env`] exported.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ShellStage {
    options: ShellOptions,
    root_path: String,
    remote: bool,
}

impl ShellStage {
    /// Shell provisioner.
    #[must_use]
    pub fn provisioner(options: ShellOptions) -> Self {
        Self::build(options, true)
    }

    /// Shell verifier.
    #[must_use]
    pub fn verifier(options: ShellOptions) -> Self {
        let remote = options.remote_exec.unwrap_or(false);
        Self::build(options, remote)
    }

    fn build(options: ShellOptions, remote: bool) -> Self {
        let root_path = options
            .root_path
            .clone()
            .unwrap_or_else(|| DEFAULT_ROOT_PATH.to_owned());
        Self {
            options,
            root_path,
            remote,
        }
    }

    fn script(&self) -> Option<&Utf8Path> {
        self.options.script.as_deref().map(Utf8Path::new)
    }

    fn script_name(&self) -> Option<&str> {
        self.script().and_then(Utf8Path::file_name)
    }
}

impl Stage for ShellStage {
    fn name(&self) -> &str {
        "shell"
    }

    fn root_path(&self) -> &str {
        &self.root_path
    }

    fn create_sandbox(&self, instance: &Instance) -> Result<Sandbox, ActionError> {
        let sandbox = Sandbox::new(instance.name())?;
        if !self.remote {
            return Ok(sandbox);
        }
        if let (Some(script), Some(name)) = (self.script(), self.script_name()) {
            sandbox.copy_in(script, name)?;
        }
        if let Some(data) = instance.suite().data_path() {
            sandbox.copy_in(data, "data")?;
        }
        Ok(sandbox)
    }

    fn init_command(&self, _instance: &Instance) -> Option<String> {
        self.remote.then(|| {
            let root = shell_escape::unix::escape(self.root_path.as_str().into());
            format!("rm -rf {root} && mkdir -p {root}")
        })
    }

    fn run_command(&self, _instance: &Instance) -> Option<String> {
        if !self.remote {
            return None;
        }
        if let Some(name) = self.script_name() {
            let path = format!("{}/{name}", self.root_path);
            return Some(format!("sh {}", shell_escape::unix::escape(path.into())));
        }
        self.options.command.clone()
    }

    fn local_command(&self, instance: &Instance, state: &State) -> Option<CommandRequest> {
        if self.remote {
            return None;
        }
        let command = self
            .options
            .command
            .clone()
            .or_else(|| self.options.script.as_ref().map(|script| format!("sh {script}")))?;
        Some(
            CommandRequest::new("sh", vec![OsString::from("-c"), OsString::from(command)])
                .with_env(instance_env(instance, state)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tempfile::TempDir;

    use crate::driver::DummyDriver;
    use crate::test_support::{MemoryStateStore, ScriptedRunner, test_instance_with_stages};
    use crate::transport::CachedTransport;
    use crate::transport::exec::ExecAdapter;

    #[tokio::test]
    async fn remote_shell_stage_runs_steps_in_order() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let script = Utf8PathBuf::from_path_buf(tmp.path().join("bootstrap.sh"))
            .unwrap_or_else(|path| panic!("utf8: {}", path.display()));
        fs::write(&script, "echo hi").unwrap_or_else(|err| panic!("write: {err}"));
        let runner = ScriptedRunner::new();
        let stage = Arc::new(ShellStage::provisioner(ShellOptions {
            script: Some(script.into_string()),
            root_path: Some("/opt/galley".to_owned()),
            ..ShellOptions::default()
        }));
        let instance = test_instance_with_stages(
            Arc::new(DummyDriver::default()),
            Arc::new(CachedTransport::new(ExecAdapter::with_runner(Arc::new(
                runner.clone(),
            )))),
            stage.clone(),
            Arc::new(DummyStage::default()),
            Arc::new(MemoryStateStore::new()),
        );

        assert_eq!(
            stage.init_command(&instance).as_deref(),
            Some("rm -rf /opt/galley && mkdir -p /opt/galley")
        );
        assert_eq!(
            stage.run_command(&instance).as_deref(),
            Some("sh /opt/galley/bootstrap.sh")
        );

        let sandbox = stage
            .create_sandbox(&instance)
            .unwrap_or_else(|err| panic!("sandbox: {err}"));
        let names: Vec<String> = sandbox
            .entries()
            .unwrap_or_else(|err| panic!("entries: {err}"))
            .iter()
            .filter_map(|entry| entry.file_name().map(str::to_owned))
            .collect();
        assert_eq!(names, vec!["bootstrap.sh"]);
    }

    #[tokio::test]
    async fn stages_with_nothing_to_do_never_connect() {
        let runner = ScriptedRunner::new();
        let instance = test_instance_with_stages(
            Arc::new(DummyDriver::default()),
            Arc::new(CachedTransport::new(ExecAdapter::with_runner(Arc::new(
                runner.clone(),
            )))),
            Arc::new(DummyStage::default()),
            Arc::new(DummyStage::default()),
            Arc::new(MemoryStateStore::new()),
        );

        run_stage(&instance, &State::new(), instance.provisioner().as_ref())
            .await
            .unwrap_or_else(|err| panic!("stage: {err}"));

        assert!(runner.invocations().is_empty());
    }

    #[test]
    fn instance_env_exports_connection_fields() {
        let instance = crate::test_support::test_instance(
            Arc::new(DummyDriver::default()),
            Arc::new(MemoryStateStore::new()),
        );
        let mut state = State::new();
        state.set("hostname", "192.0.2.4");
        state.set("port", 2200);

        let env = instance_env(&instance, &state);

        assert!(env.contains(&("GALLEY_INSTANCE_NAME".to_owned(), "default-ubuntu".to_owned())));
        assert!(env.contains(&("GALLEY_HOSTNAME".to_owned(), "192.0.2.4".to_owned())));
        assert!(env.contains(&("GALLEY_PORT".to_owned(), "2200".to_owned())));
        assert!(!env.iter().any(|(key, _)| key == "GALLEY_USERNAME"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn local_verifier_sees_instance_variables() {
        let instance = crate::test_support::test_instance(
            Arc::new(DummyDriver::default()),
            Arc::new(MemoryStateStore::new()),
        );
        let mut state = State::new();
        state.set("hostname", "192.0.2.4");
        let verifier = ShellStage::verifier(ShellOptions {
            command: Some("test \"$GALLEY_HOSTNAME\" = 192.0.2.4".to_owned()),
            ..ShellOptions::default()
        });

        run_stage(&instance, &state, &verifier)
            .await
            .unwrap_or_else(|err| panic!("verifier: {err}"));

        state.set("hostname", "198.51.100.1");
        let err = run_stage(&instance, &state, &verifier)
            .await
            .expect_err("mismatch should fail");
        assert!(matches!(err, ActionError::LocalCommand { .. }));
    }
}
