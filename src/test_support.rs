//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use camino::Utf8PathBuf;
use tokio::sync::{Mutex, MutexGuard};
use zip::ZipArchive;

use crate::config::GalleyConfig;
use crate::context::Context;
use crate::driver::Driver;
use crate::instance::{Instance, InstanceParts};
use crate::lifecycle::Action;
use crate::matrix::{Platform, Suite};
use crate::stage::{DummyStage, Stage};
use crate::state::{State, StateError, StateStore};
use crate::transport::runner::{CommandOutput, CommandRequest, CommandRunner, RunnerFuture};
use crate::transport::winrm::transfer::hex_digest;
use crate::transport::winrm::transfer::scripts::{
    CHECK_COLUMNS, CHECK_MARKER, DECODE_COLUMNS, DECODE_MARKER, DecodeTarget, embedded_payload,
};
use crate::transport::winrm::{RemoteShell, ShellOutput, VERSION_PROBE_MARKER};
use crate::transport::exec::ExecAdapter;
use crate::transport::{CachedTransport, Transport, TransportError, TransportFuture};

fn locked<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<StdMutex<VecDeque<CommandOutput>>>,
    invocations: Arc<StdMutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Bytes fed to stdin, if any.
    pub input: Option<Vec<u8>>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        locked(&self.invocations).clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a specific exit code.
    pub fn push_exit_code(&self, code: i32) {
        self.push_output(Some(code), "", "");
    }

    /// Pushes a response with no exit code to simulate abnormal termination.
    pub fn push_missing_exit_code(&self) {
        self.push_output(None, "", "");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        locked(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, request: CommandRequest) -> RunnerFuture<'_> {
        locked(&self.invocations).push(CommandInvocation {
            program: request.program.clone(),
            args: request.args,
            input: request.input,
            env: request.env,
        });
        let response = locked(&self.responses).pop_front();
        Box::pin(async move {
            response.ok_or_else(|| TransportError::Spawn {
                program: request.program,
                message: String::from("no scripted response available"),
            })
        })
    }
}

/// In-memory [`StateStore`] that remembers every save.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    documents: StdMutex<BTreeMap<String, State>>,
    history: StdMutex<Vec<(String, Option<Action>)>>,
    reject_saves: AtomicBool,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a stored document.
    pub fn insert(&self, instance: &str, state: State) {
        locked(&self.documents).insert(instance.to_owned(), state);
    }

    /// Currently stored document for `instance`.
    #[must_use]
    pub fn document(&self, instance: &str) -> Option<State> {
        locked(&self.documents).get(instance).cloned()
    }

    /// Makes every later save fail with [`StateError::Io`].
    pub fn reject_saves(&self) {
        self.reject_saves.store(true, Ordering::SeqCst);
    }

    /// `last_action` recorded by each save, in order.
    #[must_use]
    pub fn history(&self) -> Vec<(String, Option<Action>)> {
        locked(&self.history).clone()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self, instance: &str) -> Result<State, StateError> {
        Ok(self.document(instance).unwrap_or_default())
    }

    fn save(&self, instance: &str, state: &State) -> Result<(), StateError> {
        if self.reject_saves.load(Ordering::SeqCst) {
            return Err(StateError::Io {
                path: Utf8PathBuf::from(format!("{instance}.json")),
                message: "store is read-only".to_owned(),
            });
        }
        locked(&self.history).push((instance.to_owned(), state.last_action()));
        locked(&self.documents).insert(instance.to_owned(), state.clone());
        Ok(())
    }

    fn destroy(&self, instance: &str) -> Result<(), StateError> {
        locked(&self.documents).remove(instance);
        Ok(())
    }

    fn exists(&self, instance: &str) -> Result<bool, StateError> {
        Ok(locked(&self.documents).contains_key(instance))
    }
}

/// Builds the `default-ubuntu` instance with an exec transport and dummy
/// stages.
///
/// # Panics
///
/// Panics if the fixed suite or platform fail to build.
#[must_use]
pub fn test_instance(driver: Arc<dyn Driver>, store: Arc<dyn StateStore>) -> Instance {
    test_instance_with_transport(driver, Arc::new(CachedTransport::new(ExecAdapter::new())), store)
}

/// Like [`test_instance`] with a caller-supplied transport.
///
/// # Panics
///
/// Panics if the fixed suite or platform fail to build.
#[must_use]
pub fn test_instance_with_transport(
    driver: Arc<dyn Driver>,
    transport: Arc<dyn Transport>,
    store: Arc<dyn StateStore>,
) -> Instance {
    test_instance_with_stages(
        driver,
        transport,
        Arc::new(DummyStage::default()),
        Arc::new(DummyStage::default()),
        store,
    )
}

/// Like [`test_instance_with_transport`] with caller-supplied stages.
///
/// # Panics
///
/// Panics if the fixed suite or platform fail to build.
#[must_use]
pub fn test_instance_with_stages(
    driver: Arc<dyn Driver>,
    transport: Arc<dyn Transport>,
    provisioner: Arc<dyn Stage>,
    verifier: Arc<dyn Stage>,
    store: Arc<dyn StateStore>,
) -> Instance {
    let suite = Suite::builder()
        .name("default")
        .run_list(Vec::<String>::new())
        .build()
        .unwrap_or_else(|err| panic!("suite: {err}"));
    let platform = Platform::builder()
        .name("ubuntu")
        .driver(driver)
        .build()
        .unwrap_or_else(|err| panic!("platform: {err}"));
    Instance::new(InstanceParts {
        suite: Arc::new(suite),
        platform: Arc::new(platform),
        transport,
        provisioner,
        verifier,
        store,
        context: Arc::new(Context::new(GalleyConfig::with_state_dir(".galley"))),
    })
}

/// Value `%TEMP%` expands to on [`FakeWindowsHost`].
pub const FAKE_TEMP: &str = r"C:\Temp";

#[derive(Debug, Default)]
struct HostState {
    next_shell: u32,
    open_shells: BTreeSet<String>,
    opened: usize,
    closed: usize,
    files: BTreeMap<String, Vec<u8>>,
    commands: Vec<String>,
    scripts: Vec<String>,
    failures: Vec<(String, i32)>,
}

/// In-memory Windows host behind the [`RemoteShell`] contract.
///
/// It understands the commands the WinRM executor and file transporter
/// issue: the OS version probe, the check and decode scripts, `type nul >`
/// truncation and `echo ... >>` appends. Other PowerShell scripts succeed.
/// Scripts matching a pattern registered through
/// [`Self::fail_scripts_containing`] fail before any of that runs.
#[derive(Debug)]
pub struct FakeWindowsHost {
    os_version: String,
    state: StdMutex<HostState>,
}

impl Default for FakeWindowsHost {
    fn default() -> Self {
        Self::with_os_version("10.0.17763")
    }
}

impl FakeWindowsHost {
    /// A modern host.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A host reporting `version` to the probe.
    #[must_use]
    pub fn with_os_version(version: &str) -> Self {
        Self {
            os_version: version.to_owned(),
            state: StdMutex::new(HostState::default()),
        }
    }

    /// Shells opened so far.
    #[must_use]
    pub fn shells_opened(&self) -> usize {
        locked(&self.state).opened
    }

    /// Shells closed so far.
    #[must_use]
    pub fn shells_closed(&self) -> usize {
        locked(&self.state).closed
    }

    /// Contents of `path`, with `%TEMP%` expanded.
    #[must_use]
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        locked(&self.state).files.get(&expand(path)).cloned()
    }

    /// Paths of every file on the host.
    #[must_use]
    pub fn file_names(&self) -> Vec<String> {
        locked(&self.state).files.keys().cloned().collect()
    }

    /// Overwrites `path` with `contents`.
    pub fn write_file(&self, path: &str, contents: impl Into<Vec<u8>>) {
        locked(&self.state)
            .files
            .insert(expand(path), contents.into());
    }

    /// `cmd` command lines received, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        locked(&self.state).commands.clone()
    }

    /// Decoded PowerShell scripts received, in order.
    #[must_use]
    pub fn scripts(&self) -> Vec<String> {
        locked(&self.state).scripts.clone()
    }

    /// Makes scripts containing `pattern` exit with `code`.
    pub fn fail_scripts_containing(&self, pattern: &str, code: i32) {
        locked(&self.state)
            .failures
            .push((pattern.to_owned(), code));
    }

    fn execute(&self, shell_id: &str, command: &str, args: &[String]) -> Result<ShellOutput, TransportError> {
        let mut state = locked(&self.state);
        if !state.open_shells.contains(shell_id) {
            return Err(TransportError::Protocol {
                endpoint: "fake".to_owned(),
                message: format!("shell {shell_id} is not open"),
            });
        }

        if command == "powershell" {
            let script = decode_script_arg(args)?;
            state.scripts.push(script.clone());
            return Ok(self.run_script(&mut state, &script));
        }

        let line = std::iter::once(command)
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        state.commands.push(line.clone());
        Ok(run_cmd_line(&mut state, &line))
    }

    fn run_script(&self, state: &mut HostState, script: &str) -> ShellOutput {
        if let Some((pattern, code)) = state
            .failures
            .iter()
            .find(|(pattern, _)| script.contains(pattern.as_str()))
        {
            return ShellOutput {
                exit_code: *code,
                stdout: String::new(),
                stderr: format!("script matched failure pattern `{pattern}`"),
            };
        }
        if script.starts_with(VERSION_PROBE_MARKER) {
            return success(format!("{}\r\n", self.os_version));
        }
        if script.starts_with(CHECK_MARKER) {
            return check_files(state, script);
        }
        if script.starts_with(DECODE_MARKER) {
            return decode_files(state, script);
        }
        success(String::new())
    }
}

impl RemoteShell for FakeWindowsHost {
    fn open(&self) -> TransportFuture<'_, String> {
        Box::pin(async move {
            let mut state = locked(&self.state);
            state.next_shell += 1;
            state.opened += 1;
            let id = format!("shell-{}", state.next_shell);
            state.open_shells.insert(id.clone());
            Ok(id)
        })
    }

    fn run<'a>(
        &'a self,
        shell_id: &'a str,
        command: &'a str,
        args: &'a [String],
    ) -> TransportFuture<'a, ShellOutput> {
        Box::pin(async move { self.execute(shell_id, command, args) })
    }

    fn close<'a>(&'a self, shell_id: &'a str) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let mut state = locked(&self.state);
            if state.open_shells.remove(shell_id) {
                state.closed += 1;
            }
            Ok(())
        })
    }
}

fn expand(path: &str) -> String {
    path.replace("%TEMP%", FAKE_TEMP)
}

fn success(stdout: String) -> ShellOutput {
    ShellOutput {
        exit_code: 0,
        stdout,
        stderr: String::new(),
    }
}

fn failure(stderr: String) -> ShellOutput {
    ShellOutput {
        exit_code: 1,
        stdout: String::new(),
        stderr,
    }
}

fn decode_script_arg(args: &[String]) -> Result<String, TransportError> {
    let protocol = |message: &str| TransportError::Protocol {
        endpoint: "fake".to_owned(),
        message: message.to_owned(),
    };
    let encoded = args
        .iter()
        .skip_while(|arg| arg.as_str() != "-EncodedCommand")
        .nth(1)
        .ok_or_else(|| protocol("powershell invoked without -EncodedCommand"))?;
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|_| protocol("encoded command is not base64"))?;
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .filter_map(|pair| match pair {
            [low, high] => Some(u16::from(*low) | (u16::from(*high) << 8)),
            _ => None,
        })
        .collect();
    String::from_utf16(&units).map_err(|_| protocol("encoded command is not UTF-16LE"))
}

fn run_cmd_line(state: &mut HostState, line: &str) -> ShellOutput {
    if let Some(rest) = line.split("type nul > ").nth(1) {
        let path = expand(rest.trim().trim_matches('"'));
        state.files.insert(path, Vec::new());
        return success(String::new());
    }
    if let Some(rest) = line.strip_prefix("echo ")
        && let Some((chunk, target)) = rest.split_once(" >> ")
    {
        let path = expand(target.trim().trim_matches('"'));
        let Some(file) = state.files.get_mut(&path) else {
            return failure(format!("The system cannot find the path specified: {path}"));
        };
        file.extend_from_slice(chunk.as_bytes());
        file.extend_from_slice(b"\r\n");
        return success(String::new());
    }
    success(String::new())
}

fn csv_line<'a>(fields: impl IntoIterator<Item = &'a str>) -> String {
    let quoted: Vec<String> = fields
        .into_iter()
        .map(|field| format!("\"{}\"", field.replace('"', "\"\"")))
        .collect();
    format!("{}\r\n", quoted.join(","))
}

fn ps_bool(value: bool) -> &'static str {
    if value { "True" } else { "False" }
}

fn check_files(state: &HostState, script: &str) -> ShellOutput {
    let Some(payload) = embedded_payload(script) else {
        return failure("check script carries no payload".to_owned());
    };
    let hashes: BTreeMap<String, String> = match serde_json::from_str(payload) {
        Ok(hashes) => hashes,
        Err(err) => return failure(format!("ConvertFrom-Json: {err}")),
    };

    let mut stdout = csv_line(CHECK_COLUMNS);
    for (dst, expected) in &hashes {
        let existing = state.files.get(&expand(dst));
        let dirty = existing.is_none_or(|contents| hex_digest(contents) != *expected);
        stdout.push_str(&csv_line([
            expected.as_str(),
            dst.as_str(),
            ps_bool(existing.is_some()),
            ps_bool(dirty),
            ps_bool(!dirty),
        ]));
    }
    success(stdout)
}

fn decode_files(state: &mut HostState, script: &str) -> ShellOutput {
    let Some(payload) = embedded_payload(script) else {
        return failure("decode script carries no payload".to_owned());
    };
    let files: BTreeMap<String, Vec<DecodeTarget>> = match serde_json::from_str(payload) {
        Ok(files) => files,
        Err(err) => return failure(format!("ConvertFrom-Json: {err}")),
    };

    let mut stdout = csv_line(DECODE_COLUMNS);
    for (tmp, targets) in &files {
        let Some(encoded) = state.files.remove(&expand(tmp)) else {
            return failure(format!("Could not find file '{}'", expand(tmp)));
        };
        let text: String = String::from_utf8_lossy(&encoded)
            .chars()
            .filter(|ch| !ch.is_whitespace())
            .collect();
        let bytes = match STANDARD.decode(text) {
            Ok(bytes) => bytes,
            Err(err) => return failure(format!("FromBase64String: {err}")),
        };
        let digest = hex_digest(&bytes);
        for target in targets {
            if let Some(root) = &target.target
                && let Err(message) = expand_archive(state, &bytes, &expand(root))
            {
                return failure(message);
            }
            state.files.insert(expand(&target.dst), bytes.clone());
            stdout.push_str(&csv_line([
                tmp.as_str(),
                target.dst.as_str(),
                target.target.as_deref().unwrap_or_default(),
                digest.as_str(),
            ]));
        }
    }
    success(stdout)
}

fn expand_archive(state: &mut HostState, bytes: &[u8], root: &str) -> Result<(), String> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(|err| err.to_string())?;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(|err| err.to_string())?;
        if entry.is_dir() {
            continue;
        }
        let mut contents = Vec::new();
        entry
            .read_to_end(&mut contents)
            .map_err(|err| err.to_string())?;
        let path = format!("{root}\\{}", entry.name().replace('/', "\\"));
        state.files.insert(path, contents);
    }
    Ok(())
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            previous.push(((*key).to_owned(), env::var_os(key)));
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`.
            unsafe { env::set_var(key, value) };
        }
        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in self.previous.iter().rev() {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(value) => env::set_var(key, value),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
