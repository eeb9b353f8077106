//! SSH-class adapter built on the system OpenSSH client.
//!
//! Every connection owns a control master socket so repeated commands reuse
//! one authenticated session. Establishment probes the host with `true`
//! inside the shared retry loop; ssh reports its own failures with exit
//! status 255, which is classified by stderr into connection-class errors.

mod archive;
mod scp;

use std::ffi::OsString;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use shell_escape::unix::escape;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::retry::{RetryPolicy, retry};
use super::runner::{CommandOutput, CommandRequest, CommandRunner, ProcessCommandRunner};
use super::{
    Connection, ConnectionErrorKind, LoginCommand, ProtocolAdapter, TransportError,
    TransportFuture,
};
use crate::state::State;

/// Exit status ssh uses for its own failures.
const SSH_FAILURE: i32 = 255;

/// How uploads are shipped to the remote host.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum UploadMode {
    /// One SCP sink stream per local path.
    #[default]
    Scp,
    /// One gzip tar stream for everything, falling back to SCP on failure.
    Tar,
}

/// Options accepted by the `ssh` transport.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SshOptions {
    /// Path to the `ssh` executable.
    pub ssh_bin: String,
    /// Login user when state does not name one.
    pub username: String,
    /// Port when state does not name one.
    pub port: u16,
    /// Identity file when state does not name one.
    pub ssh_key: Option<String>,
    /// Forward the local agent.
    pub forward_agent: bool,
    /// `ConnectTimeout` in seconds.
    pub connection_timeout: u64,
    /// `ServerAliveInterval` in seconds.
    pub keepalive_interval: u64,
    /// `ControlPersist` in seconds.
    pub control_persist: u64,
    /// Attempts made while establishing a connection.
    pub connection_retries: u32,
    /// Seconds slept between establishment attempts.
    pub connection_retry_sleep: u64,
    /// Attempts made while waiting for readiness.
    pub max_wait_until_ready: u32,
    /// Upload strategy.
    pub compression: UploadMode,
    /// Directory for control master sockets. Defaults to the temp directory.
    pub control_dir: Option<String>,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            ssh_bin: "ssh".to_owned(),
            username: "root".to_owned(),
            port: 22,
            ssh_key: None,
            forward_agent: false,
            connection_timeout: 15,
            keepalive_interval: 60,
            control_persist: 60,
            connection_retries: 5,
            connection_retry_sleep: 1,
            max_wait_until_ready: 600,
            compression: UploadMode::Scp,
            control_dir: None,
        }
    }
}

impl SshOptions {
    fn connection_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.connection_retries,
            Duration::from_secs(self.connection_retry_sleep),
        )
    }

    fn readiness_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_wait_until_ready,
            Duration::from_secs(self.connection_retry_sleep),
        )
    }

    fn control_dir(&self) -> Utf8PathBuf {
        self.control_dir.as_ref().map_or_else(
            || {
                Utf8PathBuf::from_path_buf(std::env::temp_dir())
                    .unwrap_or_else(|_| Utf8PathBuf::from("/tmp"))
            },
            Utf8PathBuf::from,
        )
    }
}

/// Connection details that decide whether an SSH session can be reused.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshFingerprint {
    /// Remote host name or address.
    pub hostname: String,
    /// Remote port.
    pub port: u16,
    /// Login user.
    pub username: String,
    /// Identity file, if any.
    pub ssh_key: Option<String>,
}

impl SshFingerprint {
    fn destination(&self) -> String {
        format!("{}@{}", self.username, self.hostname)
    }

    fn endpoint(&self) -> String {
        format!("{}@{}:{}", self.username, self.hostname, self.port)
    }
}

/// Adapter producing [`SshConnection`]s.
#[derive(Clone, Debug)]
pub struct SshAdapter {
    options: Arc<SshOptions>,
    runner: Arc<dyn CommandRunner>,
}

impl SshAdapter {
    /// Creates an adapter that shells out to the system `ssh`.
    #[must_use]
    pub fn new(options: SshOptions) -> Self {
        Self::with_runner(options, Arc::new(ProcessCommandRunner))
    }

    /// Creates an adapter with a custom command runner.
    #[must_use]
    pub fn with_runner(options: SshOptions, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            options: Arc::new(options),
            runner,
        }
    }

    /// Options in effect for new connections.
    #[must_use]
    pub fn options(&self) -> &SshOptions {
        &self.options
    }
}

impl ProtocolAdapter for SshAdapter {
    type Fingerprint = SshFingerprint;

    fn name(&self) -> &'static str {
        "ssh"
    }

    fn fingerprint(&self, state: &State) -> Result<SshFingerprint, TransportError> {
        let hostname = state
            .get_str("hostname")
            .ok_or_else(|| TransportError::Config {
                message: "instance state has no hostname; has the instance been created?"
                    .to_owned(),
            })?
            .to_owned();
        let port = match state.get_u64("port") {
            Some(port) => u16::try_from(port).map_err(|_| TransportError::Config {
                message: format!("port {port} is out of range"),
            })?,
            None => self.options.port,
        };
        let username = state
            .get_str("username")
            .map_or_else(|| self.options.username.clone(), str::to_owned);
        let ssh_key = state
            .get_str("ssh_key")
            .map(str::to_owned)
            .or_else(|| self.options.ssh_key.clone());

        Ok(SshFingerprint {
            hostname,
            port,
            username,
            ssh_key,
        })
    }

    fn connect<'a>(
        &'a self,
        fingerprint: &'a SshFingerprint,
    ) -> TransportFuture<'a, Arc<dyn Connection>> {
        Box::pin(async move {
            let control_path = self
                .options
                .control_dir()
                .join(format!("galley-{}", Uuid::new_v4().simple()));
            let connection = SshConnection {
                fingerprint: fingerprint.clone(),
                options: Arc::clone(&self.options),
                runner: Arc::clone(&self.runner),
                control_path,
                closed: AtomicBool::new(false),
            };

            info!(endpoint = %fingerprint.endpoint(), "establishing ssh connection");
            retry(self.options.connection_policy(), "ssh login", |_| {
                connection.probe()
            })
            .await?;

            let shared: Arc<dyn Connection> = Arc::new(connection);
            Ok(shared)
        })
    }

    fn login_command(&self, fingerprint: &SshFingerprint) -> Result<LoginCommand, TransportError> {
        Ok(login_command(&self.options, fingerprint))
    }
}

/// An SSH session multiplexed over a control master.
#[derive(Debug)]
pub struct SshConnection {
    fingerprint: SshFingerprint,
    options: Arc<SshOptions>,
    runner: Arc<dyn CommandRunner>,
    control_path: Utf8PathBuf,
    closed: AtomicBool,
}

impl SshConnection {
    /// Path of the control master socket.
    #[must_use]
    pub fn control_path(&self) -> &Utf8Path {
        &self.control_path
    }

    fn base_args(&self) -> Vec<OsString> {
        let mut args = identity_args(&self.options, &self.fingerprint);
        for option in [
            "BatchMode=yes".to_owned(),
            format!("ConnectTimeout={}", self.options.connection_timeout),
            format!("ServerAliveInterval={}", self.options.keepalive_interval),
            "ControlMaster=auto".to_owned(),
            format!("ControlPath={}", self.control_path),
            format!("ControlPersist={}", self.options.control_persist),
        ] {
            args.push(OsString::from("-o"));
            args.push(OsString::from(option));
        }
        args
    }

    fn request(&self, remote_command: &str, tty: bool) -> CommandRequest {
        let mut args = self.base_args();
        if tty {
            args.push(OsString::from("-tt"));
        }
        args.push(OsString::from(self.fingerprint.destination()));
        args.push(OsString::from(remote_command));
        CommandRequest::new(self.options.ssh_bin.clone(), args)
    }

    async fn probe(&self) -> Result<(), TransportError> {
        let output = self.runner.run(self.request("true", false)).await?;
        self.check(&output, "true")
    }

    fn check(&self, output: &CommandOutput, command: &str) -> Result<(), TransportError> {
        match output.code {
            Some(0) => Ok(()),
            Some(SSH_FAILURE) => Err(self.classify_failure(output, command)),
            code => Err(TransportError::command_failed(code, command)),
        }
    }

    fn classify_failure(&self, output: &CommandOutput, command: &str) -> TransportError {
        ConnectionErrorKind::classify(&output.stderr).map_or_else(
            || TransportError::command_failed(Some(SSH_FAILURE), command),
            |kind| TransportError::Connection {
                kind,
                endpoint: self.fingerprint.endpoint(),
                message: output.stderr.trim().to_owned(),
            },
        )
    }

    async fn upload_scp(&self, locals: &[Utf8PathBuf], remote: &str) -> Result<(), TransportError> {
        for local in locals {
            let name = local
                .file_name()
                .ok_or_else(|| TransportError::Transfer {
                    message: format!("cannot upload {local}: path has no file name"),
                })?
                .to_owned();
            let source = local.clone();
            let (recursive, stream) = blocking(move || {
                let recursive = scp::needs_recursion(&source)?;
                let stream = scp::scp_stream(&source, &name)?;
                Ok((recursive, stream))
            })
            .await?;

            let sink = format!(
                "scp {}-t {}",
                if recursive { "-r " } else { "" },
                escape(remote.into())
            );
            debug!(local = %local, remote, bytes = stream.len(), "streaming scp upload");
            let output = self
                .runner
                .run(self.request(&sink, false).with_input(stream))
                .await?;
            self.check_transfer(&output, &sink)?;
        }
        Ok(())
    }

    async fn upload_tar(&self, locals: &[Utf8PathBuf], remote: &str) -> Result<(), TransportError> {
        let owned = locals.to_vec();
        let bundle = blocking(move || archive::pack(&owned)).await?;
        let command = format!("tar -xzf - -C {}", escape(remote.into()));
        debug!(remote, bytes = bundle.len(), "streaming tar upload");
        let output = self
            .runner
            .run(self.request(&command, false).with_input(bundle))
            .await?;
        self.check_transfer(&output, &command)
    }

    fn check_transfer(&self, output: &CommandOutput, command: &str) -> Result<(), TransportError> {
        match output.code {
            Some(0) => Ok(()),
            Some(SSH_FAILURE) if ConnectionErrorKind::classify(&output.stderr).is_some() => {
                Err(self.classify_failure(output, command))
            }
            _ => {
                let detail = [output.stderr.trim(), output.stdout.trim_matches(['\0', '\n', ' '])]
                    .into_iter()
                    .filter(|text| !text.is_empty())
                    .collect::<Vec<_>>()
                    .join(": ");
                Err(TransportError::Transfer {
                    message: format!("`{command}` failed: {detail}"),
                })
            }
        }
    }
}

impl Connection for SshConnection {
    fn execute<'a>(&'a self, command: &'a str) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            if command.trim().is_empty() {
                return Ok(());
            }
            debug!(endpoint = %self.fingerprint.endpoint(), command, "running remote command");
            let output = self.runner.run(self.request(command, true).streaming()).await?;
            self.check(&output, command)
        })
    }

    fn upload<'a>(
        &'a self,
        locals: &'a [Utf8PathBuf],
        remote: &'a str,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let mkdir = format!("mkdir -p {}", escape(remote.into()));
            let output = self.runner.run(self.request(&mkdir, false)).await?;
            self.check(&output, &mkdir)?;

            match self.options.compression {
                UploadMode::Scp => self.upload_scp(locals, remote).await,
                UploadMode::Tar => match self.upload_tar(locals, remote).await {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        warn!(error = %err, "tar upload failed, falling back to scp");
                        self.upload_scp(locals, remote).await
                    }
                },
            }
        })
    }

    fn wait_until_ready(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            retry(self.options.readiness_policy(), "ssh readiness", |_| {
                self.probe()
            })
            .await
        })
    }

    fn close(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            let args = vec![
                OsString::from("-o"),
                OsString::from(format!("ControlPath={}", self.control_path)),
                OsString::from("-O"),
                OsString::from("exit"),
                OsString::from(self.fingerprint.destination()),
            ];
            let request = CommandRequest::new(self.options.ssh_bin.clone(), args);
            match self.runner.run(request).await {
                Ok(output) if output.is_success() => {
                    debug!(endpoint = %self.fingerprint.endpoint(), "closed ssh control master");
                }
                Ok(output) => debug!(
                    endpoint = %self.fingerprint.endpoint(),
                    stderr = output.stderr.trim(),
                    "control master already gone"
                ),
                Err(err) => debug!(error = %err, "failed to stop control master"),
            }
            Ok(())
        })
    }

    fn login_command(&self) -> Result<LoginCommand, TransportError> {
        Ok(login_command(&self.options, &self.fingerprint))
    }
}

fn identity_args(options: &SshOptions, fingerprint: &SshFingerprint) -> Vec<OsString> {
    let mut args = vec![
        OsString::from("-p"),
        OsString::from(fingerprint.port.to_string()),
    ];
    for option in [
        "UserKnownHostsFile=/dev/null",
        "StrictHostKeyChecking=no",
        "LogLevel=ERROR",
    ] {
        args.push(OsString::from("-o"));
        args.push(OsString::from(option));
    }
    if let Some(key) = &fingerprint.ssh_key {
        args.push(OsString::from("-o"));
        args.push(OsString::from("IdentitiesOnly=yes"));
        args.push(OsString::from("-i"));
        args.push(OsString::from(expand_tilde(key)));
    }
    if options.forward_agent {
        args.push(OsString::from("-A"));
    }
    args
}

fn login_command(options: &SshOptions, fingerprint: &SshFingerprint) -> LoginCommand {
    let mut args: Vec<String> = identity_args(options, fingerprint)
        .into_iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    args.push(fingerprint.destination());
    LoginCommand {
        program: options.ssh_bin.clone(),
        args,
    }
}

/// Expands a leading `~/` prefix to the user's home directory.
///
/// The input is returned unchanged when `HOME` is not set.
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

async fn blocking<T, F>(work: F) -> Result<T, TransportError>
where
    F: FnOnce() -> Result<T, TransportError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| TransportError::Transfer {
            message: format!("packing task failed: {err}"),
        })?
}

#[cfg(test)]
mod tests;
