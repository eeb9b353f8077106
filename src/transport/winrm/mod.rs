//! WinRM-class adapter: a WS-Management `cmd` shell reused across commands,
//! with PowerShell scripts and chunked, digest-checked uploads on top.

mod executor;
mod shell;
mod soap;
pub mod transfer;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::retry::{RetryPolicy, retry};
use super::{Connection, LoginCommand, ProtocolAdapter, TransportError, TransportFuture};
use crate::state::State;

pub use executor::{
    COMMAND_SAFETY_MARGIN, CommandExecutor, LEGACY_MAX_COMMANDS, MODERN_MAX_COMMANDS,
    VERSION_PROBE_MARKER, encode_powershell, max_commands_for,
};
pub use shell::{RemoteShell, ShellOutput};
pub use soap::{SoapEndpoint, SoapShell};
pub use transfer::{FileTransporter, TransferEntry, TransferReport};

const HTTP_PORT: u16 = 5985;
const HTTPS_PORT: u16 = 5986;

/// Options accepted by the `winrm` transport.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WinRmOptions {
    /// Login user when state does not name one.
    pub username: String,
    /// Password when state does not carry one.
    pub password: Option<String>,
    /// Port when state does not name one. Defaults to 5985, or 5986 with
    /// `ssl`.
    pub port: Option<u16>,
    /// Talk HTTPS instead of HTTP.
    pub ssl: bool,
    /// WS-Management operation timeout in seconds.
    pub operation_timeout: u64,
    /// Attempts made while establishing a connection.
    pub connection_retries: u32,
    /// Seconds slept between attempts.
    pub connection_retry_sleep: u64,
    /// Attempts made while waiting for readiness.
    pub max_wait_until_ready: u32,
    /// Remote desktop client used by `login`.
    pub rdp_client: String,
    /// Remote desktop port used by `login`.
    pub rdp_port: u16,
}

impl Default for WinRmOptions {
    fn default() -> Self {
        Self {
            username: "administrator".to_owned(),
            password: None,
            port: None,
            ssl: false,
            operation_timeout: 60,
            connection_retries: 5,
            connection_retry_sleep: 1,
            max_wait_until_ready: 600,
            rdp_client: "xfreerdp".to_owned(),
            rdp_port: 3389,
        }
    }
}

impl WinRmOptions {
    fn default_port(&self) -> u16 {
        self.port
            .unwrap_or(if self.ssl { HTTPS_PORT } else { HTTP_PORT })
    }

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
}

/// Connection details that decide whether a WinRM shell can be reused.
#[derive(Clone, Eq, PartialEq)]
pub struct WinRmFingerprint {
    /// Remote host name or address.
    pub hostname: String,
    /// WS-Management port.
    pub port: u16,
    /// Login user.
    pub username: String,
    /// Login password.
    pub password: String,
    /// HTTPS endpoint.
    pub ssl: bool,
}

impl WinRmFingerprint {
    /// `http(s)://host:port/wsman`.
    #[must_use]
    pub fn url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{scheme}://{}:{}/wsman", self.hostname, self.port)
    }
}

impl fmt::Debug for WinRmFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WinRmFingerprint")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("ssl", &self.ssl)
            .finish()
    }
}

/// Builds the remote shell for a fingerprint.
pub type ShellFactory = Arc<
    dyn Fn(&WinRmFingerprint, &WinRmOptions) -> Result<Arc<dyn RemoteShell>, TransportError>
        + Send
        + Sync,
>;

/// Adapter producing [`WinRmConnection`]s.
#[derive(Clone)]
pub struct WinRmAdapter {
    options: Arc<WinRmOptions>,
    shells: ShellFactory,
}

impl WinRmAdapter {
    /// Creates an adapter that talks SOAP to the instance's endpoint.
    #[must_use]
    pub fn new(options: WinRmOptions) -> Self {
        Self::with_shell_factory(options, Arc::new(soap_shell))
    }

    /// Creates an adapter with a custom shell factory.
    #[must_use]
    pub fn with_shell_factory(options: WinRmOptions, shells: ShellFactory) -> Self {
        Self {
            options: Arc::new(options),
            shells,
        }
    }

    /// Options in effect for new connections.
    #[must_use]
    pub fn options(&self) -> &WinRmOptions {
        &self.options
    }
}

impl fmt::Debug for WinRmAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WinRmAdapter")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

fn soap_shell(
    fingerprint: &WinRmFingerprint,
    options: &WinRmOptions,
) -> Result<Arc<dyn RemoteShell>, TransportError> {
    let shell = SoapShell::new(SoapEndpoint {
        url: fingerprint.url(),
        username: fingerprint.username.clone(),
        password: fingerprint.password.clone(),
        operation_timeout: Duration::from_secs(options.operation_timeout),
    })?;
    Ok(Arc::new(shell))
}

impl ProtocolAdapter for WinRmAdapter {
    type Fingerprint = WinRmFingerprint;

    fn name(&self) -> &'static str {
        "winrm"
    }

    fn fingerprint(&self, state: &State) -> Result<WinRmFingerprint, TransportError> {
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
            None => self.options.default_port(),
        };
        let username = state
            .get_str("username")
            .map_or_else(|| self.options.username.clone(), str::to_owned);
        let password = state
            .get_str("password")
            .map(str::to_owned)
            .or_else(|| self.options.password.clone())
            .ok_or_else(|| TransportError::Config {
                message: "winrm needs a password in instance state or transport options"
                    .to_owned(),
            })?;

        Ok(WinRmFingerprint {
            hostname,
            port,
            username,
            password,
            ssl: self.options.ssl,
        })
    }

    fn connect<'a>(
        &'a self,
        fingerprint: &'a WinRmFingerprint,
    ) -> TransportFuture<'a, Arc<dyn Connection>> {
        Box::pin(async move {
            let shell = (self.shells)(fingerprint, &self.options)?;
            let connection = WinRmConnection {
                fingerprint: fingerprint.clone(),
                options: Arc::clone(&self.options),
                executor: CommandExecutor::new(shell),
            };

            info!(endpoint = %fingerprint.url(), "establishing winrm connection");
            retry(self.options.connection_policy(), "winrm login", |_| {
                connection.executor.open()
            })
            .await?;

            let shared: Arc<dyn Connection> = Arc::new(connection);
            Ok(shared)
        })
    }

    fn login_command(&self, fingerprint: &WinRmFingerprint) -> Result<LoginCommand, TransportError> {
        Ok(login_command(&self.options, fingerprint))
    }
}

/// A WinRM session backed by one recycled remote shell.
#[derive(Debug)]
pub struct WinRmConnection {
    fingerprint: WinRmFingerprint,
    options: Arc<WinRmOptions>,
    executor: CommandExecutor,
}

impl WinRmConnection {
    /// Executor running this connection's commands.
    #[must_use]
    pub const fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    /// Uploads `locals` and returns the per-entry summary.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Transfer`] when any transfer phase fails.
    pub async fn upload_with_report(
        &self,
        locals: &[Utf8PathBuf],
        remote: &str,
    ) -> Result<TransferReport, TransportError> {
        FileTransporter::new(&self.executor).upload(locals, remote).await
    }

    async fn probe(&self) -> Result<(), TransportError> {
        self.executor.open().await?;
        let output = self
            .executor
            .run_powershell_script("Write-Host '[galley] established'")
            .await?;
        if output.is_success() {
            Ok(())
        } else {
            Err(TransportError::command_failed(Some(output.exit_code), "readiness probe"))
        }
    }
}

impl Connection for WinRmConnection {
    fn execute<'a>(&'a self, command: &'a str) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            if command.trim().is_empty() {
                return Ok(());
            }
            debug!(endpoint = %self.fingerprint.url(), command, "running remote command");
            let output = self.executor.run_powershell_script(command).await?;
            for line in output.stdout.lines() {
                info!(target: "galley::remote", "{line}");
            }
            for line in output.stderr.lines() {
                warn!(target: "galley::remote", "{line}");
            }
            if output.is_success() {
                Ok(())
            } else {
                Err(TransportError::command_failed(Some(output.exit_code), command))
            }
        })
    }

    fn upload<'a>(
        &'a self,
        locals: &'a [Utf8PathBuf],
        remote: &'a str,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let report = self.upload_with_report(locals, remote).await?;
            debug!(
                endpoint = %self.fingerprint.url(),
                skipped = report.entries.len() - report.dirty_count(),
                "upload finished"
            );
            Ok(())
        })
    }

    fn wait_until_ready(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            retry(self.options.readiness_policy(), "winrm readiness", |_| {
                self.probe()
            })
            .await
        })
    }

    fn close(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move { self.executor.close().await })
    }

    fn login_command(&self) -> Result<LoginCommand, TransportError> {
        Ok(login_command(&self.options, &self.fingerprint))
    }
}

fn login_command(options: &WinRmOptions, fingerprint: &WinRmFingerprint) -> LoginCommand {
    LoginCommand {
        program: options.rdp_client.clone(),
        args: vec![
            format!("/v:{}:{}", fingerprint.hostname, options.rdp_port),
            format!("/u:{}", fingerprint.username),
        ],
    }
}
