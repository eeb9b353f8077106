//! Command executor that reuses one remote shell and recycles it before the
//! server-side command quota runs out.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::shell::{RemoteShell, ShellOutput};
use crate::transport::TransportError;

/// Command ceiling for hosts older than Windows 6.2.
pub const LEGACY_MAX_COMMANDS: u32 = 15;

/// Command ceiling for Windows 6.2 and newer.
pub const MODERN_MAX_COMMANDS: u32 = 1500;

/// Commands kept in reserve below the server ceiling.
pub const COMMAND_SAFETY_MARGIN: u32 = 2;

/// Marker on the first line of the version probe script.
pub const VERSION_PROBE_MARKER: &str = "# galley:os-version";

/// Usable command budget for a host reporting `version`.
///
/// Unparseable versions get the legacy budget.
#[must_use]
pub fn max_commands_for(version: &str) -> u32 {
    let mut parts = version.trim().split('.').map(str::parse::<u32>);
    let ceiling = match (parts.next(), parts.next()) {
        (Some(Ok(major)), Some(Ok(minor))) if (major, minor) >= (6, 2) => MODERN_MAX_COMMANDS,
        _ => LEGACY_MAX_COMMANDS,
    };
    ceiling - COMMAND_SAFETY_MARGIN
}

/// Encodes `script` as UTF-16LE Base64 for `powershell -EncodedCommand`.
#[must_use]
pub fn encode_powershell(script: &str) -> String {
    let bytes: Vec<u8> = script
        .encode_utf16()
        .flat_map(u16::to_le_bytes)
        .collect();
    STANDARD.encode(bytes)
}

#[derive(Debug, Default)]
struct Session {
    shell_id: Option<String>,
    command_count: u32,
    max_commands: Option<u32>,
}

/// Runs commands through a single reusable shell.
#[derive(Debug)]
pub struct CommandExecutor {
    shell: Arc<dyn RemoteShell>,
    session: Mutex<Session>,
}

impl CommandExecutor {
    /// Wraps `shell`; nothing is opened until [`Self::open`].
    #[must_use]
    pub fn new(shell: Arc<dyn RemoteShell>) -> Self {
        Self {
            shell,
            session: Mutex::new(Session::default()),
        }
    }

    /// Opens the shell and, on first use, probes the OS version to size the
    /// command budget. Calling it again on an open executor is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the shell error when opening or probing fails.
    pub async fn open(&self) -> Result<(), TransportError> {
        let mut session = self.session.lock().await;
        if session.shell_id.is_none() {
            let shell_id = self.shell.open().await?;
            session.shell_id = Some(shell_id);
            session.command_count = 0;
        }
        if session.max_commands.is_none() {
            let probe = format!(
                "{VERSION_PROBE_MARKER}\n[Environment]::OSVersion.Version.ToString()"
            );
            let output = self
                .run_locked(&mut session, "powershell", &powershell_args(&probe))
                .await?;
            let budget = max_commands_for(&output.stdout);
            debug!(version = output.stdout.trim(), max_commands = budget, "sized WinRM command budget");
            session.max_commands = Some(budget);
        }
        Ok(())
    }

    /// Runs a `cmd` command line.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Usage`] before [`Self::open`], otherwise the
    /// shell error.
    pub async fn run_cmd(&self, command: &str, args: &[String]) -> Result<ShellOutput, TransportError> {
        let mut session = self.session.lock().await;
        self.run_locked(&mut session, command, args).await
    }

    /// Runs a PowerShell script via `-EncodedCommand`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Usage`] before [`Self::open`], otherwise the
    /// shell error.
    pub async fn run_powershell_script(&self, script: &str) -> Result<ShellOutput, TransportError> {
        self.run_cmd("powershell", &powershell_args(script)).await
    }

    /// Commands run on the current shell.
    pub async fn command_count(&self) -> u32 {
        self.session.lock().await.command_count
    }

    /// Command budget, once probed.
    pub async fn max_commands(&self) -> Option<u32> {
        self.session.lock().await.max_commands
    }

    /// Closes the shell if open. Safe to call repeatedly.
    ///
    /// # Errors
    ///
    /// Returns the shell error when the close request fails.
    pub async fn close(&self) -> Result<(), TransportError> {
        let shell_id = self.session.lock().await.shell_id.take();
        if let Some(shell_id) = shell_id {
            self.shell.close(&shell_id).await?;
        }
        Ok(())
    }

    async fn run_locked(
        &self,
        session: &mut Session,
        command: &str,
        args: &[String],
    ) -> Result<ShellOutput, TransportError> {
        if session.shell_id.is_none() {
            return Err(TransportError::Usage(
                "WinRM command issued before the shell was opened".to_owned(),
            ));
        }

        if let Some(max) = session.max_commands
            && session.command_count + 1 > max
        {
            self.reset(session).await?;
        }

        let shell_id = session.shell_id.clone().unwrap_or_default();
        let output = self.shell.run(&shell_id, command, args).await?;
        session.command_count += 1;
        Ok(output)
    }

    async fn reset(&self, session: &mut Session) -> Result<(), TransportError> {
        debug!(
            command_count = session.command_count,
            "command budget reached, recycling WinRM shell"
        );
        if let Some(previous) = session.shell_id.take()
            && let Err(err) = self.shell.close(&previous).await
        {
            warn!(error = %err, "failed to close exhausted WinRM shell");
        }
        session.shell_id = Some(self.shell.open().await?);
        session.command_count = 0;
        Ok(())
    }
}

fn powershell_args(script: &str) -> Vec<String> {
    [
        "-NoProfile",
        "-NonInteractive",
        "-ExecutionPolicy",
        "Bypass",
        "-EncodedCommand",
    ]
    .into_iter()
    .map(str::to_owned)
    .chain(std::iter::once(encode_powershell(script)))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeWindowsHost;
    use rstest::rstest;

    #[rstest]
    #[case("6.1.7601", LEGACY_MAX_COMMANDS - COMMAND_SAFETY_MARGIN)]
    #[case("6.2.9200", MODERN_MAX_COMMANDS - COMMAND_SAFETY_MARGIN)]
    #[case("10.0.17763.0\r\n", MODERN_MAX_COMMANDS - COMMAND_SAFETY_MARGIN)]
    #[case("garbage", LEGACY_MAX_COMMANDS - COMMAND_SAFETY_MARGIN)]
    fn budget_depends_on_os_version(#[case] version: &str, #[case] expected: u32) {
        assert_eq!(max_commands_for(version), expected);
    }

    #[test]
    fn powershell_encoding_is_utf16le_base64() {
        assert_eq!(encode_powershell("dir"), "ZABpAHIA");
    }

    #[tokio::test]
    async fn commands_before_open_are_usage_errors() {
        let executor = CommandExecutor::new(Arc::new(FakeWindowsHost::new()));

        let cmd = executor.run_cmd("dir", &[]).await.expect_err("not open");
        let ps = executor
            .run_powershell_script("Get-Date")
            .await
            .expect_err("not open");

        assert!(matches!(cmd, TransportError::Usage(_)));
        assert!(matches!(ps, TransportError::Usage(_)));
    }

    #[tokio::test]
    async fn shell_is_recycled_exactly_once_past_the_budget() {
        let host = Arc::new(FakeWindowsHost::with_os_version("6.1.7601"));
        let executor = CommandExecutor::new(host.clone());
        executor
            .open()
            .await
            .unwrap_or_else(|err| panic!("open: {err}"));
        let budget = executor.max_commands().await.unwrap_or_default();
        assert_eq!(budget, 13);

        // The version probe already used one command.
        for _ in 1..budget {
            executor
                .run_cmd("echo ok", &[])
                .await
                .unwrap_or_else(|err| panic!("run: {err}"));
        }
        assert_eq!(host.shells_opened(), 1);

        let output = executor
            .run_cmd("echo ok", &[])
            .await
            .unwrap_or_else(|err| panic!("run past budget: {err}"));

        assert!(output.is_success());
        assert_eq!(host.shells_opened(), 2);
        assert_eq!(host.shells_closed(), 1);
        assert_eq!(executor.command_count().await, 1);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let host = Arc::new(FakeWindowsHost::new());
        let executor = CommandExecutor::new(host.clone());
        executor
            .open()
            .await
            .unwrap_or_else(|err| panic!("open: {err}"));

        executor.close().await.unwrap_or_else(|err| panic!("close: {err}"));
        executor
            .close()
            .await
            .unwrap_or_else(|err| panic!("second close: {err}"));

        assert_eq!(host.shells_closed(), 1);
    }
}
