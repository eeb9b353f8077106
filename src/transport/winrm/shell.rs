//! Remote shell contract used by the WinRM command executor.

use std::fmt;

use super::super::TransportFuture;

/// Captured result of one remote shell command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ShellOutput {
    /// Exit code reported by the remote process.
    pub exit_code: i32,
    /// Decoded standard output.
    pub stdout: String,
    /// Decoded standard error.
    pub stderr: String,
}

impl ShellOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A remote command shell: open, run commands in it, close it.
///
/// The SOAP client implements this against a live endpoint; tests substitute
/// an in-memory host.
pub trait RemoteShell: Send + Sync + fmt::Debug {
    /// Opens a new shell and returns its identifier.
    fn open(&self) -> TransportFuture<'_, String>;

    /// Runs `command` with `args` inside the shell and waits for it to finish.
    fn run<'a>(
        &'a self,
        shell_id: &'a str,
        command: &'a str,
        args: &'a [String],
    ) -> TransportFuture<'a, ShellOutput>;

    /// Closes the shell.
    fn close<'a>(&'a self, shell_id: &'a str) -> TransportFuture<'a, ()>;
}
