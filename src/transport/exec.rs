//! Local exec adapter: runs commands on the host running galley.

use std::ffi::OsString;
use std::fs;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use tracing::debug;

use super::runner::{CommandRequest, CommandRunner, ProcessCommandRunner};
use super::{Connection, LoginCommand, ProtocolAdapter, TransportError, TransportFuture};
use crate::state::State;

/// Adapter producing [`ExecConnection`]s. The fingerprint is constant, so a
/// single connection is reused for the whole run.
#[derive(Clone, Debug)]
pub struct ExecAdapter {
    shell: String,
    runner: Arc<dyn CommandRunner>,
}

impl ExecAdapter {
    /// Creates an adapter running commands through `sh -c`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_runner(Arc::new(ProcessCommandRunner))
    }

    /// Creates an adapter with a custom command runner.
    #[must_use]
    pub fn with_runner(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            shell: "sh".to_owned(),
            runner,
        }
    }
}

impl Default for ExecAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolAdapter for ExecAdapter {
    type Fingerprint = ();

    fn name(&self) -> &'static str {
        "exec"
    }

    fn fingerprint(&self, _state: &State) -> Result<Self::Fingerprint, TransportError> {
        Ok(())
    }

    fn connect<'a>(&'a self, _fingerprint: &'a ()) -> TransportFuture<'a, Arc<dyn Connection>> {
        Box::pin(async move {
            let connection: Arc<dyn Connection> = Arc::new(ExecConnection {
                shell: self.shell.clone(),
                runner: Arc::clone(&self.runner),
            });
            Ok(connection)
        })
    }

    fn login_command(&self, _fingerprint: &()) -> Result<LoginCommand, TransportError> {
        Ok(LoginCommand {
            program: self.shell.clone(),
            args: Vec::new(),
        })
    }
}

/// Connection to the local host.
#[derive(Debug)]
pub struct ExecConnection {
    shell: String,
    runner: Arc<dyn CommandRunner>,
}

impl Connection for ExecConnection {
    fn execute<'a>(&'a self, command: &'a str) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            if command.trim().is_empty() {
                return Ok(());
            }
            debug!(command, "running local command");
            let request = CommandRequest::new(
                self.shell.clone(),
                vec![OsString::from("-c"), OsString::from(command)],
            )
            .streaming();
            let output = self.runner.run(request).await?;
            if output.is_success() {
                Ok(())
            } else {
                Err(TransportError::command_failed(output.code, command))
            }
        })
    }

    fn upload<'a>(
        &'a self,
        locals: &'a [Utf8PathBuf],
        remote: &'a str,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let locals = locals.to_vec();
            let remote = Utf8PathBuf::from(remote);
            tokio::task::spawn_blocking(move || copy_all(&locals, &remote))
                .await
                .map_err(|err| TransportError::Transfer {
                    message: err.to_string(),
                })?
        })
    }

    fn wait_until_ready(&self) -> TransportFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn close(&self) -> TransportFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn login_command(&self) -> Result<LoginCommand, TransportError> {
        Ok(LoginCommand {
            program: self.shell.clone(),
            args: Vec::new(),
        })
    }
}

fn copy_all(locals: &[Utf8PathBuf], remote: &Utf8Path) -> Result<(), TransportError> {
    Dir::create_ambient_dir_all(remote, ambient_authority()).map_err(|err| io_error(remote, &err))?;
    let target = Dir::open_ambient_dir(remote, ambient_authority())
        .map_err(|err| io_error(remote, &err))?;

    for local in locals {
        let name = local.file_name().ok_or_else(|| TransportError::Transfer {
            message: format!("cannot upload {local}: path has no file name"),
        })?;
        copy_entry(local, &target, Utf8Path::new(name))?;
    }
    Ok(())
}

fn copy_entry(source: &Utf8Path, target: &Dir, relative: &Utf8Path) -> Result<(), TransportError> {
    let metadata = fs::metadata(source).map_err(|err| io_error(source, &err))?;
    if metadata.is_dir() {
        target
            .create_dir_all(relative)
            .map_err(|err| io_error(relative, &err))?;
        let mut entries = source
            .read_dir_utf8()
            .map_err(|err| io_error(source, &err))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| io_error(source, &err))?;
        entries.sort_by(|a, b| a.file_name().cmp(b.file_name()));
        for entry in entries {
            copy_entry(entry.path(), target, &relative.join(entry.file_name()))?;
        }
        return Ok(());
    }

    let contents = fs::read(source).map_err(|err| io_error(source, &err))?;
    target
        .write(relative, contents)
        .map_err(|err| io_error(relative, &err))
}

fn io_error(path: &Utf8Path, err: &std::io::Error) -> TransportError {
    TransportError::Io {
        path: path.to_string(),
        message: err.to_string(),
    }
}
