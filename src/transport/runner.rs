//! Local process execution used by the SSH and exec adapters.
//!
//! [`CommandRunner`] abstracts process spawning so adapters can be driven by
//! scripted fakes in tests. The real implementation streams output lines into
//! `tracing` while it captures them.

use std::ffi::OsString;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::TransportError;

/// Result of running an external command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// A process invocation.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandRequest {
    /// Program to execute.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Bytes written to the child's stdin before it is closed.
    pub input: Option<Vec<u8>>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Log output lines as they arrive.
    pub stream: bool,
}

impl CommandRequest {
    /// Creates a request for `program` with `args`, no input, and quiet
    /// output.
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            args,
            ..Self::default()
        }
    }

    /// Feeds `input` to the child's stdin.
    #[must_use]
    pub fn with_input(mut self, input: Vec<u8>) -> Self {
        self.input = Some(input);
        self
    }

    /// Adds environment variables for the child.
    #[must_use]
    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    /// Logs stdout lines at info and stderr lines at warn while capturing.
    #[must_use]
    pub const fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }
}

/// Boxed future returned by [`CommandRunner::run`].
pub type RunnerFuture<'a> =
    Pin<Box<dyn Future<Output = Result<CommandOutput, TransportError>> + Send + 'a>>;

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync + fmt::Debug {
    /// Runs the request, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Spawn`] if the command cannot be started.
    fn run(&self, request: CommandRequest) -> RunnerFuture<'_>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, request: CommandRequest) -> RunnerFuture<'_> {
        Box::pin(async move { run_process(request).await })
    }
}

async fn run_process(request: CommandRequest) -> Result<CommandOutput, TransportError> {
    let spawn_error = |err: &io::Error| TransportError::Spawn {
        program: request.program.clone(),
        message: err.to_string(),
    };

    let mut child = Command::new(&request.program)
        .args(&request.args)
        .envs(request.env.iter().map(|(key, value)| (key, value)))
        .stdin(if request.input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| spawn_error(&err))?;

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let input = request.input.as_deref();

    let feed = async move {
        if let (Some(mut pipe), Some(bytes)) = (stdin, input) {
            pipe.write_all(bytes).await?;
            pipe.shutdown().await?;
        }
        Ok::<(), io::Error>(())
    };

    let (fed, out, err) = tokio::join!(
        feed,
        collect_lines(stdout, request.stream.then_some(Stream::Stdout)),
        collect_lines(stderr, request.stream.then_some(Stream::Stderr)),
    );

    if let Err(feed_err) = fed {
        // A child that exits before reading all of its input reports the
        // real problem through its exit status.
        debug!(program = %request.program, error = %feed_err, "stdin closed early");
    }

    let status = child.wait().await.map_err(|err| spawn_error(&err))?;
    Ok(CommandOutput {
        code: status.code(),
        stdout: out.map_err(|err| spawn_error(&err))?,
        stderr: err.map_err(|err| spawn_error(&err))?,
    })
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

async fn collect_lines<R>(reader: Option<R>, stream: Option<Stream>) -> io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return Ok(String::new());
    };
    let mut reader = BufReader::new(reader);
    let mut collected = String::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        let text = String::from_utf8_lossy(&line);
        if let Some(stream) = stream {
            log_line(stream, text.trim_end_matches(['\r', '\n']));
        }
        collected.push_str(&text);
    }
    Ok(collected)
}

fn log_line(stream: Stream, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    match stream {
        Stream::Stdout => info!(target: "galley::remote", "{line}"),
        Stream::Stderr => warn!(target: "galley::remote", "{line}"),
    }
}
