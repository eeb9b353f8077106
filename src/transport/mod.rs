//! Remote connection layer.
//!
//! A [`Transport`] hands out [`Connection`]s for an instance, reusing an open
//! session while the connection fingerprint derived from the instance state
//! stays the same. Every protocol plugs in through [`ProtocolAdapter`] and
//! shares the caching logic in [`CachedTransport`].

mod cached;
mod error;
pub mod exec;
pub mod retry;
pub mod runner;
pub mod ssh;
pub mod winrm;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use camino::Utf8PathBuf;

use crate::state::State;

pub use cached::{CachedTransport, ProtocolAdapter};
pub use error::{ConnectionErrorKind, TransportError};

/// Boxed future returned by transport and connection methods.
pub type TransportFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// One logical session to one remote endpoint.
pub trait Connection: Send + Sync + fmt::Debug {
    /// Runs `command` remotely. Blank commands are a no-op.
    fn execute<'a>(&'a self, command: &'a str) -> TransportFuture<'a, ()>;

    /// Copies local files or directories into the `remote` directory.
    fn upload<'a>(&'a self, locals: &'a [Utf8PathBuf], remote: &'a str)
    -> TransportFuture<'a, ()>;

    /// Blocks until the endpoint accepts commands or the readiness ceiling is
    /// reached.
    fn wait_until_ready(&self) -> TransportFuture<'_, ()>;

    /// Closes the session. Calling it more than once is harmless.
    fn close(&self) -> TransportFuture<'_, ()>;

    /// Command that opens an interactive session to the same endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Unsupported`] when the protocol has no
    /// interactive client.
    fn login_command(&self) -> Result<LoginCommand, TransportError>;
}

/// Hands out connections for one instance.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Plugin name, for example `ssh`.
    fn name(&self) -> &str;

    /// Returns a connection for `state`, reusing the cached one when the
    /// fingerprint is unchanged.
    fn connection<'a>(&'a self, state: &'a State) -> TransportFuture<'a, Arc<dyn Connection>>;

    /// Closes and forgets the cached connection, if any.
    fn release(&self) -> TransportFuture<'_, ()>;

    /// Interactive login command for the endpoint described by `state`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when `state` lacks connection details.
    fn login_command(&self, state: &State) -> Result<LoginCommand, TransportError>;
}

/// Acquires a connection, runs `body` with it, and releases the transport's
/// cached connection afterwards regardless of the outcome.
///
/// # Errors
///
/// Returns the connection error or the error produced by `body`.
pub async fn with_connection<T, F, Fut>(
    transport: &dyn Transport,
    state: &State,
    body: F,
) -> Result<T, TransportError>
where
    F: FnOnce(Arc<dyn Connection>) -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let result = match transport.connection(state).await {
        Ok(connection) => body(connection).await,
        Err(err) => Err(err),
    };
    transport.release().await?;
    result
}

/// Program and arguments for an interactive login session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LoginCommand {
    /// Executable to launch.
    pub program: String,
    /// Arguments passed to `program`.
    pub args: Vec<String>,
}

impl fmt::Display for LoginCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}
