//! Fingerprint-keyed connection reuse shared by every protocol.

use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{Connection, LoginCommand, Transport, TransportError, TransportFuture};
use crate::state::State;

/// Protocol-specific half of a transport: how to derive a fingerprint from
/// state and how to open a session for it.
pub trait ProtocolAdapter: Send + Sync + fmt::Debug + 'static {
    /// Subset of state and options that decides whether a session can be
    /// reused.
    type Fingerprint: Clone + fmt::Debug + PartialEq + Send + Sync + 'static;

    /// Plugin name, for example `winrm`.
    fn name(&self) -> &'static str;

    /// Derives the fingerprint for `state`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Config`] when required fields are missing.
    fn fingerprint(&self, state: &State) -> Result<Self::Fingerprint, TransportError>;

    /// Opens a fresh session for `fingerprint`.
    fn connect<'a>(
        &'a self,
        fingerprint: &'a Self::Fingerprint,
    ) -> TransportFuture<'a, Arc<dyn Connection>>;

    /// Interactive login command for `fingerprint`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Unsupported`] when the protocol has none.
    fn login_command(&self, fingerprint: &Self::Fingerprint)
    -> Result<LoginCommand, TransportError>;
}

type CachedConnection<F> = Option<(F, Arc<dyn Connection>)>;

/// Transport that keeps at most one open connection and reuses it while the
/// fingerprint is unchanged.
pub struct CachedTransport<A: ProtocolAdapter> {
    adapter: A,
    cached: Mutex<CachedConnection<A::Fingerprint>>,
}

impl<A: ProtocolAdapter> CachedTransport<A> {
    /// Wraps `adapter` with an empty connection cache.
    #[must_use]
    pub fn new(adapter: A) -> Self {
        Self {
            adapter,
            cached: Mutex::new(None),
        }
    }

    /// Underlying protocol adapter.
    #[must_use]
    pub const fn adapter(&self) -> &A {
        &self.adapter
    }
}

impl<A: ProtocolAdapter> fmt::Debug for CachedTransport<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedTransport")
            .field("adapter", &self.adapter)
            .finish_non_exhaustive()
    }
}

impl<A: ProtocolAdapter> Transport for CachedTransport<A> {
    fn name(&self) -> &str {
        self.adapter.name()
    }

    fn connection<'a>(&'a self, state: &'a State) -> TransportFuture<'a, Arc<dyn Connection>> {
        Box::pin(async move {
            let fingerprint = self.adapter.fingerprint(state)?;
            let mut cached = self.cached.lock().await;

            if let Some((existing, connection)) = cached.as_ref()
                && *existing == fingerprint
            {
                debug!(transport = self.adapter.name(), "reusing existing connection");
                return Ok(Arc::clone(connection));
            }

            if let Some((previous, connection)) = cached.take() {
                debug!(
                    transport = self.adapter.name(),
                    previous = ?previous,
                    "connection fingerprint changed, closing previous connection"
                );
                if let Err(err) = connection.close().await {
                    warn!(
                        transport = self.adapter.name(),
                        error = %err,
                        "failed to close previous connection"
                    );
                }
            }

            let connection = self.adapter.connect(&fingerprint).await?;
            *cached = Some((fingerprint, Arc::clone(&connection)));
            Ok(connection)
        })
    }

    fn release(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let previous = self.cached.lock().await.take();
            if let Some((_, connection)) = previous
                && let Err(err) = connection.close().await
            {
                warn!(
                    transport = self.adapter.name(),
                    error = %err,
                    "failed to close connection"
                );
            }
            Ok(())
        })
    }

    fn login_command(&self, state: &State) -> Result<LoginCommand, TransportError> {
        let fingerprint = self.adapter.fingerprint(state)?;
        self.adapter.login_command(&fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use camino::Utf8PathBuf;

    #[derive(Debug, Default)]
    struct CountingConnection {
        closes: AtomicUsize,
    }

    impl Connection for CountingConnection {
        fn execute<'a>(&'a self, _command: &'a str) -> TransportFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }

        fn upload<'a>(
            &'a self,
            _locals: &'a [Utf8PathBuf],
            _remote: &'a str,
        ) -> TransportFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }

        fn wait_until_ready(&self) -> TransportFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }

        fn close(&self) -> TransportFuture<'_, ()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }

        fn login_command(&self) -> Result<LoginCommand, TransportError> {
            Err(TransportError::Unsupported {
                transport: "counting".to_owned(),
                operation: "login".to_owned(),
            })
        }
    }

    #[derive(Debug, Default)]
    struct CountingAdapter {
        opened: std::sync::Mutex<Vec<Arc<CountingConnection>>>,
    }

    impl CountingAdapter {
        fn opened(&self) -> Vec<Arc<CountingConnection>> {
            self.opened
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone()
        }
    }

    impl ProtocolAdapter for CountingAdapter {
        type Fingerprint = Option<String>;

        fn name(&self) -> &'static str {
            "counting"
        }

        fn fingerprint(&self, state: &State) -> Result<Self::Fingerprint, TransportError> {
            Ok(state.get_str("hostname").map(str::to_owned))
        }

        fn connect<'a>(
            &'a self,
            _fingerprint: &'a Self::Fingerprint,
        ) -> TransportFuture<'a, Arc<dyn Connection>> {
            Box::pin(async move {
                let connection = Arc::new(CountingConnection::default());
                self.opened
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .push(Arc::clone(&connection));
                let shared: Arc<dyn Connection> = connection;
                Ok(shared)
            })
        }

        fn login_command(
            &self,
            fingerprint: &Self::Fingerprint,
        ) -> Result<LoginCommand, TransportError> {
            Ok(LoginCommand {
                program: "login".to_owned(),
                args: fingerprint.iter().cloned().collect(),
            })
        }
    }

    fn state_for(host: &str) -> State {
        let mut state = State::new();
        state.set("hostname", host);
        state
    }

    #[tokio::test]
    async fn equal_fingerprints_share_one_connection() {
        let transport = CachedTransport::new(CountingAdapter::default());
        let state = state_for("10.0.0.4");

        let first = transport
            .connection(&state)
            .await
            .unwrap_or_else(|err| panic!("first connection: {err}"));
        let second = transport
            .connection(&state)
            .await
            .unwrap_or_else(|err| panic!("second connection: {err}"));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(transport.adapter().opened().len(), 1);
    }

    fn closes(opened: &[Arc<CountingConnection>], index: usize) -> usize {
        opened
            .get(index)
            .unwrap_or_else(|| panic!("connection {index} was never opened"))
            .closes
            .load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn changed_fingerprint_closes_previous_connection_once() {
        let transport = CachedTransport::new(CountingAdapter::default());

        let first = transport
            .connection(&state_for("10.0.0.4"))
            .await
            .unwrap_or_else(|err| panic!("first connection: {err}"));
        let second = transport
            .connection(&state_for("10.0.0.5"))
            .await
            .unwrap_or_else(|err| panic!("second connection: {err}"));

        assert!(!Arc::ptr_eq(&first, &second));
        let opened = transport.adapter().opened();
        assert_eq!(opened.len(), 2);
        assert_eq!(closes(&opened, 0), 1);
        assert_eq!(closes(&opened, 1), 0);
    }

    #[tokio::test]
    async fn release_closes_and_forgets_the_cached_connection() {
        let transport = CachedTransport::new(CountingAdapter::default());
        let state = state_for("10.0.0.4");
        transport
            .connection(&state)
            .await
            .unwrap_or_else(|err| panic!("connection: {err}"));

        transport
            .release()
            .await
            .unwrap_or_else(|err| panic!("release: {err}"));
        transport
            .release()
            .await
            .unwrap_or_else(|err| panic!("second release: {err}"));
        transport
            .connection(&state)
            .await
            .unwrap_or_else(|err| panic!("reconnect: {err}"));

        let opened = transport.adapter().opened();
        assert_eq!(opened.len(), 2);
        assert_eq!(closes(&opened, 0), 1);
    }

    #[test]
    fn login_command_uses_the_fingerprint() {
        let transport = CachedTransport::new(CountingAdapter::default());
        let command = transport
            .login_command(&state_for("10.0.0.9"))
            .unwrap_or_else(|err| panic!("login: {err}"));
        assert_eq!(command.args, vec!["10.0.0.9".to_owned()]);
    }
}
