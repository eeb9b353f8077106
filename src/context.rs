//! Process-wide context passed down to every instance.

use std::fmt;

use tokio::sync::{Mutex, MutexGuard};
use tracing::Span;

use crate::config::GalleyConfig;

/// Shared handles every instance needs: the sandbox preparation lock, the
/// root tracing span, and the tool configuration.
pub struct Context {
    sandbox_lock: Mutex<()>,
    span: Span,
    config: GalleyConfig,
}

impl Context {
    /// Creates a context rooted in a fresh `galley` span.
    #[must_use]
    pub fn new(config: GalleyConfig) -> Self {
        Self {
            sandbox_lock: Mutex::new(()),
            span: tracing::info_span!("galley"),
            config,
        }
    }

    /// Serializes sandbox preparation across concurrently driven instances.
    pub async fn lock_sandbox(&self) -> MutexGuard<'_, ()> {
        self.sandbox_lock.lock().await
    }

    /// Root span new instance spans are parented to.
    #[must_use]
    pub const fn span(&self) -> &Span {
        &self.span
    }

    /// Tool configuration for this run.
    #[must_use]
    pub const fn config(&self) -> &GalleyConfig {
        &self.config
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
