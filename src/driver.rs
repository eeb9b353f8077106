//! Driver contract and the built-in drivers.
//!
//! A driver owns the machine behind an instance. The lifecycle calls one
//! driver method per action with the instance and its mutable state; the
//! default `converge` and `verify` run the instance's provisioner and
//! verifier through its transport.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::instance::Instance;
use crate::lifecycle::{Action, ParseLifecycleError};
use crate::stage::run_stage;
use crate::state::State;
use crate::transport::{LoginCommand, TransportError};

/// Errors raised by drivers, provisioners, and verifiers.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ActionError {
    /// The strategy reported a failure of its own.
    #[error("{0}")]
    Failed(String),
    /// A remote operation failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The local sandbox could not be prepared.
    #[error("sandbox error at {path}: {message}")]
    Sandbox {
        /// Path being prepared.
        path: String,
        /// Operating system error message.
        message: String,
    },
    /// A local command exited unsuccessfully.
    #[error("local command `{command}` failed with {status}")]
    LocalCommand {
        /// Command line that was run.
        command: String,
        /// Exit status description.
        status: String,
    },
}

/// Future returned by driver actions.
pub type ActionFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ActionError>> + Send + 'a>>;

/// Infrastructure lifecycle for one kind of machine.
pub trait Driver: Send + Sync + fmt::Debug {
    /// Plugin name, for example `dummy`.
    fn name(&self) -> &str;

    /// Creates the machine and records how to reach it in `state`.
    fn create<'a>(&'a self, instance: &'a Instance, state: &'a mut State) -> ActionFuture<'a>;

    /// Runs the provisioner against the machine.
    fn converge<'a>(&'a self, instance: &'a Instance, state: &'a mut State) -> ActionFuture<'a> {
        Box::pin(async move { run_stage(instance, state, instance.provisioner().as_ref()).await })
    }

    /// Prepares the machine for verification. Does nothing by default.
    fn setup<'a>(&'a self, _instance: &'a Instance, _state: &'a mut State) -> ActionFuture<'a> {
        Box::pin(async { Ok(()) })
    }

    /// Runs the verifier against the machine.
    fn verify<'a>(&'a self, instance: &'a Instance, state: &'a mut State) -> ActionFuture<'a> {
        Box::pin(async move { run_stage(instance, state, instance.verifier().as_ref()).await })
    }

    /// Destroys the machine.
    fn destroy<'a>(&'a self, instance: &'a Instance, state: &'a mut State) -> ActionFuture<'a>;

    /// Command for an interactive session on the machine.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError::Transport`] when the transport cannot describe
    /// a login for `state`.
    fn login_command(&self, instance: &Instance, state: &State) -> Result<LoginCommand, ActionError> {
        Ok(instance.transport().login_command(state)?)
    }
}

/// Options accepted by the `dummy` driver.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DummyOptions {
    /// Action that fails on purpose.
    pub fail_on: Option<String>,
    /// Milliseconds every action sleeps before returning.
    pub sleep_ms: u64,
    /// Host name written into state by `create`.
    pub hostname: String,
}

impl Default for DummyOptions {
    fn default() -> Self {
        Self {
            fail_on: None,
            sleep_ms: 0,
            hostname: "127.0.0.1".to_owned(),
        }
    }
}

/// Driver that touches no infrastructure. It records every call, can be
/// told to fail one action, and can sleep to simulate slow machines.
#[derive(Debug)]
pub struct DummyDriver {
    options: DummyOptions,
    fail_on: Option<Action>,
    calls: Mutex<Vec<Action>>,
}

impl Default for DummyDriver {
    fn default() -> Self {
        Self {
            options: DummyOptions::default(),
            fail_on: None,
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl DummyDriver {
    /// Builds the driver from its options.
    ///
    /// # Errors
    ///
    /// Returns [`ParseLifecycleError`] when `fail_on` names no action.
    pub fn new(options: DummyOptions) -> Result<Self, ParseLifecycleError> {
        let fail_on = options.fail_on.as_deref().map(str::parse::<Action>).transpose()?;
        Ok(Self {
            options,
            fail_on,
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Actions invoked so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<Action> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn record(&self, instance: &Instance, action: Action) -> Result<(), ActionError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(action);
        info!(instance = instance.name(), %action, "dummy driver action");
        if self.options.sleep_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.options.sleep_ms)).await;
        }
        if self.fail_on == Some(action) {
            return Err(ActionError::Failed(format!(
                "dummy driver failed {action} on {} as configured",
                instance.name()
            )));
        }
        Ok(())
    }
}

impl Driver for DummyDriver {
    fn name(&self) -> &str {
        "dummy"
    }

    fn create<'a>(&'a self, instance: &'a Instance, state: &'a mut State) -> ActionFuture<'a> {
        Box::pin(async move {
            self.record(instance, Action::Create).await?;
            state.set("hostname", self.options.hostname.clone());
            Ok(())
        })
    }

    fn converge<'a>(&'a self, instance: &'a Instance, state: &'a mut State) -> ActionFuture<'a> {
        Box::pin(async move {
            self.record(instance, Action::Converge).await?;
            run_stage(instance, state, instance.provisioner().as_ref()).await
        })
    }

    fn setup<'a>(&'a self, instance: &'a Instance, _state: &'a mut State) -> ActionFuture<'a> {
        Box::pin(async move { self.record(instance, Action::Setup).await })
    }

    fn verify<'a>(&'a self, instance: &'a Instance, state: &'a mut State) -> ActionFuture<'a> {
        Box::pin(async move {
            self.record(instance, Action::Verify).await?;
            run_stage(instance, state, instance.verifier().as_ref()).await
        })
    }

    fn destroy<'a>(&'a self, instance: &'a Instance, state: &'a mut State) -> ActionFuture<'a> {
        Box::pin(async move {
            self.record(instance, Action::Destroy).await?;
            state.remove("hostname");
            Ok(())
        })
    }
}

/// Options accepted by the `proxy` driver.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProxyOptions {
    /// Host of the existing machine.
    pub host: String,
    /// Port written into state, if the transport default does not fit.
    #[serde(default)]
    pub port: Option<u16>,
    /// Login user written into state.
    #[serde(default)]
    pub username: Option<String>,
    /// Password written into state.
    #[serde(default)]
    pub password: Option<String>,
    /// Command run on the machine by `destroy` to return it to a clean slate.
    #[serde(default)]
    pub reset_command: Option<String>,
}

/// Driver for a machine that already exists. `create` records the static
/// connection details and waits for the transport; `destroy` optionally
/// resets the machine.
#[derive(Debug)]
pub struct ProxyDriver {
    options: ProxyOptions,
}

impl ProxyDriver {
    /// Builds the driver from its options.
    #[must_use]
    pub const fn new(options: ProxyOptions) -> Self {
        Self { options }
    }
}

impl Driver for ProxyDriver {
    fn name(&self) -> &str {
        "proxy"
    }

    fn create<'a>(&'a self, instance: &'a Instance, state: &'a mut State) -> ActionFuture<'a> {
        Box::pin(async move {
            state.set("hostname", self.options.host.clone());
            if let Some(port) = self.options.port {
                state.set("port", port);
            }
            if let Some(username) = &self.options.username {
                state.set("username", username.clone());
            }
            if let Some(password) = &self.options.password {
                state.set("password", password.clone());
            }
            let connection = instance.transport().connection(state).await?;
            connection.wait_until_ready().await?;
            debug!(instance = instance.name(), host = %self.options.host, "proxy host ready");
            Ok(())
        })
    }

    fn destroy<'a>(&'a self, instance: &'a Instance, state: &'a mut State) -> ActionFuture<'a> {
        Box::pin(async move {
            if let Some(command) = &self.options.reset_command
                && state.get_str("hostname").is_some()
            {
                let connection = instance.transport().connection(state).await?;
                connection.execute(command).await?;
            }
            for key in ["hostname", "port", "username", "password"] {
                state.remove(key);
            }
            Ok(())
        })
    }
}
