//! Plugin registry: maps driver, transport, provisioner, and verifier names
//! to constructors.
//!
//! [`Registry::with_builtins`] knows every plugin shipped with galley;
//! embedders add their own through the `register_*` methods before loading a
//! project.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::driver::{DummyDriver, DummyOptions, Driver, ProxyDriver, ProxyOptions};
use crate::stage::{DummyStage, ShellOptions, ShellStage, Stage};
use crate::transport::exec::ExecAdapter;
use crate::transport::ssh::{SshAdapter, SshOptions};
use crate::transport::winrm::{WinRmAdapter, WinRmOptions};
use crate::transport::{CachedTransport, Transport};

/// Options table for one plugin, without its `name` key.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PluginOptions(Map<String, Value>);

impl PluginOptions {
    /// Wraps `table`, dropping the `name` key that selected the plugin.
    #[must_use]
    pub fn new(mut table: Map<String, Value>) -> Self {
        table.remove("name");
        Self(table)
    }

    /// Deserializes the options into a plugin's option struct.
    ///
    /// # Errors
    ///
    /// Returns the message of the `serde` error when the table does not fit
    /// `T`.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, String> {
        serde_json::from_value(Value::Object(self.0.clone())).map_err(|err| err.to_string())
    }

    /// Raw options table.
    #[must_use]
    pub const fn table(&self) -> &Map<String, Value> {
        &self.0
    }
}

/// Builds a driver from its options.
pub type DriverConstructor =
    Arc<dyn Fn(&PluginOptions) -> Result<Arc<dyn Driver>, String> + Send + Sync>;
/// Builds a transport from its options. Called once per instance.
pub type TransportConstructor =
    Arc<dyn Fn(&PluginOptions) -> Result<Arc<dyn Transport>, String> + Send + Sync>;
/// Builds a provisioner or verifier from its options.
pub type StageConstructor =
    Arc<dyn Fn(&PluginOptions) -> Result<Arc<dyn Stage>, String> + Send + Sync>;

/// Errors raised while resolving plugins.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RegistryError {
    /// No plugin of that kind is registered under the name.
    #[error("unknown {kind} '{name}' (known: {known})")]
    Unknown {
        /// `driver`, `transport`, `provisioner`, or `verifier`.
        kind: &'static str,
        /// Requested name.
        name: String,
        /// Comma-separated registered names.
        known: String,
    },
    /// The plugin rejected its options.
    #[error("invalid options for {kind} '{name}': {message}")]
    InvalidOptions {
        /// `driver`, `transport`, `provisioner`, or `verifier`.
        kind: &'static str,
        /// Plugin name.
        name: String,
        /// Reason reported by the plugin.
        message: String,
    },
}

/// Name-to-constructor tables for every plugin kind.
#[derive(Clone, Default)]
pub struct Registry {
    drivers: BTreeMap<String, DriverConstructor>,
    transports: BTreeMap<String, TransportConstructor>,
    provisioners: BTreeMap<String, StageConstructor>,
    verifiers: BTreeMap<String, StageConstructor>,
}

impl Registry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in plugins: drivers `dummy` and `proxy`,
    /// transports `ssh`, `winrm`, and `exec`, and `dummy` and `shell` stages.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_driver("dummy", |options| {
            let driver = DummyDriver::new(options.parse::<DummyOptions>()?)
                .map_err(|err| err.to_string())?;
            Ok(Arc::new(driver))
        });
        registry.register_driver("proxy", |options| {
            Ok(Arc::new(ProxyDriver::new(options.parse::<ProxyOptions>()?)))
        });
        registry.register_transport("ssh", |options| {
            let adapter = SshAdapter::new(options.parse::<SshOptions>()?);
            Ok(Arc::new(CachedTransport::new(adapter)))
        });
        registry.register_transport("winrm", |options| {
            let adapter = WinRmAdapter::new(options.parse::<WinRmOptions>()?);
            Ok(Arc::new(CachedTransport::new(adapter)))
        });
        registry.register_transport("exec", |options| {
            if let Some(key) = options.table().keys().next() {
                return Err(format!("unknown field `{key}`, exec takes no options"));
            }
            Ok(Arc::new(CachedTransport::new(ExecAdapter::new())))
        });
        registry.register_provisioner("dummy", |options| {
            Ok(Arc::new(options.parse::<DummyStage>()?))
        });
        registry.register_verifier("dummy", |options| {
            Ok(Arc::new(options.parse::<DummyStage>()?))
        });
        registry.register_provisioner("shell", |options| {
            Ok(Arc::new(ShellStage::provisioner(options.parse::<ShellOptions>()?)))
        });
        registry.register_verifier("shell", |options| {
            Ok(Arc::new(ShellStage::verifier(options.parse::<ShellOptions>()?)))
        });
        registry
    }

    /// Registers or replaces a driver.
    pub fn register_driver<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn(&PluginOptions) -> Result<Arc<dyn Driver>, String> + Send + Sync + 'static,
    {
        self.drivers.insert(name.to_owned(), Arc::new(constructor));
    }

    /// Registers or replaces a transport.
    pub fn register_transport<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn(&PluginOptions) -> Result<Arc<dyn Transport>, String> + Send + Sync + 'static,
    {
        self.transports.insert(name.to_owned(), Arc::new(constructor));
    }

    /// Registers or replaces a provisioner.
    pub fn register_provisioner<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn(&PluginOptions) -> Result<Arc<dyn Stage>, String> + Send + Sync + 'static,
    {
        self.provisioners
            .insert(name.to_owned(), Arc::new(constructor));
    }

    /// Registers or replaces a verifier.
    pub fn register_verifier<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn(&PluginOptions) -> Result<Arc<dyn Stage>, String> + Send + Sync + 'static,
    {
        self.verifiers.insert(name.to_owned(), Arc::new(constructor));
    }

    /// Builds the driver registered as `name`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the name is unknown or the options are
    /// rejected.
    pub fn build_driver(
        &self,
        name: &str,
        options: &PluginOptions,
    ) -> Result<Arc<dyn Driver>, RegistryError> {
        build(&self.drivers, "driver", name, options)
    }

    /// Builds a fresh transport registered as `name`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the name is unknown or the options are
    /// rejected.
    pub fn build_transport(
        &self,
        name: &str,
        options: &PluginOptions,
    ) -> Result<Arc<dyn Transport>, RegistryError> {
        build(&self.transports, "transport", name, options)
    }

    /// Builds the provisioner registered as `name`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the name is unknown or the options are
    /// rejected.
    pub fn build_provisioner(
        &self,
        name: &str,
        options: &PluginOptions,
    ) -> Result<Arc<dyn Stage>, RegistryError> {
        build(&self.provisioners, "provisioner", name, options)
    }

    /// Builds the verifier registered as `name`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the name is unknown or the options are
    /// rejected.
    pub fn build_verifier(
        &self,
        name: &str,
        options: &PluginOptions,
    ) -> Result<Arc<dyn Stage>, RegistryError> {
        build(&self.verifiers, "verifier", name, options)
    }
}

fn build<T: ?Sized>(
    table: &BTreeMap<String, Arc<dyn Fn(&PluginOptions) -> Result<Arc<T>, String> + Send + Sync>>,
    kind: &'static str,
    name: &str,
    options: &PluginOptions,
) -> Result<Arc<T>, RegistryError> {
    let constructor = table.get(name).ok_or_else(|| RegistryError::Unknown {
        kind,
        name: name.to_owned(),
        known: table.keys().cloned().collect::<Vec<_>>().join(", "),
    })?;
    constructor(options).map_err(|message| RegistryError::InvalidOptions {
        kind,
        name: name.to_owned(),
        message,
    })
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("drivers", &self.drivers.keys().collect::<Vec<_>>())
            .field("transports", &self.transports.keys().collect::<Vec<_>>())
            .field("provisioners", &self.provisioners.keys().collect::<Vec<_>>())
            .field("verifiers", &self.verifiers.keys().collect::<Vec<_>>())
            .finish()
    }
}
