//! Core library for galley, a driver for disposable test instances.
//!
//! A project declares platforms and suites; every suite/platform pair is an
//! [`instance::Instance`] that moves through the lifecycle
//! destroy < create < converge < setup < verify. Drivers manage machines,
//! provisioners and verifiers run through a [`transport::Transport`] over
//! SSH, WinRM, or local exec, and the [`runner`] drives many instances at
//! once.

pub mod config;
pub mod context;
pub mod driver;
pub mod instance;
pub mod lifecycle;
pub mod matrix;
pub mod project;
pub mod registry;
pub mod runner;
pub mod stage;
pub mod state;
pub mod test_support;
pub mod transport;

pub use config::{ConfigError, GalleyConfig};
pub use context::Context;
pub use driver::{ActionError, Driver};
pub use instance::{Instance, InstanceError, InstanceParts};
pub use lifecycle::{Action, DestroyPolicy};
pub use matrix::{Platform, Suite};
pub use project::{LoadOptions, Project, ProjectError};
pub use registry::{PluginOptions, Registry, RegistryError};
pub use runner::{Concurrency, RunAction, RunReport};
pub use stage::{Sandbox, Stage};
pub use state::{FileStateStore, State, StateError, StateStore};
pub use transport::{Connection, Transport, TransportError};
