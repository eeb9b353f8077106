//! Suites, platforms, and the helpers that combine them into instances.

use std::fmt;
use std::sync::Arc;

use camino::Utf8PathBuf;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::driver::Driver;

/// A named bundle of provisioning directives and test-time attributes.
#[derive(Clone, Debug, PartialEq)]
pub struct Suite {
    name: String,
    run_list: Vec<String>,
    attributes: Map<String, Value>,
    data_path: Option<Utf8PathBuf>,
    includes: Vec<String>,
    excludes: Vec<String>,
}

impl Suite {
    /// Starts a builder for a [`Suite`].
    #[must_use]
    pub fn builder() -> SuiteBuilder {
        SuiteBuilder::default()
    }

    /// Suite name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ordered provisioning directives.
    #[must_use]
    pub fn run_list(&self) -> &[String] {
        &self.run_list
    }

    /// Suite attributes.
    #[must_use]
    pub const fn attributes(&self) -> &Map<String, Value> {
        &self.attributes
    }

    /// Auxiliary data copied into provisioner sandboxes.
    #[must_use]
    pub const fn data_path(&self) -> Option<&Utf8PathBuf> {
        self.data_path.as_ref()
    }

    /// Returns `true` when the suite should run on `platform`.
    ///
    /// A non-empty `includes` list restricts the suite to the named
    /// platforms; `excludes` removes platforms from whatever remains.
    #[must_use]
    pub fn applies_to(&self, platform: &str) -> bool {
        let included = self.includes.is_empty() || self.includes.iter().any(|name| name == platform);
        included && !self.excludes.iter().any(|name| name == platform)
    }
}

/// Builder for [`Suite`]; the name and run-list are mandatory.
#[derive(Clone, Debug, Default)]
pub struct SuiteBuilder {
    name: Option<String>,
    run_list: Option<Vec<String>>,
    attributes: Map<String, Value>,
    data_path: Option<Utf8PathBuf>,
    includes: Vec<String>,
    excludes: Vec<String>,
}

impl SuiteBuilder {
    /// Sets the suite name.
    #[must_use]
    pub fn name(mut self, value: impl Into<String>) -> Self {
        self.name = Some(value.into());
        self
    }

    /// Sets the run-list. An empty list is valid; an absent one is not.
    #[must_use]
    pub fn run_list<I, S>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.run_list = Some(items.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the attributes.
    #[must_use]
    pub fn attributes(mut self, value: Map<String, Value>) -> Self {
        self.attributes = value;
        self
    }

    /// Sets the auxiliary data path.
    #[must_use]
    pub fn data_path(mut self, value: Option<Utf8PathBuf>) -> Self {
        self.data_path = value;
        self
    }

    /// Restricts the suite to these platforms.
    #[must_use]
    pub fn includes(mut self, value: Vec<String>) -> Self {
        self.includes = value;
        self
    }

    /// Removes these platforms from the suite.
    #[must_use]
    pub fn excludes(mut self, value: Vec<String>) -> Self {
        self.excludes = value;
        self
    }

    /// Builds the suite.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Missing`] when the name is blank or the run-list
    /// was never set.
    pub fn build(self) -> Result<Suite, ModelError> {
        let name = required_name(self.name, "suite")?;
        let run_list = self.run_list.ok_or_else(|| ModelError::Missing {
            kind: "suite",
            field: "run_list",
        })?;
        Ok(Suite {
            name,
            run_list,
            attributes: self.attributes,
            data_path: self.data_path,
            includes: self.includes,
            excludes: self.excludes,
        })
    }
}

/// A named target environment bound to a driver.
#[derive(Clone)]
pub struct Platform {
    name: String,
    driver: Arc<dyn Driver>,
    run_list: Vec<String>,
    attributes: Map<String, Value>,
}

impl Platform {
    /// Starts a builder for a [`Platform`].
    #[must_use]
    pub fn builder() -> PlatformBuilder {
        PlatformBuilder::default()
    }

    /// Platform name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Driver managing the platform's machines.
    #[must_use]
    pub const fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Directives run before the suite's.
    #[must_use]
    pub fn run_list(&self) -> &[String] {
        &self.run_list
    }

    /// Platform attributes, overridden by suite attributes.
    #[must_use]
    pub const fn attributes(&self) -> &Map<String, Value> {
        &self.attributes
    }
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform")
            .field("name", &self.name)
            .field("driver", &self.driver.name())
            .field("run_list", &self.run_list)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Platform`]; the name and driver are mandatory.
#[derive(Clone, Default)]
pub struct PlatformBuilder {
    name: Option<String>,
    driver: Option<Arc<dyn Driver>>,
    run_list: Vec<String>,
    attributes: Map<String, Value>,
}

impl PlatformBuilder {
    /// Sets the platform name.
    #[must_use]
    pub fn name(mut self, value: impl Into<String>) -> Self {
        self.name = Some(value.into());
        self
    }

    /// Sets the driver.
    #[must_use]
    pub fn driver(mut self, value: Arc<dyn Driver>) -> Self {
        self.driver = Some(value);
        self
    }

    /// Sets the run-list.
    #[must_use]
    pub fn run_list<I, S>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.run_list = items.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the attributes.
    #[must_use]
    pub fn attributes(mut self, value: Map<String, Value>) -> Self {
        self.attributes = value;
        self
    }

    /// Builds the platform.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Missing`] when the name is blank or no driver
    /// was given.
    pub fn build(self) -> Result<Platform, ModelError> {
        let name = required_name(self.name, "platform")?;
        let driver = self.driver.ok_or(ModelError::Missing {
            kind: "platform",
            field: "driver",
        })?;
        Ok(Platform {
            name,
            driver,
            run_list: self.run_list,
            attributes: self.attributes,
        })
    }
}

/// Errors raised while building suites and platforms.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ModelError {
    /// A mandatory field was absent or blank.
    #[error("{kind} is missing required field `{field}`")]
    Missing {
        /// `suite` or `platform`.
        kind: &'static str,
        /// Name of the missing field.
        field: &'static str,
    },
}

fn required_name(name: Option<String>, kind: &'static str) -> Result<String, ModelError> {
    name.map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
        .ok_or(ModelError::Missing { kind, field: "name" })
}

/// Instance name for a suite/platform pair: every character that is not
/// ASCII alphanumeric becomes `-`.
#[must_use]
pub fn instance_name(suite: &str, platform: &str) -> String {
    format!("{suite}-{platform}")
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '-' })
        .collect()
}

/// Overlays `overlay` onto `base`. Nested objects merge recursively; any
/// other value in `overlay` replaces the one in `base`.
#[must_use]
pub fn merge_maps(base: &Map<String, Value>, overlay: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = base.clone();
    for (key, value) in overlay {
        let combined = match (merged.get(key), value) {
            (Some(Value::Object(lower)), Value::Object(upper)) => {
                Value::Object(merge_maps(lower, upper))
            }
            _ => value.clone(),
        };
        merged.insert(key.clone(), combined);
    }
    merged
}
