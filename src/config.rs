//! Tool configuration loaded via `ortho-config`.
//!
//! [`GalleyConfig`] holds the settings that apply to every run: where state
//! lives, which project file describes the matrix, and the default log
//! filter. The platform/suite matrix itself lives in the project file and is
//! handled by [`crate::project`].

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Default directory holding per-instance state documents.
pub const DEFAULT_STATE_DIR: &str = ".galley";

/// Default project file describing platforms and suites.
pub const DEFAULT_PROJECT_FILE: &str = "galley.toml";

/// Tool-wide settings merged from defaults, `.galley.toml`, and `GALLEY_*`
/// environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "GALLEY",
    discovery(
        app_name = "galley",
        env_var = "GALLEY_CONFIG_PATH",
        config_file_name = "config.toml",
        dotfile_name = ".galley.toml",
        project_file_name = ".galley.toml"
    )
)]
pub struct GalleyConfig {
    /// Directory holding per-instance state documents.
    #[ortho_config(default = DEFAULT_STATE_DIR.to_owned())]
    pub state_dir: String,
    /// Project file describing the platform/suite matrix.
    #[ortho_config(default = DEFAULT_PROJECT_FILE.to_owned())]
    pub project_file: String,
    /// Default `tracing` filter when `RUST_LOG` is unset.
    #[ortho_config(default = "info".to_owned())]
    pub log_level: String,
    /// Upper bound on concurrently driven instances in parallel mode.
    pub max_concurrency: Option<usize>,
}

impl GalleyConfig {
    /// Builds a configuration with default values and the given state
    /// directory, bypassing file and environment discovery.
    #[must_use]
    pub fn with_state_dir(state_dir: impl Into<String>) -> Self {
        Self {
            state_dir: state_dir.into(),
            project_file: DEFAULT_PROJECT_FILE.to_owned(),
            log_level: "info".to_owned(),
            max_concurrency: None,
        }
    }

    /// Loads configuration without parsing CLI arguments. Values merge
    /// defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails and
    /// [`ConfigError::Invalid`] when a merged value is unusable.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        let config = Self::load_from_iter([std::ffi::OsString::from("galley")])
            .map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Ensures the merged values are usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_value(&self.state_dir, "state_dir")?;
        Self::require_value(&self.project_file, "project_file")?;
        if self.max_concurrency == Some(0) {
            return Err(ConfigError::Invalid {
                field: "max_concurrency".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        Ok(())
    }

    /// State directory as a UTF-8 path.
    #[must_use]
    pub fn state_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(&self.state_dir)
    }

    /// Project file as a UTF-8 path.
    #[must_use]
    pub fn project_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(&self.project_file)
    }

    fn require_value(value: &str, field: &str) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: field.to_owned(),
                reason: format!(
                    "set GALLEY_{} or add {field} to .galley.toml",
                    field.to_uppercase()
                ),
            });
        }
        Ok(())
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// A merged value failed validation.
    #[error("invalid configuration field {field}: {reason}")]
    Invalid {
        /// Field that failed validation.
        field: String,
        /// Guidance for fixing the value.
        reason: String,
    },
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn defaults_validate() {
        let config = GalleyConfig::with_state_dir(DEFAULT_STATE_DIR);
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.project_path(), Utf8PathBuf::from("galley.toml"));
    }

    #[rstest]
    #[case("state_dir")]
    #[case("project_file")]
    fn blank_paths_are_rejected(#[case] field: &str) {
        let mut config = GalleyConfig::with_state_dir(DEFAULT_STATE_DIR);
        match field {
            "state_dir" => config.state_dir = "  ".to_owned(),
            _ => config.project_file = String::new(),
        }

        let err = config.validate().expect_err("blank path should fail");

        assert!(
            err.to_string().contains(&format!("GALLEY_{}", field.to_uppercase())),
            "unexpected message: {err}"
        );
    }

    #[tokio::test]
    async fn environment_overrides_defaults() {
        let _guard = crate::test_support::EnvGuard::set_vars(&[
            ("GALLEY_STATE_DIR", "/var/lib/galley"),
            ("GALLEY_LOG_LEVEL", "debug"),
        ])
        .await;

        let config = GalleyConfig::load_without_cli_args()
            .unwrap_or_else(|err| panic!("load config: {err}"));

        assert_eq!(config.state_path(), Utf8PathBuf::from("/var/lib/galley"));
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.project_file, DEFAULT_PROJECT_FILE);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut config = GalleyConfig::with_state_dir(DEFAULT_STATE_DIR);
        config.max_concurrency = Some(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field, .. }) if field == "max_concurrency"
        ));
    }
}
