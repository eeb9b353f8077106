//! Project file loading.
//!
//! `galley.toml` declares default plugin tables, a list of platforms, and a
//! list of suites. Loading resolves every plugin through the [`Registry`]
//! and expands the suite/platform matrix into [`Instance`]s, so unknown
//! plugin names and bad options fail before anything runs.
//!
//! ```toml
//! [driver]
//! name = "dummy"
//!
//! [transport]
//! name = "ssh"
//! username = "vagrant"
//!
//! [[platforms]]
//! name = "ubuntu-22.04"
//! run_list = ["recipe[apt]"]
//!
//! [[suites]]
//! name = "default"
//! run_list = ["recipe[web]"]
//! [suites.provisioner]
//! name = "shell"
//! script = "bootstrap.sh"
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use ortho_config::toml;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::context::Context;
use crate::instance::{Instance, InstanceParts};
use crate::matrix::{ModelError, Platform, Suite, instance_name, merge_maps};
use crate::registry::{PluginOptions, Registry, RegistryError};
use crate::state::StateStore;

/// Driver used when no table names one.
pub const DEFAULT_DRIVER: &str = "dummy";
/// Transport used when no table names one.
pub const DEFAULT_TRANSPORT: &str = "ssh";
/// Provisioner used when no table names one.
pub const DEFAULT_PROVISIONER: &str = "dummy";
/// Verifier used when no table names one.
pub const DEFAULT_VERIFIER: &str = "dummy";

/// Errors raised while loading a project file.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ProjectError {
    /// The file could not be read.
    #[error("failed to read {path}: {message}")]
    Io {
        /// Path of the project file.
        path: Utf8PathBuf,
        /// Operating system error message.
        message: String,
    },
    /// The file is not valid TOML or does not match the expected layout.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Path of the project file.
        path: Utf8PathBuf,
        /// Parser error message.
        message: String,
    },
    /// A suite or platform is missing a mandatory field.
    #[error(transparent)]
    Model(#[from] ModelError),
    /// A plugin could not be resolved.
    #[error("{owner}: {source}")]
    Plugin {
        /// Platform or suite that requested the plugin.
        owner: String,
        /// Registry failure.
        #[source]
        source: RegistryError,
    },
    /// A plugin table has a `name` that is not a string.
    #[error("{owner}: {kind} name must be a string")]
    PluginName {
        /// Platform or suite owning the table.
        owner: String,
        /// Plugin kind.
        kind: &'static str,
    },
    /// Two entries share a name.
    #[error("duplicate {kind} name '{name}'")]
    Duplicate {
        /// `platform`, `suite`, or `instance`.
        kind: &'static str,
        /// Repeated name.
        name: String,
    },
}

type Table = Map<String, Value>;

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ProjectFile {
    driver: Table,
    transport: Table,
    provisioner: Table,
    verifier: Table,
    platforms: Vec<PlatformSection>,
    suites: Vec<SuiteSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct PlatformSection {
    name: Option<String>,
    run_list: Vec<String>,
    attributes: Table,
    driver: Table,
    transport: Table,
    provisioner: Table,
    verifier: Table,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SuiteSection {
    name: Option<String>,
    run_list: Option<Vec<String>>,
    attributes: Table,
    data_path: Option<String>,
    includes: Vec<String>,
    excludes: Vec<String>,
    transport: Table,
    provisioner: Table,
    verifier: Table,
}

struct LoadedPlatform {
    platform: Arc<Platform>,
    section: PlatformSection,
}

struct LoadedSuite {
    suite: Arc<Suite>,
    section: SuiteSection,
}

/// Shared handles every loaded instance receives.
#[derive(Clone, Debug)]
pub struct LoadOptions {
    /// Process context.
    pub context: Arc<Context>,
    /// State store.
    pub store: Arc<dyn StateStore>,
}

/// Expanded instance matrix of a project file.
#[derive(Debug)]
pub struct Project {
    instances: Vec<Arc<Instance>>,
}

impl Project {
    /// Reads and expands the project file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectError`] when the file cannot be read or parsed, or
    /// when any platform, suite, or plugin is invalid.
    pub fn load(
        path: &Utf8Path,
        registry: &Registry,
        options: &LoadOptions,
    ) -> Result<Self, ProjectError> {
        let contents = read_project(path)?;
        Self::parse(&contents, path, registry, options)
    }

    /// Expands project `contents`. Relative data paths resolve against the
    /// directory of `origin`.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectError`] when parsing or plugin resolution fails.
    pub fn parse(
        contents: &str,
        origin: &Utf8Path,
        registry: &Registry,
        options: &LoadOptions,
    ) -> Result<Self, ProjectError> {
        let file: ProjectFile =
            toml::from_str(contents).map_err(|err| ProjectError::Parse {
                path: origin.to_path_buf(),
                message: err.to_string(),
            })?;
        let base = origin
            .parent()
            .filter(|parent| !parent.as_str().is_empty())
            .unwrap_or_else(|| Utf8Path::new("."));

        let ProjectFile {
            driver,
            transport,
            provisioner,
            verifier,
            platforms,
            suites,
        } = file;
        let defaults = Defaults {
            transport,
            provisioner,
            verifier,
        };

        let platforms = load_platforms(platforms, &driver, registry)?;
        let suites = load_suites(suites, base)?;

        let mut names = BTreeSet::new();
        let mut instances = Vec::new();
        for loaded_suite in &suites {
            for loaded_platform in &platforms {
                if !loaded_suite
                    .suite
                    .applies_to(loaded_platform.platform.name())
                {
                    continue;
                }
                let name = instance_name(
                    loaded_suite.suite.name(),
                    loaded_platform.platform.name(),
                );
                if !names.insert(name.clone()) {
                    return Err(ProjectError::Duplicate {
                        kind: "instance",
                        name,
                    });
                }
                let instance = build_instance(
                    loaded_suite,
                    loaded_platform,
                    &defaults,
                    registry,
                    options,
                )?;
                instances.push(Arc::new(instance));
            }
        }
        debug!(instances = instances.len(), "expanded project matrix");
        Ok(Self { instances })
    }

    /// Instances in suite-major order.
    #[must_use]
    pub fn instances(&self) -> &[Arc<Instance>] {
        &self.instances
    }

    /// Consumes the project, returning its instances.
    #[must_use]
    pub fn into_instances(self) -> Vec<Arc<Instance>> {
        self.instances
    }
}

struct Defaults {
    transport: Table,
    provisioner: Table,
    verifier: Table,
}

fn read_project(path: &Utf8Path) -> Result<String, ProjectError> {
    let io_error = |message: String| ProjectError::Io {
        path: path.to_path_buf(),
        message,
    };
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| io_error("project file path is missing a filename".to_owned()))?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| io_error(err.to_string()))?;
    dir.read_to_string(file_name)
        .map_err(|err| io_error(err.to_string()))
}

fn load_platforms(
    sections: Vec<PlatformSection>,
    default_driver: &Table,
    registry: &Registry,
) -> Result<Vec<LoadedPlatform>, ProjectError> {
    let mut seen = BTreeSet::new();
    let mut loaded = Vec::with_capacity(sections.len());
    for section in sections {
        let owner = format!("platform {}", section.name.as_deref().unwrap_or("<unnamed>"));
        let table = merge_maps(default_driver, &section.driver);
        let name = plugin_name(&table, "driver", DEFAULT_DRIVER, &owner)?;
        let driver = registry
            .build_driver(&name, &PluginOptions::new(table))
            .map_err(|source| ProjectError::Plugin {
                owner: owner.clone(),
                source,
            })?;
        let platform = Platform::builder()
            .run_list(section.run_list.clone())
            .attributes(section.attributes.clone())
            .driver(driver);
        let platform = match &section.name {
            Some(name) => platform.name(name.clone()),
            None => platform,
        }
        .build()?;
        if !seen.insert(platform.name().to_owned()) {
            return Err(ProjectError::Duplicate {
                kind: "platform",
                name: platform.name().to_owned(),
            });
        }
        loaded.push(LoadedPlatform {
            platform: Arc::new(platform),
            section,
        });
    }
    Ok(loaded)
}

fn load_suites(sections: Vec<SuiteSection>, base: &Utf8Path) -> Result<Vec<LoadedSuite>, ProjectError> {
    let mut seen = BTreeSet::new();
    let mut loaded = Vec::with_capacity(sections.len());
    for section in sections {
        let mut builder = Suite::builder()
            .attributes(section.attributes.clone())
            .data_path(section.data_path.as_deref().map(|path| base.join(path)))
            .includes(section.includes.clone())
            .excludes(section.excludes.clone());
        if let Some(name) = &section.name {
            builder = builder.name(name.clone());
        }
        if let Some(run_list) = &section.run_list {
            builder = builder.run_list(run_list.clone());
        }
        let suite = builder.build()?;
        if !seen.insert(suite.name().to_owned()) {
            return Err(ProjectError::Duplicate {
                kind: "suite",
                name: suite.name().to_owned(),
            });
        }
        loaded.push(LoadedSuite {
            suite: Arc::new(suite),
            section,
        });
    }
    Ok(loaded)
}

fn build_instance(
    suite: &LoadedSuite,
    platform: &LoadedPlatform,
    defaults: &Defaults,
    registry: &Registry,
    options: &LoadOptions,
) -> Result<Instance, ProjectError> {
    let owner = format!(
        "instance {}",
        instance_name(suite.suite.name(), platform.platform.name())
    );
    let layered = |default: &Table, from_platform: &Table, from_suite: &Table| {
        merge_maps(&merge_maps(default, from_platform), from_suite)
    };
    let plugin_error = |source| ProjectError::Plugin {
        owner: owner.clone(),
        source,
    };

    let table = layered(
        &defaults.transport,
        &platform.section.transport,
        &suite.section.transport,
    );
    let name = plugin_name(&table, "transport", DEFAULT_TRANSPORT, &owner)?;
    let transport = registry
        .build_transport(&name, &PluginOptions::new(table))
        .map_err(plugin_error)?;

    let table = layered(
        &defaults.provisioner,
        &platform.section.provisioner,
        &suite.section.provisioner,
    );
    let name = plugin_name(&table, "provisioner", DEFAULT_PROVISIONER, &owner)?;
    let provisioner = registry
        .build_provisioner(&name, &PluginOptions::new(table))
        .map_err(plugin_error)?;

    let table = layered(
        &defaults.verifier,
        &platform.section.verifier,
        &suite.section.verifier,
    );
    let name = plugin_name(&table, "verifier", DEFAULT_VERIFIER, &owner)?;
    let verifier = registry
        .build_verifier(&name, &PluginOptions::new(table))
        .map_err(plugin_error)?;

    Ok(Instance::new(InstanceParts {
        suite: Arc::clone(&suite.suite),
        platform: Arc::clone(&platform.platform),
        transport,
        provisioner,
        verifier,
        store: Arc::clone(&options.store),
        context: Arc::clone(&options.context),
    }))
}

fn plugin_name(
    table: &Table,
    kind: &'static str,
    default: &str,
    owner: &str,
) -> Result<String, ProjectError> {
    match table.get("name") {
        None => Ok(default.to_owned()),
        Some(Value::String(name)) => Ok(name.clone()),
        Some(_) => Err(ProjectError::PluginName {
            owner: owner.to_owned(),
            kind,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GalleyConfig;
    use crate::test_support::MemoryStateStore;
    use rstest::{fixture, rstest};

    #[fixture]
    fn load_options() -> LoadOptions {
        LoadOptions {
            context: Arc::new(Context::new(GalleyConfig::with_state_dir(".galley"))),
            store: Arc::new(MemoryStateStore::new()),
        }
    }

    fn parse(contents: &str, options: &LoadOptions) -> Result<Project, ProjectError> {
        Project::parse(
            contents,
            Utf8Path::new("/work/galley.toml"),
            &Registry::with_builtins(),
            options,
        )
    }

    fn names(project: &Project) -> Vec<&str> {
        project
            .instances()
            .iter()
            .map(|instance| instance.name())
            .collect()
    }

    const MATRIX: &str = r#"
[driver]
name = "dummy"

[transport]
name = "exec"

[[platforms]]
name = "ubuntu-22.04"
run_list = ["recipe[apt]"]
attributes = { motd = "platform", nginx = { port = 80 } }

[[platforms]]
name = "centos-7"

[[suites]]
name = "default"
run_list = ["recipe[web]"]
attributes = { nginx = { workers = 4 } }
data_path = "test/data"

[[suites]]
name = "ubuntu_only"
run_list = []
includes = ["ubuntu-22.04"]
[suites.verifier]
name = "shell"
command = "true"
"#;

    #[rstest]
    fn matrix_expands_suite_major_with_filters(load_options: LoadOptions) {
        let project = parse(MATRIX, &load_options).unwrap_or_else(|err| panic!("parse: {err}"));

        assert_eq!(
            names(&project),
            vec![
                "default-ubuntu-22-04",
                "default-centos-7",
                "ubuntu-only-ubuntu-22-04"
            ]
        );
    }

    #[rstest]
    fn instances_combine_platform_and_suite_settings(load_options: LoadOptions) {
        let project = parse(MATRIX, &load_options).unwrap_or_else(|err| panic!("parse: {err}"));
        let first = project
            .instances()
            .first()
            .unwrap_or_else(|| panic!("no instances"));

        assert_eq!(first.run_list(), vec!["recipe[apt]", "recipe[web]"]);
        assert_eq!(
            Value::Object(first.attributes()),
            serde_json::json!({"motd": "platform", "nginx": {"port": 80, "workers": 4}})
        );
        assert_eq!(
            first.suite().data_path(),
            Some(&Utf8PathBuf::from("/work/test/data"))
        );
        assert_eq!(first.transport().name(), "exec");

        let last = project
            .instances()
            .last()
            .unwrap_or_else(|| panic!("no instances"));
        assert_eq!(last.verifier().name(), "shell");
        assert_eq!(first.verifier().name(), "dummy");
    }

    #[rstest]
    #[case::unknown_driver(
        "[driver]\nname = \"vagrant\"\n[[platforms]]\nname = \"u\"\n",
        "unknown driver 'vagrant'"
    )]
    #[case::bad_option(
        "[[platforms]]\nname = \"u\"\n[platforms.driver]\nfail_on = \"explode\"\n",
        "explode"
    )]
    #[case::missing_run_list(
        "[[suites]]\nname = \"s\"\n",
        "suite is missing required field `run_list`"
    )]
    #[case::duplicate_platform(
        "[[platforms]]\nname = \"u\"\n[[platforms]]\nname = \"u\"\n",
        "duplicate platform name 'u'"
    )]
    #[case::unknown_key("[[platforms]]\nname = \"u\"\nimage = \"x\"\n", "image")]
    #[case::numeric_plugin_name("[verifier]\nname = 3\n[[platforms]]\nname = \"u\"\n[[suites]]\nname = \"s\"\nrun_list = []\n", "verifier name must be a string")]
    fn invalid_projects_fail_fast(
        load_options: LoadOptions,
        #[case] contents: &str,
        #[case] expected: &str,
    ) {
        let err = parse(contents, &load_options).expect_err("project should be rejected");
        assert!(err.to_string().contains(expected), "{err}");
    }

    #[rstest]
    fn slug_collisions_are_rejected(load_options: LoadOptions) {
        let contents = r#"
[[platforms]]
name = "a.b"
[[platforms]]
name = "a-b"
[[suites]]
name = "s"
run_list = []
"#;
        let err = parse(contents, &load_options).expect_err("slugs collide");
        assert_eq!(
            err,
            ProjectError::Duplicate {
                kind: "instance",
                name: "s-a-b".to_owned()
            }
        );
    }

    #[rstest]
    fn load_reads_the_file(load_options: LoadOptions) {
        let tmp = tempfile::TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
            .unwrap_or_else(|path| panic!("utf8: {}", path.display()));
        let path = root.join("galley.toml");
        std::fs::write(&path, MATRIX).unwrap_or_else(|err| panic!("write: {err}"));

        let project = Project::load(&path, &Registry::with_builtins(), &load_options)
            .unwrap_or_else(|err| panic!("load: {err}"));
        assert_eq!(project.instances().len(), 3);

        let missing = Project::load(
            &root.join("absent.toml"),
            &Registry::with_builtins(),
            &load_options,
        )
        .expect_err("file is absent");
        assert!(matches!(missing, ProjectError::Io { .. }));
    }
}
