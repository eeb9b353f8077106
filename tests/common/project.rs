//! Shared project workspace fixture for behavioural tests.
//!
//! Integration tests are compiled as separate crates (one per top-level file in
//! `tests/`). Placing the fixture under `tests/common/` avoids creating an
//! additional integration test binary while still allowing reuse via:
//!
//! ```rust
//! #[path = "common/project.rs"]
//! mod project;
//! ```

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

/// Two dummy platforms, one suite, and the local exec transport.
pub const DUMMY_MATRIX: &str = r#"
[driver]
name = "dummy"

[transport]
name = "exec"

[[platforms]]
name = "ubuntu"

[[platforms]]
name = "centos"

[[suites]]
name = "default"
run_list = []
"#;

/// Temporary directory holding a `galley.toml`.
pub struct Workspace {
    _tmp: TempDir,
    root: Utf8PathBuf,
}

impl Workspace {
    /// Creates a workspace whose project file holds `contents`.
    pub fn new(contents: &str) -> Self {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
            .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()));
        fs::write(root.join("galley.toml"), contents)
            .unwrap_or_else(|err| panic!("write project: {err}"));
        Self { _tmp: tmp, root }
    }

    /// Workspace directory.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Default state directory inside the workspace.
    pub fn state_dir(&self) -> Utf8PathBuf {
        self.root.join(".galley")
    }

    /// Names of the state documents currently on disk.
    pub fn state_files(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(self.state_dir()) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}
