//! Persisted per-instance state.
//!
//! Each instance owns one JSON document under the state directory. The
//! document is created by the first action, rewritten after every action
//! attempt, and removed once `destroy` succeeds.

use std::fmt;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::lifecycle::Action;

/// Key holding the name of the last successful action.
pub const LAST_ACTION_KEY: &str = "last_action";

/// Mutable mapping of state keys to JSON values.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(transparent)]
pub struct State(Map<String, Value>);

impl State {
    /// Creates an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the raw value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Returns the value under `key` when it is a non-empty string.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    /// Returns the value under `key` as an unsigned integer, accepting
    /// numeric strings.
    #[must_use]
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.0.get(key)? {
            Value::Number(number) => number.as_u64(),
            Value::String(text) => text.trim().parse().ok(),
            _ => None,
        }
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Removes `key`, returning the previous value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Returns `true` when no keys are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the stored keys and values.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Returns the last successful action, if recorded and recognised.
    #[must_use]
    pub fn last_action(&self) -> Option<Action> {
        self.get_str(LAST_ACTION_KEY)
            .and_then(|name| name.parse().ok())
    }

    /// Records `action` as the last successful action.
    pub fn set_last_action(&mut self, action: Action) {
        self.set(LAST_ACTION_KEY, action.as_str());
    }
}

/// Errors raised while reading or writing persisted state.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StateError {
    /// Raised when file system access fails.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Operating system error message.
        message: String,
    },
    /// Raised when a state document cannot be parsed or rendered.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Path of the offending document.
        path: Utf8PathBuf,
        /// Parser error message.
        message: String,
    },
}

/// Storage for per-instance state documents.
pub trait StateStore: Send + Sync + fmt::Debug {
    /// Loads the state for `instance`, returning an empty state when none is
    /// stored.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] when the stored document cannot be read.
    fn load(&self, instance: &str) -> Result<State, StateError>;

    /// Persists `state` for `instance`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] when the document cannot be written.
    fn save(&self, instance: &str, state: &State) -> Result<(), StateError>;

    /// Removes any stored state for `instance`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] when the document exists but cannot be removed.
    fn destroy(&self, instance: &str) -> Result<(), StateError>;

    /// Returns `true` when a state document exists for `instance`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] when the state directory cannot be inspected.
    fn exists(&self, instance: &str) -> Result<bool, StateError>;
}

/// Stores state as `<root>/<instance>.json`.
#[derive(Clone, Debug)]
pub struct FileStateStore {
    root: Utf8PathBuf,
}

impl FileStateStore {
    /// Creates a store rooted at `root`. The directory is created lazily on
    /// the first write.
    #[must_use]
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the state documents.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Path of the document for `instance`.
    #[must_use]
    pub fn path_for(&self, instance: &str) -> Utf8PathBuf {
        self.root.join(file_name(instance))
    }

    fn open_root(&self) -> Result<Option<Dir>, StateError> {
        match Dir::open_ambient_dir(&self.root, ambient_authority()) {
            Ok(dir) => Ok(Some(dir)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(&self.root, &err)),
        }
    }
}

impl StateStore for FileStateStore {
    fn load(&self, instance: &str) -> Result<State, StateError> {
        let path = self.path_for(instance);
        let Some(dir) = self.open_root()? else {
            return Ok(State::new());
        };

        let contents = match dir.read_to_string(file_name(instance)) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(State::new()),
            Err(err) => return Err(io_error(&path, &err)),
        };

        if contents.trim().is_empty() {
            return Ok(State::new());
        }

        serde_json::from_str(&contents).map_err(|err| StateError::Parse {
            path,
            message: err.to_string(),
        })
    }

    fn save(&self, instance: &str, state: &State) -> Result<(), StateError> {
        let path = self.path_for(instance);
        Dir::create_ambient_dir_all(&self.root, ambient_authority())
            .map_err(|err| io_error(&self.root, &err))?;
        let dir = Dir::open_ambient_dir(&self.root, ambient_authority())
            .map_err(|err| io_error(&self.root, &err))?;

        let rendered = serde_json::to_string_pretty(state).map_err(|err| StateError::Parse {
            path: path.clone(),
            message: err.to_string(),
        })?;

        let final_name = file_name(instance);
        let staging_name = format!("{final_name}.tmp");
        dir.write(&staging_name, rendered)
            .map_err(|err| io_error(&path, &err))?;
        dir.rename(&staging_name, &dir, &final_name)
            .map_err(|err| io_error(&path, &err))
    }

    fn destroy(&self, instance: &str) -> Result<(), StateError> {
        let Some(dir) = self.open_root()? else {
            return Ok(());
        };
        match dir.remove_file(file_name(instance)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(&self.path_for(instance), &err)),
        }
    }

    fn exists(&self, instance: &str) -> Result<bool, StateError> {
        let Some(dir) = self.open_root()? else {
            return Ok(false);
        };
        dir.try_exists(file_name(instance))
            .map_err(|err| io_error(&self.path_for(instance), &err))
    }
}

fn file_name(instance: &str) -> String {
    format!("{instance}.json")
}

fn io_error(path: &Utf8Path, err: &io::Error) -> StateError {
    StateError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn store_in(tmp: &TempDir) -> FileStateStore {
        let root = Utf8PathBuf::from_path_buf(tmp.path().join("state"))
            .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()));
        FileStateStore::new(root)
    }

    #[test]
    fn load_returns_empty_state_when_directory_is_missing() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let store = store_in(&tmp);

        let state = store
            .load("default-ubuntu")
            .unwrap_or_else(|err| panic!("load: {err}"));

        assert!(state.is_empty());
        assert!(!store.exists("default-ubuntu").unwrap_or(true));
    }

    #[test]
    fn save_round_trips_every_value_type() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let store = store_in(&tmp);
        let mut state = State::new();
        state.set("hostname", "10.0.0.4");
        state.set("port", 2222);
        state.set("ready", true);
        state.set("ratio", 0.5);
        state.set("labels", json!({"zone": "fr-par-1", "tags": ["a", "b"]}));
        state.set_last_action(Action::Converge);

        store
            .save("default-ubuntu", &state)
            .unwrap_or_else(|err| panic!("save: {err}"));
        let loaded = store
            .load("default-ubuntu")
            .unwrap_or_else(|err| panic!("load: {err}"));

        assert_eq!(loaded, state);
        assert_eq!(loaded.last_action(), Some(Action::Converge));
        assert_eq!(loaded.get_u64("port"), Some(2222));
    }

    #[test]
    fn destroy_removes_the_document_and_is_idempotent() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let store = store_in(&tmp);
        store
            .save("suite-platform", &State::new())
            .unwrap_or_else(|err| panic!("save: {err}"));
        assert!(store.exists("suite-platform").unwrap_or(false));

        store
            .destroy("suite-platform")
            .unwrap_or_else(|err| panic!("destroy: {err}"));
        store
            .destroy("suite-platform")
            .unwrap_or_else(|err| panic!("second destroy: {err}"));

        assert!(!store.exists("suite-platform").unwrap_or(true));
        assert!(!store.path_for("suite-platform").exists());
    }

    #[test]
    fn get_u64_accepts_numeric_strings() {
        let mut state = State::new();
        state.set("port", "5986");
        assert_eq!(state.get_u64("port"), Some(5986));
        state.set("port", "not-a-port");
        assert_eq!(state.get_u64("port"), None);
    }
}
