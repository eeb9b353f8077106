//! Drives many instances through one action.
//!
//! Sequential mode walks the instances in order. Parallel mode spawns one
//! task per instance on a `JoinSet`, optionally bounded by a semaphore.
//! Either way every instance runs to completion; one failure never cancels
//! its siblings.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use regex::Regex;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::instance::{Instance, InstanceError};
use crate::lifecycle::{Action, DestroyPolicy};

/// Errors raised while selecting instances.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum SelectError {
    /// The filter matched no instance.
    #[error("no instances match '{0}'")]
    NoMatch(String),
    /// The filter is neither an instance name nor a valid regular expression.
    #[error("invalid instance filter '{pattern}': {message}")]
    InvalidPattern {
        /// Filter as given.
        pattern: String,
        /// Regex compiler message.
        message: String,
    },
}

/// Picks the instances matching `filter`.
///
/// `None` and `all` select everything. An exact instance name selects that
/// instance; anything else is a regular expression searched in each name.
///
/// # Errors
///
/// Returns [`SelectError`] when nothing matches or the pattern is invalid.
pub fn select(
    instances: &[Arc<Instance>],
    filter: Option<&str>,
) -> Result<Vec<Arc<Instance>>, SelectError> {
    let pattern = match filter.map(str::trim) {
        None | Some("all") => return non_empty(instances.to_vec(), "all"),
        Some(pattern) => pattern,
    };
    if let Some(exact) = instances.iter().find(|instance| instance.name() == pattern) {
        return Ok(vec![Arc::clone(exact)]);
    }
    let regex = Regex::new(pattern).map_err(|err| SelectError::InvalidPattern {
        pattern: pattern.to_owned(),
        message: err.to_string(),
    })?;
    let matched = instances
        .iter()
        .filter(|instance| regex.is_match(instance.name()))
        .cloned()
        .collect();
    non_empty(matched, pattern)
}

fn non_empty(
    instances: Vec<Arc<Instance>>,
    pattern: &str,
) -> Result<Vec<Arc<Instance>>, SelectError> {
    if instances.is_empty() {
        return Err(SelectError::NoMatch(pattern.to_owned()));
    }
    Ok(instances)
}

/// What to do with each selected instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunAction {
    /// Transition to a lifecycle state.
    Lifecycle(Action),
    /// Run the composite test cycle.
    Test(DestroyPolicy),
}

impl fmt::Display for RunAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lifecycle(action) => fmt::Display::fmt(action, f),
            Self::Test(_) => f.write_str("test"),
        }
    }
}

/// How instances are scheduled.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Concurrency {
    /// One instance at a time, in order.
    #[default]
    Sequential,
    /// One task per instance.
    Parallel {
        /// Maximum number of instances in flight; unbounded when `None`.
        limit: Option<usize>,
    },
}

/// Result for one instance.
#[derive(Debug)]
pub struct Outcome {
    /// Instance name.
    pub instance: String,
    /// What happened.
    pub result: Result<(), RunFailure>,
}

/// Why an instance did not finish successfully.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum RunFailure {
    /// The lifecycle reported an error.
    #[error(transparent)]
    Instance(#[from] InstanceError),
    /// The task driving the instance panicked or was cancelled.
    #[error("task driving {instance} aborted: {message}")]
    Aborted {
        /// Instance name.
        instance: String,
        /// Join error message.
        message: String,
    },
}

/// Outcomes for every instance, in selection order.
#[derive(Debug, Default)]
pub struct RunReport {
    outcomes: Vec<Outcome>,
}

impl RunReport {
    /// Outcomes in selection order.
    #[must_use]
    pub fn outcomes(&self) -> &[Outcome] {
        &self.outcomes
    }

    /// Returns `true` when every instance succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|outcome| outcome.result.is_ok())
    }

    /// Outcomes that failed.
    pub fn failures(&self) -> impl Iterator<Item = &Outcome> {
        self.outcomes.iter().filter(|outcome| outcome.result.is_err())
    }
}

/// Runs `action` on every instance under `concurrency`.
pub async fn run(
    instances: Vec<Arc<Instance>>,
    action: RunAction,
    concurrency: Concurrency,
) -> RunReport {
    info!(%action, instances = instances.len(), ?concurrency, "running");
    let report = match concurrency {
        Concurrency::Sequential => run_sequential(instances, action).await,
        Concurrency::Parallel { limit } => run_parallel(instances, action, limit).await,
    };
    for failure in report.failures() {
        if let Err(err) = &failure.result {
            error!(instance = %failure.instance, error = %err, "instance failed");
        }
    }
    report
}

async fn drive(instance: &Instance, action: RunAction) -> Result<(), RunFailure> {
    let result = match action {
        RunAction::Lifecycle(desired) => instance.transition_to(desired).await,
        RunAction::Test(policy) => instance.test(policy).await,
    };
    result.map_err(RunFailure::from)
}

async fn run_sequential(instances: Vec<Arc<Instance>>, action: RunAction) -> RunReport {
    let mut outcomes = Vec::with_capacity(instances.len());
    for instance in instances {
        outcomes.push(Outcome {
            instance: instance.name().to_owned(),
            result: drive(&instance, action).await,
        });
    }
    RunReport { outcomes }
}

async fn run_parallel(
    instances: Vec<Arc<Instance>>,
    action: RunAction,
    limit: Option<usize>,
) -> RunReport {
    let permits = limit.map(|limit| Arc::new(Semaphore::new(limit.max(1))));
    let mut tasks = JoinSet::new();
    let mut names = HashMap::with_capacity(instances.len());
    let order: Vec<String> = instances
        .iter()
        .map(|instance| instance.name().to_owned())
        .collect();

    for instance in instances {
        let permits = permits.clone();
        let name = instance.name().to_owned();
        let handle = tasks.spawn(async move {
            let _permit = match permits {
                Some(semaphore) => Some(semaphore.acquire_owned().await),
                None => None,
            };
            drive(&instance, action).await
        });
        names.insert(handle.id(), name);
    }

    let mut finished = HashMap::with_capacity(names.len());
    while let Some(joined) = tasks.join_next_with_id().await {
        let (id, result) = match joined {
            Ok((id, result)) => (id, result),
            Err(err) => {
                let id = err.id();
                let instance = names.get(&id).cloned().unwrap_or_default();
                let message = err.to_string();
                (id, Err(RunFailure::Aborted { instance, message }))
            }
        };
        if let Some(name) = names.remove(&id) {
            finished.insert(name, result);
        }
    }

    let outcomes = order
        .into_iter()
        .filter_map(|name| {
            finished.remove(&name).map(|result| Outcome {
                instance: name,
                result,
            })
        })
        .collect();
    RunReport { outcomes }
}
