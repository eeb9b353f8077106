//! Instances and the lifecycle transitions that drive them.
//!
//! An [`Instance`] is one suite on one platform. [`Instance::transition_to`]
//! computes the action plan from the persisted `last_action` and runs each
//! step through the driver, saving state after every step.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{Instrument, info, info_span, warn};

use crate::context::Context;
use crate::driver::{ActionError, Driver};
use crate::lifecycle::{Action, DestroyPolicy, plan};
use crate::matrix::{Platform, Suite, instance_name, merge_maps};
use crate::stage::Stage;
use crate::state::{State, StateError, StateStore};
use crate::transport::{LoginCommand, Transport};

/// Errors raised while driving an instance.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum InstanceError {
    /// A lifecycle action failed.
    #[error("{action} failed on {instance}: {source}")]
    ActionFailed {
        /// Instance name.
        instance: String,
        /// Action that failed.
        action: Action,
        /// Underlying failure.
        #[source]
        source: ActionError,
    },
    /// The state store could not be read or written.
    #[error("state error on {instance}: {source}")]
    State {
        /// Instance name.
        instance: String,
        /// Underlying failure.
        #[source]
        source: StateError,
    },
    /// The login command could not be built.
    #[error("cannot log in to {instance}: {source}")]
    Login {
        /// Instance name.
        instance: String,
        /// Underlying failure.
        #[source]
        source: ActionError,
    },
}

/// Components an [`Instance`] is assembled from.
pub struct InstanceParts {
    /// Suite under test.
    pub suite: Arc<Suite>,
    /// Platform the suite runs on; its driver manages the machine.
    pub platform: Arc<Platform>,
    /// Transport used to reach the machine.
    pub transport: Arc<dyn Transport>,
    /// Provisioner run by `converge`.
    pub provisioner: Arc<dyn Stage>,
    /// Verifier run by `verify`.
    pub verifier: Arc<dyn Stage>,
    /// Where the instance's state is persisted.
    pub store: Arc<dyn StateStore>,
    /// Shared process context.
    pub context: Arc<Context>,
}

/// One suite on one platform.
pub struct Instance {
    name: String,
    suite: Arc<Suite>,
    platform: Arc<Platform>,
    driver: Arc<dyn Driver>,
    transport: Arc<dyn Transport>,
    provisioner: Arc<dyn Stage>,
    verifier: Arc<dyn Stage>,
    store: Arc<dyn StateStore>,
    context: Arc<Context>,
}

impl Instance {
    /// Assembles an instance; its name is the slug of `<suite>-<platform>`.
    #[must_use]
    pub fn new(parts: InstanceParts) -> Self {
        let InstanceParts {
            suite,
            platform,
            transport,
            provisioner,
            verifier,
            store,
            context,
        } = parts;
        Self {
            name: instance_name(suite.name(), platform.name()),
            driver: Arc::clone(platform.driver()),
            suite,
            platform,
            transport,
            provisioner,
            verifier,
            store,
            context,
        }
    }

    /// Instance name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Suite under test.
    #[must_use]
    pub fn suite(&self) -> &Suite {
        &self.suite
    }

    /// Target platform.
    #[must_use]
    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Driver managing the machine.
    #[must_use]
    pub const fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Transport reaching the machine.
    #[must_use]
    pub const fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Provisioner run by `converge`.
    #[must_use]
    pub const fn provisioner(&self) -> &Arc<dyn Stage> {
        &self.provisioner
    }

    /// Verifier run by `verify`.
    #[must_use]
    pub const fn verifier(&self) -> &Arc<dyn Stage> {
        &self.verifier
    }

    /// Shared process context.
    #[must_use]
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Platform run-list followed by the suite run-list.
    #[must_use]
    pub fn run_list(&self) -> Vec<String> {
        self.platform
            .run_list()
            .iter()
            .chain(self.suite.run_list())
            .cloned()
            .collect()
    }

    /// Platform attributes overlaid by suite attributes.
    #[must_use]
    pub fn attributes(&self) -> Map<String, Value> {
        merge_maps(self.platform.attributes(), self.suite.attributes())
    }

    /// Last action recorded in the persisted state.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::State`] when the state cannot be read.
    pub fn last_action(&self) -> Result<Option<Action>, InstanceError> {
        Ok(self.load_state()?.last_action())
    }

    /// Drives the instance to `desired`, running every action the plan
    /// requires. The transport's cached connection is released afterwards.
    ///
    /// # Errors
    ///
    /// Returns the first failing step. State is saved before returning.
    pub async fn transition_to(&self, desired: Action) -> Result<(), InstanceError> {
        let span = info_span!(parent: self.context.span(), "instance", instance = %self.name);
        let result = self.run_plan(desired).instrument(span.clone()).await;
        self.release().instrument(span).await;
        result
    }

    /// Runs `destroy`, the plan to `verify`, and the final `destroy` allowed
    /// by `policy`. A failure is returned even when the teardown succeeds.
    ///
    /// # Errors
    ///
    /// Returns the first failing step.
    pub async fn test(&self, policy: DestroyPolicy) -> Result<(), InstanceError> {
        let span = info_span!(parent: self.context.span(), "test", instance = %self.name, %policy);
        let outcome = async {
            let mut result = self.transition_to(Action::Destroy).await;
            if result.is_ok() {
                result = self.transition_to(Action::Verify).await;
            }
            let teardown = match (&result, policy) {
                (_, DestroyPolicy::Never) | (Err(_), DestroyPolicy::Passing) => false,
                (Ok(_), _) | (Err(_), DestroyPolicy::Always) => true,
            };
            if teardown {
                let destroyed = self.transition_to(Action::Destroy).await;
                if result.is_ok() {
                    result = destroyed;
                } else if let Err(err) = destroyed {
                    warn!(error = %err, "teardown after failure also failed");
                }
            }
            result
        };
        outcome.instrument(span).await
    }

    /// Interactive login command for the instance's machine.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::Login`] when the instance has not been
    /// created or the transport cannot describe a login.
    pub fn login_command(&self) -> Result<LoginCommand, InstanceError> {
        let state = self.load_state()?;
        if state.last_action().is_none() {
            return Err(InstanceError::Login {
                instance: self.name.clone(),
                source: ActionError::Failed("instance has not been created".to_owned()),
            });
        }
        self.driver
            .login_command(self, &state)
            .map_err(|source| InstanceError::Login {
                instance: self.name.clone(),
                source,
            })
    }

    async fn run_plan(&self, desired: Action) -> Result<(), InstanceError> {
        let last = self.load_state()?.last_action();
        for action in plan(last, desired) {
            self.perform(action).await?;
        }
        Ok(())
    }

    async fn perform(&self, action: Action) -> Result<(), InstanceError> {
        let mut state = self.load_state()?;
        let started = Instant::now();
        info!(%action, "starting");

        let result = match action {
            Action::Destroy => self.driver.destroy(self, &mut state).await,
            Action::Create => self.driver.create(self, &mut state).await,
            Action::Converge => self.driver.converge(self, &mut state).await,
            Action::Setup => self.driver.setup(self, &mut state).await,
            Action::Verify => self.driver.verify(self, &mut state).await,
        };
        if result.is_ok() {
            state.set_last_action(action);
        }
        match (self.save_state(&state), &result) {
            (Err(err), Ok(())) => return Err(err),
            (Err(err), Err(_)) => warn!(%action, error = %err, "failed to save state"),
            (Ok(()), _) => {}
        }

        let elapsed = started.elapsed();
        match result {
            Ok(()) => {
                info!(%action, ?elapsed, "finished");
                if action == Action::Destroy {
                    self.store
                        .destroy(&self.name)
                        .map_err(|source| self.state_error(source))?;
                }
                Ok(())
            }
            Err(source) => {
                warn!(%action, ?elapsed, error = %source, "failed");
                Err(InstanceError::ActionFailed {
                    instance: self.name.clone(),
                    action,
                    source,
                })
            }
        }
    }

    async fn release(&self) {
        if let Err(err) = self.transport.release().await {
            warn!(error = %err, "failed to release connection");
        }
    }

    fn load_state(&self) -> Result<State, InstanceError> {
        self.store
            .load(&self.name)
            .map_err(|source| self.state_error(source))
    }

    fn save_state(&self, state: &State) -> Result<(), InstanceError> {
        self.store
            .save(&self.name, state)
            .map_err(|source| self.state_error(source))
    }

    fn state_error(&self, source: StateError) -> InstanceError {
        InstanceError::State {
            instance: self.name.clone(),
            source,
        }
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("name", &self.name)
            .field("driver", &self.driver.name())
            .field("transport", &self.transport.name())
            .field("provisioner", &self.provisioner.name())
            .field("verifier", &self.verifier.name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DummyDriver, DummyOptions};
    use crate::test_support::{MemoryStateStore, test_instance};
    use rstest::rstest;

    fn failing_on(action: &str) -> Arc<DummyDriver> {
        Arc::new(
            DummyDriver::new(DummyOptions {
                fail_on: Some(action.to_owned()),
                ..DummyOptions::default()
            })
            .unwrap_or_else(|err| panic!("driver: {err}")),
        )
    }

    #[tokio::test]
    async fn converge_from_nothing_creates_first() {
        let driver = Arc::new(DummyDriver::default());
        let store = Arc::new(MemoryStateStore::new());
        let instance = test_instance(driver.clone(), store.clone());

        instance
            .transition_to(Action::Converge)
            .await
            .unwrap_or_else(|err| panic!("converge: {err}"));

        assert_eq!(driver.calls(), vec![Action::Create, Action::Converge]);
        let state = store
            .document("default-ubuntu")
            .unwrap_or_else(|| panic!("state missing"));
        assert_eq!(state.last_action(), Some(Action::Converge));
        assert_eq!(state.get_str("hostname"), Some("127.0.0.1"));
    }

    #[tokio::test]
    async fn failed_step_saves_state_without_advancing() {
        let driver = failing_on("converge");
        let store = Arc::new(MemoryStateStore::new());
        let instance = test_instance(driver.clone(), store.clone());

        let err = instance
            .transition_to(Action::Verify)
            .await
            .expect_err("converge should fail");

        assert!(matches!(
            err,
            InstanceError::ActionFailed { action: Action::Converge, .. }
        ));
        assert_eq!(driver.calls(), vec![Action::Create, Action::Converge]);
        assert_eq!(
            store.history(),
            vec![
                ("default-ubuntu".to_owned(), Some(Action::Create)),
                ("default-ubuntu".to_owned(), Some(Action::Create)),
            ]
        );
    }

    #[rstest]
    #[case::action_fails(Some("create"))]
    #[case::action_succeeds(None)]
    #[tokio::test]
    async fn unsaved_state_keeps_the_action_failure(#[case] fail_on: Option<&str>) {
        let driver = fail_on.map_or_else(|| Arc::new(DummyDriver::default()), failing_on);
        let store = Arc::new(MemoryStateStore::new());
        store.reject_saves();
        let instance = test_instance(driver, store);

        let err = instance
            .transition_to(Action::Create)
            .await
            .expect_err("transition should fail");

        if fail_on.is_some() {
            assert!(
                matches!(err, InstanceError::ActionFailed { action: Action::Create, .. }),
                "unexpected error: {err}"
            );
        } else {
            assert!(
                matches!(err, InstanceError::State { .. }),
                "unexpected error: {err}"
            );
        }
    }

    #[tokio::test]
    async fn destroy_removes_the_state_document() {
        let driver = Arc::new(DummyDriver::default());
        let store = Arc::new(MemoryStateStore::new());
        let instance = test_instance(driver.clone(), store.clone());

        instance
            .transition_to(Action::Create)
            .await
            .unwrap_or_else(|err| panic!("create: {err}"));
        instance
            .transition_to(Action::Destroy)
            .await
            .unwrap_or_else(|err| panic!("destroy: {err}"));

        assert!(store.document("default-ubuntu").is_none());
        assert_eq!(
            instance.last_action().unwrap_or_else(|err| panic!("{err}")),
            None
        );
    }

    #[tokio::test]
    async fn moving_backwards_runs_only_the_requested_action() {
        let driver = Arc::new(DummyDriver::default());
        let store = Arc::new(MemoryStateStore::new());
        let mut seeded = State::new();
        seeded.set_last_action(Action::Verify);
        store.insert("default-ubuntu", seeded);
        let instance = test_instance(driver.clone(), store.clone());

        instance
            .transition_to(Action::Create)
            .await
            .unwrap_or_else(|err| panic!("create: {err}"));

        assert_eq!(driver.calls(), vec![Action::Create]);
        assert_eq!(
            instance.last_action().unwrap_or_else(|err| panic!("{err}")),
            Some(Action::Create)
        );
    }

    #[rstest]
    #[case::passing_destroys(DestroyPolicy::Passing, None, true)]
    #[case::never_keeps(DestroyPolicy::Never, None, false)]
    #[case::passing_keeps_failures(DestroyPolicy::Passing, Some("verify"), false)]
    #[case::always_destroys_failures(DestroyPolicy::Always, Some("verify"), true)]
    #[tokio::test]
    async fn test_honours_the_destroy_policy(
        #[case] policy: DestroyPolicy,
        #[case] fail_on: Option<&str>,
        #[case] destroyed: bool,
    ) {
        let driver = fail_on.map_or_else(|| Arc::new(DummyDriver::default()), failing_on);
        let store = Arc::new(MemoryStateStore::new());
        let instance = test_instance(driver.clone(), store.clone());

        let result = instance.test(policy).await;

        assert_eq!(result.is_ok(), fail_on.is_none());
        assert_eq!(store.document("default-ubuntu").is_none(), destroyed);
        assert_eq!(driver.calls().first(), Some(&Action::Destroy));
        assert_eq!(driver.calls().last() == Some(&Action::Destroy), destroyed);
    }

    #[tokio::test]
    async fn passing_test_runs_the_full_cycle() {
        let driver = Arc::new(DummyDriver::default());
        let instance = test_instance(driver.clone(), Arc::new(MemoryStateStore::new()));

        instance
            .test(DestroyPolicy::Passing)
            .await
            .unwrap_or_else(|err| panic!("test: {err}"));

        assert_eq!(
            driver.calls(),
            vec![
                Action::Destroy,
                Action::Create,
                Action::Converge,
                Action::Setup,
                Action::Verify,
                Action::Destroy,
            ]
        );
    }

    #[tokio::test]
    async fn login_requires_a_created_instance() {
        let instance = test_instance(
            Arc::new(DummyDriver::default()),
            Arc::new(MemoryStateStore::new()),
        );

        let err = instance.login_command().expect_err("not created");
        assert!(err.to_string().contains("has not been created"));

        instance
            .transition_to(Action::Create)
            .await
            .unwrap_or_else(|err| panic!("create: {err}"));
        let login = instance
            .login_command()
            .unwrap_or_else(|err| panic!("login: {err}"));
        assert_eq!(login.program, "sh");
    }
}
