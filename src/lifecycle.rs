//! Lifecycle actions and the transition planner.
//!
//! Actions are totally ordered (`destroy < create < converge < setup <
//! verify`). Moving forwards runs every intermediate action; asking for the
//! current or an earlier action runs only that action.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// A single lifecycle action an instance can perform.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Action {
    /// Tear the instance down and forget its state.
    Destroy,
    /// Bring the underlying machine into existence.
    Create,
    /// Run the provisioner against the instance.
    Converge,
    /// Prepare the instance for verification.
    Setup,
    /// Run the verifier against the instance.
    Verify,
}

impl Action {
    /// All actions in lifecycle order.
    pub const ALL: [Self; 5] = [
        Self::Destroy,
        Self::Create,
        Self::Converge,
        Self::Setup,
        Self::Verify,
    ];

    /// Position of the action in the lifecycle order.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Destroy => 0,
            Self::Create => 1,
            Self::Converge => 2,
            Self::Setup => 3,
            Self::Verify => 4,
        }
    }

    /// Lower-case name used in persisted state and on the command line.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Destroy => "destroy",
            Self::Create => "create",
            Self::Converge => "converge",
            Self::Setup => "setup",
            Self::Verify => "verify",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when parsing an action or destroy policy from text fails.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ParseLifecycleError {
    /// The text does not name a lifecycle action.
    #[error("unknown lifecycle action '{0}'")]
    UnknownAction(String),
    /// The text does not name a destroy policy.
    #[error("destroy mode must be one of passing, always, never (got '{0}')")]
    UnknownDestroyPolicy(String),
}

impl FromStr for Action {
    type Err = ParseLifecycleError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|action| action.as_str() == value.trim())
            .ok_or_else(|| ParseLifecycleError::UnknownAction(value.to_owned()))
    }
}

/// Computes the ordered actions needed to move from `last` to `desired`.
///
/// An absent `last` action is treated as `destroy`. The returned plan is
/// never empty.
///
/// # Examples
///
/// ```
/// use galley::lifecycle::{Action, plan};
///
/// assert_eq!(
///     plan(Some(Action::Create), Action::Verify),
///     vec![Action::Converge, Action::Setup, Action::Verify]
/// );
/// assert_eq!(plan(Some(Action::Verify), Action::Create), vec![Action::Create]);
/// ```
#[must_use]
pub fn plan(last: Option<Action>, desired: Action) -> Vec<Action> {
    let last_index = last.map_or(0, Action::index);
    let desired_index = desired.index();
    if last_index >= desired_index {
        return vec![desired];
    }

    Action::ALL
        .into_iter()
        .filter(|action| action.index() > last_index && action.index() <= desired_index)
        .collect()
}

/// Teardown behaviour for the composite `test` action.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum DestroyPolicy {
    /// Destroy only when every step passed.
    #[default]
    Passing,
    /// Destroy regardless of the outcome.
    Always,
    /// Leave the instance running.
    Never,
}

impl DestroyPolicy {
    /// Lower-case name used on the command line.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Passing => "passing",
            Self::Always => "always",
            Self::Never => "never",
        }
    }
}

impl fmt::Display for DestroyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DestroyPolicy {
    type Err = ParseLifecycleError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "passing" => Ok(Self::Passing),
            "always" => Ok(Self::Always),
            "never" => Ok(Self::Never),
            other => Err(ParseLifecycleError::UnknownDestroyPolicy(other.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(None, Action::Converge, vec![Action::Create, Action::Converge])]
    #[case(Some(Action::Destroy), Action::Create, vec![Action::Create])]
    #[case(
        Some(Action::Create),
        Action::Verify,
        vec![Action::Converge, Action::Setup, Action::Verify]
    )]
    #[case(None, Action::Verify, vec![Action::Create, Action::Converge, Action::Setup, Action::Verify])]
    #[case(Some(Action::Verify), Action::Create, vec![Action::Create])]
    #[case(Some(Action::Verify), Action::Verify, vec![Action::Verify])]
    #[case(Some(Action::Setup), Action::Destroy, vec![Action::Destroy])]
    #[case(None, Action::Destroy, vec![Action::Destroy])]
    fn plan_matches_expected_sequence(
        #[case] last: Option<Action>,
        #[case] desired: Action,
        #[case] expected: Vec<Action>,
    ) {
        assert_eq!(plan(last, desired), expected);
    }

    #[test]
    fn plan_is_never_empty_and_increasing() {
        let lasts = std::iter::once(None).chain(Action::ALL.into_iter().map(Some));
        for last in lasts {
            for desired in Action::ALL {
                let steps = plan(last, desired);
                assert!(!steps.is_empty(), "{last:?} -> {desired}");
                assert_eq!(steps.last(), Some(&desired));
                assert!(
                    steps.windows(2).all(|pair| matches!(pair, [a, b] if a < b)),
                    "plan should be strictly increasing: {steps:?}"
                );
            }
        }
    }

    #[rstest]
    #[case("destroy", Action::Destroy)]
    #[case("verify", Action::Verify)]
    #[case(" setup ", Action::Setup)]
    fn actions_parse_from_names(#[case] raw: &str, #[case] expected: Action) {
        assert_eq!(raw.parse::<Action>(), Ok(expected));
    }

    #[test]
    fn destroy_policy_rejects_unknown_values() {
        let err = "sometimes"
            .parse::<DestroyPolicy>()
            .expect_err("unknown policy should fail");
        assert!(err.to_string().contains("passing, always, never"));
    }
}
