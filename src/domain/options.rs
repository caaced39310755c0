//! Typed transaction options and close outcomes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// When a transaction level is rolled back instead of committed.
///
/// Every policy rolls back when the protected work fails. The policies only
/// differ on success: `Always` still rolls back, which is what keeps test
/// runs free of committed side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackPolicy {
    /// Commit on success. No rollback is ever forced.
    Never,
    /// Roll back unconditionally, even on success.
    #[default]
    Always,
    /// Commit on success, roll back on failure.
    OnError,
}

impl RollbackPolicy {
    /// Returns `true` if this level must be rolled back given `outcome`.
    #[must_use]
    pub const fn rolls_back(self, outcome: Outcome) -> bool {
        match (self, outcome) {
            (_, Outcome::Failure) | (Self::Always, Outcome::Success) => true,
            (Self::Never | Self::OnError, Outcome::Success) => false,
        }
    }

    /// Lower-case name as used in configuration.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Never => "never",
            Self::Always => "always",
            Self::OnError => "on_error",
        }
    }
}

impl fmt::Display for RollbackPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RollbackPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "never" => Ok(Self::Never),
            "always" => Ok(Self::Always),
            "on_error" | "onerror" | "on-error" => Ok(Self::OnError),
            other => Err(other.to_string()),
        }
    }
}

/// Options for opening a transaction level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOptions {
    /// Close policy for the level being opened.
    pub rollback: RollbackPolicy,
    /// Nest as a savepoint if a frame is already open.
    pub savepoint: bool,
    /// Make every later request inside the new frame nest as a savepoint.
    /// Only read when the request opens a new frame.
    pub auto_savepoint: bool,
}

impl TransactionOptions {
    /// Rollback-only, nesting-friendly options for test isolation.
    #[must_use]
    pub const fn isolated() -> Self {
        Self {
            rollback: RollbackPolicy::Always,
            savepoint: true,
            auto_savepoint: true,
        }
    }

    /// Ordinary commit-on-success semantics.
    #[must_use]
    pub const fn committing() -> Self {
        Self {
            rollback: RollbackPolicy::OnError,
            savepoint: false,
            auto_savepoint: false,
        }
    }

    /// Returns a copy with `rollback` replaced.
    #[must_use]
    pub const fn with_rollback(mut self, rollback: RollbackPolicy) -> Self {
        self.rollback = rollback;
        self
    }

    /// Returns a copy with `savepoint` replaced.
    #[must_use]
    pub const fn with_savepoint(mut self, savepoint: bool) -> Self {
        self.savepoint = savepoint;
        self
    }

    /// Returns a copy with `auto_savepoint` replaced.
    #[must_use]
    pub const fn with_auto_savepoint(mut self, auto_savepoint: bool) -> Self {
        self.auto_savepoint = auto_savepoint;
        self
    }
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self::isolated()
    }
}

/// How the protected work finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The work completed normally.
    Success,
    /// The work failed, panicked or was cancelled.
    Failure,
}

impl Outcome {
    /// Maps a result to its outcome.
    #[must_use]
    pub const fn of<T, E>(result: &Result<T, E>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(_) => Self::Failure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_always_rolls_back() {
        for policy in [
            RollbackPolicy::Never,
            RollbackPolicy::Always,
            RollbackPolicy::OnError,
        ] {
            assert!(policy.rolls_back(Outcome::Failure), "{policy}");
        }
    }

    #[test]
    fn only_always_rolls_back_success() {
        assert!(RollbackPolicy::Always.rolls_back(Outcome::Success));
        assert!(!RollbackPolicy::OnError.rolls_back(Outcome::Success));
        assert!(!RollbackPolicy::Never.rolls_back(Outcome::Success));
    }

    #[test]
    fn parses_config_spellings() {
        assert_eq!("ALWAYS".parse(), Ok(RollbackPolicy::Always));
        assert_eq!("on-error".parse(), Ok(RollbackPolicy::OnError));
        assert_eq!("never".parse(), Ok(RollbackPolicy::Never));
        assert!("sometimes".parse::<RollbackPolicy>().is_err());
    }

    #[test]
    fn outcome_of_result() {
        let ok: Result<(), ()> = Ok(());
        let err: Result<(), ()> = Err(());
        assert_eq!(Outcome::of(&ok), Outcome::Success);
        assert_eq!(Outcome::of(&err), Outcome::Failure);
    }

    #[test]
    fn builders_replace_single_fields() {
        let opts = TransactionOptions::committing()
            .with_savepoint(true)
            .with_rollback(RollbackPolicy::Always);
        assert!(opts.savepoint);
        assert!(!opts.auto_savepoint);
        assert_eq!(opts.rollback, RollbackPolicy::Always);
    }
}
