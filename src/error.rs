//! Error types for every layer of the isolation stack.
//!
//! Each component surfaces its own enum so callers can match on the failure
//! class that matters to them:
//!
//! | Type                 | Raised by                      |
//! |----------------------|--------------------------------|
//! | [`DriverError`]      | the underlying database driver |
//! | [`PoolError`]        | [`crate::pool::ConnectionPool`] |
//! | [`TxError`]          | [`crate::service::TransactionManager`] |
//! | [`LeaseError`]       | [`crate::service::LeaseBroker`] |
//! | [`CoordinatorError`] | [`crate::service::MultiDatabaseCoordinator`] |
//! | [`ConfigError`]      | [`crate::config::IsolationConfig`] |
//!
//! Contention errors report `true` from `is_retryable`. Misuse errors and
//! [`CoordinatorError::PartialCommitRisk`] never do: retrying a `COMMIT` of
//! unknown outcome risks applying it twice.

use std::time::Duration;

use serde::Serialize;

use crate::domain::ConnectionId;

/// Failure reported by a database driver for a single statement.
#[derive(Debug, Clone, thiserror::Error)]
#[error("driver error: {message}")]
pub struct DriverError {
    /// Human-readable driver message.
    pub message: String,
    /// `true` when the session itself is unusable (I/O, protocol, closed).
    pub fatal: bool,
}

impl DriverError {
    /// A statement-level failure; the session stays usable.
    #[must_use]
    pub fn statement(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: false,
        }
    }

    /// A session-level failure; the connection must be replaced.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: true,
        }
    }
}

impl From<sqlx::Error> for DriverError {
    fn from(err: sqlx::Error) -> Self {
        let fatal = matches!(
            err,
            sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::Protocol(_)
                | sqlx::Error::WorkerCrashed
                | sqlx::Error::PoolClosed
        );
        Self {
            message: err.to_string(),
            fatal,
        }
    }
}

/// Connection pool failures.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The pool was closed; no further checkouts are possible.
    #[error("connection pool is closed")]
    Closed,

    /// No connection became free within the acquire timeout.
    #[error("timed out after {waited:?} waiting for a free connection")]
    Timeout {
        /// How long the checkout waited.
        waited: Duration,
    },

    /// Opening a physical connection failed.
    #[error("failed to open connection: {0}")]
    Connect(#[source] DriverError),

    /// The pool configuration is unusable.
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
}

impl PoolError {
    /// Returns `true` if the caller may retry after backing off.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Transaction lifecycle failures.
#[derive(Debug, thiserror::Error)]
pub enum TxError {
    /// A level was closed while a deeper level was still open, or its frame
    /// is no longer the one open on the connection.
    #[error(
        "nesting violation on connection {connection}: closing depth {requested} while depth {current} is open"
    )]
    NestingViolation {
        /// Connection the handle belongs to.
        connection: ConnectionId,
        /// Depth of the handle being closed.
        requested: usize,
        /// Depth currently open on the connection.
        current: usize,
    },

    /// A new top-level transaction was requested on a lent connection.
    #[error("connection {0} is lent out; only savepoints may be opened on it")]
    ConnectionBusy(ConnectionId),

    /// A top-level transaction was requested while one is already open and
    /// nesting was not requested.
    #[error("connection {0} already has an open transaction; request a savepoint to nest")]
    TransactionInProgress(ConnectionId),

    /// The operation needs an open transaction and there is none.
    #[error("no active transaction on connection {0}")]
    NoActiveTransaction(ConnectionId),

    /// The outermost frame cannot close while a lease on it is outstanding.
    #[error("connection {0} must be reclaimed before its transaction closes")]
    LeaseOutstanding(ConnectionId),

    /// A statement failed in the driver.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// The pool could not provide a connection.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// A borrowed connection was used outside its lease.
    #[error(transparent)]
    Lease(#[from] LeaseError),
}

impl TxError {
    /// Returns `true` if the caller may retry after backing off.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionBusy(_) => true,
            Self::Pool(err) => err.is_retryable(),
            Self::Lease(err) => err.is_retryable(),
            _ => false,
        }
    }
}

/// Connection lending failures.
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    /// Lending requires an open transaction on the connection.
    #[error("cannot lend connection {0}: no active transaction")]
    NoActiveTransaction(ConnectionId),

    /// Another lease on the connection is still outstanding.
    #[error("connection {0} is already lent out")]
    AlreadyLeased(ConnectionId),

    /// A borrower asked for the lent connection but nothing is lent.
    #[error("no connection is currently lent")]
    NothingLent,

    /// A borrowed handle was used after its lease was reclaimed.
    #[error("lease on connection {0} was reclaimed")]
    Reclaimed(ConnectionId),

    /// Lending is only deterministic on a single-connection pool.
    #[error("lending requires a pool of exactly one connection, found {0}")]
    PoolTooLarge(usize),
}

impl LeaseError {
    /// Returns `true` if the caller may retry after backing off.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::AlreadyLeased(_))
    }
}

/// How one participant of a coordinated session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "detail")]
pub enum ParticipantOutcome {
    /// The frame committed.
    Committed,
    /// The frame rolled back.
    RolledBack,
    /// Closing the frame failed; its state on the server is unknown.
    Failed(String),
}

/// Per-connection detail attached to [`CoordinatorError::PartialCommitRisk`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParticipantReport {
    /// Position of the connection in the declared sequence.
    pub index: usize,
    /// The connection.
    pub connection: ConnectionId,
    /// How its frame ended.
    #[serde(flatten)]
    pub outcome: ParticipantOutcome,
}

/// Multi-database coordination failures.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// Opening the frame at `index` failed; every earlier frame was rolled
    /// back.
    #[error("failed to open transaction {index} on connection {connection}: {source}")]
    Open {
        /// Position in the declared sequence.
        index: usize,
        /// Connection that could not open.
        connection: ConnectionId,
        /// Underlying failure.
        #[source]
        source: TxError,
    },

    /// At least one close failed; the set may not be atomic.
    #[error("close phase partially failed; {} participant(s) in unknown state", failed_count(.participants))]
    PartialCommitRisk {
        /// Outcome of every participant, in declared order.
        participants: Vec<ParticipantReport>,
    },
}

impl CoordinatorError {
    /// Returns `true` if the caller may retry after backing off.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Open { source, .. } => source.is_retryable(),
            Self::PartialCommitRisk { .. } => false,
        }
    }
}

fn failed_count(participants: &[ParticipantReport]) -> usize {
    participants
        .iter()
        .filter(|p| matches!(p.outcome, ParticipantOutcome::Failed(_)))
        .count()
}

/// Configuration failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable held a value outside its allowed set.
    #[error("invalid value {value:?} for {key}")]
    InvalidValue {
        /// Variable name.
        key: &'static str,
        /// Offending value.
        value: String,
    },
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn contention_errors_are_retryable() {
        let id = ConnectionId::new();
        assert!(TxError::ConnectionBusy(id).is_retryable());
        assert!(LeaseError::AlreadyLeased(id).is_retryable());
        assert!(
            TxError::Pool(PoolError::Timeout {
                waited: Duration::from_secs(1)
            })
            .is_retryable()
        );
    }

    #[test]
    fn misuse_errors_are_not_retryable() {
        let id = ConnectionId::new();
        assert!(!TxError::NoActiveTransaction(id).is_retryable());
        assert!(
            !TxError::NestingViolation {
                connection: id,
                requested: 1,
                current: 2,
            }
            .is_retryable()
        );
        assert!(!LeaseError::NoActiveTransaction(id).is_retryable());
        let risk = CoordinatorError::PartialCommitRisk {
            participants: Vec::new(),
        };
        assert!(!risk.is_retryable());
    }

    #[test]
    fn partial_commit_message_counts_failures() {
        let participants = vec![
            ParticipantReport {
                index: 0,
                connection: ConnectionId::new(),
                outcome: ParticipantOutcome::RolledBack,
            },
            ParticipantReport {
                index: 1,
                connection: ConnectionId::new(),
                outcome: ParticipantOutcome::Failed("network".to_string()),
            },
        ];
        let err = CoordinatorError::PartialCommitRisk { participants };
        assert!(err.to_string().contains("1 participant(s)"));
    }

    #[test]
    fn participant_report_serializes_outcome_inline() {
        let id = ConnectionId::new();
        let report = ParticipantReport {
            index: 2,
            connection: id,
            outcome: ParticipantOutcome::Failed("boom".to_string()),
        };
        let Ok(json) = serde_json::to_value(&report) else {
            panic!("serialization failed");
        };
        assert_eq!(json["index"], 2);
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["detail"], "boom");
        assert_eq!(json["connection"], id.to_string());
    }

    #[test]
    fn sqlx_io_errors_are_fatal() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let err = DriverError::from(sqlx::Error::Io(io));
        assert!(err.fatal);

        let err = DriverError::from(sqlx::Error::RowNotFound);
        assert!(!err.fatal);
    }
}
