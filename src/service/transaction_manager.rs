//! Transaction manager: opens and closes frames and savepoints.
//!
//! Every close is driven by a [`TransactionHandle`]. A handle that is
//! dropped without being closed (its future was cancelled, or the work
//! panicked past it) queues the rollback of its level on the connection,
//! so leaving a protected scope by any path ends in a rollback.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::FutureExt;

use crate::config::{IsolationConfig, is_identifier};
use crate::domain::{ControlStatement, Outcome, TransactionFrame, TransactionOptions};
use crate::driver::Driver;
use crate::error::{ConfigError, TxError};
use crate::pool::Connection;
use crate::pool::connection::SessionState;

/// Which level a handle closes.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Level {
    Frame,
    Savepoint(String),
}

/// An open transaction level, closed with
/// [`TransactionManager::end_transaction`].
pub struct TransactionHandle<D> {
    connection: Connection<D>,
    frame_id: uuid::Uuid,
    depth: usize,
    level: Level,
    closed: bool,
}

impl<D> fmt::Debug for TransactionHandle<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("connection", &self.connection.id())
            .field("depth", &self.depth)
            .field("level", &self.level)
            .finish_non_exhaustive()
    }
}

impl<D> TransactionHandle<D> {
    /// The connection this level is open on.
    #[must_use]
    pub fn connection(&self) -> &Connection<D> {
        &self.connection
    }

    /// Nesting depth of this level (the frame itself is depth 1).
    #[must_use]
    pub const fn depth(&self) -> usize {
        self.depth
    }

    /// `true` if this level is a savepoint inside an enclosing frame.
    #[must_use]
    pub const fn is_savepoint(&self) -> bool {
        matches!(self.level, Level::Savepoint(_))
    }

    /// Savepoint name, for savepoint levels.
    #[must_use]
    pub fn savepoint_name(&self) -> Option<&str> {
        match &self.level {
            Level::Frame => None,
            Level::Savepoint(name) => Some(name),
        }
    }

    /// `true` if closing this level with `outcome` rolls it back. A level
    /// that is no longer open reports `true`.
    #[must_use]
    pub fn rolls_back(&self, outcome: Outcome) -> bool {
        self.connection.with_state(|state| {
            let Some(frame) = state.frame.as_ref().filter(|f| f.id() == self.frame_id) else {
                return true;
            };
            match &self.level {
                Level::Frame => frame.rolls_back(outcome),
                Level::Savepoint(name) => frame
                    .savepoint(name)
                    .is_none_or(|marker| marker.rolls_back(outcome)),
            }
        })
    }
}

impl<D> Drop for TransactionHandle<D> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let abandoned = self
            .connection
            .with_state(|state| state.abandon(self.frame_id, self.depth));
        if abandoned {
            tracing::warn!(
                connection = %self.connection.id(),
                depth = self.depth,
                "transaction level abandoned; rollback queued"
            );
        }
    }
}

/// Why [`TransactionManager::try_end_transaction`] did not close a level.
#[derive(thiserror::Error)]
pub enum CloseError<D> {
    /// Refused before any statement was sent. The level is still open and
    /// `handle` closes it once the levels above it are closed.
    #[error("close refused: {error}")]
    Rejected {
        /// Why the close was refused.
        #[source]
        error: TxError,
        /// The level, still open.
        handle: TransactionHandle<D>,
    },

    /// The level is gone, or its rollback is queued on the connection.
    #[error(transparent)]
    Failed(TxError),
}

impl<D> CloseError<D> {
    /// The underlying failure.
    #[must_use]
    pub const fn error(&self) -> &TxError {
        match self {
            Self::Rejected { error, .. } | Self::Failed(error) => error,
        }
    }
}

impl<D> fmt::Debug for CloseError<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected { error, handle } => f
                .debug_struct("Rejected")
                .field("error", error)
                .field("handle", handle)
                .finish(),
            Self::Failed(error) => f.debug_tuple("Failed").field(error).finish(),
        }
    }
}

/// What a begin request turns into.
enum Open {
    Frame,
    Savepoint { frame_id: uuid::Uuid },
}

/// Orchestrates frames and savepoints on explicitly passed connections.
///
/// Holds no per-connection state itself: frames live with the connection,
/// so one manager serves any number of connections and tasks.
#[derive(Debug)]
pub struct TransactionManager {
    savepoint_prefix: String,
    next_savepoint: AtomicU64,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    /// Creates a manager naming savepoints `tx_sp_<n>`.
    #[must_use]
    pub fn new() -> Self {
        Self::named("tx_sp".to_string())
    }

    /// Creates a manager naming savepoints `<prefix>_<n>`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] unless `prefix` is a plain SQL
    /// identifier.
    pub fn with_savepoint_prefix(prefix: impl Into<String>) -> Result<Self, ConfigError> {
        let prefix = prefix.into();
        if !is_identifier(&prefix) {
            return Err(ConfigError::InvalidValue {
                key: "savepoint_prefix",
                value: prefix,
            });
        }
        Ok(Self::named(prefix))
    }

    /// Creates a manager from loaded configuration.
    ///
    /// # Errors
    ///
    /// Same as [`TransactionManager::with_savepoint_prefix`].
    pub fn from_config(config: &IsolationConfig) -> Result<Self, ConfigError> {
        Self::with_savepoint_prefix(config.savepoint_prefix.as_str())
    }

    const fn named(savepoint_prefix: String) -> Self {
        Self {
            savepoint_prefix,
            next_savepoint: AtomicU64::new(1),
        }
    }

    fn next_savepoint_name(&self) -> String {
        let n = self.next_savepoint.fetch_add(1, Ordering::Relaxed);
        format!("{}_{n}", self.savepoint_prefix)
    }

    /// Opens a transaction level on `connection`.
    ///
    /// Nests as a savepoint when a frame is already open and either
    /// `options.savepoint` is set or the frame was opened with
    /// `auto_savepoint`; otherwise issues `BEGIN`.
    ///
    /// # Errors
    ///
    /// - [`TxError::ConnectionBusy`] if the connection is lent out and a new
    ///   top-level transaction was requested.
    /// - [`TxError::TransactionInProgress`] if a frame is open and nesting
    ///   was not requested.
    /// - [`TxError::Driver`] if the statement fails.
    pub async fn begin_transaction<D: Driver>(
        &self,
        connection: &Connection<D>,
        options: TransactionOptions,
    ) -> Result<TransactionHandle<D>, TxError> {
        let mut driver = connection.lock().await?;
        let plan = connection.with_state(|state| plan_open(connection, state, &options))?;

        match plan {
            Open::Frame => {
                connection
                    .run_control(&mut driver, &ControlStatement::Begin)
                    .await?;
                let frame = TransactionFrame::open(&options);
                let frame_id = frame.id();
                connection.with_state(|state| state.frame = Some(frame));
                tracing::debug!(
                    connection = %connection.id(),
                    rollback = %options.rollback,
                    auto_savepoint = options.auto_savepoint,
                    "transaction opened"
                );
                Ok(TransactionHandle {
                    connection: connection.clone(),
                    frame_id,
                    depth: 1,
                    level: Level::Frame,
                    closed: false,
                })
            }
            Open::Savepoint { frame_id } => {
                let name = self.next_savepoint_name();
                connection
                    .run_control(&mut driver, &ControlStatement::Savepoint(name.clone()))
                    .await?;
                let depth = connection.with_state(|state| match state.frame.as_mut() {
                    Some(frame) if frame.id() == frame_id => {
                        Ok(frame.push_savepoint(name.clone(), options.rollback))
                    }
                    _ => Err(TxError::NoActiveTransaction(connection.id())),
                })?;
                tracing::debug!(
                    connection = %connection.id(),
                    savepoint = %name,
                    depth,
                    rollback = %options.rollback,
                    "savepoint opened"
                );
                Ok(TransactionHandle {
                    connection: connection.clone(),
                    frame_id,
                    depth,
                    level: Level::Savepoint(name),
                    closed: false,
                })
            }
        }
    }

    /// Closes the level behind `handle`.
    ///
    /// Commits (frame) or releases (savepoint) when the level's policy
    /// allows it for `outcome`; otherwise rolls the level back. A frame
    /// opened with [`crate::domain::RollbackPolicy::Always`], or in which a
    /// savepoint failed to close, is always rolled back.
    ///
    /// A close refused with [`TxError::NestingViolation`] or
    /// [`TxError::LeaseOutstanding`] abandons the level: its rollback, and
    /// that of every level above it, is queued on the connection. Use
    /// [`TransactionManager::try_end_transaction`] to get the handle back
    /// instead.
    ///
    /// # Errors
    ///
    /// - [`TxError::NestingViolation`] if a deeper level is still open, or
    ///   the level is not the innermost one.
    /// - [`TxError::NoActiveTransaction`] if the handle's frame is gone.
    /// - [`TxError::LeaseOutstanding`] if closing the frame of a lent
    ///   connection.
    /// - [`TxError::Driver`] if the closing statement fails. A frame whose
    ///   `COMMIT` or `ROLLBACK` failed is in an unknown state, so its
    ///   connection is flagged broken and never reused.
    pub async fn end_transaction<D: Driver>(
        &self,
        handle: TransactionHandle<D>,
        outcome: Outcome,
    ) -> Result<(), TxError> {
        match self.try_end_transaction(handle, outcome).await {
            Ok(()) => Ok(()),
            Err(CloseError::Failed(error)) => Err(error),
            Err(CloseError::Rejected { error, handle }) => {
                drop(handle);
                Err(error)
            }
        }
    }

    /// Closes the level behind `handle`, handing it back if the close is
    /// refused.
    ///
    /// # Errors
    ///
    /// - [`CloseError::Rejected`] with [`TxError::NestingViolation`] or
    ///   [`TxError::LeaseOutstanding`]. No statement was sent and the
    ///   returned handle still owns the level.
    /// - [`CloseError::Failed`] for every other error of
    ///   [`TransactionManager::end_transaction`].
    pub async fn try_end_transaction<D: Driver>(
        &self,
        mut handle: TransactionHandle<D>,
        outcome: Outcome,
    ) -> Result<(), CloseError<D>> {
        let connection = handle.connection.clone();
        let mut driver = connection.lock().await.map_err(CloseError::Failed)?;

        let rolls_back = match connection.with_state(|state| check_close(&handle, state, outcome))
        {
            Ok(rolls_back) => rolls_back,
            Err(error @ (TxError::NestingViolation { .. } | TxError::LeaseOutstanding(_))) => {
                tracing::warn!(
                    connection = %connection.id(),
                    depth = handle.depth,
                    error = %error,
                    "close refused; level left open"
                );
                return Err(CloseError::Rejected { error, handle });
            }
            Err(error) => {
                handle.closed = true;
                return Err(CloseError::Failed(error));
            }
        };

        let result = match &handle.level {
            Level::Frame => close_frame(&connection, &mut driver, rolls_back).await,
            Level::Savepoint(name) => {
                close_savepoint(&connection, &mut driver, name, rolls_back).await
            }
        };
        handle.closed = true;
        result.map_err(CloseError::Failed)
    }

    /// Runs `work` inside a transaction level on `connection`.
    ///
    /// `work` receives a handle to the same connection and sees its own
    /// uncommitted writes. The level is closed per `options.rollback` when
    /// `work` returns, and always rolled back when it fails or panics
    /// before the failure is passed on.
    ///
    /// # Errors
    ///
    /// Returns the error of `work`, or a [`TxError`] (converted into `E`)
    /// if the level cannot be opened or closed.
    ///
    /// # Panics
    ///
    /// Resumes a panic raised by `work`, after rolling its level back.
    pub async fn run_in_transaction<D, F, Fut, T, E>(
        &self,
        connection: &Connection<D>,
        options: TransactionOptions,
        work: F,
    ) -> Result<T, E>
    where
        D: Driver,
        F: FnOnce(Connection<D>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TxError>,
    {
        let handle = self.begin_transaction(connection, options).await?;
        let result = AssertUnwindSafe(work(connection.clone()))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(value)) => {
                self.end_transaction(handle, Outcome::Success).await?;
                Ok(value)
            }
            Ok(Err(err)) => {
                tracing::warn!(
                    connection = %connection.id(),
                    depth = handle.depth(),
                    "work failed; rolling back"
                );
                if let Err(close_err) = self.end_transaction(handle, Outcome::Failure).await {
                    tracing::warn!(
                        connection = %connection.id(),
                        error = %close_err,
                        "rollback after failed work did not complete"
                    );
                }
                Err(err)
            }
            Err(panic) => {
                tracing::warn!(
                    connection = %connection.id(),
                    depth = handle.depth(),
                    "work panicked; rolling back"
                );
                if let Err(close_err) = self.end_transaction(handle, Outcome::Failure).await {
                    tracing::warn!(
                        connection = %connection.id(),
                        error = %close_err,
                        "rollback after panic did not complete"
                    );
                }
                std::panic::resume_unwind(panic)
            }
        }
    }
}

fn plan_open<D>(
    connection: &Connection<D>,
    state: &SessionState,
    options: &TransactionOptions,
) -> Result<Open, TxError> {
    match &state.frame {
        Some(frame) if options.savepoint || frame.auto_savepoint() => Ok(Open::Savepoint {
            frame_id: frame.id(),
        }),
        _ if state.lease.is_some() => Err(TxError::ConnectionBusy(connection.id())),
        Some(_) => Err(TxError::TransactionInProgress(connection.id())),
        None => Ok(Open::Frame),
    }
}

/// Validates that `handle` closes the innermost open level. Returns whether
/// closing it with `outcome` rolls it back.
fn check_close<D>(
    handle: &TransactionHandle<D>,
    state: &SessionState,
    outcome: Outcome,
) -> Result<bool, TxError> {
    let id = handle.connection.id();
    let frame = match &state.frame {
        Some(frame) if frame.id() == handle.frame_id => frame,
        _ => return Err(TxError::NoActiveTransaction(id)),
    };

    let violation = TxError::NestingViolation {
        connection: id,
        requested: handle.depth,
        current: frame.depth(),
    };
    if frame.depth() != handle.depth {
        return Err(violation);
    }
    match &handle.level {
        Level::Frame if state.lease.is_some() => Err(TxError::LeaseOutstanding(id)),
        Level::Frame => Ok(frame.rolls_back(outcome)),
        Level::Savepoint(name) => match frame.innermost() {
            Some(marker) if &marker.name == name => Ok(marker.rolls_back(outcome)),
            _ => Err(violation),
        },
    }
}

async fn close_frame<D: Driver>(
    connection: &Connection<D>,
    driver: &mut D,
    rolls_back: bool,
) -> Result<(), TxError> {
    let statement = if rolls_back {
        ControlStatement::Rollback
    } else {
        ControlStatement::Commit
    };
    let result = connection.run_control(driver, &statement).await;
    let frame = connection.with_state(|state| state.frame.take());
    let forced = frame.as_ref().is_some_and(TransactionFrame::forced_rollback);
    let elapsed_ms = frame
        .map(|f| (chrono::Utc::now() - f.opened_at()).num_milliseconds())
        .unwrap_or_default();

    match result {
        Ok(()) => {
            tracing::debug!(
                connection = %connection.id(),
                committed = !rolls_back,
                forced,
                elapsed_ms,
                "transaction closed"
            );
            Ok(())
        }
        Err(err) => {
            if !rolls_back
                && let Err(rollback_err) = connection
                    .run_control(driver, &ControlStatement::Rollback)
                    .await
            {
                tracing::warn!(
                    connection = %connection.id(),
                    error = %rollback_err,
                    "rollback after failed commit did not complete"
                );
            }
            connection.with_state(|state| state.broken = true);
            tracing::warn!(
                connection = %connection.id(),
                error = %err,
                "transaction close failed; connection will be discarded"
            );
            Err(err.into())
        }
    }
}

async fn close_savepoint<D: Driver>(
    connection: &Connection<D>,
    driver: &mut D,
    name: &str,
    rolls_back: bool,
) -> Result<(), TxError> {
    let result = if rolls_back {
        discard_savepoint(connection, driver, name).await
    } else {
        connection
            .run_control(driver, &ControlStatement::ReleaseSavepoint(name.to_string()))
            .await
    };

    match result {
        Ok(()) => {
            connection.with_state(|state| {
                if let Some(frame) = state.frame.as_mut() {
                    frame.pop_savepoint(name);
                }
            });
            tracing::debug!(
                connection = %connection.id(),
                savepoint = %name,
                released = !rolls_back,
                "savepoint closed"
            );
            Ok(())
        }
        Err(err) => {
            if !rolls_back
                && let Err(discard_err) = discard_savepoint(connection, driver, name).await
            {
                tracing::warn!(
                    connection = %connection.id(),
                    savepoint = %name,
                    error = %discard_err,
                    "rollback after failed release did not complete"
                );
            }
            // The enclosing frame can no longer vouch for this level's work.
            connection.with_state(|state| {
                if let Some(frame) = state.frame.as_mut() {
                    frame.pop_savepoint(name);
                    frame.mark_needs_rollback();
                }
            });
            tracing::warn!(
                connection = %connection.id(),
                savepoint = %name,
                error = %err,
                "savepoint close failed; enclosing frame will roll back"
            );
            Err(err.into())
        }
    }
}

async fn discard_savepoint<D: Driver>(
    connection: &Connection<D>,
    driver: &mut D,
    name: &str,
) -> Result<(), crate::error::DriverError> {
    connection
        .run_control(driver, &ControlStatement::RollbackToSavepoint(name.to_string()))
        .await?;
    connection
        .run_control(driver, &ControlStatement::ReleaseSavepoint(name.to_string()))
        .await
}
