//! Shareable connection handles and their per-session state.
//!
//! A [`Connection`] is a cheap, cloneable handle to one physical session.
//! The transaction frame, lease and deferred rollback statements live next
//! to the driver rather than in any task, so a statement issued by a
//! borrower lands in the same transaction the owner opened.
//!
//! # Locking
//!
//! - The driver sits behind a [`tokio::sync::Mutex`]; holding it is what
//!   orders statements on the session.
//! - Bookkeeping sits behind a [`parking_lot::Mutex`] that is never held
//!   across an `.await`.
//!
//! Code that changes transaction state takes the driver lock first, so
//! state only changes once the matching statement has succeeded.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{MutexGuard, OwnedSemaphorePermit};

use crate::domain::{ConnectionId, ControlStatement, LeaseState, LeaseToken, TransactionFrame};
use crate::driver::Driver;
use crate::error::{DriverError, LeaseError, TxError};

/// Exclusive access to the driver of a connection.
pub type DriverGuard<'a, D> = MutexGuard<'a, D>;

/// Observable state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transaction is open.
    Idle,
    /// A frame is open, `depth` levels deep.
    InTransaction {
        /// Nesting depth (1 = outermost frame only).
        depth: usize,
    },
    /// A frame is open and the connection is lent to a borrower.
    Leased {
        /// Nesting depth (1 = outermost frame only).
        depth: usize,
    },
}

impl ConnectionState {
    /// Nesting depth; `0` when idle.
    #[must_use]
    pub const fn depth(self) -> usize {
        match self {
            Self::Idle => 0,
            Self::InTransaction { depth } | Self::Leased { depth } => depth,
        }
    }
}

/// Bookkeeping for one session.
#[derive(Debug, Default)]
pub(crate) struct SessionState {
    pub(crate) frame: Option<TransactionFrame>,
    pub(crate) lease: Option<LeaseToken>,
    /// Rollbacks queued by abandoned levels, run before the next statement.
    pub(crate) pending: Vec<ControlStatement>,
    pub(crate) broken: bool,
}

impl SessionState {
    fn connection_state(&self) -> ConnectionState {
        match (&self.frame, &self.lease) {
            (None, _) => ConnectionState::Idle,
            (Some(frame), Some(_)) => ConnectionState::Leased {
                depth: frame.depth(),
            },
            (Some(frame), None) => ConnectionState::InTransaction {
                depth: frame.depth(),
            },
        }
    }

    /// Queues the rollback of the level at `depth` of frame `frame_id`, and
    /// of every level above it. Returns `false` if that level is already
    /// gone.
    pub(crate) fn abandon(&mut self, frame_id: uuid::Uuid, depth: usize) -> bool {
        let Some(frame) = self.frame.as_mut() else {
            return false;
        };
        if frame.id() != frame_id {
            return false;
        }
        if depth <= 1 {
            self.frame = None;
            self.pending.push(ControlStatement::Rollback);
            return true;
        }
        match frame.unwind_to(depth) {
            Some(marker) => {
                self.pending
                    .push(ControlStatement::RollbackToSavepoint(marker.name.clone()));
                self.pending
                    .push(ControlStatement::ReleaseSavepoint(marker.name));
                true
            }
            None => false,
        }
    }
}

struct Session<D> {
    id: ConnectionId,
    driver: tokio::sync::Mutex<D>,
    state: Mutex<SessionState>,
}

/// Cloneable handle to one physical database session.
///
/// Clones refer to the same session. The pool decides who may hold a
/// handle; the handle itself carries no owner.
pub struct Connection<D> {
    session: Arc<Session<D>>,
}

impl<D> Clone for Connection<D> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
        }
    }
}

impl<D> fmt::Debug for Connection<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.session.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<D> Connection<D> {
    pub(crate) fn new(driver: D) -> Self {
        Self {
            session: Arc::new(Session {
                id: ConnectionId::new(),
                driver: tokio::sync::Mutex::new(driver),
                state: Mutex::new(SessionState::default()),
            }),
        }
    }

    /// Session identifier.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.session.id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.session.state.lock().connection_state()
    }

    /// Current nesting depth; `0` when idle.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.state().depth()
    }

    /// `true` once a fatal driver error was seen; the pool replaces broken
    /// sessions instead of reusing them.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.session.state.lock().broken
    }

    /// Runs `f` against the bookkeeping state.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        f(&mut self.session.state.lock())
    }

    /// `true` if both handles refer to the same session.
    #[must_use]
    pub fn same_session(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.session, &other.session)
    }
}

impl<D: Driver> Connection<D> {
    /// Locks the driver for direct use, after running any queued rollback.
    ///
    /// Statements issued through the guard run inside whatever transaction
    /// is open on the session.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::Driver`] if a queued rollback fails. The
    /// connection is then flagged broken.
    pub async fn lock(&self) -> Result<DriverGuard<'_, D>, TxError> {
        let mut driver = self.session.driver.lock().await;
        self.flush_pending(&mut *driver).await?;
        Ok(driver)
    }

    /// Runs `sql` and returns the number of rows affected.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::Driver`] if the statement fails.
    pub async fn execute(&self, sql: &str) -> Result<u64, TxError> {
        let mut driver = self.lock().await?;
        let result = driver.execute(sql).await;
        Ok(self.observe(result)?)
    }

    /// Runs `sql` and returns the first column of the first row, if any.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::Driver`] if the statement fails.
    pub async fn fetch_i64(&self, sql: &str) -> Result<Option<i64>, TxError> {
        let mut driver = self.lock().await?;
        let result = driver.fetch_i64(sql).await;
        Ok(self.observe(result)?)
    }

    /// Runs one control statement on an already locked driver.
    pub(crate) async fn run_control(
        &self,
        driver: &mut D,
        statement: &ControlStatement,
    ) -> Result<(), DriverError> {
        let sql = driver.control_sql(statement);
        tracing::debug!(connection = %self.id(), statement = %sql, "control statement");
        let result = driver.execute(&sql).await.map(|_| ());
        self.observe(result)
    }

    /// Runs every queued rollback. Any failure leaves the server-side
    /// transaction state unknown: the session is flagged broken and the
    /// first failure returned.
    async fn flush_pending(&self, driver: &mut D) -> Result<(), DriverError> {
        let pending = self.with_state(|state| std::mem::take(&mut state.pending));
        let mut first_failure = None;
        for statement in pending {
            if let Err(err) = self.run_control(driver, &statement).await {
                tracing::warn!(
                    connection = %self.id(),
                    error = %err,
                    "deferred rollback failed"
                );
                first_failure.get_or_insert(err);
            }
        }
        match first_failure {
            None => Ok(()),
            Some(err) => {
                self.with_state(|state| state.broken = true);
                tracing::warn!(
                    connection = %self.id(),
                    "transaction state unknown; connection will be discarded"
                );
                Err(err)
            }
        }
    }

    fn observe<T>(&self, result: Result<T, DriverError>) -> Result<T, DriverError> {
        if let Err(err) = &result
            && err.fatal
        {
            tracing::warn!(connection = %self.id(), error = %err, "connection broken");
            self.with_state(|state| state.broken = true);
        }
        result
    }

    /// Grants a lease on this connection.
    pub(crate) fn grant_lease(&self) -> Result<uuid::Uuid, LeaseError> {
        self.with_state(|state| {
            if state.frame.is_none() {
                return Err(LeaseError::NoActiveTransaction(self.id()));
            }
            if state
                .lease
                .as_ref()
                .is_some_and(|lease| lease.state() == LeaseState::Granted)
            {
                return Err(LeaseError::AlreadyLeased(self.id()));
            }
            let token = LeaseToken::grant(self.id());
            let id = token.id();
            state.lease = Some(token);
            Ok(id)
        })
    }

    /// Clears the lease `lease_id` if it is still the current one.
    pub(crate) fn clear_lease(&self, lease_id: uuid::Uuid) -> Option<LeaseToken> {
        self.with_state(|state| {
            if state.lease.as_ref().is_some_and(|l| l.id() == lease_id) {
                state.lease.take().map(|mut token| {
                    let held = token.reclaim();
                    tracing::debug!(
                        connection = %self.id(),
                        lease = %lease_id,
                        owner = ?token.owner(),
                        held_ms = held.num_milliseconds(),
                        "lease reclaimed"
                    );
                    token
                })
            } else {
                None
            }
        })
    }

    /// Waits for any in-flight statement, then clears the lease.
    pub(crate) async fn reclaim_lease(&self, lease_id: uuid::Uuid) -> Option<LeaseToken> {
        let _driver = self.session.driver.lock().await;
        self.clear_lease(lease_id)
    }

    /// `true` while lease `lease_id` is granted and its frame still open.
    fn holds_lease(&self, lease_id: uuid::Uuid) -> bool {
        self.with_state(|state| {
            state.frame.is_some()
                && state
                    .lease
                    .as_ref()
                    .is_some_and(|l| l.id() == lease_id && l.state() == LeaseState::Granted)
        })
    }

    /// Locks the driver on behalf of lease `lease_id`. The lease is checked
    /// under the driver lock, before any queued rollback runs.
    async fn lock_leased(&self, lease_id: uuid::Uuid) -> Result<DriverGuard<'_, D>, TxError> {
        let mut driver = self.session.driver.lock().await;
        if !self.holds_lease(lease_id) {
            return Err(LeaseError::Reclaimed(self.id()).into());
        }
        self.flush_pending(&mut *driver).await?;
        Ok(driver)
    }
}

/// A lent connection as seen by its borrower.
///
/// Only one exists at a time per lease. It never exposes the underlying
/// [`Connection`]: every statement goes through the lease check, so once
/// the owner reclaims the lease each call fails with
/// [`LeaseError::Reclaimed`].
pub struct BorrowedConnection<D> {
    connection: Connection<D>,
    lease_id: uuid::Uuid,
    _turn: OwnedSemaphorePermit,
}

impl<D> fmt::Debug for BorrowedConnection<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BorrowedConnection")
            .field("connection", &self.connection)
            .field("lease", &self.lease_id)
            .finish()
    }
}

impl<D: Driver> BorrowedConnection<D> {
    pub(crate) fn new(
        connection: Connection<D>,
        lease_id: uuid::Uuid,
        turn: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            connection,
            lease_id,
            _turn: turn,
        }
    }

    /// Session identifier of the lent connection.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    /// `true` once the owner took the connection back.
    #[must_use]
    pub fn is_reclaimed(&self) -> bool {
        !self.connection.holds_lease(self.lease_id)
    }

    /// Runs `sql` inside the owner's transaction.
    ///
    /// No statement from a borrower reaches the session after the owner
    /// reclaimed it.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::Lease`] after reclamation, or [`TxError::Driver`]
    /// if the statement fails.
    pub async fn execute(&self, sql: &str) -> Result<u64, TxError> {
        let mut driver = self.connection.lock_leased(self.lease_id).await?;
        let result = driver.execute(sql).await;
        Ok(self.connection.observe(result)?)
    }

    /// Runs `sql` inside the owner's transaction and returns the first
    /// column of the first row, if any.
    ///
    /// # Errors
    ///
    /// Same as [`BorrowedConnection::execute`].
    pub async fn fetch_i64(&self, sql: &str) -> Result<Option<i64>, TxError> {
        let mut driver = self.connection.lock_leased(self.lease_id).await?;
        let result = driver.fetch_i64(sql).await;
        Ok(self.connection.observe(result)?)
    }
}
