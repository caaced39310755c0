//! Bounded connection pool with a lending side door.
//!
//! [`ConnectionPool`] fills its sessions eagerly, hands them out through
//! [`ConnectionPool::checkout`] and takes them back when the
//! [`PooledConnection`] is dropped. A semaphore bounds how many sessions are
//! out at once; the idle list is a plain `Vec` behind a short lock.
//!
//! # Lending
//!
//! While a [`crate::service::LeaseBroker`] lends a connection, the pool
//! publishes it so another task can pick it up via
//! [`ConnectionPool::borrow_lent`]. That path never checks out a second
//! session, which is why lending requires a pool of exactly one.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::connection::{BorrowedConnection, Connection};
use crate::domain::ControlStatement;
use crate::driver::{Connect, Driver};
use crate::error::{LeaseError, PoolError};

/// Pool sizing and timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of sessions; all are opened when the pool is created.
    pub max_connections: usize,
    /// How long [`ConnectionPool::checkout`] waits for a free session.
    pub acquire_timeout: Duration,
}

impl PoolConfig {
    /// A single-session pool, as lending requires.
    #[must_use]
    pub const fn single() -> Self {
        Self {
            max_connections: 1,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// The connection currently published for borrowers.
struct Lent<D> {
    connection: Connection<D>,
    lease_id: uuid::Uuid,
    turn: Arc<Semaphore>,
}

struct PoolInner<D> {
    connector: Box<dyn Connect<D>>,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Connection<D>>>,
    lent: Mutex<Option<Lent<D>>>,
}

/// A bounded set of database sessions.
///
/// Cloning the pool is cheap; clones share the same sessions.
pub struct ConnectionPool<D> {
    inner: Arc<PoolInner<D>>,
}

impl<D> Clone for ConnectionPool<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D> fmt::Debug for ConnectionPool<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.inner.config)
            .field("idle", &self.inner.idle.lock().len())
            .field("closed", &self.inner.permits.is_closed())
            .finish_non_exhaustive()
    }
}

impl<D: Driver> ConnectionPool<D> {
    /// Opens `config.max_connections` sessions through `connector`.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfig`] for an empty pool, or
    /// [`PoolError::Connect`] if any session fails to open.
    pub async fn connect(
        connector: impl Connect<D>,
        config: PoolConfig,
    ) -> Result<Self, PoolError> {
        if config.max_connections == 0 {
            return Err(PoolError::InvalidConfig(
                "max_connections must be at least 1".to_string(),
            ));
        }

        let mut idle = Vec::with_capacity(config.max_connections);
        for _ in 0..config.max_connections {
            let driver = connector.connect().await.map_err(PoolError::Connect)?;
            idle.push(Connection::new(driver));
        }
        tracing::info!(size = config.max_connections, "connection pool filled");

        Ok(Self {
            inner: Arc::new(PoolInner {
                connector: Box::new(connector),
                config,
                permits: Arc::new(Semaphore::new(config.max_connections)),
                idle: Mutex::new(idle),
                lent: Mutex::new(None),
            }),
        })
    }

    /// Takes a session for exclusive use, waiting up to the acquire timeout.
    ///
    /// A session dropped as broken is replaced here by a fresh one.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Timeout`] if none frees up in time,
    /// [`PoolError::Closed`] after [`ConnectionPool::close`], or
    /// [`PoolError::Connect`] if a replacement cannot be opened.
    pub async fn checkout(&self) -> Result<PooledConnection<D>, PoolError> {
        let waited = self.inner.config.acquire_timeout;
        let permit = tokio::time::timeout(waited, Arc::clone(&self.inner.permits).acquire_owned())
            .await
            .map_err(|_| PoolError::Timeout { waited })?
            .map_err(|_| PoolError::Closed)?;

        let reused = self.inner.idle.lock().pop();
        let connection = match reused {
            Some(connection) => connection,
            None => {
                let driver = self
                    .inner
                    .connector
                    .connect()
                    .await
                    .map_err(PoolError::Connect)?;
                let connection = Connection::new(driver);
                tracing::info!(connection = %connection.id(), "replacement connection opened");
                connection
            }
        };

        tracing::debug!(connection = %connection.id(), "connection checked out");
        Ok(PooledConnection {
            connection,
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Picks up the connection currently lent by its owner.
    ///
    /// This is the "use existing transaction" path: statements run inside
    /// the owner's open transaction. Waits while another borrower holds it.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::NothingLent`] if no lease is outstanding, or
    /// [`LeaseError::Reclaimed`] if the owner took it back while waiting.
    pub async fn borrow_lent(&self) -> Result<BorrowedConnection<D>, LeaseError> {
        let (connection, lease_id, turn) = {
            let lent = self.inner.lent.lock();
            let Some(lent) = lent.as_ref() else {
                return Err(LeaseError::NothingLent);
            };
            (
                lent.connection.clone(),
                lent.lease_id,
                Arc::clone(&lent.turn),
            )
        };
        let permit = turn
            .acquire_owned()
            .await
            .map_err(|_| LeaseError::Reclaimed(connection.id()))?;
        tracing::debug!(
            connection = %connection.id(),
            lease = %lease_id,
            "lent connection borrowed"
        );
        Ok(BorrowedConnection::new(connection, lease_id, permit))
    }
}

impl<D> ConnectionPool<D> {
    /// Configured number of sessions.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.config.max_connections
    }

    /// The pool configuration.
    #[must_use]
    pub fn config(&self) -> PoolConfig {
        self.inner.config
    }

    /// Sessions currently waiting in the pool.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// `true` after [`ConnectionPool::close`].
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.permits.is_closed()
    }

    /// Closes the pool: idle sessions are dropped now, checked-out ones
    /// when they come back. Further checkouts fail.
    pub fn close(&self) {
        self.inner.permits.close();
        let dropped = std::mem::take(&mut *self.inner.idle.lock()).len();
        tracing::info!(dropped, "connection pool closed");
    }

    /// `true` while a lease is published.
    #[must_use]
    pub fn has_lent(&self) -> bool {
        self.inner.lent.lock().is_some()
    }

    pub(crate) fn publish_lent(
        &self,
        connection: Connection<D>,
        lease_id: uuid::Uuid,
        turn: Arc<Semaphore>,
    ) {
        *self.inner.lent.lock() = Some(Lent {
            connection,
            lease_id,
            turn,
        });
    }

    /// Stops publishing `lease_id` and refuses any borrower still waiting.
    pub(crate) fn withdraw_lent(&self, lease_id: uuid::Uuid) {
        let mut lent = self.inner.lent.lock();
        if lent.as_ref().is_some_and(|l| l.lease_id == lease_id)
            && let Some(withdrawn) = lent.take()
        {
            withdrawn.turn.close();
        }
    }
}

/// A checked-out session, returned to its pool on drop.
///
/// A frame still open on return is abandoned: its rollback is queued and
/// runs before the next statement on the session.
pub struct PooledConnection<D> {
    connection: Connection<D>,
    pool: Arc<PoolInner<D>>,
    _permit: OwnedSemaphorePermit,
}

impl<D> fmt::Debug for PooledConnection<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

impl<D> PooledConnection<D> {
    /// The session handle.
    #[must_use]
    pub fn connection(&self) -> &Connection<D> {
        &self.connection
    }
}

impl<D> Deref for PooledConnection<D> {
    type Target = Connection<D>;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl<D> Drop for PooledConnection<D> {
    fn drop(&mut self) {
        let connection = self.connection.clone();
        let broken = connection.with_state(|state| {
            if let Some(frame) = state.frame.take() {
                tracing::warn!(
                    connection = %connection.id(),
                    depth = frame.depth(),
                    "connection returned with an open transaction; rolling back"
                );
                state.pending.push(ControlStatement::Rollback);
            }
            state.lease = None;
            state.broken
        });

        if broken {
            tracing::warn!(connection = %connection.id(), "discarding broken connection");
            return;
        }
        if self.pool.permits.is_closed() {
            return;
        }
        self.pool.idle.lock().push(connection);
    }
}
