//! Lease broker: lends a connection with an open transaction to other tasks.
//!
//! [`LeaseBroker::lend`] is scoped. The lease is granted on entry, published
//! on the pool for [`ConnectionPool::borrow_lent`], and reclaimed on every
//! exit path: normal return, borrower panic, or the `lend` future being
//! dropped.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::Semaphore;

use crate::driver::Driver;
use crate::error::LeaseError;
use crate::pool::{BorrowedConnection, Connection, ConnectionPool};

/// Lends connections of a single-session pool.
pub struct LeaseBroker<D> {
    pool: ConnectionPool<D>,
}

impl<D> Clone for LeaseBroker<D> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
        }
    }
}

impl<D> fmt::Debug for LeaseBroker<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseBroker")
            .field("pool", &self.pool)
            .finish()
    }
}

impl<D: Driver> LeaseBroker<D> {
    /// Creates a broker over `pool`.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::PoolTooLarge`] unless the pool holds exactly
    /// one session; with more, a borrower could check out a different
    /// session instead of the lent one.
    pub fn new(pool: ConnectionPool<D>) -> Result<Self, LeaseError> {
        if pool.size() != 1 {
            return Err(LeaseError::PoolTooLarge(pool.size()));
        }
        Ok(Self { pool })
    }

    /// The pool borrowers pick the lent connection up from.
    #[must_use]
    pub const fn pool(&self) -> &ConnectionPool<D> {
        &self.pool
    }

    /// Picks up the connection currently lent. See
    /// [`ConnectionPool::borrow_lent`].
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::NothingLent`] if no lease is outstanding.
    pub async fn borrow(&self) -> Result<BorrowedConnection<D>, LeaseError> {
        self.pool.borrow_lent().await
    }

    /// Lends `connection` for the duration of `borrower`.
    ///
    /// While `borrower` runs, any task may pick the connection up through
    /// [`LeaseBroker::borrow`] and issue statements inside the open
    /// transaction, one borrower at a time. The lease is reclaimed before
    /// this returns, whatever `borrower` returns.
    ///
    /// # Errors
    ///
    /// - [`LeaseError::NoActiveTransaction`] if `connection` has no open
    ///   frame.
    /// - [`LeaseError::AlreadyLeased`] if it is already lent.
    ///
    /// # Panics
    ///
    /// Resumes a panic raised by `borrower`, after reclaiming the lease.
    pub async fn lend<F, Fut, R>(
        &self,
        connection: &Connection<D>,
        borrower: F,
    ) -> Result<R, LeaseError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let lease_id = connection.grant_lease()?;
        self.pool.publish_lent(
            connection.clone(),
            lease_id,
            Arc::new(Semaphore::new(1)),
        );
        tracing::debug!(connection = %connection.id(), lease = %lease_id, "connection lent");

        let guard = ReclaimGuard {
            pool: &self.pool,
            connection,
            lease_id,
            armed: true,
        };
        let result = AssertUnwindSafe(borrower()).catch_unwind().await;
        guard.reclaim().await;

        match result {
            Ok(value) => Ok(value),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

/// Takes a lease back if `lend` exits without reaching its normal reclaim.
struct ReclaimGuard<'a, D> {
    pool: &'a ConnectionPool<D>,
    connection: &'a Connection<D>,
    lease_id: uuid::Uuid,
    armed: bool,
}

impl<D: Driver> ReclaimGuard<'_, D> {
    /// Withdraws the lease from borrowers, waits out any statement in
    /// flight, then clears it.
    async fn reclaim(mut self) {
        self.armed = false;
        self.pool.withdraw_lent(self.lease_id);
        self.connection.reclaim_lease(self.lease_id).await;
    }
}

impl<D> Drop for ReclaimGuard<'_, D> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.pool.withdraw_lent(self.lease_id);
        let reclaimed = self.connection.with_state(|state| {
            if state.lease.as_ref().is_some_and(|l| l.id() == self.lease_id) {
                state.lease.take()
            } else {
                None
            }
        });
        if reclaimed.is_some() {
            tracing::warn!(
                connection = %self.connection.id(),
                lease = %self.lease_id,
                "lend cancelled; lease reclaimed"
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::domain::{Outcome, TransactionOptions};
    use crate::error::TxError;
    use crate::pool::ConnectionState;
    use crate::service::TransactionManager;
    use crate::testing::{count_items, count_label, create_items, insert_item, sqlite_pool};

    #[tokio::test]
    async fn broker_requires_single_session_pool() {
        let pool = sqlite_pool(2).await;
        let result = LeaseBroker::new(pool);
        assert!(matches!(result, Err(LeaseError::PoolTooLarge(2))));
    }

    #[tokio::test]
    async fn lending_idle_connection_is_refused() {
        let pool = sqlite_pool(1).await;
        let Ok(broker) = LeaseBroker::new(pool.clone()) else {
            panic!("broker should accept a single-session pool");
        };
        let Ok(conn) = pool.checkout().await else {
            panic!("checkout failed");
        };

        let result = broker.lend(&conn, || async {}).await;
        assert!(matches!(result, Err(LeaseError::NoActiveTransaction(_))));
        assert!(!pool.has_lent());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn borrower_writes_land_in_owner_transaction() {
        let pool = sqlite_pool(1).await;
        let Ok(broker) = LeaseBroker::new(pool.clone()) else {
            panic!("broker should accept a single-session pool");
        };
        let manager = TransactionManager::new();
        let Ok(conn) = pool.checkout().await else {
            panic!("checkout failed");
        };
        create_items(&conn).await;

        let Ok(handle) = manager
            .begin_transaction(&conn, TransactionOptions::committing())
            .await
        else {
            panic!("begin failed");
        };
        insert_item(&conn, "r1").await;

        let lent = broker
            .lend(&conn, || {
                let broker = broker.clone();
                async move {
                    tokio::spawn(async move {
                        let borrowed = broker.borrow().await?;
                        borrowed
                            .execute("INSERT INTO items (label) VALUES ('r3')")
                            .await?;
                        Ok::<_, anyhow::Error>(())
                    })
                    .await
                }
            })
            .await;

        let Ok(Ok(Ok(()))) = lent else {
            panic!("borrower failed");
        };
        assert_eq!(conn.state(), ConnectionState::InTransaction { depth: 1 });
        assert!(!pool.has_lent());

        assert!(manager.end_transaction(handle, Outcome::Success).await.is_ok());
        assert_eq!(count_label(&conn, "r3").await, 1);
        assert_eq!(count_items(&conn).await, 2);
    }

    #[tokio::test]
    async fn lease_is_reclaimed_after_failing_borrower() {
        let pool = sqlite_pool(1).await;
        let Ok(broker) = LeaseBroker::new(pool.clone()) else {
            panic!("broker should accept a single-session pool");
        };
        let manager = TransactionManager::new();
        let Ok(conn) = pool.checkout().await else {
            panic!("checkout failed");
        };
        let Ok(_handle) = manager
            .begin_transaction(&conn, TransactionOptions::isolated())
            .await
        else {
            panic!("begin failed");
        };

        let lent = broker
            .lend(&conn, || async {
                assert_eq!(conn.state(), ConnectionState::Leased { depth: 1 });
                Err::<(), _>(anyhow::anyhow!("borrower failed"))
            })
            .await;

        let Ok(Err(err)) = lent else {
            panic!("borrower error must come back to the owner");
        };
        assert_eq!(err.to_string(), "borrower failed");
        assert_eq!(conn.state(), ConnectionState::InTransaction { depth: 1 });
        assert!(!pool.has_lent());
    }

    #[tokio::test]
    async fn lease_is_reclaimed_after_panicking_borrower() {
        let pool = sqlite_pool(1).await;
        let Ok(broker) = LeaseBroker::new(pool.clone()) else {
            panic!("broker should accept a single-session pool");
        };
        let manager = TransactionManager::new();
        let Ok(conn) = pool.checkout().await else {
            panic!("checkout failed");
        };
        let Ok(_handle) = manager
            .begin_transaction(&conn, TransactionOptions::isolated())
            .await
        else {
            panic!("begin failed");
        };

        let task = tokio::spawn({
            let broker = broker.clone();
            let conn = conn.connection().clone();
            async move {
                broker
                    .lend(&conn, || async {
                        if conn.depth() > 0 {
                            panic!("borrower panicked");
                        }
                    })
                    .await
            }
        });

        let Err(join_err) = task.await else {
            panic!("lend must resume the panic");
        };
        assert!(join_err.is_panic());
        assert_eq!(conn.state(), ConnectionState::InTransaction { depth: 1 });
        assert!(!pool.has_lent());
    }

    #[tokio::test]
    async fn cancelled_lend_still_reclaims() {
        let pool = sqlite_pool(1).await;
        let Ok(broker) = LeaseBroker::new(pool.clone()) else {
            panic!("broker should accept a single-session pool");
        };
        let manager = TransactionManager::new();
        let Ok(conn) = pool.checkout().await else {
            panic!("checkout failed");
        };
        let Ok(_handle) = manager
            .begin_transaction(&conn, TransactionOptions::isolated())
            .await
        else {
            panic!("begin failed");
        };

        let timed_out = tokio::time::timeout(
            Duration::from_millis(20),
            broker.lend(&conn, || tokio::time::sleep(Duration::from_secs(60))),
        )
        .await;

        assert!(timed_out.is_err());
        assert_eq!(conn.state(), ConnectionState::InTransaction { depth: 1 });
        assert!(!pool.has_lent());
    }

    #[tokio::test]
    async fn concurrent_lend_reports_already_leased() {
        let pool = sqlite_pool(1).await;
        let Ok(broker) = LeaseBroker::new(pool.clone()) else {
            panic!("broker should accept a single-session pool");
        };
        let manager = TransactionManager::new();
        let Ok(conn) = pool.checkout().await else {
            panic!("checkout failed");
        };
        let Ok(_handle) = manager
            .begin_transaction(&conn, TransactionOptions::isolated())
            .await
        else {
            panic!("begin failed");
        };

        let (first, second) = tokio::join!(
            broker.lend(&conn, || tokio::time::sleep(Duration::from_millis(20))),
            broker.lend(&conn, || async {}),
        );

        assert!(first.is_ok());
        let Err(err) = second else {
            panic!("second lend must be refused");
        };
        assert!(matches!(err, LeaseError::AlreadyLeased(_)));
        assert!(err.is_retryable());
        assert!(!pool.has_lent());
    }

    #[tokio::test]
    async fn borrow_kept_past_reclaim_cannot_reach_session() {
        let pool = sqlite_pool(1).await;
        let Ok(broker) = LeaseBroker::new(pool.clone()) else {
            panic!("broker should accept a single-session pool");
        };
        let manager = TransactionManager::new();
        let Ok(conn) = pool.checkout().await else {
            panic!("checkout failed");
        };
        create_items(&conn).await;
        let Ok(handle) = manager
            .begin_transaction(&conn, TransactionOptions::committing())
            .await
        else {
            panic!("begin failed");
        };

        let lent = broker
            .lend(&conn, || async {
                let borrowed = broker.borrow().await?;
                assert!(!borrowed.is_reclaimed());
                assert_eq!(borrowed.id(), conn.id());
                borrowed
                    .execute("INSERT INTO items (label) VALUES ('during')")
                    .await?;
                Ok::<_, TxError>(borrowed)
            })
            .await;
        let Ok(Ok(kept)) = lent else {
            panic!("borrow inside the lease failed");
        };

        assert!(kept.is_reclaimed());
        let write = kept
            .execute("INSERT INTO items (label) VALUES ('after_reclaim')")
            .await;
        assert!(matches!(
            write,
            Err(TxError::Lease(LeaseError::Reclaimed(_)))
        ));
        let read = kept.fetch_i64("SELECT COUNT(*) FROM items").await;
        assert!(matches!(read, Err(TxError::Lease(LeaseError::Reclaimed(_)))));

        assert!(manager.end_transaction(handle, Outcome::Success).await.is_ok());
        assert_eq!(count_label(&conn, "during").await, 1);
        assert_eq!(count_label(&conn, "after_reclaim").await, 0);
    }

    #[tokio::test]
    async fn second_borrower_waits_for_first() {
        let pool = sqlite_pool(1).await;
        let Ok(broker) = LeaseBroker::new(pool.clone()) else {
            panic!("broker should accept a single-session pool");
        };
        let manager = TransactionManager::new();
        let Ok(conn) = pool.checkout().await else {
            panic!("checkout failed");
        };
        let Ok(_handle) = manager
            .begin_transaction(&conn, TransactionOptions::isolated())
            .await
        else {
            panic!("begin failed");
        };

        let lent = broker
            .lend(&conn, || async {
                let Ok(first) = broker.borrow().await else {
                    panic!("first borrow failed");
                };
                let waiting =
                    tokio::time::timeout(Duration::from_millis(20), broker.borrow()).await;
                assert!(waiting.is_err());

                drop(first);
                let second = broker.borrow().await;
                second.is_ok()
            })
            .await;

        assert!(matches!(lent, Ok(true)));
    }
}
