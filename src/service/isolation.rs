//! Test-hook adapters: wrap each test, or a whole suite, in a transaction
//! that is rolled back afterwards.
//!
//! Frameworks with a single wrapping hook use [`TestIsolation::run`];
//! frameworks with separate hooks use [`TestIsolation::before_each`] and
//! [`TestIsolation::after_each`]. [`SuiteIsolation`] keeps one frame open
//! across a suite and nests each test in a savepoint.

use std::future::Future;
use std::sync::Arc;

use super::transaction_manager::{TransactionHandle, TransactionManager};
use crate::config::IsolationConfig;
use crate::domain::{Outcome, TransactionOptions};
use crate::driver::Driver;
use crate::error::{ConfigError, TxError};
use crate::pool::{Connection, ConnectionPool, PooledConnection};

/// Per-test isolation over a pool.
#[derive(Debug)]
pub struct TestIsolation<D> {
    pool: ConnectionPool<D>,
    manager: Arc<TransactionManager>,
    options: TransactionOptions,
}

impl<D> Clone for TestIsolation<D> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            manager: Arc::clone(&self.manager),
            options: self.options,
        }
    }
}

/// A test running between [`TestIsolation::before_each`] and
/// [`TestIsolation::after_each`].
///
/// Dropping it without `after_each` rolls the test back.
#[derive(Debug)]
pub struct IsolatedTest<D> {
    handle: TransactionHandle<D>,
    connection: PooledConnection<D>,
}

impl<D> IsolatedTest<D> {
    /// The connection the test runs on.
    #[must_use]
    pub fn connection(&self) -> &Connection<D> {
        &self.connection
    }
}

impl<D: Driver> TestIsolation<D> {
    /// Wraps every test in a transaction that always rolls back.
    #[must_use]
    pub fn new(pool: ConnectionPool<D>) -> Self {
        Self {
            pool,
            manager: Arc::new(TransactionManager::new()),
            options: TransactionOptions::isolated(),
        }
    }

    /// Uses the rollback policy and savepoint naming from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if the savepoint prefix is not
    /// a plain SQL identifier.
    pub fn from_config(
        pool: ConnectionPool<D>,
        config: &IsolationConfig,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            pool,
            manager: Arc::new(TransactionManager::from_config(config)?),
            options: config.transaction_options(),
        })
    }

    /// Overrides the per-test transaction options.
    #[must_use]
    pub const fn with_options(mut self, options: TransactionOptions) -> Self {
        self.options = options;
        self
    }

    /// The pool tests check their connection out of.
    #[must_use]
    pub const fn pool(&self) -> &ConnectionPool<D> {
        &self.pool
    }

    /// Runs `test` on a fresh connection inside its own transaction.
    ///
    /// # Errors
    ///
    /// Returns the test's error, or a [`TxError`] if no connection could be
    /// checked out or the transaction could not be opened or closed.
    pub async fn run<F, Fut, T, E>(&self, test: F) -> Result<T, E>
    where
        F: FnOnce(Connection<D>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TxError>,
    {
        let connection = self.pool.checkout().await.map_err(TxError::from)?;
        self.manager
            .run_in_transaction(&connection, self.options, test)
            .await
    }

    /// Checks out a connection and opens the test's transaction.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::Pool`] if checkout fails, or any error of
    /// [`TransactionManager::begin_transaction`].
    pub async fn before_each(&self) -> Result<IsolatedTest<D>, TxError> {
        let connection = self.pool.checkout().await?;
        let handle = self
            .manager
            .begin_transaction(&connection, self.options)
            .await?;
        tracing::debug!(connection = %connection.id(), "test transaction opened");
        Ok(IsolatedTest { handle, connection })
    }

    /// Closes the test's transaction according to how the test ended,
    /// then returns the connection to the pool.
    ///
    /// # Errors
    ///
    /// Any error of [`TransactionManager::end_transaction`].
    pub async fn after_each(&self, test: IsolatedTest<D>, outcome: Outcome) -> Result<(), TxError> {
        let IsolatedTest { handle, connection } = test;
        let closed = self.manager.end_transaction(handle, outcome).await;
        drop(connection);
        closed
    }
}

/// Suite-wide isolation: one frame for the suite, one savepoint per test.
///
/// Fixtures written through [`SuiteIsolation::connection`] are visible to
/// every test and discarded by [`SuiteIsolation::finish`].
#[derive(Debug)]
pub struct SuiteIsolation<D> {
    suite: TransactionHandle<D>,
    connection: PooledConnection<D>,
    manager: Arc<TransactionManager>,
}

impl<D: Driver> SuiteIsolation<D> {
    /// Checks out a connection and opens the suite frame.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::Pool`] if checkout fails, or any error of
    /// [`TransactionManager::begin_transaction`].
    pub async fn begin(pool: &ConnectionPool<D>) -> Result<Self, TxError> {
        Self::begin_with(pool, Arc::new(TransactionManager::new())).await
    }

    /// Like [`SuiteIsolation::begin`], naming savepoints through `manager`.
    ///
    /// # Errors
    ///
    /// Same as [`SuiteIsolation::begin`].
    pub async fn begin_with(
        pool: &ConnectionPool<D>,
        manager: Arc<TransactionManager>,
    ) -> Result<Self, TxError> {
        let connection = pool.checkout().await?;
        let suite = manager
            .begin_transaction(&connection, TransactionOptions::isolated())
            .await?;
        tracing::debug!(connection = %connection.id(), "suite transaction opened");
        Ok(Self {
            suite,
            connection,
            manager,
        })
    }

    /// The suite connection, for fixtures shared by every test.
    #[must_use]
    pub fn connection(&self) -> &Connection<D> {
        &self.connection
    }

    /// Runs `test` in a savepoint that is rolled back afterwards.
    ///
    /// # Errors
    ///
    /// Returns the test's error, or a [`TxError`] if the savepoint could not
    /// be opened or closed.
    pub async fn run_test<F, Fut, T, E>(&self, test: F) -> Result<T, E>
    where
        F: FnOnce(Connection<D>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TxError>,
    {
        self.manager
            .run_in_transaction(
                &self.connection,
                TransactionOptions::isolated().with_savepoint(true),
                test,
            )
            .await
    }

    /// Rolls the suite frame back and returns the connection.
    ///
    /// # Errors
    ///
    /// Any error of [`TransactionManager::end_transaction`].
    pub async fn finish(self) -> Result<(), TxError> {
        let Self {
            suite,
            connection,
            manager,
        } = self;
        let closed = manager.end_transaction(suite, Outcome::Success).await;
        tracing::debug!(connection = %connection.id(), "suite transaction closed");
        closed
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::RollbackPolicy;
    use crate::pool::ConnectionState;
    use crate::testing::{count_items, count_label, create_items, insert_item, sqlite_pool};

    async fn items_pool() -> ConnectionPool<sqlx::SqliteConnection> {
        let pool = sqlite_pool(1).await;
        let Ok(conn) = pool.checkout().await else {
            panic!("checkout failed");
        };
        create_items(&conn).await;
        pool
    }

    #[tokio::test]
    async fn each_run_starts_clean() {
        let pool = items_pool().await;
        let isolation = TestIsolation::new(pool.clone());

        for _ in 0..2 {
            let seen = isolation
                .run(|conn| async move {
                    let before = count_items(&conn).await;
                    insert_item(&conn, "t").await;
                    Ok::<_, TxError>(before)
                })
                .await;
            assert_eq!(seen.ok(), Some(0));
        }
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn split_hooks_roll_back_failed_test() {
        let pool = items_pool().await;
        let isolation =
            TestIsolation::new(pool.clone()).with_options(TransactionOptions::committing());

        let Ok(test) = isolation.before_each().await else {
            panic!("before_each failed");
        };
        insert_item(test.connection(), "failed").await;
        assert!(isolation.after_each(test, Outcome::Failure).await.is_ok());

        let Ok(test) = isolation.before_each().await else {
            panic!("before_each failed");
        };
        insert_item(test.connection(), "passed").await;
        assert!(isolation.after_each(test, Outcome::Success).await.is_ok());

        let Ok(conn) = pool.checkout().await else {
            panic!("checkout failed");
        };
        assert_eq!(count_label(&conn, "failed").await, 0);
        assert_eq!(count_label(&conn, "passed").await, 1);
    }

    #[tokio::test]
    async fn dropped_test_is_rolled_back() {
        let pool = items_pool().await;
        let isolation =
            TestIsolation::new(pool.clone()).with_options(TransactionOptions::committing());

        let Ok(test) = isolation.before_each().await else {
            panic!("before_each failed");
        };
        insert_item(test.connection(), "orphan").await;
        drop(test);

        let Ok(conn) = pool.checkout().await else {
            panic!("checkout failed");
        };
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert_eq!(count_items(&conn).await, 0);
    }

    #[tokio::test]
    async fn config_can_keep_test_writes() {
        let pool = items_pool().await;
        let Ok(config) = IsolationConfig::from_lookup(|key| {
            (key == "ISOLATION_ROLLBACK").then(|| "on_error".to_string())
        }) else {
            panic!("config must load");
        };
        assert_eq!(config.rollback, RollbackPolicy::OnError);
        let Ok(isolation) = TestIsolation::from_config(pool.clone(), &config) else {
            panic!("default prefix is valid");
        };

        let result = isolation
            .run(|conn| async move {
                insert_item(&conn, "kept").await;
                Ok::<_, TxError>(())
            })
            .await;
        assert!(result.is_ok());

        let Ok(conn) = pool.checkout().await else {
            panic!("checkout failed");
        };
        assert_eq!(count_items(&conn).await, 1);
    }

    #[tokio::test]
    async fn suite_fixtures_survive_tests_but_not_the_suite() {
        let pool = items_pool().await;
        let Ok(suite) = SuiteIsolation::begin(&pool).await else {
            panic!("suite begin failed");
        };
        insert_item(suite.connection(), "fixture").await;

        let first = suite
            .run_test(|conn| async move {
                insert_item(&conn, "first").await;
                Ok::<_, TxError>(count_items(&conn).await)
            })
            .await;
        assert_eq!(first.ok(), Some(2));

        let second: Result<i64, anyhow::Error> = suite
            .run_test(|conn| async move {
                assert_eq!(conn.depth(), 2);
                Ok(count_label(&conn, "first").await)
            })
            .await;
        assert_eq!(second.ok(), Some(0));

        let failing: Result<(), anyhow::Error> = suite
            .run_test(|conn| async move {
                insert_item(&conn, "doomed").await;
                Err(anyhow::anyhow!("assertion failed"))
            })
            .await;
        assert!(failing.is_err());
        assert_eq!(count_items(suite.connection()).await, 1);
        assert_eq!(suite.connection().depth(), 1);

        assert!(suite.finish().await.is_ok());
        let Ok(conn) = pool.checkout().await else {
            panic!("checkout failed");
        };
        assert_eq!(count_items(&conn).await, 0);
    }
}
