//! Driver seam: the statement-level interface every connection sits on.
//!
//! The isolation machinery never builds SQL beyond the six transaction
//! control statements in [`ControlStatement`]; everything else a test runs
//! goes straight to the driver.

pub mod sqlx_driver;

use std::borrow::Cow;
use std::fmt;
use std::future::Future;

use async_trait::async_trait;

use crate::domain::ControlStatement;
use crate::error::DriverError;

pub use sqlx_driver::SqlxConnector;

/// A single physical database session.
///
/// Implementations run statements in exactly the order they are called.
/// They must not assume the statement that closes a transaction comes from
/// the task that opened it.
#[async_trait]
pub trait Driver: Send + 'static {
    /// Runs `sql` and returns the number of rows affected.
    ///
    /// # Errors
    ///
    /// Returns a [`DriverError`] if the statement fails; `fatal` is set when
    /// the session can no longer be used.
    async fn execute(&mut self, sql: &str) -> Result<u64, DriverError>;

    /// Runs `sql` and returns the first column of the first row, if any.
    ///
    /// # Errors
    ///
    /// Returns a [`DriverError`] if the statement fails.
    async fn fetch_i64(&mut self, sql: &str) -> Result<Option<i64>, DriverError>;

    /// Renders a transaction control statement in this backend's dialect.
    fn control_sql(&self, statement: &ControlStatement) -> Cow<'static, str> {
        statement.standard_sql()
    }
}

#[async_trait]
impl Driver for Box<dyn Driver> {
    async fn execute(&mut self, sql: &str) -> Result<u64, DriverError> {
        (**self).execute(sql).await
    }

    async fn fetch_i64(&mut self, sql: &str) -> Result<Option<i64>, DriverError> {
        (**self).fetch_i64(sql).await
    }

    fn control_sql(&self, statement: &ControlStatement) -> Cow<'static, str> {
        (**self).control_sql(statement)
    }
}

/// Opens new sessions for a [`crate::pool::ConnectionPool`].
#[async_trait]
pub trait Connect<D>: Send + Sync + 'static {
    /// Opens one session.
    ///
    /// # Errors
    ///
    /// Returns a [`DriverError`] if the database cannot be reached.
    async fn connect(&self) -> Result<D, DriverError>;
}

/// A [`Connect`] backed by an async closure.
///
/// Handy for wrapping drivers (`Box<dyn Driver>`, fault injection) without a
/// dedicated connector type.
pub struct FnConnector<F>(F);

impl<F> FnConnector<F> {
    /// Wraps `f`; each call must open a fresh session.
    #[must_use]
    pub const fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> fmt::Debug for FnConnector<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnConnector").finish_non_exhaustive()
    }
}

#[async_trait]
impl<D, F, Fut> Connect<D> for FnConnector<F>
where
    D: Driver,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<D, DriverError>> + Send,
{
    async fn connect(&self) -> Result<D, DriverError> {
        (self.0)().await
    }
}
