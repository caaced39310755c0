//! `sqlx` implementations of the driver seam.
//!
//! [`sqlx::PgConnection`] and [`sqlx::SqliteConnection`] are drivers as-is.
//! Control statements go through the plain `&str` executor so they use the
//! simple query protocol and are never prepared.

use std::fmt;
use std::marker::PhantomData;

use async_trait::async_trait;

use super::{Connect, Driver};
use crate::error::DriverError;

macro_rules! impl_sqlx_driver {
    ($($conn:ty),+ $(,)?) => {
        $(
            #[async_trait]
            impl Driver for $conn {
                async fn execute(&mut self, sql: &str) -> Result<u64, DriverError> {
                    let result = sqlx::Executor::execute(&mut *self, sql).await?;
                    Ok(result.rows_affected())
                }

                async fn fetch_i64(&mut self, sql: &str) -> Result<Option<i64>, DriverError> {
                    let value = sqlx::query_scalar::<_, i64>(sql)
                        .fetch_optional(&mut *self)
                        .await?;
                    Ok(value)
                }
            }
        )+
    };
}

impl_sqlx_driver!(sqlx::PgConnection, sqlx::SqliteConnection);

/// Opens `sqlx` connections of type `C` from a database URL.
pub struct SqlxConnector<C> {
    url: String,
    _conn: PhantomData<fn() -> C>,
}

impl<C> SqlxConnector<C> {
    /// Creates a connector for `url` (e.g. `postgres://...` or
    /// `sqlite::memory:`).
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            _conn: PhantomData,
        }
    }

    /// The configured URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl<C> fmt::Debug for SqlxConnector<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // URLs may carry credentials.
        f.debug_struct("SqlxConnector").finish_non_exhaustive()
    }
}

#[async_trait]
impl<C> Connect<C> for SqlxConnector<C>
where
    C: sqlx::Connection + Driver,
{
    async fn connect(&self) -> Result<C, DriverError> {
        let conn = <C as sqlx::Connection>::connect(&self.url).await?;
        tracing::debug!("opened sqlx connection");
        Ok(conn)
    }
}
