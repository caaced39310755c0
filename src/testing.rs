//! Test doubles and fixtures shared by the unit tests.

#![allow(clippy::panic)]

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::SqliteConnection;

use crate::driver::{Connect, Driver, FnConnector, SqlxConnector};
use crate::error::DriverError;
use crate::pool::{Connection, ConnectionPool, PoolConfig};

/// Statements seen by a [`MemoryDriver`], in order.
pub(crate) type StatementLog = Arc<Mutex<Vec<String>>>;

/// Statement prefixes that fail, shared between a test and its drivers.
#[derive(Debug, Clone, Default)]
pub(crate) struct Faults(Arc<Mutex<Vec<(String, DriverError)>>>);

impl Faults {
    pub(crate) fn fail_on(&self, prefix: &str, err: DriverError) {
        self.0.lock().push((prefix.to_string(), err));
    }

    fn check(&self, sql: &str) -> Result<(), DriverError> {
        match self.0.lock().iter().find(|(prefix, _)| sql.starts_with(prefix)) {
            Some((_, err)) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

/// A driver that only records what it is asked to run.
#[derive(Debug, Default)]
pub(crate) struct MemoryDriver {
    log: StatementLog,
    faults: Faults,
    next_failure: Option<DriverError>,
}

impl MemoryDriver {
    pub(crate) fn new(log: StatementLog, faults: Faults) -> Self {
        Self {
            log,
            faults,
            next_failure: None,
        }
    }

    pub(crate) fn fail_next(&mut self, err: DriverError) {
        self.next_failure = Some(err);
    }

    fn run(&mut self, sql: &str) -> Result<(), DriverError> {
        if let Some(err) = self.next_failure.take() {
            return Err(err);
        }
        self.faults.check(sql)?;
        self.log.lock().push(sql.to_string());
        Ok(())
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn execute(&mut self, sql: &str) -> Result<u64, DriverError> {
        self.run(sql).map(|()| 0)
    }

    async fn fetch_i64(&mut self, sql: &str) -> Result<Option<i64>, DriverError> {
        self.run(sql).map(|()| Some(1))
    }
}

/// Wraps a real driver and fails statements matching a [`Faults`] prefix.
#[derive(Debug)]
pub(crate) struct FaultyDriver<D> {
    inner: D,
    faults: Faults,
}

#[async_trait]
impl<D: Driver> Driver for FaultyDriver<D> {
    async fn execute(&mut self, sql: &str) -> Result<u64, DriverError> {
        self.faults.check(sql)?;
        self.inner.execute(sql).await
    }

    async fn fetch_i64(&mut self, sql: &str) -> Result<Option<i64>, DriverError> {
        self.faults.check(sql)?;
        self.inner.fetch_i64(sql).await
    }
}

pub(crate) fn memory_connector() -> impl Connect<MemoryDriver> {
    FnConnector::new(|| async { Ok::<_, DriverError>(MemoryDriver::default()) })
}

/// A standalone connection over a [`MemoryDriver`] writing to `log`.
pub(crate) fn memory_connection(log: &StatementLog) -> Connection<MemoryDriver> {
    Connection::new(MemoryDriver::new(Arc::clone(log), Faults::default()))
}

pub(crate) fn logged(log: &StatementLog) -> Vec<String> {
    log.lock().clone()
}

/// A pool of private in-memory SQLite databases.
pub(crate) async fn sqlite_pool(size: usize) -> ConnectionPool<SqliteConnection> {
    crate::telemetry::init_tracing();
    let config = PoolConfig {
        max_connections: size,
        ..PoolConfig::default()
    };
    let connector = SqlxConnector::<SqliteConnection>::new("sqlite::memory:");
    let Ok(pool) = ConnectionPool::connect(connector, config).await else {
        panic!("in-memory sqlite pool should open");
    };
    pool
}

/// A single in-memory SQLite database whose statements can be made to fail.
pub(crate) async fn faulty_sqlite_pool(
    faults: &Faults,
) -> ConnectionPool<FaultyDriver<SqliteConnection>> {
    crate::telemetry::init_tracing();
    let faults = faults.clone();
    let connector = FnConnector::new(move || {
        let faults = faults.clone();
        async move {
            let inner = SqlxConnector::<SqliteConnection>::new("sqlite::memory:")
                .connect()
                .await?;
            Ok::<_, DriverError>(FaultyDriver { inner, faults })
        }
    });
    let Ok(pool) = ConnectionPool::connect(connector, PoolConfig::single()).await else {
        panic!("in-memory sqlite pool should open");
    };
    pool
}

/// Creates the `items` table used across tests, outside any transaction.
pub(crate) async fn create_items<D: Driver>(connection: &Connection<D>) {
    if let Err(err) = connection
        .execute("CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT NOT NULL)")
        .await
    {
        panic!("create table failed: {err}");
    }
}

pub(crate) async fn insert_item<D: Driver>(connection: &Connection<D>, label: &str) {
    if let Err(err) = connection
        .execute(&format!("INSERT INTO items (label) VALUES ('{label}')"))
        .await
    {
        panic!("insert failed: {err}");
    }
}

pub(crate) async fn count_items<D: Driver>(connection: &Connection<D>) -> i64 {
    match connection.fetch_i64("SELECT COUNT(*) FROM items").await {
        Ok(Some(count)) => count,
        other => panic!("count failed: {other:?}"),
    }
}

pub(crate) async fn count_label<D: Driver>(connection: &Connection<D>, label: &str) -> i64 {
    let sql = format!("SELECT COUNT(*) FROM items WHERE label = '{label}'");
    match connection.fetch_i64(&sql).await {
        Ok(Some(count)) => count,
        other => panic!("count failed: {other:?}"),
    }
}
