//! # txn-isolation
//!
//! Rollback-only transaction isolation for tests that share a relational
//! database.
//!
//! Each test (or each suite) runs inside a transaction or nested savepoint
//! that is rolled back when it ends, by any path: success, error, panic or
//! cancellation. A connection holding an open transaction can be lent to
//! other tasks so a background server sees the test's uncommitted rows, and
//! several independent databases can be driven through one shared
//! commit-or-rollback decision.
//!
//! ## Architecture
//!
//! ```text
//! Test hooks (TestIsolation, SuiteIsolation)
//!     │
//!     ├── TransactionManager (service/)
//!     ├── LeaseBroker (service/)
//!     ├── MultiDatabaseCoordinator (service/)
//!     │
//!     ├── TransactionFrame, LeaseToken (domain/)
//!     │
//!     ├── ConnectionPool, Connection (pool/)
//!     │
//!     └── Driver: sqlx SQLite / PostgreSQL (driver/)
//! ```
//!
//! Connections are always passed explicitly; no operation reads a global
//! "current connection".

pub mod config;
pub mod domain;
pub mod driver;
pub mod error;
pub mod pool;
pub mod service;
pub mod telemetry;

#[cfg(test)]
mod testing;

pub use config::IsolationConfig;
pub use domain::{ConnectionId, Outcome, RollbackPolicy, TransactionOptions};
pub use driver::{Connect, Driver, FnConnector, SqlxConnector};
pub use error::{ConfigError, CoordinatorError, DriverError, LeaseError, PoolError, TxError};
pub use pool::{BorrowedConnection, Connection, ConnectionPool, PoolConfig, PooledConnection};
pub use service::{
    CloseError, LeaseBroker, MultiDatabaseCoordinator, SuiteIsolation, TestIsolation,
    TransactionHandle, TransactionManager,
};
