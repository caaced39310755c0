//! Connection pool: bounded checkout, lending and per-session state.

pub mod connection;
pub mod connection_pool;

pub use connection::{BorrowedConnection, Connection, ConnectionState, DriverGuard};
pub use connection_pool::{ConnectionPool, PoolConfig, PooledConnection};
