//! Service layer: transaction orchestration on top of the pool.
//!
//! [`TransactionManager`] opens and closes frames and savepoints,
//! [`LeaseBroker`] lends a connection with an open frame to other tasks, and
//! [`MultiDatabaseCoordinator`] fans one frame out over several connections.
//! [`TestIsolation`] and [`SuiteIsolation`] adapt them to test hooks.

pub mod coordinator;
pub mod isolation;
pub mod lease_broker;
pub mod transaction_manager;

pub use coordinator::MultiDatabaseCoordinator;
pub use isolation::{IsolatedTest, SuiteIsolation, TestIsolation};
pub use lease_broker::LeaseBroker;
pub use transaction_manager::{CloseError, TransactionHandle, TransactionManager};
