//! Domain layer: identifiers, options and transaction state.
//!
//! These types hold no I/O. The pool stores one [`TransactionFrame`] and at
//! most one granted [`LeaseToken`] per connection; the service layer drives
//! them through their states.

pub mod connection_id;
pub mod frame;
pub mod lease_token;
pub mod options;

pub use connection_id::ConnectionId;
pub use frame::{ControlStatement, SavepointMarker, TransactionFrame};
pub use lease_token::{LeaseState, LeaseToken};
pub use options::{Outcome, RollbackPolicy, TransactionOptions};
