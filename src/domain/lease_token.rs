//! Record of a connection temporarily granted to a borrower.

use std::thread::ThreadId;

use chrono::{DateTime, Utc};

use super::ConnectionId;

/// Lifecycle of a [`LeaseToken`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// A borrower may use the connection.
    Granted,
    /// The owner holds the connection exclusively again.
    Reclaimed,
}

/// A temporary grant of a connection to a borrower.
///
/// At most one token per connection is ever in the `Granted` state, and it
/// is reclaimed before the frame it was lent from closes.
#[derive(Debug, Clone)]
pub struct LeaseToken {
    id: uuid::Uuid,
    connection: ConnectionId,
    owner: ThreadId,
    granted_at: DateTime<Utc>,
    state: LeaseState,
}

impl LeaseToken {
    /// Grants `connection`, recording the calling thread as owner-on-hold.
    #[must_use]
    pub fn grant(connection: ConnectionId) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            connection,
            owner: std::thread::current().id(),
            granted_at: Utc::now(),
            state: LeaseState::Granted,
        }
    }

    /// Token identity.
    #[must_use]
    pub const fn id(&self) -> uuid::Uuid {
        self.id
    }

    /// The lent connection.
    #[must_use]
    pub const fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Thread that lent the connection.
    #[must_use]
    pub const fn owner(&self) -> ThreadId {
        self.owner
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> LeaseState {
        self.state
    }

    /// Marks the token reclaimed and returns how long it was granted.
    pub fn reclaim(&mut self) -> chrono::Duration {
        self.state = LeaseState::Reclaimed;
        Utc::now() - self.granted_at
    }
}
