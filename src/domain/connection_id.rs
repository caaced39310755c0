//! Identity of one physical database session.

use std::fmt;

use serde::Serialize;

/// Identity of one physical database session.
///
/// Assigned when the pool opens the session and kept for its whole life,
/// including while it is lent. Logged with every control statement and
/// carried by every error and coordinator report that concerns the session.
/// Only the pool mints new ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    pub(crate) fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}
