//! Transaction frames, savepoint markers and the control statements that
//! open and close them.

use std::borrow::Cow;

use chrono::{DateTime, Utc};

use super::options::{Outcome, RollbackPolicy, TransactionOptions};

/// A transaction-control statement, rendered to SQL by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlStatement {
    /// Opens the outermost transaction.
    Begin,
    /// Commits the outermost transaction.
    Commit,
    /// Rolls back the outermost transaction.
    Rollback,
    /// Establishes a named savepoint.
    Savepoint(String),
    /// Discards everything done since the named savepoint.
    RollbackToSavepoint(String),
    /// Forgets the named savepoint, keeping its changes.
    ReleaseSavepoint(String),
}

impl ControlStatement {
    /// ANSI rendering accepted by PostgreSQL, SQLite and MySQL.
    #[must_use]
    pub fn standard_sql(&self) -> Cow<'static, str> {
        match self {
            Self::Begin => Cow::Borrowed("BEGIN"),
            Self::Commit => Cow::Borrowed("COMMIT"),
            Self::Rollback => Cow::Borrowed("ROLLBACK"),
            Self::Savepoint(name) => Cow::Owned(format!("SAVEPOINT {name}")),
            Self::RollbackToSavepoint(name) => Cow::Owned(format!("ROLLBACK TO SAVEPOINT {name}")),
            Self::ReleaseSavepoint(name) => Cow::Owned(format!("RELEASE SAVEPOINT {name}")),
        }
    }
}

/// A named nesting point inside a [`TransactionFrame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavepointMarker {
    /// Savepoint name as sent to the database.
    pub name: String,
    /// Close policy of this level.
    pub rollback: RollbackPolicy,
    /// Nesting depth of this level (the frame itself is depth 1).
    pub depth: usize,
}

impl SavepointMarker {
    /// `true` if closing this savepoint with `outcome` rolls it back.
    #[must_use]
    pub const fn rolls_back(&self, outcome: Outcome) -> bool {
        self.rollback.rolls_back(outcome)
    }
}

/// One `BEGIN .. COMMIT/ROLLBACK` boundary on a single connection.
///
/// Holds no thread or task identity: whichever holder of the connection
/// issues the closing statement, the frame is closed the same way.
#[derive(Debug, Clone)]
pub struct TransactionFrame {
    id: uuid::Uuid,
    rollback: RollbackPolicy,
    forced_rollback: bool,
    auto_savepoint: bool,
    needs_rollback: bool,
    savepoints: Vec<SavepointMarker>,
    opened_at: DateTime<Utc>,
}

impl TransactionFrame {
    /// Creates the frame for a freshly issued `BEGIN`.
    #[must_use]
    pub fn open(options: &TransactionOptions) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            rollback: options.rollback,
            forced_rollback: options.rollback == RollbackPolicy::Always,
            auto_savepoint: options.auto_savepoint,
            needs_rollback: false,
            savepoints: Vec::new(),
            opened_at: Utc::now(),
        }
    }

    /// Identity of this frame, distinct from any earlier frame on the same
    /// connection.
    #[must_use]
    pub const fn id(&self) -> uuid::Uuid {
        self.id
    }

    /// `true` if the frame was opened with [`RollbackPolicy::Always`].
    #[must_use]
    pub const fn forced_rollback(&self) -> bool {
        self.forced_rollback
    }

    /// `true` if closing the frame with `outcome` rolls it back: always for
    /// a forced or poisoned frame, otherwise per its policy.
    #[must_use]
    pub const fn rolls_back(&self, outcome: Outcome) -> bool {
        self.forced_rollback || self.needs_rollback || self.rollback.rolls_back(outcome)
    }

    /// `true` if every request inside this frame nests as a savepoint.
    #[must_use]
    pub const fn auto_savepoint(&self) -> bool {
        self.auto_savepoint
    }

    /// `true` once a nested level failed to close cleanly; the frame can
    /// then only be rolled back.
    #[must_use]
    pub const fn needs_rollback(&self) -> bool {
        self.needs_rollback
    }

    /// Poisons the frame so its close always rolls back.
    pub const fn mark_needs_rollback(&mut self) {
        self.needs_rollback = true;
    }

    /// When `BEGIN` was issued.
    #[must_use]
    pub const fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Current nesting depth; `1` when no savepoint is open.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.savepoints.len().saturating_add(1)
    }

    /// Open savepoints, outermost first.
    #[must_use]
    pub fn savepoints(&self) -> &[SavepointMarker] {
        &self.savepoints
    }

    /// The innermost open savepoint.
    #[must_use]
    pub fn innermost(&self) -> Option<&SavepointMarker> {
        self.savepoints.last()
    }

    /// The open savepoint named `name`.
    #[must_use]
    pub fn savepoint(&self, name: &str) -> Option<&SavepointMarker> {
        self.savepoints.iter().find(|sp| sp.name == name)
    }

    /// Pushes a savepoint and returns its depth.
    pub fn push_savepoint(&mut self, name: String, rollback: RollbackPolicy) -> usize {
        let depth = self.depth().saturating_add(1);
        self.savepoints.push(SavepointMarker {
            name,
            rollback,
            depth,
        });
        depth
    }

    /// Pops the innermost savepoint if it is the one named.
    ///
    /// Returns `None` without touching the stack otherwise, so a close out
    /// of LIFO order never disturbs the open levels.
    pub fn pop_savepoint(&mut self, name: &str) -> Option<SavepointMarker> {
        if self.innermost().is_some_and(|sp| sp.name == name) {
            self.savepoints.pop()
        } else {
            None
        }
    }

    /// Drops the savepoint at `depth` and every level above it, returning
    /// the dropped savepoint.
    pub fn unwind_to(&mut self, depth: usize) -> Option<SavepointMarker> {
        let position = self.savepoints.iter().position(|sp| sp.depth == depth)?;
        self.savepoints.drain(position..).next()
    }
}
