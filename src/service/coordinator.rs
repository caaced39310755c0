//! Multi-database coordinator: one frame per connection, closed together.
//!
//! Frames open in declared order and close in reverse, all with the same
//! decision. Without two-phase commit a close can still fail halfway; when
//! it does, every remaining participant is rolled back and the caller gets
//! a [`CoordinatorError::PartialCommitRisk`] listing how each one ended.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;

use super::transaction_manager::{TransactionHandle, TransactionManager};
use crate::domain::{Outcome, TransactionOptions};
use crate::driver::Driver;
use crate::error::{CoordinatorError, ParticipantOutcome, ParticipantReport};
use crate::pool::Connection;

/// Runs work across several connections with all-or-nothing closing.
#[derive(Debug, Clone)]
pub struct MultiDatabaseCoordinator {
    manager: Arc<TransactionManager>,
}

impl Default for MultiDatabaseCoordinator {
    fn default() -> Self {
        Self::new(Arc::new(TransactionManager::new()))
    }
}

impl MultiDatabaseCoordinator {
    /// Creates a coordinator opening frames through `manager`.
    #[must_use]
    pub const fn new(manager: Arc<TransactionManager>) -> Self {
        Self { manager }
    }

    /// The manager frames are opened through.
    #[must_use]
    pub fn manager(&self) -> &TransactionManager {
        &self.manager
    }

    /// Opens a frame on every connection, runs `work` once, then closes
    /// every frame.
    ///
    /// `work` receives the connections in declared order. All frames
    /// commit when `work` succeeds and `options.rollback` allows it;
    /// otherwise all roll back.
    ///
    /// # Errors
    ///
    /// - [`CoordinatorError::Open`] if a frame fails to open; frames opened
    ///   before it are rolled back and `work` never runs.
    /// - [`CoordinatorError::PartialCommitRisk`] if any close fails. This
    ///   wins over an error from `work`, which is logged.
    /// - The error of `work`, if every close succeeded.
    ///
    /// # Panics
    ///
    /// Resumes a panic raised by `work`, after rolling every frame back.
    pub async fn run_across<D, F, Fut, T, E>(
        &self,
        connections: &[Connection<D>],
        options: TransactionOptions,
        work: F,
    ) -> Result<T, E>
    where
        D: Driver,
        F: FnOnce(Vec<Connection<D>>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CoordinatorError>,
    {
        let handles = self.open_all(connections, options).await?;
        tracing::debug!(participants = handles.len(), "coordinated transaction opened");

        let result = AssertUnwindSafe(work(connections.to_vec()))
            .catch_unwind()
            .await;
        let outcome = result.as_ref().map_or(Outcome::Failure, Outcome::of);
        let closed = self.close_all(handles, outcome).await;

        match result {
            Ok(Ok(value)) => {
                closed?;
                Ok(value)
            }
            Ok(Err(err)) => match closed {
                Ok(()) => Err(err),
                Err(close_err) => {
                    tracing::warn!("coordinated work failed before its close phase failed");
                    Err(close_err.into())
                }
            },
            Err(panic) => {
                if let Err(close_err) = closed {
                    tracing::error!(error = %close_err, "close after panic failed");
                }
                std::panic::resume_unwind(panic)
            }
        }
    }

    async fn open_all<D: Driver>(
        &self,
        connections: &[Connection<D>],
        options: TransactionOptions,
    ) -> Result<Vec<TransactionHandle<D>>, CoordinatorError> {
        let mut handles = Vec::with_capacity(connections.len());
        for (index, connection) in connections.iter().enumerate() {
            match self.manager.begin_transaction(connection, options).await {
                Ok(handle) => handles.push(handle),
                Err(source) => {
                    tracing::warn!(
                        index,
                        connection = %connection.id(),
                        error = %source,
                        "participant failed to open; unwinding"
                    );
                    self.unwind(handles).await;
                    return Err(CoordinatorError::Open {
                        index,
                        connection: connection.id(),
                        source,
                    });
                }
            }
        }
        Ok(handles)
    }

    async fn unwind<D: Driver>(&self, handles: Vec<TransactionHandle<D>>) {
        for handle in handles.into_iter().rev() {
            let connection = handle.connection().id();
            if let Err(err) = self.manager.end_transaction(handle, Outcome::Failure).await {
                tracing::warn!(%connection, error = %err, "rollback during unwind failed");
            }
        }
    }

    async fn close_all<D: Driver>(
        &self,
        handles: Vec<TransactionHandle<D>>,
        outcome: Outcome,
    ) -> Result<(), CoordinatorError> {
        let mut decision = outcome;
        let mut failed = false;
        let mut participants = Vec::with_capacity(handles.len());

        for (index, handle) in handles.into_iter().enumerate().rev() {
            let connection = handle.connection().id();
            let rolls_back = handle.rolls_back(decision);
            let ended = match self.manager.end_transaction(handle, decision).await {
                Ok(()) if rolls_back => ParticipantOutcome::RolledBack,
                Ok(()) => ParticipantOutcome::Committed,
                Err(err) => {
                    tracing::error!(
                        index,
                        %connection,
                        error = %err,
                        "participant failed to close"
                    );
                    failed = true;
                    decision = Outcome::Failure;
                    ParticipantOutcome::Failed(err.to_string())
                }
            };
            participants.push(ParticipantReport {
                index,
                connection,
                outcome: ended,
            });
        }

        if !failed {
            return Ok(());
        }
        participants.reverse();
        Err(CoordinatorError::PartialCommitRisk { participants })
    }
}
