//! Transaction tracker for PostgreSQL wire protocol
//!
//! Tracks the transaction block as the client sees it and decides how each
//! statement interacts with it. The engine's own autocommit flag is the source
//! of truth for whether a block is open; the tracker adds the failed state the
//! engine does not have.

use crate::error::SqlError;
use crate::protocol::message::TransactionStatus;
use duckdb_pgwire_core::sqlstate;
use duckdb_pgwire_core::StatementKind;
use log::debug;

/// Transaction state
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum TransactionState {
    /// Not in a transaction
    #[default]
    Idle,

    /// In an active transaction
    InTransaction,

    /// In a failed transaction that must be rolled back
    Failed,
}

/// How to run a statement given the transaction state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionDirective {
    /// Run the statement as written
    Run,

    /// Do not run it; report `tag` after sending `warning` as a notice
    Skip {
        /// Command tag to report
        tag: String,
        /// Warning explaining why nothing happened
        warning: SqlError,
    },

    /// Roll the failed block back and report `ROLLBACK`
    RollbackInstead,
}

/// Transaction tracker
#[derive(Debug, Default)]
pub struct TransactionTracker {
    state: TransactionState,
    statements_in_block: u64,
}

impl TransactionTracker {
    /// Create a new transaction tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Current transaction state
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Status byte for ReadyForQuery
    pub fn status(&self) -> TransactionStatus {
        match self.state {
            TransactionState::Idle => TransactionStatus::Idle,
            TransactionState::InTransaction => TransactionStatus::InTransaction,
            TransactionState::Failed => TransactionStatus::Failed,
        }
    }

    /// Whether the client is inside a failed block
    pub fn is_failed(&self) -> bool {
        self.state == TransactionState::Failed
    }

    /// Decide how a statement of `kind` runs
    pub fn begin_statement(&self, kind: &StatementKind) -> Result<TransactionDirective, SqlError> {
        match (self.state, kind) {
            (TransactionState::Failed, StatementKind::Commit | StatementKind::Rollback) => {
                Ok(TransactionDirective::RollbackInstead)
            }
            // ROLLBACK TO SAVEPOINT may recover a failed block
            (TransactionState::Failed, StatementKind::Other(tag)) if tag == "ROLLBACK" => {
                Ok(TransactionDirective::Run)
            }
            (TransactionState::Failed, _) => Err(SqlError::error(
                sqlstate::IN_FAILED_SQL_TRANSACTION,
                "current transaction is aborted, commands ignored until end of transaction block",
            )),
            (TransactionState::InTransaction, StatementKind::Begin) => Ok(TransactionDirective::Skip {
                tag: "BEGIN".to_string(),
                warning: SqlError::warning(
                    sqlstate::ACTIVE_SQL_TRANSACTION,
                    "there is already a transaction in progress",
                ),
            }),
            (TransactionState::Idle, StatementKind::Commit | StatementKind::Rollback) => {
                Ok(TransactionDirective::Skip {
                    tag: kind.command_tag(0),
                    warning: SqlError::warning(
                        sqlstate::NO_ACTIVE_SQL_TRANSACTION,
                        "there is no transaction in progress",
                    ),
                })
            }
            _ => Ok(TransactionDirective::Run),
        }
    }

    /// Record a successful statement; `in_transaction` is the engine's view afterwards
    pub fn statement_succeeded(&mut self, in_transaction: bool) {
        let next = if in_transaction {
            TransactionState::InTransaction
        } else {
            TransactionState::Idle
        };
        if next != self.state {
            debug!("Transaction state {:?} -> {:?}", self.state, next);
        }
        self.statements_in_block = match next {
            TransactionState::Idle => 0,
            _ => self.statements_in_block + 1,
        };
        self.state = next;
    }

    /// Record a failed statement
    ///
    /// Failures outside a block leave the session idle; inside a block the
    /// block is poisoned until it ends.
    pub fn statement_failed(&mut self) {
        if self.state == TransactionState::InTransaction {
            debug!(
                "Transaction failed after {} statements",
                self.statements_in_block
            );
            self.state = TransactionState::Failed;
        }
    }

    /// Record that the block was rolled back
    pub fn rolled_back(&mut self) {
        self.state = TransactionState::Idle;
        self.statements_in_block = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_commit_cycle() {
        let mut tracker = TransactionTracker::new();
        assert_eq!(tracker.status(), TransactionStatus::Idle);

        assert_eq!(tracker.begin_statement(&StatementKind::Begin).unwrap(), TransactionDirective::Run);
        tracker.statement_succeeded(true);
        assert_eq!(tracker.status(), TransactionStatus::InTransaction);

        assert_eq!(tracker.begin_statement(&StatementKind::Commit).unwrap(), TransactionDirective::Run);
        tracker.statement_succeeded(false);
        assert_eq!(tracker.status(), TransactionStatus::Idle);
    }

    #[test]
    fn test_errors_outside_a_block_stay_idle() {
        let mut tracker = TransactionTracker::new();
        tracker.statement_failed();
        assert_eq!(tracker.state(), TransactionState::Idle);
    }

    #[test]
    fn test_failed_block_refuses_statements() {
        let mut tracker = TransactionTracker::new();
        tracker.statement_succeeded(true);
        tracker.statement_failed();
        assert_eq!(tracker.status(), TransactionStatus::Failed);

        let err = tracker.begin_statement(&StatementKind::Select).unwrap_err();
        assert_eq!(err.code, sqlstate::IN_FAILED_SQL_TRANSACTION);
    }

    #[test]
    fn test_commit_of_failed_block_rolls_back() {
        let mut tracker = TransactionTracker::new();
        tracker.statement_succeeded(true);
        tracker.statement_failed();
        assert_eq!(
            tracker.begin_statement(&StatementKind::Commit).unwrap(),
            TransactionDirective::RollbackInstead
        );
        tracker.rolled_back();
        assert_eq!(tracker.status(), TransactionStatus::Idle);
    }

    #[test]
    fn test_rollback_to_savepoint_is_allowed_in_failed_block() {
        let mut tracker = TransactionTracker::new();
        tracker.statement_succeeded(true);
        tracker.statement_failed();
        let kind = StatementKind::Other("ROLLBACK".to_string());
        assert_eq!(tracker.begin_statement(&kind).unwrap(), TransactionDirective::Run);
        tracker.statement_succeeded(true);
        assert_eq!(tracker.status(), TransactionStatus::InTransaction);
    }

    #[test]
    fn test_redundant_transaction_control_warns() {
        let mut tracker = TransactionTracker::new();
        match tracker.begin_statement(&StatementKind::Commit).unwrap() {
            TransactionDirective::Skip { tag, warning } => {
                assert_eq!(tag, "COMMIT");
                assert_eq!(warning.code, sqlstate::NO_ACTIVE_SQL_TRANSACTION);
            }
            other => panic!("unexpected directive {:?}", other),
        }

        tracker.statement_succeeded(true);
        assert!(matches!(
            tracker.begin_statement(&StatementKind::Begin).unwrap(),
            TransactionDirective::Skip { .. }
        ));
    }
}
