//! Error types for the core crate
//!
//! Every engine failure carries enough information to be rendered as a
//! PostgreSQL error response: a SQLSTATE code and a client-facing message.

use crate::sqlstate;
use rusqlite::ffi;
use rusqlite::ErrorCode;
use thiserror::Error;

/// Engine error type
#[derive(Error, Debug)]
pub enum EngineError {
    /// Error raised by the embedded SQL engine
    #[error("{0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Statement text could not be tokenized
    #[error("syntax error: {0}")]
    Syntax(String),

    /// Value conversion failure with an explicit SQLSTATE
    #[error("{message}")]
    Data {
        /// SQLSTATE code
        code: &'static str,
        /// Client-facing message
        message: String,
    },

    /// Statement kind the engine does not run
    #[error("{0}")]
    Unsupported(String),

    /// Failure outside of SQL execution (worker panics, poisoned locks)
    #[error("internal engine error: {0}")]
    Internal(String),
}

/// Result type for the core crate
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Build a data error with the given SQLSTATE
    pub fn data(code: &'static str, message: impl Into<String>) -> Self {
        EngineError::Data {
            code,
            message: message.into(),
        }
    }

    /// SQLSTATE code describing this error
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::Sqlite(err) => sqlite_sqlstate(err),
            EngineError::Syntax(_) => sqlstate::SYNTAX_ERROR,
            EngineError::Data { code, .. } => code,
            EngineError::Unsupported(_) => sqlstate::FEATURE_NOT_SUPPORTED,
            EngineError::Internal(_) => sqlstate::INTERNAL_ERROR,
        }
    }

    /// Message safe to hand to a client
    ///
    /// Internal failures are reduced to a generic message; the detail is only logged.
    pub fn client_message(&self) -> String {
        match self {
            EngineError::Internal(_) => "internal engine error".to_string(),
            other => other.to_string(),
        }
    }
}

fn sqlite_sqlstate(err: &rusqlite::Error) -> &'static str {
    match err {
        rusqlite::Error::SqliteFailure(failure, message) => match failure.code {
            ErrorCode::ConstraintViolation => match failure.extended_code {
                ffi::SQLITE_CONSTRAINT_NOTNULL => sqlstate::NOT_NULL_VIOLATION,
                ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                    sqlstate::UNIQUE_VIOLATION
                }
                ffi::SQLITE_CONSTRAINT_FOREIGNKEY => sqlstate::FOREIGN_KEY_VIOLATION,
                ffi::SQLITE_CONSTRAINT_CHECK => sqlstate::CHECK_VIOLATION,
                _ => sqlstate::INTEGRITY_CONSTRAINT_VIOLATION,
            },
            ErrorCode::OperationInterrupted => sqlstate::QUERY_CANCELED,
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => sqlstate::LOCK_NOT_AVAILABLE,
            ErrorCode::ReadOnly => sqlstate::READ_ONLY_SQL_TRANSACTION,
            ErrorCode::TypeMismatch => sqlstate::DATATYPE_MISMATCH,
            ErrorCode::TooBig => sqlstate::PROGRAM_LIMIT_EXCEEDED,
            _ => message
                .as_deref()
                .map(message_sqlstate)
                .unwrap_or(sqlstate::DATA_EXCEPTION),
        },
        rusqlite::Error::InvalidParameterCount(..) => sqlstate::PROTOCOL_VIOLATION,
        rusqlite::Error::InvalidColumnType(..) | rusqlite::Error::FromSqlConversionFailure(..) => {
            sqlstate::DATATYPE_MISMATCH
        }
        rusqlite::Error::IntegralValueOutOfRange(..) => sqlstate::NUMERIC_VALUE_OUT_OF_RANGE,
        rusqlite::Error::Utf8Error(_) => sqlstate::INVALID_TEXT_REPRESENTATION,
        rusqlite::Error::MultipleStatement => sqlstate::SYNTAX_ERROR,
        rusqlite::Error::UserFunctionError(_) => sqlstate::DATA_EXCEPTION,
        _ => sqlstate::INTERNAL_ERROR,
    }
}

// The generic SQLITE_ERROR code covers most compile errors; the message tells them apart.
fn message_sqlstate(message: &str) -> &'static str {
    if message.contains("syntax error") || message.contains("incomplete input") {
        sqlstate::SYNTAX_ERROR
    } else if message.starts_with("no such table") {
        sqlstate::UNDEFINED_TABLE
    } else if message.starts_with("no such column") {
        sqlstate::UNDEFINED_COLUMN
    } else if message.starts_with("no such function") || message.contains("wrong number of arguments") {
        sqlstate::UNDEFINED_FUNCTION
    } else if message.contains("already exists") {
        sqlstate::DUPLICATE_TABLE
    } else if message.contains("cannot start a transaction within a transaction") {
        sqlstate::ACTIVE_SQL_TRANSACTION
    } else if message.contains("no transaction is active") {
        sqlstate::NO_ACTIVE_SQL_TRANSACTION
    } else {
        sqlstate::DATA_EXCEPTION
    }
}
