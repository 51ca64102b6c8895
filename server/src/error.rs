//! Error types for the pgwire server
//!
//! [`PgWireError`] covers everything that can end or interrupt a session.
//! [`SqlError`] is the structured error a client receives in an ErrorResponse.

use duckdb_pgwire_core::error::EngineError;
use duckdb_pgwire_core::sqlstate;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for the server
pub type Result<T> = std::result::Result<T, PgWireError>;

/// Severity of an error or notice sent to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Aborts the current statement
    Error,
    /// Aborts the session
    Fatal,
    /// Informational, nothing is aborted
    Warning,
    /// Informational notice
    Notice,
}

impl Severity {
    /// Non-localized severity string sent in the `S` and `V` fields
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
            Severity::Warning => "WARNING",
            Severity::Notice => "NOTICE",
        }
    }
}

/// Error reported to a client
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} {}: {message}", .severity.as_str(), .code)]
pub struct SqlError {
    /// Severity
    pub severity: Severity,

    /// SQLSTATE code
    pub code: String,

    /// Primary message
    pub message: String,

    /// Optional detail
    pub detail: Option<String>,

    /// Optional hint
    pub hint: Option<String>,
}

impl SqlError {
    /// Statement-level error
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::with_severity(Severity::Error, code, message)
    }

    /// Session-ending error
    pub fn fatal(code: &str, message: impl Into<String>) -> Self {
        Self::with_severity(Severity::Fatal, code, message)
    }

    /// Warning, sent as a NoticeResponse
    pub fn warning(code: &str, message: impl Into<String>) -> Self {
        Self::with_severity(Severity::Warning, code, message)
    }

    fn with_severity(severity: Severity, code: &str, message: impl Into<String>) -> Self {
        Self {
            severity,
            code: code.to_string(),
            message: message.into(),
            detail: None,
            hint: None,
        }
    }

    /// Attach a hint
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Attach a detail message
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Fields of the ErrorResponse / NoticeResponse, in wire order
    pub fn to_fields(&self) -> Vec<(u8, String)> {
        let mut fields = vec![
            (b'S', self.severity.as_str().to_string()),
            (b'V', self.severity.as_str().to_string()),
            (b'C', self.code.clone()),
            (b'M', self.message.clone()),
        ];
        if let Some(detail) = &self.detail {
            fields.push((b'D', detail.clone()));
        }
        if let Some(hint) = &self.hint {
            fields.push((b'H', hint.clone()));
        }
        fields
    }
}

impl From<EngineError> for SqlError {
    fn from(err: EngineError) -> Self {
        if let EngineError::Internal(detail) = &err {
            log::error!("Internal engine error: {}", detail);
        }
        SqlError::error(err.sqlstate(), err.client_message())
    }
}

/// Error type for the server
#[derive(Debug, Error)]
pub enum PgWireError {
    /// I/O error on the client socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed message envelope; the connection is closed without a reply
    #[error("Framing error: {0}")]
    Framing(String),

    /// Well-framed message that is not allowed here
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Authentication failure
    #[error("Authentication error: {message}")]
    Auth {
        /// SQLSTATE code
        code: &'static str,
        /// Client-facing message
        message: String,
    },

    /// Recoverable query error
    #[error("Query error: {0}")]
    Query(SqlError),

    /// Connection ceiling reached
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// TLS setup or handshake failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// Client was idle for too long
    #[error("Connection idle for more than {0:?}")]
    IdleTimeout(Duration),

    /// Negotiation or authentication did not finish in time
    #[error("Startup not completed within {0:?}")]
    StartupTimeout(Duration),

    /// Peer closed the connection
    #[error("Connection closed")]
    ConnectionClosed,
}

impl PgWireError {
    /// Password or identity rejection
    pub fn auth(code: &'static str, message: impl Into<String>) -> Self {
        PgWireError::Auth {
            code,
            message: message.into(),
        }
    }

    /// Whether the session must end after this error
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PgWireError::Query(err) if err.severity != Severity::Fatal)
    }

    /// Error response to send before acting on this error, if any
    ///
    /// Framing and transport failures get no reply: the stream can no longer
    /// be trusted to carry one.
    pub fn to_sql_error(&self) -> Option<SqlError> {
        match self {
            PgWireError::Io(_)
            | PgWireError::Framing(_)
            | PgWireError::Tls(_)
            | PgWireError::ConnectionClosed => None,
            PgWireError::Config(message) => Some(SqlError::fatal(sqlstate::INTERNAL_ERROR, message.clone())),
            PgWireError::ProtocolViolation(message) => {
                Some(SqlError::fatal(sqlstate::PROTOCOL_VIOLATION, message.clone()))
            }
            PgWireError::Auth { code, message } => Some(SqlError::fatal(code, message.clone())),
            PgWireError::Query(err) => Some(err.clone()),
            PgWireError::ResourceExhausted(message) => {
                Some(SqlError::fatal(sqlstate::TOO_MANY_CONNECTIONS, message.clone()))
            }
            PgWireError::IdleTimeout(_) => Some(SqlError::fatal(
                sqlstate::IDLE_SESSION_TIMEOUT,
                "terminating connection due to idle-session timeout",
            )),
            PgWireError::StartupTimeout(_) => Some(SqlError::fatal(
                sqlstate::QUERY_CANCELED,
                "canceling authentication due to timeout",
            )),
        }
    }

    /// ErrorResponse fields for this error, if a reply is sent at all
    pub fn to_error_fields(&self) -> Option<Vec<(u8, String)>> {
        self.to_sql_error().map(|err| err.to_fields())
    }
}

impl From<SqlError> for PgWireError {
    fn from(err: SqlError) -> Self {
        PgWireError::Query(err)
    }
}

impl From<EngineError> for PgWireError {
    fn from(err: EngineError) -> Self {
        PgWireError::Query(err.into())
    }
}

impl From<openssl::error::ErrorStack> for PgWireError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        PgWireError::Tls(err.to_string())
    }
}

impl From<openssl::ssl::Error> for PgWireError {
    fn from(err: openssl::ssl::Error) -> Self {
        PgWireError::Tls(err.to_string())
    }
}

impl From<config::ConfigError> for PgWireError {
    fn from(err: config::ConfigError) -> Self {
        PgWireError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_errors_are_recoverable() {
        let err = PgWireError::from(SqlError::error(sqlstate::UNDEFINED_TABLE, "no such table: t"));
        assert!(!err.is_fatal());
        let fields = err.to_error_fields().unwrap();
        assert_eq!(fields[0], (b'S', "ERROR".to_string()));
        assert_eq!(fields[2], (b'C', "42P01".to_string()));
    }

    #[test]
    fn test_framing_errors_get_no_reply() {
        let err = PgWireError::Framing("length 3".to_string());
        assert!(err.is_fatal());
        assert!(err.to_sql_error().is_none());
    }

    #[test]
    fn test_protocol_violation_is_fatal_08p01() {
        let err = PgWireError::ProtocolViolation("query before authentication".to_string());
        let sql = err.to_sql_error().unwrap();
        assert_eq!(sql.severity, Severity::Fatal);
        assert_eq!(sql.code, sqlstate::PROTOCOL_VIOLATION);
    }

    #[test]
    fn test_startup_timeout_is_fatal_57014() {
        let err = PgWireError::StartupTimeout(Duration::from_secs(60));
        assert!(err.is_fatal());
        let sql = err.to_sql_error().unwrap();
        assert_eq!(sql.severity, Severity::Fatal);
        assert_eq!(sql.code, sqlstate::QUERY_CANCELED);
    }

    #[test]
    fn test_engine_internals_are_hidden() {
        let sql = SqlError::from(EngineError::Internal("worker panicked at src/engine.rs".to_string()));
        assert_eq!(sql.code, sqlstate::INTERNAL_ERROR);
        assert!(!sql.message.contains("engine.rs"));
    }

    #[test]
    fn test_optional_fields_follow_message() {
        let fields = SqlError::error(sqlstate::DATA_EXCEPTION, "bad")
            .with_detail("row 3")
            .with_hint("check input")
            .to_fields();
        let tags: Vec<u8> = fields.iter().map(|(t, _)| *t).collect();
        assert_eq!(tags, b"SVCMDH".to_vec());
    }
}
