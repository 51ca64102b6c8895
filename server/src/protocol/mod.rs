//! PostgreSQL wire protocol implementation
//!
//! Message types, framing, parsing and formatting, plus the per-connection
//! machinery: authentication, message validation, transaction tracking,
//! prepared statements and portals, and COPY.

/// Message types for the PostgreSQL wire protocol
pub mod message;

/// Length-prefixed framing
pub mod codec;

/// Message parser for PostgreSQL wire protocol messages
pub mod parser;

/// Message formatter for PostgreSQL wire protocol responses
pub mod formatter;

/// Authentication handler for PostgreSQL clients
pub mod auth;

/// Protocol validator for PostgreSQL protocol correctness
pub mod validator;

/// Transaction tracking for ReadyForQuery status
pub mod transaction;

/// Prepared statement and portal registry
pub mod session;

/// COPY sub-protocol
pub mod copy;

/// Connection state machine
pub mod connection;

// Re-export common types
pub use self::auth::{AuthConfig, AuthHandler, AuthMethod, CredentialStore, StaticCredentials};
pub use self::codec::{Frame, FramingPhase, PgClientCodec, PgCodec};
pub use self::connection::{handle_client, ClientConnection, ConnectionContext, ConnectionState, ConnectionStats};
pub use self::formatter::MessageFormatter;
pub use self::message::{AuthenticationRequest, BackendMessage, FrontendMessage, TransactionStatus};
pub use self::parser::MessageParser;
pub use self::session::SessionRegistry;
pub use self::transaction::{TransactionState, TransactionTracker};
pub use self::validator::{ProtocolValidator, Verdict};
