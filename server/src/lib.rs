//! DuckDB pgwire server
//!
//! Serves an embedded SQL engine over the PostgreSQL frontend/backend
//! protocol (version 3.0), so ordinary PostgreSQL clients and drivers can
//! connect to it.

#![warn(missing_docs)]

// Error types and result
pub mod error;
pub use error::{PgWireError, Result, Severity, SqlError};

// Configuration
pub mod config;
pub use config::{ServerConfig, TlsConfig};

// Protocol-related modules
pub mod protocol;
pub use protocol::{AuthMethod, BackendMessage, ClientConnection, FrontendMessage};

// Encryption negotiation
pub mod tls;
pub use tls::TlsNegotiator;

// Engine access
pub mod bridge;
pub use bridge::{EngineBridge, EngineSession};

// Server implementation
pub mod server;
pub use server::{PgWireServer, ServerHandle};
