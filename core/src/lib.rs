//! # DuckDB pgwire core
//!
//! Engine side of the pgwire server: the embedded SQL database, statement
//! splitting, the engine type system and the extension functions.
//! This crate knows nothing about the wire protocol.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod engine;
pub mod error;
pub mod extension;
pub mod sql;
pub mod sqlstate;
pub mod types;

/// Re-export common types for ease of use
pub use engine::{tag_rows, Connection, Database, QueryResult, RowStream, StatementDescription};
pub use rusqlite::InterruptHandle;
pub use error::{EngineError, Result};
pub use extension::{FunctionRegistry, ScalarFunction};
pub use sql::{split_statements, SqlStatement, StatementKind};
pub use types::{Column, LogicalType, Value};
