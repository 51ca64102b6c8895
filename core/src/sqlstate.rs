//! SQLSTATE codes reported to PostgreSQL clients
//!
//! Only the codes the engine and the wire server actually raise are listed here.
//! Values follow appendix A of the PostgreSQL manual.

/// successful_completion
pub const SUCCESSFUL_COMPLETION: &str = "00000";

/// active_sql_transaction (raised as a warning)
pub const ACTIVE_SQL_TRANSACTION: &str = "25001";
/// no_active_sql_transaction (raised as a warning)
pub const NO_ACTIVE_SQL_TRANSACTION: &str = "25P01";
/// in_failed_sql_transaction
pub const IN_FAILED_SQL_TRANSACTION: &str = "25P02";
/// read_only_sql_transaction
pub const READ_ONLY_SQL_TRANSACTION: &str = "25006";

/// protocol_violation
pub const PROTOCOL_VIOLATION: &str = "08P01";
/// feature_not_supported
pub const FEATURE_NOT_SUPPORTED: &str = "0A000";

/// invalid_authorization_specification
pub const INVALID_AUTHORIZATION_SPECIFICATION: &str = "28000";
/// invalid_password
pub const INVALID_PASSWORD: &str = "28P01";

/// invalid_sql_statement_name
pub const INVALID_SQL_STATEMENT_NAME: &str = "26000";
/// invalid_cursor_name
pub const INVALID_CURSOR_NAME: &str = "34000";
/// duplicate_prepared_statement
pub const DUPLICATE_PREPARED_STATEMENT: &str = "42P05";
/// duplicate_cursor
pub const DUPLICATE_CURSOR: &str = "42P03";

/// syntax_error
pub const SYNTAX_ERROR: &str = "42601";
/// undefined_table
pub const UNDEFINED_TABLE: &str = "42P01";
/// undefined_column
pub const UNDEFINED_COLUMN: &str = "42703";
/// undefined_function
pub const UNDEFINED_FUNCTION: &str = "42883";
/// duplicate_table
pub const DUPLICATE_TABLE: &str = "42P07";
/// datatype_mismatch
pub const DATATYPE_MISMATCH: &str = "42804";

/// data_exception
pub const DATA_EXCEPTION: &str = "22000";
/// numeric_value_out_of_range
pub const NUMERIC_VALUE_OUT_OF_RANGE: &str = "22003";
/// invalid_text_representation
pub const INVALID_TEXT_REPRESENTATION: &str = "22P02";
/// invalid_binary_representation
pub const INVALID_BINARY_REPRESENTATION: &str = "22P03";
/// bad_copy_file_format
pub const BAD_COPY_FILE_FORMAT: &str = "22P04";
/// invalid_parameter_value
pub const INVALID_PARAMETER_VALUE: &str = "22023";

/// integrity_constraint_violation
pub const INTEGRITY_CONSTRAINT_VIOLATION: &str = "23000";
/// not_null_violation
pub const NOT_NULL_VIOLATION: &str = "23502";
/// foreign_key_violation
pub const FOREIGN_KEY_VIOLATION: &str = "23503";
/// unique_violation
pub const UNIQUE_VIOLATION: &str = "23505";
/// check_violation
pub const CHECK_VIOLATION: &str = "23514";

/// query_canceled
pub const QUERY_CANCELED: &str = "57014";
/// idle_session_timeout
pub const IDLE_SESSION_TIMEOUT: &str = "57P05";
/// admin_shutdown
pub const ADMIN_SHUTDOWN: &str = "57P01";
/// lock_not_available
pub const LOCK_NOT_AVAILABLE: &str = "55P03";
/// too_many_connections
pub const TOO_MANY_CONNECTIONS: &str = "53300";
/// program_limit_exceeded
pub const PROGRAM_LIMIT_EXCEEDED: &str = "54000";

/// internal_error
pub const INTERNAL_ERROR: &str = "XX000";
