//! Message types for the PostgreSQL wire protocol
use crate::error::SqlError;
use bytes::Bytes;
use std::collections::HashMap;

/// Protocol version code of an SSLRequest
pub const SSL_REQUEST_CODE: i32 = 80877103;

/// Protocol version code of a GSSENCRequest
pub const GSSENC_REQUEST_CODE: i32 = 80877104;

/// Protocol version code of a CancelRequest
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

/// Describe / Close target: prepared statement
pub const TARGET_STATEMENT: u8 = b'S';

/// Describe / Close target: portal
pub const TARGET_PORTAL: u8 = b'P';

/// Frontend (client-to-server) message types
#[derive(Debug, Clone, PartialEq)]
pub enum FrontendMessage {
    /// Startup message with protocol version and parameters
    Startup {
        /// Major protocol version (should be 3)
        version_major: i16,
        /// Minor protocol version (should be 0)
        version_minor: i16,
        /// Parameters (key-value pairs)
        parameters: HashMap<String, String>,
    },

    /// SSL request
    SSLRequest,

    /// GSSAPI encryption request
    GSSENCRequest,

    /// Cancel request
    CancelRequest {
        /// Process ID to cancel
        process_id: i32,
        /// Secret key
        secret_key: i32,
    },

    /// Password, SASLInitialResponse or SASLResponse
    ///
    /// All three share the `p` tag; the body is interpreted by the
    /// authentication exchange in progress.
    PasswordMessage(Bytes),

    /// Query message (simple query protocol)
    Query(String),

    /// Parse message (extended query protocol)
    Parse {
        /// Prepared statement name
        name: String,
        /// Query string
        query: String,
        /// Parameter types (OIDs, 0 for unspecified)
        param_types: Vec<u32>,
    },

    /// Bind message (extended query protocol)
    Bind {
        /// Portal name
        portal: String,
        /// Prepared statement name
        statement: String,
        /// Parameter format codes
        param_formats: Vec<i16>,
        /// Parameter values
        param_values: Vec<Option<Bytes>>,
        /// Result format codes
        result_formats: Vec<i16>,
    },

    /// Describe message (extended query protocol)
    Describe {
        /// Object type ('S' for statement, 'P' for portal)
        object_type: u8,
        /// Object name
        name: String,
    },

    /// Execute message (extended query protocol)
    Execute {
        /// Portal name
        portal: String,
        /// Maximum row count (0 for unlimited)
        max_rows: i32,
    },

    /// Sync message (extended query protocol)
    Sync,

    /// Flush message (extended query protocol)
    Flush,

    /// Close message (extended query protocol)
    Close {
        /// Object type ('S' for statement, 'P' for portal)
        object_type: u8,
        /// Object name
        name: String,
    },

    /// Terminate message
    Terminate,

    /// COPY data message
    CopyData(Bytes),

    /// COPY done message
    CopyDone,

    /// COPY fail message
    CopyFail(String),

    /// Function call message
    FunctionCall {
        /// Function OID
        function_oid: u32,
        /// Argument format codes
        arg_formats: Vec<i16>,
        /// Argument values
        arg_values: Vec<Option<Bytes>>,
        /// Result format code
        result_format: i16,
    },

    /// Unknown message type
    Unknown {
        /// Message type
        tag: u8,
        /// Message body
        body: Bytes,
    },
}

impl FrontendMessage {
    /// Cleartext password response
    pub fn password(password: &str) -> Self {
        let mut body = Vec::with_capacity(password.len() + 1);
        body.extend_from_slice(password.as_bytes());
        body.push(0);
        FrontendMessage::PasswordMessage(Bytes::from(body))
    }

    /// SASLInitialResponse for the given mechanism
    pub fn sasl_initial_response(mechanism: &str, data: &[u8]) -> Self {
        let mut body = Vec::with_capacity(mechanism.len() + data.len() + 5);
        body.extend_from_slice(mechanism.as_bytes());
        body.push(0);
        body.extend_from_slice(&(data.len() as i32).to_be_bytes());
        body.extend_from_slice(data);
        FrontendMessage::PasswordMessage(Bytes::from(body))
    }

    /// SASLResponse carrying the next client message of the exchange
    pub fn sasl_response(data: &[u8]) -> Self {
        FrontendMessage::PasswordMessage(Bytes::copy_from_slice(data))
    }

    /// Short name used in logs and protocol errors
    pub fn name(&self) -> &'static str {
        match self {
            FrontendMessage::Startup { .. } => "StartupMessage",
            FrontendMessage::SSLRequest => "SSLRequest",
            FrontendMessage::GSSENCRequest => "GSSENCRequest",
            FrontendMessage::CancelRequest { .. } => "CancelRequest",
            FrontendMessage::PasswordMessage(_) => "PasswordMessage",
            FrontendMessage::Query(_) => "Query",
            FrontendMessage::Parse { .. } => "Parse",
            FrontendMessage::Bind { .. } => "Bind",
            FrontendMessage::Describe { .. } => "Describe",
            FrontendMessage::Execute { .. } => "Execute",
            FrontendMessage::Sync => "Sync",
            FrontendMessage::Flush => "Flush",
            FrontendMessage::Close { .. } => "Close",
            FrontendMessage::Terminate => "Terminate",
            FrontendMessage::CopyData(_) => "CopyData",
            FrontendMessage::CopyDone => "CopyDone",
            FrontendMessage::CopyFail(_) => "CopyFail",
            FrontendMessage::FunctionCall { .. } => "FunctionCall",
            FrontendMessage::Unknown { .. } => "Unknown",
        }
    }
}

/// Backend (server-to-client) message types
#[derive(Debug, Clone, PartialEq)]
pub enum BackendMessage {
    /// Authentication request
    Authentication(AuthenticationRequest),

    /// Parameter status
    ParameterStatus {
        /// Parameter name
        name: String,
        /// Parameter value
        value: String,
    },

    /// Ready for query
    ReadyForQuery(TransactionStatus),

    /// Command complete
    CommandComplete(String),

    /// Row description
    RowDescription(Vec<FieldDescription>),

    /// Data row
    DataRow(Vec<Option<Bytes>>),

    /// Empty query response
    EmptyQueryResponse,

    /// Error response
    ErrorResponse(ErrorOrNoticeFields),

    /// Notice response
    NoticeResponse(ErrorOrNoticeFields),

    /// Parse complete
    ParseComplete,

    /// Bind complete
    BindComplete,

    /// Portal suspended
    PortalSuspended,

    /// No data
    NoData,

    /// Parameter description
    ParameterDescription(Vec<u32>),

    /// Close complete
    CloseComplete,

    /// Answer to SSLRequest or GSSENCRequest (single byte 'S' or 'N', no envelope)
    SSLResponse(bool),

    /// Negotiation response
    NegotiateProtocolVersion {
        /// Latest minor protocol version supported by the server
        version_minor: i32,
        /// Options not recognized by the server
        options: Vec<String>,
    },

    /// Copy in response
    CopyInResponse {
        /// Format (0 for text, 1 for binary)
        format: i8,
        /// Column formats
        column_formats: Vec<i16>,
    },

    /// Copy out response
    CopyOutResponse {
        /// Format (0 for text, 1 for binary)
        format: i8,
        /// Column formats
        column_formats: Vec<i16>,
    },

    /// Copy data
    CopyData(Bytes),

    /// Copy done
    CopyDone,

    /// Unknown message type
    Unknown {
        /// Message type
        tag: u8,
        /// Message body
        body: Bytes,
    },
}

impl BackendMessage {
    /// ErrorResponse for a client-facing error
    pub fn error(err: &SqlError) -> Self {
        BackendMessage::ErrorResponse(ErrorOrNoticeFields::from(err))
    }

    /// NoticeResponse for a warning or notice
    pub fn notice(err: &SqlError) -> Self {
        BackendMessage::NoticeResponse(ErrorOrNoticeFields::from(err))
    }
}

/// Authentication request types
#[derive(Debug, Clone, PartialEq)]
pub enum AuthenticationRequest {
    /// Authentication successful
    Ok,

    /// Cleartext password required
    CleartextPassword,

    /// MD5 password required
    Md5Password {
        /// Salt for MD5 authentication
        salt: [u8; 4],
    },

    /// SASL authentication required
    SASL {
        /// SASL authentication mechanisms
        mechanisms: Vec<String>,
    },

    /// SASL continuation
    SASLContinue {
        /// SASL data
        data: Bytes,
    },

    /// SASL final
    SASLFinal {
        /// SASL data
        data: Bytes,
    },
}

/// Transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Idle (not in a transaction)
    Idle,

    /// In a transaction block
    InTransaction,

    /// In a failed transaction block
    Failed,
}

impl TransactionStatus {
    /// Convert from a byte to a transaction status
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'I' => Some(TransactionStatus::Idle),
            b'T' => Some(TransactionStatus::InTransaction),
            b'E' => Some(TransactionStatus::Failed),
            _ => None,
        }
    }

    /// Convert to a byte
    pub fn to_byte(self) -> u8 {
        match self {
            TransactionStatus::Idle => b'I',
            TransactionStatus::InTransaction => b'T',
            TransactionStatus::Failed => b'E',
        }
    }
}

/// Field description for row description message
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescription {
    /// Field name
    pub name: String,

    /// Table OID (0 if not from a table)
    pub table_oid: u32,

    /// Column attribute number (0 if not from a table)
    pub column_id: i16,

    /// Data type OID
    pub data_type_oid: u32,

    /// Data type size (-1 for variable length)
    pub data_type_size: i16,

    /// Type modifier
    pub type_modifier: i32,

    /// Format code (0 for text, 1 for binary)
    pub format_code: i16,
}

/// Error and notice message fields, in the order they appear on the wire
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ErrorOrNoticeFields {
    /// Field type byte and value
    pub fields: Vec<(u8, String)>,
}

impl ErrorOrNoticeFields {
    /// Wrap a list of fields
    pub fn new(fields: Vec<(u8, String)>) -> Self {
        Self { fields }
    }

    /// Value of the first field with the given type byte
    pub fn get(&self, tag: u8) -> Option<&str> {
        self.fields
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, value)| value.as_str())
    }

    /// Severity (`S`)
    pub fn severity(&self) -> Option<&str> {
        self.get(b'S')
    }

    /// SQLSTATE code (`C`)
    pub fn code(&self) -> Option<&str> {
        self.get(b'C')
    }

    /// Primary message (`M`)
    pub fn message(&self) -> Option<&str> {
        self.get(b'M')
    }
}

impl From<&SqlError> for ErrorOrNoticeFields {
    fn from(err: &SqlError) -> Self {
        Self::new(err.to_fields())
    }
}
