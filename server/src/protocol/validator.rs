//! Protocol validator for PostgreSQL wire protocol
//!
//! Decides whether a frontend message is allowed in the current connection
//! state before the session acts on it.

use crate::error::{PgWireError, Result};
use crate::protocol::connection::ConnectionState;
use crate::protocol::message::FrontendMessage;
use log::trace;

/// What the session should do with a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Handle the message
    Process,

    /// Drop the message silently
    Ignore,

    /// A non-COPY message arrived during COPY FROM STDIN; fail the copy
    AbortCopy,
}

/// Protocol validator for PostgreSQL wire protocol
#[derive(Debug, Default, Clone, Copy)]
pub struct ProtocolValidator;

impl ProtocolValidator {
    /// Create a new protocol validator
    pub fn new() -> Self {
        Self
    }

    /// Validate a frontend message against the current connection state
    pub fn validate_message(&self, message: &FrontendMessage, state: ConnectionState) -> Result<Verdict> {
        trace!("Validating {} in state {:?}", message.name(), state);

        if let FrontendMessage::Unknown { tag, .. } = message {
            return Err(PgWireError::ProtocolViolation(format!(
                "invalid frontend message type {}",
                printable(*tag)
            )));
        }

        let verdict = match state {
            ConnectionState::AwaitingStartup => match message {
                FrontendMessage::Startup { .. }
                | FrontendMessage::SSLRequest
                | FrontendMessage::GSSENCRequest
                | FrontendMessage::CancelRequest { .. } => Verdict::Process,
                other => return Err(not_permitted(other, state)),
            },
            ConnectionState::Authenticating => match message {
                FrontendMessage::PasswordMessage(_) | FrontendMessage::Terminate => Verdict::Process,
                other => {
                    return Err(PgWireError::ProtocolViolation(format!(
                        "expected password response, got {}",
                        other.name()
                    )))
                }
            },
            ConnectionState::Ready | ConnectionState::ExtendedQuery => match message {
                FrontendMessage::Query(_)
                | FrontendMessage::Parse { .. }
                | FrontendMessage::Bind { .. }
                | FrontendMessage::Describe { .. }
                | FrontendMessage::Execute { .. }
                | FrontendMessage::Sync
                | FrontendMessage::Flush
                | FrontendMessage::Close { .. }
                | FrontendMessage::FunctionCall { .. }
                | FrontendMessage::Terminate => Verdict::Process,
                // Leftovers from a COPY that already ended
                FrontendMessage::CopyData(_) | FrontendMessage::CopyDone | FrontendMessage::CopyFail(_) => {
                    Verdict::Ignore
                }
                other => return Err(not_permitted(other, state)),
            },
            ConnectionState::CopyIn => match message {
                FrontendMessage::CopyData(_)
                | FrontendMessage::CopyDone
                | FrontendMessage::CopyFail(_)
                | FrontendMessage::Terminate => Verdict::Process,
                FrontendMessage::Sync | FrontendMessage::Flush => Verdict::Ignore,
                FrontendMessage::Startup { .. }
                | FrontendMessage::SSLRequest
                | FrontendMessage::GSSENCRequest
                | FrontendMessage::CancelRequest { .. }
                | FrontendMessage::PasswordMessage(_) => return Err(not_permitted(message, state)),
                _ => Verdict::AbortCopy,
            },
            ConnectionState::Terminated => return Err(not_permitted(message, state)),
        };

        Ok(verdict)
    }
}

fn not_permitted(message: &FrontendMessage, state: ConnectionState) -> PgWireError {
    PgWireError::ProtocolViolation(format!(
        "{} is not permitted in state {:?}",
        message.name(),
        state
    ))
}

fn printable(tag: u8) -> String {
    if tag.is_ascii_graphic() {
        format!("'{}'", tag as char)
    } else {
        format!("0x{:02x}", tag)
    }
}
