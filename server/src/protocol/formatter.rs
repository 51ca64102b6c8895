//! Message formatter for PostgreSQL wire protocol messages
//!
//! Backend messages are what the server sends; frontend encoding exists for
//! the client half of the codec used by tools and tests.

use crate::error::{PgWireError, Result};
use crate::protocol::message::{
    AuthenticationRequest, BackendMessage, ErrorOrNoticeFields, FrontendMessage, CANCEL_REQUEST_CODE,
    GSSENC_REQUEST_CODE, SSL_REQUEST_CODE,
};
use bytes::{BufMut, BytesMut};
use log::trace;

/// Message formatter for PostgreSQL wire protocol messages
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageFormatter;

impl MessageFormatter {
    /// Create a new message formatter
    pub fn new() -> Self {
        Self
    }

    /// Append a backend message to `buffer`
    pub fn write_backend_message(&self, buffer: &mut BytesMut, message: &BackendMessage) -> Result<()> {
        let start = buffer.len();
        match message {
            BackendMessage::Authentication(request) => self.write_authentication(buffer, request)?,
            BackendMessage::ParameterStatus { name, value } => {
                self.write_message_with_type(buffer, b'S', |buf| {
                    write_cstring(buf, name)?;
                    write_cstring(buf, value)
                })?;
            }
            BackendMessage::ReadyForQuery(status) => {
                self.write_message_with_type(buffer, b'Z', |buf| {
                    buf.put_u8(status.to_byte());
                    Ok(())
                })?;
            }
            BackendMessage::CommandComplete(tag) => {
                self.write_message_with_type(buffer, b'C', |buf| write_cstring(buf, tag))?;
            }
            BackendMessage::RowDescription(fields) => {
                self.write_message_with_type(buffer, b'T', |buf| {
                    buf.put_i16(count16(fields.len())?);
                    for field in fields {
                        write_cstring(buf, &field.name)?;
                        buf.put_u32(field.table_oid);
                        buf.put_i16(field.column_id);
                        buf.put_u32(field.data_type_oid);
                        buf.put_i16(field.data_type_size);
                        buf.put_i32(field.type_modifier);
                        buf.put_i16(field.format_code);
                    }
                    Ok(())
                })?;
            }
            BackendMessage::DataRow(values) => {
                self.write_message_with_type(buffer, b'D', |buf| {
                    buf.put_i16(count16(values.len())?);
                    for value in values {
                        match value {
                            Some(bytes) => {
                                buf.put_i32(len32(bytes.len())?);
                                buf.put_slice(bytes);
                            }
                            None => buf.put_i32(-1),
                        }
                    }
                    Ok(())
                })?;
            }
            BackendMessage::EmptyQueryResponse => self.write_empty(buffer, b'I')?,
            BackendMessage::ErrorResponse(fields) => self.write_error_or_notice(buffer, b'E', fields)?,
            BackendMessage::NoticeResponse(fields) => self.write_error_or_notice(buffer, b'N', fields)?,
            BackendMessage::ParseComplete => self.write_empty(buffer, b'1')?,
            BackendMessage::BindComplete => self.write_empty(buffer, b'2')?,
            BackendMessage::CloseComplete => self.write_empty(buffer, b'3')?,
            BackendMessage::PortalSuspended => self.write_empty(buffer, b's')?,
            BackendMessage::NoData => self.write_empty(buffer, b'n')?,
            BackendMessage::ParameterDescription(types) => {
                self.write_message_with_type(buffer, b't', |buf| {
                    buf.put_i16(count16(types.len())?);
                    for oid in types {
                        buf.put_u32(*oid);
                    }
                    Ok(())
                })?;
            }
            BackendMessage::NegotiateProtocolVersion {
                version_minor,
                options,
            } => {
                self.write_message_with_type(buffer, b'v', |buf| {
                    buf.put_i32(*version_minor);
                    buf.put_i32(len32(options.len())?);
                    for option in options {
                        write_cstring(buf, option)?;
                    }
                    Ok(())
                })?;
            }
            BackendMessage::CopyInResponse {
                format,
                column_formats,
            } => self.write_copy_response(buffer, b'G', *format, column_formats)?,
            BackendMessage::CopyOutResponse {
                format,
                column_formats,
            } => self.write_copy_response(buffer, b'H', *format, column_formats)?,
            BackendMessage::CopyData(data) => {
                self.write_message_with_type(buffer, b'd', |buf| {
                    buf.put_slice(data);
                    Ok(())
                })?;
            }
            BackendMessage::CopyDone => self.write_empty(buffer, b'c')?,
            BackendMessage::SSLResponse(accepted) => buffer.put_u8(if *accepted { b'S' } else { b'N' }),
            BackendMessage::Unknown { tag, body } => {
                self.write_message_with_type(buffer, *tag, |buf| {
                    buf.put_slice(body);
                    Ok(())
                })?;
            }
        }

        trace!("Formatted backend message ({} bytes)", buffer.len() - start);
        Ok(())
    }

    /// Append a frontend message to `buffer`
    pub fn write_frontend_message(&self, buffer: &mut BytesMut, message: &FrontendMessage) -> Result<()> {
        match message {
            FrontendMessage::Startup {
                version_major,
                version_minor,
                parameters,
            } => {
                self.write_untyped(buffer, |buf| {
                    buf.put_i16(*version_major);
                    buf.put_i16(*version_minor);
                    let mut keys: Vec<&String> = parameters.keys().collect();
                    keys.sort();
                    for key in keys {
                        write_cstring(buf, key)?;
                        write_cstring(buf, &parameters[key])?;
                    }
                    buf.put_u8(0);
                    Ok(())
                })?;
            }
            FrontendMessage::SSLRequest => self.write_untyped(buffer, |buf| {
                buf.put_i32(SSL_REQUEST_CODE);
                Ok(())
            })?,
            FrontendMessage::GSSENCRequest => self.write_untyped(buffer, |buf| {
                buf.put_i32(GSSENC_REQUEST_CODE);
                Ok(())
            })?,
            FrontendMessage::CancelRequest {
                process_id,
                secret_key,
            } => self.write_untyped(buffer, |buf| {
                buf.put_i32(CANCEL_REQUEST_CODE);
                buf.put_i32(*process_id);
                buf.put_i32(*secret_key);
                Ok(())
            })?,
            FrontendMessage::PasswordMessage(body) => {
                self.write_message_with_type(buffer, b'p', |buf| {
                    buf.put_slice(body);
                    Ok(())
                })?;
            }
            FrontendMessage::Query(query) => {
                self.write_message_with_type(buffer, b'Q', |buf| write_cstring(buf, query))?;
            }
            FrontendMessage::Parse {
                name,
                query,
                param_types,
            } => {
                self.write_message_with_type(buffer, b'P', |buf| {
                    write_cstring(buf, name)?;
                    write_cstring(buf, query)?;
                    buf.put_i16(count16(param_types.len())?);
                    for oid in param_types {
                        buf.put_u32(*oid);
                    }
                    Ok(())
                })?;
            }
            FrontendMessage::Bind {
                portal,
                statement,
                param_formats,
                param_values,
                result_formats,
            } => {
                self.write_message_with_type(buffer, b'B', |buf| {
                    write_cstring(buf, portal)?;
                    write_cstring(buf, statement)?;
                    write_i16_list(buf, param_formats)?;
                    buf.put_i16(count16(param_values.len())?);
                    for value in param_values {
                        match value {
                            Some(bytes) => {
                                buf.put_i32(len32(bytes.len())?);
                                buf.put_slice(bytes);
                            }
                            None => buf.put_i32(-1),
                        }
                    }
                    write_i16_list(buf, result_formats)
                })?;
            }
            FrontendMessage::Describe { object_type, name } => {
                self.write_message_with_type(buffer, b'D', |buf| {
                    buf.put_u8(*object_type);
                    write_cstring(buf, name)
                })?;
            }
            FrontendMessage::Execute { portal, max_rows } => {
                self.write_message_with_type(buffer, b'E', |buf| {
                    write_cstring(buf, portal)?;
                    buf.put_i32(*max_rows);
                    Ok(())
                })?;
            }
            FrontendMessage::Sync => self.write_empty(buffer, b'S')?,
            FrontendMessage::Flush => self.write_empty(buffer, b'H')?,
            FrontendMessage::Close { object_type, name } => {
                self.write_message_with_type(buffer, b'C', |buf| {
                    buf.put_u8(*object_type);
                    write_cstring(buf, name)
                })?;
            }
            FrontendMessage::Terminate => self.write_empty(buffer, b'X')?,
            FrontendMessage::CopyData(data) => {
                self.write_message_with_type(buffer, b'd', |buf| {
                    buf.put_slice(data);
                    Ok(())
                })?;
            }
            FrontendMessage::CopyDone => self.write_empty(buffer, b'c')?,
            FrontendMessage::CopyFail(message) => {
                self.write_message_with_type(buffer, b'f', |buf| write_cstring(buf, message))?;
            }
            FrontendMessage::FunctionCall {
                function_oid,
                arg_formats,
                arg_values,
                result_format,
            } => {
                self.write_message_with_type(buffer, b'F', |buf| {
                    buf.put_u32(*function_oid);
                    write_i16_list(buf, arg_formats)?;
                    buf.put_i16(count16(arg_values.len())?);
                    for value in arg_values {
                        match value {
                            Some(bytes) => {
                                buf.put_i32(len32(bytes.len())?);
                                buf.put_slice(bytes);
                            }
                            None => buf.put_i32(-1),
                        }
                    }
                    buf.put_i16(*result_format);
                    Ok(())
                })?;
            }
            FrontendMessage::Unknown { tag, body } => {
                self.write_message_with_type(buffer, *tag, |buf| {
                    buf.put_slice(body);
                    Ok(())
                })?;
            }
        }
        Ok(())
    }

    /// Write a message with the specified type code
    ///
    /// The length is back-patched once the body is written.
    fn write_message_with_type<F>(&self, buffer: &mut BytesMut, type_code: u8, writer: F) -> Result<()>
    where
        F: FnOnce(&mut BytesMut) -> Result<()>,
    {
        let start = buffer.len();
        buffer.put_u8(type_code);
        let result = self.write_untyped(buffer, writer);
        if result.is_err() {
            buffer.truncate(start);
        }
        result
    }

    /// Write a length-prefixed body without a type code (startup-phase layout)
    fn write_untyped<F>(&self, buffer: &mut BytesMut, writer: F) -> Result<()>
    where
        F: FnOnce(&mut BytesMut) -> Result<()>,
    {
        let length_pos = buffer.len();
        buffer.put_i32(0);
        if let Err(e) = writer(buffer) {
            buffer.truncate(length_pos);
            return Err(e);
        }
        let length = len32(buffer.len() - length_pos)?;
        buffer[length_pos..length_pos + 4].copy_from_slice(&length.to_be_bytes());
        Ok(())
    }

    fn write_empty(&self, buffer: &mut BytesMut, type_code: u8) -> Result<()> {
        self.write_message_with_type(buffer, type_code, |_| Ok(()))
    }

    fn write_authentication(&self, buffer: &mut BytesMut, request: &AuthenticationRequest) -> Result<()> {
        self.write_message_with_type(buffer, b'R', |buf| {
            match request {
                AuthenticationRequest::Ok => buf.put_i32(0),
                AuthenticationRequest::CleartextPassword => buf.put_i32(3),
                AuthenticationRequest::Md5Password { salt } => {
                    buf.put_i32(5);
                    buf.put_slice(salt);
                }
                AuthenticationRequest::SASL { mechanisms } => {
                    buf.put_i32(10);
                    for mechanism in mechanisms {
                        write_cstring(buf, mechanism)?;
                    }
                    buf.put_u8(0);
                }
                AuthenticationRequest::SASLContinue { data } => {
                    buf.put_i32(11);
                    buf.put_slice(data);
                }
                AuthenticationRequest::SASLFinal { data } => {
                    buf.put_i32(12);
                    buf.put_slice(data);
                }
            }
            Ok(())
        })
    }

    fn write_error_or_notice(
        &self,
        buffer: &mut BytesMut,
        type_code: u8,
        fields: &ErrorOrNoticeFields,
    ) -> Result<()> {
        self.write_message_with_type(buffer, type_code, |buf| {
            for (field_type, value) in &fields.fields {
                buf.put_u8(*field_type);
                write_cstring(buf, value)?;
            }
            buf.put_u8(0);
            Ok(())
        })
    }

    fn write_copy_response(
        &self,
        buffer: &mut BytesMut,
        type_code: u8,
        format: i8,
        column_formats: &[i16],
    ) -> Result<()> {
        self.write_message_with_type(buffer, type_code, |buf| {
            buf.put_i8(format);
            write_i16_list(buf, column_formats)
        })
    }
}

/// Write a null-terminated string
fn write_cstring(buffer: &mut BytesMut, value: &str) -> Result<()> {
    if value.as_bytes().contains(&0) {
        return Err(PgWireError::ProtocolViolation(
            "string contains a NUL byte".to_string(),
        ));
    }
    buffer.put_slice(value.as_bytes());
    buffer.put_u8(0);
    Ok(())
}

fn write_i16_list(buffer: &mut BytesMut, values: &[i16]) -> Result<()> {
    buffer.put_i16(count16(values.len())?);
    for value in values {
        buffer.put_i16(*value);
    }
    Ok(())
}

fn count16(count: usize) -> Result<i16> {
    i16::try_from(count)
        .map_err(|_| PgWireError::ProtocolViolation(format!("too many elements for one message: {}", count)))
}

fn len32(len: usize) -> Result<i32> {
    i32::try_from(len).map_err(|_| PgWireError::ProtocolViolation(format!("message too large: {} bytes", len)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{FieldDescription, TransactionStatus};
    use bytes::Bytes;

    fn format(message: &BackendMessage) -> Bytes {
        let mut buffer = BytesMut::new();
        MessageFormatter::new().write_backend_message(&mut buffer, message).unwrap();
        buffer.freeze()
    }

    #[test]
    fn test_format_simple_messages() {
        let bytes = format(&BackendMessage::ReadyForQuery(TransactionStatus::Idle));
        assert_eq!(&bytes[..], &[b'Z', 0, 0, 0, 5, b'I']);

        let bytes = format(&BackendMessage::EmptyQueryResponse);
        assert_eq!(&bytes[..], &[b'I', 0, 0, 0, 4]);

        let bytes = format(&BackendMessage::CommandComplete("SELECT 1".to_string()));
        assert_eq!(bytes[0], b'C');
        assert_eq!(bytes[1..5], 13_i32.to_be_bytes());
        assert_eq!(&bytes[5..], b"SELECT 1\0");
    }

    #[test]
    fn test_format_ssl_response_has_no_envelope() {
        assert_eq!(&format(&BackendMessage::SSLResponse(true))[..], b"S");
        assert_eq!(&format(&BackendMessage::SSLResponse(false))[..], b"N");
    }

    #[test]
    fn test_format_row_description() {
        let bytes = format(&BackendMessage::RowDescription(vec![FieldDescription {
            name: "greeting".to_string(),
            table_oid: 0,
            column_id: 0,
            data_type_oid: 25,
            data_type_size: -1,
            type_modifier: -1,
            format_code: 0,
        }]));
        assert_eq!(bytes[0], b'T');
        // 4 length + 2 count + 9 name + 18 fixed
        assert_eq!(bytes[1..5], 33_i32.to_be_bytes());
        assert_eq!(&bytes[7..16], b"greeting\0");
    }

    #[test]
    fn test_format_data_row_with_null() {
        let bytes = format(&BackendMessage::DataRow(vec![Some(Bytes::from_static(b"1")), None]));
        assert_eq!(
            &bytes[..],
            &[b'D', 0, 0, 0, 15, 0, 2, 0, 0, 0, 1, b'1', 0xff, 0xff, 0xff, 0xff]
        );
    }

    #[test]
    fn test_format_startup_message() {
        let mut parameters = std::collections::HashMap::new();
        parameters.insert("user".to_string(), "alice".to_string());
        let mut buffer = BytesMut::new();
        MessageFormatter::new()
            .write_frontend_message(
                &mut buffer,
                &FrontendMessage::Startup {
                    version_major: 3,
                    version_minor: 0,
                    parameters,
                },
            )
            .unwrap();
        assert_eq!(buffer[0..4], 20_i32.to_be_bytes());
        assert_eq!(buffer[4..8], 196608_i32.to_be_bytes());
        assert_eq!(&buffer[8..], b"user\0alice\0\0");
    }

    #[test]
    fn test_nul_in_string_is_rejected() {
        let mut buffer = BytesMut::new();
        let result = MessageFormatter::new()
            .write_backend_message(&mut buffer, &BackendMessage::CommandComplete("a\0b".to_string()));
        assert!(result.is_err());
        assert!(buffer.is_empty());
    }
}
