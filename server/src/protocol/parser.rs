//! Message parser for PostgreSQL wire protocol messages
//!
//! The codec hands over complete frames; the parser turns a frame body into a
//! typed message. Every read is bounds-checked and the body must be consumed
//! exactly, otherwise the declared length did not match the content.
use crate::error::{PgWireError, Result};
use crate::protocol::codec::Frame;
use crate::protocol::message::{
    AuthenticationRequest, BackendMessage, ErrorOrNoticeFields, FieldDescription, FrontendMessage,
    TransactionStatus, CANCEL_REQUEST_CODE, GSSENC_REQUEST_CODE, SSL_REQUEST_CODE,
};
use bytes::{Buf, Bytes};
use std::collections::HashMap;

/// Message parser for PostgreSQL wire protocol
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageParser;

impl MessageParser {
    /// Create a new message parser
    pub fn new() -> Self {
        Self
    }

    /// Parse a frontend message from a frame
    pub fn parse_frontend_message(&self, frame: &Frame) -> Result<FrontendMessage> {
        let tag = match frame.tag {
            Some(tag) => tag,
            None => return self.parse_startup_message(&frame.body),
        };
        let mut body = BodyReader::new(frame.body.clone());

        let message = match tag {
            b'p' => FrontendMessage::PasswordMessage(body.rest()),
            b'Q' => FrontendMessage::Query(body.cstring()?),
            b'P' => {
                let name = body.cstring()?;
                let query = body.cstring()?;
                let count = body.count()?;
                let mut param_types = Vec::with_capacity(count);
                for _ in 0..count {
                    param_types.push(body.u32()?);
                }
                FrontendMessage::Parse {
                    name,
                    query,
                    param_types,
                }
            }
            b'B' => {
                let portal = body.cstring()?;
                let statement = body.cstring()?;
                let param_formats = body.i16_list()?;
                let count = body.count()?;
                let mut param_values = Vec::with_capacity(count);
                for _ in 0..count {
                    param_values.push(body.nullable_bytes()?);
                }
                let result_formats = body.i16_list()?;
                FrontendMessage::Bind {
                    portal,
                    statement,
                    param_formats,
                    param_values,
                    result_formats,
                }
            }
            b'D' => FrontendMessage::Describe {
                object_type: body.u8()?,
                name: body.cstring()?,
            },
            b'E' => FrontendMessage::Execute {
                portal: body.cstring()?,
                max_rows: body.i32()?,
            },
            b'S' => FrontendMessage::Sync,
            b'H' => FrontendMessage::Flush,
            b'C' => FrontendMessage::Close {
                object_type: body.u8()?,
                name: body.cstring()?,
            },
            b'X' => FrontendMessage::Terminate,
            b'd' => FrontendMessage::CopyData(body.rest()),
            b'c' => FrontendMessage::CopyDone,
            b'f' => FrontendMessage::CopyFail(body.cstring()?),
            b'F' => {
                let function_oid = body.u32()?;
                let arg_formats = body.i16_list()?;
                let count = body.count()?;
                let mut arg_values = Vec::with_capacity(count);
                for _ in 0..count {
                    arg_values.push(body.nullable_bytes()?);
                }
                FrontendMessage::FunctionCall {
                    function_oid,
                    arg_formats,
                    arg_values,
                    result_format: body.i16()?,
                }
            }
            _ => FrontendMessage::Unknown {
                tag,
                body: body.rest(),
            },
        };

        body.finish(tag)?;
        Ok(message)
    }

    /// Parse the untagged first message of a connection
    pub fn parse_startup_message(&self, bytes: &Bytes) -> Result<FrontendMessage> {
        let mut body = BodyReader::new(bytes.clone());
        let code = body.i32()?;

        let message = match code {
            SSL_REQUEST_CODE => FrontendMessage::SSLRequest,
            GSSENC_REQUEST_CODE => FrontendMessage::GSSENCRequest,
            CANCEL_REQUEST_CODE => FrontendMessage::CancelRequest {
                process_id: body.i32()?,
                secret_key: body.i32()?,
            },
            version => {
                let mut parameters = HashMap::new();
                loop {
                    let key = body.cstring()?;
                    if key.is_empty() {
                        break;
                    }
                    let value = body.cstring()?;
                    parameters.insert(key, value);
                }
                FrontendMessage::Startup {
                    version_major: (version >> 16) as i16,
                    version_minor: (version & 0xFFFF) as i16,
                    parameters,
                }
            }
        };

        body.finish(0)?;
        Ok(message)
    }

    /// Parse a backend message from a frame
    ///
    /// Used by the client side of the codec.
    pub fn parse_backend_message(&self, frame: &Frame) -> Result<BackendMessage> {
        let tag = frame
            .tag
            .ok_or_else(|| PgWireError::Framing("backend message without a type byte".to_string()))?;
        let mut body = BodyReader::new(frame.body.clone());

        let message = match tag {
            b'R' => BackendMessage::Authentication(self.parse_authentication(&mut body)?),
            b'S' => BackendMessage::ParameterStatus {
                name: body.cstring()?,
                value: body.cstring()?,
            },
            b'Z' => {
                let status = body.u8()?;
                BackendMessage::ReadyForQuery(TransactionStatus::from_byte(status).ok_or_else(|| {
                    PgWireError::ProtocolViolation(format!("invalid transaction status {}", status))
                })?)
            }
            b'C' => BackendMessage::CommandComplete(body.cstring()?),
            b'T' => {
                let count = body.count()?;
                let mut fields = Vec::with_capacity(count);
                for _ in 0..count {
                    fields.push(FieldDescription {
                        name: body.cstring()?,
                        table_oid: body.u32()?,
                        column_id: body.i16()?,
                        data_type_oid: body.u32()?,
                        data_type_size: body.i16()?,
                        type_modifier: body.i32()?,
                        format_code: body.i16()?,
                    });
                }
                BackendMessage::RowDescription(fields)
            }
            b'D' => {
                let count = body.count()?;
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    values.push(body.nullable_bytes()?);
                }
                BackendMessage::DataRow(values)
            }
            b'I' => BackendMessage::EmptyQueryResponse,
            b'E' => BackendMessage::ErrorResponse(self.parse_error_fields(&mut body)?),
            b'N' => BackendMessage::NoticeResponse(self.parse_error_fields(&mut body)?),
            b'1' => BackendMessage::ParseComplete,
            b'2' => BackendMessage::BindComplete,
            b'3' => BackendMessage::CloseComplete,
            b's' => BackendMessage::PortalSuspended,
            b'n' => BackendMessage::NoData,
            b't' => {
                let count = body.count()?;
                let mut types = Vec::with_capacity(count);
                for _ in 0..count {
                    types.push(body.u32()?);
                }
                BackendMessage::ParameterDescription(types)
            }
            b'v' => {
                let version_minor = body.i32()?;
                let count = body.i32()?;
                let mut options = Vec::new();
                for _ in 0..count.max(0) {
                    options.push(body.cstring()?);
                }
                BackendMessage::NegotiateProtocolVersion {
                    version_minor,
                    options,
                }
            }
            b'G' => BackendMessage::CopyInResponse {
                format: body.u8()? as i8,
                column_formats: body.i16_list()?,
            },
            b'H' => BackendMessage::CopyOutResponse {
                format: body.u8()? as i8,
                column_formats: body.i16_list()?,
            },
            b'd' => BackendMessage::CopyData(body.rest()),
            b'c' => BackendMessage::CopyDone,
            _ => BackendMessage::Unknown {
                tag,
                body: body.rest(),
            },
        };

        body.finish(tag)?;
        Ok(message)
    }

    fn parse_authentication(&self, body: &mut BodyReader) -> Result<AuthenticationRequest> {
        let code = body.i32()?;
        Ok(match code {
            0 => AuthenticationRequest::Ok,
            3 => AuthenticationRequest::CleartextPassword,
            5 => {
                let mut salt = [0u8; 4];
                salt.copy_from_slice(&body.bytes(4)?);
                AuthenticationRequest::Md5Password { salt }
            }
            10 => {
                let mut mechanisms = Vec::new();
                loop {
                    let mechanism = body.cstring()?;
                    if mechanism.is_empty() {
                        break;
                    }
                    mechanisms.push(mechanism);
                }
                AuthenticationRequest::SASL { mechanisms }
            }
            11 => AuthenticationRequest::SASLContinue { data: body.rest() },
            12 => AuthenticationRequest::SASLFinal { data: body.rest() },
            other => {
                return Err(PgWireError::ProtocolViolation(format!(
                    "unsupported authentication request {}",
                    other
                )))
            }
        })
    }

    fn parse_error_fields(&self, body: &mut BodyReader) -> Result<ErrorOrNoticeFields> {
        let mut fields = Vec::new();
        loop {
            let field_type = body.u8()?;
            if field_type == 0 {
                break;
            }
            fields.push((field_type, body.cstring()?));
        }
        Ok(ErrorOrNoticeFields::new(fields))
    }
}

/// Bounds-checked reader over a message body
struct BodyReader {
    buf: Bytes,
}

impl BodyReader {
    fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(PgWireError::Framing(format!(
                "message body too short: needed {} more bytes, {} left",
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn i16(&mut self) -> Result<i16> {
        self.need(2)?;
        Ok(self.buf.get_i16())
    }

    fn i32(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    /// Non-negative Int16 element count
    fn count(&mut self) -> Result<usize> {
        let count = self.i16()?;
        usize::try_from(count)
            .map_err(|_| PgWireError::ProtocolViolation(format!("negative element count {}", count)))
    }

    fn i16_list(&mut self) -> Result<Vec<i16>> {
        let count = self.count()?;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.i16()?);
        }
        Ok(values)
    }

    fn bytes(&mut self, n: usize) -> Result<Bytes> {
        self.need(n)?;
        Ok(self.buf.split_to(n))
    }

    /// Int32 length followed by that many bytes; -1 is NULL
    fn nullable_bytes(&mut self) -> Result<Option<Bytes>> {
        let len = self.i32()?;
        if len == -1 {
            return Ok(None);
        }
        let len = usize::try_from(len)
            .map_err(|_| PgWireError::ProtocolViolation(format!("invalid value length {}", len)))?;
        self.bytes(len).map(Some)
    }

    fn cstring(&mut self) -> Result<String> {
        let end = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| PgWireError::Framing("unterminated string in message body".to_string()))?;
        let raw = self.buf.split_to(end);
        self.buf.advance(1);
        String::from_utf8(raw.to_vec())
            .map_err(|e| PgWireError::ProtocolViolation(format!("invalid UTF-8 in message: {}", e)))
    }

    fn rest(&mut self) -> Bytes {
        let len = self.buf.remaining();
        self.buf.split_to(len)
    }

    fn finish(&self, tag: u8) -> Result<()> {
        if self.buf.has_remaining() {
            return Err(PgWireError::Framing(format!(
                "{} trailing bytes in message '{}'",
                self.buf.remaining(),
                tag as char
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn frame(tag: Option<u8>, body: &[u8]) -> Frame {
        Frame {
            tag,
            body: Bytes::copy_from_slice(body),
        }
    }

    #[test]
    fn test_parse_startup_message() {
        let mut buf = BytesMut::new();
        buf.put_i32(196608);
        buf.put_slice(b"user\0alice\0database\0test\0\0");

        let result = MessageParser::new()
            .parse_frontend_message(&frame(None, &buf))
            .unwrap();

        match result {
            FrontendMessage::Startup {
                version_major,
                version_minor,
                parameters,
            } => {
                assert_eq!(version_major, 3);
                assert_eq!(version_minor, 0);
                assert_eq!(parameters.get("user").map(String::as_str), Some("alice"));
                assert_eq!(parameters.get("database").map(String::as_str), Some("test"));
            }
            other => panic!("Expected Startup message, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_special_startup_codes() {
        let parser = MessageParser::new();
        assert_eq!(
            parser.parse_frontend_message(&frame(None, &SSL_REQUEST_CODE.to_be_bytes())).unwrap(),
            FrontendMessage::SSLRequest
        );
        assert_eq!(
            parser.parse_frontend_message(&frame(None, &GSSENC_REQUEST_CODE.to_be_bytes())).unwrap(),
            FrontendMessage::GSSENCRequest
        );

        let mut buf = BytesMut::new();
        buf.put_i32(CANCEL_REQUEST_CODE);
        buf.put_i32(42);
        buf.put_i32(7);
        assert_eq!(
            parser.parse_frontend_message(&frame(None, &buf)).unwrap(),
            FrontendMessage::CancelRequest {
                process_id: 42,
                secret_key: 7
            }
        );
    }

    #[test]
    fn test_parse_query_message() {
        let result = MessageParser::new()
            .parse_frontend_message(&frame(Some(b'Q'), b"SELECT 1;\0"))
            .unwrap();
        assert_eq!(result, FrontendMessage::Query("SELECT 1;".to_string()));
    }

    #[test]
    fn test_trailing_bytes_are_a_framing_error() {
        let result = MessageParser::new().parse_frontend_message(&frame(Some(b'S'), b"x"));
        assert!(matches!(result, Err(PgWireError::Framing(_))));
    }

    #[test]
    fn test_truncated_body_is_a_framing_error() {
        // Execute without its row limit
        let result = MessageParser::new().parse_frontend_message(&frame(Some(b'E'), b"portal\0"));
        assert!(matches!(result, Err(PgWireError::Framing(_))));

        let result = MessageParser::new().parse_frontend_message(&frame(Some(b'Q'), b"SELECT 1"));
        assert!(matches!(result, Err(PgWireError::Framing(_))));
    }

    #[test]
    fn test_bind_with_null_parameter() {
        let mut buf = BytesMut::new();
        buf.put_slice(b"\0s1\0");
        buf.put_i16(1);
        buf.put_i16(0);
        buf.put_i16(2);
        buf.put_i32(2);
        buf.put_slice(b"42");
        buf.put_i32(-1);
        buf.put_i16(0);

        match MessageParser::new().parse_frontend_message(&frame(Some(b'B'), &buf)).unwrap() {
            FrontendMessage::Bind {
                portal,
                statement,
                param_values,
                ..
            } => {
                assert_eq!(portal, "");
                assert_eq!(statement, "s1");
                assert_eq!(param_values, vec![Some(Bytes::from_static(b"42")), None]);
            }
            other => panic!("Expected Bind message, got {:?}", other),
        }
    }

    #[test]
    fn test_negative_count_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_slice(b"s\0SELECT 1\0");
        buf.put_i16(-1);
        let result = MessageParser::new().parse_frontend_message(&frame(Some(b'P'), &buf));
        assert!(matches!(result, Err(PgWireError::ProtocolViolation(_))));
    }

    #[test]
    fn test_parse_error_response() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'S');
        buf.put_slice(b"ERROR\0");
        buf.put_u8(b'C');
        buf.put_slice(b"42P01\0");
        buf.put_u8(b'M');
        buf.put_slice(b"no such table: users\0");
        buf.put_u8(0);

        match MessageParser::new().parse_backend_message(&frame(Some(b'E'), &buf)).unwrap() {
            BackendMessage::ErrorResponse(fields) => {
                assert_eq!(fields.severity(), Some("ERROR"));
                assert_eq!(fields.code(), Some("42P01"));
                assert_eq!(fields.message(), Some("no such table: users"));
            }
            other => panic!("Expected ErrorResponse message, got {:?}", other),
        }
    }
}
