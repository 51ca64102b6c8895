//! TLS negotiation
//!
//! Handles the encryption requests that may precede the startup packet.
//! SSLRequest is answered with `S` and followed by an OpenSSL handshake when
//! a certificate is configured, otherwise with `N`. GSSENCRequest is always
//! refused. After negotiation the rest of the connection runs over
//! [`MaybeTlsStream`] and never needs to know which one it got.

use crate::config::TlsConfig;
use crate::error::{PgWireError, Result};
use crate::protocol::codec::PgCodec;
use crate::protocol::message::{BackendMessage, FrontendMessage};
use crate::protocol::parser::MessageParser;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info};
use openssl::ssl::{Ssl, SslAcceptor, SslFiletype, SslMethod};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_openssl::SslStream;
use tokio_util::codec::Framed;

/// A client stream that may have been upgraded to TLS
#[derive(Debug)]
pub enum MaybeTlsStream<S> {
    /// Plaintext
    Plain(S),
    /// Encrypted with OpenSSL
    Tls(Box<SslStream<S>>),
}

impl<S> MaybeTlsStream<S> {
    /// Whether the stream is encrypted
    pub fn is_tls(&self) -> bool {
        matches!(self, MaybeTlsStream::Tls(_))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for MaybeTlsStream<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for MaybeTlsStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Framed client connection
pub type ClientFramed<S> = Framed<MaybeTlsStream<S>, PgCodec>;

/// Result of the pre-startup negotiation
pub enum Negotiated<S> {
    /// The client sent its startup packet
    Startup {
        /// Connection, encrypted or not
        framed: ClientFramed<S>,
        /// The startup message
        message: FrontendMessage,
    },

    /// The client sent a CancelRequest; the connection should be closed
    Cancel,

    /// The client went away before sending a startup packet
    Closed,
}

/// Answers SSLRequest and GSSENCRequest and performs the TLS handshake
#[derive(Clone)]
pub struct TlsNegotiator {
    acceptor: Option<Arc<SslAcceptor>>,
    require_tls: bool,
}

impl std::fmt::Debug for TlsNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsNegotiator")
            .field("enabled", &self.is_enabled())
            .field("require_tls", &self.require_tls)
            .finish()
    }
}

impl TlsNegotiator {
    /// Negotiator that refuses every encryption request
    pub fn disabled() -> Self {
        Self {
            acceptor: None,
            require_tls: false,
        }
    }

    /// Build a negotiator from configuration
    ///
    /// TLS is enabled when both a certificate and a key file are configured.
    pub fn from_config(config: &TlsConfig) -> Result<Self> {
        let acceptor = match (&config.cert_file, &config.key_file) {
            (Some(cert), Some(key)) => {
                let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?;
                builder.set_certificate_chain_file(cert)?;
                builder.set_private_key_file(key, SslFiletype::PEM)?;
                builder.check_private_key()?;
                info!("TLS enabled with certificate {}", cert.display());
                Some(Arc::new(builder.build()))
            }
            (None, None) => None,
            _ => {
                return Err(PgWireError::Config(
                    "tls.cert_file and tls.key_file must be set together".to_string(),
                ))
            }
        };

        if config.require_tls && acceptor.is_none() {
            return Err(PgWireError::Config(
                "tls.require_tls is set but no certificate is configured".to_string(),
            ));
        }

        Ok(Self {
            acceptor,
            require_tls: config.require_tls,
        })
    }

    /// Use an acceptor built elsewhere
    pub fn with_acceptor(acceptor: SslAcceptor, require_tls: bool) -> Self {
        Self {
            acceptor: Some(Arc::new(acceptor)),
            require_tls,
        }
    }

    /// Whether SSLRequest is answered with `S`
    pub fn is_enabled(&self) -> bool {
        self.acceptor.is_some()
    }

    /// Whether plaintext startups are refused
    pub fn require_tls(&self) -> bool {
        self.require_tls
    }

    /// Run the TLS handshake on a plaintext stream
    pub async fn accept<S>(&self, stream: S) -> Result<SslStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let acceptor = self
            .acceptor
            .as_ref()
            .ok_or_else(|| PgWireError::Tls("TLS is not configured".to_string()))?;
        let ssl = Ssl::new(acceptor.context())?;
        let mut stream = SslStream::new(ssl, stream)?;
        Pin::new(&mut stream).accept().await?;
        debug!("TLS handshake complete ({})", stream.ssl().version_str());
        Ok(stream)
    }

    /// Read startup-phase messages until the startup packet arrives
    ///
    /// Encryption requests are answered along the way. A second SSLRequest
    /// or plaintext bytes pipelined behind an SSLRequest are protocol
    /// violations.
    pub async fn negotiate<S>(&self, stream: S, codec: PgCodec) -> Result<Negotiated<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let parser = MessageParser::new();
        let mut framed = Framed::new(MaybeTlsStream::Plain(stream), codec);
        let mut ssl_requested = false;

        loop {
            let frame = match framed.next().await {
                Some(frame) => frame?,
                None => return Ok(Negotiated::Closed),
            };

            match parser.parse_startup_message(&frame.body)? {
                FrontendMessage::SSLRequest => {
                    if ssl_requested || framed.get_ref().is_tls() {
                        return Err(PgWireError::ProtocolViolation(
                            "duplicate SSLRequest".to_string(),
                        ));
                    }
                    ssl_requested = true;
                    if !framed.read_buffer().is_empty() {
                        return Err(PgWireError::ProtocolViolation(
                            "received unencrypted data after SSL request".to_string(),
                        ));
                    }

                    let accept = self.is_enabled();
                    debug!("SSLRequest answered with {}", if accept { 'S' } else { 'N' });
                    framed.send(BackendMessage::SSLResponse(accept)).await?;
                    if accept {
                        framed = self.upgrade(framed).await?;
                    }
                }
                FrontendMessage::GSSENCRequest => {
                    debug!("GSSENCRequest refused");
                    framed.send(BackendMessage::SSLResponse(false)).await?;
                }
                FrontendMessage::CancelRequest { process_id, .. } => {
                    debug!("CancelRequest for process {} ignored", process_id);
                    return Ok(Negotiated::Cancel);
                }
                message => return Ok(Negotiated::Startup { framed, message }),
            }
        }
    }

    async fn upgrade<S>(&self, framed: ClientFramed<S>) -> Result<ClientFramed<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let parts = framed.into_parts();
        let plain = match parts.io {
            MaybeTlsStream::Plain(stream) => stream,
            MaybeTlsStream::Tls(_) => {
                return Err(PgWireError::ProtocolViolation("TLS already started".to_string()))
            }
        };
        let tls = self.accept(plain).await?;
        Ok(Framed::new(MaybeTlsStream::Tls(Box::new(tls)), parts.codec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::SSL_REQUEST_CODE;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn ssl_request() -> Vec<u8> {
        let mut packet = 8i32.to_be_bytes().to_vec();
        packet.extend_from_slice(&SSL_REQUEST_CODE.to_be_bytes());
        packet
    }

    #[tokio::test]
    async fn test_ssl_refused_when_not_configured() {
        let (mut client, server) = tokio::io::duplex(1024);
        let negotiator = TlsNegotiator::disabled();
        let task = tokio::spawn(async move { negotiator.negotiate(server, PgCodec::default()).await });

        client.write_all(&ssl_request()).await.unwrap();
        let mut answer = [0u8; 1];
        client.read_exact(&mut answer).await.unwrap();
        assert_eq!(&answer, b"N");

        drop(client);
        assert!(matches!(task.await.unwrap().unwrap(), Negotiated::Closed));
    }

    #[tokio::test]
    async fn test_pipelined_bytes_after_ssl_request_are_rejected() {
        let (mut client, server) = tokio::io::duplex(1024);
        let negotiator = TlsNegotiator::disabled();

        let mut packet = ssl_request();
        packet.extend_from_slice(b"\x00\x00\x00\x08\x04\xd2\x16\x2f");
        client.write_all(&packet).await.unwrap();

        let result = negotiator.negotiate(server, PgCodec::default()).await;
        assert!(matches!(result, Err(PgWireError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_cancel_request_closes() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut packet = 16i32.to_be_bytes().to_vec();
        packet.extend_from_slice(&crate::protocol::message::CANCEL_REQUEST_CODE.to_be_bytes());
        packet.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 2]);
        client.write_all(&packet).await.unwrap();

        let result = TlsNegotiator::disabled()
            .negotiate(server, PgCodec::default())
            .await
            .unwrap();
        assert!(matches!(result, Negotiated::Cancel));
    }

    #[test]
    fn test_half_configured_tls_is_an_error() {
        let config = TlsConfig {
            cert_file: Some("server.crt".into()),
            key_file: None,
            require_tls: false,
        };
        assert!(matches!(
            TlsNegotiator::from_config(&config),
            Err(PgWireError::Config(_))
        ));
    }
}
