//! Helpers shared by the integration tests

#![allow(dead_code)]

use bytes::Bytes;
use duckdb_pgwire_core::{Database, FunctionRegistry};
use duckdb_pgwire_server::config::ServerConfig;
use duckdb_pgwire_server::protocol::message::{BackendMessage, FrontendMessage};
use duckdb_pgwire_server::protocol::PgClientCodec;
use duckdb_pgwire_server::server::{PgWireServer, ServerHandle};
use duckdb_pgwire_server::tls::TlsNegotiator;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn test_database() -> Arc<Database> {
    Arc::new(Database::open_in_memory(FunctionRegistry::with_pgwire_extension()).unwrap())
}

/// Start a server on an ephemeral port
pub async fn start_server(config: ServerConfig) -> ServerHandle {
    init_logging();
    PgWireServer::new(config, test_database())
        .unwrap()
        .start()
        .await
        .unwrap()
}

/// Start a server with a TLS negotiator built by the test
pub async fn start_server_with_tls(config: ServerConfig, tls: TlsNegotiator) -> ServerHandle {
    init_logging();
    PgWireServer::with_tls(config, test_database(), tls)
        .start()
        .await
        .unwrap()
}

pub fn startup(user: &str) -> FrontendMessage {
    FrontendMessage::Startup {
        version_major: 3,
        version_minor: 0,
        parameters: HashMap::from([
            ("user".to_string(), user.to_string()),
            ("database".to_string(), "main".to_string()),
            ("application_name".to_string(), "pgwire-tests".to_string()),
        ]),
    }
}

/// Message-level client used to drive the protocol by hand
pub struct RawClient {
    framed: Framed<TcpStream, PgClientCodec>,
}

impl RawClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: Framed::new(stream, PgClientCodec::new()),
        }
    }

    /// Connect and complete a trust-authenticated startup
    pub async fn connect_ready(addr: SocketAddr) -> Self {
        let mut client = Self::connect(addr).await;
        client.send(startup("duckdb")).await;
        let greeting = client.recv_until_ready().await;
        assert!(matches!(greeting.first(), Some(BackendMessage::Authentication(_))));
        client
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        self.framed.get_mut()
    }

    pub async fn send(&mut self, message: FrontendMessage) {
        self.framed.send(message).await.unwrap();
    }

    /// Queue several messages and flush them in one write
    pub async fn send_all(&mut self, messages: Vec<FrontendMessage>) {
        for message in messages {
            self.framed.feed(message).await.unwrap();
        }
        SinkExt::<FrontendMessage>::flush(&mut self.framed).await.unwrap();
    }

    /// Next message, or `None` when the server closed the connection
    pub async fn try_recv(&mut self) -> Option<BackendMessage> {
        match tokio::time::timeout(RECV_TIMEOUT, self.framed.next()).await {
            Ok(Some(Ok(message))) => Some(message),
            Ok(Some(Err(_))) | Ok(None) => None,
            Err(_) => panic!("timed out waiting for the server"),
        }
    }

    pub async fn recv(&mut self) -> BackendMessage {
        self.try_recv().await.expect("connection closed")
    }

    /// Collect messages up to and including ReadyForQuery
    pub async fn recv_until_ready(&mut self) -> Vec<BackendMessage> {
        let mut messages = Vec::new();
        loop {
            let message = self.recv().await;
            let done = matches!(message, BackendMessage::ReadyForQuery(_));
            messages.push(message);
            if done {
                return messages;
            }
        }
    }

    /// Whether the server closes the connection without sending anything else
    pub async fn closed(&mut self) -> bool {
        self.try_recv().await.is_none()
    }

    pub async fn query(&mut self, sql: &str) -> Vec<BackendMessage> {
        self.send(FrontendMessage::Query(sql.to_string())).await;
        self.recv_until_ready().await
    }
}

/// Text values of every DataRow in `messages`
pub fn data_rows(messages: &[BackendMessage]) -> Vec<Vec<Option<String>>> {
    messages
        .iter()
        .filter_map(|message| match message {
            BackendMessage::DataRow(values) => Some(
                values
                    .iter()
                    .map(|v| v.as_ref().map(|b| String::from_utf8_lossy(b).into_owned()))
                    .collect(),
            ),
            _ => None,
        })
        .collect()
}

/// SQLSTATE codes of every ErrorResponse in `messages`
pub fn error_codes(messages: &[BackendMessage]) -> Vec<String> {
    messages
        .iter()
        .filter_map(|message| match message {
            BackendMessage::ErrorResponse(fields) => fields.code().map(str::to_string),
            _ => None,
        })
        .collect()
}

/// Command tags of every CommandComplete in `messages`
pub fn command_tags(messages: &[BackendMessage]) -> Vec<String> {
    messages
        .iter()
        .filter_map(|message| match message {
            BackendMessage::CommandComplete(tag) => Some(tag.clone()),
            _ => None,
        })
        .collect()
}

pub fn copy_data(text: &str) -> FrontendMessage {
    FrontendMessage::CopyData(Bytes::copy_from_slice(text.as_bytes()))
}
