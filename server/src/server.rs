//! Server implementation for the pgwire server
//!
//! Accepts TCP connections, enforces the connection ceiling and runs one task
//! per client.

use crate::bridge::EngineBridge;
use crate::config::ServerConfig;
use crate::error::{PgWireError, Result};
use crate::protocol::connection::{handle_client, ConnectionContext};
use crate::protocol::codec::PgCodec;
use crate::protocol::message::BackendMessage;
use crate::tls::TlsNegotiator;
use duckdb_pgwire_core::Database;
use futures_util::SinkExt;
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

/// Main server implementation
pub struct PgWireServer {
    ctx: Arc<ConnectionContext>,
}

impl std::fmt::Debug for PgWireServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgWireServer").field("ctx", &self.ctx).finish()
    }
}

/// A running server
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    join: JoinHandle<()>,
}

impl ServerHandle {
    /// Address the server is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting clients and terminate open sessions
    pub fn stop(&self) {
        info!("Stopping server on {}", self.local_addr);
        self.shutdown.cancel();
    }

    /// Stop the server and wait for the accept loop to finish
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.join.await {
            error!("Accept loop failed: {}", e);
        }
    }
}

impl PgWireServer {
    /// Create a server over `database`
    pub fn new(config: ServerConfig, database: Arc<Database>) -> Result<Self> {
        config.validate()?;
        let tls = TlsNegotiator::from_config(&config.tls)?;
        Ok(Self::with_tls(config, database, tls))
    }

    /// Create a server with a TLS negotiator built elsewhere
    pub fn with_tls(config: ServerConfig, database: Arc<Database>, tls: TlsNegotiator) -> Self {
        let credentials = config.auth.credential_store();
        let ctx = ConnectionContext {
            config: Arc::new(config),
            bridge: EngineBridge::new(database),
            tls,
            credentials,
            shutdown: CancellationToken::new(),
        };
        Self { ctx: Arc::new(ctx) }
    }

    /// Server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.ctx.config
    }

    /// Bind the listener and start accepting clients
    pub async fn start(self) -> Result<ServerHandle> {
        let listen_addr = self.ctx.config.listen_addr;
        let listener = TcpListener::bind(listen_addr).await.map_err(|e| {
            PgWireError::Config(format!("failed to bind to {}: {}", listen_addr, e))
        })?;
        let local_addr = listener.local_addr()?;
        info!(
            "Listening on {} (TLS {}, auth {})",
            local_addr,
            if self.ctx.tls.is_enabled() { "enabled" } else { "disabled" },
            self.ctx.config.auth.method
        );

        let shutdown = self.ctx.shutdown.clone();
        let join = tokio::spawn(accept_loop(listener, self.ctx));
        Ok(ServerHandle {
            local_addr,
            shutdown,
            join,
        })
    }
}

async fn accept_loop(listener: TcpListener, ctx: Arc<ConnectionContext>) {
    let slots = Arc::new(Semaphore::new(ctx.config.max_connections));

    loop {
        let (stream, addr) = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Error accepting connection: {}", e);
                    continue;
                }
            },
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
        }

        let permit = match slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!("Connection from {} rejected: too many clients", addr);
                tokio::spawn(reject(stream, ctx.config.max_message_length));
                continue;
            }
        };

        debug!("New connection from {}", addr);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            match handle_client(stream, addr, ctx).await {
                Ok(_) => {}
                Err(e) => debug!("Connection {} failed: {}", addr, e),
            }
            drop(permit);
        });
    }

    info!("Server stopped accepting connections");
}

/// Tell a client over the connection limit to go away
async fn reject(stream: TcpStream, max_message_length: usize) {
    let err = PgWireError::ResourceExhausted("sorry, too many clients already".to_string());
    let mut framed = Framed::new(stream, PgCodec::new(max_message_length));
    if let Some(sql) = err.to_sql_error() {
        if let Err(e) = framed.send(BackendMessage::error(&sql)).await {
            debug!("Could not notify rejected client: {}", e);
        }
    }
}
