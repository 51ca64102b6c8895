//! Connection handling for client connections
//!
//! One [`ClientConnection`] runs per accepted socket. It owns the session
//! state: authentication progress, the transaction tracker, prepared
//! statements and portals, and the engine connection.

use crate::bridge::types::{encode_row, encode_text, field_descriptions, pg_type, TEXT_FORMAT};
use crate::bridge::{Completion, EngineBridge, EngineSession, Portal, ResultStream, StatementOutput};
use crate::config::ServerConfig;
use crate::error::{PgWireError, Result, Severity, SqlError};
use crate::protocol::auth::{AuthHandler, AuthStep, CredentialStore};
use crate::protocol::codec::{Frame, FramingPhase, PgCodec};
use crate::protocol::copy::{self, CopyCommand, CopyDirection, CopyInState, CopySource};
use crate::protocol::message::{
    AuthenticationRequest, BackendMessage, ErrorOrNoticeFields, FrontendMessage,
    TARGET_PORTAL, TARGET_STATEMENT,
};
use crate::protocol::parser::MessageParser;
use crate::protocol::session::SessionRegistry;
use crate::protocol::transaction::{TransactionDirective, TransactionTracker};
use crate::protocol::validator::{ProtocolValidator, Verdict};
use crate::tls::{ClientFramed, Negotiated, TlsNegotiator};
use bytes::Bytes;
use duckdb_pgwire_core::sqlstate;
use duckdb_pgwire_core::{split_statements, SqlStatement, StatementKind, Value};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, trace, warn};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Waiting for the startup packet (and possibly encryption requests)
    AwaitingStartup,

    /// Startup accepted, authentication exchange in progress
    Authenticating,

    /// Idle between queries
    Ready,

    /// Inside an extended-query message sequence, before Sync
    ExtendedQuery,

    /// Receiving COPY FROM STDIN data
    CopyIn,

    /// Closed
    Terminated,
}

/// Connection statistics
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    /// Number of messages received
    pub messages_received: usize,

    /// Number of messages sent
    pub messages_sent: usize,

    /// Number of statements executed
    pub queries_executed: usize,

    /// Number of rows sent to the client
    pub rows_returned: usize,

    /// Number of error responses sent
    pub errors: usize,

    /// Connection start time
    pub start_time: Instant,
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self {
            messages_received: 0,
            messages_sent: 0,
            queries_executed: 0,
            rows_returned: 0,
            errors: 0,
            start_time: Instant::now(),
        }
    }
}

impl fmt::Display for ConnectionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} statements, {} rows, {} errors, {}/{} messages in/out, {:.1}s",
            self.queries_executed,
            self.rows_returned,
            self.errors,
            self.messages_received,
            self.messages_sent,
            self.start_time.elapsed().as_secs_f64()
        )
    }
}

/// Everything a connection shares with the rest of the server
#[derive(Clone)]
pub struct ConnectionContext {
    /// Server configuration
    pub config: Arc<ServerConfig>,

    /// Engine access
    pub bridge: EngineBridge,

    /// Encryption negotiation
    pub tls: TlsNegotiator,

    /// Password lookup
    pub credentials: Arc<dyn CredentialStore>,

    /// Fires when the server shuts down
    pub shutdown: CancellationToken,
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("config", &self.config)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

/// Serve one client from its first byte to the end of the session
pub async fn handle_client<S>(stream: S, addr: SocketAddr, ctx: Arc<ConnectionContext>) -> Result<ConnectionStats>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let codec = PgCodec::new(ctx.config.max_message_length);
    let deadline = ctx
        .config
        .startup_timeout()
        .map(|limit| (tokio::time::Instant::now() + limit, limit));

    // Encryption requests and the TLS handshake count against the startup deadline
    let negotiated = tokio::select! {
        _ = ctx.shutdown.cancelled() => {
            debug!("Dropping {} before startup: server is shutting down", addr);
            return Ok(ConnectionStats::default());
        }
        negotiated = before_deadline(deadline, ctx.tls.negotiate(stream, codec)) => negotiated,
    };
    let (framed, startup) = match negotiated {
        Ok(Negotiated::Startup { framed, message }) => (framed, message),
        Ok(Negotiated::Cancel) => {
            debug!("Cancel request from {}", addr);
            return Ok(ConnectionStats::default());
        }
        Ok(Negotiated::Closed) => {
            debug!("Client {} left before startup", addr);
            return Ok(ConnectionStats::default());
        }
        Err(PgWireError::StartupTimeout(limit)) => {
            debug!("Client {} sent no startup packet within {:?}", addr, limit);
            return Ok(ConnectionStats::default());
        }
        Err(e) => return Err(e),
    };

    let mut connection = ClientConnection::new(framed, addr, ctx, deadline);
    let result = connection.run(startup).await;
    if let Err(e) = &result {
        connection.report_fatal(e).await;
    }
    connection.close().await;

    match result {
        Ok(()) | Err(PgWireError::ConnectionClosed) => Ok(connection.stats),
        Err(e) => Err(e),
    }
}

/// Await `future`, failing with [`PgWireError::StartupTimeout`] past the deadline
async fn before_deadline<T, F>(deadline: Option<(tokio::time::Instant, Duration)>, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match deadline {
        Some((at, limit)) => tokio::time::timeout_at(at, future)
            .await
            .map_err(|_| PgWireError::StartupTimeout(limit))?,
        None => future.await,
    }
}

/// Rows pulled from the engine per round trip when a result is sent whole
const FETCH_BATCH_ROWS: usize = 1024;

/// What the simple query loop should do after a statement
enum Flow {
    Continue,
    CopyIn,
}

/// Client connection
pub struct ClientConnection<S> {
    framed: ClientFramed<S>,
    addr: SocketAddr,
    ctx: Arc<ConnectionContext>,
    state: ConnectionState,
    parser: MessageParser,
    validator: ProtocolValidator,
    transaction: TransactionTracker,
    registry: SessionRegistry,
    engine: Option<EngineSession>,
    user: String,
    copy_in: Option<CopyInState>,
    /// Statements of a simple query that follow a COPY FROM STDIN
    pending: VecDeque<SqlStatement>,
    /// Discard extended-query messages until Sync
    skip_until_sync: bool,
    /// Authentication must finish before this
    startup_deadline: Option<(tokio::time::Instant, Duration)>,
    stats: ConnectionStats,
}

impl<S> ClientConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(
        framed: ClientFramed<S>,
        addr: SocketAddr,
        ctx: Arc<ConnectionContext>,
        startup_deadline: Option<(tokio::time::Instant, Duration)>,
    ) -> Self {
        Self {
            framed,
            addr,
            ctx,
            state: ConnectionState::AwaitingStartup,
            parser: MessageParser::new(),
            validator: ProtocolValidator::new(),
            transaction: TransactionTracker::new(),
            registry: SessionRegistry::new(),
            engine: None,
            user: String::new(),
            copy_in: None,
            pending: VecDeque::new(),
            skip_until_sync: false,
            startup_deadline,
            stats: ConnectionStats::default(),
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    async fn run(&mut self, startup: FrontendMessage) -> Result<()> {
        if !self.startup(startup).await? {
            return Ok(());
        }
        info!("Client {} connected as {}", self.addr, self.user);

        loop {
            let frame = match self.read_frame().await? {
                Some(frame) => frame,
                None => {
                    debug!("Client {} closed the connection", self.addr);
                    return Ok(());
                }
            };
            let message = self.parser.parse_frontend_message(&frame)?;
            self.stats.messages_received += 1;
            trace!("Received {} from {}", message.name(), self.addr);

            match self.validator.validate_message(&message, self.state)? {
                Verdict::Ignore => continue,
                Verdict::AbortCopy => {
                    let err = SqlError::error(
                        sqlstate::PROTOCOL_VIOLATION,
                        format!("unexpected message type {} during COPY from stdin", message.name()),
                    );
                    self.fail_copy(err).await?;
                    continue;
                }
                Verdict::Process => {}
            }

            if !self.dispatch(message).await? {
                return Ok(());
            }
        }
    }

    /// Read the next frame, honouring the startup deadline, the idle timeout
    /// and server shutdown
    async fn read_frame(&mut self) -> Result<Option<Frame>> {
        let limit = match self.state {
            ConnectionState::AwaitingStartup | ConnectionState::Authenticating => self
                .startup_deadline
                .map(|(at, limit)| (at, PgWireError::StartupTimeout(limit))),
            _ => self
                .ctx
                .config
                .idle_timeout()
                .map(|limit| (tokio::time::Instant::now() + limit, PgWireError::IdleTimeout(limit))),
        };
        let shutdown = self.ctx.shutdown.clone();
        let next = async {
            match limit {
                Some((at, expired)) => tokio::time::timeout_at(at, self.framed.next())
                    .await
                    .map_err(|_| expired),
                None => Ok(self.framed.next().await),
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => Err(shutdown_error()),
            next = next => match next? {
                Some(frame) => Ok(Some(frame?)),
                None => Ok(None),
            },
        }
    }

    async fn send(&mut self, message: BackendMessage) -> Result<()> {
        self.stats.messages_sent += 1;
        self.framed.feed(message).await
    }

    async fn flush(&mut self) -> Result<()> {
        SinkExt::<BackendMessage>::flush(&mut self.framed).await
    }

    async fn send_error(&mut self, err: &SqlError) -> Result<()> {
        debug!("Sending error to {}: {}", self.addr, err);
        self.stats.errors += 1;
        self.send(BackendMessage::error(err)).await
    }

    async fn ready_for_query(&mut self) -> Result<()> {
        let status = self.transaction.status();
        self.send(BackendMessage::ReadyForQuery(status)).await?;
        self.flush().await
    }

    /// Send a FATAL error response for `err`, if it gets one
    async fn report_fatal(&mut self, err: &PgWireError) {
        match err {
            PgWireError::ConnectionClosed | PgWireError::Io(_) => {
                debug!("Connection {} ended: {}", self.addr, err)
            }
            other => warn!("Closing connection {}: {}", self.addr, other),
        }
        if let Some(fields) = err.to_error_fields() {
            let message = BackendMessage::ErrorResponse(ErrorOrNoticeFields::new(fields));
            if self.send(message).await.is_ok() {
                let _ = self.flush().await;
            }
        }
    }

    async fn close(&mut self) {
        self.state = ConnectionState::Terminated;
        self.registry.clear();
        if let Some(engine) = self.engine.take() {
            engine.interrupt();
            if let Err(e) = engine.rollback().await {
                debug!("Rollback on close failed: {}", e);
            }
        }
        let _ = SinkExt::<BackendMessage>::close(&mut self.framed).await;
        info!("Connection {} closed: {}", self.addr, self.stats);
    }

    fn engine(&self) -> Result<&EngineSession> {
        self.engine
            .as_ref()
            .ok_or_else(|| PgWireError::ProtocolViolation("session is not authenticated".to_string()))
    }

    /// Handle the startup packet and the authentication exchange
    ///
    /// Returns `false` if the client terminated during authentication.
    async fn startup(&mut self, message: FrontendMessage) -> Result<bool> {
        let (version_major, version_minor, parameters) = match message {
            FrontendMessage::Startup {
                version_major,
                version_minor,
                parameters,
            } => (version_major, version_minor, parameters),
            other => {
                return Err(PgWireError::ProtocolViolation(format!(
                    "expected startup message, got {}",
                    other.name()
                )))
            }
        };

        if version_major != 3 {
            return Err(PgWireError::Query(SqlError::fatal(
                sqlstate::FEATURE_NOT_SUPPORTED,
                format!(
                    "unsupported frontend protocol {}.{}: server supports 3.0 to 3.0",
                    version_major, version_minor
                ),
            )));
        }
        if self.ctx.tls.require_tls() && !self.framed.get_ref().is_tls() {
            return Err(PgWireError::auth(
                sqlstate::INVALID_AUTHORIZATION_SPECIFICATION,
                "connection requires TLS encryption",
            ));
        }
        self.framed.codec_mut().set_phase(FramingPhase::Regular);

        let mut unsupported: Vec<String> = parameters
            .keys()
            .filter(|key| key.starts_with("_pq_."))
            .cloned()
            .collect();
        if version_minor > 0 || !unsupported.is_empty() {
            unsupported.sort();
            self.send(BackendMessage::NegotiateProtocolVersion {
                version_minor: 0,
                options: unsupported,
            })
            .await?;
        }

        self.user = match parameters.get("user") {
            Some(user) if !user.is_empty() => user.clone(),
            _ => {
                return Err(PgWireError::auth(
                    sqlstate::INVALID_AUTHORIZATION_SPECIFICATION,
                    "no PostgreSQL user name specified in startup packet",
                ))
            }
        };
        debug!(
            "Startup from {}: user={} database={:?}",
            self.addr,
            self.user,
            parameters.get("database")
        );

        self.state = ConnectionState::Authenticating;
        if !self.authenticate().await? {
            return Ok(false);
        }

        let engine = self.ctx.bridge.open_session().await?;
        self.engine = Some(engine);

        self.send(BackendMessage::Authentication(AuthenticationRequest::Ok))
            .await?;
        for (name, value) in self.parameter_statuses(&parameters) {
            self.send(BackendMessage::ParameterStatus { name, value }).await?;
        }
        self.state = ConnectionState::Ready;
        self.ready_for_query().await?;
        Ok(true)
    }

    async fn authenticate(&mut self) -> Result<bool> {
        let mut auth = AuthHandler::new(self.ctx.config.auth.method, self.ctx.credentials.clone());
        let mut step = auth.begin(&self.user)?;

        loop {
            match step {
                AuthStep::Accept(last) => {
                    if let Some(request) = last {
                        self.send(BackendMessage::Authentication(request)).await?;
                    }
                    debug!("User {} authenticated with {}", self.user, auth.method());
                    return Ok(true);
                }
                AuthStep::Challenge(request) => {
                    self.send(BackendMessage::Authentication(request)).await?;
                    self.flush().await?;
                }
            }

            let frame = match self.read_frame().await? {
                Some(frame) => frame,
                None => return Err(PgWireError::ConnectionClosed),
            };
            let message = self.parser.parse_frontend_message(&frame)?;
            self.stats.messages_received += 1;
            self.validator.validate_message(&message, self.state)?;

            step = match message {
                FrontendMessage::PasswordMessage(body) => auth.respond(&body)?,
                FrontendMessage::Terminate => return Ok(false),
                other => {
                    return Err(PgWireError::ProtocolViolation(format!(
                        "expected password response, got {}",
                        other.name()
                    )))
                }
            };
        }
    }

    fn parameter_statuses(&self, startup: &HashMap<String, String>) -> Vec<(String, String)> {
        let application_name = startup.get("application_name").cloned().unwrap_or_default();
        vec![
            ("application_name".to_string(), application_name),
            ("client_encoding".to_string(), "UTF8".to_string()),
            ("DateStyle".to_string(), "ISO, MDY".to_string()),
            ("integer_datetimes".to_string(), "on".to_string()),
            ("server_encoding".to_string(), "UTF8".to_string()),
            ("server_version".to_string(), self.ctx.config.server_version.clone()),
            ("standard_conforming_strings".to_string(), "on".to_string()),
            ("TimeZone".to_string(), "UTC".to_string()),
        ]
    }

    /// Handle one validated message; returns `false` when the session ends
    async fn dispatch(&mut self, message: FrontendMessage) -> Result<bool> {
        if self.skip_until_sync && !matches!(message, FrontendMessage::Sync | FrontendMessage::Terminate) {
            trace!("Discarding {} until Sync", message.name());
            return Ok(true);
        }

        match message {
            FrontendMessage::Query(sql) => {
                self.state = ConnectionState::Ready;
                self.simple_query(&sql).await?;
            }
            FrontendMessage::Sync => {
                self.skip_until_sync = false;
                self.registry.clear_unnamed();
                self.state = ConnectionState::Ready;
                self.ready_for_query().await?;
            }
            FrontendMessage::Flush => self.flush().await?,
            FrontendMessage::Terminate => {
                debug!("Client {} sent Terminate", self.addr);
                return Ok(false);
            }
            FrontendMessage::CopyData(data) => {
                if let Err(err) = self.copy_data(&data) {
                    self.fail_copy(err).await?;
                }
            }
            FrontendMessage::CopyDone => self.copy_done().await?,
            FrontendMessage::CopyFail(reason) => {
                let err = SqlError::error(
                    sqlstate::QUERY_CANCELED,
                    format!("COPY from stdin failed: {}", reason),
                );
                self.fail_copy(err).await?;
            }
            FrontendMessage::FunctionCall { function_oid, .. } => {
                let err = SqlError::error(
                    sqlstate::FEATURE_NOT_SUPPORTED,
                    format!("function call protocol is not supported (function {})", function_oid),
                );
                self.send_error(&err).await?;
                self.ready_for_query().await?;
            }
            message => {
                self.state = ConnectionState::ExtendedQuery;
                match self.extended_query(message).await {
                    Ok(()) => {}
                    Err(PgWireError::Query(err)) if err.severity != Severity::Fatal => {
                        self.transaction.statement_failed();
                        self.send_error(&err).await?;
                        self.skip_until_sync = true;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(true)
    }

    async fn simple_query(&mut self, sql: &str) -> Result<()> {
        debug!("Simple query from {}: {}", self.addr, sql);
        self.registry.clear_unnamed();

        let statements = match split_statements(sql) {
            Ok(statements) => statements,
            Err(e) => {
                self.transaction.statement_failed();
                self.send_error(&SqlError::from(e)).await?;
                return self.ready_for_query().await;
            }
        };
        if statements.is_empty() {
            self.send(BackendMessage::EmptyQueryResponse).await?;
            return self.ready_for_query().await;
        }

        self.pending = statements.into();
        self.run_pending().await
    }

    /// Run queued simple-query statements until done, an error, or a COPY FROM STDIN
    async fn run_pending(&mut self) -> Result<()> {
        while let Some(statement) = self.pending.pop_front() {
            match self.simple_statement(&statement).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::CopyIn) => return self.flush().await,
                Err(PgWireError::Query(err)) if err.severity != Severity::Fatal => {
                    self.pending.clear();
                    self.transaction.statement_failed();
                    self.send_error(&err).await?;
                }
                Err(e) => return Err(e),
            }
        }
        self.ready_for_query().await
    }

    async fn simple_statement(&mut self, statement: &SqlStatement) -> Result<Flow> {
        if statement.kind == StatementKind::Copy {
            return self.start_copy(statement).await;
        }
        if statement.param_count > 0 {
            return Err(SqlError::error(
                sqlstate::PROTOCOL_VIOLATION,
                format!("there is no parameter ${}", statement.param_count),
            )
            .into());
        }

        let mut stream = match self.execute_statement(statement, Vec::new()).await? {
            StatementOutput::Complete(tag) => {
                self.send(BackendMessage::CommandComplete(tag)).await?;
                return Ok(Flow::Continue);
            }
            StatementOutput::Rows(stream) => stream,
        };

        if stream.returns_rows() {
            let formats = vec![TEXT_FORMAT; stream.columns().len()];
            self.send(BackendMessage::RowDescription(field_descriptions(stream.columns(), &formats)))
                .await?;
            while !stream.is_done() {
                let rows = self.until_shutdown(stream.next_rows(FETCH_BATCH_ROWS)).await?;
                for row in &rows {
                    let values = encode_row(row, stream.columns(), &formats)?;
                    self.send(BackendMessage::DataRow(values)).await?;
                }
                self.stats.rows_returned += rows.len();
            }
        }
        self.send(BackendMessage::CommandComplete(stream.tag())).await?;
        Ok(Flow::Continue)
    }

    /// Run a statement through the transaction tracker and start it on the engine
    async fn execute_statement(&mut self, statement: &SqlStatement, params: Vec<Value>) -> Result<StatementOutput> {
        let directive = self.transaction.begin_statement(&statement.kind)?;
        self.stats.queries_executed += 1;

        match directive {
            TransactionDirective::Skip { tag, warning } => {
                self.send(BackendMessage::notice(&warning)).await?;
                Ok(StatementOutput::Complete(tag))
            }
            TransactionDirective::RollbackInstead => {
                self.with_shutdown(|engine| async move { engine.rollback().await })
                    .await?;
                self.transaction.rolled_back();
                Ok(StatementOutput::Complete("ROLLBACK".to_string()))
            }
            TransactionDirective::Run => {
                let sql = statement.engine_sql().to_string();
                let cursor = self
                    .with_shutdown(|engine| async move { engine.open(&sql, params).await })
                    .await?;
                self.transaction.statement_succeeded(cursor.in_transaction());
                Ok(StatementOutput::Rows(ResultStream::new(cursor, statement.kind.clone())))
            }
        }
    }

    /// Run an engine call, interrupting it if the server shuts down
    async fn with_shutdown<'a, T, F, Fut>(&'a self, call: F) -> Result<T>
    where
        F: FnOnce(&'a EngineSession) -> Fut,
        Fut: Future<Output = std::result::Result<T, SqlError>> + 'a,
    {
        let engine = self.engine()?;
        self.until_shutdown(call(engine)).await
    }

    /// Await an engine future, interrupting the engine if the server shuts down
    async fn until_shutdown<T, Fut>(&self, future: Fut) -> Result<T>
    where
        Fut: Future<Output = std::result::Result<T, SqlError>>,
    {
        let shutdown = self.ctx.shutdown.clone();
        tokio::select! {
            result = future => Ok(result?),
            _ = shutdown.cancelled() => {
                if let Some(engine) = &self.engine {
                    engine.interrupt();
                }
                Err(shutdown_error())
            }
        }
    }

    async fn extended_query(&mut self, message: FrontendMessage) -> Result<()> {
        match message {
            FrontendMessage::Parse {
                name,
                query,
                param_types,
            } => {
                debug!("Parse {:?} from {}: {}", name, self.addr, query);
                if !name.is_empty() && self.registry.statement(&name).is_ok() {
                    return Err(SqlError::error(
                        sqlstate::DUPLICATE_PREPARED_STATEMENT,
                        format!("prepared statement \"{}\" already exists", name),
                    )
                    .into());
                }
                let prepared = self
                    .with_shutdown(|engine| async move { engine.prepare(&name, &query, &param_types).await })
                    .await?;
                if self.transaction.is_failed() {
                    if let Some(statement) = &prepared.statement {
                        self.transaction.begin_statement(&statement.kind)?;
                    }
                }
                self.registry.add_statement(prepared)?;
                self.send(BackendMessage::ParseComplete).await
            }
            FrontendMessage::Bind {
                portal,
                statement,
                param_formats,
                param_values,
                result_formats,
            } => {
                let prepared = self.registry.statement(&statement)?;
                let bound = self.engine()?.bind(
                    &portal,
                    prepared,
                    &param_formats,
                    &param_values,
                    &result_formats,
                )?;
                if portal.is_empty() {
                    self.registry.clear_unnamed_portal();
                }
                self.registry.add_portal(bound)?;
                self.send(BackendMessage::BindComplete).await
            }
            FrontendMessage::Describe { object_type, name } => self.describe(object_type, &name).await,
            FrontendMessage::Execute { portal, max_rows } => {
                let mut bound = self.registry.take_portal(&portal)?;
                let result = self.execute_portal(&mut bound, max_rows).await;
                self.registry.restore_portal(bound);
                result
            }
            FrontendMessage::Close { object_type, name } => {
                match object_type {
                    TARGET_STATEMENT => self.registry.close_statement(&name),
                    TARGET_PORTAL => self.registry.close_portal(&name),
                    other => return Err(invalid_target(other)),
                }
                self.send(BackendMessage::CloseComplete).await
            }
            other => Err(PgWireError::ProtocolViolation(format!(
                "unexpected {} in extended query",
                other.name()
            ))),
        }
    }

    async fn describe(&mut self, object_type: u8, name: &str) -> Result<()> {
        let fields = match object_type {
            TARGET_STATEMENT => {
                let statement = self.registry.statement(name)?;
                self.send(BackendMessage::ParameterDescription(statement.param_types.clone()))
                    .await?;
                statement.row_description(&statement.text_formats())
            }
            TARGET_PORTAL => self.registry.portal(name)?.row_description(),
            other => return Err(invalid_target(other)),
        };
        match fields {
            Some(fields) => self.send(BackendMessage::RowDescription(fields)).await,
            None => self.send(BackendMessage::NoData).await,
        }
    }

    async fn execute_portal(&mut self, portal: &mut Portal, max_rows: i32) -> Result<()> {
        let statement = match &portal.statement.statement {
            Some(statement) => statement.clone(),
            None => return self.send(BackendMessage::EmptyQueryResponse).await,
        };

        if !portal.is_started() {
            debug!("Execute portal {:?} from {}", portal.name, self.addr);
            let output = self.execute_statement(&statement, portal.params.clone()).await?;
            portal.start(output);
        }

        let (rows, completion) = self.until_shutdown(portal.fetch(max_rows)).await?;
        for row in &rows {
            let values = encode_row(row, &portal.statement.columns, &portal.result_formats)?;
            self.send(BackendMessage::DataRow(values)).await?;
        }
        self.stats.rows_returned += rows.len();

        match completion {
            Completion::Completed(tag) => self.send(BackendMessage::CommandComplete(tag)).await,
            Completion::Suspended => self.send(BackendMessage::PortalSuspended).await,
        }
    }

    async fn start_copy(&mut self, statement: &SqlStatement) -> Result<Flow> {
        let command = CopyCommand::parse(&statement.sql)?;
        self.transaction.begin_statement(&statement.kind)?;
        self.stats.queries_executed += 1;

        match (command.direction.clone(), command.source.clone()) {
            (CopyDirection::ToStdout, _) => {
                let sql = command.select_sql();
                let mut cursor = self
                    .with_shutdown(|engine| async move { engine.open(&sql, Vec::new()).await })
                    .await?;
                self.transaction.statement_succeeded(cursor.in_transaction());

                let types: Vec<_> = cursor.columns().iter().map(|c| pg_type(c.logical_type)).collect();
                self.send(BackendMessage::CopyOutResponse {
                    format: 0,
                    column_formats: vec![TEXT_FORMAT; types.len()],
                })
                .await?;
                let mut copied = 0;
                while !cursor.is_done() {
                    let rows = self.until_shutdown(cursor.fetch(FETCH_BATCH_ROWS)).await?;
                    for row in &rows {
                        let values: Vec<Option<String>> = row
                            .iter()
                            .zip(types.iter())
                            .map(|(value, ty)| (!value.is_null()).then(|| encode_text(value, ty)))
                            .collect();
                        let line = copy::encode_row(&values);
                        self.send(BackendMessage::CopyData(Bytes::from(line))).await?;
                    }
                    copied += rows.len();
                }
                self.send(BackendMessage::CopyDone).await?;
                self.send(BackendMessage::CommandComplete(format!("COPY {}", copied)))
                    .await?;
                self.stats.rows_returned += copied;
                Ok(Flow::Continue)
            }
            (CopyDirection::FromStdin, CopySource::Table { table, columns }) => {
                let shape = command.select_sql();
                let description = self
                    .with_shutdown(|engine| async move { engine.describe(&shape).await })
                    .await?;
                self.send(BackendMessage::CopyInResponse {
                    format: 0,
                    column_formats: vec![TEXT_FORMAT; description.columns.len()],
                })
                .await?;
                debug!("COPY FROM STDIN into {} started for {}", table, self.addr);
                self.copy_in = Some(CopyInState::new(table, columns));
                self.state = ConnectionState::CopyIn;
                Ok(Flow::CopyIn)
            }
            (CopyDirection::FromStdin, CopySource::Query(_)) => Err(SqlError::error(
                sqlstate::SYNTAX_ERROR,
                "COPY FROM STDIN requires a table name",
            )
            .into()),
        }
    }

    fn copy_data(&mut self, data: &[u8]) -> std::result::Result<(), SqlError> {
        match self.copy_in.as_mut() {
            Some(state) => state.push(data),
            None => Ok(()),
        }
    }

    async fn copy_done(&mut self) -> Result<()> {
        let state = match self.copy_in.take() {
            Some(state) => state,
            None => return Ok(()),
        };
        self.state = ConnectionState::Ready;

        let table = state.table.clone();
        let columns = state.columns.clone();
        let inserted = match state.finish() {
            Ok(rows) => {
                self.with_shutdown(|engine| async move { engine.insert_rows(&table, columns, rows).await })
                    .await
            }
            Err(e) => Err(e.into()),
        };

        match inserted {
            Ok(count) => {
                let in_transaction = self
                    .with_shutdown(|engine| async move { engine.in_transaction().await })
                    .await?;
                self.transaction.statement_succeeded(in_transaction);
                self.send(BackendMessage::CommandComplete(format!("COPY {}", count)))
                    .await?;
                self.run_pending().await
            }
            Err(PgWireError::Query(err)) if err.severity != Severity::Fatal => {
                self.pending.clear();
                self.transaction.statement_failed();
                self.send_error(&err).await?;
                self.ready_for_query().await
            }
            Err(e) => Err(e),
        }
    }

    /// Abandon COPY FROM STDIN with `err`; later copy messages are ignored
    async fn fail_copy(&mut self, err: SqlError) -> Result<()> {
        self.copy_in = None;
        self.pending.clear();
        self.state = ConnectionState::Ready;
        self.transaction.statement_failed();
        self.send_error(&err).await?;
        self.ready_for_query().await
    }
}

fn invalid_target(object_type: u8) -> PgWireError {
    PgWireError::ProtocolViolation(format!(
        "invalid DESCRIBE/CLOSE target type {}",
        char::from(object_type)
    ))
}

fn shutdown_error() -> PgWireError {
    PgWireError::Query(SqlError::fatal(
        sqlstate::ADMIN_SHUTDOWN,
        "terminating connection due to administrator command",
    ))
}
