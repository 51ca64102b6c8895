//! Engine bridge
//!
//! Adapts wire-level requests into calls on the embedded engine. Every
//! session owns one engine connection on its own worker thread, so the
//! connection task never stalls the runtime. Query results come back through
//! a [`Cursor`] that steps rows out of the engine as they are fetched.

pub mod types;
mod worker;

use crate::error::SqlError;
use crate::protocol::message::FieldDescription;
use duckdb_pgwire_core::engine::StatementDescription;
use duckdb_pgwire_core::sqlstate;
use duckdb_pgwire_core::{
    split_statements, tag_rows, Column, Connection, Database, EngineError, InterruptHandle, QueryResult,
    SqlStatement, StatementKind, Value,
};
use log::{debug, warn};
use postgres_types::Oid;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use tokio::sync::oneshot;
use types::{decode_parameter, field_descriptions, parameter_type, resolve_formats, TEXT_FORMAT};
use worker::{Batch, Opened, Request};

/// Shared handle to the engine
#[derive(Debug, Clone)]
pub struct EngineBridge {
    database: Arc<Database>,
    sessions: Arc<AtomicU64>,
}

impl EngineBridge {
    /// Create a bridge over a database
    pub fn new(database: Arc<Database>) -> Self {
        Self {
            database,
            sessions: Arc::new(AtomicU64::new(1)),
        }
    }

    /// The database behind this bridge
    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    /// Open an engine connection for a new session
    pub async fn open_session(&self) -> Result<EngineSession, SqlError> {
        let session = self.sessions.fetch_add(1, Ordering::Relaxed);
        let (requests, interrupt) = worker::spawn(self.database.clone(), session).await?;
        Ok(EngineSession {
            requests,
            interrupt,
            cursors: AtomicU64::new(1),
        })
    }
}

fn worker_gone() -> EngineError {
    EngineError::Internal("engine worker stopped".to_string())
}

/// A session's engine connection
///
/// Dropping the session interrupts whatever statement is still running on
/// its behalf; the worker thread exits once the last cursor is gone.
pub struct EngineSession {
    requests: mpsc::Sender<Request>,
    interrupt: InterruptHandle,
    cursors: AtomicU64,
}

impl std::fmt::Debug for EngineSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineSession").finish_non_exhaustive()
    }
}

impl Drop for EngineSession {
    fn drop(&mut self) {
        self.interrupt.interrupt();
    }
}

impl EngineSession {
    async fn run<T, F>(&self, f: F) -> Result<T, SqlError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> duckdb_pgwire_core::Result<T> + Send + 'static,
    {
        let (reply, result) = oneshot::channel();
        self.requests
            .send(Request::Run(Box::new(move |conn| {
                let _ = reply.send(f(conn));
            })))
            .map_err(|_| worker_gone())?;
        Ok(result.await.map_err(|_| worker_gone())??)
    }

    /// Abort the statement currently running, if any
    pub fn interrupt(&self) {
        self.interrupt.interrupt();
    }

    /// Describe a statement without running it
    pub async fn describe(&self, sql: &str) -> Result<StatementDescription, SqlError> {
        let sql = sql.to_string();
        self.run(move |conn| conn.describe(&sql)).await
    }

    /// Run a statement and materialise its result
    pub async fn execute(&self, sql: &str, params: Vec<Value>) -> Result<QueryResult, SqlError> {
        let sql = sql.to_string();
        self.run(move |conn| conn.execute(&sql, &params)).await
    }

    /// Start a statement whose rows are fetched through the returned cursor
    pub async fn open(&self, sql: &str, params: Vec<Value>) -> Result<Cursor, SqlError> {
        let id = self.cursors.fetch_add(1, Ordering::Relaxed);
        let (reply, opened) = oneshot::channel();
        self.requests
            .send(Request::Open {
                cursor: id,
                sql: sql.to_string(),
                params,
                reply,
            })
            .map_err(|_| worker_gone())?;

        // Closes the query on the worker if this call is abandoned
        let mut cursor = Cursor {
            id,
            requests: self.requests.clone(),
            columns: Vec::new(),
            rows_affected: 0,
            in_transaction: false,
            done: false,
        };
        let opened: Opened = match opened.await {
            Ok(Ok(opened)) => opened,
            Ok(Err(err)) => {
                cursor.done = true;
                return Err(err.into());
            }
            Err(_) => {
                cursor.done = true;
                return Err(worker_gone().into());
            }
        };
        cursor.columns = opened.columns;
        cursor.rows_affected = opened.rows_affected;
        cursor.in_transaction = opened.in_transaction;
        cursor.done = opened.done;
        Ok(cursor)
    }

    /// Insert rows received through COPY FROM STDIN
    pub async fn insert_rows(
        &self,
        table: &str,
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    ) -> Result<usize, SqlError> {
        let table = table.to_string();
        self.run(move |conn| conn.insert_rows(&table, &columns, &rows)).await
    }

    /// Roll back an open transaction block; returns whether one was open
    pub async fn rollback(&self) -> Result<bool, SqlError> {
        self.run(|conn| {
            if conn.in_transaction() {
                conn.execute("ROLLBACK", &[])?;
                Ok(true)
            } else {
                Ok(false)
            }
        })
        .await
    }

    /// Whether the engine connection is inside a transaction block
    pub async fn in_transaction(&self) -> Result<bool, SqlError> {
        self.run(|conn| Ok(conn.in_transaction())).await
    }

    /// Prepare a statement for the extended query protocol
    ///
    /// An empty query string yields an empty statement; more than one
    /// statement is refused.
    pub async fn prepare(
        &self,
        name: &str,
        query: &str,
        declared_types: &[Oid],
    ) -> Result<PreparedStatement, SqlError> {
        let mut statements = split_statements(query)?;
        if statements.len() > 1 {
            return Err(SqlError::error(
                sqlstate::SYNTAX_ERROR,
                "cannot insert multiple commands into a prepared statement",
            ));
        }
        let statement = statements.pop();

        let (columns, param_count) = match &statement {
            None => (Vec::new(), 0),
            Some(statement) if statement.kind == StatementKind::Copy => {
                return Err(SqlError::error(
                    sqlstate::FEATURE_NOT_SUPPORTED,
                    "COPY is not supported in the extended query protocol",
                ))
            }
            Some(statement) if statement.kind.is_transaction_control() => {
                (Vec::new(), statement.param_count)
            }
            Some(statement) => {
                let description = self.describe(statement.engine_sql()).await?;
                (description.columns, description.param_count)
            }
        };

        if declared_types.len() > param_count {
            return Err(SqlError::error(
                sqlstate::PROTOCOL_VIOLATION,
                format!(
                    "statement declares {} parameter types but uses {} parameters",
                    declared_types.len(),
                    param_count
                ),
            ));
        }

        let param_types = (0..param_count)
            .map(|i| parameter_type(declared_types.get(i).copied().unwrap_or_default()).oid())
            .collect();

        debug!(
            "Prepared statement {:?}: {} parameters, {} columns",
            name,
            param_count,
            columns.len()
        );
        Ok(PreparedStatement {
            name: name.to_string(),
            statement,
            param_types,
            columns,
        })
    }

    /// Bind parameters to a prepared statement, producing a portal
    pub fn bind(
        &self,
        portal: &str,
        statement: Arc<PreparedStatement>,
        param_formats: &[i16],
        param_values: &[Option<bytes::Bytes>],
        result_formats: &[i16],
    ) -> Result<Portal, SqlError> {
        let expected = statement.param_types.len();
        if param_values.len() != expected {
            return Err(SqlError::error(
                sqlstate::PROTOCOL_VIOLATION,
                format!(
                    "bind message supplies {} parameters, but prepared statement \"{}\" requires {}",
                    param_values.len(),
                    statement.name,
                    expected
                ),
            ));
        }

        let param_formats = resolve_formats(param_formats, expected, "parameter")?;
        let result_formats = resolve_formats(result_formats, statement.columns.len(), "result")?;

        let params = param_values
            .iter()
            .zip(statement.param_types.iter().zip(param_formats.iter()))
            .map(|(raw, (oid, format))| decode_parameter(raw.as_deref(), *oid, *format))
            .collect::<Result<Vec<Value>, SqlError>>()?;

        Ok(Portal::new(portal, statement, params, result_formats))
    }
}

/// A statement registered by Parse
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    /// Statement name (empty for the unnamed statement)
    pub name: String,

    /// The statement, or `None` for an empty query string
    pub statement: Option<SqlStatement>,

    /// Parameter type OIDs
    pub param_types: Vec<Oid>,

    /// Result columns, empty when the statement returns no rows
    pub columns: Vec<Column>,
}

impl PreparedStatement {
    /// RowDescription fields, or `None` when the statement returns no rows
    pub fn row_description(&self, formats: &[i16]) -> Option<Vec<FieldDescription>> {
        if self.columns.is_empty() {
            None
        } else {
            Some(field_descriptions(&self.columns, formats))
        }
    }

    /// Text format codes for every column
    pub fn text_formats(&self) -> Vec<i16> {
        vec![TEXT_FORMAT; self.columns.len()]
    }
}

/// How an Execute ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// All rows were sent; carries the command tag
    Completed(String),

    /// The row limit was reached and the portal stays open
    Suspended,
}

/// An open query on the engine thread
///
/// Dropping a cursor that has not reached its end discards the rest of its
/// rows.
pub struct Cursor {
    id: u64,
    requests: mpsc::Sender<Request>,
    columns: Vec<Column>,
    rows_affected: usize,
    in_transaction: bool,
    done: bool,
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("id", &self.id)
            .field("columns", &self.columns.len())
            .field("done", &self.done)
            .finish()
    }
}

impl Cursor {
    /// Result columns (empty for statements that return no rows)
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Rows inserted, updated or deleted
    pub fn rows_affected(&self) -> usize {
        self.rows_affected
    }

    /// Whether the connection was inside a transaction block after the statement started
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Whether every row has been fetched
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Fetch up to `limit` rows (0 means all that remain)
    pub async fn fetch(&mut self, limit: usize) -> Result<Vec<Vec<Value>>, SqlError> {
        if self.done {
            return Ok(Vec::new());
        }
        let (reply, batch) = oneshot::channel();
        self.requests
            .send(Request::Fetch {
                cursor: self.id,
                limit,
                reply,
            })
            .map_err(|_| worker_gone())?;

        match batch.await {
            Ok(Ok(Batch { rows, done })) => {
                self.done = done;
                Ok(rows)
            }
            Ok(Err(err)) => {
                self.done = true;
                Err(err.into())
            }
            Err(_) => {
                self.done = true;
                Err(worker_gone().into())
            }
        }
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.requests.send(Request::Close { cursor: self.id });
        }
    }
}

/// Output of one statement, counted as it is sent
#[derive(Debug)]
pub struct ResultStream {
    cursor: Cursor,
    kind: StatementKind,
    rows_sent: usize,
}

impl ResultStream {
    /// Wrap a cursor running a statement of `kind`
    pub fn new(cursor: Cursor, kind: StatementKind) -> Self {
        Self {
            cursor,
            kind,
            rows_sent: 0,
        }
    }

    /// Result columns
    pub fn columns(&self) -> &[Column] {
        self.cursor.columns()
    }

    /// Whether the statement produced a result set
    pub fn returns_rows(&self) -> bool {
        !self.cursor.columns().is_empty()
    }

    /// Whether every row has been fetched
    pub fn is_done(&self) -> bool {
        self.cursor.is_done()
    }

    /// Fetch the next rows (0 means all that remain)
    pub async fn next_rows(&mut self, limit: usize) -> Result<Vec<Vec<Value>>, SqlError> {
        let rows = self.cursor.fetch(limit).await?;
        self.rows_sent += rows.len();
        Ok(rows)
    }

    /// Command tag for the rows sent so far
    pub fn tag(&self) -> String {
        self.tag_with(self.rows_sent)
    }

    /// Command tag reporting `rows_returned` rows, as a portal's last Execute does
    pub fn tag_with(&self, rows_returned: usize) -> String {
        let rows = tag_rows(
            &self.kind,
            self.returns_rows(),
            rows_returned,
            self.cursor.rows_affected(),
        );
        self.kind.command_tag(rows)
    }
}

/// What running a statement produced
#[derive(Debug)]
pub enum StatementOutput {
    /// Answered without engine rows; carries the command tag
    Complete(String),

    /// Rows to fetch from the engine
    Rows(ResultStream),
}

#[derive(Debug)]
enum PortalState {
    Unstarted,
    Answered(String),
    Running(ResultStream),
    Finished,
}

/// A bound statement ready to execute
#[derive(Debug)]
pub struct Portal {
    /// Portal name (empty for the unnamed portal)
    pub name: String,

    /// Source statement
    pub statement: Arc<PreparedStatement>,

    /// Decoded parameter values
    pub params: Vec<Value>,

    /// Format code per result column
    pub result_formats: Vec<i16>,

    state: PortalState,
}

impl Portal {
    fn new(name: &str, statement: Arc<PreparedStatement>, params: Vec<Value>, result_formats: Vec<i16>) -> Self {
        Self {
            name: name.to_string(),
            statement,
            params,
            result_formats,
            state: PortalState::Unstarted,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_test(name: &str, statement: Arc<PreparedStatement>) -> Self {
        Self::new(name, statement, Vec::new(), Vec::new())
    }

    /// Whether the statement already ran
    pub fn is_started(&self) -> bool {
        !matches!(self.state, PortalState::Unstarted)
    }

    /// RowDescription fields using the bound result formats
    pub fn row_description(&self) -> Option<Vec<FieldDescription>> {
        self.statement.row_description(&self.result_formats)
    }

    /// Attach the output of running the portal's statement
    pub fn start(&mut self, output: StatementOutput) {
        self.state = match output {
            StatementOutput::Complete(tag) => PortalState::Answered(tag),
            StatementOutput::Rows(stream) => PortalState::Running(stream),
        };
    }

    /// Fetch up to `max_rows` rows (0 or less means all of them)
    ///
    /// Hitting the limit suspends the portal even when nothing is left; the
    /// following Execute then completes with no rows. The command tag counts
    /// the rows of the completing Execute only, so once the portal has
    /// completed, further Executes report a count of zero.
    pub async fn fetch(&mut self, max_rows: i32) -> Result<(Vec<Vec<Value>>, Completion), SqlError> {
        let limit = usize::try_from(max_rows).unwrap_or(0);
        match std::mem::replace(&mut self.state, PortalState::Finished) {
            PortalState::Running(mut stream) => {
                let rows = stream.next_rows(limit).await?;
                if stream.is_done() {
                    let tag = stream.tag_with(rows.len());
                    Ok((rows, Completion::Completed(tag)))
                } else {
                    self.state = PortalState::Running(stream);
                    Ok((rows, Completion::Suspended))
                }
            }
            PortalState::Answered(tag) => Ok((Vec::new(), Completion::Completed(tag))),
            PortalState::Finished => Ok((Vec::new(), Completion::Completed(self.exhausted_tag()))),
            PortalState::Unstarted => {
                warn!("Fetch from portal {:?} before it ran", self.name);
                self.state = PortalState::Unstarted;
                Ok((Vec::new(), Completion::Completed(String::new())))
            }
        }
    }

    fn exhausted_tag(&self) -> String {
        self.statement
            .statement
            .as_ref()
            .map(|statement| statement.kind.command_tag(0))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duckdb_pgwire_core::FunctionRegistry;
    use postgres_types::Type;

    async fn session() -> EngineSession {
        let database = Database::open_in_memory(FunctionRegistry::with_pgwire_extension()).unwrap();
        EngineBridge::new(Arc::new(database)).open_session().await.unwrap()
    }

    #[tokio::test]
    async fn test_prepare_reports_columns_and_parameters() {
        let session = session().await;
        let statement = session
            .prepare("s1", "SELECT duckdb_pgwire($1) AS greeting", &[])
            .await
            .unwrap();
        assert_eq!(statement.param_types, vec![Type::TEXT.oid()]);
        let fields = statement.row_description(&statement.text_formats()).unwrap();
        assert_eq!(fields[0].name, "greeting");
        assert_eq!(fields[0].data_type_oid, Type::TEXT.oid());
    }

    #[tokio::test]
    async fn test_prepare_refuses_multiple_statements() {
        let session = session().await;
        let err = session.prepare("", "SELECT 1; SELECT 2", &[]).await.unwrap_err();
        assert_eq!(err.code, sqlstate::SYNTAX_ERROR);
    }

    #[tokio::test]
    async fn test_empty_prepare() {
        let session = session().await;
        let statement = session.prepare("", "  ", &[]).await.unwrap();
        assert!(statement.statement.is_none());
        assert!(statement.row_description(&[]).is_none());
    }

    #[tokio::test]
    async fn test_bind_checks_parameter_count() {
        let session = session().await;
        let statement = Arc::new(session.prepare("s1", "SELECT $1", &[]).await.unwrap());
        let err = session.bind("", statement, &[], &[], &[]).unwrap_err();
        assert_eq!(err.code, sqlstate::PROTOCOL_VIOLATION);
    }

    async fn start_portal(session: &EngineSession, sql: &str) -> Portal {
        let statement = Arc::new(session.prepare("", sql, &[]).await.unwrap());
        let mut portal = session.bind("p", statement.clone(), &[], &[], &[]).unwrap();
        let sql_statement = statement.statement.clone().unwrap();
        let cursor = session
            .open(sql_statement.engine_sql(), portal.params.clone())
            .await
            .unwrap();
        portal.start(StatementOutput::Rows(ResultStream::new(cursor, sql_statement.kind)));
        portal
    }

    #[tokio::test]
    async fn test_portal_suspends_at_row_limit() {
        let session = session().await;
        let mut portal = start_portal(&session, "SELECT 1 UNION ALL SELECT 2 UNION ALL SELECT 3").await;

        let (rows, completion) = portal.fetch(2).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(completion, Completion::Suspended);

        let (rows, completion) = portal.fetch(2).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(completion, Completion::Completed("SELECT 1".to_string()));
    }

    #[tokio::test]
    async fn test_exhausted_portal_reports_zero_rows() {
        let session = session().await;
        let mut portal = start_portal(&session, "SELECT 1 UNION ALL SELECT 2").await;

        let (rows, completion) = portal.fetch(0).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(completion, Completion::Completed("SELECT 2".to_string()));

        let (rows, completion) = portal.fetch(0).await.unwrap();
        assert!(rows.is_empty());
        assert_eq!(completion, Completion::Completed("SELECT 0".to_string()));
    }

    #[tokio::test]
    async fn test_cursor_only_steps_requested_rows() {
        let session = session().await;
        session
            .execute(
                "CREATE TABLE big AS WITH RECURSIVE n(i) AS \
                 (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < 1000) SELECT i FROM n",
                vec![],
            )
            .await
            .unwrap();

        let mut cursor = session.open("SELECT i FROM big ORDER BY i", vec![]).await.unwrap();
        let first = cursor.fetch(1).await.unwrap();
        assert_eq!(first, vec![vec![Value::Integer(1)]]);
        assert!(!cursor.is_done());

        // Other requests are served while the cursor is open
        let count = session.execute("SELECT count(*) FROM big", vec![]).await.unwrap();
        assert_eq!(count.rows[0][0], Value::Integer(1000));

        let next = cursor.fetch(2).await.unwrap();
        assert_eq!(next, vec![vec![Value::Integer(2)], vec![Value::Integer(3)]]);
    }

    #[tokio::test]
    async fn test_second_cursor_parks_the_first() {
        let session = session().await;
        let mut first = session
            .open("SELECT 1 UNION ALL SELECT 2 UNION ALL SELECT 3", vec![])
            .await
            .unwrap();
        assert_eq!(first.fetch(1).await.unwrap().len(), 1);

        let mut second = session.open("SELECT 'b'", vec![]).await.unwrap();
        assert_eq!(second.fetch(0).await.unwrap(), vec![vec![Value::from("b")]]);
        assert!(second.is_done());

        assert_eq!(first.fetch(1).await.unwrap(), vec![vec![Value::Integer(2)]]);
        assert_eq!(first.fetch(0).await.unwrap(), vec![vec![Value::Integer(3)]]);
        assert!(first.is_done());
    }

    #[tokio::test]
    async fn test_dropped_cursor_frees_the_worker() {
        let session = session().await;
        let mut cursor = session
            .open("SELECT 1 UNION ALL SELECT 2", vec![])
            .await
            .unwrap();
        cursor.fetch(1).await.unwrap();
        drop(cursor);

        let result = session.execute("SELECT 42", vec![]).await.unwrap();
        assert_eq!(result.rows, vec![vec![Value::Integer(42)]]);
    }

    #[tokio::test]
    async fn test_open_error_is_reported() {
        let session = session().await;
        let err = session.open("SELECT * FROM missing_table", vec![]).await.unwrap_err();
        assert_eq!(err.code, sqlstate::UNDEFINED_TABLE);
        assert!(!session.in_transaction().await.unwrap());
    }

    #[tokio::test]
    async fn test_rollback_only_when_in_transaction() {
        let session = session().await;
        assert!(!session.rollback().await.unwrap());
        session.execute("BEGIN", vec![]).await.unwrap();
        assert!(session.in_transaction().await.unwrap());
        assert!(session.rollback().await.unwrap());
        assert!(!session.in_transaction().await.unwrap());
    }

    #[tokio::test]
    async fn test_engine_errors_become_sql_errors() {
        let session = session().await;
        let err = session.execute("SELECT * FROM missing_table", vec![]).await.unwrap_err();
        assert_eq!(err.code, sqlstate::UNDEFINED_TABLE);
    }
}
