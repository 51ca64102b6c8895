//! Embedded SQL engine
//!
//! A [`Database`] owns the storage and the function registry. Each client
//! session gets its own [`Connection`]; connections share the same data but
//! keep their own transaction state and statement cache.

use crate::error::{EngineError, Result};
use crate::extension::FunctionRegistry;
use crate::sql::StatementKind;
use crate::types::{Column, Value};
use log::{debug, info};
use rusqlite::{params_from_iter, InterruptHandle, OpenFlags};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// Path that selects a private in-memory database
pub const IN_MEMORY: &str = ":memory:";

/// How long a connection waits on a locked database file
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Statement cache size per connection
const STATEMENT_CACHE_CAPACITY: usize = 64;

/// Shape of a prepared statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementDescription {
    /// Result columns (empty for statements that return no rows)
    pub columns: Vec<Column>,

    /// Number of parameters the statement expects
    pub param_count: usize,
}

/// Result of executing one statement
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    /// Result columns (empty for statements that return no rows)
    pub columns: Vec<Column>,

    /// Materialised rows
    pub rows: Vec<Vec<Value>>,

    /// Rows inserted, updated or deleted
    pub rows_affected: usize,

    /// Whether the connection is inside a transaction block afterwards
    pub in_transaction: bool,
}

impl QueryResult {
    /// Whether the statement produced a result set
    pub fn returns_rows(&self) -> bool {
        !self.columns.is_empty()
    }

    /// Row count to report in the command tag
    pub fn tag_rows(&self, kind: &StatementKind) -> usize {
        tag_rows(kind, self.returns_rows(), self.rows.len(), self.rows_affected)
    }
}

/// Row count for a command tag, given the rows returned and the rows changed
///
/// Statements with a result set and no changed rows (SELECT, or a write
/// with RETURNING under an engine that does not count it) report the rows
/// returned.
pub fn tag_rows(kind: &StatementKind, returns_rows: bool, rows_returned: usize, rows_affected: usize) -> usize {
    match kind {
        StatementKind::Select => rows_returned,
        _ if returns_rows && rows_affected == 0 => rows_returned,
        _ => rows_affected,
    }
}

/// Rows of a running statement, stepped on demand
///
/// Created by [`Connection::stream`]. Statements without a result set have
/// already run to completion when the stream is handed out.
pub struct RowStream<'stmt> {
    columns: Vec<Column>,
    rows: Option<rusqlite::Rows<'stmt>>,
    rows_affected: usize,
    exhausted: bool,
}

impl std::fmt::Debug for RowStream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowStream")
            .field("columns", &self.columns)
            .field("rows_affected", &self.rows_affected)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

impl RowStream<'_> {
    /// Result columns (empty for statements that return no rows)
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Rows inserted, updated or deleted
    pub fn rows_affected(&self) -> usize {
        self.rows_affected
    }

    /// Whether the engine reported the end of the rows
    ///
    /// A batch that ends exactly at its limit does not look ahead, so the
    /// stream only notices the end on the following call.
    pub fn is_done(&self) -> bool {
        self.exhausted
    }

    /// Step up to `limit` rows out of the engine (0 means all that remain)
    pub fn next_batch(&mut self, limit: usize) -> Result<Vec<Vec<Value>>> {
        let mut batch = Vec::new();
        let width = self.columns.len();
        let rows = match self.rows.as_mut() {
            Some(rows) if !self.exhausted => rows,
            _ => return Ok(batch),
        };

        while limit == 0 || batch.len() < limit {
            let row = match rows.next() {
                Ok(Some(row)) => row,
                Ok(None) => {
                    self.exhausted = true;
                    break;
                }
                Err(e) => {
                    self.exhausted = true;
                    return Err(e.into());
                }
            };
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(Value::from(row.get_ref(i)?));
            }
            batch.push(values);
        }
        Ok(batch)
    }
}

/// A database shared by all sessions
pub struct Database {
    /// Location passed to the engine
    uri: String,

    /// Functions installed on every connection
    functions: FunctionRegistry,

    /// Keeps a shared in-memory database alive while sessions come and go
    _anchor: Mutex<rusqlite::Connection>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("uri", &self.uri)
            .field("functions", &self.functions)
            .finish()
    }
}

impl Database {
    /// Open a database at `path`
    ///
    /// `:memory:` opens a fresh in-memory database that all connections from
    /// this `Database` share.
    pub fn open(path: &str, functions: FunctionRegistry) -> Result<Self> {
        let uri = if path == IN_MEMORY {
            format!("file:duckpg-{}?mode=memory&cache=shared", Uuid::new_v4().simple())
        } else {
            path.to_string()
        };

        let anchor = open_connection(&uri)?;
        info!(
            "Opened database {} with {} extension functions",
            if path == IN_MEMORY { IN_MEMORY } else { path },
            functions.len()
        );

        Ok(Self {
            uri,
            functions,
            _anchor: Mutex::new(anchor),
        })
    }

    /// Open a private in-memory database
    pub fn open_in_memory(functions: FunctionRegistry) -> Result<Self> {
        Self::open(IN_MEMORY, functions)
    }

    /// Create a new connection for a session
    pub fn connect(&self) -> Result<Connection> {
        let conn = open_connection(&self.uri)?;
        self.functions.install(&conn)?;
        Ok(Connection { conn })
    }

    /// Registered extension functions
    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }
}

fn open_connection(uri: &str) -> Result<rusqlite::Connection> {
    let conn = rusqlite::Connection::open_with_flags(uri, OpenFlags::default())?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);
    Ok(conn)
}

/// A session's connection to the database
pub struct Connection {
    conn: rusqlite::Connection,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("autocommit", &self.conn.is_autocommit())
            .finish()
    }
}

impl Connection {
    /// Describe a statement without running it
    pub fn describe(&self, sql: &str) -> Result<StatementDescription> {
        let stmt = self.conn.prepare_cached(sql)?;
        Ok(StatementDescription {
            columns: columns_of(&stmt),
            param_count: stmt.parameter_count(),
        })
    }

    /// Run a statement with positional parameters and materialise its result
    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let result = self.stream(sql, params, |stream| -> Result<QueryResult> {
            let rows = stream.next_batch(0)?;
            Ok(QueryResult {
                columns: stream.columns().to_vec(),
                rows,
                rows_affected: stream.rows_affected(),
                in_transaction: self.in_transaction(),
            })
        })??;

        debug!(
            "Executed statement: {} rows, {} affected",
            result.rows.len(),
            result.rows_affected
        );
        Ok(result)
    }

    /// Start a statement and hand its rows to `consume` as a [`RowStream`]
    ///
    /// The statement stays open for as long as `consume` runs, so rows are
    /// only stepped out of the engine when asked for. Statements without a
    /// result set run to completion before `consume` is called.
    pub fn stream<R>(&self, sql: &str, params: &[Value], consume: impl FnOnce(&mut RowStream<'_>) -> R) -> Result<R> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        if stmt.parameter_count() != params.len() {
            return Err(EngineError::Sqlite(rusqlite::Error::InvalidParameterCount(
                params.len(),
                stmt.parameter_count(),
            )));
        }

        let columns = columns_of(&stmt);
        if columns.is_empty() {
            let rows_affected = stmt.execute(params_from_iter(params.iter()))?;
            let mut stream = RowStream {
                columns,
                rows: None,
                rows_affected,
                exhausted: true,
            };
            return Ok(consume(&mut stream));
        }

        let rows = stmt.query(params_from_iter(params.iter()))?;
        let mut stream = RowStream {
            columns,
            rows: Some(rows),
            rows_affected: 0,
            exhausted: false,
        };
        Ok(consume(&mut stream))
    }

    /// Insert rows into a table inside a single transaction
    ///
    /// Used by COPY FROM STDIN. Values are bound as text and converted by the
    /// column affinity.
    pub fn insert_rows(&self, table: &str, columns: &[String], rows: &[Vec<Value>]) -> Result<usize> {
        let column_list = if columns.is_empty() {
            String::new()
        } else {
            format!(" ({})", columns.join(", "))
        };
        let width = match rows.first() {
            Some(row) => row.len(),
            None => return Ok(0),
        };
        let placeholders: Vec<String> = (1..=width).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "INSERT INTO {}{} VALUES ({})",
            table,
            column_list,
            placeholders.join(", ")
        );

        let owns_transaction = self.conn.is_autocommit();
        if owns_transaction {
            self.conn.execute_batch("SAVEPOINT copy_in")?;
        }
        let result = self.insert_each(&sql, width, rows);
        if owns_transaction {
            match &result {
                Ok(_) => self.conn.execute_batch("RELEASE copy_in")?,
                Err(_) => self.conn.execute_batch("ROLLBACK TO copy_in; RELEASE copy_in")?,
            }
        }
        result
    }

    fn insert_each(&self, sql: &str, width: usize, rows: &[Vec<Value>]) -> Result<usize> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        for (line, row) in rows.iter().enumerate() {
            if row.len() != width {
                return Err(EngineError::data(
                    crate::sqlstate::BAD_COPY_FILE_FORMAT,
                    format!(
                        "row {} has {} columns, expected {}",
                        line + 1,
                        row.len(),
                        width
                    ),
                ));
            }
            stmt.execute(params_from_iter(row.iter()))?;
        }
        Ok(rows.len())
    }

    /// Whether the connection is inside a transaction block
    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    /// Handle that aborts the statement currently running on this connection
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.conn.get_interrupt_handle()
    }
}

fn columns_of(stmt: &rusqlite::Statement<'_>) -> Vec<Column> {
    stmt.columns()
        .iter()
        .map(|c| Column::new(c.name(), c.decl_type()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogicalType;

    fn database() -> Database {
        Database::open_in_memory(FunctionRegistry::with_pgwire_extension()).unwrap()
    }

    #[test]
    fn test_connections_share_data() {
        let db = database();
        let first = db.connect().unwrap();
        let second = db.connect().unwrap();

        first.execute("CREATE TABLE t (id INTEGER, name VARCHAR)", &[]).unwrap();
        first
            .execute("INSERT INTO t VALUES (?1, ?2)", &[Value::Integer(1), Value::from("one")])
            .unwrap();

        let result = second.execute("SELECT id, name FROM t", &[]).unwrap();
        assert_eq!(result.rows, vec![vec![Value::Integer(1), Value::from("one")]]);
    }

    #[test]
    fn test_in_memory_databases_are_isolated() {
        let a = database();
        let b = database();
        a.connect().unwrap().execute("CREATE TABLE only_a (x INT)", &[]).unwrap();
        assert!(b.connect().unwrap().describe("SELECT * FROM only_a").is_err());
    }

    #[test]
    fn test_describe_reports_columns_and_params() {
        let db = database();
        let conn = db.connect().unwrap();
        conn.execute("CREATE TABLE t (id INTEGER, score DOUBLE, name TEXT)", &[]).unwrap();

        let description = conn.describe("SELECT id, score, name FROM t WHERE id = ?1").unwrap();
        assert_eq!(description.param_count, 1);
        let types: Vec<LogicalType> = description.columns.iter().map(|c| c.logical_type).collect();
        assert_eq!(types, vec![LogicalType::Integer, LogicalType::Double, LogicalType::Varchar]);
    }

    #[test]
    fn test_expression_columns_have_no_declared_type() {
        let db = database();
        let conn = db.connect().unwrap();
        let description = conn.describe("SELECT duckdb_pgwire('Sam') AS greeting").unwrap();
        assert_eq!(description.columns[0].name, "greeting");
        assert_eq!(description.columns[0].logical_type, LogicalType::Unknown);
    }

    #[test]
    fn test_rows_affected() {
        let db = database();
        let conn = db.connect().unwrap();
        conn.execute("CREATE TABLE t (id INTEGER)", &[]).unwrap();
        let result = conn.execute("INSERT INTO t VALUES (1), (2), (3)", &[]).unwrap();
        assert_eq!(result.rows_affected, 3);
        assert!(!result.returns_rows());
        let result = conn.execute("DELETE FROM t WHERE id > 1", &[]).unwrap();
        assert_eq!(result.tag_rows(&StatementKind::Delete), 2);
    }

    #[test]
    fn test_stream_steps_rows_on_demand() {
        let db = database();
        let conn = db.connect().unwrap();
        conn.execute("CREATE TABLE t (id INTEGER)", &[]).unwrap();
        conn.execute("INSERT INTO t VALUES (1), (2), (3)", &[]).unwrap();

        let batches = conn
            .stream("SELECT id FROM t ORDER BY id", &[], |stream| {
                let mut batches = Vec::new();
                while !stream.is_done() {
                    batches.push(stream.next_batch(2).unwrap().len());
                }
                batches
            })
            .unwrap();
        assert_eq!(batches, vec![2, 1]);
    }

    #[test]
    fn test_stream_stops_at_exact_limit_without_looking_ahead() {
        let db = database();
        let conn = db.connect().unwrap();
        let (first, done_after_first, second) = conn
            .stream("SELECT 1 UNION ALL SELECT 2", &[], |stream| {
                let first = stream.next_batch(2).unwrap();
                let done = stream.is_done();
                (first, done, stream.next_batch(2).unwrap())
            })
            .unwrap();
        assert_eq!(first.len(), 2);
        assert!(!done_after_first);
        assert!(second.is_empty());
    }

    #[test]
    fn test_stream_without_result_set_is_done() {
        let db = database();
        let conn = db.connect().unwrap();
        conn.execute("CREATE TABLE t (id INTEGER)", &[]).unwrap();
        let (done, affected) = conn
            .stream("INSERT INTO t VALUES (1), (2)", &[], |stream| {
                (stream.is_done(), stream.rows_affected())
            })
            .unwrap();
        assert!(done);
        assert_eq!(affected, 2);
    }

    #[test]
    fn test_parameter_count_mismatch() {
        let db = database();
        let conn = db.connect().unwrap();
        let err = conn.execute("SELECT ?1", &[]).unwrap_err();
        assert_eq!(err.sqlstate(), crate::sqlstate::PROTOCOL_VIOLATION);
    }

    #[test]
    fn test_transaction_state_is_reported() {
        let db = database();
        let conn = db.connect().unwrap();
        assert!(conn.execute("BEGIN", &[]).unwrap().in_transaction);
        assert!(!conn.execute("COMMIT", &[]).unwrap().in_transaction);
    }

    #[test]
    fn test_insert_rows() {
        let db = database();
        let conn = db.connect().unwrap();
        conn.execute("CREATE TABLE t (id INTEGER, name TEXT)", &[]).unwrap();
        let rows = vec![
            vec![Value::from("1"), Value::from("a")],
            vec![Value::from("2"), Value::Null],
        ];
        assert_eq!(conn.insert_rows("t", &["id".to_string(), "name".to_string()], &rows).unwrap(), 2);

        let result = conn.execute("SELECT id, name FROM t ORDER BY id", &[]).unwrap();
        assert_eq!(result.rows[0], vec![Value::Integer(1), Value::from("a")]);
        assert_eq!(result.rows[1], vec![Value::Integer(2), Value::Null]);
    }

    #[test]
    fn test_insert_rows_is_atomic() {
        let db = database();
        let conn = db.connect().unwrap();
        conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", &[]).unwrap();
        let rows = vec![vec![Value::from("1")], vec![Value::from("1")]];
        assert!(conn.insert_rows("t", &[], &rows).is_err());
        let result = conn.execute("SELECT count(*) FROM t", &[]).unwrap();
        assert_eq!(result.rows[0][0], Value::Integer(0));
    }

    #[test]
    fn test_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pgwire.db");
        let path = path.to_str().unwrap();
        {
            let db = Database::open(path, FunctionRegistry::new()).unwrap();
            db.connect().unwrap().execute("CREATE TABLE kept (x INT)", &[]).unwrap();
        }
        let db = Database::open(path, FunctionRegistry::new()).unwrap();
        assert!(db.connect().unwrap().describe("SELECT x FROM kept").is_ok());
    }
}
