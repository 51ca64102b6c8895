//! Engine worker thread
//!
//! Each session's engine connection lives on a dedicated thread that serves
//! requests from a channel. A query opened with [`Request::Open`] keeps its
//! statement running on the thread between fetches, so a row-limited Execute
//! only steps the rows it sends. While a query is open the thread keeps
//! serving other requests; opening a second query parks the rest of the
//! first one in memory.

use duckdb_pgwire_core::{Column, Connection, Database, EngineError, InterruptHandle, RowStream, Value};
use log::{debug, error, trace};
use std::collections::{HashMap, VecDeque};
use std::sync::mpsc;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Work run on the engine thread
pub(crate) type Job = Box<dyn FnOnce(&Connection) + Send>;

/// Reply channel for engine requests
pub(crate) type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// Request served by the engine thread
pub(crate) enum Request {
    /// Run a closure against the connection
    Run(Job),

    /// Start a query under a cursor id
    Open {
        cursor: u64,
        sql: String,
        params: Vec<Value>,
        reply: Reply<Opened>,
    },

    /// Step up to `limit` rows of an open query (0 means all of them)
    Fetch {
        cursor: u64,
        limit: usize,
        reply: Reply<Batch>,
    },

    /// Discard an open query
    Close { cursor: u64 },
}

/// Shape of a query that was just opened
#[derive(Debug)]
pub(crate) struct Opened {
    pub columns: Vec<Column>,
    pub rows_affected: usize,
    pub in_transaction: bool,
    pub done: bool,
}

/// Rows returned by one fetch
#[derive(Debug)]
pub(crate) struct Batch {
    pub rows: Vec<Vec<Value>>,
    pub done: bool,
}

/// Rest of a query that was pushed aside by a newer one
enum Parked {
    Rows(VecDeque<Vec<Value>>),
    Failed(EngineError),
}

/// Start the engine thread for one session
///
/// Resolves once the thread has connected, with the handle that interrupts
/// the statement it is running.
pub(crate) async fn spawn(
    database: Arc<Database>,
    session: u64,
) -> Result<(mpsc::Sender<Request>, InterruptHandle), EngineError> {
    let (requests, receiver) = mpsc::channel::<Request>();
    let (ready, connected) = oneshot::channel();

    std::thread::Builder::new()
        .name(format!("duckpg-engine-{}", session))
        .spawn(move || {
            let conn = match database.connect() {
                Ok(conn) => conn,
                Err(e) => {
                    let _ = ready.send(Err(e));
                    return;
                }
            };
            if ready.send(Ok(conn.interrupt_handle())).is_err() {
                return;
            }
            Worker {
                conn: &conn,
                requests: &receiver,
                parked: HashMap::new(),
            }
            .serve();
            debug!("Engine worker for session {} stopped", session);
        })
        .map_err(|e| EngineError::Internal(format!("failed to start engine worker: {}", e)))?;

    let interrupt = connected
        .await
        .map_err(|_| EngineError::Internal("engine worker exited during connect".to_string()))??;
    Ok((requests, interrupt))
}

struct Worker<'a> {
    conn: &'a Connection,
    requests: &'a mpsc::Receiver<Request>,
    parked: HashMap<u64, Parked>,
}

impl Worker<'_> {
    /// Serve requests until every sender is gone
    fn serve(&mut self) {
        let mut next = self.requests.recv().ok();
        while let Some(request) = next.take() {
            next = match request {
                Request::Open {
                    cursor,
                    sql,
                    params,
                    reply,
                } => self.open(cursor, &sql, &params, reply),
                other => {
                    self.handle(other);
                    self.requests.recv().ok()
                }
            };
        }
    }

    /// Requests that do not need the open query
    fn handle(&mut self, request: Request) {
        match request {
            Request::Run(job) => job(self.conn),
            Request::Fetch { cursor, limit, reply } => {
                let _ = reply.send(self.fetch_parked(cursor, limit));
            }
            Request::Close { cursor } => {
                if self.parked.remove(&cursor).is_some() {
                    trace!("Dropped parked cursor {}", cursor);
                }
            }
            Request::Open { cursor, reply, .. } => {
                error!("Cursor {} opened outside the request loop", cursor);
                let _ = reply.send(Err(EngineError::Internal("cursor opened out of order".to_string())));
            }
        }
    }

    fn fetch_parked(&mut self, cursor: u64, limit: usize) -> Result<Batch, EngineError> {
        match self.parked.remove(&cursor) {
            Some(Parked::Rows(mut rows)) => {
                let take = if limit == 0 { rows.len() } else { rows.len().min(limit) };
                let batch: Vec<_> = rows.drain(..take).collect();
                let done = rows.is_empty() && (limit == 0 || take < limit);
                if !done {
                    self.parked.insert(cursor, Parked::Rows(rows));
                }
                Ok(Batch { rows: batch, done })
            }
            Some(Parked::Failed(err)) => Err(err),
            None => Ok(Batch {
                rows: Vec::new(),
                done: true,
            }),
        }
    }

    /// Run a query and serve fetches for it until it ends, is closed, or a
    /// newer query takes its place
    ///
    /// Returns the next request to serve, if any. The statement is released
    /// before waiting for it.
    fn open(&mut self, id: u64, sql: &str, params: &[Value], reply: Reply<Opened>) -> Option<Request> {
        let conn = self.conn;
        let mut reply = Some(reply);

        let outcome = conn.stream(sql, params, |stream| {
            let opened = Opened {
                columns: stream.columns().to_vec(),
                rows_affected: stream.rows_affected(),
                in_transaction: conn.in_transaction(),
                done: stream.is_done(),
            };
            let delivered = reply.take().map_or(false, |reply| reply.send(Ok(opened)).is_ok());
            if delivered && !stream.is_done() {
                self.drive(id, stream)
            } else {
                Next::Receive
            }
        });

        match outcome {
            Ok(Next::Receive) => self.requests.recv().ok(),
            Ok(Next::Serve(request)) => Some(request),
            Ok(Next::Stop) => None,
            Err(err) => {
                if let Some(reply) = reply.take() {
                    let _ = reply.send(Err(err));
                }
                self.requests.recv().ok()
            }
        }
    }

    fn drive(&mut self, id: u64, stream: &mut RowStream<'_>) -> Next {
        loop {
            let request = match self.requests.recv() {
                Ok(request) => request,
                Err(_) => return Next::Stop,
            };
            match request {
                Request::Fetch { cursor, limit, reply } if cursor == id => {
                    let batch = stream.next_batch(limit).map(|rows| Batch {
                        rows,
                        done: stream.is_done(),
                    });
                    let _ = reply.send(batch);
                    if stream.is_done() {
                        return Next::Receive;
                    }
                }
                Request::Close { cursor } if cursor == id => return Next::Receive,
                open @ Request::Open { .. } => {
                    debug!("Parking the rest of cursor {}", id);
                    let parked = match stream.next_batch(0) {
                        Ok(rows) => Parked::Rows(rows.into()),
                        Err(err) => Parked::Failed(err),
                    };
                    self.parked.insert(id, parked);
                    return Next::Serve(open);
                }
                other => self.handle(other),
            }
        }
    }
}

/// Where the request loop goes once an open query is released
enum Next {
    /// Wait for the next request
    Receive,
    /// Serve a request that arrived while the query was open
    Serve(Request),
    /// Every sender is gone
    Stop,
}
