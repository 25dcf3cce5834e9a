//! The connection handle.
//!
//! A `Connection` owns the scheduler state for one engine. Every handle it
//! returns shares that state, so statements and iterators keep working for
//! as long as they are alive, even after the `Connection` itself is dropped.

use crate::connection::params::ConnectionParams;
use crate::connection::session::SessionState;
use crate::engine::protocol::{Engine, EventSink};
use crate::error::{ConnectionError, EsqliteError, QueryError};
use crate::query::batch::BatchResult;
use crate::query::iterator::StatementIterator;
use crate::query::options::QueryOptions;
use crate::query::statement::Statement;
use crate::scheduler::abort::close_now;
use crate::scheduler::dispatch::spawn_dispatcher;
use crate::scheduler::process::process_queue;
use crate::scheduler::state::{
    sql_preview, ConnectionShared, ConnectionState, IteratorState, RawRequest, StatementState,
    WorkItem,
};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

/// An open database connection.
///
/// Requests are queued in submission order and run one at a time; handles
/// can be created and awaited in any order.
///
/// # Example
///
/// ```
/// use esqlite_rs::engine::{Fixture, MemoryEngine};
/// use esqlite_rs::{Connection, ConnectionParams, QueryOptions, Value};
///
/// # async fn example() -> Result<(), esqlite_rs::EsqliteError> {
/// let engine = MemoryEngine::new().with_fixture(
///     "SELECT name FROM users",
///     Fixture::rows(&["name"], vec![vec![Value::from("ada")]]),
/// );
/// let params = ConnectionParams::builder().path(":memory:").build()?;
/// let conn = Connection::open(engine, params).await?;
///
/// let stmt = conn.submit_single("SELECT name FROM users", QueryOptions::new())?;
/// let row = stmt.next_row().await?.expect("one row");
/// assert_eq!(row.get("name"), Some(&Value::from("ada")));
///
/// conn.drain_and_close().await;
/// # Ok(())
/// # }
/// ```
pub struct Connection {
    shared: Arc<ConnectionShared>,
    params: ConnectionParams,
}

impl Connection {
    /// Open a database on `engine`.
    ///
    /// Must be called from within a Tokio runtime: the task routing engine
    /// completions is spawned here.
    ///
    /// # Arguments
    ///
    /// * `engine` - Execution engine
    /// * `params` - Connection parameters
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::OpenFailed` if the engine cannot open the
    /// database.
    pub async fn open<E>(mut engine: E, params: ConnectionParams) -> Result<Self, ConnectionError>
    where
        E: Engine + 'static,
    {
        let (sink, events) = EventSink::channel();
        engine
            .open(&params.path, params.open_flags, sink)
            .map_err(|source| ConnectionError::OpenFailed {
                path: params.path.clone(),
                source,
            })?;
        debug!(path = %params.path, flags = ?params.open_flags, "database opened");

        let state = ConnectionState::new(Box::new(engine), params.query_defaults());
        let shared = Arc::new(ConnectionShared::new(state));
        spawn_dispatcher(Arc::downgrade(&shared), events);

        Ok(Self { shared, params })
    }

    /// Queue a single statement.
    ///
    /// Only the first statement of `sql` runs. Nothing is executed until the
    /// returned handle is asked for rows.
    ///
    /// # Errors
    ///
    /// Returns `UsageError` for SQL text or bind values that cannot be
    /// submitted, and `ConnectionError::NotOpen` once the connection closed.
    pub fn submit_single(&self, sql: &str, options: QueryOptions) -> Result<Statement, EsqliteError> {
        let shared = self.shared.clone();
        self.shared.with_state(|state| -> Result<Statement, EsqliteError> {
            let resolved = options.resolve(sql, &state.defaults, true)?;
            ensure_open(state)?;

            let cell = Arc::new(Mutex::new(StatementState::free_standing(
                resolved.request,
                resolved.shape,
                resolved.cancel_scope,
            )));
            enqueue(state, WorkItem::Statement(cell.clone()), sql);
            Ok(Statement::new(shared, cell))
        })
    }

    /// Queue a batch of semicolon separated statements.
    ///
    /// # Errors
    ///
    /// Same as [`submit_single`](Self::submit_single).
    pub fn submit_batch(
        &self,
        sql: &str,
        options: QueryOptions,
    ) -> Result<StatementIterator, EsqliteError> {
        let shared = self.shared.clone();
        self.shared.with_state(|state| -> Result<StatementIterator, EsqliteError> {
            let resolved = options.resolve(sql, &state.defaults, false)?;
            ensure_open(state)?;

            let cell = Arc::new(Mutex::new(IteratorState::new(
                resolved.request,
                resolved.shape,
                resolved.cancel_scope,
            )));
            enqueue(state, WorkItem::Iterator(cell.clone()), sql);
            Ok(StatementIterator::new(shared, cell))
        })
    }

    /// Queue a request whose rows are buffered and handed to `callback` once.
    ///
    /// By default only the first statement runs; with
    /// [`QueryOptions::single`] set to `false` the whole batch runs and, with
    /// [`QueryOptions::continue_on_error`], every statement reports its own
    /// result. The callback runs on the task that observed the completion,
    /// never while the connection is locked.
    ///
    /// # Errors
    ///
    /// Same as [`submit_single`](Self::submit_single). The callback is not
    /// invoked when an error is returned.
    pub fn submit_callback<F>(
        &self,
        sql: &str,
        options: QueryOptions,
        callback: F,
    ) -> Result<(), EsqliteError>
    where
        F: FnOnce(BatchResult) + Send + 'static,
    {
        self.shared.with_state(|state| -> Result<(), EsqliteError> {
            let single = options.is_single();
            let resolved = options.resolve(sql, &state.defaults, single)?;
            ensure_open(state)?;

            let raw = RawRequest::new(
                resolved.request,
                resolved.shape,
                resolved.continue_on_error,
                Box::new(callback),
            );
            enqueue(state, WorkItem::Raw(raw), sql);
            Ok(())
        })
    }

    /// Callback-mode submission returning a future instead.
    ///
    /// The request is queued immediately, so its place in the execution
    /// order is fixed by this call, not by when the future is awaited.
    ///
    /// # Errors
    ///
    /// Same as [`submit_single`](Self::submit_single).
    pub fn query(
        &self,
        sql: &str,
        options: QueryOptions,
    ) -> Result<impl Future<Output = BatchResult> + Send + 'static, EsqliteError> {
        let (tx, rx) = oneshot::channel();
        self.submit_callback(sql, options, move |result| {
            let _ = tx.send(result);
        })?;
        Ok(async move { rx.await.unwrap_or(Err(QueryError::ConnectionClosed)) })
    }

    /// Force whatever the engine is running right now to stop.
    ///
    /// The interrupted call reports an error to the statement that owned it.
    /// The returned future resolves once the engine acknowledged the
    /// interrupt; it resolves immediately on a closed connection.
    pub fn interrupt(&self) -> impl Future<Output = ()> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        self.shared.with_state(|state| {
            if state.session.is_closed() {
                let _ = tx.send(());
            } else {
                debug!("interrupt requested");
                state.engine.interrupt(tx);
            }
        });
        async move {
            let _ = rx.await;
        }
    }

    /// Close once every queued and active request finished.
    ///
    /// New requests are still accepted while draining. The returned future
    /// resolves once the engine is closed.
    pub fn drain_and_close(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut closed = self.shared.with_state(|state| {
            if !state.session.is_closed() {
                debug!(queued = state.queue.len(), "draining before close");
                state.session = SessionState::Draining;
                state.auto_close = true;
                process_queue(state);
            }
            state.closed.subscribe()
        });
        async move {
            loop {
                if *closed.borrow_and_update() {
                    return;
                }
                if closed.changed().await.is_err() {
                    return;
                }
            }
        }
    }

    /// Close now, failing every queued and active request with
    /// `QueryError::ConnectionClosed`.
    pub fn close(&self) {
        self.shared.with_state(close_now);
    }

    /// Whether the engine is in autocommit mode.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::NotOpen` once the connection closed.
    pub fn auto_commit_enabled(&self) -> Result<bool, ConnectionError> {
        self.shared.with_state(|state| {
            if state.session.is_closed() {
                return Err(ConnectionError::NotOpen);
            }
            Ok(state.engine.auto_commit_enabled())
        })
    }

    /// Current lifecycle state.
    pub fn session_state(&self) -> SessionState {
        self.shared.with_state(|state| state.session)
    }

    /// Whether the engine has been closed.
    pub fn is_closed(&self) -> bool {
        self.session_state().is_closed()
    }

    /// Parameters the connection was opened with.
    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("params", &self.params)
            .field("session", &self.session_state())
            .finish()
    }
}

fn ensure_open(state: &ConnectionState) -> Result<(), ConnectionError> {
    if state.session.can_submit() {
        Ok(())
    } else {
        Err(ConnectionError::NotOpen)
    }
}

fn enqueue(state: &mut ConnectionState, item: WorkItem, sql: &str) {
    debug!(kind = item.kind(), sql = sql_preview(sql), queued = state.queue.len(), "request queued");
    state.queue.push_back(item);
    process_queue(state);
}
