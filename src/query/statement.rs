//! Statement handles.
//!
//! A [`Statement`] is a caller-side handle onto one SQL statement queued on a
//! connection, either submitted on its own or yielded by a
//! [`StatementIterator`](crate::query::StatementIterator). Nothing runs until
//! rows are requested; every request becomes one fetch the scheduler submits
//! once the statement owns the engine.

use crate::error::QueryError;
use crate::query::options::{CancelScope, FetchCount};
use crate::scheduler::abort::abort_statement;
use crate::scheduler::process::process_queue;
use crate::scheduler::state::{ConnectionShared, FetchRequest, FetchResult, StatementCell};
use crate::types::Row;
use futures_util::future::BoxFuture;
use futures_util::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Future resolving once an abort has finished.
///
/// Every call to `abort()` on the same handle resolves at the same moment.
/// Dropping it does not stop the abort.
pub type Aborting = BoxFuture<'static, ()>;

/// Future of one fetch: a batch of rows, `None` once the statement has no
/// more rows, or the error that ended it.
#[must_use = "fetches are queued immediately, but their rows are only observed when awaited"]
#[derive(Debug)]
pub struct Fetch {
    state: FetchState,
}

#[derive(Debug)]
enum FetchState {
    Ready(Option<FetchResult>),
    Waiting(oneshot::Receiver<FetchResult>),
}

impl Fetch {
    fn ready(result: FetchResult) -> Self {
        Self {
            state: FetchState::Ready(Some(result)),
        }
    }

    fn waiting(rx: oneshot::Receiver<FetchResult>) -> Self {
        Self {
            state: FetchState::Waiting(rx),
        }
    }
}

impl Future for Fetch {
    type Output = Result<Option<Vec<Row>>, QueryError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            FetchState::Ready(result) => {
                Poll::Ready(result.take().unwrap_or(Err(QueryError::ConnectionClosed)))
            }
            // The sender only goes away with the connection state.
            FetchState::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|result| result.unwrap_or(Err(QueryError::ConnectionClosed))),
        }
    }
}

/// Handle onto one SQL statement.
///
/// # Example
///
/// ```
/// use esqlite_rs::engine::{Fixture, MemoryEngine};
/// use esqlite_rs::{Connection, ConnectionParams, FetchCount, QueryOptions, Value};
///
/// # async fn example() -> Result<(), esqlite_rs::EsqliteError> {
/// let engine = MemoryEngine::new().with_fixture(
///     "SELECT id FROM users",
///     Fixture::rows(&["id"], vec![vec![Value::from(1)], vec![Value::from(2)]]),
/// );
/// let conn = Connection::open(engine, ":memory:".parse::<ConnectionParams>()?).await?;
///
/// let stmt = conn.submit_single("SELECT id FROM users", QueryOptions::new())?;
/// let first = stmt.execute(FetchCount::one()).await?;
/// assert_eq!(first.map(|rows| rows.len()), Some(1));
/// let rest = stmt.fetch_all().await?;
/// assert_eq!(rest.len(), 1);
/// # Ok(())
/// # }
/// ```
pub struct Statement {
    shared: Arc<ConnectionShared>,
    cell: Arc<StatementCell>,
}

impl Statement {
    pub(crate) fn new(shared: Arc<ConnectionShared>, cell: Arc<StatementCell>) -> Self {
        Self { shared, cell }
    }

    /// Wrap a statement yielded by an iterator, counting the new handle.
    pub(crate) fn attach(shared: Arc<ConnectionShared>, cell: Arc<StatementCell>) -> Self {
        cell.lock().handles += 1;
        Self { shared, cell }
    }

    /// Request up to `count` further rows.
    ///
    /// The fetch is queued immediately; fetches on one statement resolve in
    /// the order they were requested. Once the statement has no more rows
    /// every fetch resolves to `None`; once it failed or was aborted every
    /// fetch resolves to that error.
    pub fn execute(&self, count: FetchCount) -> Fetch {
        self.shared.with_state(|state| {
            let mut st = self.cell.lock();
            if st.done {
                return Fetch::ready(st.terminal_result());
            }
            let (reply, rx) = oneshot::channel();
            st.fetches.push_back(FetchRequest { count, reply });
            drop(st);
            process_queue(state);
            Fetch::waiting(rx)
        })
    }

    /// Fetch the next row.
    pub async fn next_row(&self) -> Result<Option<Row>, QueryError> {
        let rows = self.execute(FetchCount::one()).await?;
        Ok(rows.and_then(|rows| rows.into_iter().next()))
    }

    /// Fetch every remaining row.
    pub async fn fetch_all(&self) -> Result<Vec<Row>, QueryError> {
        Ok(self.execute(FetchCount::All).await?.unwrap_or_default())
    }

    /// Stream the rows one at a time, as single-row batches.
    ///
    /// Dropping the stream before it ended applies the statement's cancel
    /// scope.
    pub fn rows(&self) -> RowStream<'_> {
        self.iterate(FetchCount::one())
    }

    /// Stream the rows in batches of `count`.
    pub fn iterate(&self, count: FetchCount) -> RowStream<'_> {
        let scope = self.cancel_scope();
        self.iterate_with_scope(count, scope)
    }

    /// Stream the rows in batches of `count`, applying `scope` instead of the
    /// statement's cancel scope when the stream is dropped early.
    pub fn iterate_with_scope(&self, count: FetchCount, scope: CancelScope) -> RowStream<'_> {
        RowStream {
            statement: self,
            count,
            scope,
            pending: None,
            finished: false,
        }
    }

    /// Abort the statement.
    ///
    /// Every queued fetch is rejected with `QueryError::Aborted`. A statement
    /// yielded by an iterator whose cancel scope is `All` aborts the iterator
    /// as well. Calling it again returns a future resolving together with the
    /// first.
    pub fn abort(&self) -> Aborting {
        let scope = match self.cancel_scope() {
            CancelScope::All => CancelScope::All,
            _ => CancelScope::Current,
        };
        self.abort_with_scope(scope)
    }

    fn abort_with_scope(&self, scope: CancelScope) -> Aborting {
        self.shared
            .with_state(|state| abort_statement(state, &self.cell, scope))
    }

    /// Set the cancel scope applied by streams and by `abort()`.
    pub fn set_cancel_scope(&self, scope: CancelScope) {
        self.cell.lock().cancel_scope = scope;
    }

    /// The current cancel scope.
    pub fn cancel_scope(&self) -> CancelScope {
        self.cell.lock().cancel_scope
    }

    /// Column names, known once the first rows arrived.
    pub fn columns(&self) -> Option<Vec<String>> {
        self.cell
            .lock()
            .columns
            .as_ref()
            .map(|columns| columns.names().to_vec())
    }

    /// Number of result columns, known once the first rows arrived.
    pub fn column_count(&self) -> Option<usize> {
        self.cell.lock().columns.as_ref().map(|columns| columns.len())
    }

    /// Whether the statement finished, failed or was aborted.
    pub fn is_done(&self) -> bool {
        self.cell.lock().done
    }

    /// SQL text the statement was submitted with.
    pub fn sql(&self) -> String {
        self.cell.lock().sql.clone()
    }
}

impl PartialEq for Statement {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl fmt::Debug for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.cell.lock();
        f.debug_struct("Statement")
            .field("sql", &st.sql)
            .field("done", &st.done)
            .field("cancel_scope", &st.cancel_scope)
            .finish()
    }
}

impl Drop for Statement {
    fn drop(&mut self) {
        self.shared.with_state(|state| {
            {
                let mut st = self.cell.lock();
                st.handles = st.handles.saturating_sub(1);
                if st.handles > 0 || st.done {
                    return;
                }
            }
            // Fetches already queued still run; the statement is aborted
            // once they have.
            process_queue(state);
        });
    }
}

/// Stream of row batches from a [`Statement`].
///
/// Yields each non-empty batch, ends after the last row, and yields the
/// error (then ends) if the statement fails.
#[must_use = "streams do nothing unless polled"]
pub struct RowStream<'a> {
    statement: &'a Statement,
    count: FetchCount,
    scope: CancelScope,
    pending: Option<Fetch>,
    finished: bool,
}

impl Stream for RowStream<'_> {
    type Item = Result<Vec<Row>, QueryError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        if this.pending.is_none() {
            this.pending = Some(this.statement.execute(this.count));
        }
        let Some(fetch) = this.pending.as_mut() else {
            return Poll::Ready(None);
        };
        let result = match Pin::new(fetch).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(result) => result,
        };
        this.pending = None;
        match result {
            Ok(Some(rows)) => Poll::Ready(Some(Ok(rows))),
            Ok(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Err(error) => {
                this.finished = true;
                Poll::Ready(Some(Err(error)))
            }
        }
    }
}

impl Drop for RowStream<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        match self.scope {
            CancelScope::None => {}
            scope => {
                let _ = self.statement.abort_with_scope(scope);
            }
        }
    }
}

impl fmt::Debug for RowStream<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowStream")
            .field("count", &self.count)
            .field("scope", &self.scope)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}
