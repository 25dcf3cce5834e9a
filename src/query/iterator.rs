//! Statement iterator handles.
//!
//! A [`StatementIterator`] walks a batch of semicolon separated statements
//! one [`Statement`] at a time. The next statement is only created once the
//! caller asks for it, and only after the previous one finished or was
//! abandoned.

use crate::error::QueryError;
use crate::query::options::CancelScope;
use crate::query::statement::{Aborting, Statement};
use crate::scheduler::abort::{abort_iterator, abort_statement};
use crate::scheduler::process::process_queue;
use crate::scheduler::state::{AdvanceResult, ConnectionShared, IteratorCell};
use futures_util::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::trace;

/// Future of one advance: the next statement of the batch, `None` at the end
/// of the batch, or the error that ended the iterator.
#[must_use = "advances are queued immediately, but the statement is only observed when awaited"]
pub struct Advance {
    shared: Arc<ConnectionShared>,
    state: AdvanceState,
}

enum AdvanceState {
    Ready(Option<AdvanceResult>),
    Waiting(oneshot::Receiver<AdvanceResult>),
}

impl Future for Advance {
    type Output = Result<Option<Statement>, QueryError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let result = match &mut this.state {
            AdvanceState::Ready(result) => result.take().unwrap_or(Ok(None)),
            AdvanceState::Waiting(rx) => match Pin::new(rx).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(result) => result.unwrap_or(Err(QueryError::ConnectionClosed)),
            },
        };
        Poll::Ready(result.map(|child| {
            child.map(|cell| Statement::attach(this.shared.clone(), cell))
        }))
    }
}

impl fmt::Debug for Advance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ready = matches!(self.state, AdvanceState::Ready(_));
        f.debug_struct("Advance").field("ready", &ready).finish()
    }
}

/// Handle onto a batch of statements.
///
/// # Example
///
/// ```
/// use esqlite_rs::engine::{Fixture, MemoryEngine};
/// use esqlite_rs::{Connection, ConnectionParams, QueryOptions, Value};
/// use futures_util::StreamExt;
///
/// # async fn example() -> Result<(), esqlite_rs::EsqliteError> {
/// let engine = MemoryEngine::new()
///     .with_fixture("SELECT 1", Fixture::rows(&["a"], vec![vec![Value::from(1)]]))
///     .with_fixture("SELECT 2", Fixture::rows(&["b"], vec![vec![Value::from(2)]]));
/// let conn = Connection::open(engine, ":memory:".parse::<ConnectionParams>()?).await?;
///
/// let mut batch = conn.submit_batch("SELECT 1; SELECT 2", QueryOptions::new())?;
/// let mut statements = batch.statements();
/// while let Some(stmt) = statements.next().await {
///     let rows = stmt?.fetch_all().await?;
///     assert_eq!(rows.len(), 1);
/// }
/// # Ok(())
/// # }
/// ```
pub struct StatementIterator {
    shared: Arc<ConnectionShared>,
    cell: Arc<IteratorCell>,
}

impl StatementIterator {
    pub(crate) fn new(shared: Arc<ConnectionShared>, cell: Arc<IteratorCell>) -> Self {
        Self { shared, cell }
    }

    /// Advance to the next statement of the batch.
    ///
    /// An unfinished current statement is abandoned first: the engine skips
    /// the rest of its rows and the batch continues with the next statement.
    /// After a stream over this iterator was dropped under
    /// `CancelScope::None`, the first call yields the still running statement
    /// again instead.
    pub fn next(&self) -> Advance {
        let state = self.shared.with_state(|state| {
            let mut it = self.cell.lock();
            if it.done {
                let result = match &it.error {
                    Some(error) => Err(error.clone()),
                    None => Ok(None),
                };
                return AdvanceState::Ready(Some(result));
            }

            if it.resume {
                it.resume = false;
                let running = it.current.clone().filter(|child| !child.lock().done);
                if let Some(child) = running {
                    trace!("resuming current statement");
                    return AdvanceState::Ready(Some(Ok(Some(child))));
                }
            }

            let (tx, rx) = oneshot::channel();
            it.advances.push_back(tx);
            let unfinished = if state.is_active_iterator(&self.cell) {
                it.current.clone().filter(|child| !child.lock().done)
            } else {
                None
            };
            drop(it);

            if let Some(child) = unfinished {
                let _ = abort_statement(state, &child, CancelScope::Current);
            }
            process_queue(state);
            AdvanceState::Waiting(rx)
        });
        Advance {
            shared: self.shared.clone(),
            state,
        }
    }

    /// Stream the statements of the batch, applying the iterator's cancel
    /// scope if the stream is dropped before the batch ended.
    pub fn statements(&mut self) -> StatementStream<'_> {
        let scope = self.cancel_scope();
        self.statements_with_scope(scope)
    }

    /// Stream the statements of the batch, applying `scope` on early drop.
    ///
    /// * `All` aborts the iterator; later advances fail with
    ///   `QueryError::IteratorAborted`.
    /// * `Current` aborts the unfinished current statement; the batch keeps
    ///   running and the next advance yields the following statement.
    /// * `None` leaves the batch running; the next advance yields the same
    ///   statement again.
    pub fn statements_with_scope(&mut self, scope: CancelScope) -> StatementStream<'_> {
        StatementStream {
            iterator: self,
            scope,
            pending: None,
            finished: false,
        }
    }

    /// Abort the iterator, its current statement and every statement of the
    /// batch not yet started.
    pub fn abort(&self) -> Aborting {
        self.shared
            .with_state(|state| abort_iterator(state, &self.cell))
    }

    /// Set the cancel scope applied by streams and inherited by statements
    /// yielded from now on.
    pub fn set_cancel_scope(&self, scope: CancelScope) {
        self.cell.lock().cancel_scope = scope;
    }

    /// The current cancel scope.
    pub fn cancel_scope(&self) -> CancelScope {
        self.cell.lock().cancel_scope
    }

    /// Whether the batch ended, failed or was aborted.
    pub fn is_done(&self) -> bool {
        self.cell.lock().done
    }

    /// SQL text of the batch.
    pub fn sql(&self) -> String {
        self.cell.lock().sql.clone()
    }

    fn mark_resume(&self) {
        let mut it = self.cell.lock();
        if !it.done {
            it.resume = true;
        }
    }

    /// Abort the unfinished current statement; the batch continues.
    fn abandon_current(&self) {
        self.shared.with_state(|state| {
            let it = self.cell.lock();
            let unfinished = it.current.clone().filter(|child| !child.lock().done);
            drop(it);
            if let Some(child) = unfinished {
                let _ = abort_statement(state, &child, CancelScope::Current);
            }
        });
    }
}

impl fmt::Debug for StatementIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let it = self.cell.lock();
        f.debug_struct("StatementIterator")
            .field("sql", &it.sql)
            .field("done", &it.done)
            .field("yielded", &it.yielded)
            .field("cancel_scope", &it.cancel_scope)
            .finish()
    }
}

impl Drop for StatementIterator {
    fn drop(&mut self) {
        self.shared.with_state(|state| {
            {
                let mut it = self.cell.lock();
                it.detached = true;
                if it.done {
                    return;
                }
            }
            // Statements already handed out keep running; the rest of the
            // batch is aborted once they finished.
            process_queue(state);
        });
    }
}

/// Stream of the statements of a [`StatementIterator`].
#[must_use = "streams do nothing unless polled"]
pub struct StatementStream<'a> {
    iterator: &'a mut StatementIterator,
    scope: CancelScope,
    pending: Option<Advance>,
    finished: bool,
}

impl Stream for StatementStream<'_> {
    type Item = Result<Statement, QueryError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        if this.pending.is_none() {
            this.pending = Some(this.iterator.next());
        }
        let Some(advance) = this.pending.as_mut() else {
            return Poll::Ready(None);
        };
        let result = match Pin::new(advance).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(result) => result,
        };
        this.pending = None;
        match result {
            Ok(Some(statement)) => Poll::Ready(Some(Ok(statement))),
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

impl Drop for StatementStream<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        match self.scope {
            CancelScope::None => self.iterator.mark_resume(),
            CancelScope::Current => self.iterator.abandon_current(),
            CancelScope::All => {
                let _ = self.iterator.abort();
            }
        }
    }
}

impl fmt::Debug for StatementStream<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatementStream")
            .field("scope", &self.scope)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}
