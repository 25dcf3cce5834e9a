//! Scheduler state shared between caller handles and the dispatcher.
//!
//! Everything lives behind the connection lock. Statement and iterator cells
//! have their own locks, always taken after the connection lock and in the
//! order iterator, then statement.

use crate::connection::session::SessionState;
use crate::engine::protocol::{Engine, QueryRequest};
use crate::error::QueryError;
use crate::query::batch::{BatchCollector, BatchResult};
use crate::query::options::{CancelScope, FetchCount, QueryDefaults};
use crate::query::statement::Aborting;
use crate::types::{Columns, Row, RowShape, Value};
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tokio::sync::{oneshot, watch};
use tracing::debug;

/// Result of one fetch: a row batch, or `None` once the statement has no
/// more rows.
pub(crate) type FetchResult = Result<Option<Vec<Row>>, QueryError>;

/// Result of one advance: the next statement of the batch, or `None` at the
/// end of the batch.
pub(crate) type AdvanceResult = Result<Option<Arc<StatementCell>>, QueryError>;

/// Callback of a callback-mode submission.
pub(crate) type BatchCallback = Box<dyn FnOnce(BatchResult) + Send>;

/// Work to run once the connection lock is released.
pub(crate) type Deferred = Box<dyn FnOnce() + Send>;

pub(crate) type StatementCell = Mutex<StatementState>;
pub(crate) type IteratorCell = Mutex<IteratorState>;

/// What the engine is currently doing for us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pending {
    /// No outstanding call
    Idle,
    /// A submitted request awaits its completion
    Query,
    /// A cancel awaits its acknowledgement
    Cancel,
    /// A submitted request was cancelled while running; both its completion
    /// and the acknowledgement are owed
    ForcedCancel,
}

/// One pending "fetch up to N rows" request.
#[derive(Debug)]
pub(crate) struct FetchRequest {
    pub count: FetchCount,
    pub reply: oneshot::Sender<FetchResult>,
}

/// Completion signal shared by every caller of `abort()` on one handle.
#[derive(Debug)]
pub(crate) struct AbortSignal {
    tx: watch::Sender<bool>,
}

impl AbortSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// A signal that is already resolved.
    pub fn finished() -> Self {
        let signal = Self::new();
        signal.finish();
        signal
    }

    pub fn finish(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        *self.tx.borrow()
    }

    /// Future resolving once the abort finished.
    pub fn waiter(&self) -> Aborting {
        let mut rx = self.tx.subscribe();
        async move {
            loop {
                if *rx.borrow_and_update() {
                    return;
                }
                // A dropped sender means the connection state is gone.
                if rx.changed().await.is_err() {
                    return;
                }
            }
        }
        .boxed()
    }
}

/// State of one statement, free-standing or yielded by an iterator.
#[derive(Debug)]
pub(crate) struct StatementState {
    /// Payload of the first submission; `None` once submitted, and always
    /// `None` for statements that continue an already submitted batch
    pub request: Option<QueryRequest>,
    pub parent: Option<Weak<IteratorCell>>,
    pub fetches: VecDeque<FetchRequest>,
    pub active: Option<FetchRequest>,
    pub started: bool,
    pub done: bool,
    pub error: Option<QueryError>,
    pub columns: Option<Columns>,
    pub shape: RowShape,
    pub cancel_scope: CancelScope,
    pub abort: Option<AbortSignal>,
    pub aborting: bool,
    /// Live caller handles; at zero no fetches beyond those queued follow
    pub handles: usize,
    pub sql: String,
}

impl StatementState {
    pub fn free_standing(request: QueryRequest, shape: RowShape, cancel_scope: CancelScope) -> Self {
        let sql = request.sql.clone();
        let mut st = Self::new(Some(request), None, shape, cancel_scope, sql);
        st.handles = 1;
        st
    }

    pub fn child(
        request: Option<QueryRequest>,
        parent: Weak<IteratorCell>,
        shape: RowShape,
        cancel_scope: CancelScope,
        sql: String,
    ) -> Self {
        Self::new(request, Some(parent), shape, cancel_scope, sql)
    }

    fn new(
        request: Option<QueryRequest>,
        parent: Option<Weak<IteratorCell>>,
        shape: RowShape,
        cancel_scope: CancelScope,
        sql: String,
    ) -> Self {
        Self {
            request,
            parent,
            fetches: VecDeque::new(),
            active: None,
            started: false,
            done: false,
            error: None,
            columns: None,
            shape,
            cancel_scope,
            abort: None,
            aborting: false,
            handles: 0,
            sql,
        }
    }

    /// Record the column names reported with the first row batch.
    pub fn learn_columns(&mut self, names: Option<Vec<String>>) {
        if self.columns.is_none() {
            if let Some(names) = names {
                self.columns = Some(Columns::new(names));
            }
        }
    }

    /// Map raw engine rows using the statement's column mapping.
    pub fn map_rows(&mut self, raw: Vec<Vec<Value>>) -> Vec<Row> {
        let columns = self
            .columns
            .get_or_insert_with(|| Columns::new(Vec::new()))
            .clone();
        columns.map_rows(raw, self.shape)
    }

    /// Drop fetches whose caller went away before they were submitted.
    pub fn next_live_fetch(&mut self) -> Option<FetchRequest> {
        while let Some(fetch) = self.fetches.pop_front() {
            if !fetch.reply.is_closed() {
                return Some(fetch);
            }
        }
        None
    }

    /// Whether a queued fetch still has a caller waiting on it.
    pub fn has_live_fetch(&self) -> bool {
        self.fetches.iter().any(|fetch| !fetch.reply.is_closed())
    }

    /// Nobody can fetch from the statement any more.
    pub fn is_orphaned(&self) -> bool {
        self.handles == 0 && self.active.is_none() && !self.has_live_fetch()
    }

    /// Make the statement terminal with the aborted error and reject its
    /// queued fetches. An in-flight fetch still receives its completion.
    pub fn mark_aborted(&mut self) {
        if !self.done {
            self.done = true;
            self.error = Some(QueryError::Aborted);
        }
        self.reject_queued(&QueryError::Aborted);
    }

    /// Reject every queued (not yet submitted) fetch.
    pub fn reject_queued(&mut self, error: &QueryError) {
        for fetch in self.fetches.drain(..) {
            let _ = fetch.reply.send(Err(error.clone()));
        }
    }

    /// Terminal result for fetches issued after the statement finished.
    pub fn terminal_result(&self) -> FetchResult {
        match &self.error {
            Some(error) => Err(error.clone()),
            None => Ok(None),
        }
    }

    /// Resolve a pending abort.
    pub fn finish_abort(&mut self) {
        self.aborting = false;
        if let Some(signal) = &self.abort {
            signal.finish();
        }
    }

    /// Fail everything with `error` and release any abort waiter.
    pub fn fail(&mut self, error: &QueryError) {
        if !self.done {
            self.done = true;
            self.error = Some(error.clone());
        }
        if let Some(fetch) = self.active.take() {
            let _ = fetch.reply.send(Err(error.clone()));
        }
        self.reject_queued(error);
        self.finish_abort();
    }
}

/// State of one statement iterator.
#[derive(Debug)]
pub(crate) struct IteratorState {
    /// Payload of the batch; taken by the first statement that will submit it
    pub request: Option<QueryRequest>,
    /// Statements abandoned before the batch was ever submitted
    pub skipped: usize,
    pub advances: VecDeque<oneshot::Sender<AdvanceResult>>,
    pub current: Option<Arc<StatementCell>>,
    pub done: bool,
    pub error: Option<QueryError>,
    pub shape: RowShape,
    pub cancel_scope: CancelScope,
    pub resume: bool,
    pub abort: Option<AbortSignal>,
    pub aborting: bool,
    /// The caller dropped its handle
    pub detached: bool,
    pub yielded: usize,
    pub sql: String,
}

impl IteratorState {
    pub fn new(request: QueryRequest, shape: RowShape, cancel_scope: CancelScope) -> Self {
        Self {
            sql: request.sql.clone(),
            request: Some(request),
            skipped: 0,
            advances: VecDeque::new(),
            current: None,
            done: false,
            error: None,
            shape,
            cancel_scope,
            resume: false,
            abort: None,
            aborting: false,
            detached: false,
            yielded: 0,
        }
    }

    /// Whether nobody can advance the iterator or fetch from its current
    /// statement any more.
    pub fn is_orphaned(&self) -> bool {
        if !self.detached || self.advances.iter().any(|advance| !advance.is_closed()) {
            return false;
        }
        match &self.current {
            None => true,
            Some(child) => {
                let st = child.lock();
                st.done || st.is_orphaned()
            }
        }
    }

    /// Make the iterator terminal with the aborted error, rejecting pending
    /// advances and the current statement's queued fetches.
    pub fn mark_aborted(&mut self) {
        if !self.done {
            self.done = true;
            self.error = Some(QueryError::IteratorAborted);
        }
        self.resume = false;
        self.settle_advances();
        if let Some(child) = &self.current {
            child.lock().mark_aborted();
        }
    }

    /// Drop advances whose caller went away before they were resolved.
    pub fn next_live_advance(&mut self) -> Option<oneshot::Sender<AdvanceResult>> {
        while let Some(advance) = self.advances.pop_front() {
            if !advance.is_closed() {
                return Some(advance);
            }
        }
        None
    }

    /// Resolve every pending advance with the end of the batch, or with the
    /// iterator's error.
    pub fn settle_advances(&mut self) {
        let result = match &self.error {
            Some(error) => Err(error.clone()),
            None => Ok(None),
        };
        for advance in self.advances.drain(..) {
            let _ = advance.send(result.clone());
        }
    }

    /// Resolve a pending abort, together with the current statement's.
    pub fn finish_abort(&mut self) {
        self.aborting = false;
        if let Some(child) = self.current.take() {
            child.lock().finish_abort();
        }
        if let Some(signal) = &self.abort {
            signal.finish();
        }
    }

    /// Fail everything with `error` and release any abort waiter.
    pub fn fail(&mut self, error: &QueryError) {
        if !self.done {
            self.done = true;
            self.error = Some(error.clone());
        }
        if let Some(child) = self.current.take() {
            child.lock().fail(error);
        }
        self.settle_advances();
        self.finish_abort();
    }
}

/// A callback-mode submission.
pub(crate) struct RawRequest {
    pub request: Option<QueryRequest>,
    pub callback: Option<BatchCallback>,
    pub collector: BatchCollector,
    pub columns: Option<Columns>,
    pub shape: RowShape,
    pub continue_on_error: bool,
    pub aborting: bool,
}

impl RawRequest {
    pub fn new(request: QueryRequest, shape: RowShape, continue_on_error: bool, callback: BatchCallback) -> Self {
        Self {
            request: Some(request),
            callback: Some(callback),
            collector: BatchCollector::default(),
            columns: None,
            shape,
            continue_on_error,
            aborting: false,
        }
    }

    /// Queue the callback with `result`; it runs after the lock is released.
    pub fn deliver(&mut self, result: BatchResult, deferred: &mut Vec<Deferred>) {
        if let Some(callback) = self.callback.take() {
            deferred.push(Box::new(move || callback(result)));
        }
    }
}

impl std::fmt::Debug for RawRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawRequest")
            .field("request", &self.request)
            .field("shape", &self.shape)
            .field("continue_on_error", &self.continue_on_error)
            .field("aborting", &self.aborting)
            .finish_non_exhaustive()
    }
}

/// A unit of work queued on the connection or occupying the active slot.
#[derive(Debug)]
pub(crate) enum WorkItem {
    Raw(RawRequest),
    Statement(Arc<StatementCell>),
    Iterator(Arc<IteratorCell>),
}

impl WorkItem {
    pub fn is_statement(&self, cell: &Arc<StatementCell>) -> bool {
        matches!(self, WorkItem::Statement(c) if Arc::ptr_eq(c, cell))
    }

    pub fn is_iterator(&self, cell: &Arc<IteratorCell>) -> bool {
        matches!(self, WorkItem::Iterator(c) if Arc::ptr_eq(c, cell))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkItem::Raw(_) => "raw",
            WorkItem::Statement(_) => "statement",
            WorkItem::Iterator(_) => "iterator",
        }
    }
}

/// Everything the scheduler owns.
pub(crate) struct ConnectionState {
    pub engine: Box<dyn Engine>,
    pub session: SessionState,
    pub queue: VecDeque<WorkItem>,
    pub slot: Option<WorkItem>,
    pub pending: Pending,
    pub auto_close: bool,
    pub defaults: QueryDefaults,
    pub closed: watch::Sender<bool>,
    pub deferred: Vec<Deferred>,
}

impl ConnectionState {
    pub fn new(engine: Box<dyn Engine>, defaults: QueryDefaults) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            engine,
            session: SessionState::Open,
            queue: VecDeque::new(),
            slot: None,
            pending: Pending::Idle,
            auto_close: false,
            defaults,
            closed,
            deferred: Vec::new(),
        }
    }

    /// Whether `cell` occupies the active slot.
    pub fn is_active_statement(&self, cell: &Arc<StatementCell>) -> bool {
        self.slot.as_ref().is_some_and(|item| item.is_statement(cell))
    }

    /// Whether `cell` occupies the active slot.
    pub fn is_active_iterator(&self, cell: &Arc<IteratorCell>) -> bool {
        self.slot.as_ref().is_some_and(|item| item.is_iterator(cell))
    }

    /// Remove a queued statement. Returns whether it was queued.
    pub fn dequeue_statement(&mut self, cell: &Arc<StatementCell>) -> bool {
        match self.queue.iter().position(|item| item.is_statement(cell)) {
            Some(idx) => self.queue.remove(idx).is_some(),
            None => false,
        }
    }

    /// Remove a queued iterator. Returns whether it was queued.
    pub fn dequeue_iterator(&mut self, cell: &Arc<IteratorCell>) -> bool {
        match self.queue.iter().position(|item| item.is_iterator(cell)) {
            Some(idx) => self.queue.remove(idx).is_some(),
            None => false,
        }
    }

    /// Close the engine and mark the session closed.
    pub fn close_engine(&mut self) {
        if self.session.is_closed() {
            return;
        }
        debug!("closing engine");
        self.engine.close();
        self.session = SessionState::Closed;
        self.auto_close = false;
        self.pending = Pending::Idle;
        self.closed.send_replace(true);
    }
}

impl Drop for ConnectionState {
    fn drop(&mut self) {
        if !self.session.is_closed() {
            self.engine.close();
        }
    }
}

/// The connection state plus its lock.
pub(crate) struct ConnectionShared {
    state: Mutex<ConnectionState>,
}

impl ConnectionShared {
    pub fn new(state: ConnectionState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    /// Run `f` with the connection locked, then run any deferred callbacks
    /// after the lock is released.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut ConnectionState) -> R) -> R {
        let (result, deferred) = {
            let mut state = self.state.lock();
            let result = f(&mut state);
            (result, std::mem::take(&mut state.deferred))
        };
        for callback in deferred {
            callback();
        }
        result
    }
}

/// Shorten SQL text for log output.
pub(crate) fn sql_preview(sql: &str) -> &str {
    const MAX: usize = 64;
    if sql.len() <= MAX {
        return sql;
    }
    let mut end = MAX;
    while !sql.is_char_boundary(end) {
        end -= 1;
    }
    &sql[..end]
}
