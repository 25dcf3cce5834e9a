//! In-memory scripted engine.
//!
//! `MemoryEngine` answers queries from registered fixtures instead of
//! executing SQL. It keeps the same single-call discipline a real engine has
//! and records every call, so tests can check exactly what the scheduler
//! asked of it.
//!
//! # Example
//!
//! ```
//! use esqlite_rs::engine::memory::{Fixture, MemoryEngine};
//! use esqlite_rs::Value;
//!
//! let engine = MemoryEngine::new()
//!     .with_fixture(
//!         "SELECT id FROM t",
//!         Fixture::rows(&["id"], vec![vec![Value::Integer(1)]]),
//!     )
//!     .with_fixture("SELECT forever()", Fixture::Stall);
//! assert!(engine.calls().is_empty());
//! ```

use crate::engine::protocol::{
    Completion, Engine, EngineRequest, EventSink, OpenFlags, QueryFlags, QueryStatus, RawRow,
};
use crate::error::EngineError;
use crate::types::Value;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Scripted answer for one SQL statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Fixture {
    /// Produce these rows
    Rows {
        /// Column names
        columns: Vec<String>,
        /// Rows in order
        rows: Vec<RawRow>,
    },
    /// Fail with this error as soon as the statement starts
    Error(EngineError),
    /// Never answer until interrupted or cancelled
    Stall,
}

impl Fixture {
    /// Build a row fixture.
    pub fn rows(columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        Fixture::Rows {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
        }
    }

    /// A statement that succeeds without producing rows.
    pub fn empty() -> Self {
        Fixture::Rows {
            columns: Vec::new(),
            rows: Vec::new(),
        }
    }

    /// Build an error fixture.
    pub fn error(code: &str, message: &str) -> Self {
        Fixture::Error(EngineError::new(code, message))
    }
}

/// One recorded call into the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    /// `open`
    Open { path: String, flags: OpenFlags },
    /// `submit`
    Submit(EngineRequest),
    /// `cancel`, with the value it returned
    Cancel { cancel_batch: bool, had_work: bool },
    /// `interrupt`
    Interrupt,
    /// `close`
    Close,
}

/// Deterministic engine backed by fixtures.
///
/// Clones share state, so a test can hand one clone to a connection and keep
/// another for registering fixtures and inspecting calls.
#[derive(Debug, Clone, Default)]
pub struct MemoryEngine {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    fixtures: HashMap<String, Fixture>,
    calls: Vec<EngineCall>,
    sink: Option<EventSink>,
    open: bool,
    manual_commit: bool,
    open_error: Option<EngineError>,
    cursor: Option<Cursor>,
}

/// Progress through one submitted batch.
#[derive(Debug)]
struct Cursor {
    pending: VecDeque<String>,
    current: Option<Running>,
}

#[derive(Debug)]
enum Running {
    Rows {
        columns: Vec<String>,
        rows: VecDeque<RawRow>,
    },
    Stalled,
}

impl MemoryEngine {
    /// Create an engine with no fixtures.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fixture and return the engine, for chaining.
    pub fn with_fixture(self, sql: &str, fixture: Fixture) -> Self {
        self.insert_fixture(sql, fixture);
        self
    }

    /// Register (or replace) a fixture.
    pub fn insert_fixture(&self, sql: &str, fixture: Fixture) {
        self.inner.lock().fixtures.insert(normalize(sql), fixture);
    }

    /// Make the next `open` fail with this error.
    pub fn fail_open(&self, error: EngineError) {
        self.inner.lock().open_error = Some(error);
    }

    /// Set the autocommit state reported by `auto_commit_enabled`.
    pub fn set_auto_commit(&self, enabled: bool) {
        self.inner.lock().manual_commit = !enabled;
    }

    /// All calls made so far, in order.
    pub fn calls(&self) -> Vec<EngineCall> {
        self.inner.lock().calls.clone()
    }

    /// Only the submitted requests, in order.
    pub fn submissions(&self) -> Vec<EngineRequest> {
        self.inner
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                EngineCall::Submit(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    /// SQL text of every `Query` submission, in order.
    pub fn submitted_sql(&self) -> Vec<String> {
        self.submissions()
            .into_iter()
            .filter_map(|request| match request {
                EngineRequest::Query { request, .. } => Some(request.sql),
                EngineRequest::Continue { .. } => None,
            })
            .collect()
    }

    /// Whether a call is currently held by a stalling fixture.
    pub fn is_stalled(&self) -> bool {
        matches!(
            self.inner.lock().cursor,
            Some(Cursor {
                current: Some(Running::Stalled),
                ..
            })
        )
    }

    /// Whether the engine is open.
    pub fn is_open(&self) -> bool {
        self.inner.lock().open
    }
}

impl MemoryState {
    fn emit(&self, completion: Completion) {
        match &self.sink {
            Some(sink) => sink.status(completion),
            None => trace!("memory engine has no sink, completion dropped"),
        }
    }

    /// Run the cursor forward by up to `count` rows (0 meaning all).
    fn step(&mut self, count: u32) {
        let Some(cursor) = self.cursor.as_mut() else {
            self.emit(Completion::done());
            return;
        };

        if cursor.current.is_none() {
            let Some(sql) = cursor.pending.pop_front() else {
                self.cursor = None;
                self.emit(Completion::done());
                return;
            };
            let last = cursor.pending.is_empty();
            match self.fixtures.get(&sql).cloned() {
                Some(Fixture::Rows { columns, rows }) => {
                    cursor.current = Some(Running::Rows {
                        columns,
                        rows: rows.into(),
                    });
                }
                Some(Fixture::Stall) => {
                    trace!(sql = %sql, "memory engine stalling");
                    cursor.current = Some(Running::Stalled);
                    return;
                }
                Some(Fixture::Error(error)) => {
                    if last {
                        self.cursor = None;
                    }
                    self.emit(Completion::error(error, last));
                    return;
                }
                None => {
                    if last {
                        self.cursor = None;
                    }
                    let error = EngineError::new("SQLITE_ERROR", format!("no fixture for: {}", sql));
                    self.emit(Completion::error(error, last));
                    return;
                }
            }
        }

        let last = cursor.pending.is_empty();
        let completion = match cursor.current.as_mut() {
            Some(Running::Rows { columns, rows }) => {
                let take = if count == 0 {
                    rows.len()
                } else {
                    rows.len().min(count as usize)
                };
                let batch: Vec<RawRow> = rows.drain(..take).collect();
                let columns = Some(columns.clone());
                if rows.is_empty() {
                    cursor.current = None;
                    Completion {
                        status: QueryStatus::Complete(batch),
                        last_statement: last,
                        columns,
                    }
                } else {
                    Completion {
                        status: QueryStatus::Incomplete(batch),
                        last_statement: last,
                        columns,
                    }
                }
            }
            // A stalled call never accepts a second request; submit rejects it.
            Some(Running::Stalled) | None => return,
        };

        if completion.ends_batch() {
            self.cursor = None;
        }
        self.emit(completion);
    }
}

impl Engine for MemoryEngine {
    fn open(&mut self, path: &str, flags: OpenFlags, events: EventSink) -> Result<(), EngineError> {
        let mut state = self.inner.lock();
        state.calls.push(EngineCall::Open {
            path: path.to_string(),
            flags,
        });
        if let Some(error) = state.open_error.take() {
            return Err(error);
        }
        state.sink = Some(events);
        state.open = true;
        debug!(path = %path, ?flags, "memory engine opened");
        Ok(())
    }

    fn submit(&mut self, request: EngineRequest) -> Result<(), EngineError> {
        let mut state = self.inner.lock();
        state.calls.push(EngineCall::Submit(request.clone()));
        if !state.open {
            return Err(EngineError::new("SQLITE_MISUSE", "database not open"));
        }
        if matches!(
            state.cursor,
            Some(Cursor {
                current: Some(Running::Stalled),
                ..
            })
        ) {
            return Err(EngineError::new("SQLITE_BUSY", "a call is already in progress"));
        }

        match request {
            EngineRequest::Query { request, count } => {
                let mut statements = split_statements(&request.sql);
                if request.flags.contains(QueryFlags::SINGLE) {
                    statements.truncate(1);
                }
                let pending: VecDeque<String> =
                    statements.into_iter().skip(request.skip).collect();
                state.cursor = Some(Cursor {
                    pending,
                    current: None,
                });
                state.step(count);
            }
            EngineRequest::Continue { count } => state.step(count),
        }
        Ok(())
    }

    fn cancel(&mut self, cancel_batch: bool) -> bool {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        let (had_work, stalled, exhausted) = match state.cursor.as_mut() {
            None => (false, false, false),
            Some(cursor) => {
                let running = cursor.current.take();
                let stalled = matches!(running, Some(Running::Stalled));
                if cancel_batch {
                    (true, stalled, true)
                } else if running.is_some() {
                    (true, stalled, cursor.pending.is_empty())
                } else {
                    (false, false, false)
                }
            }
        };

        if exhausted {
            state.cursor = None;
        }
        if stalled {
            state.emit(Completion::error(EngineError::interrupted(), exhausted));
        }
        if had_work {
            if let Some(sink) = &state.sink {
                sink.cancelled();
            }
        }

        state.calls.push(EngineCall::Cancel {
            cancel_batch,
            had_work,
        });
        had_work
    }

    fn interrupt(&mut self, done: oneshot::Sender<()>) {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        state.calls.push(EngineCall::Interrupt);
        let stalled = matches!(
            state.cursor,
            Some(Cursor {
                current: Some(Running::Stalled),
                ..
            })
        );
        if stalled {
            state.cursor = None;
            state.emit(Completion::error(EngineError::interrupted(), true));
        }
        let _ = done.send(());
    }

    fn auto_commit_enabled(&self) -> bool {
        !self.inner.lock().manual_commit
    }

    fn close(&mut self) {
        let mut state = self.inner.lock();
        state.calls.push(EngineCall::Close);
        state.open = false;
        state.cursor = None;
        state.sink = None;
        debug!("memory engine closed");
    }
}

/// Collapse whitespace so fixtures match regardless of formatting.
fn normalize(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Split SQL text on top-level `;`, dropping comments and empty statements.
fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut chars = sql.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            current.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => {
                quote = Some(c);
                current.push(c);
            }
            '-' if chars.peek() == Some(&'-') => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
                current.push(' ');
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
                current.push(' ');
            }
            ';' => statements.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    statements.push(current);

    statements
        .iter()
        .map(|s| normalize(s))
        .filter(|s| !s.is_empty())
        .collect()
}
