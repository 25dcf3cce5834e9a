//! Completion dispatcher.
//!
//! The engine reports every completion and cancel acknowledgement through
//! one channel. A single task drains it, routes each event to whatever
//! occupies the active slot, and re-runs the scheduler.

use crate::engine::protocol::{Completion, EngineEvent, QueryStatus};
use crate::error::QueryError;
use crate::scheduler::process::process_queue;
use crate::scheduler::state::{
    ConnectionShared, ConnectionState, Deferred, IteratorCell, Pending, RawRequest,
    StatementState, WorkItem,
};
use crate::types::{Columns, Row};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Spawn the task that feeds engine events into the scheduler.
///
/// The task holds only a weak reference; it stops when the engine drops its
/// sink or the connection state is gone.
pub(crate) fn spawn_dispatcher(
    shared: Weak<ConnectionShared>,
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(shared) = shared.upgrade() else {
                break;
            };
            shared.with_state(|state| {
                dispatch(state, event);
                process_queue(state);
            });
        }
        trace!("dispatcher stopped");
    })
}

fn dispatch(state: &mut ConnectionState, event: EngineEvent) {
    match event {
        EngineEvent::Status(completion) => apply_completion(state, completion),
        EngineEvent::Cancelled => apply_cancelled(state),
    }
}

/// Route a completion to the active work item.
pub(crate) fn apply_completion(state: &mut ConnectionState, completion: Completion) {
    state.pending = match state.pending {
        Pending::Query => Pending::Idle,
        // The slot stays busy until the cancel is acknowledged.
        Pending::ForcedCancel => Pending::Cancel,
        pending => {
            warn!(?pending, "completion without an outstanding call, ignored");
            return;
        }
    };

    let Some(mut item) = state.slot.take() else {
        warn!("completion with an empty active slot, ignored");
        return;
    };

    let keep = match &mut item {
        WorkItem::Raw(raw) => complete_raw(raw, completion, &mut state.deferred),
        WorkItem::Statement(cell) => !complete_statement(&mut cell.lock(), completion),
        WorkItem::Iterator(cell) => complete_iterator(cell, completion),
    };
    if keep {
        state.slot = Some(item);
    } else {
        trace!(kind = item.kind(), "work item finished");
    }
}

/// Route a cancel acknowledgement to the active work item.
pub(crate) fn apply_cancelled(state: &mut ConnectionState) {
    match state.pending {
        Pending::Cancel => state.pending = Pending::Idle,
        Pending::ForcedCancel => {
            // Acknowledged ahead of the cancelled call's completion.
            state.pending = Pending::Query;
            return;
        }
        pending => {
            warn!(?pending, "cancel acknowledgement without a cancel, ignored");
            return;
        }
    }

    let Some(item) = state.slot.take() else {
        trace!("cancel acknowledged after the work item finished");
        return;
    };

    match item {
        WorkItem::Raw(_) => debug!("callback query torn down"),
        WorkItem::Statement(cell) => {
            cell.lock().finish_abort();
            debug!("statement abort acknowledged");
        }
        WorkItem::Iterator(cell) => {
            let released = {
                let mut it = cell.lock();
                if it.aborting {
                    it.finish_abort();
                    true
                } else {
                    if let Some(child) = it.current.take() {
                        child.lock().finish_abort();
                    }
                    false
                }
            };
            if released {
                debug!("iterator abort acknowledged");
            } else {
                debug!("statement abandoned, batch continues");
                state.slot = Some(WorkItem::Iterator(cell));
            }
        }
    }
}

/// Apply a completion to a statement. Returns whether the statement ended.
fn complete_statement(st: &mut StatementState, completion: Completion) -> bool {
    st.learn_columns(completion.columns);
    let active = st.active.take();

    let (reply, ended, error) = match completion.status {
        QueryStatus::Incomplete(raw) => (Ok(Some(st.map_rows(raw))), false, None),
        QueryStatus::Complete(raw) => {
            let rows = st.map_rows(raw);
            let rows = if rows.is_empty() { None } else { Some(rows) };
            (Ok(rows), true, None)
        }
        QueryStatus::Error(error) => {
            let error = QueryError::from(error);
            (Err(error.clone()), true, Some(error))
        }
        QueryStatus::Done => (Ok(None), true, None),
    };

    match active {
        Some(fetch) => {
            if fetch.reply.send(reply).is_err() {
                trace!("fetch dropped before its rows arrived, rows discarded");
            }
        }
        None => warn!("statement completion without an active fetch"),
    }

    if ended {
        end_statement(st, error);
    }
    ended
}

fn end_statement(st: &mut StatementState, error: Option<QueryError>) {
    if !st.done {
        st.done = true;
        st.error = error.clone();
    }
    match &error {
        Some(error) => st.reject_queued(error),
        None => {
            for fetch in st.fetches.drain(..) {
                let _ = fetch.reply.send(Ok(None));
            }
        }
    }
    // The engine already moved past the statement: nothing left to cancel.
    if st.aborting {
        st.finish_abort();
    }
}

/// Apply a completion to an iterator's current statement. Returns whether
/// the iterator stays active.
fn complete_iterator(cell: &Arc<IteratorCell>, completion: Completion) -> bool {
    let mut it = cell.lock();
    let ends_batch = completion.ends_batch();

    match it.current.clone() {
        Some(child) => {
            if complete_statement(&mut child.lock(), completion) {
                it.current = None;
            }
        }
        None => warn!("iterator completion without a current statement"),
    }

    if !ends_batch {
        return true;
    }

    it.done = true;
    it.settle_advances();
    if it.aborting {
        it.finish_abort();
    }
    debug!(statements = it.yielded, "batch finished");
    false
}

/// Buffer a callback-mode completion. Returns whether the request stays
/// active.
fn complete_raw(raw: &mut RawRequest, completion: Completion, deferred: &mut Vec<Deferred>) -> bool {
    if let Some(names) = completion.columns {
        raw.columns = Some(Columns::new(names));
    }
    let last = completion.last_statement;

    match completion.status {
        QueryStatus::Incomplete(rows) => {
            let rows = map_raw_rows(raw, rows);
            raw.collector.extend(rows);
            true
        }
        QueryStatus::Complete(rows) => {
            let rows = map_raw_rows(raw, rows);
            raw.collector.complete(rows);
            raw.columns = None;
            if last {
                finish_raw(raw, deferred);
            }
            !last
        }
        QueryStatus::Error(error) => {
            let error = QueryError::from(error);
            raw.columns = None;
            if raw.continue_on_error {
                raw.collector.fail(error);
                if last {
                    finish_raw(raw, deferred);
                }
                return !last;
            }
            raw.deliver(Err(error), deferred);
            if last {
                return false;
            }
            // Stop at the first error: tear the rest of the batch down.
            raw.aborting = true;
            true
        }
        QueryStatus::Done => {
            finish_raw(raw, deferred);
            false
        }
    }
}

fn map_raw_rows(raw: &RawRequest, rows: Vec<Vec<crate::types::Value>>) -> Vec<Row> {
    match &raw.columns {
        Some(columns) => columns.map_rows(rows, raw.shape),
        None => Columns::new(Vec::new()).map_rows(rows, raw.shape),
    }
}

fn finish_raw(raw: &mut RawRequest, deferred: &mut Vec<Deferred>) {
    let collector = std::mem::take(&mut raw.collector);
    raw.deliver(collector.finish(), deferred);
}
