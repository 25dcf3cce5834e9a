//! Cooperative abort and connection teardown.
//!
//! An abort marks the handle terminal and rejects everything still queued on
//! it. If the handle's call is running, the engine is asked to cancel it at
//! once; the call's completion is still delivered and the slot is released
//! on the acknowledgement. Otherwise `process_queue` issues the cancel.

use crate::error::QueryError;
use crate::query::options::CancelScope;
use crate::query::statement::Aborting;
use crate::scheduler::process::{force_cancel, process_queue};
use crate::scheduler::state::{
    sql_preview, AbortSignal, ConnectionState, IteratorCell, StatementCell, WorkItem,
};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Abort a statement.
///
/// A statement yielded by an iterator is abandoned on its own unless
/// `scope` is `All`, in which case the whole iterator is aborted.
pub(crate) fn abort_statement(
    state: &mut ConnectionState,
    cell: &Arc<StatementCell>,
    scope: CancelScope,
) -> Aborting {
    let parent = {
        let mut st = cell.lock();
        if let Some(signal) = &st.abort {
            return signal.waiter();
        }
        if st.done {
            let signal = AbortSignal::finished();
            let waiter = signal.waiter();
            st.abort = Some(signal);
            return waiter;
        }
        st.parent.as_ref().and_then(Weak::upgrade)
    };

    match parent {
        Some(parent) if scope == CancelScope::All => abort_iterator(state, &parent),
        Some(parent) => abandon_child(state, &parent, cell),
        None => abort_free_standing(state, cell),
    }
}

fn abort_free_standing(state: &mut ConnectionState, cell: &Arc<StatementCell>) -> Aborting {
    let mut st = cell.lock();
    let signal = AbortSignal::new();
    let waiter = signal.waiter();
    st.abort = Some(signal);
    st.mark_aborted();

    if state.dequeue_statement(cell) {
        debug!(sql = sql_preview(&st.sql), "queued statement aborted");
        st.finish_abort();
        return waiter;
    }
    if state.is_active_statement(cell) {
        debug!(sql = sql_preview(&st.sql), "active statement aborting");
        st.aborting = true;
        let started = st.started;
        drop(st);
        if started {
            force_cancel(state, true);
        }
        process_queue(state);
        return waiter;
    }
    st.finish_abort();
    waiter
}

fn abandon_child(
    state: &mut ConnectionState,
    parent: &Arc<IteratorCell>,
    cell: &Arc<StatementCell>,
) -> Aborting {
    let it = parent.lock();
    if let Some(signal) = &it.abort {
        return signal.waiter();
    }
    let is_current = it
        .current
        .as_ref()
        .is_some_and(|current| Arc::ptr_eq(current, cell));

    let mut st = cell.lock();
    let signal = AbortSignal::new();
    let waiter = signal.waiter();
    st.abort = Some(signal);
    st.mark_aborted();

    if is_current {
        debug!(index = it.yielded, "abandoning current statement");
        st.aborting = true;
        let started = st.started;
        drop(st);
        drop(it);
        if started {
            force_cancel(state, false);
        }
        process_queue(state);
    } else {
        st.finish_abort();
    }
    waiter
}

/// Abort an iterator together with its current statement and the rest of
/// the batch.
pub(crate) fn abort_iterator(state: &mut ConnectionState, cell: &Arc<IteratorCell>) -> Aborting {
    let mut it = cell.lock();
    if let Some(signal) = &it.abort {
        return signal.waiter();
    }
    if it.done {
        let signal = AbortSignal::finished();
        let waiter = signal.waiter();
        it.abort = Some(signal);
        return waiter;
    }

    let signal = AbortSignal::new();
    let waiter = signal.waiter();
    it.abort = Some(signal);
    it.mark_aborted();

    if state.dequeue_iterator(cell) {
        debug!(sql = sql_preview(&it.sql), "queued iterator aborted");
        it.finish_abort();
        return waiter;
    }
    if state.is_active_iterator(cell) {
        debug!(sql = sql_preview(&it.sql), "active iterator aborting");
        it.aborting = true;
        drop(it);
        force_cancel(state, true);
        process_queue(state);
        return waiter;
    }
    it.finish_abort();
    waiter
}

/// Fail every queued and active request with `error`.
pub(crate) fn fail_all(state: &mut ConnectionState, error: &QueryError) {
    let items: Vec<WorkItem> = state.slot.take().into_iter().chain(state.queue.drain(..)).collect();
    if !items.is_empty() {
        debug!(count = items.len(), error = %error, "failing outstanding requests");
    }
    for item in items {
        match item {
            WorkItem::Raw(mut raw) => raw.deliver(Err(error.clone()), &mut state.deferred),
            WorkItem::Statement(cell) => cell.lock().fail(error),
            WorkItem::Iterator(cell) => cell.lock().fail(error),
        }
    }
}

/// Close immediately: fail everything outstanding, then close the engine.
pub(crate) fn close_now(state: &mut ConnectionState) {
    if state.session.is_closed() {
        return;
    }
    fail_all(state, &QueryError::ConnectionClosed);
    state.close_engine();
}
