//! The scheduler: decides what, if anything, to hand the engine next.
//!
//! `process_queue` runs after every enqueue, completion, cancel
//! acknowledgement and abort. It never blocks; it either submits exactly one
//! engine call, issues one cancel, or finds nothing to do.

use crate::engine::protocol::{Completion, EngineRequest};
use crate::error::EngineError;
use crate::scheduler::dispatch::apply_completion;
use crate::scheduler::state::{
    sql_preview, ConnectionState, IteratorCell, IteratorState, Pending, RawRequest,
    StatementCell, StatementState, WorkItem,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Outcome of one scheduling pass over the active item.
enum Step {
    /// Keep the item active and stop: a call is outstanding or the item
    /// waits for its caller
    Wait,
    /// Keep the item active and look at it again
    Again,
    /// The item is finished; release the slot
    Release,
    /// The engine refused a submission outright
    Failed(EngineError),
}

/// Dispatch pending work to the engine.
pub(crate) fn process_queue(state: &mut ConnectionState) {
    while state.pending == Pending::Idle && !state.session.is_closed() {
        let mut item = match state.slot.take() {
            Some(item) => item,
            None => match state.queue.pop_front() {
                Some(item) => {
                    debug!(kind = item.kind(), queued = state.queue.len(), "promoting work item");
                    item
                }
                None => {
                    if state.auto_close {
                        debug!("queue drained, closing");
                        state.close_engine();
                    }
                    return;
                }
            },
        };

        let step = match &mut item {
            WorkItem::Raw(raw) => step_raw(state, raw),
            WorkItem::Statement(cell) => step_statement(state, cell),
            WorkItem::Iterator(cell) => step_iterator(state, cell),
        };

        match step {
            Step::Wait => {
                state.slot = Some(item);
                return;
            }
            Step::Again => state.slot = Some(item),
            Step::Release => trace!(kind = item.kind(), "active slot released"),
            Step::Failed(error) => {
                warn!(error = %error, "engine refused the request");
                state.slot = Some(item);
                state.pending = Pending::Query;
                apply_completion(state, Completion::error(error, true));
            }
        }
    }
}

fn submit(state: &mut ConnectionState, request: EngineRequest) -> Step {
    match &request {
        EngineRequest::Query { request, count } => {
            debug!(sql = sql_preview(&request.sql), count, skip = request.skip, "submitting query")
        }
        EngineRequest::Continue { count } => trace!(count, "submitting continuation"),
    }
    match state.engine.submit(request) {
        Ok(()) => {
            state.pending = Pending::Query;
            Step::Wait
        }
        Err(error) => Step::Failed(error),
    }
}

/// Ask the engine to tear down; returns whether an acknowledgement follows.
fn cancel(state: &mut ConnectionState, cancel_batch: bool) -> bool {
    let active = state.engine.cancel(cancel_batch);
    debug!(cancel_batch, active, "engine cancel requested");
    if active {
        state.pending = Pending::Cancel;
    }
    active
}

/// Cancel the call still running for the active item.
///
/// The call's completion is routed as usual; the slot stays busy until the
/// acknowledgement arrives.
pub(crate) fn force_cancel(state: &mut ConnectionState, cancel_batch: bool) {
    if state.pending != Pending::Query {
        return;
    }
    let active = state.engine.cancel(cancel_batch);
    debug!(cancel_batch, active, "running call cancelled");
    if active {
        state.pending = Pending::ForcedCancel;
    }
}

fn step_raw(state: &mut ConnectionState, raw: &mut RawRequest) -> Step {
    if raw.aborting {
        return if cancel(state, true) {
            Step::Wait
        } else {
            Step::Release
        };
    }
    let request = match raw.request.take() {
        Some(request) => EngineRequest::Query { request, count: 0 },
        None => EngineRequest::Continue { count: 0 },
    };
    submit(state, request)
}

fn step_statement(state: &mut ConnectionState, cell: &Arc<StatementCell>) -> Step {
    let mut st = cell.lock();
    if st.aborting {
        if st.started && cancel(state, true) {
            return Step::Wait;
        }
        debug!(sql = sql_preview(&st.sql), "statement abort finished");
        st.finish_abort();
        return Step::Release;
    }
    if st.done {
        return Step::Release;
    }
    if st.is_orphaned() {
        debug!(sql = sql_preview(&st.sql), "statement handle dropped, aborting");
        st.mark_aborted();
        st.aborting = true;
        return Step::Again;
    }
    submit_fetch(state, &mut st)
}

/// Submit the statement's next fetch, if it has one.
fn submit_fetch(state: &mut ConnectionState, st: &mut StatementState) -> Step {
    if st.active.is_some() {
        return Step::Wait;
    }
    let Some(fetch) = st.next_live_fetch() else {
        return Step::Wait;
    };
    let count = fetch.count.engine_count();
    let request = match st.request.take() {
        Some(request) => EngineRequest::Query { request, count },
        None => EngineRequest::Continue { count },
    };
    st.started = true;
    st.active = Some(fetch);
    submit(state, request)
}

fn step_iterator(state: &mut ConnectionState, cell: &Arc<IteratorCell>) -> Step {
    let mut it = cell.lock();
    if it.aborting {
        if cancel(state, true) {
            return Step::Wait;
        }
        debug!(sql = sql_preview(&it.sql), "iterator abort finished");
        it.finish_abort();
        return Step::Release;
    }
    if !it.done && it.is_orphaned() {
        debug!(sql = sql_preview(&it.sql), "iterator handle dropped, aborting batch");
        it.mark_aborted();
        it.aborting = true;
        return Step::Again;
    }

    if let Some(child) = it.current.clone() {
        let mut st = child.lock();
        if st.aborting {
            if st.started {
                if cancel(state, false) {
                    return Step::Wait;
                }
            } else if let Some(request) = st.request.take() {
                // Abandoned before the batch reached the engine: the next
                // statement submits the batch and skips this one.
                it.request = Some(request);
                it.skipped += 1;
            }
            st.finish_abort();
            drop(st);
            it.current = None;
            return Step::Again;
        }
        if st.done {
            drop(st);
            it.current = None;
            return Step::Again;
        }
        return submit_fetch(state, &mut st);
    }

    if it.done {
        it.settle_advances();
        return Step::Release;
    }

    let Some(advance) = it.next_live_advance() else {
        return Step::Wait;
    };
    let child = new_child(cell, &mut it);
    if advance.send(Ok(Some(child))).is_err() {
        trace!("advance dropped before it resolved, statement kept for resume");
    }
    Step::Again
}

/// Create the iterator's next statement and make it current.
fn new_child(cell: &Arc<IteratorCell>, it: &mut IteratorState) -> Arc<StatementCell> {
    let skipped = it.skipped;
    let request = it.request.take().map(|mut request| {
        request.skip = skipped;
        request
    });
    let index = it.yielded;
    it.yielded += 1;
    trace!(index, "iterator yields statement");

    let child = Arc::new(Mutex::new(StatementState::child(
        request,
        Arc::downgrade(cell),
        it.shape,
        it.cancel_scope,
        it.sql.clone(),
    )));
    it.current = Some(child.clone());
    child
}
