//! Integration tests for the esqlite-rs request scheduler.
//!
//! # Overview
//!
//! These tests drive a [`Connection`] end to end against the scripted
//! [`MemoryEngine`]: requests go through the public handles, completions
//! come back through the dispatcher task, and the engine's call log is used
//! to check what the scheduler actually asked for.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test --test scheduler_tests
//! ```

mod common;

use common::{cancels, column_n, engine_with, numbers, open, submit_count, within};
use esqlite_rs::engine::{BoundParams, EngineCall, EngineRequest, Fixture, MemoryEngine, QueryFlags};
use esqlite_rs::{
    BatchOutcome, CancelScope, Connection, ConnectionError, ConnectionParams, EngineError,
    ErrorCode, EsqliteError, FetchCount, Params, QueryError, QueryOptions, SessionState,
    UsageError, Value,
};
use futures_util::StreamExt;
use std::sync::Arc;

// ============================================================================
// Ordering
// ============================================================================

#[tokio::test]
async fn test_statements_run_in_submission_order() {
    let engine = engine_with(vec![
        ("SELECT 'a'", numbers(1)),
        ("SELECT 'b'", numbers(2)),
        ("SELECT 'c'", numbers(3)),
    ]);
    let conn = open(&engine).await;

    let a = conn.submit_single("SELECT 'a'", QueryOptions::new()).unwrap();
    let b = conn.submit_single("SELECT 'b'", QueryOptions::new()).unwrap();
    let c = conn.submit_single("SELECT 'c'", QueryOptions::new()).unwrap();

    // Fetches are requested in reverse; execution order still follows
    // submission order.
    let fetch_c = c.execute(FetchCount::All);
    let fetch_b = b.execute(FetchCount::All);
    let fetch_a = a.execute(FetchCount::All);

    let rows_c = within(fetch_c).await.unwrap().unwrap();
    let rows_b = within(fetch_b).await.unwrap().unwrap();
    let rows_a = within(fetch_a).await.unwrap().unwrap();

    assert_eq!(column_n(&rows_a), vec![1]);
    assert_eq!(column_n(&rows_b), vec![1, 2]);
    assert_eq!(column_n(&rows_c), vec![1, 2, 3]);
    assert_eq!(
        engine.submitted_sql(),
        vec!["SELECT 'a'", "SELECT 'b'", "SELECT 'c'"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_tasks_share_connection() {
    let engine = MemoryEngine::new();
    for i in 1..=8 {
        engine.insert_fixture(&format!("SELECT {}", i), numbers(i));
    }
    let conn = Arc::new(open(&engine).await);

    let mut tasks = Vec::new();
    for i in 1..=8i64 {
        let conn = conn.clone();
        tasks.push(tokio::spawn(async move {
            let stmt = conn
                .submit_single(&format!("SELECT {}", i), QueryOptions::new())
                .unwrap();
            let mut seen = Vec::new();
            while let Some(row) = stmt.next_row().await.unwrap() {
                seen.push(row.get("n").and_then(Value::as_i64).unwrap());
            }
            (i, seen)
        }));
    }

    for task in tasks {
        let (i, seen) = within(task).await.unwrap();
        assert_eq!(seen, (1..=i).collect::<Vec<_>>());
    }
    assert_eq!(engine.submitted_sql().len(), 8);
}

// ============================================================================
// Statement fetches
// ============================================================================

#[tokio::test]
async fn test_five_rows_one_at_a_time() {
    let engine = engine_with(vec![("SELECT n FROM five", numbers(5))]);
    let conn = open(&engine).await;
    let stmt = conn
        .submit_single("SELECT n FROM five", QueryOptions::new())
        .unwrap();

    for expected in 1..=5 {
        let row = within(stmt.next_row()).await.unwrap().expect("a row");
        assert_eq!(row.get("n"), Some(&Value::from(expected)));
    }
    assert!(stmt.is_done());

    // Past the end every fetch resolves to None.
    assert!(within(stmt.next_row()).await.unwrap().is_none());
    assert!(within(stmt.execute(FetchCount::All)).await.unwrap().is_none());
    assert_eq!(stmt.columns(), Some(vec!["n".to_string()]));
}

#[tokio::test]
async fn test_fetch_in_batches() {
    let engine = engine_with(vec![("SELECT n FROM seven", numbers(7))]);
    let conn = open(&engine).await;
    let stmt = conn
        .submit_single("SELECT n FROM seven", QueryOptions::new())
        .unwrap();

    let mut sizes = Vec::new();
    let mut batches = stmt.iterate(FetchCount::rows(3).unwrap());
    while let Some(batch) = within(batches.next()).await {
        sizes.push(batch.unwrap().len());
    }
    drop(batches);

    assert_eq!(sizes, vec![3, 3, 1]);
    let counts: Vec<u32> = engine.submissions().iter().map(EngineRequest::count).collect();
    assert_eq!(counts, vec![3, 3, 3]);
}

#[tokio::test]
async fn test_named_params_reach_engine() {
    let sql = "SELECT n FROM events WHERE kind = :kind";
    let engine = engine_with(vec![(sql, numbers(1))]);
    let conn = open(&engine).await;

    let stmt = conn
        .submit_single(
            sql,
            QueryOptions::new().params(Params::named([("kind", "login")])),
        )
        .unwrap();
    within(stmt.fetch_all()).await.unwrap();

    let EngineRequest::Query { request, .. } = &engine.submissions()[0] else {
        panic!("first submission starts the statement");
    };
    assert!(request.flags.contains(QueryFlags::NAMED_PARAMS));
    assert!(request.flags.contains(QueryFlags::SINGLE));
    assert_eq!(
        request.params,
        BoundParams::Named(vec![(":kind".to_string(), Value::from("login"))])
    );
}

#[tokio::test]
async fn test_rows_serialize_by_shape() {
    let engine = engine_with(vec![(
        "SELECT id, name FROM users",
        Fixture::rows(
            &["id", "name"],
            vec![vec![Value::from(1), Value::from("ada")]],
        ),
    )]);
    let conn = open(&engine).await;

    let keyed = conn
        .submit_single("SELECT id, name FROM users", QueryOptions::new())
        .unwrap();
    let rows = within(keyed.fetch_all()).await.unwrap();
    assert_eq!(
        serde_json::to_value(&rows).unwrap(),
        serde_json::json!([{"id": 1, "name": "ada"}])
    );

    let array = conn
        .submit_single(
            "SELECT id, name FROM users",
            QueryOptions::new().rows_as_array(true),
        )
        .unwrap();
    let rows = within(array.fetch_all()).await.unwrap();
    assert_eq!(
        serde_json::to_value(&rows).unwrap(),
        serde_json::json!([[1, "ada"]])
    );
    let EngineRequest::Query { request, .. } = &engine.submissions()[1] else {
        panic!("second statement starts with a query");
    };
    assert!(request.flags.contains(QueryFlags::ROWS_AS_ARRAY));
}

#[tokio::test]
async fn test_engine_error_ends_only_that_statement() {
    let engine = engine_with(vec![
        ("SELECT broken", Fixture::error("SQLITE_ERROR", "no such column: broken")),
        ("SELECT n FROM ok", numbers(2)),
    ]);
    let conn = open(&engine).await;

    let broken = conn.submit_single("SELECT broken", QueryOptions::new()).unwrap();
    let ok = conn.submit_single("SELECT n FROM ok", QueryOptions::new()).unwrap();

    let err = within(broken.fetch_all()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Engine);
    assert_eq!(err.engine_code(), Some("SQLITE_ERROR"));
    // Later fetches report the same failure.
    assert_eq!(within(broken.next_row()).await.unwrap_err(), err);

    let rows = within(ok.fetch_all()).await.unwrap();
    assert_eq!(column_n(&rows), vec![1, 2]);
}

#[tokio::test]
async fn test_dropped_statement_releases_slot() {
    let engine = engine_with(vec![
        ("SELECT n FROM unused", numbers(3)),
        ("SELECT n FROM used", numbers(1)),
    ]);
    let conn = open(&engine).await;

    drop(conn.submit_single("SELECT n FROM unused", QueryOptions::new()).unwrap());
    let rows = within(
        conn.submit_single("SELECT n FROM used", QueryOptions::new())
            .unwrap()
            .fetch_all(),
    )
    .await
    .unwrap();

    assert_eq!(column_n(&rows), vec![1]);
    assert_eq!(engine.submitted_sql(), vec!["SELECT n FROM used"]);
}

// ============================================================================
// Statement abort
// ============================================================================

#[tokio::test]
async fn test_abort_queued_statement_never_runs() {
    let engine = engine_with(vec![
        ("SELECT n FROM first", numbers(3)),
        ("SELECT n FROM second", numbers(3)),
    ]);
    let conn = open(&engine).await;

    let first = conn
        .submit_single("SELECT n FROM first", QueryOptions::new())
        .unwrap();
    let second = conn
        .submit_single("SELECT n FROM second", QueryOptions::new())
        .unwrap();

    let row = within(first.next_row()).await.unwrap().unwrap();
    assert_eq!(row.get("n"), Some(&Value::from(1)));

    let queued = second.execute(FetchCount::All);
    within(second.abort()).await;

    assert_eq!(within(queued).await.unwrap_err(), QueryError::Aborted);
    assert!(second.is_done());
    assert!(within(second.next_row()).await.unwrap_err().is_aborted());

    let rest = within(first.fetch_all()).await.unwrap();
    assert_eq!(column_n(&rest), vec![2, 3]);
    assert_eq!(engine.submitted_sql(), vec!["SELECT n FROM first"]);
    assert!(cancels(&engine).is_empty());
}

#[tokio::test]
async fn test_abort_started_statement_cancels_once() {
    let engine = engine_with(vec![
        ("SELECT n FROM big", numbers(100)),
        ("SELECT n FROM after", numbers(1)),
    ]);
    let conn = open(&engine).await;

    let big = conn.submit_single("SELECT n FROM big", QueryOptions::new()).unwrap();
    within(big.next_row()).await.unwrap().unwrap();

    let first = big.abort();
    let second = big.abort();
    within(first).await;
    within(second).await;
    within(big.abort()).await;

    assert_eq!(cancels(&engine), vec![(true, true)]);
    assert_eq!(within(big.next_row()).await.unwrap_err(), QueryError::Aborted);

    // The slot is free again.
    let after = conn
        .submit_single("SELECT n FROM after", QueryOptions::new())
        .unwrap();
    assert_eq!(column_n(&within(after.fetch_all()).await.unwrap()), vec![1]);
}

#[tokio::test]
async fn test_abort_running_call_cancels_engine() {
    let engine = engine_with(vec![
        ("SELECT forever()", Fixture::Stall),
        ("SELECT n FROM t", numbers(1)),
    ]);
    let conn = open(&engine).await;

    let stuck = conn
        .submit_single("SELECT forever()", QueryOptions::new())
        .unwrap();
    let running = stuck.execute(FetchCount::All);
    let queued = stuck.execute(FetchCount::All);
    assert!(engine.is_stalled());

    within(stuck.abort()).await;

    assert!(stuck.is_done());
    assert_eq!(cancels(&engine), vec![(true, true)]);
    // The call in flight reports how it ended; later fetches see the abort.
    let err = within(running).await.unwrap_err();
    assert_eq!(err.engine_code(), Some("SQLITE_INTERRUPT"));
    assert_eq!(within(queued).await.unwrap_err(), QueryError::Aborted);

    let after = conn.submit_single("SELECT n FROM t", QueryOptions::new()).unwrap();
    assert_eq!(column_n(&within(after.fetch_all()).await.unwrap()), vec![1]);
}

#[tokio::test]
async fn test_abort_finished_statement_is_noop() {
    let engine = engine_with(vec![("SELECT n FROM one", numbers(1))]);
    let conn = open(&engine).await;

    let stmt = conn.submit_single("SELECT n FROM one", QueryOptions::new()).unwrap();
    within(stmt.fetch_all()).await.unwrap();
    within(stmt.abort()).await;

    assert!(cancels(&engine).is_empty());
    assert!(within(stmt.next_row()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_row_loop_break_aborts_by_default() {
    let engine = engine_with(vec![("SELECT n FROM many", numbers(10))]);
    let conn = open(&engine).await;
    let stmt = conn.submit_single("SELECT n FROM many", QueryOptions::new()).unwrap();

    let mut rows = stmt.rows();
    while let Some(batch) = within(rows.next()).await {
        if batch.unwrap()[0].get("n") == Some(&Value::from(2)) {
            break;
        }
    }
    drop(rows);

    within(stmt.abort()).await;
    assert!(stmt.is_done());
    assert_eq!(within(stmt.next_row()).await.unwrap_err(), QueryError::Aborted);
    assert_eq!(cancels(&engine), vec![(true, true)]);
}

#[tokio::test]
async fn test_row_loop_break_with_none_scope_resumes() {
    let engine = engine_with(vec![("SELECT n FROM many", numbers(4))]);
    let conn = open(&engine).await;
    let stmt = conn
        .submit_single(
            "SELECT n FROM many",
            QueryOptions::new().cancel_scope(CancelScope::None),
        )
        .unwrap();

    let mut rows = stmt.rows();
    let first = within(rows.next()).await.unwrap().unwrap();
    assert_eq!(column_n(&first), vec![1]);
    drop(rows);

    assert!(!stmt.is_done());
    let rest = within(stmt.fetch_all()).await.unwrap();
    assert_eq!(column_n(&rest), vec![2, 3, 4]);
    assert!(cancels(&engine).is_empty());
}

// ============================================================================
// Statement iterators
// ============================================================================

#[tokio::test]
async fn test_batch_yields_each_statement() {
    let engine = engine_with(vec![
        ("SELECT 1", numbers(1)),
        ("SELECT 2", numbers(2)),
        ("SELECT 3", numbers(3)),
    ]);
    let conn = open(&engine).await;
    let mut batch = conn
        .submit_batch("SELECT 1; SELECT 2; SELECT 3", QueryOptions::new())
        .unwrap();

    let mut counts = Vec::new();
    let mut statements = batch.statements();
    while let Some(stmt) = within(statements.next()).await {
        let rows = within(stmt.unwrap().fetch_all()).await.unwrap();
        counts.push(rows.len());
    }
    drop(statements);

    assert_eq!(counts, vec![1, 2, 3]);
    assert!(batch.is_done());
    assert!(within(batch.next()).await.unwrap().is_none());
    // One query, then one continue per following statement.
    assert_eq!(submit_count(&engine), 3);
    assert_eq!(engine.submitted_sql().len(), 1);
}

#[tokio::test]
async fn test_batch_break_aborts_rest() {
    let engine = engine_with(vec![
        ("SELECT 1", numbers(2)),
        ("SELECT 2", numbers(2)),
    ]);
    let conn = open(&engine).await;
    let mut batch = conn
        .submit_batch("SELECT 1; SELECT 2", QueryOptions::new())
        .unwrap();

    let mut statements = batch.statements();
    while let Some(stmt) = within(statements.next()).await {
        let stmt = stmt.unwrap();
        let mut rows = stmt.rows();
        if within(rows.next()).await.is_some() {
            break;
        }
    }
    drop(statements);
    within(batch.abort()).await;

    assert!(batch.is_done());
    assert_eq!(
        within(batch.next()).await.unwrap_err(),
        QueryError::IteratorAborted
    );
    assert_eq!(cancels(&engine), vec![(true, true)]);
    // The second statement never started.
    assert_eq!(submit_count(&engine), 1);
}

#[tokio::test]
async fn test_batch_break_with_none_scope_resumes_same_statement() {
    let engine = engine_with(vec![
        ("SELECT 1", numbers(3)),
        ("SELECT 2", numbers(2)),
    ]);
    let conn = open(&engine).await;
    let mut batch = conn
        .submit_batch(
            "SELECT 1; SELECT 2",
            QueryOptions::new().cancel_scope(CancelScope::None),
        )
        .unwrap();

    let mut statements = batch.statements();
    let first = within(statements.next()).await.unwrap().unwrap();
    let row = within(first.next_row()).await.unwrap().unwrap();
    assert_eq!(row.get("n"), Some(&Value::from(1)));
    drop(first);
    drop(statements);

    let mut statements = batch.statements();
    let again = within(statements.next()).await.unwrap().unwrap();
    assert_eq!(column_n(&within(again.fetch_all()).await.unwrap()), vec![2, 3]);

    let second = within(statements.next()).await.unwrap().unwrap();
    assert_eq!(column_n(&within(second.fetch_all()).await.unwrap()), vec![1, 2]);
    assert!(within(statements.next()).await.is_none());
    drop(statements);

    assert!(batch.is_done());
    assert!(cancels(&engine).is_empty());
}

#[tokio::test]
async fn test_advance_abandons_unfinished_statement() {
    let engine = engine_with(vec![
        ("SELECT 1", numbers(5)),
        ("SELECT 2", numbers(2)),
    ]);
    let conn = open(&engine).await;
    let batch = conn
        .submit_batch(
            "SELECT 1; SELECT 2",
            QueryOptions::new().cancel_scope(CancelScope::Current),
        )
        .unwrap();

    let first = within(batch.next()).await.unwrap().unwrap();
    within(first.next_row()).await.unwrap().unwrap();

    let second = within(batch.next()).await.unwrap().unwrap();
    assert_eq!(within(first.next_row()).await.unwrap_err(), QueryError::Aborted);
    assert_ne!(first, second);

    // Only the current statement was cancelled; the batch went on.
    assert_eq!(cancels(&engine), vec![(false, true)]);
    assert_eq!(column_n(&within(second.fetch_all()).await.unwrap()), vec![1, 2]);
    assert!(within(batch.next()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_advance_cancels_running_statement() {
    let engine = engine_with(vec![
        ("SELECT forever()", Fixture::Stall),
        ("SELECT 2", numbers(2)),
    ]);
    let conn = open(&engine).await;
    let batch = conn
        .submit_batch(
            "SELECT forever(); SELECT 2",
            QueryOptions::new().cancel_scope(CancelScope::Current),
        )
        .unwrap();

    let first = within(batch.next()).await.unwrap().unwrap();
    let running = first.execute(FetchCount::All);
    assert!(engine.is_stalled());

    let second = within(batch.next()).await.unwrap().unwrap();

    let err = within(running).await.unwrap_err();
    assert_eq!(err.engine_code(), Some("SQLITE_INTERRUPT"));
    assert!(first.is_done());
    assert_eq!(cancels(&engine), vec![(false, true)]);
    assert_eq!(column_n(&within(second.fetch_all()).await.unwrap()), vec![1, 2]);
    assert!(within(batch.next()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_abort_iterator_with_running_call() {
    let engine = engine_with(vec![
        ("SELECT forever()", Fixture::Stall),
        ("SELECT 2", numbers(2)),
    ]);
    let conn = open(&engine).await;
    let batch = conn
        .submit_batch("SELECT forever(); SELECT 2", QueryOptions::new())
        .unwrap();

    let first = within(batch.next()).await.unwrap().unwrap();
    let running = first.execute(FetchCount::All);
    assert!(engine.is_stalled());

    within(batch.abort()).await;

    assert!(batch.is_done());
    assert!(within(running).await.is_err());
    assert_eq!(cancels(&engine), vec![(true, true)]);
    assert_eq!(submit_count(&engine), 1);
}

#[tokio::test]
async fn test_batch_break_with_current_scope_aborts_statement() {
    let engine = engine_with(vec![
        ("SELECT 1", numbers(3)),
        ("SELECT 2", numbers(2)),
    ]);
    let conn = open(&engine).await;
    let mut batch = conn
        .submit_batch(
            "SELECT 1; SELECT 2",
            QueryOptions::new().cancel_scope(CancelScope::Current),
        )
        .unwrap();

    let mut statements = batch.statements();
    let first = within(statements.next()).await.unwrap().unwrap();
    within(first.execute(FetchCount::one())).await.unwrap().unwrap();
    drop(statements);

    assert!(first.is_done());
    assert_eq!(within(first.next_row()).await.unwrap_err(), QueryError::Aborted);
    assert!(!batch.is_done());

    // The rest of the batch is still there.
    let second = within(batch.next()).await.unwrap().unwrap();
    assert_eq!(column_n(&within(second.fetch_all()).await.unwrap()), vec![1, 2]);
    assert_eq!(cancels(&engine), vec![(false, true)]);
}

#[tokio::test]
async fn test_advance_skips_statement_never_started() {
    let engine = engine_with(vec![
        ("SELECT 1", numbers(5)),
        ("SELECT 2", numbers(2)),
    ]);
    let conn = open(&engine).await;
    let batch = conn
        .submit_batch("SELECT 1; SELECT 2", QueryOptions::new())
        .unwrap();

    let skipped = within(batch.next()).await.unwrap().unwrap();
    let second = within(batch.next()).await.unwrap().unwrap();
    assert!(skipped.is_done());

    assert_eq!(column_n(&within(second.fetch_all()).await.unwrap()), vec![1, 2]);
    let EngineRequest::Query { request, .. } = &engine.submissions()[0] else {
        panic!("the batch starts with a query");
    };
    assert_eq!(request.skip, 1);
    assert!(cancels(&engine).is_empty());
}

#[tokio::test]
async fn test_batch_error_reported_by_its_statement() {
    let engine = engine_with(vec![
        ("SELECT 1", numbers(1)),
        ("SELECT oops", Fixture::error("SQLITE_ERROR", "no such column: oops")),
        ("SELECT 3", numbers(3)),
    ]);
    let conn = open(&engine).await;
    let batch = conn
        .submit_batch("SELECT 1; SELECT oops; SELECT 3", QueryOptions::new())
        .unwrap();

    let first = within(batch.next()).await.unwrap().unwrap();
    assert_eq!(column_n(&within(first.fetch_all()).await.unwrap()), vec![1]);

    let failing = within(batch.next()).await.unwrap().unwrap();
    let err = within(failing.fetch_all()).await.unwrap_err();
    assert_eq!(err.engine_code(), Some("SQLITE_ERROR"));
    assert!(!batch.is_done());

    let third = within(batch.next()).await.unwrap().unwrap();
    assert_eq!(column_n(&within(third.fetch_all()).await.unwrap()), vec![1, 2, 3]);
    assert!(within(batch.next()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_dropped_iterator_releases_slot() {
    let engine = engine_with(vec![
        ("SELECT 1", numbers(1)),
        ("SELECT n FROM t", numbers(2)),
    ]);
    let conn = open(&engine).await;

    drop(conn.submit_batch("SELECT 1; SELECT 1", QueryOptions::new()).unwrap());
    let stmt = conn.submit_single("SELECT n FROM t", QueryOptions::new()).unwrap();

    assert_eq!(column_n(&within(stmt.fetch_all()).await.unwrap()), vec![1, 2]);
    assert_eq!(engine.submitted_sql(), vec!["SELECT n FROM t"]);
}

// ============================================================================
// Callback mode
// ============================================================================

#[tokio::test]
async fn test_query_runs_first_statement_only() {
    let engine = engine_with(vec![("SELECT 1", numbers(2)), ("SELECT 2", numbers(2))]);
    let conn = open(&engine).await;

    let result = within(conn.query("SELECT 1; SELECT 2", QueryOptions::new()).unwrap()).await;
    let BatchOutcome::Rows(rows) = result.unwrap() else {
        panic!("single mode yields plain rows");
    };
    assert_eq!(column_n(&rows), vec![1, 2]);
    assert_eq!(submit_count(&engine), 1);
}

#[tokio::test]
async fn test_callback_receives_result_once() {
    let engine = engine_with(vec![("SELECT n FROM t", numbers(3))]);
    let conn = open(&engine).await;

    let (tx, rx) = tokio::sync::oneshot::channel();
    conn.submit_callback("SELECT n FROM t", QueryOptions::new(), move |result| {
        let _ = tx.send(result);
    })
    .unwrap();

    let outcome = within(rx).await.unwrap().unwrap();
    assert_eq!(outcome.statement_count(), 1);
    assert_eq!(column_n(outcome.rows().unwrap()), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_continue_on_error_reports_every_statement() {
    let engine = engine_with(vec![("SELECT 1", numbers(1)), ("SELECT 2", numbers(2))]);
    let conn = open(&engine).await;

    let result = within(
        conn.query(
            "SELECT 1; SELECT nope; SELECT 2",
            QueryOptions::new().single(false).continue_on_error(true),
        )
        .unwrap(),
    )
    .await;
    let outcome = result.unwrap();
    let sets = outcome.sets().expect("one result per statement");

    assert_eq!(sets.len(), 3);
    assert_eq!(column_n(sets[0].as_ref().unwrap()), vec![1]);
    assert_eq!(
        sets[1].as_ref().unwrap_err().engine_code(),
        Some("SQLITE_ERROR")
    );
    assert_eq!(column_n(sets[2].as_ref().unwrap()), vec![1, 2]);
}

#[tokio::test]
async fn test_batch_query_stops_at_first_error() {
    let engine = engine_with(vec![
        ("SELECT 1", numbers(1)),
        ("SELECT 2", numbers(2)),
        ("SELECT n FROM after", numbers(1)),
    ]);
    let conn = open(&engine).await;

    let result = within(
        conn.query("SELECT 1; SELECT nope; SELECT 2", QueryOptions::new().single(false))
            .unwrap(),
    )
    .await;
    assert_eq!(result.unwrap_err().engine_code(), Some("SQLITE_ERROR"));

    // The rest of the batch was cancelled and the slot released.
    let after = conn
        .submit_single("SELECT n FROM after", QueryOptions::new())
        .unwrap();
    assert_eq!(column_n(&within(after.fetch_all()).await.unwrap()), vec![1]);
    assert_eq!(cancels(&engine), vec![(true, true)]);
}

// ============================================================================
// Interrupt
// ============================================================================

#[tokio::test]
async fn test_interrupt_stops_running_call() {
    let engine = engine_with(vec![
        ("SELECT forever()", Fixture::Stall),
        ("SELECT n FROM t", numbers(1)),
    ]);
    let conn = open(&engine).await;

    let stuck = conn
        .submit_single("SELECT forever()", QueryOptions::new())
        .unwrap();
    let fetch = stuck.execute(FetchCount::All);
    let next = conn.submit_single("SELECT n FROM t", QueryOptions::new()).unwrap();
    let queued = next.execute(FetchCount::All);
    assert!(engine.is_stalled());

    within(conn.interrupt()).await;

    let err = within(fetch).await.unwrap_err();
    assert_eq!(err.engine_code(), Some("SQLITE_INTERRUPT"));
    assert_eq!(column_n(&within(queued).await.unwrap().unwrap()), vec![1]);
}

#[tokio::test]
async fn test_interrupt_when_idle_resolves() {
    let engine = MemoryEngine::new();
    let conn = open(&engine).await;

    within(conn.interrupt()).await;
    assert!(engine.calls().contains(&EngineCall::Interrupt));
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_open_failure() {
    let engine = MemoryEngine::new();
    engine.fail_open(EngineError::new("SQLITE_CANTOPEN", "unable to open database file"));

    let params: ConnectionParams = "file:/nonexistent/app.db?mode=ro".parse().unwrap();
    let err = Connection::open(engine.clone(), params).await.unwrap_err();

    assert!(matches!(err, ConnectionError::OpenFailed { ref path, .. } if path == "/nonexistent/app.db"));
    assert_eq!(err.code(), ErrorCode::Connection);
}

#[tokio::test]
async fn test_close_fails_outstanding_requests() {
    let engine = engine_with(vec![
        ("SELECT forever()", Fixture::Stall),
        ("SELECT n FROM t", numbers(1)),
    ]);
    let conn = open(&engine).await;

    let stuck = conn
        .submit_single("SELECT forever()", QueryOptions::new())
        .unwrap();
    let running = stuck.execute(FetchCount::All);
    let queued_stmt = conn.submit_single("SELECT n FROM t", QueryOptions::new()).unwrap();
    let queued = queued_stmt.execute(FetchCount::All);
    let raw = conn.query("SELECT n FROM t", QueryOptions::new()).unwrap();

    conn.close();

    assert_eq!(within(running).await.unwrap_err(), QueryError::ConnectionClosed);
    assert_eq!(within(queued).await.unwrap_err(), QueryError::ConnectionClosed);
    assert_eq!(within(raw).await.unwrap_err(), QueryError::ConnectionClosed);
    assert!(conn.is_closed());
    assert_eq!(engine.calls().last(), Some(&EngineCall::Close));
}

#[tokio::test]
async fn test_submit_after_close_is_not_open() {
    let engine = MemoryEngine::new();
    let conn = open(&engine).await;
    conn.close();

    let err = conn
        .submit_single("SELECT 1", QueryOptions::new())
        .unwrap_err();
    assert!(matches!(err, EsqliteError::Connection(ConnectionError::NotOpen)));
    assert_eq!(err.code(), ErrorCode::NotOpen);

    assert!(conn.submit_batch("SELECT 1", QueryOptions::new()).is_err());
    assert!(conn.query("SELECT 1", QueryOptions::new()).is_err());
    assert!(matches!(
        conn.auto_commit_enabled(),
        Err(ConnectionError::NotOpen)
    ));
    // Interrupting a closed connection resolves without touching the engine.
    within(conn.interrupt()).await;
    assert!(!engine.calls().contains(&EngineCall::Interrupt));
}

#[tokio::test]
async fn test_drain_and_close_waits_for_queue() {
    let engine = engine_with(vec![
        ("SELECT n FROM a", numbers(2)),
        ("SELECT n FROM b", numbers(1)),
    ]);
    let conn = open(&engine).await;

    let a = conn.submit_single("SELECT n FROM a", QueryOptions::new()).unwrap();
    let drained = conn.drain_and_close();
    assert_eq!(conn.session_state(), SessionState::Draining);

    // Still accepted while draining.
    let b = conn.submit_single("SELECT n FROM b", QueryOptions::new()).unwrap();
    let rows_b = b.execute(FetchCount::All);

    assert_eq!(column_n(&within(a.fetch_all()).await.unwrap()), vec![1, 2]);
    assert_eq!(column_n(&within(rows_b).await.unwrap().unwrap()), vec![1]);

    within(drained).await;
    assert!(conn.is_closed());
    assert!(engine.calls().contains(&EngineCall::Close));
}

#[tokio::test]
async fn test_drain_idle_connection_closes_immediately() {
    let engine = MemoryEngine::new();
    let conn = open(&engine).await;

    within(conn.drain_and_close()).await;
    assert!(conn.is_closed());
    // A second drain resolves at once.
    within(conn.drain_and_close()).await;
}

#[tokio::test]
async fn test_auto_commit_reported_by_engine() {
    let engine = MemoryEngine::new();
    let conn = open(&engine).await;
    assert!(conn.auto_commit_enabled().unwrap());

    engine.set_auto_commit(false);
    assert!(!conn.auto_commit_enabled().unwrap());
}

// ============================================================================
// Usage errors
// ============================================================================

#[tokio::test]
async fn test_usage_errors_are_synchronous() {
    let engine = MemoryEngine::new();
    let conn = open(&engine).await;

    let err = conn
        .submit_single("SELECT 1\0", QueryOptions::new())
        .unwrap_err();
    assert!(matches!(err, EsqliteError::Usage(UsageError::InvalidSql(_))));
    assert_eq!(err.code(), ErrorCode::Usage);

    let err = conn
        .submit_single(
            "SELECT :x",
            QueryOptions::new().params(Params::named([("", 1)])),
        )
        .unwrap_err();
    assert!(matches!(err, EsqliteError::Usage(UsageError::InvalidParameters(_))));

    assert!(matches!(
        FetchCount::rows(0),
        Err(UsageError::InvalidRowCount(0))
    ));
    assert!(FetchCount::rows(u64::from(u32::MAX) + 1).is_err());

    assert_eq!(submit_count(&engine), 0);
}
