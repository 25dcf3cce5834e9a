//! Common test utilities for esqlite-rs integration tests.
//!
//! # Overview
//!
//! Every integration test runs against [`MemoryEngine`], which answers from
//! registered fixtures and records each call the scheduler makes. A test keeps
//! one clone of the engine for inspection and hands another to
//! [`Connection::open`].
//!
//! # Running Integration Tests
//!
//! ```bash
//! # Run all scheduler tests
//! cargo test --test scheduler_tests
//!
//! # Run a specific test
//! cargo test --test scheduler_tests test_batch_break_aborts_rest
//! ```

#![allow(dead_code)]

use esqlite_rs::engine::{EngineCall, Fixture, MemoryEngine};
use esqlite_rs::{Connection, ConnectionParams, Value};
use std::future::Future;
use std::time::Duration;

// ============================================================================
// Configuration
// ============================================================================

/// Upper bound for any single await in a test. Nothing in the memory engine
/// takes real time, so hitting it means a request was never answered.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Fixtures
// ============================================================================

/// Single-column fixture yielding `1..=n` in column `n`.
pub fn numbers(n: i64) -> Fixture {
    Fixture::rows(&["n"], (1..=n).map(|i| vec![Value::from(i)]).collect())
}

/// Engine preloaded with `(sql, fixture)` pairs.
pub fn engine_with(fixtures: Vec<(&str, Fixture)>) -> MemoryEngine {
    let engine = MemoryEngine::new();
    for (sql, fixture) in fixtures {
        engine.insert_fixture(sql, fixture);
    }
    engine
}

// ============================================================================
// Connection helpers
// ============================================================================

/// Open an in-memory connection on a clone of `engine`.
pub async fn open(engine: &MemoryEngine) -> Connection {
    let params: ConnectionParams = ":memory:".parse().expect("valid connection string");
    Connection::open(engine.clone(), params)
        .await
        .expect("memory engine opens")
}

/// Await `future`, failing the test if it does not resolve in time.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(STEP_TIMEOUT, future)
        .await
        .expect("request was never answered")
}

// ============================================================================
// Inspection helpers
// ============================================================================

/// Values of column `n` for each row.
pub fn column_n(rows: &[esqlite_rs::Row]) -> Vec<i64> {
    rows.iter()
        .filter_map(|row| row.get("n").and_then(Value::as_i64))
        .collect()
}

/// Every cancel call the engine saw, as `(cancel_batch, had_work)`.
pub fn cancels(engine: &MemoryEngine) -> Vec<(bool, bool)> {
    engine
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            EngineCall::Cancel {
                cancel_batch,
                had_work,
            } => Some((cancel_batch, had_work)),
            _ => None,
        })
        .collect()
}

/// Number of submit calls the engine saw.
pub fn submit_count(engine: &MemoryEngine) -> usize {
    engine.submissions().len()
}
