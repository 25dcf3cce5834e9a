//! # esqlite-rs
//!
//! Asynchronous request scheduler for embedded SQL engines that can run only
//! one operation at a time.
//!
//! Callers get independent, cancellable handles ([`Statement`],
//! [`StatementIterator`], callback-mode submissions) that can be created
//! and awaited concurrently; underneath, every request is queued on the
//! [`Connection`] and handed to the [`Engine`] strictly one call at a time, in
//! submission order.
//!
//! ## Example
//!
//! ```
//! use esqlite_rs::engine::{Fixture, MemoryEngine};
//! use esqlite_rs::{CancelScope, Connection, ConnectionParams, Params, QueryOptions, Value};
//! use futures_util::StreamExt;
//!
//! # async fn example() -> Result<(), esqlite_rs::EsqliteError> {
//! let engine = MemoryEngine::new().with_fixture(
//!     "SELECT id FROM events WHERE kind = :kind",
//!     Fixture::rows(&["id"], (1..=5).map(|id| vec![Value::from(id)]).collect()),
//! );
//! let conn = Connection::open(engine, "file::memory:?mode=memory".parse::<ConnectionParams>()?).await?;
//!
//! // Queue a statement; nothing runs until rows are requested.
//! let stmt = conn.submit_single(
//!     "SELECT id FROM events WHERE kind = :kind",
//!     QueryOptions::new()
//!         .params(Params::named([("kind", "login")]))
//!         .cancel_scope(CancelScope::All),
//! )?;
//!
//! // Stream rows one at a time; leaving the loop early aborts the statement.
//! let mut rows = stmt.rows();
//! while let Some(batch) = rows.next().await {
//!     let batch = batch?;
//!     if batch[0].get("id") == Some(&Value::from(3)) {
//!         break;
//!     }
//! }
//! drop(rows);
//! assert!(stmt.is_done());
//!
//! conn.close();
//! # Ok(())
//! # }
//! ```

// Module declarations
pub mod connection;
pub mod engine;
pub mod error;
pub mod query;
pub(crate) mod scheduler;
pub mod types;

// Re-export public API
pub use connection::{Connection, ConnectionBuilder, ConnectionParams, SessionState};
pub use engine::{Engine, OpenFlags, PrepareFlags};
pub use error::{ConnectionError, EngineError, ErrorCode, EsqliteError, QueryError, UsageError};
pub use query::{
    Aborting, Advance, BatchOutcome, BatchResult, CancelScope, Fetch, FetchCount, Params,
    QueryOptions, RowStream, Statement, StatementIterator, StatementStream,
};
pub use types::{Columns, Row, RowShape, Value};
