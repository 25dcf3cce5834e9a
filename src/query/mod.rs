//! Query handles and per-call options.
//!
//! # Overview
//!
//! The query module is organized into:
//! - `options` - Bind parameters, cancel scopes, fetch counts and per-call overrides
//! - `statement` - Single statement handles and row streams
//! - `iterator` - Batch handles yielding one statement at a time
//! - `batch` - Buffered results for callback-mode submissions

pub mod batch;
pub mod iterator;
pub mod options;
pub mod statement;

// Re-export commonly used types
pub use batch::{BatchOutcome, BatchResult};
pub use iterator::{Advance, StatementIterator, StatementStream};
pub use options::{CancelScope, FetchCount, Params, QueryOptions};
pub use statement::{Aborting, Fetch, RowStream, Statement};
