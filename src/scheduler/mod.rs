//! Request scheduling.
//!
//! Serializes every statement, iterator and callback-mode request of a
//! connection onto the engine, one call at a time. [`state`] holds the data,
//! [`process`] decides what runs next, [`dispatch`] routes engine events back
//! to the waiting callers and [`abort`] handles cooperative cancellation.

pub(crate) mod abort;
pub(crate) mod dispatch;
pub(crate) mod process;
pub(crate) mod state;
