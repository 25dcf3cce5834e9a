//! Engine boundary.
//!
//! The scheduler talks to the execution engine only through the [`Engine`]
//! trait defined in [`protocol`]. [`memory::MemoryEngine`] is a scripted
//! implementation used for tests and examples.

pub mod memory;
pub mod protocol;

pub use memory::{EngineCall, Fixture, MemoryEngine};
pub use protocol::{
    BoundParams, Completion, Engine, EngineEvent, EngineRequest, EventSink, OpenFlags,
    PrepareFlags, QueryFlags, QueryRequest, QueryStatus, RawRow,
};
