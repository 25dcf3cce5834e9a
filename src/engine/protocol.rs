//! Engine handle abstraction trait.
//!
//! This module defines the `Engine` trait, the narrow contract through which
//! the scheduler drives the single-operation SQL execution engine, together
//! with the request and completion types that cross that boundary.
//!
//! The contract is callback shaped: `submit` and `cancel` return at once and
//! the engine later reports through the [`EventSink`] handed to it on open.
//! An engine must never report synchronously from inside one of its own
//! methods in a way that expects the scheduler to observe the event before
//! the method returns; the sink only queues events.

use crate::error::EngineError;
use crate::types::Value;
use std::fmt;
use std::ops::BitOr;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

macro_rules! flag_set {
    ($(#[$meta:meta])* $name:ident { $($(#[$fmeta:meta])* $flag:ident = $value:expr,)* }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(u32);

        impl $name {
            $($(#[$fmeta])* pub const $flag: Self = Self($value);)*

            const ALL: u32 = 0 $(| $value)*;

            /// Empty flag set.
            pub const fn empty() -> Self {
                Self(0)
            }

            /// Build from raw bits, dropping unknown bits.
            pub const fn from_bits_truncate(bits: u32) -> Self {
                Self(bits & Self::ALL)
            }

            /// Raw bit value.
            pub const fn bits(self) -> u32 {
                self.0
            }

            /// Check whether every bit of `other` is set.
            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            /// Set or clear the bits of `other`.
            pub fn set(&mut self, other: Self, on: bool) {
                if on {
                    self.0 |= other.0;
                } else {
                    self.0 &= !other.0;
                }
            }
        }

        impl BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let names: Vec<&str> = [$((stringify!($flag), $value)),*]
                    .iter()
                    .filter(|(_, bits)| self.0 & bits == *bits)
                    .map(|(name, _)| *name)
                    .collect();
                write!(f, "{}({})", stringify!($name), names.join(" | "))
            }
        }
    };
}

flag_set! {
    /// Engine open modes.
    OpenFlags {
        /// Open read-only
        READONLY = 0x0000_0001,
        /// Open read-write
        READWRITE = 0x0000_0002,
        /// Create the database if missing
        CREATE = 0x0000_0004,
        /// Purely in-memory database
        MEMORY = 0x0000_0080,
        /// Shared cache mode
        SHAREDCACHE = 0x0002_0000,
        /// Private cache mode
        PRIVATECACHE = 0x0004_0000,
        /// Refuse to follow symbolic links
        NOFOLLOW = 0x0100_0000,
    }
}

flag_set! {
    /// Statement preparation flags.
    PrepareFlags {
        /// Refuse to prepare statements that use virtual tables
        NO_VTAB = 0x04,
    }
}

flag_set! {
    /// Per-request result flags.
    QueryFlags {
        /// Only the first statement of the SQL text runs
        SINGLE = 0x01,
        /// Bind values are `:name`/value pairs
        NAMED_PARAMS = 0x02,
        /// Rows are produced as arrays rather than keyed records
        ROWS_AS_ARRAY = 0x04,
    }
}

impl OpenFlags {
    /// Default open mode: read-write, creating the database if needed.
    pub const DEFAULT: Self = Self(Self::READWRITE.0 | Self::CREATE.0);
}

/// Bind values in the form the engine consumes.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum BoundParams {
    /// No bind values
    #[default]
    None,
    /// Values bound by position across the whole batch
    Positional(Vec<Value>),
    /// `:name`/value pairs bound by placeholder name
    Named(Vec<(String, Value)>),
}

impl BoundParams {
    /// Check if there are no bind values.
    pub fn is_empty(&self) -> bool {
        match self {
            BoundParams::None => true,
            BoundParams::Positional(v) => v.is_empty(),
            BoundParams::Named(v) => v.is_empty(),
        }
    }
}

/// The full payload of a first submission.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    /// SQL text, possibly several `;`-separated statements
    pub sql: String,
    /// Preparation flags
    pub prepare_flags: PrepareFlags,
    /// Result flags
    pub flags: QueryFlags,
    /// Bind values
    pub params: BoundParams,
    /// Leading statements of the batch to skip without executing them
    pub skip: usize,
}

/// One call into the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineRequest {
    /// Start a new unit of work and fetch up to `count` rows
    Query {
        /// Full request payload
        request: QueryRequest,
        /// Requested rows, 0 meaning all
        count: u32,
    },
    /// Continue the current unit: fetch up to `count` more rows of the
    /// current statement, or start the next statement once it finished
    Continue {
        /// Requested rows, 0 meaning all
        count: u32,
    },
}

impl EngineRequest {
    /// Requested row count, 0 meaning all.
    pub fn count(&self) -> u32 {
        match self {
            EngineRequest::Query { count, .. } | EngineRequest::Continue { count } => *count,
        }
    }
}

/// Raw result row as produced by the engine.
pub type RawRow = Vec<Value>;

/// Outcome of one engine call, with its payload.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryStatus {
    /// The requested rows are ready and the statement has more
    Incomplete(Vec<RawRow>),
    /// The statement finished; these are its final rows
    Complete(Vec<RawRow>),
    /// The statement failed
    Error(EngineError),
    /// The submitted unit has no (more) statements
    Done,
}

impl QueryStatus {
    /// Whether this status ends the current statement.
    pub fn ends_statement(&self) -> bool {
        !matches!(self, QueryStatus::Incomplete(_))
    }
}

/// A completion report for the outstanding engine call.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// Status and payload
    pub status: QueryStatus,
    /// Whether the current statement is the last of the submitted batch
    pub last_statement: bool,
    /// Column names of the current statement, if known
    pub columns: Option<Vec<String>>,
}

impl Completion {
    /// A `Done` completion.
    pub fn done() -> Self {
        Self {
            status: QueryStatus::Done,
            last_statement: true,
            columns: None,
        }
    }

    /// An error completion.
    pub fn error(error: EngineError, last_statement: bool) -> Self {
        Self {
            status: QueryStatus::Error(error),
            last_statement,
            columns: None,
        }
    }

    /// Whether the whole submitted unit is finished.
    pub fn ends_batch(&self) -> bool {
        matches!(self.status, QueryStatus::Done)
            || (self.status.ends_statement() && self.last_statement)
    }
}

/// Events flowing from the engine back to the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// The outstanding call completed
    Status(Completion),
    /// A cancel that returned `true` finished tearing down
    Cancelled,
}

/// Where an engine reports completions and cancel acknowledgements.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EventSink {
    /// Create a sink and the receiving end the dispatcher drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Report a completion for the outstanding call.
    pub fn status(&self, completion: Completion) {
        self.send(EngineEvent::Status(completion));
    }

    /// Acknowledge a cancel.
    pub fn cancelled(&self) {
        self.send(EngineEvent::Cancelled);
    }

    fn send(&self, event: EngineEvent) {
        if self.tx.send(event).is_err() {
            trace!("engine event dropped, dispatcher is gone");
        }
    }
}

/// Engine handle trait for the scheduler.
///
/// The engine runs at most one call at a time; the scheduler guarantees it
/// never submits while a call is outstanding.
pub trait Engine: Send {
    /// Open the database.
    ///
    /// # Arguments
    ///
    /// * `path` - Database path
    /// * `flags` - Open mode
    /// * `events` - Sink for every later completion and acknowledgement
    ///
    /// # Errors
    ///
    /// Returns `EngineError` if the database cannot be opened.
    fn open(&mut self, path: &str, flags: OpenFlags, events: EventSink)
        -> Result<(), EngineError>;

    /// Submit a request.
    ///
    /// Exactly one `EngineEvent::Status` is reported per accepted request.
    ///
    /// # Errors
    ///
    /// Returns `EngineError` when the request is refused outright; no event
    /// follows in that case.
    fn submit(&mut self, request: EngineRequest) -> Result<(), EngineError>;

    /// Tear down the partially executed statement, or the whole batch when
    /// `cancel_batch` is set.
    ///
    /// Returns whether there was anything to tear down. When `true`, exactly
    /// one `EngineEvent::Cancelled` follows. A status for a call that was in
    /// flight is reported before that acknowledgement, never after it.
    fn cancel(&mut self, cancel_batch: bool) -> bool;

    /// Force the in-flight call, if any, to stop now. The call reports an
    /// error through the normal status path; `done` fires once the interrupt
    /// was delivered.
    fn interrupt(&mut self, done: oneshot::Sender<()>);

    /// Whether the engine is in autocommit mode.
    fn auto_commit_enabled(&self) -> bool;

    /// Close the database. Pending state is discarded and no further events
    /// are reported.
    fn close(&mut self);
}
