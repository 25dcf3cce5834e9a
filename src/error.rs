//! Error types for esqlite-rs.
//!
//! This module defines domain-specific error types organized by functional area.

use std::fmt;
use thiserror::Error;

/// Top-level error type encompassing all possible errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EsqliteError {
    /// Connection-related errors
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Query execution errors
    #[error(transparent)]
    Query(#[from] QueryError),

    /// Caller contract violations
    #[error(transparent)]
    Usage(#[from] UsageError),
}

/// Errors related to database connections.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    /// The engine refused to open the database
    #[error("Failed to open '{path}': {source}")]
    OpenFailed { path: String, source: EngineError },

    /// Invalid connection parameters
    #[error("Invalid connection parameter '{parameter}': {message}")]
    InvalidParameter { parameter: String, message: String },

    /// Connection string parsing error
    #[error("Failed to parse connection string: {0}")]
    ParseError(String),

    /// The connection has been closed
    #[error("Database not open")]
    NotOpen,
}

/// Errors delivered to fetch and advance futures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    /// The statement was aborted before or while it executed
    #[error("Statement aborted")]
    Aborted,

    /// The statement iterator was aborted
    #[error("Statement iterator aborted")]
    IteratorAborted,

    /// The engine reported a failure for this statement
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The connection closed before the request completed
    #[error("Database not open")]
    ConnectionClosed,
}

/// Errors raised synchronously when a call violates the API contract.
///
/// These never reach the scheduler.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UsageError {
    /// Row count outside `1..=u32::MAX`
    #[error("Invalid row count value: {0}")]
    InvalidRowCount(u64),

    /// Unknown cancel scope name
    #[error("Invalid abort type: {0}")]
    InvalidCancelScope(String),

    /// Bind parameters that cannot be submitted
    #[error("Invalid query placeholder values: {0}")]
    InvalidParameters(String),

    /// SQL text the engine cannot accept
    #[error("Invalid sql value: {0}")]
    InvalidSql(String),
}

/// A failure reported by the execution engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct EngineError {
    /// Engine result code name, e.g. `SQLITE_READONLY`
    pub code: String,
    /// Human readable message
    pub message: String,
}

impl EngineError {
    /// Create a new engine error.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Error reported for a call cut short by an interrupt.
    pub fn interrupted() -> Self {
        Self::new("SQLITE_INTERRUPT", "interrupted")
    }
}

/// Stable error classification for callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Caller contract violation
    Usage = 0,
    /// Aborted statement or iterator
    Aborted = 1,
    /// Engine failure
    Engine = 2,
    /// Connection is not open
    NotOpen = 3,
    /// Connection setup failure
    Connection = 4,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Usage => write!(f, "USAGE"),
            ErrorCode::Aborted => write!(f, "ABORTED"),
            ErrorCode::Engine => write!(f, "ENGINE"),
            ErrorCode::NotOpen => write!(f, "NOT_OPEN"),
            ErrorCode::Connection => write!(f, "CONNECTION"),
        }
    }
}

impl EsqliteError {
    /// Map to a stable error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            EsqliteError::Connection(e) => e.code(),
            EsqliteError::Query(e) => e.code(),
            EsqliteError::Usage(_) => ErrorCode::Usage,
        }
    }
}

impl ConnectionError {
    /// Map to a stable error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            ConnectionError::NotOpen => ErrorCode::NotOpen,
            _ => ErrorCode::Connection,
        }
    }
}

impl QueryError {
    /// Map to a stable error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            QueryError::Aborted | QueryError::IteratorAborted => ErrorCode::Aborted,
            QueryError::Engine(_) => ErrorCode::Engine,
            QueryError::ConnectionClosed => ErrorCode::NotOpen,
        }
    }

    /// Whether this error comes from a cooperative abort.
    pub fn is_aborted(&self) -> bool {
        self.code() == ErrorCode::Aborted
    }

    /// The engine result code, if the engine produced this error.
    pub fn engine_code(&self) -> Option<&str> {
        match self {
            QueryError::Engine(e) => Some(&e.code),
            _ => None,
        }
    }
}
