//! Per-call query options and bind parameters.

use crate::engine::protocol::{BoundParams, PrepareFlags, QueryFlags, QueryRequest};
use crate::error::UsageError;
use crate::types::{RowShape, Value};
use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;

/// What happens to a running handle when its consuming loop exits early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelScope {
    /// Leave it running; the loop may be re-entered and resumes
    None,
    /// Abandon only the current statement
    Current,
    /// Abort the statement and the rest of its batch
    #[default]
    All,
}

impl FromStr for CancelScope {
    type Err = UsageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(CancelScope::None),
            "current" => Ok(CancelScope::Current),
            "all" => Ok(CancelScope::All),
            other => Err(UsageError::InvalidCancelScope(other.to_string())),
        }
    }
}

impl fmt::Display for CancelScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelScope::None => write!(f, "none"),
            CancelScope::Current => write!(f, "current"),
            CancelScope::All => write!(f, "all"),
        }
    }
}

/// How many rows one fetch asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchCount {
    /// Every remaining row of the statement
    #[default]
    All,
    /// At most this many rows
    Rows(NonZeroU32),
}

impl FetchCount {
    /// Validate a caller supplied row count.
    ///
    /// # Errors
    ///
    /// Returns `UsageError::InvalidRowCount` unless `1 <= n <= u32::MAX`.
    pub fn rows(n: u64) -> Result<Self, UsageError> {
        u32::try_from(n)
            .ok()
            .and_then(NonZeroU32::new)
            .map(FetchCount::Rows)
            .ok_or(UsageError::InvalidRowCount(n))
    }

    /// A single row.
    pub fn one() -> Self {
        FetchCount::Rows(NonZeroU32::MIN)
    }

    /// The engine's encoding: 0 means all.
    pub(crate) fn engine_count(self) -> u32 {
        match self {
            FetchCount::All => 0,
            FetchCount::Rows(n) => n.get(),
        }
    }
}

/// Bind values supplied by the caller.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Params {
    /// No bind values
    #[default]
    None,
    /// Values bound by position
    Positional(Vec<Value>),
    /// Values bound by name; keys are given without the `:` prefix
    Named(Vec<(String, Value)>),
}

impl Params {
    /// Positional values.
    pub fn positional<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Params::Positional(values.into_iter().map(Into::into).collect())
    }

    /// Named values.
    pub fn named<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Params::Named(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Apply the binding rule: named keys `k` become `:k` placeholders,
    /// flattened in the order given.
    pub(crate) fn bind(self) -> Result<(BoundParams, bool), UsageError> {
        match self {
            Params::None => Ok((BoundParams::None, false)),
            Params::Positional(values) => Ok((BoundParams::Positional(values), false)),
            Params::Named(pairs) => {
                let mut bound = Vec::with_capacity(pairs.len());
                for (key, value) in pairs {
                    if key.is_empty() {
                        return Err(UsageError::InvalidParameters(
                            "parameter name cannot be empty".to_string(),
                        ));
                    }
                    bound.push((format!(":{}", key), value));
                }
                Ok((BoundParams::Named(bound), true))
            }
        }
    }
}

/// Connection level defaults a call may override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct QueryDefaults {
    pub cancel_scope: CancelScope,
    pub row_shape: RowShape,
    pub prepare_flags: PrepareFlags,
}

/// A validated submission, ready for the scheduler.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedQuery {
    pub request: QueryRequest,
    pub shape: RowShape,
    pub cancel_scope: CancelScope,
    pub single: bool,
    pub continue_on_error: bool,
}

/// Options for one submission.
///
/// Unset options fall back to the connection defaults.
///
/// # Example
///
/// ```
/// use esqlite_rs::{CancelScope, Params, QueryOptions};
///
/// let options = QueryOptions::new()
///     .params(Params::named([("id", 7)]))
///     .rows_as_array(true)
///     .cancel_scope(CancelScope::None);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    params: Params,
    row_shape: Option<RowShape>,
    cancel_scope: Option<CancelScope>,
    prepare_flags: Option<PrepareFlags>,
    single: bool,
    continue_on_error: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            params: Params::None,
            row_shape: None,
            cancel_scope: None,
            prepare_flags: None,
            single: true,
            continue_on_error: false,
        }
    }
}

impl QueryOptions {
    /// Create options with every value defaulted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bind values.
    pub fn params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    /// Produce array rows instead of keyed rows.
    pub fn rows_as_array(mut self, enabled: bool) -> Self {
        self.row_shape = Some(if enabled {
            RowShape::Array
        } else {
            RowShape::Keyed
        });
        self
    }

    /// Set the cancel scope.
    pub fn cancel_scope(mut self, scope: CancelScope) -> Self {
        self.cancel_scope = Some(scope);
        self
    }

    /// Set the statement preparation flags.
    pub fn prepare_flags(mut self, flags: PrepareFlags) -> Self {
        self.prepare_flags = Some(flags);
        self
    }

    /// Callback mode: run only the first statement (the default) or the
    /// whole batch.
    pub fn single(mut self, single: bool) -> Self {
        self.single = single;
        self
    }

    /// Callback mode: report one result per statement instead of stopping
    /// at the first error.
    pub fn continue_on_error(mut self, enabled: bool) -> Self {
        self.continue_on_error = enabled;
        self
    }

    /// Validate the SQL text and merge with the connection defaults.
    pub(crate) fn resolve(
        self,
        sql: &str,
        defaults: &QueryDefaults,
        single: bool,
    ) -> Result<ResolvedQuery, UsageError> {
        if sql.contains('\0') {
            return Err(UsageError::InvalidSql(
                "sql text contains a NUL character".to_string(),
            ));
        }

        let (params, named) = self.params.bind()?;
        let shape = self.row_shape.unwrap_or(defaults.row_shape);

        let mut flags = QueryFlags::empty();
        flags.set(QueryFlags::SINGLE, single);
        flags.set(QueryFlags::NAMED_PARAMS, named);
        flags.set(QueryFlags::ROWS_AS_ARRAY, shape == RowShape::Array);

        Ok(ResolvedQuery {
            request: QueryRequest {
                sql: sql.to_string(),
                prepare_flags: self.prepare_flags.unwrap_or(defaults.prepare_flags),
                flags,
                params,
                skip: 0,
            },
            shape,
            cancel_scope: self.cancel_scope.unwrap_or(defaults.cancel_scope),
            single,
            continue_on_error: self.continue_on_error,
        })
    }

    /// Whether callback mode runs only the first statement.
    pub(crate) fn is_single(&self) -> bool {
        self.single
    }
}
