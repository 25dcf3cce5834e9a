//! Connection parameter parsing and validation.
//!
//! This module handles parsing connection strings and building connection
//! parameters with validation.

use crate::engine::protocol::{OpenFlags, PrepareFlags};
use crate::error::ConnectionError;
use crate::query::options::{CancelScope, QueryDefaults};
use crate::types::RowShape;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Connection parameters for opening a database.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionParams {
    /// Database path (`:memory:` for an in-memory database)
    pub path: String,

    /// Engine open mode
    pub open_flags: OpenFlags,

    /// Default cancel scope for statements and iterators
    pub cancel_scope: CancelScope,

    /// Default row shape
    pub row_shape: RowShape,

    /// Default statement preparation flags
    pub prepare_flags: PrepareFlags,
}

impl ConnectionParams {
    /// Create a new ConnectionBuilder.
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    pub(crate) fn query_defaults(&self) -> QueryDefaults {
        QueryDefaults {
            cancel_scope: self.cancel_scope,
            row_shape: self.row_shape,
            prepare_flags: self.prepare_flags,
        }
    }
}

impl FromStr for ConnectionParams {
    type Err = ConnectionError;

    /// Parse a connection string in the format:
    /// `file:<path>[?param=value&...]`, or a bare path.
    ///
    /// Recognized parameters: `mode` (`ro`, `rw`, `rwc`, `memory`), `cache`
    /// (`shared`, `private`), `nofollow`, `cancel` (`none`, `current`,
    /// `all`), `rows` (`array`, `object`) and `vtab`.
    ///
    /// # Examples
    ///
    /// ```
    /// # use esqlite_rs::connection::ConnectionParams;
    /// # use std::str::FromStr;
    /// // Bare path
    /// let params = ConnectionParams::from_str("/var/db/app.db")?;
    ///
    /// // Read-only with a shared cache
    /// let params = ConnectionParams::from_str("file:/var/db/app.db?mode=ro&cache=shared")?;
    ///
    /// // In-memory, array rows
    /// let params = ConnectionParams::from_str("file::memory:?rows=array")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        let Some(uri) = s.strip_prefix("file:") else {
            return ConnectionBuilder::new().path(s).build();
        };

        // Split into path and query string
        let (path, query_string) = match uri.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (uri, None),
        };

        let path = urlencoding::decode(path)
            .map_err(|e| ConnectionError::ParseError(format!("Failed to decode path: {}", e)))?
            .into_owned();

        let params = parse_query_params(query_string)?;
        let builder = apply_query_params(ConnectionBuilder::new().path(&path), params)?;

        builder.build()
    }
}

impl fmt::Display for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ConnectionParams {{ path: {}, flags: {:#x}, cancel: {} }}",
            self.path,
            self.open_flags.bits(),
            self.cancel_scope
        )
    }
}

/// Builder for constructing ConnectionParams with validation.
#[derive(Debug, Clone, Default)]
pub struct ConnectionBuilder {
    path: Option<String>,
    open_flags: Option<OpenFlags>,
    cancel_scope: Option<CancelScope>,
    row_shape: Option<RowShape>,
    prepare_flags: Option<PrepareFlags>,
}

impl ConnectionBuilder {
    /// Create a new ConnectionBuilder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the database path.
    pub fn path(mut self, path: &str) -> Self {
        self.path = Some(path.to_string());
        self
    }

    /// Set the open mode. Unknown bits are dropped.
    pub fn open_flags(mut self, flags: OpenFlags) -> Self {
        self.open_flags = Some(OpenFlags::from_bits_truncate(flags.bits()));
        self
    }

    /// Set the default cancel scope.
    pub fn cancel_scope(mut self, scope: CancelScope) -> Self {
        self.cancel_scope = Some(scope);
        self
    }

    /// Set the default row shape.
    pub fn row_shape(mut self, shape: RowShape) -> Self {
        self.row_shape = Some(shape);
        self
    }

    /// Set the default preparation flags.
    pub fn prepare_flags(mut self, flags: PrepareFlags) -> Self {
        self.prepare_flags = Some(flags);
        self
    }

    /// Build the ConnectionParams with validation.
    pub fn build(self) -> Result<ConnectionParams, ConnectionError> {
        let path = self.path.ok_or_else(|| ConnectionError::InvalidParameter {
            parameter: "path".to_string(),
            message: "Path is required".to_string(),
        })?;

        if path.is_empty() {
            return Err(ConnectionError::InvalidParameter {
                parameter: "path".to_string(),
                message: "Path cannot be empty".to_string(),
            });
        }

        let open_flags = self.open_flags.unwrap_or(OpenFlags::DEFAULT);

        if open_flags.contains(OpenFlags::READONLY) && open_flags.contains(OpenFlags::READWRITE) {
            return Err(ConnectionError::InvalidParameter {
                parameter: "open_flags".to_string(),
                message: "READONLY and READWRITE are mutually exclusive".to_string(),
            });
        }

        if open_flags.contains(OpenFlags::SHAREDCACHE)
            && open_flags.contains(OpenFlags::PRIVATECACHE)
        {
            return Err(ConnectionError::InvalidParameter {
                parameter: "open_flags".to_string(),
                message: "SHAREDCACHE and PRIVATECACHE are mutually exclusive".to_string(),
            });
        }

        Ok(ConnectionParams {
            path,
            open_flags,
            cancel_scope: self.cancel_scope.unwrap_or_default(),
            row_shape: self.row_shape.unwrap_or_default(),
            prepare_flags: self.prepare_flags.unwrap_or_default(),
        })
    }
}

/// Parse query parameters from URI query string.
fn parse_query_params(query: Option<&str>) -> Result<HashMap<String, String>, ConnectionError> {
    let mut params = HashMap::new();

    if let Some(query) = query {
        for pair in query.split('&') {
            if pair.is_empty() {
                continue;
            }

            let (key, value) = match pair.split_once('=') {
                Some((k, v)) => (k, v),
                None => {
                    return Err(ConnectionError::ParseError(format!(
                        "Invalid query parameter format: {}",
                        pair
                    )));
                }
            };

            let value = urlencoding::decode(value)
                .map_err(|e| ConnectionError::ParseError(format!("Failed to decode value: {}", e)))?
                .into_owned();

            params.insert(key.to_string(), value);
        }
    }

    Ok(params)
}

/// Apply query parameters to builder.
fn apply_query_params(
    mut builder: ConnectionBuilder,
    params: HashMap<String, String>,
) -> Result<ConnectionBuilder, ConnectionError> {
    let mut flags = OpenFlags::DEFAULT;

    for (key, value) in params {
        match key.as_str() {
            "mode" => {
                let mode = match value.as_str() {
                    "ro" => OpenFlags::READONLY,
                    "rw" => OpenFlags::READWRITE,
                    "rwc" => OpenFlags::READWRITE | OpenFlags::CREATE,
                    "memory" => OpenFlags::DEFAULT | OpenFlags::MEMORY,
                    _ => return Err(invalid(&key, &value)),
                };
                flags.set(OpenFlags::DEFAULT | OpenFlags::READONLY | OpenFlags::MEMORY, false);
                flags.set(mode, true);
            }
            "cache" => {
                flags.set(OpenFlags::SHAREDCACHE | OpenFlags::PRIVATECACHE, false);
                match value.as_str() {
                    "shared" => flags.set(OpenFlags::SHAREDCACHE, true),
                    "private" => flags.set(OpenFlags::PRIVATECACHE, true),
                    _ => return Err(invalid(&key, &value)),
                }
            }
            "nofollow" => flags.set(OpenFlags::NOFOLLOW, parse_bool(&key, &value)?),
            "cancel" => {
                let scope = value.parse().map_err(|_| invalid(&key, &value))?;
                builder = builder.cancel_scope(scope);
            }
            "rows" => {
                let shape = match value.as_str() {
                    "array" => RowShape::Array,
                    "object" => RowShape::Keyed,
                    _ => return Err(invalid(&key, &value)),
                };
                builder = builder.row_shape(shape);
            }
            "vtab" => {
                let flags = if parse_bool(&key, &value)? {
                    PrepareFlags::empty()
                } else {
                    PrepareFlags::NO_VTAB
                };
                builder = builder.prepare_flags(flags);
            }
            _ => {
                return Err(ConnectionError::InvalidParameter {
                    parameter: key.clone(),
                    message: "Unknown connection parameter".to_string(),
                });
            }
        }
    }

    Ok(builder.open_flags(flags))
}

fn invalid(key: &str, value: &str) -> ConnectionError {
    ConnectionError::InvalidParameter {
        parameter: key.to_string(),
        message: format!("Invalid value: {}", value),
    }
}

/// Parse boolean value from string.
fn parse_bool(key: &str, s: &str) -> Result<bool, ConnectionError> {
    match s.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, s)),
    }
}
