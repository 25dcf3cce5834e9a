//! Connection management.
//!
//! This module provides connection parameter parsing, the connection
//! lifecycle, and the [`Connection`] handle requests are submitted through.
//!
//! # Example
//!
//! ```
//! # use esqlite_rs::connection::{ConnectionBuilder, ConnectionParams};
//! # use esqlite_rs::{CancelScope, OpenFlags};
//! # use std::str::FromStr;
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Using ConnectionBuilder
//! let params = ConnectionBuilder::new()
//!     .path("/var/lib/app/data.db")
//!     .open_flags(OpenFlags::READONLY)
//!     .cancel_scope(CancelScope::Current)
//!     .build()?;
//!
//! // Or parse from connection string
//! let params = ConnectionParams::from_str("file:/var/lib/app/data.db?mode=ro&cancel=current")?;
//! # Ok(())
//! # }
//! ```

pub mod handle;
pub mod params;
pub mod session;

pub use handle::Connection;
pub use params::{ConnectionBuilder, ConnectionParams};
pub use session::SessionState;
