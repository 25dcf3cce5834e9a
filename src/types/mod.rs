//! Values and rows exchanged with the engine.

mod row;
mod value;

pub use row::{Columns, Row, RowShape};
pub use value::Value;
