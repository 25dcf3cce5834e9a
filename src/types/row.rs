//! Result rows and the per-statement column mapping.
//!
//! A [`Columns`] mapping is built once per statement from the column names
//! the engine reports with the first row batch. Every [`Row`] of that
//! statement shares it, so keyed access never rebuilds anything per row.

use crate::types::Value;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::sync::Arc;

/// Shape of the rows produced for a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowShape {
    /// Rows are keyed by column name
    #[default]
    Keyed,
    /// Rows are plain value arrays
    Array,
}

/// Ordered column names plus a name lookup table, shared by every row of a
/// statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Columns {
    inner: Arc<ColumnMap>,
}

#[derive(Debug, PartialEq)]
struct ColumnMap {
    names: Vec<String>,
    positions: HashMap<String, usize>,
}

impl Columns {
    /// Build the mapping from the engine's column name list.
    ///
    /// When a name repeats, lookups by that name resolve to the last column
    /// carrying it.
    pub fn new(names: Vec<String>) -> Self {
        let positions = names
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.clone(), idx))
            .collect();
        Self {
            inner: Arc::new(ColumnMap { names, positions }),
        }
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.inner.names.len()
    }

    /// Check if there are no columns.
    pub fn is_empty(&self) -> bool {
        self.inner.names.is_empty()
    }

    /// Column names in result order.
    pub fn names(&self) -> &[String] {
        &self.inner.names
    }

    /// Position of a column by name.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.inner.positions.get(name).copied()
    }

    /// Turn raw engine rows into rows of the requested shape.
    pub(crate) fn map_rows(&self, raw: Vec<Vec<Value>>, shape: RowShape) -> Vec<Row> {
        raw.into_iter()
            .map(|values| match shape {
                RowShape::Keyed => Row::keyed(self.clone(), values),
                RowShape::Array => Row::array(values),
            })
            .collect()
    }
}

/// One result row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Option<Columns>,
    values: Vec<Value>,
}

impl Row {
    /// Create a row keyed by the given columns.
    pub fn keyed(columns: Columns, values: Vec<Value>) -> Self {
        Self {
            columns: Some(columns),
            values,
        }
    }

    /// Create an array-shaped row.
    pub fn array(values: Vec<Value>) -> Self {
        Self {
            columns: None,
            values,
        }
    }

    /// Get the shape of this row.
    pub fn shape(&self) -> RowShape {
        if self.columns.is_some() {
            RowShape::Keyed
        } else {
            RowShape::Array
        }
    }

    /// Get a value by column name. Always `None` for array rows.
    pub fn get(&self, name: &str) -> Option<&Value> {
        let idx = self.columns.as_ref()?.position(name)?;
        self.values.get(idx)
    }

    /// Get a value by position.
    pub fn get_index(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Column names, for keyed rows.
    pub fn column_names(&self) -> Option<&[String]> {
        self.columns.as_ref().map(Columns::names)
    }

    /// All values in column order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Consume the row and return its values.
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Number of values in the row.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if the row has no values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match &self.columns {
            Some(columns) => {
                let mut map = serializer.serialize_map(Some(self.values.len()))?;
                for (name, value) in columns.names().iter().zip(&self.values) {
                    map.serialize_entry(name, value)?;
                }
                map.end()
            }
            None => {
                let mut seq = serializer.serialize_seq(Some(self.values.len()))?;
                for value in &self.values {
                    seq.serialize_element(value)?;
                }
                seq.end()
            }
        }
    }
}
