//! Cell values and rows as they travel between warehouses.
//!
//! Every value crossing a warehouse boundary is coerced to text (see
//! [`SqlValue::to_text`]). Rows keep whatever shape the source produced:
//! named mappings or positional tuples.

use std::fmt;

use serde_json::Value;

/// A single cell value read from a warehouse.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL NULL.
    Null,

    /// Boolean value.
    Bool(bool),

    /// Signed integer.
    Int(i64),

    /// Floating point number.
    Float(f64),

    /// Text value.
    Text(String),

    /// Raw bytes.
    Bytes(Vec<u8>),
}

impl SqlValue {
    /// Check if this value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Text coercion applied before any value is written to a destination.
    ///
    /// NULL stays NULL; booleans become `true`/`false`; numbers use their
    /// decimal form; bytes become lowercase hex.
    #[must_use]
    pub fn to_text(&self) -> Option<String> {
        match self {
            SqlValue::Null => None,
            SqlValue::Bool(v) => Some(v.to_string()),
            SqlValue::Int(v) => Some(v.to_string()),
            SqlValue::Float(v) => Some(v.to_string()),
            SqlValue::Text(v) => Some(v.clone()),
            SqlValue::Bytes(v) => Some(hex::encode(v)),
        }
    }

    /// Convert a JSON scalar (as returned by HTTP warehouses) into a value.
    ///
    /// Arrays and objects are kept as their JSON text.
    pub fn from_json(value: &Value) -> SqlValue {
        match value {
            Value::Null => SqlValue::Null,
            Value::Bool(b) => SqlValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => SqlValue::Int(i),
                None => n
                    .as_f64()
                    .map(SqlValue::Float)
                    .unwrap_or_else(|| SqlValue::Text(n.to_string())),
            },
            Value::String(s) => SqlValue::Text(s.clone()),
            other => SqlValue::Text(other.to_string()),
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_text() {
            Some(text) => f.write_str(&text),
            None => f.write_str("NULL"),
        }
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Int(i64::from(v))
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Float(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Bytes(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// One extracted row.
///
/// Named rows keep their column order as returned by the warehouse.
#[derive(Debug, Clone, PartialEq)]
pub enum Row {
    /// Ordered column name to value pairs.
    Named(Vec<(String, SqlValue)>),

    /// Values by position, without column names.
    Positional(Vec<SqlValue>),
}

impl Row {
    /// Build a named row from `(column, value)` pairs.
    pub fn named<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<SqlValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        Row::Named(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Number of cells.
    pub fn len(&self) -> usize {
        match self {
            Row::Named(pairs) => pairs.len(),
            Row::Positional(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value of a named column. Positional rows never match.
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        match self {
            Row::Named(pairs) => pairs.iter().find(|(k, _)| k == column).map(|(_, v)| v),
            Row::Positional(_) => None,
        }
    }

    /// Values in row order.
    pub fn values(&self) -> Vec<&SqlValue> {
        match self {
            Row::Named(pairs) => pairs.iter().map(|(_, v)| v).collect(),
            Row::Positional(values) => values.iter().collect(),
        }
    }

    /// Column name to coerced text pairs, in row order.
    ///
    /// Positional rows use the synthesized `COLUMN_i` names.
    pub fn to_text_pairs(&self) -> Vec<(String, Option<String>)> {
        match self {
            Row::Named(pairs) => pairs
                .iter()
                .map(|(k, v)| (k.clone(), v.to_text()))
                .collect(),
            Row::Positional(values) => values
                .iter()
                .enumerate()
                .map(|(i, v)| (positional_column(i), v.to_text()))
                .collect(),
        }
    }
}

/// Synthesized name for the column at `index` of a positional row.
pub fn positional_column(index: usize) -> String {
    format!("COLUMN_{}", index)
}
