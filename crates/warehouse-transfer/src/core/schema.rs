//! Destination table descriptors and schema inference.
//!
//! Destination tables are derived from the extracted rows alone: one
//! column per observed key, every column created as unbounded text. No
//! source type information is carried across warehouses.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransferError};

use super::value::{positional_column, Row};

/// A destination table: name plus ordered column names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    /// Table name.
    pub name: String,

    /// Column names in creation order.
    pub columns: Vec<String>,
}

impl TableDescriptor {
    pub fn new(name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    /// Project a row onto this table's columns as coerced text.
    ///
    /// Named rows are matched by column name (absent keys load NULL);
    /// positional rows are matched by index.
    pub fn project(&self, row: &Row) -> Vec<Option<String>> {
        match row {
            Row::Named(_) => self
                .columns
                .iter()
                .map(|column| row.get(column).and_then(|v| v.to_text()))
                .collect(),
            Row::Positional(values) => (0..self.columns.len())
                .map(|i| values.get(i).and_then(|v| v.to_text()))
                .collect(),
        }
    }
}

/// Infer a destination table from a batch of extracted rows.
///
/// Returns `Ok(None)` for an empty batch: the table is skipped, not failed.
///
/// # Errors
///
/// `TransferError::Schema` when the batch mixes named and positional rows,
/// when positional rows differ in width, when a named row repeats a key, or
/// when the rows carry no columns at all.
pub fn infer(table: &str, rows: &[Row]) -> Result<Option<TableDescriptor>> {
    let Some(first) = rows.first() else {
        return Ok(None);
    };

    let columns = match first {
        Row::Named(_) => named_columns(table, rows)?,
        Row::Positional(values) => {
            let width = values.len();
            for (i, row) in rows.iter().enumerate() {
                match row {
                    Row::Positional(v) if v.len() == width => {}
                    Row::Positional(v) => {
                        return Err(TransferError::schema(
                            table,
                            format!(
                                "row {} has {} values, expected {} like the first row",
                                i,
                                v.len(),
                                width
                            ),
                        ))
                    }
                    Row::Named(_) => return Err(mixed_shapes(table, i)),
                }
            }
            (0..width).map(positional_column).collect()
        }
    };

    if columns.is_empty() {
        return Err(TransferError::schema(table, "rows have no columns"));
    }

    Ok(Some(TableDescriptor::new(table, columns)))
}

fn named_columns(table: &str, rows: &[Row]) -> Result<Vec<String>> {
    let mut columns: Vec<String> = Vec::new();
    for (i, row) in rows.iter().enumerate() {
        let Row::Named(pairs) = row else {
            return Err(mixed_shapes(table, i));
        };
        for (j, (key, _)) in pairs.iter().enumerate() {
            if key.is_empty() {
                return Err(TransferError::schema(
                    table,
                    format!("row {} has an empty column name", i),
                ));
            }
            if pairs[..j].iter().any(|(k, _)| k == key) {
                return Err(TransferError::schema(
                    table,
                    format!("row {} repeats column '{}'", i, key),
                ));
            }
            if !columns.iter().any(|c| c == key) {
                columns.push(key.clone());
            }
        }
    }
    Ok(columns)
}

fn mixed_shapes(table: &str, row: usize) -> TransferError {
    TransferError::schema(
        table,
        format!("row {} mixes named and positional shapes", row),
    )
}
