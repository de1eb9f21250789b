//! Data adapter contract and the row projection used for re-scanning.
//!
//! Adapters return columnar data; the connector flattens it into a textual
//! projection (one `column: value` line per cell, rows delimited) for the
//! risk agent's data-phase scan, then maps the sanitized text back onto the
//! cells. Cell boundaries survive because cells are newline-escaped before
//! projection and placeholders never contain newlines.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::ConnectorError;

/// Delimiter line between rows in the textual projection.
const ROW_DELIMITER: &str = "---";

/// Columnar data plus timing, as returned by an adapter.
#[derive(Debug, Clone, Default)]
pub struct AdapterResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
    /// Set when the adapter had to cut the row set at the configured limit
    /// post-fetch (dialects without LIMIT support).
    pub truncated: bool,
}

/// A connection-shaped source of columnar data.
#[async_trait]
pub trait DataAdapter: Send + Sync {
    /// Establish connectivity. Called at registration; adapters may pool
    /// lazily and treat this as a health probe.
    async fn open(&self) -> Result<(), ConnectorError>;

    /// Execute a query with bind parameters under a deadline. `max_rows` is
    /// enforced in-dialect where possible, by truncation otherwise.
    async fn execute(
        &self,
        query: &str,
        parameters: &[String],
        deadline: Duration,
        max_rows: u32,
    ) -> Result<AdapterResult, ConnectorError>;

    /// Release held resources.
    async fn close(&self) -> Result<(), ConnectorError>;
}

fn escape_cell(cell: &str) -> String {
    cell.replace('\n', " ").replace('\r', " ")
}

/// Flatten a result into the scan projection.
pub fn project(result: &AdapterResult) -> String {
    let mut lines = Vec::new();
    for (i, row) in result.rows.iter().enumerate() {
        if i > 0 {
            lines.push(ROW_DELIMITER.to_string());
        }
        for (column, cell) in result.columns.iter().zip(row.iter()) {
            lines.push(format!("{column}: {}", escape_cell(cell)));
        }
    }
    lines.join("\n")
}

/// Map a sanitized projection back onto the row set.
///
/// Returns `None` when the sanitized text no longer lines up with the cell
/// structure (callers should drop the rows rather than guess).
pub fn unproject(sanitized: &str, columns: &[String], row_count: usize) -> Option<Vec<Vec<String>>> {
    if row_count == 0 {
        return Some(Vec::new());
    }

    let mut rows: Vec<Vec<String>> = Vec::with_capacity(row_count);
    let mut current: Vec<String> = Vec::with_capacity(columns.len());
    let mut column_idx = 0usize;

    for line in sanitized.lines() {
        if line == ROW_DELIMITER {
            if column_idx != columns.len() {
                return None;
            }
            rows.push(std::mem::take(&mut current));
            column_idx = 0;
            continue;
        }
        let expected = columns.get(column_idx)?;
        let value = line.strip_prefix(expected.as_str())?.strip_prefix(": ")?;
        current.push(value.to_string());
        column_idx += 1;
    }

    if column_idx != columns.len() {
        return None;
    }
    rows.push(current);

    if rows.len() == row_count {
        Some(rows)
    } else {
        None
    }
}
