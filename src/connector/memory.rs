//! In-memory data adapter for the test harness.
//!
//! Serves a fixed row set, with optional latency and failure injection so
//! pool exhaustion, deadlines, and unavailable sources can be exercised
//! without a real database.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::ConnectorError;

use super::adapter::{AdapterResult, DataAdapter};

/// Fixed-data adapter.
#[derive(Default)]
pub struct MemoryAdapter {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
    delay: Option<Duration>,
    unavailable: bool,
}

impl MemoryAdapter {
    pub fn new(columns: Vec<&str>, rows: Vec<Vec<&str>>) -> Self {
        Self {
            columns: columns.into_iter().map(String::from).collect(),
            rows: rows
                .into_iter()
                .map(|row| row.into_iter().map(String::from).collect())
                .collect(),
            delay: None,
            unavailable: false,
        }
    }

    /// Delay every execution, for deadline and pool tests.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail every execution with `source_unavailable`.
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }
}

#[async_trait]
impl DataAdapter for MemoryAdapter {
    async fn open(&self) -> Result<(), ConnectorError> {
        if self.unavailable {
            return Err(ConnectorError::SourceUnavailable("memory adapter down".into()));
        }
        Ok(())
    }

    async fn execute(
        &self,
        _query: &str,
        _parameters: &[String],
        deadline: Duration,
        max_rows: u32,
    ) -> Result<AdapterResult, ConnectorError> {
        if self.unavailable {
            return Err(ConnectorError::SourceUnavailable("memory adapter down".into()));
        }
        if let Some(delay) = self.delay {
            if delay >= deadline {
                tokio::time::sleep(deadline).await;
                return Err(ConnectorError::SourceTimeout {
                    source_name: "memory".into(),
                    elapsed_ms: deadline.as_millis() as u64,
                });
            }
            tokio::time::sleep(delay).await;
        }

        let mut rows = self.rows.clone();
        let truncated = rows.len() > max_rows as usize;
        rows.truncate(max_rows as usize);

        Ok(AdapterResult {
            columns: self.columns.clone(),
            rows,
            truncated,
        })
    }

    async fn close(&self) -> Result<(), ConnectorError> {
        Ok(())
    }
}
