//! JSONL data source: one JSON object per line.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use super::DataSource;
use crate::domain::Table;

/// Reads a table from a JSONL file, keyed by one field of each record
pub struct JsonlSource {
    path: PathBuf,
    key_field: String,
}

impl JsonlSource {
    pub fn new(path: impl Into<PathBuf>, key_field: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            key_field: key_field.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DataSource for JsonlSource {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn load(&self) -> Result<Table> {
        let file = File::open(&self.path)
            .await
            .with_context(|| format!("Failed to open source file: {}", self.path.display()))?;

        let mut lines = BufReader::new(file).lines();
        let mut records: Vec<Map<String, Value>> = Vec::new();
        let mut line_no = 0usize;

        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(&line).with_context(|| {
                format!("Invalid JSON at {}:{}", self.path.display(), line_no)
            })?;
            match value {
                Value::Object(record) => records.push(record),
                other => anyhow::bail!(
                    "Expected a JSON object at {}:{}, found {}",
                    self.path.display(),
                    line_no,
                    other
                ),
            }
        }

        let table = Table::from_records(records, &self.key_field)
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("Failed to key rows of {}", self.path.display()))?;

        debug!(path = %self.path.display(), rows = table.len(), "Source loaded");
        Ok(table)
    }
}
