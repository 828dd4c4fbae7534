//! Rows and tables loaded by a data source.
//!
//! A row is immutable once loaded. Its key is assigned by the caller and is
//! what the checkpoint store records.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Caller-assigned unique key of a row
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowKey(String);

impl RowKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RowKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for RowKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// One unit of work: an opaque record plus its key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Unique key used for checkpointing
    pub key: RowKey,

    /// The record itself
    pub data: Map<String, Value>,
}

impl Row {
    pub fn new(key: impl Into<RowKey>, data: Map<String, Value>) -> Self {
        Self {
            key: key.into(),
            data,
        }
    }

    /// Look up a field of the record
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }
}

/// A bounded dataset in table order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub rows: Vec<Row>,
}

impl Table {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Returns the first key that appears more than once, if any
    pub fn first_duplicate_key(&self) -> Option<&RowKey> {
        let mut seen = HashSet::with_capacity(self.rows.len());
        self.rows.iter().map(|r| &r.key).find(|k| !seen.insert(*k))
    }

    /// Build a table from JSON objects, taking each row's key from `key_field`.
    ///
    /// Numeric keys are rendered as strings so `7` and `"7"` collide.
    pub fn from_records(records: Vec<Map<String, Value>>, key_field: &str) -> Result<Self, String> {
        let mut rows = Vec::with_capacity(records.len());
        for (idx, record) in records.into_iter().enumerate() {
            let key = match record.get(key_field) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                Some(other) => {
                    return Err(format!(
                        "record {} has non-scalar key field '{}': {}",
                        idx, key_field, other
                    ))
                }
                None => return Err(format!("record {} is missing key field '{}'", idx, key_field)),
            };
            rows.push(Row::new(key, record));
        }
        Ok(Self { rows })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_from_records_uses_key_field() {
        let table = Table::from_records(
            vec![record(json!({"id": "a", "x": 1})), record(json!({"id": 2, "x": 2}))],
            "id",
        )
        .unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(table.rows[0].key.as_str(), "a");
        assert_eq!(table.rows[1].key.as_str(), "2");
    }

    #[test]
    fn test_from_records_missing_key() {
        let err = Table::from_records(vec![record(json!({"x": 1}))], "id").unwrap_err();
        assert!(err.contains("missing key field"));
    }

    #[test]
    fn test_duplicate_key_detection() {
        let table = Table::new(vec![
            Row::new("a", Map::new()),
            Row::new("b", Map::new()),
            Row::new("a", Map::new()),
        ]);
        assert_eq!(table.first_duplicate_key().map(|k| k.as_str()), Some("a"));
    }
}
