//! Built-in file sinks.
//!
//! Every sink writes one file and returns one artifact whose payload
//! describes that file (`path`, `sha256`, `bytes`). Files are written to a
//! temporary name and renamed into place.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::fs;

use super::{ProducedArtifact, Sink, SinkInput};
use crate::domain::{ArtifactDeclaration, ArtifactReference, SecurityLevel};

/// Settings shared by every file sink
#[derive(Debug, Clone)]
pub struct FileSinkConfig {
    pub name: String,
    pub path: PathBuf,
    pub security_level: SecurityLevel,
    pub alias: Option<String>,
    pub consumes: Vec<ArtifactReference>,
}

impl FileSinkConfig {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            security_level: SecurityLevel::default(),
            alias: None,
            consumes: Vec::new(),
        }
    }

    pub fn with_security_level(mut self, level: SecurityLevel) -> Self {
        self.security_level = level;
        self
    }

    pub fn with_alias(mut self, alias: Option<String>) -> Self {
        self.alias = alias;
        self
    }

    pub fn with_consumes(mut self, consumes: Vec<ArtifactReference>) -> Self {
        self.consumes = consumes;
        self
    }

    fn declaration(&self, name: &str, artifact_type: &str) -> ArtifactDeclaration {
        let decl = ArtifactDeclaration::new(name, artifact_type);
        match self.alias {
            Some(ref alias) => decl.with_alias(alias.clone()),
            None => decl,
        }
    }
}

/// Write bytes atomically and describe the file
async fn write_file(path: &Path, bytes: &[u8]) -> Result<Value> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to move {} into place", path.display()))?;

    Ok(json!({
        "path": path.display().to_string(),
        "sha256": hex::encode(Sha256::digest(bytes)),
        "bytes": bytes.len(),
    }))
}

macro_rules! file_sink_common {
    () => {
        fn name(&self) -> &str {
            &self.config.name
        }

        fn consumes(&self) -> Vec<ArtifactReference> {
            self.config.consumes.clone()
        }

        fn security_level(&self) -> SecurityLevel {
            self.config.security_level
        }
    };
}

// ============================================================================
// json_results
// ============================================================================

/// The whole cycle result as one pretty-printed JSON document
pub struct JsonResultsSink {
    config: FileSinkConfig,
}

impl JsonResultsSink {
    pub fn new(config: FileSinkConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Sink for JsonResultsSink {
    file_sink_common!();

    fn produces(&self) -> Vec<ArtifactDeclaration> {
        vec![self.config.declaration("results", "json")]
    }

    async fn write(&self, input: SinkInput<'_>) -> Result<Vec<ProducedArtifact>> {
        let bytes = serde_json::to_vec_pretty(input.result).context("Failed to serialize result")?;
        let descriptor = write_file(&self.config.path, &bytes).await?;
        Ok(vec![ProducedArtifact::new("results", descriptor)])
    }
}

// ============================================================================
// jsonl_outcomes
// ============================================================================

/// One row outcome per line, in table order
pub struct JsonlOutcomesSink {
    config: FileSinkConfig,
}

impl JsonlOutcomesSink {
    pub fn new(config: FileSinkConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Sink for JsonlOutcomesSink {
    file_sink_common!();

    fn produces(&self) -> Vec<ArtifactDeclaration> {
        vec![self.config.declaration("outcomes", "jsonl")]
    }

    async fn write(&self, input: SinkInput<'_>) -> Result<Vec<ProducedArtifact>> {
        let mut bytes = Vec::new();
        for outcome in &input.result.outcomes {
            serde_json::to_writer(&mut bytes, outcome).context("Failed to serialize outcome")?;
            bytes.push(b'\n');
        }
        let mut descriptor = write_file(&self.config.path, &bytes).await?;
        descriptor["rows"] = json!(input.result.outcomes.len());
        Ok(vec![ProducedArtifact::new("outcomes", descriptor)])
    }
}

// ============================================================================
// manifest
// ============================================================================

/// Records what every consumed artifact is and where it landed
pub struct ManifestSink {
    config: FileSinkConfig,
}

impl ManifestSink {
    pub fn new(config: FileSinkConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Sink for ManifestSink {
    file_sink_common!();

    fn produces(&self) -> Vec<ArtifactDeclaration> {
        vec![self.config.declaration("manifest", "manifest")]
    }

    async fn write(&self, input: SinkInput<'_>) -> Result<Vec<ProducedArtifact>> {
        let entries: Vec<Value> = input
            .consumed
            .iter()
            .map(|a| {
                json!({
                    "id": a.id,
                    "type": a.artifact_type,
                    "security_level": a.security_level,
                    "produced_by": a.produced_by,
                    "created_at": a.created_at,
                    "descriptor": a.payload,
                })
            })
            .collect();

        let manifest = json!({
            "cycle": input.result.cycle,
            "completed_at": input.result.completed_at,
            "security_level": self.config.security_level,
            "artifacts": entries,
        });
        let bytes = serde_json::to_vec_pretty(&manifest).context("Failed to serialize manifest")?;
        let mut descriptor = write_file(&self.config.path, &bytes).await?;
        descriptor["artifacts"] = json!(entries.len());
        Ok(vec![ProducedArtifact::new("manifest", descriptor)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Artifact, CycleResult, CycleStats, RowKey, RowOutcome};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn result() -> CycleResult {
        CycleResult {
            cycle: "baseline".into(),
            outcomes: vec![
                RowOutcome::succeeded(RowKey::new("a"), 0, 1, json!({"x": 1}), BTreeMap::new()),
                RowOutcome::failed(RowKey::new("b"), 1, 3, "timeout"),
            ],
            aggregates: BTreeMap::new(),
            halted: None,
            stats: CycleStats::default(),
            started_at: Utc::now(),
            completed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_outcomes_written_one_per_line() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("out/outcomes.jsonl");
        let sink = JsonlOutcomesSink::new(FileSinkConfig::new("rows", &path));

        let result = result();
        let produced = sink
            .write(SinkInput {
                result: &result,
                consumed: &[],
            })
            .await
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert_eq!(produced[0].name, "outcomes");
        assert_eq!(produced[0].payload["rows"], json!(2));
        assert_eq!(produced[0].payload["sha256"].as_str().unwrap().len(), 64);
    }

    #[tokio::test]
    async fn test_manifest_lists_consumed() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("manifest.json");
        let sink = ManifestSink::new(
            FileSinkConfig::new("manifest", &path)
                .with_consumes(vec![ArtifactReference::Type("json".into())]),
        );

        let consumed = vec![Artifact {
            id: "results.results".into(),
            artifact_type: "json".into(),
            alias: None,
            security_level: SecurityLevel::Public,
            produced_by: "results".into(),
            payload: json!({"sha256": "abc"}),
            created_at: Utc::now(),
        }];
        let result = result();
        sink.write(SinkInput {
            result: &result,
            consumed: &consumed,
        })
        .await
        .unwrap();

        let manifest: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(manifest["artifacts"][0]["id"], json!("results.results"));
        assert_eq!(manifest["artifacts"][0]["descriptor"]["sha256"], json!("abc"));
    }

    #[test]
    fn test_alias_applies_to_declaration() {
        let sink = JsonResultsSink::new(
            FileSinkConfig::new("results", "/tmp/r.json").with_alias(Some("latest".into())),
        );
        let decl = &sink.produces()[0];
        assert_eq!(decl.alias.as_deref(), Some("latest"));
        assert_eq!(decl.artifact_type, "json");
    }
}
