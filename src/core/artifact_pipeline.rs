//! Act phase: order sinks by their artifact dependencies and drive them.
//!
//! The whole plan is validated before any sink writes:
//! - every consumed reference resolves to exactly one declared artifact
//! - the sink graph is acyclic (grouped into topological levels)
//! - no sink, and no artifact, sits below the level of what it holds
//!
//! Levels run in order; sinks inside a level run one after another.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::adapters::{Sink, SinkInput};
use crate::domain::{Artifact, ArtifactReference, CycleResult, SecurityLevel};

pub use super::artifact_store::{ArtifactError, ArtifactStore};

/// An artifact as declared by its sink, before anything is written
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedArtifact {
    pub id: String,
    pub name: String,
    pub artifact_type: String,
    pub alias: Option<String>,
    pub security_level: SecurityLevel,
    pub producer: String,
}

impl PlannedArtifact {
    fn matches(&self, reference: &ArtifactReference) -> bool {
        match reference {
            ArtifactReference::Id(id) => &self.id == id,
            ArtifactReference::Alias(alias) => self.alias.as_deref() == Some(alias.as_str()),
            ArtifactReference::Type(t) => &self.artifact_type == t,
        }
    }
}

/// Validated execution order for a set of sinks
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    /// Sink names grouped by topological level
    pub levels: Vec<Vec<String>>,

    /// Resolved artifact ids each sink consumes, in declaration order
    pub inputs: HashMap<String, Vec<String>>,

    pub artifacts: Vec<PlannedArtifact>,
}

pub struct ArtifactPipeline {
    sinks: Vec<Arc<dyn Sink>>,
}

impl ArtifactPipeline {
    pub fn new(sinks: Vec<Arc<dyn Sink>>) -> Self {
        Self { sinks }
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Resolve, order and security-check every sink
    pub fn plan(&self, payload_level: SecurityLevel) -> Result<ExecutionPlan, ArtifactError> {
        let mut seen = HashSet::new();
        for sink in &self.sinks {
            if !seen.insert(sink.name().to_string()) {
                return Err(ArtifactError::DuplicateSink(sink.name().to_string()));
            }
        }

        // Declared outputs
        let mut artifacts: Vec<PlannedArtifact> = Vec::new();
        for sink in &self.sinks {
            for decl in sink.produces() {
                let id = Artifact::id_for(sink.name(), &decl.name);
                if artifacts.iter().any(|a| a.id == id) {
                    return Err(ArtifactError::DuplicateId(id));
                }
                artifacts.push(PlannedArtifact {
                    id,
                    name: decl.name,
                    artifact_type: decl.artifact_type,
                    alias: decl.alias,
                    security_level: decl.security_level.unwrap_or_else(|| sink.security_level()),
                    producer: sink.name().to_string(),
                });
            }
        }

        // Resolve inputs and build producer -> consumer edges
        let mut inputs: HashMap<String, Vec<String>> = HashMap::new();
        let mut adj: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        for sink in &self.sinks {
            adj.entry(sink.name()).or_default();
            in_degree.entry(sink.name()).or_insert(0);
        }

        for sink in &self.sinks {
            let mut ids = Vec::new();
            let mut producers: HashSet<&str> = HashSet::new();

            for reference in sink.consumes() {
                let candidates: Vec<&PlannedArtifact> =
                    artifacts.iter().filter(|a| a.matches(&reference)).collect();
                let artifact = match candidates.as_slice() {
                    [] => {
                        return Err(ArtifactError::Unresolved {
                            sink: sink.name().to_string(),
                            reference: reference.to_string(),
                        })
                    }
                    [one] => *one,
                    many => {
                        return Err(ArtifactError::Ambiguous {
                            reference: reference.to_string(),
                            candidates: many.iter().map(|a| a.id.clone()).collect(),
                        })
                    }
                };

                if producers.insert(artifact.producer.as_str()) {
                    adj.entry(artifact.producer.as_str())
                        .or_default()
                        .push(sink.name());
                    *in_degree.entry(sink.name()).or_insert(0) += 1;
                }
                ids.push(artifact.id.clone());
            }

            inputs.insert(sink.name().to_string(), ids);
        }

        self.check_security(payload_level, &artifacts, &inputs)?;

        // BFS topological sort, grouped by level
        let order: HashMap<&str, usize> = self
            .sinks
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name(), i))
            .collect();

        let mut levels: Vec<Vec<String>> = Vec::new();
        let mut remaining = self.sinks.len();
        let mut current: Vec<&str> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(name, _)| *name)
            .collect();
        current.sort_by_key(|n| order.get(*n).copied());

        while !current.is_empty() {
            remaining -= current.len();

            let mut next: Vec<&str> = Vec::new();
            for name in &current {
                if let Some(dependents) = adj.get(name) {
                    for dependent in dependents {
                        if let Some(deg) = in_degree.get_mut(dependent) {
                            *deg -= 1;
                            if *deg == 0 {
                                next.push(*dependent);
                            }
                        }
                    }
                }
            }

            levels.push(current.iter().map(|s| s.to_string()).collect());
            next.sort_by_key(|n| order.get(*n).copied());
            current = next;
        }

        if remaining > 0 {
            let processed: HashSet<&String> = levels.iter().flatten().collect();
            let sinks = self
                .sinks
                .iter()
                .map(|s| s.name().to_string())
                .filter(|n| !processed.contains(n))
                .collect();
            return Err(ArtifactError::Cycle { sinks });
        }

        Ok(ExecutionPlan {
            levels,
            inputs,
            artifacts,
        })
    }

    fn check_security(
        &self,
        payload_level: SecurityLevel,
        artifacts: &[PlannedArtifact],
        inputs: &HashMap<String, Vec<String>>,
    ) -> Result<(), ArtifactError> {
        let level_of = |id: &str| -> SecurityLevel {
            artifacts
                .iter()
                .find(|a| a.id == id)
                .map(|a| a.security_level)
                .unwrap_or_default()
        };

        for sink in &self.sinks {
            let consumed_max = inputs
                .get(sink.name())
                .into_iter()
                .flatten()
                .map(|id| level_of(id))
                .max()
                .unwrap_or_default();
            let required = payload_level.max(consumed_max);

            if sink.security_level() < required {
                return Err(ArtifactError::SecurityViolation {
                    sink: sink.name().to_string(),
                    subject: "security level".to_string(),
                    declared: sink.security_level(),
                    required,
                });
            }

            for artifact in artifacts.iter().filter(|a| a.producer == sink.name()) {
                if artifact.security_level < required {
                    return Err(ArtifactError::SecurityViolation {
                        sink: sink.name().to_string(),
                        subject: format!("output '{}'", artifact.name),
                        declared: artifact.security_level,
                        required,
                    });
                }
            }
        }

        Ok(())
    }

    /// Plan, then write every sink level by level
    #[instrument(skip(self, result), fields(cycle = %result.cycle))]
    pub async fn execute(
        &self,
        result: &CycleResult,
        payload_level: SecurityLevel,
    ) -> Result<ArtifactStore, ArtifactError> {
        let plan = self.plan(payload_level)?;
        let sinks: HashMap<&str, &Arc<dyn Sink>> =
            self.sinks.iter().map(|s| (s.name(), s)).collect();
        let mut store = ArtifactStore::new();

        for (depth, level) in plan.levels.iter().enumerate() {
            debug!(level = depth, sinks = ?level, "Executing sink level");

            for name in level {
                let Some(sink) = sinks.get(name.as_str()) else {
                    continue;
                };

                let consumed: Vec<Artifact> = plan
                    .inputs
                    .get(name)
                    .into_iter()
                    .flatten()
                    .map(|id| store.resolve(&ArtifactReference::Id(id.clone())).cloned())
                    .collect::<Result<_, _>>()?;

                let produced = sink
                    .write(SinkInput {
                        result,
                        consumed: &consumed,
                    })
                    .await
                    .map_err(|e| ArtifactError::SinkFailed {
                        sink: name.clone(),
                        message: format!("{:#}", e),
                    })?;

                let declared: Vec<&PlannedArtifact> = plan
                    .artifacts
                    .iter()
                    .filter(|a| &a.producer == name)
                    .collect();

                for output in produced {
                    let Some(decl) = declared.iter().find(|a| a.name == output.name) else {
                        return Err(ArtifactError::Undeclared {
                            sink: name.clone(),
                            name: output.name,
                        });
                    };
                    store.register(Artifact {
                        id: decl.id.clone(),
                        artifact_type: decl.artifact_type.clone(),
                        alias: decl.alias.clone(),
                        security_level: decl.security_level,
                        produced_by: name.clone(),
                        payload: output.payload,
                        created_at: Utc::now(),
                    })?;
                }

                if let Some(missing) = declared.iter().find(|a| store.get(&a.id).is_none()) {
                    return Err(ArtifactError::MissingOutput {
                        sink: name.clone(),
                        name: missing.name.clone(),
                    });
                }

                info!(sink = %name, "Sink written");
            }
        }

        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ProducedArtifact;
    use crate::domain::{ArtifactDeclaration, CycleStats};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeMap;

    struct TestSink {
        name: &'static str,
        produces: Vec<ArtifactDeclaration>,
        consumes: Vec<ArtifactReference>,
        level: SecurityLevel,
    }

    impl TestSink {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                produces: Vec::new(),
                consumes: Vec::new(),
                level: SecurityLevel::Public,
            }
        }

        fn producing(mut self, name: &str, t: &str) -> Self {
            self.produces.push(ArtifactDeclaration::new(name, t));
            self
        }

        fn consuming(mut self, reference: &str) -> Self {
            self.consumes.push(reference.parse().unwrap());
            self
        }
    }

    #[async_trait]
    impl Sink for TestSink {
        fn name(&self) -> &str {
            self.name
        }

        fn produces(&self) -> Vec<ArtifactDeclaration> {
            self.produces.clone()
        }

        fn consumes(&self) -> Vec<ArtifactReference> {
            self.consumes.clone()
        }

        fn security_level(&self) -> SecurityLevel {
            self.level
        }

        async fn write(&self, input: SinkInput<'_>) -> anyhow::Result<Vec<ProducedArtifact>> {
            Ok(self
                .produces
                .iter()
                .map(|d| ProducedArtifact::new(&d.name, json!({"inputs": input.consumed.len()})))
                .collect())
        }
    }

    fn result() -> CycleResult {
        CycleResult {
            cycle: "c".into(),
            outcomes: vec![],
            aggregates: BTreeMap::new(),
            halted: None,
            stats: CycleStats::default(),
            started_at: Utc::now(),
            completed_at: Utc::now(),
        }
    }

    fn pipeline(sinks: Vec<TestSink>) -> ArtifactPipeline {
        ArtifactPipeline::new(
            sinks
                .into_iter()
                .map(|s| Arc::new(s) as Arc<dyn Sink>)
                .collect(),
        )
    }

    #[test]
    fn test_levels_follow_dependencies() {
        let p = pipeline(vec![
            TestSink::new("report").consuming("rows.data"),
            TestSink::new("rows").producing("data", "jsonl"),
        ]);
        let plan = p.plan(SecurityLevel::Public).unwrap();
        assert_eq!(plan.levels, vec![vec!["rows".to_string()], vec!["report".to_string()]]);
        assert_eq!(plan.inputs["report"], vec!["rows.data".to_string()]);
    }

    #[test]
    fn test_unresolved_reference() {
        let p = pipeline(vec![TestSink::new("report").consuming("@missing")]);
        assert!(matches!(
            p.plan(SecurityLevel::Public),
            Err(ArtifactError::Unresolved { .. })
        ));
    }

    #[test]
    fn test_self_consumption_is_a_cycle() {
        let p = pipeline(vec![TestSink::new("loop")
            .producing("out", "json")
            .consuming("loop.out")]);
        assert!(matches!(
            p.plan(SecurityLevel::Public),
            Err(ArtifactError::Cycle { .. })
        ));
    }

    #[test]
    fn test_payload_level_applies_to_every_sink() {
        let p = pipeline(vec![TestSink::new("rows").producing("data", "jsonl")]);
        assert!(p.plan(SecurityLevel::Public).is_ok());
        assert!(matches!(
            p.plan(SecurityLevel::Internal),
            Err(ArtifactError::SecurityViolation { .. })
        ));
    }

    #[tokio::test]
    async fn test_execute_registers_outputs() {
        let p = pipeline(vec![
            TestSink::new("rows").producing("data", "jsonl"),
            TestSink::new("report").producing("summary", "json").consuming("type:jsonl"),
        ]);
        let store = p.execute(&result(), SecurityLevel::Public).await.unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("report.summary").unwrap().payload, json!({"inputs": 1}));
    }
}
