//! Artifacts produced and consumed by output sinks.
//!
//! An artifact is identified as `<sink>.<name>`; it may additionally be
//! addressed by an alias or by its type.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Classification of data. Ordered from least to most sensitive.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    #[default]
    Public,
    Internal,
    Confidential,
    Restricted,
    Secret,
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Public => "public",
            Self::Internal => "internal",
            Self::Confidential => "confidential",
            Self::Restricted => "restricted",
            Self::Secret => "secret",
        };
        f.write_str(name)
    }
}

/// What a sink offers to other sinks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDeclaration {
    /// Name, unique within the producing sink
    pub name: String,

    /// Free-form type tag (e.g. "json", "jsonl", "manifest")
    #[serde(rename = "type")]
    pub artifact_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    /// Level of the data the artifact carries; defaults to the sink's own level
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_level: Option<SecurityLevel>,
}

impl ArtifactDeclaration {
    pub fn new(name: impl Into<String>, artifact_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            artifact_type: artifact_type.into(),
            alias: None,
            security_level: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_security_level(mut self, level: SecurityLevel) -> Self {
        self.security_level = Some(level);
        self
    }
}

/// How a sink names an artifact it needs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactReference {
    /// Exact `<sink>.<name>` identifier
    Id(String),
    Alias(String),
    Type(String),
}

impl fmt::Display for ArtifactReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{}", id),
            Self::Alias(alias) => write!(f, "@{}", alias),
            Self::Type(t) => write!(f, "type:{}", t),
        }
    }
}

impl FromStr for ArtifactReference {
    type Err = String;

    /// Parses `@alias`, `type:<type>` or a bare `<sink>.<name>` id
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(alias) = s.strip_prefix('@') {
            if alias.is_empty() {
                return Err("empty alias reference".to_string());
            }
            return Ok(Self::Alias(alias.to_string()));
        }
        if let Some(t) = s.strip_prefix("type:") {
            if t.is_empty() {
                return Err("empty type reference".to_string());
            }
            return Ok(Self::Type(t.to_string()));
        }
        if s.is_empty() {
            return Err("empty artifact reference".to_string());
        }
        Ok(Self::Id(s.to_string()))
    }
}

/// A concrete artifact produced during the act phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// `<sink>.<name>`
    pub id: String,

    #[serde(rename = "type")]
    pub artifact_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    pub security_level: SecurityLevel,

    /// Name of the sink that produced it
    pub produced_by: String,

    /// Content or a descriptor (e.g. path and digest) of the written output
    pub payload: Value,

    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn id_for(sink: &str, name: &str) -> String {
        format!("{}.{}", sink, name)
    }

    /// Whether this artifact answers the given reference
    pub fn matches(&self, reference: &ArtifactReference) -> bool {
        match reference {
            ArtifactReference::Id(id) => &self.id == id,
            ArtifactReference::Alias(alias) => self.alias.as_deref() == Some(alias.as_str()),
            ArtifactReference::Type(t) => &self.artifact_type == t,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_level_ordering() {
        assert!(SecurityLevel::Public < SecurityLevel::Internal);
        assert!(SecurityLevel::Confidential < SecurityLevel::Secret);
        assert_eq!(SecurityLevel::default(), SecurityLevel::Public);
    }

    #[test]
    fn test_reference_parsing() {
        assert_eq!(
            "@scores".parse::<ArtifactReference>().unwrap(),
            ArtifactReference::Alias("scores".into())
        );
        assert_eq!(
            "type:jsonl".parse::<ArtifactReference>().unwrap(),
            ArtifactReference::Type("jsonl".into())
        );
        assert_eq!(
            "results.outcomes".parse::<ArtifactReference>().unwrap(),
            ArtifactReference::Id("results.outcomes".into())
        );
        assert!("@".parse::<ArtifactReference>().is_err());
    }

    #[test]
    fn test_reference_yaml_form() {
        let r: ArtifactReference = serde_yaml::from_str("alias: scores").unwrap();
        assert_eq!(r, ArtifactReference::Alias("scores".into()));
    }
}
