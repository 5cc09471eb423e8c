//! Extraction configuration: which sections to extract, how important each is,
//! and the limits the streaming scan works under.
//!
//! The configuration is read-only from the engine's perspective. It is keyed
//! by (spec version, message root[, workspace]) so that each message family
//! can carry its own allow-list of target paths.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::normalize::{SynonymTable, join_path, normalize_version, split_path};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("config is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Importance tier of an expected section.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Importance {
    pub const ALL: [Importance; 4] = [Self::Critical, Self::High, Self::Medium, Self::Low];

    /// Contribution of this tier to the overall quality score.
    pub fn weight(&self) -> f64 {
        match self {
            Self::Critical => 0.4,
            Self::High => 0.3,
            Self::Medium => 0.2,
            Self::Low => 0.1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

/// One configured target section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSpec {
    /// `/`-separated local names. The message root may be omitted.
    pub path: String,
    /// Node type recorded on facts from this section; defaults to the last path segment.
    #[serde(default)]
    pub node_type: Option<String>,
    #[serde(default)]
    pub importance: Importance,
    /// Also extract this section when it is nested inside another target.
    #[serde(default)]
    pub independent: bool,
}

/// Target allow-list for one (spec version, message root[, workspace]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub spec_version: String,
    pub message_root: String,
    #[serde(default)]
    pub workspace: Option<String>,
    pub targets: Vec<TargetSpec>,
}

/// A resolved target: absolute segments plus its configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTarget {
    pub segments: Vec<String>,
    pub section_path: String,
    pub node_type: String,
    pub importance: Importance,
    pub independent: bool,
}

impl Profile {
    /// Targets as absolute paths rooted at the message root.
    pub fn resolved_targets(&self) -> Vec<ResolvedTarget> {
        self.targets
            .iter()
            .filter_map(|t| {
                let mut segments = split_path(&t.path);
                if segments.is_empty() {
                    return None;
                }
                if segments[0] != self.message_root {
                    segments.insert(0, self.message_root.clone());
                }
                let node_type = t
                    .node_type
                    .clone()
                    .or_else(|| segments.last().cloned())
                    .unwrap_or_default();
                Some(ResolvedTarget {
                    section_path: join_path(&segments),
                    segments,
                    node_type,
                    importance: t.importance,
                    independent: t.independent,
                })
            })
            .collect()
    }

    /// Expected sections and their tiers, keyed by normalised section path.
    pub fn expected_sections(&self) -> BTreeMap<String, Importance> {
        self.resolved_targets()
            .into_iter()
            .map(|t| (t.section_path, t.importance))
            .collect()
    }
}

/// A group of node-type names that denote the same concept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynonymGroup {
    /// Restrict the group to one spec version; `None` applies everywhere.
    #[serde(default)]
    pub spec_version: Option<String>,
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    /// Size ceiling of one target subtree, in bytes of names, attributes, and text.
    #[serde(default = "Limits::default_max_subtree_bytes")]
    pub max_subtree_bytes: usize,
}

impl Limits {
    fn default_max_subtree_bytes() -> usize {
        1024 * 1024
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_subtree_bytes: Self::default_max_subtree_bytes(),
        }
    }
}

/// Full extraction configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Known spec versions, oldest first. The last entry is the fallback.
    #[serde(default = "ExtractionConfig::default_versions")]
    pub supported_versions: Vec<String>,
    #[serde(default)]
    pub profiles: Vec<Profile>,
    #[serde(default)]
    pub synonyms: Vec<SynonymGroup>,
    /// Field names whose values are masked before extraction.
    #[serde(default = "ExtractionConfig::default_sensitive_fields")]
    pub sensitive_fields: Vec<String>,
    #[serde(default)]
    pub limits: Limits,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            supported_versions: Self::default_versions(),
            profiles: Vec::new(),
            synonyms: Vec::new(),
            sensitive_fields: Self::default_sensitive_fields(),
            limits: Limits::default(),
        }
    }
}

impl ExtractionConfig {
    fn default_versions() -> Vec<String> {
        ["17.2", "18.1", "18.2", "19.2", "20.1", "21.3"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn default_sensitive_fields() -> Vec<String> {
        [
            "GivenName",
            "Surname",
            "MiddleName",
            "Birthdate",
            "EmailAddressText",
            "PhoneNumber",
            "IdentityDocID",
            "LoyaltyProgramAccountID",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    /// Parse and validate a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_json::from_str(json)?;
        config.normalize()?;
        Ok(config)
    }

    /// Load a JSON configuration file.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        let config = Self::from_json(&json)?;
        tracing::info!(
            path = %path.display(),
            profiles = config.profiles.len(),
            "loaded extraction config"
        );
        Ok(config)
    }

    /// Canonicalise versions and reject unusable entries.
    fn normalize(&mut self) -> Result<(), ConfigError> {
        for v in &mut self.supported_versions {
            let normalized = normalize_version(v)
                .ok_or_else(|| ConfigError::Invalid(format!("unparseable version {v:?}")))?;
            *v = normalized;
        }
        for profile in &mut self.profiles {
            let version = normalize_version(&profile.spec_version).ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "profile {} has unparseable version {:?}",
                    profile.message_root, profile.spec_version
                ))
            })?;
            profile.spec_version = version;
            if profile.message_root.trim().is_empty() {
                return Err(ConfigError::Invalid("profile with empty message_root".into()));
            }
            if let Some(t) = profile.targets.iter().find(|t| split_path(&t.path).is_empty()) {
                return Err(ConfigError::Invalid(format!(
                    "profile {}/{} has an empty target path {:?}",
                    profile.spec_version, profile.message_root, t.path
                )));
            }
        }
        for group in &mut self.synonyms {
            if let Some(v) = &group.spec_version {
                group.spec_version = normalize_version(v);
            }
        }
        if self.limits.max_subtree_bytes == 0 {
            return Err(ConfigError::Invalid("max_subtree_bytes must be positive".into()));
        }
        Ok(())
    }

    /// Most recent supported version, assumed when a document names none.
    pub fn fallback_version(&self) -> Option<&str> {
        self.supported_versions.last().map(String::as_str)
    }

    pub fn is_supported(&self, version: &str) -> bool {
        self.supported_versions.iter().any(|v| v == version)
    }

    /// Profile for a (version, root), preferring a workspace-specific one.
    pub fn resolve(
        &self,
        spec_version: &str,
        message_root: &str,
        workspace: Option<&str>,
    ) -> Option<&Profile> {
        let candidates = self
            .profiles
            .iter()
            .filter(|p| p.spec_version == spec_version && p.message_root == message_root);
        let mut shared = None;
        for p in candidates {
            match (p.workspace.as_deref(), workspace) {
                (Some(pw), Some(w)) if pw == w => return Some(p),
                (None, _) if shared.is_none() => shared = Some(p),
                _ => {}
            }
        }
        shared
    }

    /// Synonym table in force for one spec version.
    pub fn synonyms_for(&self, spec_version: &str) -> SynonymTable {
        SynonymTable::from_groups(
            self.synonyms
                .iter()
                .filter(|g| g.spec_version.as_deref().is_none_or(|v| v == spec_version))
                .map(|g| g.names.iter()),
        )
    }
}
