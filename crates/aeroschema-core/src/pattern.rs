//! Patterns, decision rules, and match verdicts.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fact::FactId;

pub type PatternId = u64;

/// Version scope of the pattern catalog.
///
/// Patterns are only ever compared within one scope; the same structure
/// under another spec version is a different pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PatternScope {
    pub workspace: String,
    pub spec_version: String,
    pub message_root: String,
}

impl PatternScope {
    pub fn new(
        workspace: impl Into<String>,
        spec_version: impl Into<String>,
        message_root: impl Into<String>,
    ) -> Self {
        Self {
            workspace: workspace.into(),
            spec_version: spec_version.into(),
            message_root: message_root.into(),
        }
    }
}

/// Whether a rule element was seen in every fact of its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Must,
    Optional,
}

/// Structural fingerprint of one child node type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildShape {
    /// Present in every parent of the group.
    pub required: bool,
    pub must_have_attributes: BTreeSet<String>,
    pub optional_attributes: BTreeSet<String>,
    /// Nested child shapes, keyed by child node type. Empty at the depth bound.
    pub children: BTreeMap<String, ChildShape>,
}

impl ChildShape {
    pub fn all_attributes(&self) -> BTreeSet<String> {
        self.must_have_attributes
            .union(&self.optional_attributes)
            .cloned()
            .collect()
    }
}

/// Canonical structural rule of a pattern.
///
/// Only ordered collections are used so that serialisation is canonical:
/// keys sorted, sets sorted, no example values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRule {
    pub must_have_attributes: BTreeSet<String>,
    pub optional_attributes: BTreeSet<String>,
    pub child_structure: BTreeMap<String, ChildShape>,
    pub reference_patterns: BTreeMap<String, Presence>,
}

impl DecisionRule {
    /// Canonical serialisation fed to the signature hash.
    pub fn canonical_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn all_attributes(&self) -> BTreeSet<String> {
        self.must_have_attributes
            .union(&self.optional_attributes)
            .cloned()
            .collect()
    }
}

/// A pattern ready to be upserted, before the store assigns identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternDraft {
    pub scope: PatternScope,
    pub section_path: String,
    pub node_type: String,
    pub rule: DecisionRule,
    pub signature_hash: String,
}

/// A version-scoped structural template shared across Runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub id: PatternId,
    pub workspace: String,
    pub spec_version: String,
    pub message_root: String,
    pub section_path: String,
    pub node_type: String,
    pub rule: DecisionRule,
    pub signature_hash: String,
    pub times_seen: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// First few NodeFacts that produced or matched this pattern.
    pub example_fact_ids: Vec<FactId>,
    pub active: bool,
    pub superseded_by: Option<PatternId>,
}

impl Pattern {
    /// Maximum number of example fact ids retained per pattern.
    pub const MAX_EXAMPLES: usize = 5;

    pub fn scope(&self) -> PatternScope {
        PatternScope::new(&self.workspace, &self.spec_version, &self.message_root)
    }

    /// Append example fact ids, keeping the oldest up to [`Self::MAX_EXAMPLES`].
    pub fn push_examples(&mut self, ids: &[FactId]) {
        for id in ids {
            if self.example_fact_ids.len() >= Self::MAX_EXAMPLES {
                break;
            }
            if !self.example_fact_ids.contains(id) {
                self.example_fact_ids.push(*id);
            }
        }
    }
}

/// Classification of one NodeFact against the pattern catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    ExactMatch,
    HighMatch,
    PartialMatch,
    LowMatch,
    NoMatch,
    NewPattern,
}

impl Verdict {
    pub const EXACT_THRESHOLD: f64 = 0.95;
    pub const HIGH_THRESHOLD: f64 = 0.85;
    pub const PARTIAL_THRESHOLD: f64 = 0.70;
    pub const LOW_THRESHOLD: f64 = 0.50;

    // Absorbs summation error so that a boundary score lands in the upper tier.
    const EPSILON: f64 = 1e-9;

    /// Verdict for the best score among a non-empty candidate set.
    ///
    /// Lower bounds are inclusive: exactly 0.95 is an exact match.
    pub fn from_score(score: f64) -> Self {
        let s = score + Self::EPSILON;
        if s >= Self::EXACT_THRESHOLD {
            Self::ExactMatch
        } else if s >= Self::HIGH_THRESHOLD {
            Self::HighMatch
        } else if s >= Self::PARTIAL_THRESHOLD {
            Self::PartialMatch
        } else if s >= Self::LOW_THRESHOLD {
            Self::LowMatch
        } else {
            Self::NoMatch
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExactMatch => "EXACT_MATCH",
            Self::HighMatch => "HIGH_MATCH",
            Self::PartialMatch => "PARTIAL_MATCH",
            Self::LowMatch => "LOW_MATCH",
            Self::NoMatch => "NO_MATCH",
            Self::NewPattern => "NEW_PATTERN",
        }
    }

    /// Whether the verdict ties the fact to an existing pattern.
    pub fn is_match(&self) -> bool {
        matches!(
            self,
            Self::ExactMatch | Self::HighMatch | Self::PartialMatch | Self::LowMatch
        )
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-factor similarity scores, each in `[0, 1]`, and their weighted total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub node_type: f64,
    pub attributes: f64,
    pub children: f64,
    pub references: f64,
    pub total: f64,
}

/// Result of comparing one NodeFact against the catalog in an identify Run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternMatch {
    pub id: Option<u64>,
    pub run_id: Uuid,
    pub workspace: String,
    pub node_fact_id: FactId,
    pub section_path: String,
    /// Matched or minted pattern; `None` only when nothing could be recorded.
    pub pattern_id: Option<PatternId>,
    pub verdict: Verdict,
    pub confidence: f64,
    pub breakdown: Option<ScoreBreakdown>,
    pub candidates_considered: usize,
    pub created_at: DateTime<Utc>,
}
