//! Run lifecycle, run metadata, and the coverage report attached to identify Runs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Importance;
use crate::pattern::Verdict;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    /// Learn patterns from a document.
    Discovery,
    /// Match a document against the learned catalog.
    Identify,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::Identify => "identify",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "discovery" => Some(Self::Discovery),
            "identify" => Some(Self::Identify),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Started,
    InProgress,
    Completed,
    Failed,
    PartialFailure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::PartialFailure => "partial_failure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "started" => Some(Self::Started),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "partial_failure" => Some(Self::PartialFailure),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::PartialFailure)
    }

    /// Terminal status from subtree accounting.
    ///
    /// Every subtree failing is a failure; some failing is partial; a Run
    /// with no subtrees at all completed (there was nothing to do).
    pub fn settle(succeeded: usize, failed: usize) -> Self {
        match (succeeded, failed) {
            (_, 0) => Self::Completed,
            (0, _) => Self::Failed,
            _ => Self::PartialFailure,
        }
    }
}

/// Non-fatal condition recorded against a Run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunWarning {
    /// Document carried no usable version; the most recent supported one was assumed.
    VersionFallback { assumed: String },
    /// Detected version was parsed but is not in the supported list.
    UnsupportedVersion { detected: String },
    /// No target paths are configured for the detected version and message root.
    ConfigurationGap {
        spec_version: String,
        message_root: String,
    },
    /// A target subtree exceeded the size ceiling and was cut short.
    TruncatedSubtree { section_path: String, ordinal: u32 },
    /// The Run timeout elapsed before every subtree finished.
    ///
    /// `outstanding` counts subtrees that were running, waiting for a worker
    /// or parsed and queued. Parts of the document the parser had not yet
    /// reached are not counted.
    TimedOut { outstanding: usize },
}

/// One subtree whose extraction failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtreeFailure {
    pub section_path: String,
    pub ordinal: u32,
    pub message: String,
}

/// Coverage of one importance tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TierCoverage {
    pub expected: usize,
    pub covered: usize,
    /// `covered / expected` as a percentage; 100 when nothing is expected.
    pub coverage_pct: f64,
}

/// Coverage and gap summary of one identify Run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GapReport {
    pub tiers: BTreeMap<Importance, TierCoverage>,
    /// Critical sections configured but absent from the document.
    pub missing_critical: Vec<String>,
    /// Expected sections present in the document but never matched.
    pub unmatched_sections: Vec<String>,
    pub verdict_counts: BTreeMap<Verdict, usize>,
    /// Weighted quality score in `[0, 1]`.
    pub quality_score: f64,
}

/// One processing job over one uploaded document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub workspace: String,
    pub kind: RunKind,
    pub status: RunStatus,
    pub spec_version: Option<String>,
    pub message_root: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_detail: Option<String>,
    pub warnings: Vec<RunWarning>,
    pub subtree_failures: Vec<SubtreeFailure>,
    pub subtrees_seen: usize,
    pub subtrees_succeeded: usize,
    pub gap_report: Option<GapReport>,
}

impl Run {
    pub fn new(workspace: impl Into<String>, kind: RunKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            workspace: workspace.into(),
            kind,
            status: RunStatus::Started,
            spec_version: None,
            message_root: None,
            started_at: Utc::now(),
            finished_at: None,
            error_detail: None,
            warnings: Vec::new(),
            subtree_failures: Vec::new(),
            subtrees_seen: 0,
            subtrees_succeeded: 0,
            gap_report: None,
        }
    }

    /// Move to a terminal status and stamp the finish time.
    pub fn finish(&mut self, status: RunStatus, error_detail: Option<String>) {
        self.status = status;
        self.error_detail = error_detail;
        self.finished_at = Some(Utc::now());
    }
}

/// What the layer above the core sees once a Run is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub kind: RunKind,
    pub status: RunStatus,
    pub node_facts_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patterns_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matches_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gap_report: Option<GapReport>,
}
