pub mod config;
pub mod fact;
pub mod normalize;
pub mod pattern;
pub mod run;

pub use config::{ConfigError, ExtractionConfig, Importance, Limits, Profile, TargetSpec};
pub use fact::{AttributeValue, ExtractedFact, FactId, FactNode, NodeFact, Reference};
pub use normalize::{SynonymTable, normalize_node_type, normalize_section_path, normalize_version};
pub use pattern::{
    ChildShape, DecisionRule, Pattern, PatternDraft, PatternId, PatternMatch, PatternScope,
    Presence, ScoreBreakdown, Verdict,
};
pub use run::{
    GapReport, Run, RunKind, RunStatus, RunSummary, RunWarning, SubtreeFailure, TierCoverage,
};
