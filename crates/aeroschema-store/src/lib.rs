//! Storage layer: one isolated catalog per workspace.
//!
//! [`CatalogStore`] is the persistence seam the engine and the run
//! coordinator write through. Every store instance serves exactly one
//! workspace and rejects records tagged with any other. Pattern writes go
//! through [`CatalogStore::upsert_pattern`] and
//! [`CatalogStore::merge_patterns`], which are atomic per signature, so
//! concurrent workers never produce duplicate pattern rows.

mod error;
mod memory;
mod registry;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use registry::{Backend, WorkspaceRegistry};

#[cfg(feature = "duckdb")]
mod duck;
#[cfg(feature = "duckdb")]
pub use duck::DuckStore;

use aeroschema_core::{
    FactId, NodeFact, Pattern, PatternDraft, PatternId, PatternMatch, PatternScope, Run,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Result of a pattern upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOutcome {
    pub pattern: Pattern,
    /// A new row was created rather than an existing one incremented.
    pub inserted: bool,
}

/// Persistence for one workspace.
pub trait CatalogStore: Send + Sync {
    fn workspace(&self) -> &str;

    fn create_run(&self, run: &Run) -> Result<(), StoreError>;
    fn update_run(&self, run: &Run) -> Result<(), StoreError>;
    fn get_run(&self, id: Uuid) -> Result<Run, StoreError>;
    /// Runs newest first.
    fn list_runs(&self) -> Result<Vec<Run>, StoreError>;

    /// Batch insert. Assigns `id` on every fact.
    fn insert_facts(&self, facts: &mut [NodeFact]) -> Result<(), StoreError>;
    fn get_fact(&self, id: FactId) -> Result<NodeFact, StoreError>;
    /// Facts of one run ordered by id.
    fn facts_for_run(&self, run_id: Uuid) -> Result<Vec<NodeFact>, StoreError>;

    /// Insert a pattern for the draft's signature, or bump the existing one.
    ///
    /// `seen` is added to `times_seen` (and is the initial value on insert);
    /// `examples` are appended up to [`Pattern::MAX_EXAMPLES`].
    fn upsert_pattern(
        &self,
        draft: &PatternDraft,
        seen: u64,
        examples: &[FactId],
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError>;

    /// Count one more structural match against an existing pattern.
    fn record_pattern_hit(&self, id: PatternId, now: DateTime<Utc>) -> Result<(), StoreError>;

    fn get_pattern(&self, id: PatternId) -> Result<Pattern, StoreError>;

    /// Active patterns of one (workspace, version, root) scope ordered by id.
    fn patterns_in_scope(&self, scope: &PatternScope) -> Result<Vec<Pattern>, StoreError>;

    /// Every pattern in the workspace ordered by id.
    fn list_patterns(&self, include_inactive: bool) -> Result<Vec<Pattern>, StoreError>;

    /// Fold `members` into the pattern for `draft` in one step.
    ///
    /// The survivor carries the summed usage count of all members and stays
    /// active; every other member is deactivated with `superseded_by` set to
    /// the survivor.
    fn merge_patterns(
        &self,
        draft: &PatternDraft,
        members: &[PatternId],
        now: DateTime<Utc>,
    ) -> Result<Pattern, StoreError>;

    /// Insert a match. Assigns `id`. One match per (run, fact).
    fn insert_match(&self, m: &mut PatternMatch) -> Result<(), StoreError>;
    /// Matches of one run ordered by id.
    fn matches_for_run(&self, run_id: Uuid) -> Result<Vec<PatternMatch>, StoreError>;

    /// Drop every fact and match written by a run. Returns rows removed.
    fn discard_run_results(&self, run_id: Uuid) -> Result<usize, StoreError>;
}

/// Reject a record from another workspace.
pub(crate) fn check_workspace(expected: &str, found: &str) -> Result<(), StoreError> {
    if expected == found {
        Ok(())
    } else {
        Err(StoreError::WorkspaceMismatch {
            expected: expected.to_string(),
            found: found.to_string(),
        })
    }
}

/// Survivor bookkeeping shared by the backends: the summed usage count, the
/// earliest first-seen and the merged example list of a member set.
pub(crate) fn fold_members(members: &[Pattern]) -> (u64, Option<DateTime<Utc>>, Vec<FactId>) {
    let total = members.iter().map(|p| p.times_seen).sum();
    let first_seen = members.iter().map(|p| p.first_seen).min();
    let mut examples = Vec::new();
    for p in members {
        for id in &p.example_fact_ids {
            if examples.len() < Pattern::MAX_EXAMPLES && !examples.contains(id) {
                examples.push(*id);
            }
        }
    }
    (total, first_seen, examples)
}
