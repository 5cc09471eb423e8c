//! Pattern generation: group facts, derive a rule per group, upsert by
//! signature.

use std::collections::BTreeMap;
use std::sync::Arc;

use aeroschema_core::{
    FactId, FactNode, NodeFact, Pattern, PatternDraft, PatternScope, SynonymTable,
    normalize_section_path,
};
use aeroschema_store::{CatalogStore, StoreError, UpsertOutcome};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::EngineError;
use crate::rule::{derive_rule, signature_hash};

/// Facts sharing a key fold into one pattern.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupKey {
    pub scope: PatternScope,
    pub section_path: String,
    /// Synonym-canonical node type.
    pub node_type_key: String,
}

/// Outcome of one generation pass.
#[derive(Debug, Clone, Default)]
pub struct GenerationReport {
    pub groups: usize,
    pub inserted: usize,
    pub updated: usize,
    pub patterns: Vec<Pattern>,
}

/// Derives patterns from facts and writes them through the store's atomic
/// upsert.
pub struct PatternGenerator {
    store: Arc<dyn CatalogStore>,
    synonyms: SynonymTable,
    max_attempts: u32,
}

impl PatternGenerator {
    pub const DEFAULT_ATTEMPTS: u32 = 3;

    pub fn new(store: Arc<dyn CatalogStore>, synonyms: SynonymTable) -> Self {
        Self {
            store,
            synonyms,
            max_attempts: Self::DEFAULT_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn synonyms(&self) -> &SynonymTable {
        &self.synonyms
    }

    pub fn group_key(&self, fact: &NodeFact) -> GroupKey {
        GroupKey {
            scope: PatternScope::new(&fact.workspace, &fact.spec_version, &fact.message_root),
            section_path: normalize_section_path(&fact.section_path),
            node_type_key: self.synonyms.canonical(&fact.node_type),
        }
    }

    /// Facts grouped by key, in key order.
    pub fn group<'a>(&self, facts: &'a [NodeFact]) -> BTreeMap<GroupKey, Vec<&'a NodeFact>> {
        let mut groups: BTreeMap<GroupKey, Vec<&NodeFact>> = BTreeMap::new();
        for fact in facts {
            groups.entry(self.group_key(fact)).or_default().push(fact);
        }
        groups
    }

    /// Canonical draft for one non-empty group.
    pub fn draft(&self, key: &GroupKey, facts: &[&NodeFact]) -> Result<PatternDraft, EngineError> {
        let payloads: Vec<&FactNode> = facts.iter().map(|f| &f.payload).collect();
        let rule = derive_rule(&payloads);
        let signature = signature_hash(&rule, &key.scope, &key.section_path, &key.node_type_key)?;
        // Smallest spelling, so the display name is order independent too.
        let node_type = facts
            .iter()
            .map(|f| f.node_type.as_str())
            .min()
            .unwrap_or(key.node_type_key.as_str())
            .to_string();
        Ok(PatternDraft {
            scope: key.scope.clone(),
            section_path: key.section_path.clone(),
            node_type,
            rule,
            signature_hash: signature,
        })
    }

    /// Fold `facts` into the catalog, one upsert per group.
    ///
    /// A group of `n` facts adds `n` to its pattern's usage counter.
    pub fn generate(&self, facts: &[NodeFact]) -> Result<GenerationReport, EngineError> {
        let groups = self.group(facts);
        let mut report = GenerationReport {
            groups: groups.len(),
            ..GenerationReport::default()
        };
        for (key, members) in &groups {
            let draft = self.draft(key, members)?;
            let outcome = self.upsert(&draft, members.len() as u64, &example_ids(members))?;
            if outcome.inserted {
                report.inserted += 1;
            } else {
                report.updated += 1;
            }
            report.patterns.push(outcome.pattern);
        }
        info!(
            facts = facts.len(),
            groups = report.groups,
            inserted = report.inserted,
            updated = report.updated,
            "pattern generation complete"
        );
        Ok(report)
    }

    /// Single-fact generation used for NEW_PATTERN verdicts.
    pub fn mint(&self, fact: &NodeFact) -> Result<UpsertOutcome, EngineError> {
        let key = self.group_key(fact);
        let draft = self.draft(&key, &[fact])?;
        self.upsert(&draft, 1, &example_ids(&[fact]))
    }

    /// Upsert, retrying signature conflicts up to the attempt limit.
    pub fn upsert(
        &self,
        draft: &PatternDraft,
        seen: u64,
        examples: &[FactId],
    ) -> Result<UpsertOutcome, EngineError> {
        let mut attempt = 1;
        loop {
            match self.store.upsert_pattern(draft, seen, examples, Utc::now()) {
                Ok(outcome) => {
                    debug!(
                        signature = %draft.signature_hash,
                        pattern_id = outcome.pattern.id,
                        inserted = outcome.inserted,
                        "pattern upserted"
                    );
                    return Ok(outcome);
                }
                Err(StoreError::CatalogConflict { signature }) => {
                    if attempt >= self.max_attempts {
                        return Err(EngineError::ConflictRetriesExhausted {
                            signature,
                            attempts: attempt,
                        });
                    }
                    warn!(%signature, attempt, "pattern upsert conflicted, retrying");
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn example_ids(facts: &[&NodeFact]) -> Vec<FactId> {
    let mut ids: Vec<FactId> = facts.iter().filter_map(|f| f.id).collect();
    ids.sort_unstable();
    ids.truncate(Pattern::MAX_EXAMPLES);
    ids
}
