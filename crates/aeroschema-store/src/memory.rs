//! In-process store backed by plain collections behind one mutex.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use aeroschema_core::{
    FactId, NodeFact, Pattern, PatternDraft, PatternId, PatternMatch, PatternScope, Run,
};
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::{CatalogStore, StoreError, UpsertOutcome, check_workspace, fold_members};

#[derive(Default)]
struct Tables {
    runs: HashMap<Uuid, Run>,
    facts: BTreeMap<FactId, NodeFact>,
    patterns: BTreeMap<PatternId, Pattern>,
    /// Unique index: (scope, signature) → pattern id.
    signatures: HashMap<(PatternScope, String), PatternId>,
    matches: BTreeMap<u64, PatternMatch>,
    /// Unique index: (run, fact) → one match.
    match_keys: HashSet<(Uuid, FactId)>,
    next_fact_id: FactId,
    next_pattern_id: PatternId,
    next_match_id: u64,
}

impl Tables {
    fn pattern_mut(&mut self, id: PatternId) -> Result<&mut Pattern, StoreError> {
        self.patterns
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("pattern", id))
    }

    /// Follow `superseded_by` from a merged-away pattern to its live survivor.
    fn live_id(&self, mut id: PatternId) -> PatternId {
        for _ in 0..self.patterns.len() {
            match self.patterns.get(&id) {
                Some(Pattern {
                    active: false,
                    superseded_by: Some(next),
                    ..
                }) => id = *next,
                _ => break,
            }
        }
        id
    }
}

/// Ephemeral store for one workspace.
///
/// Every operation takes the single table lock, so a pattern upsert is a
/// check-and-write with no window for a concurrent duplicate.
pub struct MemoryStore {
    workspace: String,
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new(workspace: impl Into<String>) -> Self {
        Self {
            workspace: workspace.into(),
            tables: Mutex::new(Tables::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl CatalogStore for MemoryStore {
    fn workspace(&self) -> &str {
        &self.workspace
    }

    fn create_run(&self, run: &Run) -> Result<(), StoreError> {
        check_workspace(&self.workspace, &run.workspace)?;
        self.lock()?.runs.insert(run.id, run.clone());
        Ok(())
    }

    fn update_run(&self, run: &Run) -> Result<(), StoreError> {
        check_workspace(&self.workspace, &run.workspace)?;
        let mut t = self.lock()?;
        let slot = t
            .runs
            .get_mut(&run.id)
            .ok_or_else(|| StoreError::not_found("run", run.id))?;
        *slot = run.clone();
        Ok(())
    }

    fn get_run(&self, id: Uuid) -> Result<Run, StoreError> {
        self.lock()?
            .runs
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("run", id))
    }

    fn list_runs(&self) -> Result<Vec<Run>, StoreError> {
        let mut runs: Vec<Run> = self.lock()?.runs.values().cloned().collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(a.id.cmp(&b.id)));
        Ok(runs)
    }

    fn insert_facts(&self, facts: &mut [NodeFact]) -> Result<(), StoreError> {
        for fact in facts.iter() {
            check_workspace(&self.workspace, &fact.workspace)?;
        }
        let mut t = self.lock()?;
        for fact in facts.iter_mut() {
            t.next_fact_id += 1;
            let id = t.next_fact_id;
            fact.id = Some(id);
            t.facts.insert(id, fact.clone());
        }
        Ok(())
    }

    fn get_fact(&self, id: FactId) -> Result<NodeFact, StoreError> {
        self.lock()?
            .facts
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("fact", id))
    }

    fn facts_for_run(&self, run_id: Uuid) -> Result<Vec<NodeFact>, StoreError> {
        Ok(self
            .lock()?
            .facts
            .values()
            .filter(|f| f.run_id == run_id)
            .cloned()
            .collect())
    }

    fn upsert_pattern(
        &self,
        draft: &PatternDraft,
        seen: u64,
        examples: &[FactId],
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        check_workspace(&self.workspace, &draft.scope.workspace)?;
        let mut t = self.lock()?;
        let key = (draft.scope.clone(), draft.signature_hash.clone());

        if let Some(id) = t.signatures.get(&key).copied() {
            let id = t.live_id(id);
            let pattern = t.pattern_mut(id)?;
            pattern.times_seen += seen;
            pattern.last_seen = now;
            pattern.push_examples(examples);
            debug!(pattern_id = id, times_seen = pattern.times_seen, "pattern incremented");
            return Ok(UpsertOutcome {
                pattern: pattern.clone(),
                inserted: false,
            });
        }

        t.next_pattern_id += 1;
        let id = t.next_pattern_id;
        let mut pattern = Pattern {
            id,
            workspace: draft.scope.workspace.clone(),
            spec_version: draft.scope.spec_version.clone(),
            message_root: draft.scope.message_root.clone(),
            section_path: draft.section_path.clone(),
            node_type: draft.node_type.clone(),
            rule: draft.rule.clone(),
            signature_hash: draft.signature_hash.clone(),
            times_seen: seen,
            first_seen: now,
            last_seen: now,
            example_fact_ids: Vec::new(),
            active: true,
            superseded_by: None,
        };
        pattern.push_examples(examples);
        t.signatures.insert(key, id);
        t.patterns.insert(id, pattern.clone());
        debug!(pattern_id = id, signature = %draft.signature_hash, "pattern inserted");
        Ok(UpsertOutcome {
            pattern,
            inserted: true,
        })
    }

    fn record_pattern_hit(&self, id: PatternId, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut t = self.lock()?;
        let pattern = t.pattern_mut(id)?;
        pattern.times_seen += 1;
        pattern.last_seen = now;
        Ok(())
    }

    fn get_pattern(&self, id: PatternId) -> Result<Pattern, StoreError> {
        self.lock()?
            .patterns
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("pattern", id))
    }

    fn patterns_in_scope(&self, scope: &PatternScope) -> Result<Vec<Pattern>, StoreError> {
        Ok(self
            .lock()?
            .patterns
            .values()
            .filter(|p| p.active && p.scope() == *scope)
            .cloned()
            .collect())
    }

    fn list_patterns(&self, include_inactive: bool) -> Result<Vec<Pattern>, StoreError> {
        Ok(self
            .lock()?
            .patterns
            .values()
            .filter(|p| include_inactive || p.active)
            .cloned()
            .collect())
    }

    fn merge_patterns(
        &self,
        draft: &PatternDraft,
        members: &[PatternId],
        now: DateTime<Utc>,
    ) -> Result<Pattern, StoreError> {
        check_workspace(&self.workspace, &draft.scope.workspace)?;
        let mut t = self.lock()?;
        let mut folded = Vec::with_capacity(members.len());
        for id in members {
            let p = t
                .patterns
                .get(id)
                .ok_or_else(|| StoreError::not_found("pattern", id))?;
            folded.push(p.clone());
        }
        let (total, first_seen, examples) = fold_members(&folded);
        let key = (draft.scope.clone(), draft.signature_hash.clone());

        let survivor_id = match t.signatures.get(&key).copied() {
            Some(id) => {
                let already_counted = members.contains(&id);
                let p = t.pattern_mut(id)?;
                p.times_seen = if already_counted {
                    total
                } else {
                    p.times_seen + total
                };
                p.last_seen = now;
                p.active = true;
                p.superseded_by = None;
                if let Some(first) = first_seen {
                    p.first_seen = p.first_seen.min(first);
                }
                p.push_examples(&examples);
                id
            }
            None => {
                t.next_pattern_id += 1;
                let id = t.next_pattern_id;
                let mut p = Pattern {
                    id,
                    workspace: draft.scope.workspace.clone(),
                    spec_version: draft.scope.spec_version.clone(),
                    message_root: draft.scope.message_root.clone(),
                    section_path: draft.section_path.clone(),
                    node_type: draft.node_type.clone(),
                    rule: draft.rule.clone(),
                    signature_hash: draft.signature_hash.clone(),
                    times_seen: total,
                    first_seen: first_seen.unwrap_or(now),
                    last_seen: now,
                    example_fact_ids: Vec::new(),
                    active: true,
                    superseded_by: None,
                };
                p.push_examples(&examples);
                t.signatures.insert(key, id);
                t.patterns.insert(id, p);
                id
            }
        };

        for id in members.iter().filter(|id| **id != survivor_id) {
            let p = t.pattern_mut(*id)?;
            p.active = false;
            p.superseded_by = Some(survivor_id);
        }
        t.patterns
            .get(&survivor_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("pattern", survivor_id))
    }

    fn insert_match(&self, m: &mut PatternMatch) -> Result<(), StoreError> {
        check_workspace(&self.workspace, &m.workspace)?;
        let mut t = self.lock()?;
        if !t.match_keys.insert((m.run_id, m.node_fact_id)) {
            return Err(StoreError::DuplicateMatch {
                run_id: m.run_id,
                node_fact_id: m.node_fact_id,
            });
        }
        t.next_match_id += 1;
        let id = t.next_match_id;
        m.id = Some(id);
        t.matches.insert(id, m.clone());
        Ok(())
    }

    fn matches_for_run(&self, run_id: Uuid) -> Result<Vec<PatternMatch>, StoreError> {
        Ok(self
            .lock()?
            .matches
            .values()
            .filter(|m| m.run_id == run_id)
            .cloned()
            .collect())
    }

    fn discard_run_results(&self, run_id: Uuid) -> Result<usize, StoreError> {
        let mut t = self.lock()?;
        let before = t.facts.len() + t.matches.len();
        t.facts.retain(|_, f| f.run_id != run_id);
        t.matches.retain(|_, m| m.run_id != run_id);
        t.match_keys.retain(|(run, _)| *run != run_id);
        Ok(before - t.facts.len() - t.matches.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aeroschema_core::{DecisionRule, FactNode, RunKind};
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn scope(version: &str) -> PatternScope {
        PatternScope::new("acme", version, "IATA_OrderViewRS")
    }

    fn draft(version: &str, signature: &str) -> PatternDraft {
        PatternDraft {
            scope: scope(version),
            section_path: "IATA_OrderViewRS/Response/DataLists/PaxList".into(),
            node_type: "PaxList".into(),
            rule: DecisionRule {
                must_have_attributes: BTreeSet::from(["PaxID".to_string()]),
                ..DecisionRule::default()
            },
            signature_hash: signature.into(),
        }
    }

    fn fact(run_id: Uuid) -> NodeFact {
        NodeFact {
            id: None,
            run_id,
            workspace: "acme".into(),
            spec_version: "21.3".into(),
            message_root: "IATA_OrderViewRS".into(),
            section_path: "IATA_OrderViewRS/Response/DataLists/PaxList".into(),
            node_type: "PaxList".into(),
            ordinal: 0,
            payload: FactNode::new("PaxList"),
            pii_masked: false,
            truncated: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn upsert_inserts_then_increments() {
        let store = MemoryStore::new("acme");
        let now = Utc::now();
        let first = store.upsert_pattern(&draft("21.3", "aa"), 2, &[1, 2], now).unwrap();
        assert!(first.inserted);
        assert_eq!(first.pattern.times_seen, 2);

        let second = store.upsert_pattern(&draft("21.3", "aa"), 1, &[3], now).unwrap();
        assert!(!second.inserted);
        assert_eq!(second.pattern.id, first.pattern.id);
        assert_eq!(second.pattern.times_seen, 3);
        assert_eq!(second.pattern.example_fact_ids, vec![1, 2, 3]);
        assert_eq!(store.list_patterns(true).unwrap().len(), 1);
    }

    #[test]
    fn same_signature_in_other_version_is_a_separate_pattern() {
        let store = MemoryStore::new("acme");
        let now = Utc::now();
        let a = store.upsert_pattern(&draft("21.3", "aa"), 1, &[], now).unwrap();
        let b = store.upsert_pattern(&draft("18.2", "aa"), 1, &[], now).unwrap();
        assert!(b.inserted);
        assert_ne!(a.pattern.id, b.pattern.id);
        assert_eq!(store.patterns_in_scope(&scope("21.3")).unwrap().len(), 1);
        assert_eq!(store.patterns_in_scope(&scope("18.2")).unwrap().len(), 1);
        assert!(store.patterns_in_scope(&scope("17.2")).unwrap().is_empty());
    }

    #[test]
    fn concurrent_upserts_never_duplicate() {
        let store = Arc::new(MemoryStore::new("acme"));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store
                        .upsert_pattern(&draft("21.3", "same"), 1, &[], Utc::now())
                        .unwrap()
                })
            })
            .collect();
        let inserted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| o.inserted)
            .count();
        assert_eq!(inserted, 1);
        let patterns = store.list_patterns(true).unwrap();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].times_seen, 8);
    }

    #[test]
    fn foreign_workspace_records_are_rejected() {
        let store = MemoryStore::new("other");
        let run = Run::new("acme", RunKind::Discovery);
        assert!(matches!(
            store.create_run(&run),
            Err(StoreError::WorkspaceMismatch { .. })
        ));
        assert!(matches!(
            store.upsert_pattern(&draft("21.3", "aa"), 1, &[], Utc::now()),
            Err(StoreError::WorkspaceMismatch { .. })
        ));
    }

    #[test]
    fn facts_get_ids_and_discard_removes_run_results() {
        let store = MemoryStore::new("acme");
        let run = Run::new("acme", RunKind::Identify);
        store.create_run(&run).unwrap();
        let mut facts = vec![fact(run.id), fact(run.id)];
        store.insert_facts(&mut facts).unwrap();
        assert_eq!(facts[0].id, Some(1));
        assert_eq!(facts[1].id, Some(2));

        let mut m = PatternMatch {
            id: None,
            run_id: run.id,
            workspace: "acme".into(),
            node_fact_id: 1,
            section_path: facts[0].section_path.clone(),
            pattern_id: None,
            verdict: aeroschema_core::Verdict::NoMatch,
            confidence: 0.1,
            breakdown: None,
            candidates_considered: 1,
            created_at: Utc::now(),
        };
        store.insert_match(&mut m).unwrap();
        assert!(m.id.is_some());
        let mut dup = m.clone();
        assert!(matches!(
            store.insert_match(&mut dup),
            Err(StoreError::DuplicateMatch { .. })
        ));

        let other_run = Run::new("acme", RunKind::Identify);
        let mut keep = vec![fact(other_run.id)];
        store.insert_facts(&mut keep).unwrap();

        assert_eq!(store.discard_run_results(run.id).unwrap(), 3);
        assert!(store.facts_for_run(run.id).unwrap().is_empty());
        assert!(store.matches_for_run(run.id).unwrap().is_empty());
        assert_eq!(store.facts_for_run(other_run.id).unwrap().len(), 1);

        // The (run, fact) index is cleared with the matches it guarded.
        let mut again = m.clone();
        store.insert_match(&mut again).unwrap();
        assert_eq!(store.matches_for_run(run.id).unwrap().len(), 1);
    }

    #[test]
    fn merge_sums_counts_and_supersedes() {
        let store = MemoryStore::new("acme");
        let now = Utc::now();
        let a = store.upsert_pattern(&draft("21.3", "a"), 3, &[1], now).unwrap().pattern;
        let b = store.upsert_pattern(&draft("21.3", "b"), 2, &[2], now).unwrap().pattern;

        let merged = store
            .merge_patterns(&draft("21.3", "merged"), &[a.id, b.id], now)
            .unwrap();
        assert_eq!(merged.times_seen, 5);
        assert!(merged.active);
        assert_eq!(merged.example_fact_ids, vec![1, 2]);

        let a = store.get_pattern(a.id).unwrap();
        assert!(!a.active);
        assert_eq!(a.superseded_by, Some(merged.id));
        let active = store.patterns_in_scope(&scope("21.3")).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, merged.id);
        // Nothing is deleted.
        assert_eq!(store.list_patterns(true).unwrap().len(), 3);
    }

    #[test]
    fn merge_into_existing_member_does_not_double_count() {
        let store = MemoryStore::new("acme");
        let now = Utc::now();
        let a = store.upsert_pattern(&draft("21.3", "a"), 3, &[], now).unwrap().pattern;
        let b = store.upsert_pattern(&draft("21.3", "b"), 2, &[], now).unwrap().pattern;
        let merged = store
            .merge_patterns(&draft("21.3", "a"), &[a.id, b.id], now)
            .unwrap();
        assert_eq!(merged.id, a.id);
        assert_eq!(merged.times_seen, 5);
        assert_eq!(store.get_pattern(b.id).unwrap().superseded_by, Some(a.id));
    }

    #[test]
    fn upsert_of_merged_away_signature_counts_on_survivor() {
        let store = MemoryStore::new("acme");
        let now = Utc::now();
        let a = store.upsert_pattern(&draft("21.3", "a"), 2, &[1], now).unwrap().pattern;
        let b = store.upsert_pattern(&draft("21.3", "b"), 1, &[2], now).unwrap().pattern;
        let merged = store
            .merge_patterns(&draft("21.3", "merged"), &[a.id, b.id], now)
            .unwrap();

        let again = store.upsert_pattern(&draft("21.3", "a"), 1, &[9], now).unwrap();
        assert!(!again.inserted);
        assert_eq!(again.pattern.id, merged.id);
        assert_eq!(again.pattern.times_seen, 4);
        assert_eq!(again.pattern.example_fact_ids, vec![1, 2, 9]);

        let a = store.get_pattern(a.id).unwrap();
        assert!(!a.active);
        assert_eq!(a.times_seen, 2);
        assert_eq!(a.example_fact_ids, vec![1]);
    }

    #[test]
    fn runs_round_trip_newest_first() {
        let store = MemoryStore::new("acme");
        let mut older = Run::new("acme", RunKind::Discovery);
        older.started_at = Utc::now() - chrono::Duration::seconds(60);
        let newer = Run::new("acme", RunKind::Identify);
        store.create_run(&older).unwrap();
        store.create_run(&newer).unwrap();

        older.finish(aeroschema_core::RunStatus::Completed, None);
        store.update_run(&older).unwrap();
        assert_eq!(
            store.get_run(older.id).unwrap().status,
            aeroschema_core::RunStatus::Completed
        );
        let ids: Vec<Uuid> = store.list_runs().unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![newer.id, older.id]);
        assert!(matches!(
            store.get_run(Uuid::new_v4()),
            Err(StoreError::NotFound { .. })
        ));
    }
}
