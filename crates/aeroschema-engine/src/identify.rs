//! Identification: classify stored facts against a version-scoped catalog.

use std::sync::Arc;

use aeroschema_core::{
    FactId, NodeFact, Pattern, PatternMatch, PatternScope, ScoreBreakdown, SynonymTable, Verdict,
};
use aeroschema_store::CatalogStore;
use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::EngineError;
use crate::generator::PatternGenerator;
use crate::score::score;

/// Best candidate for one fact.
#[derive(Debug, Clone, PartialEq)]
pub struct Scored {
    pub pattern_id: u64,
    pub breakdown: ScoreBreakdown,
}

/// The outcome for one fact before anything is written to the catalog.
#[derive(Debug, Clone)]
pub struct Classification {
    pub fact: NodeFact,
    pub best: Option<Scored>,
    pub candidates_considered: usize,
}

impl Classification {
    pub fn fact_id(&self) -> Option<FactId> {
        self.fact.id
    }

    /// NEW_PATTERN when no candidate survived node-type filtering.
    pub fn verdict(&self) -> Verdict {
        match &self.best {
            None => Verdict::NewPattern,
            Some(s) => Verdict::from_score(s.breakdown.total),
        }
    }
}

/// Matches facts of one Run against the catalog of its scope.
///
/// The candidate set is the scope's active patterns as of construction.
/// Patterns minted while the Run is in progress are not candidates for the
/// same Run, so verdicts do not depend on worker scheduling.
///
/// [`classify`](Self::classify) only reads the snapshot;
/// [`record`](Self::record) performs the catalog writes. Callers that must
/// leave the catalog untouched on failure classify first and record once
/// the Run is known to have succeeded.
pub struct IdentificationEngine {
    store: Arc<dyn CatalogStore>,
    generator: PatternGenerator,
    scope: PatternScope,
    candidates: Vec<Pattern>,
}

impl IdentificationEngine {
    /// Snapshot the candidates of `scope`.
    pub fn for_scope(
        store: Arc<dyn CatalogStore>,
        scope: PatternScope,
        synonyms: SynonymTable,
    ) -> Result<Self, EngineError> {
        let candidates = store.patterns_in_scope(&scope)?;
        info!(
            workspace = %scope.workspace,
            spec_version = %scope.spec_version,
            message_root = %scope.message_root,
            candidates = candidates.len(),
            "identification catalog loaded"
        );
        Ok(Self {
            generator: PatternGenerator::new(Arc::clone(&store), synonyms),
            store,
            scope,
            candidates,
        })
    }

    pub fn scope(&self) -> &PatternScope {
        &self.scope
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    /// Candidates whose node type is synonymous with `node_type`.
    pub fn candidates_for<'a>(&'a self, node_type: &'a str) -> impl Iterator<Item = &'a Pattern> {
        let synonyms = self.generator.synonyms();
        self.candidates
            .iter()
            .filter(move |p| synonyms.equivalent(node_type, &p.node_type))
    }

    /// Highest-scoring candidate; the lowest id wins ties. `None` when no
    /// candidate survives node-type filtering.
    pub fn best_match(&self, fact: &NodeFact) -> (Option<Scored>, usize) {
        let synonyms = self.generator.synonyms();
        let mut best: Option<Scored> = None;
        let mut considered = 0;
        for pattern in self.candidates_for(&fact.node_type) {
            considered += 1;
            let breakdown = score(&fact.node_type, &fact.payload, pattern, synonyms);
            let better = match &best {
                None => true,
                Some(b) => breakdown.total > b.breakdown.total,
            };
            if better {
                best = Some(Scored {
                    pattern_id: pattern.id,
                    breakdown,
                });
            }
        }
        (best, considered)
    }

    /// Score one stored fact against the snapshot. Writes nothing.
    pub fn classify(&self, fact: &NodeFact) -> Result<Classification, EngineError> {
        if fact.id.is_none() {
            return Err(EngineError::UnsavedFact {
                section_path: fact.section_path.clone(),
                ordinal: fact.ordinal,
            });
        }
        let (best, candidates_considered) = self.best_match(fact);
        Ok(Classification {
            fact: fact.clone(),
            best,
            candidates_considered,
        })
    }

    /// Apply a classification: record the match and update counters.
    ///
    /// - No candidate: a pattern is minted from the fact, verdict
    ///   NEW_PATTERN, confidence 0.0.
    /// - LOW_MATCH or better: the matched pattern's counter is bumped.
    /// - NO_MATCH: the best candidate is recorded but not counted.
    pub fn record(&self, run_id: Uuid, c: &Classification) -> Result<PatternMatch, EngineError> {
        let fact = &c.fact;
        let fact_id = fact.id.ok_or_else(|| EngineError::UnsavedFact {
            section_path: fact.section_path.clone(),
            ordinal: fact.ordinal,
        })?;
        let verdict = c.verdict();
        let (pattern_id, confidence, breakdown) = match &c.best {
            None => {
                let minted = self.generator.mint(fact)?;
                (minted.pattern.id, 0.0, None)
            }
            Some(Scored {
                pattern_id,
                breakdown,
            }) => {
                if verdict.is_match() {
                    self.store.record_pattern_hit(*pattern_id, Utc::now())?;
                }
                (*pattern_id, breakdown.total, Some(*breakdown))
            }
        };

        let mut m = PatternMatch {
            id: None,
            run_id,
            workspace: fact.workspace.clone(),
            node_fact_id: fact_id,
            section_path: fact.section_path.clone(),
            pattern_id: Some(pattern_id),
            verdict,
            confidence,
            breakdown,
            candidates_considered: c.candidates_considered,
            created_at: Utc::now(),
        };
        self.store.insert_match(&mut m)?;
        debug!(
            %run_id,
            fact_id,
            section_path = %fact.section_path,
            node_type = %fact.node_type,
            %verdict,
            confidence,
            "fact identified"
        );
        Ok(m)
    }

    /// [`classify`](Self::classify) then [`record`](Self::record).
    pub fn identify(&self, run_id: Uuid, fact: &NodeFact) -> Result<PatternMatch, EngineError> {
        let c = self.classify(fact)?;
        self.record(run_id, &c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aeroschema_core::FactNode;
    use aeroschema_store::MemoryStore;

    fn fact(version: &str, node_type: &str, payload: FactNode) -> NodeFact {
        NodeFact {
            id: None,
            run_id: Uuid::nil(),
            workspace: "acme".into(),
            spec_version: version.into(),
            message_root: "IATA_OrderViewRS".into(),
            section_path: format!("IATA_OrderViewRS/Response/{node_type}"),
            node_type: node_type.into(),
            ordinal: 0,
            payload,
            pii_masked: false,
            truncated: false,
            created_at: Utc::now(),
        }
    }

    fn order() -> FactNode {
        FactNode::new("Order")
            .with_attribute("OrderID", "O1")
            .with_attribute("OwnerCode", "XX")
            .with_child(FactNode::new("OrderItem").with_attribute("OrderItemID", "I1"))
    }

    fn scope(version: &str) -> PatternScope {
        PatternScope::new("acme", version, "IATA_OrderViewRS")
    }

    fn stored(store: &Arc<dyn CatalogStore>, facts: Vec<NodeFact>) -> Vec<NodeFact> {
        let mut facts = facts;
        store.insert_facts(&mut facts).unwrap();
        facts
    }

    fn learn(store: &Arc<dyn CatalogStore>, facts: &[NodeFact]) {
        PatternGenerator::new(Arc::clone(store), SynonymTable::default())
            .generate(facts)
            .unwrap();
    }

    #[test]
    fn exact_structure_is_an_exact_match_and_counted() {
        let store: Arc<dyn CatalogStore> = Arc::new(MemoryStore::new("acme"));
        learn(&store, &[fact("21.3", "Order", order())]);

        let engine =
            IdentificationEngine::for_scope(store.clone(), scope("21.3"), SynonymTable::default())
                .unwrap();
        let facts = stored(&store, vec![fact("21.3", "Order", order())]);
        let run_id = Uuid::new_v4();
        let m = engine.identify(run_id, &facts[0]).unwrap();

        assert_eq!(m.verdict, Verdict::ExactMatch);
        assert!(m.confidence >= 0.95);
        assert_eq!(m.candidates_considered, 1);
        let p = store.get_pattern(m.pattern_id.unwrap()).unwrap();
        assert_eq!(p.times_seen, 2);
        assert_eq!(store.matches_for_run(run_id).unwrap().len(), 1);
    }

    #[test]
    fn empty_catalog_mints_new_patterns() {
        let store: Arc<dyn CatalogStore> = Arc::new(MemoryStore::new("acme"));
        let engine =
            IdentificationEngine::for_scope(store.clone(), scope("21.3"), SynonymTable::default())
                .unwrap();
        let facts = stored(
            &store,
            vec![
                fact("21.3", "Order", order()),
                fact("21.3", "Order", order()),
                fact("21.3", "Pax", FactNode::new("Pax").with_attribute("PaxID", "P1")),
            ],
        );
        let run_id = Uuid::new_v4();
        for f in &facts {
            let m = engine.identify(run_id, f).unwrap();
            assert_eq!(m.verdict, Verdict::NewPattern);
            assert_eq!(m.confidence, 0.0);
            assert!(m.pattern_id.is_some());
        }
        // One pattern per distinct structural group.
        let patterns = store.list_patterns(true).unwrap();
        assert_eq!(patterns.len(), 2);
        let order_pattern = patterns.iter().find(|p| p.node_type == "Order").unwrap();
        assert_eq!(order_pattern.times_seen, 2);
    }

    #[test]
    fn other_versions_are_never_candidates() {
        let store: Arc<dyn CatalogStore> = Arc::new(MemoryStore::new("acme"));
        learn(&store, &[fact("18.2", "Order", order())]);

        let engine =
            IdentificationEngine::for_scope(store.clone(), scope("21.3"), SynonymTable::default())
                .unwrap();
        assert_eq!(engine.candidate_count(), 0);
        let facts = stored(&store, vec![fact("21.3", "Order", order())]);
        let m = engine.identify(Uuid::new_v4(), &facts[0]).unwrap();
        assert_eq!(m.verdict, Verdict::NewPattern);
        assert_eq!(store.list_patterns(true).unwrap().len(), 2);
    }

    #[test]
    fn weak_match_is_recorded_but_not_counted() {
        let store: Arc<dyn CatalogStore> = Arc::new(MemoryStore::new("acme"));
        learn(&store, &[fact("21.3", "Order", order())]);
        let engine =
            IdentificationEngine::for_scope(store.clone(), scope("21.3"), SynonymTable::default())
                .unwrap();
        let odd = FactNode::new("Order")
            .with_attribute("Unrelated", "1")
            .with_child(FactNode::new("Other"));
        let facts = stored(&store, vec![fact("21.3", "Order", odd)]);
        let m = engine.identify(Uuid::new_v4(), &facts[0]).unwrap();
        assert_eq!(m.verdict, Verdict::NoMatch);
        let p = store.get_pattern(m.pattern_id.unwrap()).unwrap();
        assert_eq!(p.times_seen, 1);
        assert!(m.breakdown.is_some());
    }

    #[test]
    fn best_of_several_candidates_wins() {
        let store: Arc<dyn CatalogStore> = Arc::new(MemoryStore::new("acme"));
        let slim = FactNode::new("Order").with_attribute("OrderID", "O1");
        learn(&store, &[fact("21.3", "Order", slim)]);
        let mut full = fact("21.3", "Order", order());
        full.section_path = "IATA_OrderViewRS/Response/Other/Order".into();
        learn(&store, &[full]);

        let engine =
            IdentificationEngine::for_scope(store.clone(), scope("21.3"), SynonymTable::default())
                .unwrap();
        assert_eq!(engine.candidate_count(), 2);
        let facts = stored(&store, vec![fact("21.3", "Order", order())]);
        let (best, considered) = engine.best_match(&facts[0]);
        assert_eq!(considered, 2);
        assert_eq!(best.unwrap().pattern_id, 2);
    }

    #[test]
    fn classification_leaves_the_catalog_untouched() {
        let store: Arc<dyn CatalogStore> = Arc::new(MemoryStore::new("acme"));
        learn(&store, &[fact("21.3", "Order", order())]);
        let before = store.list_patterns(true).unwrap();
        let engine =
            IdentificationEngine::for_scope(store.clone(), scope("21.3"), SynonymTable::default())
                .unwrap();
        let facts = stored(
            &store,
            vec![
                fact("21.3", "Order", order()),
                fact("21.3", "Pax", FactNode::new("Pax").with_attribute("PaxID", "P1")),
            ],
        );

        let hit = engine.classify(&facts[0]).unwrap();
        let fresh = engine.classify(&facts[1]).unwrap();
        assert_eq!(hit.verdict(), Verdict::ExactMatch);
        assert_eq!(fresh.verdict(), Verdict::NewPattern);
        assert_eq!(store.list_patterns(true).unwrap(), before);

        let run_id = Uuid::new_v4();
        assert!(store.matches_for_run(run_id).unwrap().is_empty());
        engine.record(run_id, &hit).unwrap();
        engine.record(run_id, &fresh).unwrap();
        assert_eq!(store.list_patterns(true).unwrap().len(), 2);
        assert_eq!(store.matches_for_run(run_id).unwrap().len(), 2);
    }

    #[test]
    fn unsaved_fact_is_rejected() {
        let store: Arc<dyn CatalogStore> = Arc::new(MemoryStore::new("acme"));
        let engine =
            IdentificationEngine::for_scope(store, scope("21.3"), SynonymTable::default()).unwrap();
        let err = engine
            .identify(Uuid::new_v4(), &fact("21.3", "Order", order()))
            .unwrap_err();
        assert!(matches!(err, EngineError::UnsavedFact { .. }));
    }
}
