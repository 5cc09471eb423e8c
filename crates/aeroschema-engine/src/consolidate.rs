//! Operator-triggered folding of near-duplicate patterns within a scope.

use std::collections::BTreeMap;
use std::sync::Arc;

use aeroschema_core::{DecisionRule, Pattern, PatternDraft, PatternId, PatternScope, SynonymTable};
use aeroschema_store::CatalogStore;
use chrono::Utc;
use tracing::info;

use crate::EngineError;
use crate::rule::{merge_rules, signature_hash};

/// One merged group.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub survivor: Pattern,
    /// Members deactivated in favour of the survivor.
    pub superseded: Vec<PatternId>,
}

/// Merges active patterns of one scope that share a section path and a
/// synonym-canonical node type. Patterns are deactivated, never deleted.
pub struct Consolidator {
    store: Arc<dyn CatalogStore>,
    synonyms: SynonymTable,
}

impl Consolidator {
    pub fn new(store: Arc<dyn CatalogStore>, synonyms: SynonymTable) -> Self {
        Self { store, synonyms }
    }

    /// Active patterns of `scope` grouped by (section path, canonical node
    /// type). Only groups with more than one member are returned.
    pub fn candidates(
        &self,
        scope: &PatternScope,
    ) -> Result<BTreeMap<(String, String), Vec<Pattern>>, EngineError> {
        let mut groups: BTreeMap<(String, String), Vec<Pattern>> = BTreeMap::new();
        for p in self.store.patterns_in_scope(scope)? {
            let key = (p.section_path.clone(), self.synonyms.canonical(&p.node_type));
            groups.entry(key).or_default().push(p);
        }
        groups.retain(|_, members| members.len() > 1);
        Ok(groups)
    }

    pub fn consolidate(&self, scope: &PatternScope) -> Result<Vec<MergeOutcome>, EngineError> {
        let groups = self.candidates(scope)?;
        let mut outcomes = Vec::with_capacity(groups.len());
        for ((section_path, node_type_key), members) in groups {
            let rules: Vec<&DecisionRule> = members.iter().map(|p| &p.rule).collect();
            let rule = merge_rules(&rules);
            let signature = signature_hash(&rule, scope, &section_path, &node_type_key)?;
            let node_type = members
                .iter()
                .map(|p| p.node_type.as_str())
                .min()
                .unwrap_or(node_type_key.as_str())
                .to_string();
            let draft = PatternDraft {
                scope: scope.clone(),
                section_path,
                node_type,
                rule,
                signature_hash: signature,
            };
            let ids: Vec<PatternId> = members.iter().map(|p| p.id).collect();
            let survivor = self.store.merge_patterns(&draft, &ids, Utc::now())?;
            let superseded: Vec<PatternId> =
                ids.into_iter().filter(|id| *id != survivor.id).collect();
            info!(
                section_path = %draft.section_path,
                survivor = survivor.id,
                merged = superseded.len(),
                times_seen = survivor.times_seen,
                "patterns consolidated"
            );
            outcomes.push(MergeOutcome {
                survivor,
                superseded,
            });
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::PatternGenerator;
    use aeroschema_core::{FactNode, NodeFact};
    use aeroschema_store::MemoryStore;
    use uuid::Uuid;

    fn fact(section: &str, node_type: &str, payload: FactNode) -> NodeFact {
        NodeFact {
            id: None,
            run_id: Uuid::nil(),
            workspace: "acme".into(),
            spec_version: "21.3".into(),
            message_root: "IATA_OrderViewRS".into(),
            section_path: section.into(),
            node_type: node_type.into(),
            ordinal: 0,
            payload,
            pii_masked: false,
            truncated: false,
            created_at: Utc::now(),
        }
    }

    fn scope() -> PatternScope {
        PatternScope::new("acme", "21.3", "IATA_OrderViewRS")
    }

    #[test]
    fn merges_variants_and_sums_usage() {
        let store: Arc<dyn CatalogStore> = Arc::new(MemoryStore::new("acme"));
        let generator = PatternGenerator::new(Arc::clone(&store), SynonymTable::default());
        let a = FactNode::new("Order")
            .with_attribute("OrderID", "1")
            .with_attribute("OwnerCode", "XX");
        let b = FactNode::new("Order")
            .with_attribute("OrderID", "2")
            .with_attribute("StatusCode", "OK");
        // Separate passes keep the two variants as distinct patterns.
        generator.mint(&fact("R/Order", "Order", a.clone())).unwrap();
        generator.mint(&fact("R/Order", "Order", a)).unwrap();
        generator.mint(&fact("R/Order", "Order", b)).unwrap();
        generator
            .mint(&fact("R/Pax", "Pax", FactNode::new("Pax").with_attribute("PaxID", "P")))
            .unwrap();
        assert_eq!(store.patterns_in_scope(&scope()).unwrap().len(), 3);

        let consolidator = Consolidator::new(Arc::clone(&store), SynonymTable::default());
        let outcomes = consolidator.consolidate(&scope()).unwrap();
        assert_eq!(outcomes.len(), 1);
        let merged = &outcomes[0];
        assert_eq!(merged.survivor.times_seen, 3);
        assert_eq!(merged.survivor.rule.must_have_attributes.len(), 1);
        assert_eq!(merged.superseded.len(), 2);

        let active = store.patterns_in_scope(&scope()).unwrap();
        assert_eq!(active.len(), 2);
        for id in &merged.superseded {
            let p = store.get_pattern(*id).unwrap();
            assert!(!p.active);
            assert_eq!(p.superseded_by, Some(merged.survivor.id));
        }
        // Nothing was deleted.
        assert_eq!(store.list_patterns(true).unwrap().len(), 4);
    }

    #[test]
    fn rediscovered_variant_counts_on_the_survivor() {
        let store: Arc<dyn CatalogStore> = Arc::new(MemoryStore::new("acme"));
        let generator = PatternGenerator::new(Arc::clone(&store), SynonymTable::default());
        let a = FactNode::new("Order").with_attribute("OrderID", "1");
        let b = FactNode::new("Order")
            .with_attribute("OrderID", "2")
            .with_attribute("StatusCode", "OK");
        let first = generator.mint(&fact("R/Order", "Order", a.clone())).unwrap();
        generator.mint(&fact("R/Order", "Order", b)).unwrap();

        let outcomes = Consolidator::new(Arc::clone(&store), SynonymTable::default())
            .consolidate(&scope())
            .unwrap();
        let survivor = outcomes[0].survivor.id;
        assert_eq!(store.get_pattern(survivor).unwrap().times_seen, 2);

        let mut seen_again = fact("R/Order", "Order", a);
        seen_again.id = Some(42);
        let outcome = generator.generate(&[seen_again]).unwrap();
        assert_eq!(outcome.groups, 1);

        let survivor = store.get_pattern(survivor).unwrap();
        assert!(survivor.active);
        assert_eq!(survivor.times_seen, 3);
        assert!(survivor.example_fact_ids.contains(&42));
        let merged_away = store.get_pattern(first.pattern.id).unwrap();
        assert!(!merged_away.active);
        assert_eq!(merged_away.times_seen, 1);
        assert_eq!(store.patterns_in_scope(&scope()).unwrap().len(), 1);
    }

    #[test]
    fn synonymous_node_types_share_a_group() {
        let store: Arc<dyn CatalogStore> = Arc::new(MemoryStore::new("acme"));
        let synonyms = SynonymTable::from_groups([["PaxList", "PassengerList"]]);
        let generator = PatternGenerator::new(Arc::clone(&store), synonyms.clone());
        generator
            .mint(&fact("R/List", "PaxList", FactNode::new("PaxList").with_attribute("A", "1")))
            .unwrap();
        generator
            .mint(&fact(
                "R/List",
                "PassengerList",
                FactNode::new("PassengerList").with_attribute("B", "1"),
            ))
            .unwrap();
        let consolidator = Consolidator::new(Arc::clone(&store), synonyms);
        assert_eq!(consolidator.candidates(&scope()).unwrap().len(), 1);
        let outcomes = consolidator.consolidate(&scope()).unwrap();
        assert_eq!(outcomes[0].survivor.node_type, "PassengerList");
    }

    #[test]
    fn nothing_to_merge_is_a_no_op() {
        let store: Arc<dyn CatalogStore> = Arc::new(MemoryStore::new("acme"));
        let generator = PatternGenerator::new(Arc::clone(&store), SynonymTable::default());
        generator
            .mint(&fact("R/Order", "Order", FactNode::new("Order")))
            .unwrap();
        let outcomes = Consolidator::new(Arc::clone(&store), SynonymTable::default())
            .consolidate(&scope())
            .unwrap();
        assert!(outcomes.is_empty());
        assert_eq!(store.patterns_in_scope(&scope()).unwrap().len(), 1);
    }
}
