//! Weighted structural similarity between a fact and a pattern.
//!
//! | Factor | Weight |
//! |---|---|
//! | node type (synonym aware) | 0.30 |
//! | attribute coverage | 0.30 |
//! | child structure | 0.25 |
//! | reference patterns | 0.15 |
//!
//! Each factor lies in `[0, 1]`, so the total does too. A fact that carries
//! exactly the attributes, children and references of a pattern's rule
//! scores 1.0.

use std::collections::{BTreeMap, BTreeSet};

use aeroschema_core::{ChildShape, FactNode, Pattern, ScoreBreakdown, SynonymTable};

use crate::rule::child_shapes;

pub const NODE_TYPE_WEIGHT: f64 = 0.30;
pub const ATTRIBUTE_WEIGHT: f64 = 0.30;
pub const CHILD_WEIGHT: f64 = 0.25;
pub const REFERENCE_WEIGHT: f64 = 0.15;

/// Split of the attribute factor between must-have coverage and optional overlap.
const MUST_SHARE: f64 = 0.7;
const OPTIONAL_SHARE: f64 = 0.3;

/// Score `payload` (a fact of `node_type`) against `pattern`.
pub fn score(
    node_type: &str,
    payload: &FactNode,
    pattern: &Pattern,
    synonyms: &SynonymTable,
) -> ScoreBreakdown {
    let node_type_score = if synonyms.equivalent(node_type, &pattern.node_type) {
        1.0
    } else {
        0.0
    };
    let attributes = attribute_score(
        &payload.attribute_names(),
        &pattern.rule.must_have_attributes,
        &pattern.rule.optional_attributes,
    );
    let fact_children = child_shapes(&[payload], 1);
    let children = shape_similarity(&fact_children, &pattern.rule.child_structure);
    let pattern_refs: BTreeSet<String> = pattern.rule.reference_patterns.keys().cloned().collect();
    let references = jaccard(&payload.relations(), &pattern_refs);

    let total = NODE_TYPE_WEIGHT * node_type_score
        + ATTRIBUTE_WEIGHT * attributes
        + CHILD_WEIGHT * children
        + REFERENCE_WEIGHT * references;

    ScoreBreakdown {
        node_type: node_type_score,
        attributes,
        children,
        references,
        total: total.clamp(0.0, 1.0),
    }
}

/// Must-have coverage blended with Jaccard overlap of the remaining
/// attributes against the optional set.
pub fn attribute_score(
    present: &BTreeSet<String>,
    must: &BTreeSet<String>,
    optional: &BTreeSet<String>,
) -> f64 {
    let coverage = if must.is_empty() {
        1.0
    } else {
        must.intersection(present).count() as f64 / must.len() as f64
    };
    let extra: BTreeSet<String> = present.difference(must).cloned().collect();
    MUST_SHARE * coverage + OPTIONAL_SHARE * jaccard(&extra, optional)
}

/// `|a ∩ b| / |a ∪ b|`, 1.0 when both are empty.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 1.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Recursive overlap of child shapes, averaged over every child type that
/// either side mentions.
///
/// A type only the pattern has counts as a match when the pattern marks it
/// optional; a type only the fact has never matches.
pub fn shape_similarity(
    fact: &BTreeMap<String, ChildShape>,
    pattern: &BTreeMap<String, ChildShape>,
) -> f64 {
    let types: BTreeSet<&String> = fact.keys().chain(pattern.keys()).collect();
    if types.is_empty() {
        return 1.0;
    }
    let total: f64 = types
        .iter()
        .map(|t| match (fact.get(*t), pattern.get(*t)) {
            (Some(f), Some(p)) => {
                let attrs = attribute_score(
                    &f.all_attributes(),
                    &p.must_have_attributes,
                    &p.optional_attributes,
                );
                0.5 * attrs + 0.5 * shape_similarity(&f.children, &p.children)
            }
            (None, Some(p)) if !p.required => 1.0,
            _ => 0.0,
        })
        .sum();
    total / types.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::derive_rule;
    use aeroschema_core::{Reference, Verdict};
    use chrono::Utc;

    fn pattern_from(nodes: &[&FactNode], node_type: &str) -> Pattern {
        Pattern {
            id: 1,
            workspace: "acme".into(),
            spec_version: "21.3".into(),
            message_root: "IATA_OrderViewRS".into(),
            section_path: "IATA_OrderViewRS/Response/Order".into(),
            node_type: node_type.into(),
            rule: derive_rule(nodes),
            signature_hash: "x".into(),
            times_seen: 1,
            first_seen: Utc::now(),
            last_seen: Utc::now(),
            example_fact_ids: vec![],
            active: true,
            superseded_by: None,
        }
    }

    fn order() -> FactNode {
        FactNode::new("Order")
            .with_attribute("OrderID", "O1")
            .with_attribute("OwnerCode", "XX")
            .with_child(
                FactNode::new("OrderItem")
                    .with_attribute("OrderItemID", "OI1")
                    .with_reference(Reference::new("PaxRefID", "Pax")),
            )
            .with_reference(Reference::new("OfferRefID", "Offer"))
    }

    #[test]
    fn identical_structure_scores_exact() {
        let fact = order();
        let p = pattern_from(&[&fact], "Order");
        let s = score("Order", &fact, &p, &SynonymTable::default());
        assert!((s.total - 1.0).abs() < 1e-12, "{s:?}");
        assert_eq!(Verdict::from_score(s.total), Verdict::ExactMatch);
    }

    #[test]
    fn fact_with_all_rule_attributes_is_exact_for_multi_fact_pattern() {
        let a = order();
        let b = order().with_attribute("StatusCode", "OK");
        let p = pattern_from(&[&a, &b], "Order");
        let s = score("Order", &b, &p, &SynonymTable::default());
        assert!(s.total >= Verdict::EXACT_THRESHOLD, "{s:?}");
    }

    #[test]
    fn wrong_node_type_costs_its_weight() {
        let fact = order();
        let p = pattern_from(&[&fact], "Order");
        let s = score("Offer", &fact, &p, &SynonymTable::default());
        assert_eq!(s.node_type, 0.0);
        assert!((s.total - (1.0 - NODE_TYPE_WEIGHT)).abs() < 1e-12);
    }

    #[test]
    fn synonyms_count_as_same_type() {
        let fact = order();
        let p = pattern_from(&[&fact], "OrderView");
        let table = SynonymTable::from_groups([["Order", "OrderView"]]);
        assert_eq!(score("Order", &fact, &p, &table).node_type, 1.0);
    }

    #[test]
    fn missing_must_attributes_reduce_coverage() {
        let must = BTreeSet::from(["A".to_string(), "B".to_string()]);
        let present = BTreeSet::from(["A".to_string()]);
        let s = attribute_score(&present, &must, &BTreeSet::new());
        assert!((s - (0.7 * 0.5 + 0.3)).abs() < 1e-12);
    }

    #[test]
    fn optional_only_in_pattern_is_tolerated() {
        let with_child = FactNode::new("PaxList").with_child(FactNode::new("Pax"));
        let without = FactNode::new("PaxList");
        let p = pattern_from(&[&with_child, &without], "PaxList");
        assert_eq!(
            shape_similarity(&child_shapes(&[&without], 1), &p.rule.child_structure),
            1.0
        );
        // An unexpected child type is penalised.
        let odd = FactNode::new("PaxList").with_child(FactNode::new("Infant"));
        assert!(shape_similarity(&child_shapes(&[&odd], 1), &p.rule.child_structure) < 1.0);
    }

    #[test]
    fn disjoint_structure_scores_low() {
        let p = pattern_from(&[&order()], "Order");
        let other = FactNode::new("Order")
            .with_attribute("Unrelated", "1")
            .with_child(FactNode::new("Something"));
        let s = score("Order", &other, &p, &SynonymTable::default());
        assert!(s.total < Verdict::LOW_THRESHOLD, "{s:?}");
        assert_eq!(Verdict::from_score(s.total), Verdict::NoMatch);
    }

    #[test]
    fn jaccard_edges() {
        let empty = BTreeSet::new();
        let one = BTreeSet::from(["x".to_string()]);
        assert_eq!(jaccard(&empty, &empty), 1.0);
        assert_eq!(jaccard(&one, &empty), 0.0);
        assert_eq!(jaccard(&one, &one), 1.0);
    }
}
