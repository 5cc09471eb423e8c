//! Decision-rule derivation, merging and signature hashing.
//!
//! All derivation runs over ordered sets and maps, so the canonical JSON of
//! a rule, and therefore its signature, depends only on the multiset of
//! facts it was derived from and never on their order.

use std::collections::{BTreeMap, BTreeSet};

use aeroschema_core::{ChildShape, DecisionRule, FactNode, PatternScope, Presence};
use ring::digest::{SHA256, digest};

/// Child structure is fingerprinted this many levels below the fact root.
pub const MAX_CHILD_DEPTH: usize = 3;

/// Rule for a group of fact payloads.
pub fn derive_rule(payloads: &[&FactNode]) -> DecisionRule {
    let (must, optional) = split_presence(payloads.iter().map(|p| p.attribute_names()));
    DecisionRule {
        must_have_attributes: must,
        optional_attributes: optional,
        child_structure: child_shapes(payloads, 1),
        reference_patterns: reference_rules(payloads),
    }
}

/// Intersection of all sets, and the rest of their union.
fn split_presence<I>(sets: I) -> (BTreeSet<String>, BTreeSet<String>)
where
    I: IntoIterator<Item = BTreeSet<String>>,
{
    let mut iter = sets.into_iter();
    let Some(first) = iter.next() else {
        return (BTreeSet::new(), BTreeSet::new());
    };
    let mut must = first.clone();
    let mut union = first;
    for set in iter {
        must.retain(|name| set.contains(name));
        union.extend(set);
    }
    let optional = union.difference(&must).cloned().collect();
    (must, optional)
}

/// Shapes of the children of `parents`, keyed by child node type.
///
/// `depth` is the level of the children being described (1 = direct
/// children of the fact root).
pub fn child_shapes(parents: &[&FactNode], depth: usize) -> BTreeMap<String, ChildShape> {
    if depth > MAX_CHILD_DEPTH || parents.is_empty() {
        return BTreeMap::new();
    }

    // node type → (number of parents containing it, all instances)
    let mut by_type: BTreeMap<&str, (usize, Vec<&FactNode>)> = BTreeMap::new();
    for parent in parents {
        let mut seen_here = BTreeSet::new();
        for child in &parent.children {
            let entry = by_type.entry(child.node_type.as_str()).or_default();
            entry.1.push(child);
            if seen_here.insert(child.node_type.as_str()) {
                entry.0 += 1;
            }
        }
    }

    by_type
        .into_iter()
        .map(|(node_type, (parents_with, instances))| {
            let (must, optional) =
                split_presence(instances.iter().map(|c| c.attribute_names()));
            let shape = ChildShape {
                required: parents_with == parents.len(),
                must_have_attributes: must,
                optional_attributes: optional,
                children: child_shapes(&instances, depth + 1),
            };
            (node_type.to_string(), shape)
        })
        .collect()
}

fn reference_rules(payloads: &[&FactNode]) -> BTreeMap<String, Presence> {
    let (must, optional) = split_presence(payloads.iter().map(|p| p.relations()));
    must.into_iter()
        .map(|r| (r, Presence::Must))
        .chain(optional.into_iter().map(|r| (r, Presence::Optional)))
        .collect()
}

// ── Merging ──

/// One rule covering everything the given rules accept.
///
/// Must-haves are kept only where every rule requires them; everything else
/// any rule mentions becomes optional.
pub fn merge_rules(rules: &[&DecisionRule]) -> DecisionRule {
    let (must, optional) = merge_attributes(
        rules
            .iter()
            .map(|r| (&r.must_have_attributes, &r.optional_attributes)),
    );
    let children: Vec<&BTreeMap<String, ChildShape>> =
        rules.iter().map(|r| &r.child_structure).collect();

    let mut references: BTreeMap<String, Presence> = BTreeMap::new();
    let all_refs: BTreeSet<&String> = rules.iter().flat_map(|r| r.reference_patterns.keys()).collect();
    for relation in all_refs {
        let always = rules
            .iter()
            .all(|r| r.reference_patterns.get(relation) == Some(&Presence::Must));
        let presence = if always { Presence::Must } else { Presence::Optional };
        references.insert(relation.clone(), presence);
    }

    DecisionRule {
        must_have_attributes: must,
        optional_attributes: optional,
        child_structure: merge_shapes(&children),
        reference_patterns: references,
    }
}

fn merge_attributes<'a, I>(parts: I) -> (BTreeSet<String>, BTreeSet<String>)
where
    I: IntoIterator<Item = (&'a BTreeSet<String>, &'a BTreeSet<String>)>,
{
    let mut must: Option<BTreeSet<String>> = None;
    let mut union = BTreeSet::new();
    for (m, o) in parts {
        must = Some(match must {
            None => m.clone(),
            Some(acc) => acc.intersection(m).cloned().collect(),
        });
        union.extend(m.iter().cloned());
        union.extend(o.iter().cloned());
    }
    let must = must.unwrap_or_default();
    let optional = union.difference(&must).cloned().collect();
    (must, optional)
}

fn merge_shapes(maps: &[&BTreeMap<String, ChildShape>]) -> BTreeMap<String, ChildShape> {
    let types: BTreeSet<&String> = maps.iter().flat_map(|m| m.keys()).collect();
    types
        .into_iter()
        .map(|node_type| {
            let present: Vec<&ChildShape> = maps.iter().filter_map(|m| m.get(node_type)).collect();
            let required = present.len() == maps.len() && present.iter().all(|s| s.required);
            let (must, optional) = merge_attributes(
                present
                    .iter()
                    .map(|s| (&s.must_have_attributes, &s.optional_attributes)),
            );
            let grandchildren: Vec<&BTreeMap<String, ChildShape>> =
                present.iter().map(|s| &s.children).collect();
            let shape = ChildShape {
                required,
                must_have_attributes: must,
                optional_attributes: optional,
                children: merge_shapes(&grandchildren),
            };
            (node_type.clone(), shape)
        })
        .collect()
}

// ── Signature ──

/// Hex SHA-256 over the canonical rule and the scope it lives in.
pub fn signature_hash(
    rule: &DecisionRule,
    scope: &PatternScope,
    section_path: &str,
    node_type_key: &str,
) -> Result<String, serde_json::Error> {
    let mut material = rule.canonical_json()?;
    for part in [
        scope.spec_version.as_str(),
        scope.message_root.as_str(),
        section_path,
        node_type_key,
    ] {
        material.push('\n');
        material.push_str(part);
    }
    let hash = digest(&SHA256, material.as_bytes());
    Ok(hash.as_ref().iter().map(|b| format!("{b:02x}")).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pax(id_attrs: &[&str]) -> FactNode {
        let mut node = FactNode::new("Pax");
        for a in id_attrs {
            node = node.with_attribute(*a, "x");
        }
        node
    }

    fn pax_list(children: Vec<FactNode>) -> FactNode {
        let mut node = FactNode::new("PaxList").with_attribute("Count", "1");
        node.children = children;
        node
    }

    #[test]
    fn must_is_intersection_optional_is_rest() {
        let a = FactNode::new("Order")
            .with_attribute("OrderID", "1")
            .with_attribute("OwnerCode", "XX");
        let b = FactNode::new("Order")
            .with_attribute("OrderID", "2")
            .with_attribute("StatusCode", "OK");
        let rule = derive_rule(&[&a, &b]);
        assert_eq!(rule.must_have_attributes, BTreeSet::from(["OrderID".to_string()]));
        assert_eq!(
            rule.optional_attributes,
            BTreeSet::from(["OwnerCode".to_string(), "StatusCode".to_string()])
        );
    }

    #[test]
    fn child_counts_do_not_change_the_shape() {
        let four = pax_list((0..4).map(|_| pax(&["PaxID", "PTC"])).collect());
        let two = pax_list((0..2).map(|_| pax(&["PaxID", "PTC"])).collect());
        assert_eq!(derive_rule(&[&four]), derive_rule(&[&two]));
        let rule = derive_rule(&[&four, &two]);
        let shape = &rule.child_structure["Pax"];
        assert!(shape.required);
        assert_eq!(shape.must_have_attributes.len(), 2);
    }

    #[test]
    fn child_absent_from_some_parent_is_not_required() {
        let with = pax_list(vec![pax(&["PaxID"])]);
        let without = pax_list(vec![]);
        let rule = derive_rule(&[&with, &without]);
        assert!(!rule.child_structure["Pax"].required);
    }

    #[test]
    fn depth_is_bounded() {
        // Five levels of nesting below the root.
        let mut node = FactNode::new("L5").with_attribute("a", "1");
        for level in (1..5).rev() {
            node = FactNode::new(format!("L{level}")).with_child(node);
        }
        let root = FactNode::new("Root").with_child(node);
        let rule = derive_rule(&[&root]);
        let l1 = &rule.child_structure["L1"];
        let l2 = &l1.children["L2"];
        let l3 = &l2.children["L3"];
        assert!(l3.children.is_empty());
    }

    #[test]
    fn references_tagged_by_presence() {
        use aeroschema_core::Reference;
        let a = FactNode::new("OrderItem")
            .with_reference(Reference::new("PaxRefID", "Pax"))
            .with_reference(Reference::new("OfferRefID", "Offer"));
        let b = FactNode::new("OrderItem").with_reference(Reference::new("PaxRefID", "Pax"));
        let rule = derive_rule(&[&a, &b]);
        assert_eq!(rule.reference_patterns["PaxRefID->Pax"], Presence::Must);
        assert_eq!(rule.reference_patterns["OfferRefID->Offer"], Presence::Optional);
    }

    #[test]
    fn derivation_is_order_independent() {
        let facts = [
            pax_list(vec![pax(&["PaxID", "PTC"]), pax(&["PaxID"])]),
            pax_list(vec![pax(&["PaxID", "Birthdate"])]),
            FactNode::new("PaxList").with_attribute("Other", "x"),
        ];
        let scope = PatternScope::new("acme", "21.3", "IATA_OrderViewRS");
        let forward: Vec<&FactNode> = facts.iter().collect();
        let backward: Vec<&FactNode> = facts.iter().rev().collect();
        let rotated: Vec<&FactNode> = vec![&facts[1], &facts[2], &facts[0]];
        let hashes: Vec<String> = [forward, backward, rotated]
            .iter()
            .map(|group| {
                let rule = derive_rule(group);
                signature_hash(&rule, &scope, "R/PaxList", "paxlist").unwrap()
            })
            .collect();
        assert_eq!(hashes[0], hashes[1]);
        assert_eq!(hashes[0], hashes[2]);
        assert_eq!(hashes[0].len(), 64);
    }

    #[test]
    fn signature_differs_across_versions() {
        let rule = derive_rule(&[&pax(&["PaxID"])]);
        let a = signature_hash(
            &rule,
            &PatternScope::new("acme", "21.3", "IATA_OrderViewRS"),
            "R/Pax",
            "pax",
        )
        .unwrap();
        let b = signature_hash(
            &rule,
            &PatternScope::new("acme", "18.2", "IATA_OrderViewRS"),
            "R/Pax",
            "pax",
        )
        .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn merge_keeps_common_must_and_relaxes_the_rest() {
        let a = derive_rule(&[&pax_list(vec![pax(&["PaxID", "PTC"])])]);
        let b = derive_rule(&[&FactNode::new("PaxList")
            .with_attribute("Count", "1")
            .with_attribute("Extra", "y")]);
        let merged = merge_rules(&[&a, &b]);
        assert_eq!(merged.must_have_attributes, BTreeSet::from(["Count".to_string()]));
        assert_eq!(merged.optional_attributes, BTreeSet::from(["Extra".to_string()]));
        let pax_shape = &merged.child_structure["Pax"];
        assert!(!pax_shape.required);
        assert_eq!(pax_shape.must_have_attributes.len(), 2);
    }

    #[test]
    fn merging_one_rule_is_identity() {
        let rule = derive_rule(&[&pax_list(vec![pax(&["PaxID"])]), &pax_list(vec![])]);
        assert_eq!(merge_rules(&[&rule]), rule);
    }
}
