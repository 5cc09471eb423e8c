//! Structural fact payloads and the [`NodeFact`] record.
//!
//! A fact payload is a typed tree rather than an open dictionary: every node
//! carries an attribute map, an ordered child list, and the cross-references
//! it makes to other structural units. Pattern derivation works only on the
//! names and shapes in this tree; values are kept for traceability but never
//! reach a decision rule.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type FactId = u64;

/// An observed attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AttributeValue {
    Text(String),
    /// Value withheld by PII masking.
    Masked,
    /// Present but empty (`<Foo/>` or `Foo=""`).
    Empty,
}

impl AttributeValue {
    pub fn text(value: impl Into<String>) -> Self {
        let value = value.into();
        if value.trim().is_empty() {
            Self::Empty
        } else {
            Self::Text(value)
        }
    }

    pub fn is_masked(&self) -> bool {
        matches!(self, Self::Masked)
    }
}

/// A cross-reference from one structural unit to another.
///
/// `field` is the referencing field (`PaxRefID`), `target_type` the node
/// type it points at (`Pax`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub field: String,
    pub target_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl Reference {
    pub fn new(field: impl Into<String>, target_type: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            target_type: target_type.into(),
            value: None,
        }
    }

    /// Relationship key used in decision rules: `"field->TargetType"`.
    pub fn relation(&self) -> String {
        format!("{}->{}", self.field, self.target_type)
    }
}

/// One node of a structural fact payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactNode {
    pub node_type: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
    #[serde(default)]
    pub children: Vec<FactNode>,
    #[serde(default)]
    pub references: Vec<Reference>,
}

impl FactNode {
    pub fn new(node_type: impl Into<String>) -> Self {
        Self {
            node_type: node_type.into(),
            attributes: BTreeMap::new(),
            children: Vec::new(),
            references: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes
            .insert(name.into(), AttributeValue::text(value));
        self
    }

    pub fn with_child(mut self, child: FactNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_reference(mut self, reference: Reference) -> Self {
        self.references.push(reference);
        self
    }

    /// Attribute names present on this node.
    pub fn attribute_names(&self) -> BTreeSet<String> {
        self.attributes.keys().cloned().collect()
    }

    /// Distinct relationship keys observed anywhere in this subtree.
    pub fn relations(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_relations(&mut out);
        out
    }

    fn collect_relations(&self, out: &mut BTreeSet<String>) {
        out.extend(self.references.iter().map(Reference::relation));
        for child in &self.children {
            child.collect_relations(out);
        }
    }

    /// Whether any value in this subtree was masked.
    pub fn has_masked_values(&self) -> bool {
        self.attributes.values().any(AttributeValue::is_masked)
            || self.children.iter().any(FactNode::has_masked_values)
    }

    /// Total number of nodes in this subtree, including self.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(FactNode::node_count).sum::<usize>()
    }
}

/// Output of the fact-extraction collaborator for one subtree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedFact {
    pub node_type: String,
    pub payload: FactNode,
}

/// One concrete occurrence of a structural unit found in one Run.
///
/// `id` is assigned by the store on insert. Facts are immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeFact {
    pub id: Option<FactId>,
    pub run_id: Uuid,
    pub workspace: String,
    pub spec_version: String,
    pub message_root: String,
    pub section_path: String,
    pub node_type: String,
    pub ordinal: u32,
    pub payload: FactNode,
    pub pii_masked: bool,
    /// Source subtree exceeded the size ceiling and was cut short.
    pub truncated: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pax(id: &str) -> FactNode {
        FactNode::new("Pax")
            .with_attribute("PaxID", id)
            .with_attribute("PTC", "ADT")
    }

    #[test]
    fn empty_text_becomes_empty_marker() {
        assert_eq!(AttributeValue::text("  "), AttributeValue::Empty);
        assert_eq!(
            AttributeValue::text("ADT"),
            AttributeValue::Text("ADT".into())
        );
    }

    #[test]
    fn relations_are_collected_recursively() {
        let node = FactNode::new("PaxSegment")
            .with_reference(Reference::new("PaxRefID", "Pax"))
            .with_child(
                FactNode::new("Leg").with_reference(Reference::new("DatedOperatingLegRefID", "DatedOperatingLeg")),
            )
            .with_child(FactNode::new("Leg").with_reference(Reference::new("PaxRefID", "Pax")));
        let rel = node.relations();
        assert_eq!(rel.len(), 2);
        assert!(rel.contains("PaxRefID->Pax"));
        assert!(rel.contains("DatedOperatingLegRefID->DatedOperatingLeg"));
    }

    #[test]
    fn masked_values_are_detected_in_children() {
        let mut child = pax("PAX1");
        child
            .attributes
            .insert("Surname".into(), AttributeValue::Masked);
        let list = FactNode::new("PaxList").with_child(pax("PAX2")).with_child(child);
        assert!(list.has_masked_values());
        assert!(!pax("PAX3").has_masked_values());
    }

    #[test]
    fn node_count_includes_root() {
        let list = FactNode::new("PaxList").with_child(pax("1")).with_child(pax("2"));
        assert_eq!(list.node_count(), 3);
    }

    #[test]
    fn payload_json_shape() {
        let node = pax("PAX1").with_reference(Reference::new("InfantRefID", "Pax"));
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["node_type"], "Pax");
        assert_eq!(json["attributes"]["PaxID"]["kind"], "text");
        assert_eq!(json["attributes"]["PaxID"]["value"], "PAX1");
        assert_eq!(json["references"][0]["target_type"], "Pax");

        let parsed: FactNode = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, node);
    }

    #[test]
    fn payload_json_defaults_missing_collections() {
        let parsed: FactNode = serde_json::from_str(r#"{"node_type": "Pax"}"#).unwrap();
        assert!(parsed.attributes.is_empty());
        assert!(parsed.children.is_empty());
        assert!(parsed.references.is_empty());
    }
}
