//! Deterministic, model-free fact extraction straight from subtree shape.

use aeroschema_core::{AttributeValue, ExtractedFact, FactNode, Reference};
use aeroschema_ingest::{Subtree, XmlElement};
use async_trait::async_trait;

use crate::extract::{ExtractionContext, FactExtractor, MASK};
use crate::ExtractionError;

/// Attribute key for character data of an element that also has structure.
pub const TEXT_KEY: &str = "#text";

/// Suffixes marking a field as a cross-reference, longest first.
const REFERENCE_SUFFIXES: [&str; 4] = ["RefIDs", "RefID", "IDRef", "Ref"];

/// Derives one fact per subtree from its XML structure alone.
///
/// - XML attributes and text-only child elements become attributes.
/// - Child elements with attributes or children become child nodes.
/// - Fields named `<Type>RefID`, `<Type>RefIDs`, `<Type>IDRef` or `<Type>Ref`
///   become references to `<Type>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuralExtractor;

impl StructuralExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Fact payload for one element.
    pub fn node_from_element(element: &XmlElement) -> FactNode {
        let mut node = FactNode::new(&element.name);

        for (name, value) in &element.attributes {
            add_field(&mut node, name, Some(value));
        }
        if !element.is_leaf() || !element.attributes.is_empty() {
            if let Some(text) = element.text.as_deref().filter(|t| !t.trim().is_empty()) {
                node.attributes.insert(TEXT_KEY.to_string(), value_of(text));
            }
        }

        for child in &element.children {
            if child.is_leaf() && child.attributes.is_empty() {
                add_field(&mut node, &child.name, child.text.as_deref());
            } else {
                node.children.push(Self::node_from_element(child));
            }
        }
        node
    }
}

fn value_of(raw: &str) -> AttributeValue {
    if raw == MASK {
        AttributeValue::Masked
    } else {
        AttributeValue::text(raw)
    }
}

fn add_field(node: &mut FactNode, name: &str, value: Option<&str>) {
    match reference_target(name) {
        Some(target) => {
            let mut reference = Reference::new(name, target);
            reference.value = value.filter(|v| !v.trim().is_empty()).map(str::to_string);
            node.references.push(reference);
        }
        None => {
            let value = value.map(value_of).unwrap_or(AttributeValue::Empty);
            node.attributes.insert(name.to_string(), value);
        }
    }
}

/// `PaxRefID` → `Pax`; `None` for ordinary fields.
pub fn reference_target(field: &str) -> Option<&str> {
    REFERENCE_SUFFIXES.iter().find_map(|suffix| {
        field
            .strip_suffix(suffix)
            .filter(|stem| !stem.is_empty())
    })
}

#[async_trait]
impl FactExtractor for StructuralExtractor {
    async fn extract(
        &self,
        subtree: &Subtree,
        ctx: &ExtractionContext,
    ) -> Result<Vec<ExtractedFact>, ExtractionError> {
        Ok(vec![ExtractedFact {
            node_type: ctx.node_type.clone(),
            payload: Self::node_from_element(&subtree.root),
        }])
    }

    fn name(&self) -> &str {
        "structural"
    }
}
