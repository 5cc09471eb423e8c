//! The fact-extraction capability and the PII masking applied around it.

use std::collections::BTreeSet;

use aeroschema_core::{AttributeValue, ExtractedFact, FactNode};
use aeroschema_ingest::{Subtree, XmlElement};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ExtractionError;

/// Placeholder written over sensitive values before a subtree leaves the
/// process.
pub const MASK: &str = "[MASKED]";

/// What an extractor is told about the subtree it is given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionContext {
    pub spec_version: String,
    pub message_root: String,
    pub section_path: String,
    pub node_type: String,
}

impl ExtractionContext {
    pub fn for_subtree(spec_version: &str, message_root: &str, subtree: &Subtree) -> Self {
        Self {
            spec_version: spec_version.to_string(),
            message_root: message_root.to_string(),
            section_path: subtree.section_path.clone(),
            node_type: subtree.node_type.clone(),
        }
    }
}

/// Turns one subtree into structured facts.
///
/// Implementations must be idempotent per subtree. Retries, backoff and
/// fallbacks belong inside the implementation; callers see one call and one
/// result.
#[async_trait]
pub trait FactExtractor: Send + Sync {
    async fn extract(
        &self,
        subtree: &Subtree,
        ctx: &ExtractionContext,
    ) -> Result<Vec<ExtractedFact>, ExtractionError>;

    /// Short name for logs.
    fn name(&self) -> &str;
}

/// Masks configured sensitive fields by local name.
#[derive(Debug, Clone, Default)]
pub struct PiiMasker {
    fields: BTreeSet<String>,
}

impl PiiMasker {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            fields: fields
                .into_iter()
                .map(|f| f.as_ref().trim().to_string())
                .filter(|f| !f.is_empty())
                .collect(),
        }
    }

    pub fn is_sensitive(&self, name: &str) -> bool {
        self.fields.contains(name)
    }

    /// Copy of `element` with sensitive attribute values and leaf texts
    /// replaced by [`MASK`]. The flag reports whether anything was masked.
    pub fn redact(&self, element: &XmlElement) -> (XmlElement, bool) {
        let mut out = element.clone();
        let masked = self.redact_in_place(&mut out);
        (out, masked)
    }

    fn redact_in_place(&self, element: &mut XmlElement) -> bool {
        let mut masked = false;
        for (name, value) in &mut element.attributes {
            if self.is_sensitive(name) && !value.is_empty() {
                *value = MASK.to_string();
                masked = true;
            }
        }
        if self.is_sensitive(&element.name) && element.is_leaf() {
            if let Some(text) = &mut element.text {
                *text = MASK.to_string();
                masked = true;
            }
        }
        for child in &mut element.children {
            masked |= self.redact_in_place(child);
        }
        masked
    }

    /// Mask sensitive attributes of extracted facts, for extractors that
    /// echo raw values back. Returns whether anything was masked.
    pub fn mask_fact(&self, node: &mut FactNode) -> bool {
        let mut masked = false;
        for (name, value) in &mut node.attributes {
            let echoed = matches!(value, AttributeValue::Text(t) if t.as_str() == MASK);
            if echoed || (self.is_sensitive(name) && matches!(value, AttributeValue::Text(_))) {
                *value = AttributeValue::Masked;
                masked = true;
            }
        }
        for child in &mut node.children {
            masked |= self.mask_fact(child);
        }
        masked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pax() -> XmlElement {
        XmlElement::new("Pax")
            .with_attribute("PaxID", "PAX1")
            .with_child(XmlElement::new("PTC").with_text("ADT"))
            .with_child(
                XmlElement::new("Individual")
                    .with_child(XmlElement::new("GivenName").with_text("Ada"))
                    .with_child(XmlElement::new("Surname").with_text("Lovelace")),
            )
    }

    #[test]
    fn redact_masks_sensitive_leaves_only() {
        let masker = PiiMasker::new(["GivenName", "Surname"]);
        let (redacted, masked) = masker.redact(&pax());
        assert!(masked);
        let individual = &redacted.children[1];
        assert_eq!(individual.children[0].text.as_deref(), Some(MASK));
        assert_eq!(individual.children[1].text.as_deref(), Some(MASK));
        assert_eq!(redacted.children[0].text.as_deref(), Some("ADT"));
        assert!(!redacted.to_xml().contains("Lovelace"));
    }

    #[test]
    fn redact_masks_attributes() {
        let masker = PiiMasker::new(["PaxID"]);
        let (redacted, masked) = masker.redact(&pax());
        assert!(masked);
        assert_eq!(redacted.attribute("PaxID"), Some(MASK));
    }

    #[test]
    fn nothing_sensitive_nothing_masked() {
        let masker = PiiMasker::new(["Birthdate"]);
        let (redacted, masked) = masker.redact(&pax());
        assert!(!masked);
        assert_eq!(redacted, pax());
    }

    #[test]
    fn mask_fact_catches_echoed_values() {
        let masker = PiiMasker::new(["Surname"]);
        let mut node = FactNode::new("Individual")
            .with_attribute("Surname", "Lovelace")
            .with_attribute("GivenName", MASK)
            .with_attribute("Gender", "F");
        assert!(masker.mask_fact(&mut node));
        assert_eq!(node.attributes["Surname"], AttributeValue::Masked);
        assert_eq!(node.attributes["GivenName"], AttributeValue::Masked);
        assert_eq!(node.attributes["Gender"], AttributeValue::text("F"));
        assert!(node.has_masked_values());
    }
}
