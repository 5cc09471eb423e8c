//! Wraps extractor output into canonical NodeFacts.

use aeroschema_core::{ExtractedFact, NodeFact, normalize_section_path};
use aeroschema_ingest::Subtree;
use chrono::Utc;
use uuid::Uuid;

use crate::extract::PiiMasker;

/// Run-scoped context stamped onto every fact.
#[derive(Debug, Clone)]
pub struct FactNormalizer {
    pub run_id: Uuid,
    pub workspace: String,
    pub spec_version: String,
    pub message_root: String,
    masker: PiiMasker,
}

impl FactNormalizer {
    pub fn new(
        run_id: Uuid,
        workspace: impl Into<String>,
        spec_version: impl Into<String>,
        message_root: impl Into<String>,
        masker: PiiMasker,
    ) -> Self {
        Self {
            run_id,
            workspace: workspace.into(),
            spec_version: spec_version.into(),
            message_root: message_root.into(),
            masker,
        }
    }

    pub fn masker(&self) -> &PiiMasker {
        &self.masker
    }

    /// One NodeFact per extracted fact. `redacted` tells whether the subtree
    /// had values masked before extraction.
    ///
    /// An extracted fact with a blank node type takes the subtree's.
    pub fn normalize(
        &self,
        subtree: &Subtree,
        extracted: Vec<ExtractedFact>,
        redacted: bool,
    ) -> Vec<NodeFact> {
        let section_path = normalize_section_path(&subtree.section_path);
        let now = Utc::now();
        extracted
            .into_iter()
            .map(|mut fact| {
                let masked = self.masker.mask_fact(&mut fact.payload);
                let node_type = match fact.node_type.trim() {
                    "" => subtree.node_type.clone(),
                    t => t.to_string(),
                };
                let pii_masked = redacted || masked || fact.payload.has_masked_values();
                NodeFact {
                    id: None,
                    run_id: self.run_id,
                    workspace: self.workspace.clone(),
                    spec_version: self.spec_version.clone(),
                    message_root: self.message_root.clone(),
                    section_path: section_path.clone(),
                    node_type,
                    ordinal: subtree.ordinal,
                    payload: fact.payload,
                    pii_masked,
                    truncated: subtree.truncated,
                    created_at: now,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aeroschema_core::FactNode;
    use aeroschema_ingest::XmlElement;

    fn subtree() -> Subtree {
        Subtree {
            section_path: "ns:IATA_OrderViewRS/ns:Response/Order".into(),
            node_type: "Order".into(),
            ordinal: 3,
            root: XmlElement::new("Order"),
            truncated: true,
            size_bytes: 10,
        }
    }

    #[test]
    fn stamps_run_context() {
        let run_id = Uuid::new_v4();
        let n = FactNormalizer::new(run_id, "acme", "21.3", "IATA_OrderViewRS", PiiMasker::default());
        let facts = n.normalize(
            &subtree(),
            vec![ExtractedFact {
                node_type: " ".into(),
                payload: FactNode::new("Order").with_attribute("OrderID", "O1"),
            }],
            false,
        );
        assert_eq!(facts.len(), 1);
        let f = &facts[0];
        assert_eq!(f.run_id, run_id);
        assert_eq!(f.section_path, "IATA_OrderViewRS/Response/Order");
        assert_eq!(f.node_type, "Order");
        assert_eq!(f.ordinal, 3);
        assert!(f.truncated);
        assert!(!f.pii_masked);
        assert!(f.id.is_none());
    }

    #[test]
    fn masking_sets_flag() {
        let n = FactNormalizer::new(
            Uuid::new_v4(),
            "acme",
            "21.3",
            "IATA_OrderViewRS",
            PiiMasker::new(["Surname"]),
        );
        let facts = n.normalize(
            &subtree(),
            vec![ExtractedFact {
                node_type: "Pax".into(),
                payload: FactNode::new("Pax").with_attribute("Surname", "Smith"),
            }],
            false,
        );
        assert!(facts[0].pii_masked);
        assert!(facts[0].payload.attributes["Surname"].is_masked());

        let redacted = n.normalize(
            &subtree(),
            vec![ExtractedFact {
                node_type: "Pax".into(),
                payload: FactNode::new("Pax"),
            }],
            true,
        );
        assert!(redacted[0].pii_masked);
    }
}
