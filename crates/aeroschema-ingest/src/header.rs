//! Message-root and spec-version detection from the document's root element.
//!
//! Detection never fails a Run: when the root carries neither a version
//! attribute nor a versioned namespace, the most recent supported version is
//! assumed and a warning is recorded.

use aeroschema_core::normalize::{local_name, normalize_version};
use aeroschema_core::{ExtractionConfig, RunWarning};
use serde::{Deserialize, Serialize};

/// Where the document version came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionSource {
    Attribute,
    Namespace,
    Fallback,
}

/// Facts about the document gathered from its root element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentHeader {
    pub message_root: String,
    /// Default namespace of the root, if declared.
    pub namespace: Option<String>,
    /// Normalised version found on the root, if any.
    pub declared_version: Option<String>,
    pub version_source: VersionSource,
}

/// The version a Run works under, with any warnings produced getting there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedVersion {
    pub spec_version: String,
    pub source: VersionSource,
    pub warnings: Vec<RunWarning>,
}

impl DocumentHeader {
    /// Build a header from the root element's local name, attributes
    /// (`(raw_key, value)`, prefixes intact) and namespace declarations.
    pub fn detect(root_name: &str, attributes: &[(String, String)]) -> Self {
        let mut namespace = None;
        let mut namespaces = Vec::new();
        let mut version_attr = None;

        for (key, value) in attributes {
            if key == "xmlns" {
                namespace = Some(value.clone());
                namespaces.push(value.as_str());
            } else if key.starts_with("xmlns:") {
                namespaces.push(value.as_str());
            } else if is_version_attribute(local_name(key)) && version_attr.is_none() {
                version_attr = normalize_version(value);
            }
        }

        let (declared_version, version_source) = match version_attr {
            Some(v) => (Some(v), VersionSource::Attribute),
            None => match namespaces.iter().find_map(|ns| version_from_namespace(ns)) {
                Some(v) => (Some(v), VersionSource::Namespace),
                None => (None, VersionSource::Fallback),
            },
        };

        Self {
            message_root: local_name(root_name).to_string(),
            namespace,
            declared_version,
            version_source,
        }
    }

    /// Settle the Run's spec version against the configured supported list.
    pub fn resolve_version(&self, config: &ExtractionConfig) -> ResolvedVersion {
        let fallback = config.fallback_version().unwrap_or("unknown").to_string();
        match &self.declared_version {
            Some(v) => {
                let mut warnings = Vec::new();
                if !config.is_supported(v) {
                    tracing::warn!(version = %v, root = %self.message_root, "unsupported spec version");
                    warnings.push(RunWarning::UnsupportedVersion { detected: v.clone() });
                }
                ResolvedVersion {
                    spec_version: v.clone(),
                    source: self.version_source,
                    warnings,
                }
            }
            None => {
                tracing::warn!(
                    root = %self.message_root,
                    assumed = %fallback,
                    "no version on document root, assuming most recent"
                );
                ResolvedVersion {
                    warnings: vec![RunWarning::VersionFallback {
                        assumed: fallback.clone(),
                    }],
                    spec_version: fallback,
                    source: VersionSource::Fallback,
                }
            }
        }
    }
}

fn is_version_attribute(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    matches!(
        lower.as_str(),
        "version" | "schemaversion" | "messageversion" | "specversion"
    )
}

/// First `digits.digits` path segment of a namespace URI.
///
/// `http://www.iata.org/IATA/2015/00/2018.2/IATA_OrderViewRS` → `18.2`.
fn version_from_namespace(ns: &str) -> Option<String> {
    ns.split(['/', ':', '#'])
        .filter(|seg| seg.contains('.') && seg.bytes().next().is_some_and(|b| b.is_ascii_digit() || b == b'v'))
        .find_map(normalize_version)
}
