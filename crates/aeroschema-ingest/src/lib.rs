//! Ingestion layer: path trie target matching and single-pass streaming
//! extraction of target subtrees from arbitrarily large XML documents.

mod error;
pub mod header;
pub mod scan;
pub mod subtree;
pub mod trie;

pub use error::IngestError;
pub use header::{DocumentHeader, ResolvedVersion, VersionSource};
pub use scan::{SubtreeStream, XmlScanner};
pub use subtree::{Subtree, XmlElement};
pub use trie::{PathTrie, TargetInfo};
