//! Pattern learning and identification: fact extraction, normalization,
//! rule derivation, scoring, and coverage reporting.

mod error;

pub mod consolidate;
pub mod extract;
pub mod gap;
pub mod generator;
pub mod identify;
pub mod normalizer;
pub mod rule;
pub mod score;
pub mod structural;

#[cfg(feature = "http")]
pub mod http;

pub use consolidate::{Consolidator, MergeOutcome};
pub use error::{EngineError, ExtractionError};
pub use extract::{ExtractionContext, FactExtractor, MASK, PiiMasker};
pub use gap::gap_report;
pub use generator::{GenerationReport, GroupKey, PatternGenerator};
pub use identify::{Classification, IdentificationEngine, Scored};
pub use normalizer::FactNormalizer;
pub use structural::StructuralExtractor;

#[cfg(feature = "http")]
pub use http::{Backoff, HttpExtractor};
