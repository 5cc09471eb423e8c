//! Coverage of an identify Run against its configured sections.

use std::collections::{BTreeMap, BTreeSet};

use aeroschema_core::{GapReport, Importance, PatternMatch, TierCoverage};

/// Share of the quality score carried by tier coverage; the rest is mean
/// match confidence.
const COVERAGE_SHARE: f64 = 0.8;
const CONFIDENCE_SHARE: f64 = 0.2;

/// Aggregate the matches of one Run.
///
/// `expected` maps each configured section path to its tier. `present`
/// holds the section paths the document actually contained, so that a
/// critical section the document lacks can be told apart from one that
/// was present but never matched.
///
/// The quality score is 0.0 whenever there is nothing to grade: no tier
/// expects a section and no fact was matched. An empty Run therefore scores
/// like a Run whose every subtree failed; callers tell them apart by the
/// Run status and the empty `verdict_counts`.
pub fn gap_report(
    matches: &[PatternMatch],
    expected: &BTreeMap<String, Importance>,
    present: &BTreeSet<String>,
) -> GapReport {
    let covered: BTreeSet<&str> = matches
        .iter()
        .filter(|m| m.verdict.is_match())
        .map(|m| m.section_path.as_str())
        .collect();

    let mut tiers = BTreeMap::new();
    for tier in Importance::ALL {
        let sections: Vec<&String> = expected
            .iter()
            .filter(|(_, t)| **t == tier)
            .map(|(path, _)| path)
            .collect();
        let hit = sections
            .iter()
            .filter(|s| covered.contains(s.as_str()))
            .count();
        let coverage_pct = if sections.is_empty() {
            100.0
        } else {
            100.0 * hit as f64 / sections.len() as f64
        };
        tiers.insert(
            tier,
            TierCoverage {
                expected: sections.len(),
                covered: hit,
                coverage_pct,
            },
        );
    }

    let missing_critical = expected
        .iter()
        .filter(|(path, tier)| **tier == Importance::Critical && !present.contains(*path))
        .map(|(path, _)| path.clone())
        .collect();
    let unmatched_sections = expected
        .keys()
        .filter(|path| present.contains(*path) && !covered.contains(path.as_str()))
        .cloned()
        .collect();

    let mut verdict_counts = BTreeMap::new();
    for m in matches {
        *verdict_counts.entry(m.verdict).or_insert(0) += 1;
    }

    let quality_score = quality(&tiers, matches);
    GapReport {
        tiers,
        missing_critical,
        unmatched_sections,
        verdict_counts,
        quality_score,
    }
}

fn quality(tiers: &BTreeMap<Importance, TierCoverage>, matches: &[PatternMatch]) -> f64 {
    let (weighted, weights) = tiers
        .iter()
        .filter(|(_, c)| c.expected > 0)
        .fold((0.0, 0.0), |(acc, w), (tier, c)| {
            (acc + tier.weight() * c.coverage_pct / 100.0, w + tier.weight())
        });
    let coverage = if weights > 0.0 { weighted / weights } else { 0.0 };
    let confidence = if matches.is_empty() {
        0.0
    } else {
        matches.iter().map(|m| m.confidence).sum::<f64>() / matches.len() as f64
    };
    (COVERAGE_SHARE * coverage + CONFIDENCE_SHARE * confidence).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aeroschema_core::Verdict;
    use chrono::Utc;
    use uuid::Uuid;

    fn m(section: &str, verdict: Verdict, confidence: f64) -> PatternMatch {
        PatternMatch {
            id: None,
            run_id: Uuid::nil(),
            workspace: "acme".into(),
            node_fact_id: 1,
            section_path: section.into(),
            pattern_id: Some(1),
            verdict,
            confidence,
            breakdown: None,
            candidates_considered: 1,
            created_at: Utc::now(),
        }
    }

    fn expected() -> BTreeMap<String, Importance> {
        BTreeMap::from([
            ("R/Order".to_string(), Importance::Critical),
            ("R/PaxList".to_string(), Importance::Critical),
            ("R/Offer".to_string(), Importance::High),
            ("R/Warning".to_string(), Importance::Low),
        ])
    }

    #[test]
    fn tiers_count_only_real_matches() {
        let matches = [
            m("R/Order", Verdict::ExactMatch, 1.0),
            m("R/Offer", Verdict::NewPattern, 0.0),
            m("R/Warning", Verdict::NoMatch, 0.3),
        ];
        let present = BTreeSet::from([
            "R/Order".to_string(),
            "R/Offer".to_string(),
            "R/Warning".to_string(),
        ]);
        let report = gap_report(&matches, &expected(), &present);

        let critical = report.tiers[&Importance::Critical];
        assert_eq!((critical.expected, critical.covered), (2, 1));
        assert_eq!(critical.coverage_pct, 50.0);
        assert_eq!(report.tiers[&Importance::High].covered, 0);
        assert_eq!(report.tiers[&Importance::Medium].coverage_pct, 100.0);
        assert_eq!(report.missing_critical, vec!["R/PaxList".to_string()]);
        assert_eq!(
            report.unmatched_sections,
            vec!["R/Offer".to_string(), "R/Warning".to_string()]
        );
        assert_eq!(report.verdict_counts[&Verdict::NewPattern], 1);
    }

    #[test]
    fn full_coverage_with_exact_matches_scores_one() {
        let expected = BTreeMap::from([("R/Order".to_string(), Importance::Critical)]);
        let present = BTreeSet::from(["R/Order".to_string()]);
        let report = gap_report(&[m("R/Order", Verdict::ExactMatch, 1.0)], &expected, &present);
        assert!((report.quality_score - 1.0).abs() < 1e-12);
        assert!(report.missing_critical.is_empty());
    }

    #[test]
    fn nothing_expected_and_nothing_matched() {
        let report = gap_report(&[], &BTreeMap::new(), &BTreeSet::new());
        assert_eq!(report.quality_score, 0.0);
        assert_eq!(report.tiers.len(), 4);
        assert!(report.tiers.values().all(|c| c.coverage_pct == 100.0));
        assert!(report.verdict_counts.is_empty());
        assert!(report.missing_critical.is_empty());
    }
}
