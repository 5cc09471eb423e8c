//! Vertical cards and compact tables for runs and patterns.

use aeroschema_core::{
    ChildShape, GapReport, Importance, Pattern, PatternScope, Presence, Run, RunSummary,
    RunWarning,
};
use aeroschema_engine::MergeOutcome;

const MAX_LIST_ITEMS: usize = 10;
const LABEL: usize = 26;

// ── Runs ──

/// Print one run as a card. `summary` adds the counts a just-finished run
/// reports.
pub fn print_run_card(run: &Run, summary: Option<&RunSummary>) {
    println!("=== Run {} ===", run.id);
    println!("{} / {}", run.kind.as_str(), run.status.as_str());
    println!();

    println!("Document");
    field("workspace", &run.workspace);
    field("spec_version", run.spec_version.as_deref().unwrap_or("-"));
    field("message_root", run.message_root.as_deref().unwrap_or("-"));
    println!();

    println!("Progress");
    field("started_at", &run.started_at.to_rfc3339());
    if let Some(finished) = run.finished_at {
        field("finished_at", &finished.to_rfc3339());
        let secs = (finished - run.started_at).num_milliseconds() as f64 / 1000.0;
        field("duration", &format!("{secs:.2}s"));
    }
    field("subtrees_seen", &run.subtrees_seen.to_string());
    field("subtrees_succeeded", &run.subtrees_succeeded.to_string());
    if let Some(s) = summary {
        field("node_facts", &s.node_facts_count.to_string());
        if let Some(n) = s.patterns_count {
            field("patterns", &n.to_string());
        }
        if let Some(n) = s.matches_count {
            field("matches", &n.to_string());
        }
    }
    if let Some(detail) = &run.error_detail {
        field("error_detail", detail);
    }
    println!();

    if !run.warnings.is_empty() {
        println!("Warnings ({})", run.warnings.len());
        for w in run.warnings.iter().take(MAX_LIST_ITEMS) {
            println!("  {}", describe_warning(w));
        }
        more(run.warnings.len());
        println!();
    }

    if !run.subtree_failures.is_empty() {
        println!("Subtree failures ({})", run.subtree_failures.len());
        for f in run.subtree_failures.iter().take(MAX_LIST_ITEMS) {
            println!("  {}#{}  {}", f.section_path, f.ordinal, f.message);
        }
        more(run.subtree_failures.len());
        println!();
    }

    if let Some(report) = &run.gap_report {
        print_gap_report(report);
    }
}

pub fn print_run_table(runs: &[Run]) {
    if runs.is_empty() {
        println!("(no runs)");
        return;
    }
    println!(
        "{:<36}  {:<9}  {:<15}  {:<7}  {:<20}  {}",
        "run_id", "kind", "status", "version", "message_root", "started_at"
    );
    for r in runs {
        println!(
            "{:<36}  {:<9}  {:<15}  {:<7}  {:<20}  {}",
            r.id,
            r.kind.as_str(),
            r.status.as_str(),
            r.spec_version.as_deref().unwrap_or("-"),
            r.message_root.as_deref().unwrap_or("-"),
            r.started_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
}

fn describe_warning(w: &RunWarning) -> String {
    match w {
        RunWarning::VersionFallback { assumed } => {
            format!("no version on document, assumed {assumed}")
        }
        RunWarning::UnsupportedVersion { detected } => {
            format!("version {detected} is not in the supported list")
        }
        RunWarning::ConfigurationGap {
            spec_version,
            message_root,
        } => format!("no targets configured for {message_root} {spec_version}"),
        RunWarning::TruncatedSubtree {
            section_path,
            ordinal,
        } => format!("{section_path}#{ordinal} truncated at size ceiling"),
        RunWarning::TimedOut { outstanding } => {
            format!("timed out with {outstanding} subtree(s) outstanding")
        }
    }
}

// ── Gap report ──

fn print_gap_report(report: &GapReport) {
    println!("Coverage");
    for tier in Importance::ALL {
        if let Some(c) = report.tiers.get(&tier) {
            println!(
                "  {:<width$} {:>6.1}%  ({}/{})",
                tier.as_str(),
                c.coverage_pct,
                c.covered,
                c.expected,
                width = LABEL
            );
        }
    }
    field("quality_score", &format!("{:.3}", report.quality_score));
    println!();

    if !report.verdict_counts.is_empty() {
        println!("Verdicts");
        for (verdict, n) in &report.verdict_counts {
            field(verdict.as_str(), &n.to_string());
        }
        println!();
    }

    list_section("Missing critical sections", &report.missing_critical);
    list_section("Unmatched sections", &report.unmatched_sections);
}

fn list_section(header: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    println!("{header} ({})", items.len());
    for item in items.iter().take(MAX_LIST_ITEMS) {
        println!("  {item}");
    }
    more(items.len());
    println!();
}

// ── Patterns ──

pub fn print_pattern_table(patterns: &[Pattern]) {
    if patterns.is_empty() {
        println!("(no patterns)");
        return;
    }
    println!(
        "{:>5}  {:<7}  {:<20}  {:<24}  {:>6}  {:<12}  {}",
        "id", "version", "message_root", "node_type", "seen", "signature", "section_path"
    );
    for p in patterns {
        let state = match (p.active, p.superseded_by) {
            (true, _) => String::new(),
            (false, Some(id)) => format!("  (merged into {id})"),
            (false, None) => "  (inactive)".to_string(),
        };
        println!(
            "{:>5}  {:<7}  {:<20}  {:<24}  {:>6}  {:<12}  {}{}",
            p.id,
            p.spec_version,
            p.message_root,
            p.node_type,
            p.times_seen,
            &p.signature_hash[..p.signature_hash.len().min(12)],
            p.section_path,
            state
        );
    }
}

/// Print one pattern with its decision rule.
pub fn print_pattern_card(p: &Pattern) -> anyhow::Result<()> {
    println!();
    println!("=== Pattern {} ({}) ===", p.id, p.node_type);
    println!("{}", p.section_path);
    println!();

    println!("Identity");
    field("spec_version", &p.spec_version);
    field("message_root", &p.message_root);
    field("signature_hash", &p.signature_hash);
    field("active", if p.active { "yes" } else { "no" });
    if let Some(id) = p.superseded_by {
        field("superseded_by", &id.to_string());
    }
    println!();

    println!("Usage");
    field("times_seen", &p.times_seen.to_string());
    field("first_seen", &p.first_seen.to_rfc3339());
    field("last_seen", &p.last_seen.to_rfc3339());
    if !p.example_fact_ids.is_empty() {
        let ids: Vec<String> = p.example_fact_ids.iter().map(u64::to_string).collect();
        field("example_facts", &ids.join(", "));
    }
    println!();

    println!("Rule");
    let rule = &p.rule;
    joined("must_have", rule.must_have_attributes.iter());
    joined("optional", rule.optional_attributes.iter());
    if !rule.reference_patterns.is_empty() {
        println!("  references ({}):", rule.reference_patterns.len());
        for (relation, presence) in &rule.reference_patterns {
            let tag = match presence {
                Presence::Must => "must",
                Presence::Optional => "optional",
            };
            println!("    {relation:<30}  {tag}");
        }
    }
    if !rule.child_structure.is_empty() {
        println!("  children:");
        for (name, shape) in &rule.child_structure {
            print_shape(name, shape, 2);
        }
    }
    Ok(())
}

fn print_shape(name: &str, shape: &ChildShape, depth: usize) {
    let indent = "  ".repeat(depth);
    let marker = if shape.required { "" } else { "?" };
    let attrs: Vec<String> = shape
        .must_have_attributes
        .iter()
        .cloned()
        .chain(shape.optional_attributes.iter().map(|a| format!("{a}?")))
        .collect();
    if attrs.is_empty() {
        println!("{indent}{name}{marker}");
    } else {
        println!("{indent}{name}{marker}  [{}]", attrs.join(", "));
    }
    for (child, child_shape) in &shape.children {
        print_shape(child, child_shape, depth + 1);
    }
}

pub fn print_merge_outcomes(scope: &PatternScope, outcomes: &[MergeOutcome]) {
    if outcomes.is_empty() {
        println!(
            "nothing to consolidate in {} {}",
            scope.message_root, scope.spec_version
        );
        return;
    }
    for o in outcomes {
        let merged: Vec<String> = o.superseded.iter().map(u64::to_string).collect();
        println!(
            "{:<40}  -> pattern {} (seen {}), superseded {}",
            o.survivor.section_path,
            o.survivor.id,
            o.survivor.times_seen,
            merged.join(", ")
        );
    }
}

// ── Helpers ──

fn field(label: &str, value: &str) {
    println!("  {:<width$} {}", label, value, width = LABEL);
}

fn joined<'a>(label: &str, items: impl Iterator<Item = &'a String>) {
    let items: Vec<&str> = items.map(String::as_str).collect();
    if !items.is_empty() {
        field(label, &items.join(", "));
    }
}

fn more(len: usize) {
    if len > MAX_LIST_ITEMS {
        println!("  ... and {} more", len - MAX_LIST_ITEMS);
    }
}
