//! Plain-text and JSON rendering for CLI results.

use std::fmt::Write as _;

use clap::ValueEnum;
use errloop_core::curate::{CurationReport, ReviewReport};
use errloop_core::ledger::LedgerStats;
use errloop_core::matcher::{AllowReason, EngineFault, FaultSource, Verdict};
use errloop_core::packs::{MergeReport, PackListing, PackOrigin};
use errloop_core::synth::ReviewStatus;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Plain,
    Json,
}

/// Print `value` as JSON, or the plain rendering.
pub fn emit<T: Serialize>(format: OutputFormat, value: &T, plain: impl FnOnce(&T) -> String) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Plain => {
            let text = plain(value);
            if !text.is_empty() {
                print!("{text}");
                if !text.ends_with('\n') {
                    println!();
                }
            }
        }
    }
    Ok(())
}

fn describe_fault(fault: &EngineFault) -> String {
    let source = match &fault.source {
        FaultSource::Rule { rule_id } => format!("rule {rule_id}"),
        FaultSource::Allowlist { index } => format!("allowlist entry #{index}"),
    };
    format!("{source}: pattern {:?}: {}", fault.pattern, fault.reason)
}

/// Verdict text; `active_rules` is set only for `check --explain`, which
/// also lists engine faults.
pub fn verdict(verdict: &Verdict, active_rules: Option<usize>, faults: &[EngineFault]) -> String {
    let mut out = String::new();
    match verdict {
        Verdict::Block(detail) => {
            let _ = writeln!(out, "BLOCKED by {}", detail.rule_id);
            let _ = writeln!(out, "{}", detail.render(true));
        }
        Verdict::Allow(AllowReason::Allowlisted { kind, pattern }) => {
            let _ = writeln!(out, "allowed (allowlist {kind:?} {pattern:?})");
        }
        Verdict::Allow(AllowReason::NoMatch) => out.push_str("allowed (no rule matched)\n"),
        Verdict::Allow(AllowReason::EmptyCommand) => out.push_str("allowed (empty command)\n"),
        Verdict::FaultAllow(fault) => {
            let _ = writeln!(out, "allowed (fail-open: {})", describe_fault(fault));
        }
    }
    if let Some(rules) = active_rules {
        let _ = writeln!(out, "active rules: {rules}");
        if faults.is_empty() {
            out.push_str("engine faults: none\n");
        } else {
            let _ = writeln!(out, "engine faults: {}", faults.len());
            for fault in faults {
                let _ = writeln!(out, "  - {}", describe_fault(fault));
            }
        }
    }
    out
}

pub fn merge(report: &MergeReport) -> String {
    let mut out = String::new();
    for pack in &report.loaded {
        let origin = match &pack.origin {
            PackOrigin::Builtin => "builtin".to_string(),
            PackOrigin::File(path) => path.display().to_string(),
        };
        let _ = write!(out, "  loaded  {:<12} {:>4} rules  ({origin})", pack.name, pack.rules);
        if pack.skipped_entries > 0 {
            let _ = write!(out, ", {} invalid entries skipped", pack.skipped_entries);
        }
        out.push('\n');
    }
    for skipped in &report.skipped {
        let _ = writeln!(out, "  skipped {:<12} {}", skipped.name, skipped.reason);
    }
    if report.overridden > 0 {
        let _ = writeln!(out, "  {} rule(s) overridden by later packs", report.overridden);
    }
    out
}

pub fn curation(report: &CurationReport) -> String {
    let mut out = String::new();
    let summary = &report.summary;
    let _ = writeln!(
        out,
        "{}curation (threshold {}): {} cluster(s), {} created, {} updated, {} unchanged, {} skipped",
        if report.dry_run { "dry-run " } else { "" },
        report.threshold,
        summary.clusters,
        summary.created.len(),
        summary.updated.len(),
        summary.unchanged,
        summary.skipped.len()
    );
    for id in &summary.created {
        let _ = writeln!(out, "  + {id}");
    }
    for id in &summary.updated {
        let _ = writeln!(out, "  ~ {id}");
    }
    if let Some(signature) = &summary.unknown_signature {
        let _ = writeln!(out, "  no cluster with signature {signature}");
    }
    if report.ledger.skipped_lines > 0 {
        let _ = writeln!(out, "  {} malformed ledger line(s) skipped", report.ledger.skipped_lines);
    }
    if let Some(merge_report) = &report.merge {
        out.push_str("active ruleset rebuilt:\n");
        out.push_str(&merge(merge_report));
    }
    out
}

pub fn review(report: &ReviewReport) -> String {
    if report.items.is_empty() {
        return "No failures recorded.\n".to_string();
    }
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} signature(s), promotion threshold {}",
        report.items.len(),
        report.threshold
    );
    for item in &report.items {
        let status = match item.status {
            ReviewStatus::Promoted => "PROMOTED",
            ReviewStatus::Ready => "READY",
            ReviewStatus::Pending => "PENDING",
            ReviewStatus::Ineligible => "INELIGIBLE",
        };
        let _ = writeln!(
            out,
            "[{status:<10}] {}  failures={} fixes={} confidence={}%",
            item.signature, item.failure_count, item.fix_count, item.confidence_percent
        );
        let sample: String = item.sample_command.chars().take(80).collect();
        let _ = writeln!(out, "    sample: {sample}");
        if let Some(fix) = &item.representative_fix {
            let _ = writeln!(out, "    fix:    {fix}");
        }
        if let Some(rule_id) = &item.rule_id {
            let _ = writeln!(out, "    rule:   {rule_id}");
        }
    }
    out
}

pub fn pack_list(listing: &[PackListing]) -> String {
    let mut out = String::new();
    for (idx, pack) in listing.iter().enumerate() {
        let mark = if pack.enabled { "[x]" } else { "[ ]" };
        let origin = match &pack.origin {
            Some(PackOrigin::Builtin) => "builtin".to_string(),
            Some(PackOrigin::File(path)) => path.display().to_string(),
            None => "-".to_string(),
        };
        let _ = write!(out, "{:>2}. {mark} {:<12} {:>4} rules  {origin}", idx + 1, pack.name, pack.rules);
        if let Some(error) = &pack.error {
            let _ = write!(out, "  ({error})");
        }
        out.push('\n');
    }
    out
}

pub fn ledger_stats(stats: &LedgerStats) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "failures:        {}", stats.failures);
    let _ = writeln!(out, "fixes:           {}", stats.fixes);
    let _ = writeln!(out, "  linked by id:  {}", stats.linked_explicit);
    let _ = writeln!(out, "  by adjacency:  {}", stats.linked_adjacent);
    let _ = writeln!(out, "  unlinked:      {}", stats.orphan_fixes);
    let _ = writeln!(out, "awaiting fix:    {}", stats.awaiting_fix);
    let _ = writeln!(out, "skipped lines:   {}", stats.skipped_lines);
    out
}
