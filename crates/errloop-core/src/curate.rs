//! Curation passes: ledger → clusters → learned pack → active ruleset.
//!
//! A pass rebuilds clusters from the full ledger every time, so running it
//! twice over the same ledger leaves the learned pack byte-identical.

use std::fs::OpenOptions;
use std::io::Write;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::Result;
use crate::cluster::{self, Cluster};
use crate::event::LedgerEntry;
use crate::ledger::{self, LedgerStats};
use crate::model::RulePack;
use crate::packs::{self, MergeReport};
use crate::synth::{self, ReviewItem, SkipReason, SynthesisOutcome};
use crate::workspace::Workspace;

/// Which clusters a pass may promote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", content = "signature", rename_all = "snake_case")]
pub enum CurateMode {
    /// Clusters at or above the configured threshold
    Auto,
    /// Every learnable cluster (threshold 1)
    All,
    /// One cluster by signature key (threshold 1)
    Signature(String),
}

impl CurateMode {
    fn threshold(&self, configured: u64) -> u64 {
        match self {
            Self::Auto => configured,
            Self::All | Self::Signature(_) => 1,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::All => "all",
            Self::Signature(_) => "manual",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurateOptions {
    pub mode: CurateMode,
    /// Compute the outcome without writing anything
    pub dry_run: bool,
}

impl Default for CurateOptions {
    fn default() -> Self {
        Self {
            mode: CurateMode::Auto,
            dry_run: false,
        }
    }
}

/// A cluster that was considered but not promoted.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedCluster {
    pub signature: String,
    #[serde(flatten)]
    pub reason: SkipReason,
}

/// Pure result of synthesizing a set of clusters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CurationSummary {
    pub clusters: usize,
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: usize,
    pub skipped: Vec<SkippedCluster>,
    /// Set when a requested signature has no cluster
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unknown_signature: Option<String>,
}

impl CurationSummary {
    #[must_use]
    pub fn changed(&self) -> bool {
        !self.created.is_empty() || !self.updated.is_empty()
    }
}

/// Synthesize rules from raw ledger entries into `learned`.
///
/// Clusters are visited in signature order, so the resulting pack depends
/// only on the ledger contents and the prior pack.
pub fn curate_entries(
    entries: &[LedgerEntry],
    learned: &mut RulePack,
    threshold: u64,
    mode: &CurateMode,
    today: &str,
) -> CurationSummary {
    let linked = ledger::reconstruct(entries);
    let clusters = cluster::aggregate(linked.records());
    curate_clusters(&clusters, learned, mode.threshold(threshold), mode, today)
}

fn curate_clusters(
    clusters: &std::collections::BTreeMap<String, Cluster>,
    learned: &mut RulePack,
    threshold: u64,
    mode: &CurateMode,
    today: &str,
) -> CurationSummary {
    let mut summary = CurationSummary {
        clusters: clusters.len(),
        ..CurationSummary::default()
    };

    let selected: Vec<&Cluster> = match mode {
        CurateMode::Signature(key) => match clusters.get(key) {
            Some(cluster) => vec![cluster],
            None => {
                summary.unknown_signature = Some(key.clone());
                Vec::new()
            }
        },
        CurateMode::Auto | CurateMode::All => clusters.values().collect(),
    };

    for cluster in selected {
        match synth::synthesize(cluster, threshold, learned, today) {
            SynthesisOutcome::Created { rule_id } => summary.created.push(rule_id),
            SynthesisOutcome::Updated { rule_id } => summary.updated.push(rule_id),
            SynthesisOutcome::Unchanged { .. } => summary.unchanged += 1,
            SynthesisOutcome::Skipped(reason) => summary.skipped.push(SkippedCluster {
                signature: cluster.signature.key(),
                reason,
            }),
        }
    }
    summary
}

/// Full report of a curation pass.
#[derive(Debug, Clone, Serialize)]
pub struct CurationReport {
    pub mode: CurateMode,
    pub dry_run: bool,
    pub threshold: u64,
    pub ledger: LedgerStats,
    #[serde(flatten)]
    pub summary: CurationSummary,
    /// Whether the learned pack file was rewritten
    pub learned_written: bool,
    /// Present when the active ruleset was rebuilt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge: Option<MergeReport>,
}

/// Run a curation pass against the workspace.
#[tracing::instrument(skip(ws), fields(home = %ws.paths.home.display()))]
pub fn run_curation(
    ws: &Workspace,
    options: &CurateOptions,
    now: DateTime<Utc>,
) -> Result<CurationReport> {
    let mut learned = packs::load_learned(&ws.paths.packs_dir)?;
    let snapshot = ws.ledger().snapshot()?;
    let linked = ledger::reconstruct(&snapshot.entries);
    let stats = LedgerStats::compute(&snapshot, &linked);
    let clusters = cluster::aggregate(linked.records());

    let threshold = options.mode.threshold(ws.config.promotion_threshold);
    let today = now.format("%Y-%m-%d").to_string();
    let summary = curate_clusters(&clusters, &mut learned, threshold, &options.mode, &today);

    let mut report = CurationReport {
        mode: options.mode.clone(),
        dry_run: options.dry_run,
        threshold,
        ledger: stats,
        summary,
        learned_written: false,
        merge: None,
    };
    if options.dry_run {
        return Ok(report);
    }

    if report.summary.changed() {
        packs::save_pack(&ws.paths.learned_pack(), &learned, ws.lock_timeout())?;
        report.learned_written = true;
        append_curated_log(ws, &options.mode, &report.summary, now)?;
    }

    if report.learned_written || !ws.paths.active.is_file() {
        let (_, merge) = ws.rebuild_active(now)?;
        report.merge = Some(merge);
    }

    tracing::info!(
        created = report.summary.created.len(),
        updated = report.summary.updated.len(),
        clusters = report.summary.clusters,
        "Curation pass complete"
    );
    Ok(report)
}

fn append_curated_log(
    ws: &Workspace,
    mode: &CurateMode,
    summary: &CurationSummary,
    now: DateTime<Utc>,
) -> Result<()> {
    let path = &ws.paths.curated_log;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut line = format!(
        "[{}] {} curation: {} created, {} updated",
        crate::event::format_timestamp(now),
        mode.label(),
        summary.created.len(),
        summary.updated.len()
    );
    if !summary.created.is_empty() {
        line.push_str(": ");
        line.push_str(&summary.created.join(", "));
    }
    line.push('\n');
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    Ok(())
}

/// Review listing over the current ledger and learned pack.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewReport {
    pub threshold: u64,
    pub ledger: LedgerStats,
    pub items: Vec<ReviewItem>,
}

pub fn review_workspace(ws: &Workspace) -> Result<ReviewReport> {
    let learned = packs::load_learned(&ws.paths.packs_dir)?;
    let snapshot = ws.ledger().snapshot()?;
    let linked = ledger::reconstruct(&snapshot.entries);
    let clusters = cluster::aggregate(linked.records());
    let threshold = ws.config.promotion_threshold;
    Ok(ReviewReport {
        threshold,
        ledger: LedgerStats::compute(&snapshot, &linked),
        items: synth::review(clusters.values(), threshold, &learned),
    })
}
