//! Rule synthesis: promote qualifying clusters into learned rules.

use serde::Serialize;

use crate::cluster::Cluster;
use crate::model::{MatchKind, MatchSpec, Rule, RulePack, RuleSource};
use crate::signature::{self, CauseCategory, Learnability};

/// Failures a signature needs before automatic promotion.
pub const DEFAULT_PROMOTION_THRESHOLD: u64 = 2;

const MAX_MESSAGE_CHARS: usize = 200;

/// Why a cluster was not promoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    NotLearnable { learnability: Learnability },
    BelowThreshold { count: u64, threshold: u64 },
}

/// Result of synthesizing one cluster against the learned pack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SynthesisOutcome {
    Created { rule_id: String },
    Updated { rule_id: String },
    Unchanged { rule_id: String },
    Skipped(SkipReason),
}

impl SynthesisOutcome {
    #[must_use]
    pub fn rule_id(&self) -> Option<&str> {
        match self {
            Self::Created { rule_id } | Self::Updated { rule_id } | Self::Unchanged { rule_id } => {
                Some(rule_id)
            }
            Self::Skipped(_) => None,
        }
    }

    #[must_use]
    pub fn changed(&self) -> bool {
        matches!(self, Self::Created { .. } | Self::Updated { .. })
    }
}

/// Check whether a cluster may be promoted at `threshold`.
pub fn eligibility(cluster: &Cluster, threshold: u64) -> Result<(), SkipReason> {
    if !cluster.is_learnable() {
        return Err(SkipReason::NotLearnable {
            learnability: cluster.learnability,
        });
    }
    let threshold = threshold.max(1);
    if cluster.failure_count < threshold {
        return Err(SkipReason::BelowThreshold {
            count: cluster.failure_count,
            threshold,
        });
    }
    Ok(())
}

/// Promote `cluster` into `learned`, or refresh the rule already promoted
/// from the same signature. Rules are never removed.
///
/// `today` is the `YYYY-MM-DD` date stamped on newly created rules.
pub fn synthesize(
    cluster: &Cluster,
    threshold: u64,
    learned: &mut RulePack,
    today: &str,
) -> SynthesisOutcome {
    if let Err(reason) = eligibility(cluster, threshold) {
        return SynthesisOutcome::Skipped(reason);
    }

    let key = cluster.signature.key();
    let rule_id = cluster.signature.rule_id();
    let existing = learned
        .patterns
        .iter_mut()
        .find(|rule| rule.signature.as_deref() == Some(key.as_str()) || rule.id == rule_id);

    match existing {
        Some(rule) => {
            let before = rule.clone();
            refresh(rule, cluster);
            let rule_id = rule.id.clone();
            if *rule == before {
                SynthesisOutcome::Unchanged { rule_id }
            } else {
                tracing::debug!(rule_id = %rule_id, signature = %key, "Refreshed learned rule");
                SynthesisOutcome::Updated { rule_id }
            }
        }
        None => {
            let rule = build_rule(cluster, rule_id.clone(), today);
            tracing::info!(rule_id = %rule_id, signature = %key, "Promoted learned rule");
            learned.patterns.push(rule);
            SynthesisOutcome::Created { rule_id }
        }
    }
}

fn refresh(rule: &mut Rule, cluster: &Cluster) {
    rule.confidence = Some(cluster.confidence());
    rule.occurrences = Some(cluster.failure_count);
    rule.fix_count = Some(cluster.fix_count);
    if let Some(fix) = &cluster.representative_fix {
        rule.suggestion = Some(fix.clone());
    }
    rule.message = block_message(cluster);
    if rule.signature.is_none() {
        rule.signature = Some(cluster.signature.key());
    }
}

fn build_rule(cluster: &Cluster, id: String, today: &str) -> Rule {
    let cause = cluster.cause();
    Rule {
        id,
        name: format!("Learned: {} ({})", cluster.signature.head, cause.label()),
        category: cause.as_str().to_string(),
        tool: cluster.tool.clone(),
        matcher: match_spec_for(cluster),
        message: block_message(cluster),
        suggestion: cluster.representative_fix.clone(),
        confidence: Some(cluster.confidence()),
        source: Some(RuleSource::Learned),
        signature: Some(cluster.signature.key()),
        occurrences: Some(cluster.failure_count),
        fix_count: Some(cluster.fix_count),
        added: Some(today.to_string()),
    }
}

/// Match specification for a cluster, chosen by cause.
#[must_use]
pub fn match_spec_for(cluster: &Cluster) -> MatchSpec {
    let signature = &cluster.signature;
    let program = regex::escape(signature.program());
    match cluster.cause() {
        CauseCategory::BadFlag => match signature.flag() {
            Some(flag) => MatchSpec::new(
                MatchKind::Regex,
                format!(
                    r"^\s*(?:\S*/)?{program}\s+(?:\S+\s+)*{}(?:[\s=]|$)",
                    regex::escape(flag)
                ),
            ),
            None => MatchSpec::new(MatchKind::Exact, cluster.sample_command.trim()),
        },
        CauseCategory::CommandNotFound => {
            MatchSpec::new(MatchKind::Regex, format!(r"^\s*(?:\S*/)?{program}(?:\s|$)"))
        }
        CauseCategory::SyntaxError => {
            match signature::offending_substring(&cluster.sample_command, &cluster.sample_error) {
                Some(substring) => MatchSpec::new(MatchKind::Contains, substring),
                None => MatchSpec::new(MatchKind::Exact, cluster.sample_command.trim()),
            }
        }
        // Environmental causes never reach synthesis; exact is the narrowest fallback.
        CauseCategory::ActionError | CauseCategory::PathError | CauseCategory::PermissionError => {
            MatchSpec::new(MatchKind::Exact, cluster.sample_command.trim())
        }
    }
}

fn block_message(cluster: &Cluster) -> String {
    let first_line = cluster.sample_error.lines().next().unwrap_or("").trim();
    let excerpt = crate::event::truncate_chars(first_line, MAX_MESSAGE_CHARS);
    format!(
        "BLOCKED: learned from {} {} failure(s): {excerpt}",
        cluster.failure_count,
        cluster.cause().label()
    )
}

/// Where a cluster stands relative to promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    /// A learned rule exists for this signature
    Promoted,
    /// Eligible now; the next curation pass will promote it
    Ready,
    /// Learnable but below threshold
    Pending,
    /// Environmental or degenerate; never promoted
    Ineligible,
}

/// One row of a review listing.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewItem {
    pub signature: String,
    pub status: ReviewStatus,
    pub failure_count: u64,
    pub fix_count: u64,
    pub confidence_percent: u8,
    pub sample_command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub representative_fix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip: Option<SkipReason>,
}

/// Classify every cluster for review, most frequent first.
#[must_use]
pub fn review<'a>(
    clusters: impl IntoIterator<Item = &'a Cluster>,
    threshold: u64,
    learned: &RulePack,
) -> Vec<ReviewItem> {
    let mut items: Vec<ReviewItem> = clusters
        .into_iter()
        .map(|cluster| {
            let key = cluster.signature.key();
            let promoted = learned
                .find_by_signature(&key)
                .or_else(|| learned.find(&cluster.signature.rule_id()));
            let skip = eligibility(cluster, threshold).err();
            let status = match (promoted, skip) {
                (Some(_), _) => ReviewStatus::Promoted,
                (None, None) => ReviewStatus::Ready,
                (None, Some(SkipReason::BelowThreshold { .. })) => ReviewStatus::Pending,
                (None, Some(SkipReason::NotLearnable { .. })) => ReviewStatus::Ineligible,
            };
            ReviewItem {
                signature: key,
                status,
                failure_count: cluster.failure_count,
                fix_count: cluster.fix_count,
                confidence_percent: cluster.confidence_percent(),
                sample_command: cluster.sample_command.clone(),
                representative_fix: cluster.representative_fix.clone(),
                rule_id: promoted.map(|rule| rule.id.clone()),
                skip,
            }
        })
        .collect();
    items.sort_by(|a, b| {
        b.failure_count
            .cmp(&a.failure_count)
            .then_with(|| a.signature.cmp(&b.signature))
    });
    items
}
