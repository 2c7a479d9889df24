//! Cluster aggregation: group linked failures by signature.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::ledger::FailureRecord;
use crate::model::confidence_to_percent;
use crate::signature::{CauseCategory, Learnability, Signature};

/// Aggregated evidence for one signature.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cluster {
    pub signature: Signature,
    /// Tool name as first recorded (original casing)
    pub tool: String,
    pub learnability: Learnability,
    pub failure_count: u64,
    pub fix_count: u64,
    /// Command of the first failure seen for this signature
    pub sample_command: String,
    /// Error text of the first failure seen for this signature
    pub sample_error: String,
    /// Most frequent linked fix command; ties go to the most recent
    pub representative_fix: Option<String>,
    pub first_seen: String,
    pub last_seen: String,
}

impl Cluster {
    #[must_use]
    pub fn cause(&self) -> CauseCategory {
        self.signature.cause
    }

    /// `fix_count / failure_count`, clamped to `[0, 1]`; 0 with no failures.
    #[must_use]
    pub fn confidence(&self) -> f64 {
        if self.failure_count == 0 {
            return 0.0;
        }
        let ratio = self.fix_count as f64 / self.failure_count as f64;
        ratio.clamp(0.0, 1.0)
    }

    #[must_use]
    pub fn confidence_percent(&self) -> u8 {
        confidence_to_percent(self.confidence())
    }

    #[must_use]
    pub fn is_learnable(&self) -> bool {
        self.learnability == Learnability::Learnable
    }
}

#[derive(Default)]
struct FixTally {
    /// fix command -> (count, position of the latest occurrence)
    counts: HashMap<String, (u64, usize)>,
}

impl FixTally {
    fn record(&mut self, command: &str, position: usize) {
        let slot = self.counts.entry(command.to_string()).or_insert((0, 0));
        slot.0 += 1;
        slot.1 = position;
    }

    fn representative(&self) -> Option<String> {
        self.counts
            .iter()
            .max_by_key(|(_, (count, latest))| (*count, *latest))
            .map(|(command, _)| command.clone())
    }
}

/// Group failure records by signature.
///
/// Records are consumed in ledger order, so "first" and "most recent" refer
/// to ledger position. The result is rebuilt from scratch on every call.
#[must_use]
pub fn aggregate(records: &[FailureRecord]) -> BTreeMap<String, Cluster> {
    let mut clusters: BTreeMap<String, Cluster> = BTreeMap::new();
    let mut tallies: HashMap<String, FixTally> = HashMap::new();

    for (position, record) in records.iter().enumerate() {
        let failure = &record.failure;
        let classification = failure.classify();
        let key = classification.signature.key();

        let cluster = clusters.entry(key.clone()).or_insert_with(|| Cluster {
            signature: classification.signature.clone(),
            tool: failure.tool.clone(),
            learnability: classification.learnability,
            failure_count: 0,
            fix_count: 0,
            sample_command: failure.command().to_string(),
            sample_error: failure.error.clone(),
            representative_fix: None,
            first_seen: failure.timestamp.clone(),
            last_seen: failure.timestamp.clone(),
        });
        cluster.failure_count += 1;
        if !failure.timestamp.is_empty() {
            cluster.last_seen.clone_from(&failure.timestamp);
        }

        if let Some(fix) = &record.fix {
            cluster.fix_count += 1;
            if !fix.command.trim().is_empty() {
                tallies.entry(key).or_default().record(&fix.command, position);
            }
        }
    }

    for (key, tally) in tallies {
        if let Some(cluster) = clusters.get_mut(&key) {
            cluster.representative_fix = tally.representative();
        }
    }

    clusters
}
