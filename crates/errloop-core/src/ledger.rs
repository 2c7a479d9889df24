//! Append-only failure/fix ledger.
//!
//! The ledger is a JSONL file. Writers only ever append whole lines under an
//! exclusive lock; readers re-read from the start on every pass. Malformed
//! lines are skipped and counted, never fatal.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use crate::Result;
use crate::error::LedgerError;
use crate::event::{FailureEvent, FixEvent, LedgerEntry};
use crate::lock::{self, StoreLock};

/// Handle on the ledger file.
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
    lock_timeout: Duration,
}

impl Ledger {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_timeout: lock::DEFAULT_LOCK_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry as a single line.
    pub fn append(&self, entry: &LedgerEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.append_error(&e))?;
        }
        let _guard = StoreLock::acquire(
            &lock::lock_path_for(&self.path),
            "ledger-append",
            self.lock_timeout,
        )?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.append_error(&e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| self.append_error(&e))?;

        tracing::debug!(
            path = %self.path.display(),
            id = entry.id(),
            "Appended ledger entry"
        );
        Ok(())
    }

    fn append_error(&self, e: &io::Error) -> LedgerError {
        LedgerError::AppendFailed {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        }
    }

    /// Lazy reader over the ledger. A missing file reads as empty.
    pub fn reader(&self) -> Result<LedgerReader<BufReader<File>>> {
        match File::open(&self.path) {
            Ok(file) => Ok(LedgerReader::new(BufReader::new(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(LedgerReader::empty()),
            Err(e) => Err(LedgerError::ReadFailed {
                path: self.path.display().to_string(),
                reason: e.to_string(),
            }
            .into()),
        }
    }

    /// Read the whole ledger into memory.
    pub fn snapshot(&self) -> Result<LedgerSnapshot> {
        let mut reader = self.reader()?;
        let entries: Vec<LedgerEntry> = reader.by_ref().collect();
        let skipped = reader.skipped();
        if skipped > 0 {
            tracing::warn!(
                path = %self.path.display(),
                skipped,
                "Skipped malformed ledger lines"
            );
        }
        Ok(LedgerSnapshot { entries, skipped })
    }
}

/// Entries read from the ledger plus the count of skipped lines.
#[derive(Debug, Clone, Default)]
pub struct LedgerSnapshot {
    pub entries: Vec<LedgerEntry>,
    pub skipped: usize,
}

/// Iterator over ledger entries that skips malformed lines.
pub struct LedgerReader<R> {
    lines: Option<io::Lines<R>>,
    line_no: usize,
    skipped: usize,
}

impl<R: BufRead> LedgerReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: Some(reader.lines()),
            line_no: 0,
            skipped: 0,
        }
    }

    /// Number of lines skipped so far.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl LedgerReader<BufReader<File>> {
    fn empty() -> Self {
        Self {
            lines: None,
            line_no: 0,
            skipped: 0,
        }
    }
}

impl<R: BufRead> Iterator for LedgerReader<R> {
    type Item = LedgerEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let lines = self.lines.as_mut()?;
        loop {
            let line = match lines.next()? {
                Ok(line) => line,
                Err(e) => {
                    // Invalid UTF-8 or a read error mid-file: count and move on.
                    self.line_no += 1;
                    self.skipped += 1;
                    tracing::debug!(line = self.line_no, error = %e, "Unreadable ledger line");
                    continue;
                }
            };
            self.line_no += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match parse_line(trimmed) {
                Ok(mut entry) => {
                    if entry.id().is_empty() {
                        assign_line_id(&mut entry, self.line_no);
                    }
                    return Some(entry);
                }
                Err(e) => {
                    self.skipped += 1;
                    tracing::debug!(line = self.line_no, error = %e, "Skipping ledger line");
                }
            }
        }
    }
}

fn assign_line_id(entry: &mut LedgerEntry, line_no: usize) {
    match entry {
        LedgerEntry::Failure(failure) => failure.id = format!("line_{line_no}"),
        LedgerEntry::Fix(fix) => fix.id = format!("line_{line_no}"),
    }
}

/// Parse one ledger line.
///
/// Lines without a `type` but with an `error` field are failures written by
/// the earliest capture format.
pub fn parse_line(line: &str) -> std::result::Result<LedgerEntry, LedgerError> {
    let mut value: serde_json::Value =
        serde_json::from_str(line).map_err(|e| LedgerError::MalformedLine(e.to_string()))?;
    let obj = value
        .as_object_mut()
        .ok_or_else(|| LedgerError::MalformedLine("not a JSON object".to_string()))?;
    if !obj.contains_key("type") && obj.contains_key("error") {
        obj.insert("type".to_string(), serde_json::Value::from("error"));
    }
    serde_json::from_value(value).map_err(|e| LedgerError::MalformedLine(e.to_string()))
}

/// How a fix came to be linked to its failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    /// The fix named the failure in `linked_error`
    Explicit,
    /// Linked by temporal adjacency (same session and tool)
    Adjacent,
}

/// A failure and its linked fix, if any.
#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub failure: FailureEvent,
    pub fix: Option<FixEvent>,
    pub link: Option<LinkKind>,
}

/// Failures keyed by id, in ledger order.
#[derive(Debug, Clone, Default)]
pub struct LinkedLedger {
    records: Vec<FailureRecord>,
    index: HashMap<String, usize>,
    /// Fix entries that could not be linked to any failure
    pub orphan_fixes: usize,
    /// Failure entries dropped because their id repeated an earlier one
    pub duplicate_failures: usize,
}

impl LinkedLedger {
    #[must_use]
    pub fn records(&self) -> &[FailureRecord] {
        &self.records
    }

    #[must_use]
    pub fn get(&self, failure_id: &str) -> Option<&FailureRecord> {
        self.index.get(failure_id).map(|&idx| &self.records[idx])
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Failures with no linked fix.
    pub fn awaiting(&self) -> impl Iterator<Item = &FailureRecord> {
        self.records.iter().filter(|record| record.fix.is_none())
    }

    pub fn count_links(&self, kind: LinkKind) -> usize {
        self.records
            .iter()
            .filter(|record| record.link == Some(kind))
            .count()
    }
}

/// Rebuild failure → fix links from ledger entries.
///
/// Explicit `linked_error` references win. Remaining failures are linked by
/// [`link_by_adjacency`] using only fixes no explicit link claimed.
#[must_use]
pub fn reconstruct(entries: &[LedgerEntry]) -> LinkedLedger {
    let mut failure_at: HashMap<&str, usize> = HashMap::new();
    let mut duplicate_failures = 0;
    let mut duplicate_positions: HashSet<usize> = HashSet::new();
    for (pos, entry) in entries.iter().enumerate() {
        if let LedgerEntry::Failure(failure) = entry {
            if failure_at.contains_key(failure.id.as_str()) {
                duplicate_failures += 1;
                duplicate_positions.insert(pos);
            } else {
                failure_at.insert(failure.id.as_str(), pos);
            }
        }
    }

    // failure position -> (fix position, kind)
    let mut links: HashMap<usize, (usize, LinkKind)> = HashMap::new();
    let mut claimed_fixes: HashSet<usize> = HashSet::new();

    for (pos, entry) in entries.iter().enumerate() {
        let LedgerEntry::Fix(fix) = entry else {
            continue;
        };
        let Some(target) = fix.linked_error.as_deref() else {
            continue;
        };
        if let Some(&failure_pos) = failure_at.get(target) {
            if failure_pos < pos && !links.contains_key(&failure_pos) {
                links.insert(failure_pos, (pos, LinkKind::Explicit));
                claimed_fixes.insert(pos);
            }
        }
    }

    let linked_failures: HashSet<usize> = links
        .keys()
        .copied()
        .chain(duplicate_positions.iter().copied())
        .collect();
    for (failure_pos, fix_pos) in link_by_adjacency(entries, &claimed_fixes, &linked_failures) {
        links.insert(failure_pos, (fix_pos, LinkKind::Adjacent));
        claimed_fixes.insert(fix_pos);
    }

    let total_fixes = entries
        .iter()
        .filter(|entry| matches!(entry, LedgerEntry::Fix(_)))
        .count();

    let mut linked = LinkedLedger {
        orphan_fixes: total_fixes - claimed_fixes.len(),
        duplicate_failures,
        ..LinkedLedger::default()
    };
    for (pos, entry) in entries.iter().enumerate() {
        let LedgerEntry::Failure(failure) = entry else {
            continue;
        };
        if duplicate_positions.contains(&pos) {
            continue;
        }
        let (fix, link) = match links.get(&pos) {
            Some(&(fix_pos, kind)) => (entries[fix_pos].as_fix().cloned(), Some(kind)),
            None => (None, None),
        };
        linked
            .index
            .insert(failure.id.clone(), linked.records.len());
        linked.records.push(FailureRecord {
            failure: failure.clone(),
            fix,
            link,
        });
    }
    linked
}

/// Temporal-adjacency fix linking.
///
/// For each failure, the link is the first later fix with the same session
/// and tool, provided no other failure of that session and tool comes in
/// between. Fixes in `claimed_fixes` are ignored (but still count as the
/// success that closes the window), and failures in `linked_failures` never
/// open a window.
///
/// Returns `(failure position, fix position)` pairs.
///
/// This can mis-link an unrelated success when the agent runs other commands
/// between the failure and its real fix; it is kept deliberately simple.
#[must_use]
pub fn link_by_adjacency(
    entries: &[LedgerEntry],
    claimed_fixes: &HashSet<usize>,
    linked_failures: &HashSet<usize>,
) -> Vec<(usize, usize)> {
    let mut open: HashMap<(&str, &str), usize> = HashMap::new();
    let mut pairs = Vec::new();

    for (pos, entry) in entries.iter().enumerate() {
        let key = (entry.session_id(), entry.tool());
        match entry {
            LedgerEntry::Failure(_) => {
                if linked_failures.contains(&pos) {
                    open.remove(&key);
                } else {
                    open.insert(key, pos);
                }
            }
            LedgerEntry::Fix(_) => {
                if claimed_fixes.contains(&pos) {
                    open.remove(&key);
                } else if let Some(failure_pos) = open.remove(&key) {
                    pairs.push((failure_pos, pos));
                }
            }
        }
    }

    pairs
}

/// Summary counts over a ledger.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LedgerStats {
    pub failures: usize,
    pub fixes: usize,
    pub skipped_lines: usize,
    pub linked_explicit: usize,
    pub linked_adjacent: usize,
    pub awaiting_fix: usize,
    pub orphan_fixes: usize,
}

impl LedgerStats {
    #[must_use]
    pub fn compute(snapshot: &LedgerSnapshot, linked: &LinkedLedger) -> Self {
        Self {
            failures: linked.len(),
            fixes: snapshot
                .entries
                .iter()
                .filter(|entry| entry.as_fix().is_some())
                .count(),
            skipped_lines: snapshot.skipped,
            linked_explicit: linked.count_links(LinkKind::Explicit),
            linked_adjacent: linked.count_links(LinkKind::Adjacent),
            awaiting_fix: linked.awaiting().count(),
            orphan_fixes: linked.orphan_fixes,
        }
    }
}
