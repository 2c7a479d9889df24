//! Rule packs: built-ins, on-disk packs and the merged active ruleset.
//!
//! Enabled packs are merged in a fixed precedence order (built-in and other
//! named packs in config order, then `learned`, then `custom`). Later packs
//! override earlier ones rule-by-rule on id. A pack that cannot be loaded is
//! reported and contributes nothing; it never aborts the merge.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::error::PackError;
use crate::lock;
use crate::model::{DocFormat, MatchKind, MatchSpec, Rule, RulePack, RuleSource, parse_pack};

/// Pack that curation writes to.
pub const LEARNED_PACK: &str = "learned";
/// Pack reserved for user-authored rules; always merged last.
pub const CUSTOM_PACK: &str = "custom";
/// Packs compiled into the binary.
pub const BUILTIN_PACKS: [&str; 2] = ["common", "windows"];

/// Where a loaded pack came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum PackOrigin {
    File(PathBuf),
    Builtin,
}

/// A pack resolved by name and loaded.
#[derive(Debug, Clone)]
pub struct LoadedPack {
    pub name: String,
    pub origin: PackOrigin,
    pub pack: RulePack,
    pub skipped_entries: usize,
}

/// A pack that contributed no rules to the merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedPack {
    pub name: String,
    pub reason: String,
}

/// Per-pack summary of a merge.
#[derive(Debug, Clone, Serialize)]
pub struct PackSummary {
    pub name: String,
    pub origin: PackOrigin,
    pub rules: usize,
    pub skipped_entries: usize,
}

/// What a merge loaded and what it skipped.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MergeReport {
    pub loaded: Vec<PackSummary>,
    pub skipped: Vec<SkippedPack>,
    /// Rules replaced by a same-id rule from a later pack
    pub overridden: usize,
}

/// Materialized active ruleset, as written to `active.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveRuleset {
    pub version: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub generated_at: String,
    #[serde(default)]
    pub enabled_packs: Vec<String>,
    #[serde(default)]
    pub patterns: Vec<Rule>,
}

impl ActiveRuleset {
    #[must_use]
    pub fn new(enabled_packs: Vec<String>, patterns: Vec<Rule>, now: DateTime<Utc>) -> Self {
        Self {
            version: "1.0".to_string(),
            name: "active".to_string(),
            description: "Merged active patterns".to_string(),
            generated_at: crate::event::format_timestamp(now),
            enabled_packs,
            patterns,
        }
    }

    #[must_use]
    pub fn empty() -> Self {
        Self {
            version: "1.0".to_string(),
            name: "active".to_string(),
            description: String::new(),
            generated_at: String::new(),
            enabled_packs: Vec::new(),
            patterns: Vec::new(),
        }
    }
}

/// Enabled pack names in merge order.
///
/// Duplicate names keep their first position.
#[must_use]
pub fn precedence_order(enabled: &[String]) -> Vec<String> {
    let mut ordered: Vec<String> = Vec::with_capacity(enabled.len());
    for name in enabled {
        let name = name.trim();
        if name.is_empty()
            || name == LEARNED_PACK
            || name == CUSTOM_PACK
            || ordered.iter().any(|n| n == name)
        {
            continue;
        }
        ordered.push(name.to_string());
    }
    for tail in [LEARNED_PACK, CUSTOM_PACK] {
        if enabled.iter().any(|name| name.trim() == tail) {
            ordered.push(tail.to_string());
        }
    }
    ordered
}

/// Path of the on-disk file for pack `name`, if one exists.
#[must_use]
pub fn resolve_pack_file(packs_dir: &Path, name: &str) -> Option<PathBuf> {
    DocFormat::EXTENSIONS
        .iter()
        .map(|ext| packs_dir.join(format!("{name}.{ext}")))
        .find(|path| path.is_file())
}

fn default_source_for(name: &str) -> RuleSource {
    if name == LEARNED_PACK {
        RuleSource::Learned
    } else {
        RuleSource::Custom
    }
}

fn is_valid_pack_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Load pack `name`: an on-disk file wins over a built-in of the same name.
pub fn load_pack(packs_dir: &Path, name: &str) -> std::result::Result<LoadedPack, PackError> {
    if !is_valid_pack_name(name) {
        return Err(PackError::PackNotFound(format!("invalid pack name '{name}'")));
    }

    if let Some(path) = resolve_pack_file(packs_dir, name) {
        let format = DocFormat::from_path(&path)
            .ok_or_else(|| PackError::PackNotFound(path.display().to_string()))?;
        let content = std::fs::read_to_string(&path).map_err(|e| PackError::InvalidPack {
            name: name.to_string(),
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        let parsed = parse_pack(name, &content, format, default_source_for(name))?;
        return Ok(LoadedPack {
            name: name.to_string(),
            origin: PackOrigin::File(path),
            pack: parsed.pack,
            skipped_entries: parsed.skipped_entries,
        });
    }

    builtin_pack(name)
        .map(|pack| LoadedPack {
            name: name.to_string(),
            origin: PackOrigin::Builtin,
            pack,
            skipped_entries: 0,
        })
        .ok_or_else(|| PackError::PackNotFound(name.to_string()))
}

/// Load every enabled pack in precedence order, collecting failures.
#[must_use]
pub fn load_enabled(packs_dir: &Path, enabled: &[String]) -> (Vec<LoadedPack>, Vec<SkippedPack>) {
    let mut loaded = Vec::new();
    let mut skipped = Vec::new();
    for name in precedence_order(enabled) {
        match load_pack(packs_dir, &name) {
            Ok(pack) => loaded.push(pack),
            Err(e) => {
                // learned/custom are absent until first curated or written.
                let not_created = name == LEARNED_PACK || name == CUSTOM_PACK;
                if not_created && matches!(e, PackError::PackNotFound(_)) {
                    tracing::debug!(pack = %name, "Pack not created yet");
                } else {
                    tracing::warn!(pack = %name, error = %e, "Skipping pack");
                }
                skipped.push(SkippedPack {
                    name,
                    reason: e.to_string(),
                });
            }
        }
    }
    (loaded, skipped)
}

/// Merge packs by rule id (later packs win) and order for evaluation.
#[must_use]
pub fn merge_packs(packs: &[LoadedPack]) -> (Vec<Rule>, usize) {
    let mut merged: HashMap<String, Rule> = HashMap::new();
    let mut overridden = 0;

    for loaded in packs {
        for rule in &loaded.pack.patterns {
            if merged.insert(rule.id.clone(), rule.clone()).is_some() {
                overridden += 1;
                tracing::debug!(rule_id = %rule.id, pack = %loaded.name, "Rule overridden");
            }
        }
    }

    let mut rules: Vec<Rule> = merged.into_values().collect();
    sort_for_evaluation(&mut rules);
    (rules, overridden)
}

/// Exact rules first, then regex, then contains; by id within a kind.
pub fn sort_for_evaluation(rules: &mut [Rule]) {
    rules.sort_by(|a, b| {
        a.matcher
            .kind
            .rank()
            .cmp(&b.matcher.kind.rank())
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Build the active ruleset for `enabled` packs.
#[must_use]
pub fn build_active(
    packs_dir: &Path,
    enabled: &[String],
    now: DateTime<Utc>,
) -> (ActiveRuleset, MergeReport) {
    let (loaded, skipped) = load_enabled(packs_dir, enabled);
    let (patterns, overridden) = merge_packs(&loaded);
    let report = MergeReport {
        loaded: loaded
            .iter()
            .map(|pack| PackSummary {
                name: pack.name.clone(),
                origin: pack.origin.clone(),
                rules: pack.pack.patterns.len(),
                skipped_entries: pack.skipped_entries,
            })
            .collect(),
        skipped,
        overridden,
    };
    let active = ActiveRuleset::new(
        loaded.into_iter().map(|pack| pack.name).collect(),
        patterns,
        now,
    );
    (active, report)
}

fn to_pretty_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Atomically replace `active.json`.
pub fn write_active(path: &Path, active: &ActiveRuleset, timeout: Duration) -> Result<()> {
    let bytes = to_pretty_json(active)?;
    lock::rewrite_atomic(path, &bytes, "active-rebuild", timeout)?;
    tracing::info!(
        path = %path.display(),
        rules = active.patterns.len(),
        "Wrote active ruleset"
    );
    Ok(())
}

/// Read `active.json`. A missing file is an empty ruleset; malformed rule
/// entries are dropped.
pub fn load_active(path: &Path) -> Result<ActiveRuleset> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ActiveRuleset::empty()),
        Err(e) => return Err(e.into()),
    };
    let parsed = parse_pack("active", &content, DocFormat::Json, RuleSource::Custom)?;
    let header: serde_json::Value = serde_json::from_str(&content)?;
    let enabled_packs = header
        .get("enabled_packs")
        .and_then(|v| serde_json::from_value::<Vec<String>>(v.clone()).ok())
        .unwrap_or_default();
    let mut patterns = parsed.pack.patterns;
    sort_for_evaluation(&mut patterns);
    Ok(ActiveRuleset {
        version: parsed.pack.version,
        name: parsed.pack.name.unwrap_or_else(|| "active".to_string()),
        description: parsed.pack.description.unwrap_or_default(),
        generated_at: header
            .get("generated_at")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string(),
        enabled_packs,
        patterns,
    })
}

/// Load the learned pack for rewriting.
///
/// Unlike merge-time loading this is strict: a file that is unreadable or has
/// any dropped entries is an error, so curation never rewrites it lossily.
pub fn load_learned(packs_dir: &Path) -> Result<RulePack> {
    let path = learned_pack_path(packs_dir);
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(RulePack::new(
                LEARNED_PACK,
                "Rules promoted from repeated failures",
            ));
        }
        Err(e) => return Err(e.into()),
    };
    let parsed = parse_pack(LEARNED_PACK, &content, DocFormat::Json, RuleSource::Learned)?;
    if parsed.skipped_entries > 0 {
        return Err(PackError::InvalidPack {
            name: LEARNED_PACK.to_string(),
            reason: format!(
                "{} malformed entries; fix {} before curating",
                parsed.skipped_entries,
                path.display()
            ),
        }
        .into());
    }
    Ok(parsed.pack)
}

#[must_use]
pub fn learned_pack_path(packs_dir: &Path) -> PathBuf {
    packs_dir.join(format!("{LEARNED_PACK}.json"))
}

/// Serialize a pack to its canonical on-disk bytes.
pub fn pack_bytes(pack: &RulePack) -> Result<Vec<u8>> {
    to_pretty_json(pack)
}

/// Atomically write a pack file.
pub fn save_pack(path: &Path, pack: &RulePack, timeout: Duration) -> Result<()> {
    let bytes = pack_bytes(pack)?;
    lock::rewrite_atomic(path, &bytes, "pack-write", timeout).map_err(|e| {
        PackError::WriteFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        }
    })?;
    Ok(())
}

/// One row of `packs list`.
#[derive(Debug, Clone, Serialize)]
pub struct PackListing {
    pub name: String,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<PackOrigin>,
    pub rules: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Every known pack (built-ins, files in `packs_dir`, enabled names) with
/// its status. Enabled packs come first in precedence order.
#[must_use]
pub fn list_packs(packs_dir: &Path, enabled: &[String]) -> Vec<PackListing> {
    let mut names = precedence_order(enabled);
    let mut others: Vec<String> = BUILTIN_PACKS.iter().map(|n| (*n).to_string()).collect();
    if let Ok(entries) = std::fs::read_dir(packs_dir) {
        for entry in entries.filter_map(std::result::Result::ok) {
            let path = entry.path();
            if DocFormat::from_path(&path).is_none() {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                others.push(stem.to_string());
            }
        }
    }
    others.sort();
    others.dedup();
    let enabled_count = names.len();
    for name in others {
        if !names.contains(&name) {
            names.push(name);
        }
    }

    names
        .into_iter()
        .enumerate()
        .map(|(idx, name)| {
            let enabled = idx < enabled_count;
            match load_pack(packs_dir, &name) {
                Ok(loaded) => PackListing {
                    name,
                    enabled,
                    origin: Some(loaded.origin),
                    rules: loaded.pack.patterns.len(),
                    error: None,
                },
                Err(e) => PackListing {
                    name,
                    enabled,
                    origin: None,
                    rules: 0,
                    error: Some(e.to_string()),
                },
            }
        })
        .collect()
}

/// Compiled-in pack by name.
#[must_use]
pub fn builtin_pack(name: &str) -> Option<RulePack> {
    match name {
        "common" => Some(builtin_common_pack()),
        "windows" => Some(builtin_windows_pack()),
        _ => None,
    }
}

fn builtin_rule(
    id: &str,
    name: &str,
    category: &str,
    matcher: MatchSpec,
    message: &str,
    suggestion: &str,
) -> Rule {
    Rule {
        id: id.to_string(),
        name: name.to_string(),
        category: category.to_string(),
        tool: "Bash".to_string(),
        matcher,
        message: message.to_string(),
        suggestion: Some(suggestion.to_string()),
        confidence: None,
        source: Some(RuleSource::Builtin),
        signature: None,
        occurrences: None,
        fix_count: None,
        added: None,
    }
}

/// Shell commands that have a dedicated agent tool.
fn builtin_common_pack() -> RulePack {
    let mut pack = RulePack::new("common", "Prefer dedicated tools over shell equivalents");
    pack.patterns = vec![
        builtin_rule(
            "common.cat_command",
            "Cat Command",
            "tool_usage",
            MatchSpec::new(MatchKind::Regex, r"^cat\s+"),
            "BLOCKED: Use the Read tool instead of 'cat' for reading files.",
            "Use Read tool",
        ),
        builtin_rule(
            "common.grep_command",
            "Grep Command",
            "tool_usage",
            MatchSpec::new(MatchKind::Regex, r"^grep\s+"),
            "BLOCKED: Use the Grep tool instead of 'grep' command.",
            "Use Grep tool",
        ),
        builtin_rule(
            "common.find_command",
            "Find Command",
            "tool_usage",
            MatchSpec::new(MatchKind::Regex, r"^find\s+"),
            "BLOCKED: Use the Glob tool instead of 'find' command.",
            "Use Glob tool",
        ),
        builtin_rule(
            "common.echo_redirect",
            "Echo Redirect",
            "tool_usage",
            MatchSpec::new(MatchKind::Regex, r"^echo\s+.*>"),
            "BLOCKED: Use the Write tool instead of 'echo >' for creating files.",
            "Use Write tool",
        ),
    ];
    pack
}

/// POSIX shell habits that fail under PowerShell.
fn builtin_windows_pack() -> RulePack {
    let mut pack = RulePack::new("windows", "POSIX shell syntax that PowerShell rejects");
    pack.patterns = vec![
        builtin_rule(
            "windows.and_chaining",
            "And Chaining",
            "syntax_error",
            MatchSpec::new(MatchKind::Contains, "&&"),
            "BLOCKED: Use ';' or run commands separately on Windows. '&&' is bash syntax.",
            "cmd1; cmd2",
        ),
        builtin_rule(
            "windows.rm_command",
            "Rm Command",
            "syntax_error",
            MatchSpec::new(MatchKind::Regex, r"^rm\s+"),
            "BLOCKED: Use 'Remove-Item' instead of 'rm' on Windows.",
            "Remove-Item \"path\"",
        ),
        builtin_rule(
            "windows.del_command",
            "Del Command",
            "syntax_error",
            MatchSpec::new(MatchKind::Regex, r"^del\s+"),
            "BLOCKED: Use 'Remove-Item \"path\"' instead of 'del'.",
            "Remove-Item \"path\"",
        ),
        builtin_rule(
            "windows.ls_flags",
            "Ls Flags",
            "syntax_error",
            MatchSpec::new(MatchKind::Regex, r"^ls\s+-[a-zA-Z]"),
            "BLOCKED: Use 'Get-ChildItem' or 'dir' instead of 'ls -flags'.",
            "Get-ChildItem or dir",
        ),
        builtin_rule(
            "windows.touch_command",
            "Touch Command",
            "syntax_error",
            MatchSpec::new(MatchKind::Regex, r"^touch\s+"),
            "BLOCKED: Use 'New-Item' or Write tool instead of 'touch'.",
            "New-Item \"path\" -ItemType File",
        ),
        builtin_rule(
            "windows.mkdir_command",
            "Mkdir Command",
            "syntax_error",
            MatchSpec::new(MatchKind::Regex, r"^mkdir\s+(?!-p)"),
            "BLOCKED: Use 'New-Item -ItemType Directory -Force' or mkdir -p equivalent.",
            "New-Item -ItemType Directory -Force -Path \"path\"",
        ),
    ];
    pack
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    fn rule(id: &str, kind: MatchKind, pattern: &str, message: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "match": {"type": kind.as_str(), "pattern": pattern},
            "message": message
        })
    }

    fn write_pack(dir: &Path, name: &str, rules: &[serde_json::Value]) {
        let doc = serde_json::json!({"version": "1.0", "patterns": rules});
        std::fs::write(
            dir.join(format!("{name}.json")),
            serde_json::to_string_pretty(&doc).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn precedence_puts_learned_then_custom_last() {
        assert_eq!(
            precedence_order(&names(&["custom", "learned", "windows", "common", "windows"])),
            names(&["windows", "common", "learned", "custom"])
        );
        assert_eq!(precedence_order(&names(&["common"])), names(&["common"]));
    }

    #[test]
    fn builtin_packs_load_and_compile() {
        for name in BUILTIN_PACKS {
            let pack = builtin_pack(name).unwrap();
            assert!(!pack.patterns.is_empty());
            for rule in &pack.patterns {
                assert!(rule.id.starts_with(&format!("{name}.")), "{}", rule.id);
                rule.validate().unwrap();
                if rule.matcher.kind == MatchKind::Regex {
                    fancy_regex::Regex::new(&rule.matcher.pattern).unwrap();
                }
            }
        }
    }

    #[test]
    fn custom_overrides_learned_by_id() {
        let tmp = TempDir::new().unwrap();
        write_pack(
            tmp.path(),
            "learned",
            &[rule("shared.rule", MatchKind::Contains, "&&", "learned says")],
        );
        write_pack(
            tmp.path(),
            "custom",
            &[rule("shared.rule", MatchKind::Contains, "&&", "custom says")],
        );

        let (active, report) =
            build_active(tmp.path(), &names(&["custom", "learned"]), Utc::now());
        assert_eq!(active.patterns.len(), 1);
        assert_eq!(active.patterns[0].message, "custom says");
        assert_eq!(report.overridden, 1);
        assert_eq!(active.enabled_packs, names(&["learned", "custom"]));
    }

    #[test]
    fn file_pack_shadows_builtin_of_same_name() {
        let tmp = TempDir::new().unwrap();
        write_pack(
            tmp.path(),
            "common",
            &[rule("common.only", MatchKind::Exact, "x", "m")],
        );
        let loaded = load_pack(tmp.path(), "common").unwrap();
        assert!(matches!(loaded.origin, PackOrigin::File(_)));
        assert_eq!(loaded.pack.patterns.len(), 1);
    }

    #[test]
    fn broken_and_missing_packs_are_skipped() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("broken.json"), "{\"patterns\": [").unwrap();

        let (active, report) = build_active(
            tmp.path(),
            &names(&["common", "broken", "nowhere", "../etc"]),
            Utc::now(),
        );
        assert_eq!(report.skipped.len(), 3);
        assert_eq!(
            active.patterns.len(),
            builtin_pack("common").unwrap().patterns.len()
        );
    }

    #[test]
    fn active_is_ordered_exact_regex_contains() {
        let tmp = TempDir::new().unwrap();
        write_pack(
            tmp.path(),
            "custom",
            &[
                rule("c.b", MatchKind::Contains, "b", "m"),
                rule("c.a", MatchKind::Contains, "a", "m"),
                rule("r.z", MatchKind::Regex, "z", "m"),
                rule("e.y", MatchKind::Exact, "y", "m"),
            ],
        );
        let (active, _) = build_active(tmp.path(), &names(&["custom"]), Utc::now());
        let ids: Vec<&str> = active.patterns.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["e.y", "r.z", "c.a", "c.b"]);
    }

    #[test]
    fn active_round_trips_through_disk() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("active.json");
        assert!(load_active(&path).unwrap().patterns.is_empty());

        let (active, _) = build_active(tmp.path(), &names(&["windows"]), Utc::now());
        write_active(&path, &active, lock::DEFAULT_LOCK_TIMEOUT).unwrap();
        let loaded = load_active(&path).unwrap();
        assert_eq!(loaded.patterns, active.patterns);
        assert_eq!(loaded.enabled_packs, names(&["windows"]));
    }

    #[test]
    fn learned_pack_loads_strictly() {
        let tmp = TempDir::new().unwrap();
        let pack = load_learned(tmp.path()).unwrap();
        assert_eq!(pack.name.as_deref(), Some(LEARNED_PACK));
        assert!(pack.patterns.is_empty());

        write_pack(
            tmp.path(),
            "learned",
            &[
                rule("learned.ok", MatchKind::Exact, "x", "m"),
                serde_json::json!({"id": "learned.bad"}),
            ],
        );
        assert!(load_learned(tmp.path()).is_err());
    }

    #[test]
    fn listing_marks_enabled_packs() {
        let tmp = TempDir::new().unwrap();
        write_pack(tmp.path(), "team", &[rule("team.a", MatchKind::Exact, "a", "m")]);
        let listing = list_packs(tmp.path(), &names(&["windows", "custom"]));
        let by_name: HashMap<_, _> = listing.iter().map(|l| (l.name.as_str(), l)).collect();
        assert!(by_name["windows"].enabled);
        assert!(!by_name["common"].enabled);
        assert!(!by_name["team"].enabled);
        assert_eq!(by_name["team"].rules, 1);
        assert!(by_name["custom"].error.is_some());
    }
}
