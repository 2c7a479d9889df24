//! Rule, pack and allowlist schemas.
//!
//! Pack files are parsed leniently: the file as a whole must be a readable
//! document, but individual entries that fail to deserialize or validate are
//! dropped and counted instead of failing the pack.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PackError;

/// How a rule's pattern is compared against a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    Regex,
    #[default]
    Contains,
}

impl MatchKind {
    /// Evaluation rank in the active ruleset: exact, then regex, then contains.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Exact => 0,
            Self::Regex => 1,
            Self::Contains => 2,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Regex => "regex",
            Self::Contains => "contains",
        }
    }
}

/// Match specification of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSpec {
    #[serde(rename = "type", default)]
    pub kind: MatchKind,
    pub pattern: String,
}

impl MatchSpec {
    #[must_use]
    pub fn new(kind: MatchKind, pattern: impl Into<String>) -> Self {
        Self {
            kind,
            pattern: pattern.into(),
        }
    }
}

/// Where a rule came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSource {
    Builtin,
    Learned,
    Custom,
}

impl RuleSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Builtin => "builtin",
            Self::Learned => "learned",
            Self::Custom => "custom",
        }
    }
}

fn default_tool() -> String {
    "Bash".to_string()
}

/// A prevention rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Stable identifier, unique within the active ruleset
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub category: String,
    /// Tool the rule guards (compared case-insensitively)
    #[serde(default = "default_tool")]
    pub tool: String,
    #[serde(rename = "match")]
    pub matcher: MatchSpec,
    #[serde(default)]
    pub message: String,
    #[serde(
        default,
        alias = "learned_fix",
        skip_serializing_if = "Option::is_none"
    )]
    pub suggestion: Option<String>,
    /// Fraction of observed failures that were followed by a fix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<RuleSource>,
    /// Signature key a learned rule was synthesized from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occurrences: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_count: Option<u64>,
    /// Date (YYYY-MM-DD) a learned rule was first written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added: Option<String>,
}

impl Rule {
    /// Whether this rule guards `tool`.
    #[must_use]
    pub fn applies_to(&self, tool: &str) -> bool {
        self.tool.eq_ignore_ascii_case(tool)
    }

    /// Confidence as an integer percentage, if the rule carries one.
    #[must_use]
    pub fn confidence_percent(&self) -> Option<u8> {
        self.confidence.map(confidence_to_percent)
    }

    pub(crate) fn validate(&self) -> Result<(), PackError> {
        if self.id.trim().is_empty() {
            return Err(PackError::InvalidRule("rule id cannot be empty".to_string()));
        }
        if self.matcher.pattern.is_empty() {
            return Err(PackError::InvalidRule(format!(
                "rule '{}' has an empty pattern",
                self.id
            )));
        }
        if let Some(confidence) = self.confidence {
            if !(0.0..=1.0).contains(&confidence) {
                return Err(PackError::InvalidRule(format!(
                    "rule '{}' confidence {confidence} is outside [0, 1]",
                    self.id
                )));
            }
        }
        Ok(())
    }
}

/// Round a ratio in `[0, 1]` to a whole percentage.
#[must_use]
pub fn confidence_to_percent(confidence: f64) -> u8 {
    let clamped = confidence.clamp(0.0, 1.0);
    (clamped * 100.0).round() as u8
}

fn default_version() -> String {
    "1.0".to_string()
}

/// A named, independently toggleable set of rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RulePack {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub patterns: Vec<Rule>,
}

impl RulePack {
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            version: default_version(),
            name: Some(name.into()),
            description: Some(description.into()),
            patterns: Vec::new(),
        }
    }

    #[must_use]
    pub fn find(&self, id: &str) -> Option<&Rule> {
        self.patterns.iter().find(|rule| rule.id == id)
    }

    #[must_use]
    pub fn find_by_signature(&self, signature: &str) -> Option<&Rule> {
        self.patterns
            .iter()
            .find(|rule| rule.signature.as_deref() == Some(signature))
    }
}

/// Document formats a pack or allowlist file may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocFormat {
    Json,
    Yaml,
    Toml,
}

impl DocFormat {
    /// File extensions tried, in order, when resolving a pack name.
    pub const EXTENSIONS: [&'static str; 4] = ["json", "yaml", "yml", "toml"];

    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "json" => Some(Self::Json),
            "yaml" | "yml" => Some(Self::Yaml),
            "toml" => Some(Self::Toml),
            _ => None,
        }
    }

    fn parse_value(self, content: &str) -> Result<Value, String> {
        match self {
            Self::Json => serde_json::from_str(content).map_err(|e| format!("invalid JSON: {e}")),
            Self::Yaml => serde_yaml::from_str(content).map_err(|e| format!("invalid YAML: {e}")),
            Self::Toml => toml::from_str(content).map_err(|e| format!("invalid TOML: {e}")),
        }
    }
}

/// A pack plus the number of entries dropped while parsing it.
#[derive(Debug, Clone)]
pub struct ParsedPack {
    pub pack: RulePack,
    pub skipped_entries: usize,
}

/// Parse pack text leniently.
///
/// `default_source` is stamped on rules that do not name their own source.
pub fn parse_pack(
    name: &str,
    content: &str,
    format: DocFormat,
    default_source: RuleSource,
) -> Result<ParsedPack, PackError> {
    let invalid = |reason: String| PackError::InvalidPack {
        name: name.to_string(),
        reason,
    };
    let value = format.parse_value(content).map_err(invalid)?;
    let Value::Object(mut doc) = value else {
        return Err(invalid("pack document must be an object".to_string()));
    };

    let entries = match doc.remove("patterns") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(entries)) => entries,
        Some(_) => return Err(invalid("`patterns` must be a list".to_string())),
    };

    let string_field = |key: &str| doc.get(key).and_then(Value::as_str).map(str::to_string);
    let mut pack = RulePack {
        version: string_field("version")
            .or_else(|| doc.get("version").and_then(Value::as_f64).map(|v| v.to_string()))
            .unwrap_or_else(default_version),
        name: string_field("name"),
        description: string_field("description"),
        patterns: Vec::with_capacity(entries.len()),
    };

    let mut skipped_entries = 0;
    for (idx, entry) in entries.into_iter().enumerate() {
        let rule = serde_json::from_value::<Rule>(entry)
            .map_err(|e| PackError::InvalidRule(e.to_string()))
            .and_then(|rule| rule.validate().map(|()| rule));
        match rule {
            Ok(mut rule) if pack.find(&rule.id).is_none() => {
                rule.source.get_or_insert(default_source);
                pack.patterns.push(rule);
            }
            Ok(rule) => {
                skipped_entries += 1;
                tracing::warn!(pack = name, rule_id = %rule.id, "Skipping duplicate rule id");
            }
            Err(e) => {
                skipped_entries += 1;
                tracing::warn!(pack = name, entry = idx, error = %e, "Skipping invalid rule entry");
            }
        }
    }

    Ok(ParsedPack {
        pack,
        skipped_entries,
    })
}

/// How an allowlist entry is compared against a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowKind {
    Exact,
    Prefix,
    Contains,
    Regex,
}

/// One allowlist override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowEntry {
    #[serde(rename = "type")]
    pub kind: AllowKind,
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl AllowEntry {
    #[must_use]
    pub fn new(kind: AllowKind, pattern: impl Into<String>) -> Self {
        Self {
            kind,
            pattern: pattern.into(),
            note: None,
        }
    }
}

/// Allowlist file contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allowlist {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub patterns: Vec<AllowEntry>,
}

impl Default for Allowlist {
    fn default() -> Self {
        Self {
            version: default_version(),
            patterns: Vec::new(),
        }
    }
}

impl Allowlist {
    /// Parse allowlist text, dropping entries that do not deserialize.
    pub fn parse(content: &str, format: DocFormat) -> Result<(Self, usize), PackError> {
        let invalid = |reason: String| PackError::InvalidPack {
            name: "allowlist".to_string(),
            reason,
        };
        let mut doc = format.parse_value(content).map_err(invalid)?;
        let entries = match doc.get_mut("patterns").map(Value::take) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(entries)) => entries,
            Some(_) => return Err(invalid("`patterns` must be a list".to_string())),
        };

        let mut allowlist = Self::default();
        if let Some(version) = doc.get("version").and_then(Value::as_str) {
            allowlist.version = version.to_string();
        }
        let mut skipped = 0;
        for entry in entries {
            match serde_json::from_value::<AllowEntry>(entry) {
                Ok(entry) if !entry.pattern.is_empty() => allowlist.patterns.push(entry),
                Ok(_) => skipped += 1,
                Err(e) => {
                    skipped += 1;
                    tracing::warn!(error = %e, "Skipping invalid allowlist entry");
                }
            }
        }
        Ok((allowlist, skipped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PACK: &str = r#"{
        "version": "1.0",
        "name": "custom",
        "patterns": [
            {"id": "custom.no_sudo", "name": "No sudo", "category": "policy",
             "match": {"type": "regex", "pattern": "^sudo\\s"},
             "message": "BLOCKED: no sudo", "learned_fix": "run without sudo"},
            {"id": "", "match": {"type": "contains", "pattern": "x"}},
            {"id": "custom.no_match"},
            {"id": "custom.no_sudo", "match": {"type": "exact", "pattern": "sudo"}}
        ]
    }"#;

    #[test]
    fn lenient_parse_keeps_valid_entries() {
        let parsed = parse_pack("custom", PACK, DocFormat::Json, RuleSource::Custom).unwrap();
        assert_eq!(parsed.pack.patterns.len(), 1);
        assert_eq!(parsed.skipped_entries, 3);

        let rule = &parsed.pack.patterns[0];
        assert_eq!(rule.tool, "Bash");
        assert_eq!(rule.matcher.kind, MatchKind::Regex);
        assert_eq!(rule.suggestion.as_deref(), Some("run without sudo"));
        assert_eq!(rule.source, Some(RuleSource::Custom));
    }

    #[test]
    fn unreadable_document_is_an_error() {
        let err = parse_pack("broken", "{ not json", DocFormat::Json, RuleSource::Custom)
            .unwrap_err();
        assert!(matches!(err, PackError::InvalidPack { .. }));

        let err = parse_pack("list", "[]", DocFormat::Json, RuleSource::Custom).unwrap_err();
        assert!(matches!(err, PackError::InvalidPack { .. }));
    }

    #[test]
    fn yaml_and_toml_packs_parse() {
        let yaml = r"
version: '1.0'
patterns:
  - id: team.no_force_push
    match: { type: contains, pattern: 'push --force' }
    message: use --force-with-lease
";
        let parsed = parse_pack("team", yaml, DocFormat::Yaml, RuleSource::Custom).unwrap();
        assert_eq!(parsed.pack.patterns[0].matcher.pattern, "push --force");

        let toml = r#"
version = "1.0"
[[patterns]]
id = "team.no_rmrf"
message = "careful"
[patterns.match]
type = "exact"
pattern = "rm -rf /"
"#;
        let parsed = parse_pack("team", toml, DocFormat::Toml, RuleSource::Custom).unwrap();
        assert_eq!(parsed.pack.patterns[0].matcher.kind, MatchKind::Exact);
    }

    #[test]
    fn optional_fields_are_not_serialized() {
        let rule = Rule {
            id: "common.x".into(),
            name: "X".into(),
            category: "tool_usage".into(),
            tool: "Bash".into(),
            matcher: MatchSpec::new(MatchKind::Contains, "x"),
            message: "m".into(),
            suggestion: None,
            confidence: None,
            source: None,
            signature: None,
            occurrences: None,
            fix_count: None,
            added: None,
        };
        let value = serde_json::to_value(&rule).unwrap();
        let obj = value.as_object().unwrap();
        assert!(!obj.contains_key("suggestion"));
        assert!(!obj.contains_key("confidence"));
        assert_eq!(value["match"]["type"], "contains");
    }

    #[test]
    fn allowlist_drops_bad_entries() {
        let text = r#"{"version":"1.0","patterns":[
            {"type":"prefix","pattern":"ls "},
            {"type":"glob","pattern":"*"},
            {"type":"exact","pattern":""}
        ]}"#;
        let (allowlist, skipped) = Allowlist::parse(text, DocFormat::Json).unwrap();
        assert_eq!(allowlist.patterns, vec![AllowEntry::new(AllowKind::Prefix, "ls ")]);
        assert_eq!(skipped, 2);
    }

    #[test]
    fn confidence_percent_rounds_and_clamps() {
        assert_eq!(confidence_to_percent(2.0 / 3.0), 67);
        assert_eq!(confidence_to_percent(1.5), 100);
        assert_eq!(confidence_to_percent(-1.0), 0);
    }

    #[test]
    fn ranks_order_exact_regex_contains() {
        assert!(MatchKind::Exact.rank() < MatchKind::Regex.rank());
        assert!(MatchKind::Regex.rank() < MatchKind::Contains.rank());
    }
}
