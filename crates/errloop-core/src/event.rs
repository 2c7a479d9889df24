//! Ledger record types.
//!
//! Every line of the ledger is one JSON object: either a failure
//! (`"type": "error"`) or a fix (`"type": "fix"`).

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::signature::{self, Classification};

/// Default cap on stored error text, in characters.
pub const DEFAULT_MAX_ERROR_CHARS: usize = 2000;

/// Working-directory context captured with a failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailureContext {
    pub working_dir: String,
    pub project: String,
}

impl FailureContext {
    #[must_use]
    pub fn from_working_dir(working_dir: &str) -> Self {
        let project = std::path::Path::new(working_dir)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("unknown")
            .to_string();
        Self {
            working_dir: working_dir.to_string(),
            project,
        }
    }
}

/// A failed tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEvent {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default = "unknown")]
    pub session_id: String,
    #[serde(default = "unknown")]
    pub tool: String,
    /// Raw tool input as sent by the host; `command` is the field we read.
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub error: String,
    #[serde(default = "default_true")]
    pub awaiting_fix: bool,
    /// Cause category computed at capture time (informational only; curation
    /// always re-classifies).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<FailureContext>,
}

impl FailureEvent {
    /// Build a new failure record stamped with `now`.
    #[must_use]
    pub fn new(
        tool: &str,
        input: serde_json::Value,
        error: &str,
        session_id: &str,
        context: Option<FailureContext>,
        max_error_chars: usize,
        now: DateTime<Utc>,
    ) -> Self {
        let error = truncate_chars(error, max_error_chars);
        let category = signature::classify_cause(&error).as_str().to_string();
        Self {
            id: generate_event_id("err", now),
            timestamp: format_timestamp(now),
            session_id: session_id.to_string(),
            tool: tool.to_string(),
            input,
            error,
            awaiting_fix: true,
            category: Some(category),
            context,
        }
    }

    /// The command text from the tool input, or `""`.
    #[must_use]
    pub fn command(&self) -> &str {
        self.input
            .get("command")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("")
    }

    /// Signature classification of this failure.
    #[must_use]
    pub fn classify(&self) -> Classification {
        signature::extract(&self.tool, self.command(), &self.error)
    }
}

/// A successful command linked (or linkable) to an earlier failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixEvent {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub linked_error: Option<String>,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default = "unknown")]
    pub session_id: String,
    #[serde(default = "unknown")]
    pub tool: String,
    #[serde(default)]
    pub command: String,
}

impl FixEvent {
    #[must_use]
    pub fn new(
        linked_error: Option<String>,
        tool: &str,
        command: &str,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: generate_event_id("fix", now),
            linked_error,
            timestamp: format_timestamp(now),
            session_id: session_id.to_string(),
            tool: tool.to_string(),
            command: command.to_string(),
        }
    }
}

/// One ledger line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LedgerEntry {
    #[serde(rename = "error")]
    Failure(FailureEvent),
    #[serde(rename = "fix")]
    Fix(FixEvent),
}

impl LedgerEntry {
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Failure(failure) => &failure.id,
            Self::Fix(fix) => &fix.id,
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        match self {
            Self::Failure(failure) => &failure.session_id,
            Self::Fix(fix) => &fix.session_id,
        }
    }

    #[must_use]
    pub fn tool(&self) -> &str {
        match self {
            Self::Failure(failure) => &failure.tool,
            Self::Fix(fix) => &fix.tool,
        }
    }

    #[must_use]
    pub fn as_failure(&self) -> Option<&FailureEvent> {
        match self {
            Self::Failure(failure) => Some(failure),
            Self::Fix(_) => None,
        }
    }

    #[must_use]
    pub fn as_fix(&self) -> Option<&FixEvent> {
        match self {
            Self::Fix(fix) => Some(fix),
            Self::Failure(_) => None,
        }
    }
}

fn unknown() -> String {
    "unknown".to_string()
}

fn default_true() -> bool {
    true
}

/// `err_20260101_120000_123_9f3a01bc` style ids: timestamp to the
/// millisecond plus 32 random bits so two processes in the same millisecond
/// differ.
#[must_use]
pub fn generate_event_id(prefix: &str, now: DateTime<Utc>) -> String {
    let suffix: u32 = rand::random();
    format!(
        "{prefix}_{}_{:03}_{suffix:08x}",
        now.format("%Y%m%d_%H%M%S"),
        now.timestamp_subsec_millis()
    )
}

#[must_use]
pub fn format_timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Truncate to at most `max_chars` characters on a char boundary.
#[must_use]
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap()
    }

    #[test]
    fn failure_serializes_with_error_tag() {
        let failure = FailureEvent::new(
            "Bash",
            serde_json::json!({"command": "ls -z"}),
            "ls: invalid option -- 'z'",
            "sess-1",
            None,
            DEFAULT_MAX_ERROR_CHARS,
            fixed_now(),
        );
        let line = serde_json::to_string(&LedgerEntry::Failure(failure.clone())).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["awaiting_fix"], true);
        assert_eq!(value["category"], "bad_flag");
        assert_eq!(value["input"]["command"], "ls -z");
        assert!(failure.id.starts_with("err_20260314_092653_000_"));
        assert_eq!(failure.timestamp, "2026-03-14T09:26:53.000Z");
    }

    #[test]
    fn fix_serializes_with_fix_tag() {
        let fix = FixEvent::new(Some("err_1".into()), "Bash", "ls -l", "sess-1", fixed_now());
        let value = serde_json::to_value(LedgerEntry::Fix(fix)).unwrap();
        assert_eq!(value["type"], "fix");
        assert_eq!(value["linked_error"], "err_1");
        assert_eq!(value["command"], "ls -l");
    }

    #[test]
    fn error_text_is_capped_on_char_boundary() {
        let long = "é".repeat(10);
        assert_eq!(truncate_chars(&long, 3), "ééé");
        assert_eq!(truncate_chars("abc", 10), "abc");

        let failure = FailureEvent::new(
            "Bash",
            serde_json::json!({"command": "x"}),
            &"e".repeat(5000),
            "s",
            None,
            DEFAULT_MAX_ERROR_CHARS,
            fixed_now(),
        );
        assert_eq!(failure.error.chars().count(), DEFAULT_MAX_ERROR_CHARS);
    }

    #[test]
    fn command_is_read_from_input() {
        let mut failure = FailureEvent::new(
            "Bash",
            serde_json::json!({"command": "make", "description": "build"}),
            "boom",
            "s",
            None,
            10,
            fixed_now(),
        );
        assert_eq!(failure.command(), "make");
        failure.input = serde_json::Value::Null;
        assert_eq!(failure.command(), "");
    }

    #[test]
    fn context_derives_project_name() {
        let ctx = FailureContext::from_working_dir("/home/dev/projects/widget");
        assert_eq!(ctx.project, "widget");
    }
}
