//! Failure and fix capture from host tool events.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::Result;
use crate::event::{FailureContext, FailureEvent, FixEvent, LedgerEntry};
use crate::workspace::Workspace;

/// Substrings that mark a nominally successful response as a failure.
pub const ERROR_INDICATORS: &[&str] = &[
    "error:",
    "Error:",
    "ERROR:",
    "not recognized",
    "not found",
    "cannot find",
    "permission denied",
    "access denied",
    "failed",
    "Failed",
    "FAILED",
    "exception",
    "Exception",
    "command not found",
    "No such file or directory",
];

/// Whether response text contains a failure indicator.
#[must_use]
pub fn looks_like_failure(text: &str) -> bool {
    ERROR_INDICATORS
        .iter()
        .any(|indicator| text.contains(indicator))
}

/// Flatten a tool response to text. Strings are used as-is; anything else is
/// serialized as JSON.
#[must_use]
pub fn response_text(response: &Value) -> String {
    match response {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Command text in a tool input object.
#[must_use]
pub fn input_command(input: &Value) -> &str {
    input.get("command").and_then(Value::as_str).unwrap_or("")
}

/// Why an event was not recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureSkip {
    ToolNotGuarded,
    TrackingDisabled,
    NoCommand,
    /// The "success" response contained a failure indicator
    LooksLikeFailure,
    /// No failure of this session and tool is waiting for a fix
    NoAwaitingFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "capture", rename_all = "snake_case")]
pub enum CaptureOutcome {
    Recorded { id: String },
    Skipped { reason: CaptureSkip },
}

/// A failed tool call as reported by the host.
#[derive(Debug, Clone, Copy)]
pub struct FailedCall<'a> {
    pub tool: &'a str,
    pub input: &'a Value,
    pub error: &'a str,
    pub session_id: &'a str,
    pub working_dir: Option<&'a str>,
}

/// Append a failure to the ledger.
pub fn record_failure(ws: &Workspace, call: FailedCall<'_>, now: DateTime<Utc>) -> Result<CaptureOutcome> {
    if !ws.config.guards(call.tool) {
        return Ok(CaptureOutcome::Skipped {
            reason: CaptureSkip::ToolNotGuarded,
        });
    }
    let context = call
        .working_dir
        .filter(|dir| !dir.is_empty())
        .map(FailureContext::from_working_dir);
    let failure = FailureEvent::new(
        call.tool,
        call.input.clone(),
        call.error,
        call.session_id,
        context,
        ws.config.max_error_chars,
        now,
    );
    let id = failure.id.clone();
    ws.ledger().append(&LedgerEntry::Failure(failure))?;
    tracing::info!(id = %id, tool = call.tool, "Recorded failure");
    Ok(CaptureOutcome::Recorded { id })
}

/// The failure a success from `(session_id, tool)` would fix, if any.
///
/// That is the latest failure of the same session and tool, provided no fix
/// of that session and tool has been recorded since.
pub fn find_awaiting_failure(
    entries: impl IntoIterator<Item = LedgerEntry>,
    session_id: &str,
    tool: &str,
) -> Option<String> {
    let mut open: Option<String> = None;
    for entry in entries {
        if entry.session_id() != session_id || entry.tool() != tool {
            continue;
        }
        match entry {
            LedgerEntry::Failure(failure) if failure.awaiting_fix => open = Some(failure.id),
            LedgerEntry::Failure(_) | LedgerEntry::Fix(_) => open = None,
        }
    }
    open
}

/// A successful tool call as reported by the host.
#[derive(Debug, Clone, Copy)]
pub struct SucceededCall<'a> {
    pub tool: &'a str,
    pub input: &'a Value,
    pub response: &'a str,
    pub session_id: &'a str,
}

/// Record a success as the fix for the awaiting failure, if there is one.
pub fn record_success(
    ws: &Workspace,
    call: SucceededCall<'_>,
    now: DateTime<Utc>,
) -> Result<CaptureOutcome> {
    let skip = |reason| Ok(CaptureOutcome::Skipped { reason });
    if !ws.config.track_fixes {
        return skip(CaptureSkip::TrackingDisabled);
    }
    if !ws.config.guards(call.tool) {
        return skip(CaptureSkip::ToolNotGuarded);
    }
    if looks_like_failure(call.response) {
        return skip(CaptureSkip::LooksLikeFailure);
    }
    let command = input_command(call.input);
    if command.trim().is_empty() {
        return skip(CaptureSkip::NoCommand);
    }

    let ledger = ws.ledger();
    let Some(failure_id) = find_awaiting_failure(ledger.reader()?, call.session_id, call.tool)
    else {
        return skip(CaptureSkip::NoAwaitingFailure);
    };

    let fix = FixEvent::new(Some(failure_id.clone()), call.tool, command, call.session_id, now);
    let id = fix.id.clone();
    ledger.append(&LedgerEntry::Fix(fix))?;
    tracing::info!(id = %id, linked_error = %failure_id, "Recorded fix");
    Ok(CaptureOutcome::Recorded { id })
}
