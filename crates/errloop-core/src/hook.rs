//! Host hook triggers.
//!
//! The host runs `errloop hook <event>` with a JSON payload on stdin. Only a
//! pre-tool-use block produces a non-zero exit (2) and stderr text; every
//! other path, including every internal error, exits 0.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::Result;
use crate::capture::{self, CaptureOutcome, FailedCall, SucceededCall};
use crate::curate::{self, CurateOptions};
use crate::matcher::Verdict;
use crate::workspace::Workspace;

/// Lifecycle trigger the host fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    PreToolUse,
    PostToolUse,
    PostToolUseFailure,
    SessionEnd,
}

impl HookEvent {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PreToolUse => "pre-tool-use",
            Self::PostToolUse => "post-tool-use",
            Self::PostToolUseFailure => "post-tool-use-failure",
            Self::SessionEnd => "session-end",
        }
    }

    /// Accepts both the CLI spelling and the host's `hook_event_name`.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "pre-tool-use" | "PreToolUse" => Some(Self::PreToolUse),
            "post-tool-use" | "PostToolUse" => Some(Self::PostToolUse),
            "post-tool-use-failure" | "PostToolUseFailure" => Some(Self::PostToolUseFailure),
            "session-end" | "SessionEnd" => Some(Self::SessionEnd),
            _ => None,
        }
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host payload. Every field is optional; absent fields take defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HookPayload {
    pub session_id: Option<String>,
    pub hook_event_name: Option<String>,
    pub tool_name: Option<String>,
    pub tool_input: Value,
    pub tool_response: Value,
    /// Error text on failure events
    pub error: Option<String>,
    pub cwd: Option<String>,
    pub project_dir: Option<String>,
}

impl HookPayload {
    /// Parse stdin text. Blank input is an empty payload.
    pub fn parse(raw: &str) -> std::result::Result<Self, serde_json::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw)
    }

    /// Event the host says it fired, when the payload names a known one.
    #[must_use]
    pub fn declared_event(&self) -> Option<HookEvent> {
        self.hook_event_name.as_deref().and_then(HookEvent::parse)
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        self.session_id.as_deref().unwrap_or("unknown")
    }

    #[must_use]
    pub fn tool_name(&self) -> &str {
        self.tool_name.as_deref().unwrap_or("unknown")
    }

    #[must_use]
    pub fn command(&self) -> &str {
        capture::input_command(&self.tool_input)
    }

    fn working_dir(&self) -> Option<&str> {
        self.project_dir.as_deref().or(self.cwd.as_deref())
    }

    /// Error text for a failure event: the explicit `error` field, else the
    /// flattened tool response.
    #[must_use]
    pub fn error_text(&self) -> String {
        match self.error.as_deref() {
            Some(error) if !error.trim().is_empty() => error.to_string(),
            _ => capture::response_text(&self.tool_response),
        }
    }
}

/// What the hook process should do.
#[derive(Debug, Clone, PartialEq)]
pub struct HookOutcome {
    pub exit_code: i32,
    /// Text for stderr (block explanation only)
    pub stderr: Option<String>,
    pub verdict: Option<Verdict>,
}

impl HookOutcome {
    #[must_use]
    pub fn allow() -> Self {
        Self {
            exit_code: 0,
            stderr: None,
            verdict: None,
        }
    }
}

/// Handle one trigger, converting any error into a logged allow.
#[must_use]
pub fn dispatch(ws: &Workspace, event: HookEvent, raw: &str, now: DateTime<Utc>) -> HookOutcome {
    let payload = match HookPayload::parse(raw) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(event = %event, error = %e, "Unparsable hook payload, allowing");
            return HookOutcome::allow();
        }
    };
    if let Some(declared) = payload.declared_event().filter(|declared| *declared != event) {
        tracing::warn!(
            event = %event,
            declared = %declared,
            "Payload names a different hook event; handling it as the invoked one"
        );
    }
    match handle(ws, event, &payload, now) {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::warn!(event = %event, error = %e, "Hook failed, allowing");
            HookOutcome::allow()
        }
    }
}

/// Handle one parsed trigger.
pub fn handle(
    ws: &Workspace,
    event: HookEvent,
    payload: &HookPayload,
    now: DateTime<Utc>,
) -> Result<HookOutcome> {
    match event {
        HookEvent::PreToolUse => pre_tool_use(ws, payload),
        HookEvent::PostToolUseFailure => {
            let error = payload.error_text();
            let outcome = capture::record_failure(
                ws,
                FailedCall {
                    tool: payload.tool_name(),
                    input: &payload.tool_input,
                    error: &error,
                    session_id: payload.session_id(),
                    working_dir: payload.working_dir(),
                },
                now,
            )?;
            log_capture(event, &outcome);
            Ok(HookOutcome::allow())
        }
        HookEvent::PostToolUse => {
            let response = capture::response_text(&payload.tool_response);
            let outcome = capture::record_success(
                ws,
                SucceededCall {
                    tool: payload.tool_name(),
                    input: &payload.tool_input,
                    response: &response,
                    session_id: payload.session_id(),
                },
                now,
            )?;
            log_capture(event, &outcome);
            Ok(HookOutcome::allow())
        }
        HookEvent::SessionEnd => {
            if ws.config.auto_curate {
                let report = curate::run_curation(ws, &CurateOptions::default(), now)?;
                tracing::info!(
                    session = payload.session_id(),
                    created = report.summary.created.len(),
                    "Session-end curation"
                );
            }
            Ok(HookOutcome::allow())
        }
    }
}

fn log_capture(event: HookEvent, outcome: &CaptureOutcome) {
    match outcome {
        CaptureOutcome::Recorded { id } => tracing::debug!(event = %event, id = %id, "Captured"),
        CaptureOutcome::Skipped { reason } => {
            tracing::debug!(event = %event, ?reason, "Capture skipped");
        }
    }
}

fn pre_tool_use(ws: &Workspace, payload: &HookPayload) -> Result<HookOutcome> {
    let tool = payload.tool_name();
    if !ws.config.guards(tool) {
        return Ok(HookOutcome::allow());
    }

    let verdict = ws.engine()?.evaluate(tool, payload.command());
    let stderr = match &verdict {
        Verdict::Block(detail) => Some(detail.render(ws.config.show_confidence)),
        Verdict::FaultAllow(fault) => {
            tracing::warn!(pattern = %fault.pattern, reason = %fault.reason, "Rule unevaluable, allowing");
            None
        }
        Verdict::Allow(_) => None,
    };
    Ok(HookOutcome {
        exit_code: verdict.exit_code(),
        stderr,
        verdict: Some(verdict),
    })
}
