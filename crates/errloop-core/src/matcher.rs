//! Match engine: evaluate a candidate command against the allowlist and the
//! active ruleset.
//!
//! Patterns are compiled once when the engine is built. A pattern that cannot
//! be compiled (or that errors while matching) is an engine fault: it never
//! blocks, and if no other rule matched the verdict is [`Verdict::FaultAllow`].

use fancy_regex::{Regex, RegexBuilder};
use serde::Serialize;

use crate::model::{AllowEntry, AllowKind, Allowlist, MatchKind, Rule};

/// Backtracking budget per regex evaluation.
const BACKTRACK_LIMIT: usize = 1_000_000;

/// Why a command was allowed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AllowReason {
    /// An allowlist entry matched
    Allowlisted { kind: AllowKind, pattern: String },
    /// No rule for this tool matched
    NoMatch,
    /// Nothing to evaluate
    EmptyCommand,
}

/// Explanation attached to a block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockDetail {
    pub rule_id: String,
    pub rule_name: String,
    pub category: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl BlockDetail {
    fn from_rule(rule: &Rule) -> Self {
        let message = if rule.message.trim().is_empty() {
            "Command blocked by known error pattern.".to_string()
        } else {
            rule.message.clone()
        };
        Self {
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            category: rule.category.clone(),
            message,
            suggestion: rule.suggestion.clone().filter(|s| !s.trim().is_empty()),
            confidence: rule.confidence,
        }
    }

    /// Text written to the host's stderr on block.
    #[must_use]
    pub fn render(&self, show_confidence: bool) -> String {
        let mut out = self.message.clone();
        if let Some(suggestion) = &self.suggestion {
            out.push_str("\nSuggestion: ");
            out.push_str(suggestion);
        }
        if show_confidence {
            if let Some(confidence) = self.confidence {
                out.push_str(&format!(
                    "\nConfidence: {}%",
                    crate::model::confidence_to_percent(confidence)
                ));
            }
        }
        out
    }
}

/// Where an engine fault came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FaultSource {
    Rule { rule_id: String },
    Allowlist { index: usize },
}

/// A pattern the engine could not evaluate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineFault {
    pub source: FaultSource,
    pub pattern: String,
    pub reason: String,
}

/// Outcome of evaluating one command.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "verdict", content = "detail", rename_all = "snake_case")]
pub enum Verdict {
    Allow(AllowReason),
    Block(BlockDetail),
    /// No rule matched, but at least one applicable rule could not be
    /// evaluated. The command is allowed.
    FaultAllow(EngineFault),
}

impl Verdict {
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Block(_))
    }

    /// Hook exit code: 2 blocks, 0 allows.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.is_blocked() { 2 } else { 0 }
    }
}

enum Compiled {
    Exact(String),
    Prefix(String),
    Contains(String),
    Regex(Box<Regex>),
    Faulted(EngineFault),
}

impl Compiled {
    fn test(&self, command: &str) -> Result<bool, String> {
        match self {
            Self::Exact(pattern) => Ok(command == pattern),
            Self::Prefix(pattern) => Ok(command.starts_with(pattern.as_str())),
            Self::Contains(pattern) => Ok(command.contains(pattern.as_str())),
            Self::Regex(regex) => regex.is_match(command).map_err(|e| e.to_string()),
            Self::Faulted(fault) => Err(fault.reason.clone()),
        }
    }
}

fn compile_regex(pattern: &str, source: FaultSource) -> Compiled {
    match RegexBuilder::new(pattern)
        .backtrack_limit(BACKTRACK_LIMIT)
        .build()
    {
        Ok(regex) => Compiled::Regex(Box::new(regex)),
        Err(e) => Compiled::Faulted(EngineFault {
            source,
            pattern: pattern.to_string(),
            reason: e.to_string(),
        }),
    }
}

struct CompiledRule {
    rule: Rule,
    check: Compiled,
}

struct CompiledAllow {
    entry: AllowEntry,
    index: usize,
    check: Compiled,
}

/// Precompiled allowlist + ruleset.
pub struct MatchEngine {
    allow: Vec<CompiledAllow>,
    rules: Vec<CompiledRule>,
    faults: Vec<EngineFault>,
}

impl MatchEngine {
    /// Build an engine. `rules` are evaluated in the order given.
    #[must_use]
    pub fn new(rules: Vec<Rule>, allowlist: &Allowlist) -> Self {
        let mut faults = Vec::new();

        let allow: Vec<CompiledAllow> = allowlist
            .patterns
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                let check = match entry.kind {
                    AllowKind::Exact => Compiled::Exact(entry.pattern.clone()),
                    AllowKind::Prefix => Compiled::Prefix(entry.pattern.clone()),
                    AllowKind::Contains => Compiled::Contains(entry.pattern.clone()),
                    AllowKind::Regex => {
                        compile_regex(&entry.pattern, FaultSource::Allowlist { index })
                    }
                };
                if let Compiled::Faulted(fault) = &check {
                    faults.push(fault.clone());
                }
                CompiledAllow {
                    entry: entry.clone(),
                    index,
                    check,
                }
            })
            .collect();

        let rules: Vec<CompiledRule> = rules
            .into_iter()
            .map(|rule| {
                let pattern = rule.matcher.pattern.clone();
                let check = match rule.matcher.kind {
                    MatchKind::Exact => Compiled::Exact(pattern),
                    MatchKind::Contains => Compiled::Contains(pattern),
                    MatchKind::Regex => compile_regex(
                        &pattern,
                        FaultSource::Rule {
                            rule_id: rule.id.clone(),
                        },
                    ),
                };
                if let Compiled::Faulted(fault) = &check {
                    tracing::warn!(rule_id = %rule.id, error = %fault.reason, "Rule regex failed to compile");
                    faults.push(fault.clone());
                }
                CompiledRule { rule, check }
            })
            .collect();

        Self {
            allow,
            rules,
            faults,
        }
    }

    /// Patterns that failed to compile.
    #[must_use]
    pub fn faults(&self) -> &[EngineFault] {
        &self.faults
    }

    /// Rules loaded into the engine, including ones guarding other tools.
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Evaluate `command` issued through `tool`.
    #[must_use]
    pub fn evaluate(&self, tool: &str, command: &str) -> Verdict {
        if command.trim().is_empty() {
            return Verdict::Allow(AllowReason::EmptyCommand);
        }

        for allow in &self.allow {
            match allow.check.test(command) {
                Ok(true) => {
                    tracing::debug!(index = allow.index, "Command allowlisted");
                    return Verdict::Allow(AllowReason::Allowlisted {
                        kind: allow.entry.kind,
                        pattern: allow.entry.pattern.clone(),
                    });
                }
                Ok(false) => {}
                Err(reason) => {
                    tracing::debug!(index = allow.index, %reason, "Allowlist entry unevaluable");
                }
            }
        }

        let mut first_fault: Option<EngineFault> = None;
        for compiled in self.rules.iter().filter(|c| c.rule.applies_to(tool)) {
            match compiled.check.test(command) {
                Ok(true) => {
                    tracing::debug!(rule_id = %compiled.rule.id, "Command blocked");
                    return Verdict::Block(BlockDetail::from_rule(&compiled.rule));
                }
                Ok(false) => {}
                Err(reason) => {
                    if first_fault.is_none() {
                        first_fault = Some(EngineFault {
                            source: FaultSource::Rule {
                                rule_id: compiled.rule.id.clone(),
                            },
                            pattern: compiled.rule.matcher.pattern.clone(),
                            reason,
                        });
                    }
                }
            }
        }

        match first_fault {
            Some(fault) => Verdict::FaultAllow(fault),
            None => Verdict::Allow(AllowReason::NoMatch),
        }
    }
}
