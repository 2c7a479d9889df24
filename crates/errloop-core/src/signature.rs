//! Failure signature extraction.
//!
//! A signature identifies a class of failure: the tool, the leading command
//! token(s) and the classified cause. Two failures with the same signature are
//! treated as interchangeable for prevention purposes.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Classified cause of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CauseCategory {
    /// Unknown or misspelled flag for an otherwise valid program
    BadFlag,
    /// The program itself does not exist in this shell
    CommandNotFound,
    /// A referenced path does not exist
    PathError,
    /// Insufficient permissions
    PermissionError,
    /// Shell syntax the host shell does not accept
    SyntaxError,
    /// Anything else
    ActionError,
}

impl CauseCategory {
    /// Stable snake_case name, used in signatures and rule categories.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BadFlag => "bad_flag",
            Self::CommandNotFound => "command_not_found",
            Self::PathError => "path_error",
            Self::PermissionError => "permission_error",
            Self::SyntaxError => "syntax_error",
            Self::ActionError => "action_error",
        }
    }

    /// Human label for messages.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::BadFlag => "unknown flag",
            Self::CommandNotFound => "command not found",
            Self::PathError => "missing path",
            Self::PermissionError => "permission",
            Self::SyntaxError => "syntax",
            Self::ActionError => "command",
        }
    }

    /// Environmental causes depend on external state, not on command shape.
    #[must_use]
    pub fn is_environmental(self) -> bool {
        matches!(self, Self::PathError | Self::PermissionError)
    }

}

impl fmt::Display for CauseCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered classification table. First match wins.
///
/// `bad_flag` and `command_not_found` are narrower phrasings of text the
/// generic tests below also match, so they must stay ahead of them.
const CAUSE_RULES: &[(CauseCategory, &[&str])] = &[
    (
        CauseCategory::BadFlag,
        &[
            "unknown option",
            "unrecognized option",
            "invalid option",
            "illegal option",
            "unknown flag",
            "unexpected argument",
            "unrecognized arguments",
            "a parameter cannot be found that matches",
        ],
    ),
    (
        CauseCategory::CommandNotFound,
        &[
            "command not found",
            "is not recognized as the name of",
            "is not recognized as an internal or external command",
        ],
    ),
    (
        CauseCategory::PathError,
        &["not found", "cannot find", "no such file", "does not exist"],
    ),
    (
        CauseCategory::PermissionError,
        &["permission", "access denied", "not permitted"],
    ),
    (
        CauseCategory::SyntaxError,
        &[
            "syntax",
            "unexpected token",
            "not recognized",
            "invalid",
            "token",
            "unexpected",
        ],
    ),
];

/// Classify raw error text into a cause category.
#[must_use]
pub fn classify_cause(error_text: &str) -> CauseCategory {
    let lower = error_text.to_lowercase();
    CAUSE_RULES
        .iter()
        .find(|(_, needles)| needles.iter().any(|needle| lower.contains(needle)))
        .map_or(CauseCategory::ActionError, |(cause, _)| *cause)
}

/// Whether a signature may be promoted into a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Learnability {
    Learnable,
    /// Cause depends on external state (missing path, permissions)
    Environmental,
    /// Command or error text was missing
    Degenerate,
}

/// Deterministic failure signature.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Signature {
    /// Lower-cased tool identifier
    pub tool: String,
    /// Program name, plus the offending flag for `bad_flag`
    pub head: String,
    pub cause: CauseCategory,
}

impl Signature {
    /// Canonical string form: `<tool>:<head>:<cause>`.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.tool, self.head, self.cause)
    }

    /// Rule id a learned rule for this signature receives.
    ///
    /// The readable slug is followed by a short digest of the full key so
    /// distinct signatures never collapse onto one id after slugging.
    #[must_use]
    pub fn rule_id(&self) -> String {
        let digest = Sha256::digest(self.key().as_bytes());
        let short = hex::encode(&digest[..4]);
        format!(
            "learned.{}.{}.{}.{short}",
            slug(&self.tool),
            slug(&self.head),
            self.cause
        )
    }

    /// The program part of the head (first token).
    #[must_use]
    pub fn program(&self) -> &str {
        self.head.split(' ').next().unwrap_or("")
    }

    /// The flag part of the head, present only for `bad_flag` signatures.
    #[must_use]
    pub fn flag(&self) -> Option<&str> {
        self.head.split_once(' ').map(|(_, flag)| flag)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.tool, self.head, self.cause)
    }
}

/// Outcome of classifying one failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub signature: Signature,
    pub learnability: Learnability,
}

impl Classification {
    #[must_use]
    pub fn is_learnable(&self) -> bool {
        self.learnability == Learnability::Learnable
    }
}

/// Extract the signature for a failure. Never fails: missing data yields a
/// degenerate, non-learnable signature.
#[must_use]
pub fn extract(tool: &str, command: &str, error_text: &str) -> Classification {
    let tool = normalize_tool(tool);
    let cause = classify_cause(error_text);
    let program = command_program(command);

    let Some(program) = program else {
        return Classification {
            signature: Signature {
                tool,
                head: String::new(),
                cause,
            },
            learnability: Learnability::Degenerate,
        };
    };

    let flag = match cause {
        CauseCategory::BadFlag => {
            offending_flag(command, error_text).or_else(|| first_flag(command))
        }
        _ => None,
    };
    let head = match flag {
        Some(flag) => format!("{program} {flag}"),
        None => program,
    };

    let learnability = if error_text.trim().is_empty() {
        Learnability::Degenerate
    } else if cause.is_environmental() {
        Learnability::Environmental
    } else {
        Learnability::Learnable
    };

    Classification {
        signature: Signature { tool, head, cause },
        learnability,
    }
}

fn normalize_tool(tool: &str) -> String {
    let trimmed = tool.trim();
    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed.to_lowercase()
    }
}

/// Tokens of the command after any leading `VAR=value` assignments.
fn program_tokens(command: &str) -> impl Iterator<Item = &str> {
    command
        .split_whitespace()
        .skip_while(|token| is_env_assignment(token))
}

fn is_env_assignment(token: &str) -> bool {
    match token.split_once('=') {
        Some((name, _)) => {
            !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !name.starts_with(|c: char| c.is_ascii_digit())
        }
        None => false,
    }
}

/// Program name of a command: basename of the first non-assignment token,
/// unquoted and lower-cased.
#[must_use]
pub fn command_program(command: &str) -> Option<String> {
    let token = program_tokens(command).next()?;
    let unquoted = token.trim_matches(|c| c == '"' || c == '\'');
    let base = unquoted
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(unquoted)
        .to_lowercase();
    if base.is_empty() { None } else { Some(base) }
}

/// Flag-like tokens after the program, without any `=value` suffix.
fn command_flags(command: &str) -> impl Iterator<Item = &str> {
    program_tokens(command)
        .skip(1)
        .filter(|token| token.starts_with('-') && token.len() > 1 && *token != "--")
        .map(|token| token.split('=').next().unwrap_or(token))
}

/// First flag-like token of the command, without any `=value` suffix.
#[must_use]
pub fn first_flag(command: &str) -> Option<String> {
    command_flags(command).next().map(str::to_string)
}

/// The flag of `command` that a bad-flag error names.
///
/// Matches each quoted token of the error against the command's flags:
/// `'--colr=never'` names `--colr`, PowerShell's `'Foo'` names `-Foo`, and
/// getopt's `-- 'z'` names the short-option cluster containing `z`. Returns
/// `None` when the error quotes nothing that appears among the flags.
#[must_use]
pub fn offending_flag(command: &str, error_text: &str) -> Option<String> {
    quoted_tokens(error_text).find_map(|token| {
        let token = token.split('=').next().unwrap_or(token);
        let bare = token.trim_start_matches('-');
        if bare.is_empty() {
            return None;
        }
        let mut flags = command_flags(command);
        if token.starts_with('-') {
            return flags.find(|flag| *flag == token).map(str::to_string);
        }
        let mut chars = bare.chars();
        match (chars.next(), chars.next()) {
            (Some(short), None) => flags
                .find(|flag| !flag.starts_with("--") && flag[1..].contains(short))
                .map(str::to_string),
            _ => flags
                .find(|flag| flag.trim_start_matches('-').eq_ignore_ascii_case(bare))
                .map(str::to_string),
        }
    })
}

fn quoted_token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"['"`‘’“”]([^'"`‘’“”\r\n]{1,40})['"`‘’“”]"#).expect("quoted token regex")
    })
}

/// Trimmed, non-empty quoted tokens of `text`, in order.
fn quoted_tokens(text: &str) -> impl Iterator<Item = &str> {
    quoted_token_regex()
        .captures_iter(text)
        .filter_map(|captures| captures.get(1))
        .map(|token| token.as_str().trim())
        .filter(|token| !token.is_empty())
}

/// Shell operators that commonly differ between host shells.
const SHELL_OPERATORS: &[&str] = &["&&", "||", "2>&1", "$(", "<<", ">>"];

/// A quoted token is specific enough for a `contains` rule only if it is at
/// least two characters and carries punctuation. Bare words like `b` or `fi`
/// occur inside too many unrelated commands.
fn is_distinctive(token: &str) -> bool {
    token.chars().count() >= 2
        && token
            .chars()
            .any(|c| !c.is_alphanumeric() && c != '_' && !c.is_whitespace())
}

/// Best guess at the substring of `command` that caused a syntax failure.
///
/// Prefers a distinctive quoted token from the error text that occurs in the
/// command, then a known shell operator present in the command. Returns
/// `None` when neither is found.
#[must_use]
pub fn offending_substring(command: &str, error_text: &str) -> Option<String> {
    let quoted = quoted_tokens(error_text).find(|token| {
        is_distinctive(token) && *token != command.trim() && command.contains(token)
    });
    if let Some(token) = quoted {
        return Some(token.to_string());
    }

    SHELL_OPERATORS
        .iter()
        .find(|op| command.contains(**op))
        .map(|op| (*op).to_string())
}

/// Lower-case, collapse non-alphanumeric runs to `_`.
fn slug(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_sep = false;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }
    if out.is_empty() { "cmd".to_string() } else { out }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_order_is_first_match_wins() {
        // "invalid option" also contains "invalid" (syntax)
        assert_eq!(
            classify_cause("ls: invalid option -- 'z'"),
            CauseCategory::BadFlag
        );
        // "command not found" also contains "not found" (path)
        assert_eq!(
            classify_cause("bash: foo: command not found"),
            CauseCategory::CommandNotFound
        );
        assert_eq!(
            classify_cause("cat: x.txt: No such file or directory"),
            CauseCategory::PathError
        );
        assert_eq!(
            classify_cause("rm: cannot remove 'x': Permission denied"),
            CauseCategory::PermissionError
        );
        assert_eq!(
            classify_cause("The token '&&' is not recognized as a valid statement separator"),
            CauseCategory::SyntaxError
        );
        assert_eq!(classify_cause("exit status 1"), CauseCategory::ActionError);
    }

    #[test]
    fn not_found_wins_over_permission_when_both_present() {
        assert_eq!(
            classify_cause("file not found (permission check skipped)"),
            CauseCategory::PathError
        );
    }

    #[test]
    fn environmental_causes_are_not_learnable() {
        let c = extract("Bash", "cat secret", "cat: secret: Permission denied");
        assert_eq!(c.learnability, Learnability::Environmental);
        assert!(!c.is_learnable());

        let c = extract("Bash", "cat missing", "No such file or directory");
        assert_eq!(c.learnability, Learnability::Environmental);
    }

    #[test]
    fn bad_flag_signatures_include_the_flag() {
        let a = extract("Bash", "ls --badflag", "ls: unrecognized option '--badflag'");
        let b = extract("Bash", "ls --otherbad", "ls: unrecognized option '--otherbad'");
        let a2 = extract("Bash", "ls --badflag", "ls: unrecognized option '--badflag'");
        assert_ne!(a.signature, b.signature);
        assert_eq!(a.signature, a2.signature);
        assert_eq!(a.signature.key(), "bash:ls --badflag:bad_flag");
        assert_eq!(a.signature.flag(), Some("--badflag"));
    }

    #[test]
    fn non_flag_causes_use_program_only() {
        let a = extract("Bash", "echo a && echo b", "'&&' not recognized");
        let b = extract("Bash", "echo c && echo d", "'&&' not recognized");
        assert_eq!(a.signature, b.signature);
        assert_eq!(a.signature.key(), "bash:echo:syntax_error");
    }

    #[test]
    fn program_skips_env_assignments_and_paths() {
        assert_eq!(
            command_program("RUST_LOG=debug /usr/bin/Cargo build"),
            Some("cargo".to_string())
        );
        assert_eq!(command_program("   "), None);
        assert_eq!(first_flag("grep --color=always foo"), Some("--color".to_string()));
        assert_eq!(first_flag("git -- file"), None);
    }

    #[test]
    fn missing_data_is_degenerate() {
        let c = extract("Bash", "", "some error");
        assert_eq!(c.learnability, Learnability::Degenerate);
        assert_eq!(c.signature.head, "");

        let c = extract("Bash", "ls", "   ");
        assert_eq!(c.learnability, Learnability::Degenerate);

        let c = extract("", "ls", "boom");
        assert_eq!(c.signature.tool, "unknown");
    }

    #[test]
    fn rule_id_is_deterministic_and_slugged() {
        let sig = extract("Bash", "echo a && echo b", "'&&' not recognized").signature;
        let id = sig.rule_id();
        assert!(id.starts_with("learned.bash.echo.syntax_error."), "{id}");
        assert_eq!(id, sig.rule_id());

        let other = Signature {
            tool: "bash".into(),
            head: "ls --a.b".into(),
            cause: CauseCategory::BadFlag,
        };
        let similar = Signature {
            tool: "bash".into(),
            head: "ls --a_b".into(),
            cause: CauseCategory::BadFlag,
        };
        assert_ne!(other.rule_id(), similar.rule_id());
    }

    #[test]
    fn offending_substring_prefers_quoted_tokens() {
        assert_eq!(
            offending_substring(
                "echo a && echo b",
                "The token '&&' is not a valid statement separator"
            ),
            Some("&&".to_string())
        );
        assert_eq!(
            offending_substring("echo a || echo b", "parse failure"),
            Some("||".to_string())
        );
        assert_eq!(offending_substring("echo a", "parse failure"), None);
    }

    #[test]
    fn offending_substring_ignores_bare_words() {
        assert_eq!(
            offending_substring("echo a b", "Unexpected token 'b' in expression or statement."),
            None
        );
        assert_eq!(
            offending_substring("if true; then echo x; fi", "syntax error near unexpected token `fi'"),
            None
        );
        // a bare word is skipped in favour of an operator in the command
        assert_eq!(
            offending_substring("echo b && echo c", "Unexpected token 'b' in expression"),
            Some("&&".to_string())
        );
        assert_eq!(
            offending_substring("cat <(ls)", "syntax error near unexpected token `('"),
            None
        );
    }

    #[test]
    fn bad_flag_head_uses_the_flag_the_error_names() {
        let c = extract("Bash", "ls -la --colr=never", "ls: unrecognized option '--colr=never'");
        assert_eq!(c.signature.key(), "bash:ls --colr:bad_flag");

        let other = extract("Bash", "ls -la --sizee", "ls: unrecognized option '--sizee'");
        assert_ne!(c.signature, other.signature);

        let c = extract("Bash", "ls -a -lz /tmp", "ls: invalid option -- 'z'");
        assert_eq!(c.signature.flag(), Some("-lz"));

        let c = extract(
            "PowerShell",
            "Get-ChildItem -Path . -Recurse -Colour",
            "A parameter cannot be found that matches parameter name 'Colour'.",
        );
        assert_eq!(c.signature.flag(), Some("-Colour"));

        // nothing quoted: fall back to the first flag
        let c = extract("Bash", "tar -x --bogus f.tar", "tar: unknown option");
        assert_eq!(c.signature.flag(), Some("-x"));
    }
}
