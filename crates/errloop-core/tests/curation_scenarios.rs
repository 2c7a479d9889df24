//! End-to-end learning scenarios driven through the hook entry point.
//!
//! Each test builds a fresh errloop home, replays host events, curates and
//! then checks what the next pre-tool-use call sees.

use chrono::Utc;
use errloop_core::config::Config;
use errloop_core::curate::{self, CurateMode, CurateOptions};
use errloop_core::hook::{self, HookEvent};
use errloop_core::matcher::{AllowReason, Verdict};
use errloop_core::model::{AllowEntry, AllowKind, Allowlist, MatchKind, MatchSpec, Rule, RulePack};
use errloop_core::packs;
use errloop_core::signature::Learnability;
use errloop_core::synth::{ReviewStatus, SkipReason};
use errloop_core::workspace::Workspace;
use serde_json::json;
use tempfile::TempDir;

const AND_ERROR: &str = "The token '&&' is not recognized as a valid statement separator in this version.";

fn setup() -> (TempDir, Workspace) {
    let tmp = TempDir::new().expect("create temp dir");
    let ws = Workspace::load(tmp.path(), None).expect("load workspace");
    (tmp, ws)
}

fn fail(ws: &Workspace, session: &str, command: &str, error: &str) {
    let payload = json!({
        "session_id": session,
        "tool_name": "Bash",
        "tool_input": {"command": command},
        "error": error,
        "cwd": "/work/app",
    });
    let outcome = hook::dispatch(ws, HookEvent::PostToolUseFailure, &payload.to_string(), Utc::now());
    assert_eq!(outcome.exit_code, 0);
}

fn succeed(ws: &Workspace, session: &str, command: &str) {
    let payload = json!({
        "session_id": session,
        "tool_name": "Bash",
        "tool_input": {"command": command},
        "tool_response": {"stdout": "ok"},
    });
    let outcome = hook::dispatch(ws, HookEvent::PostToolUse, &payload.to_string(), Utc::now());
    assert_eq!(outcome.exit_code, 0);
}

fn check(ws: &Workspace, command: &str) -> Verdict {
    ws.engine().expect("engine").evaluate("Bash", command)
}

fn auto_curate(ws: &Workspace) -> curate::CurationReport {
    curate::run_curation(ws, &CurateOptions::default(), Utc::now()).expect("curation")
}

fn learned(ws: &Workspace) -> RulePack {
    packs::load_learned(&ws.paths.packs_dir).expect("learned pack")
}

#[test]
fn repeated_failures_without_fixes_promote_with_zero_confidence() {
    let (_tmp, ws) = setup();
    fail(&ws, "s1", "echo a && echo b", AND_ERROR);
    fail(&ws, "s2", "echo a && echo b", AND_ERROR);

    let report = auto_curate(&ws);
    assert_eq!(report.summary.created.len(), 1);
    assert!(report.learned_written);
    assert!(ws.paths.active.is_file());

    let pack = learned(&ws);
    let rule = &pack.patterns[0];
    assert!(rule.id.starts_with("learned.bash.echo.syntax_error."), "{}", rule.id);
    assert_eq!(rule.signature.as_deref(), Some("bash:echo:syntax_error"));
    assert_eq!(rule.matcher, MatchSpec::new(MatchKind::Contains, "&&"));
    assert_eq!(rule.category, "syntax_error");
    assert_eq!(rule.confidence, Some(0.0));
    assert_eq!(rule.occurrences, Some(2));
    assert!(rule.suggestion.is_none());

    let Verdict::Block(detail) = check(&ws, "cargo build && cargo test") else {
        panic!("expected a block");
    };
    assert_eq!(detail.rule_id, rule.id);
    assert!(detail.render(true).ends_with("Confidence: 0%"));
}

#[test]
fn linked_fixes_raise_confidence_and_supply_suggestion() {
    let (_tmp, ws) = setup();
    for session in ["s1", "s2"] {
        fail(&ws, session, "echo a && echo b", AND_ERROR);
        succeed(&ws, session, "echo a; echo b");
    }

    auto_curate(&ws);
    let pack = learned(&ws);
    let rule = &pack.patterns[0];
    assert_eq!(rule.confidence_percent(), Some(100));
    assert_eq!(rule.fix_count, Some(2));
    assert_eq!(rule.suggestion.as_deref(), Some("echo a; echo b"));

    let pre = json!({"tool_name": "Bash", "tool_input": {"command": "make && make install"}});
    let outcome = hook::dispatch(&ws, HookEvent::PreToolUse, &pre.to_string(), Utc::now());
    assert_eq!(outcome.exit_code, 2);
    assert!(outcome.stderr.unwrap().contains("Suggestion: echo a; echo b"));
}

#[test]
fn single_failure_stays_pending() {
    let (_tmp, ws) = setup();
    fail(&ws, "s1", "echo a && echo b", AND_ERROR);

    let report = auto_curate(&ws);
    assert!(report.summary.created.is_empty());
    assert_eq!(
        report.summary.skipped[0].reason,
        SkipReason::BelowThreshold { count: 1, threshold: 2 }
    );
    assert!(!ws.paths.learned_pack().exists());

    let review = curate::review_workspace(&ws).unwrap();
    assert_eq!(review.items.len(), 1);
    assert_eq!(review.items[0].status, ReviewStatus::Pending);
    assert!(!check(&ws, "echo a && echo b").is_blocked());
}

#[test]
fn manual_promotion_bypasses_threshold() {
    let (_tmp, ws) = setup();
    fail(&ws, "s1", "echo a && echo b", AND_ERROR);
    let signature = curate::review_workspace(&ws).unwrap().items[0].signature.clone();

    let options = CurateOptions {
        mode: CurateMode::Signature(signature),
        dry_run: false,
    };
    let report = curate::run_curation(&ws, &options, Utc::now()).unwrap();
    assert_eq!(report.summary.created.len(), 1);
    assert!(check(&ws, "echo x && echo y").is_blocked());

    let curated = std::fs::read_to_string(&ws.paths.curated_log).unwrap();
    assert!(curated.contains("manual curation: 1 created"));
}

#[test]
fn environmental_failures_are_never_promoted() {
    let (_tmp, ws) = setup();
    for i in 0..10 {
        fail(
            &ws,
            &format!("s{i}"),
            "touch /var/lib/app/state",
            "touch: cannot touch '/var/lib/app/state': Permission denied",
        );
    }

    let report = auto_curate(&ws);
    assert!(report.summary.created.is_empty());
    assert_eq!(
        report.summary.skipped[0].reason,
        SkipReason::NotLearnable {
            learnability: Learnability::Environmental
        }
    );

    let all = CurateOptions {
        mode: CurateMode::All,
        dry_run: false,
    };
    let report = curate::run_curation(&ws, &all, Utc::now()).unwrap();
    assert!(report.summary.created.is_empty());

    let review = curate::review_workspace(&ws).unwrap();
    assert_eq!(review.items[0].status, ReviewStatus::Ineligible);
    assert_eq!(review.items[0].failure_count, 10);
}

#[test]
fn bad_flag_rule_matches_flag_not_its_prefix() {
    let (_tmp, ws) = setup();
    for session in ["s1", "s2"] {
        fail(&ws, session, "rsync --progres src/ dst/", "rsync: --progres: unknown option");
        succeed(&ws, session, "rsync --progress src/ dst/");
    }
    auto_curate(&ws);

    assert!(check(&ws, "rsync -a --progres a/ b/").is_blocked());
    assert!(check(&ws, "/usr/bin/rsync --progres a/ b/").is_blocked());
    assert!(!check(&ws, "rsync -a --progress a/ b/").is_blocked());
}

#[test]
fn bad_flag_rule_targets_the_flag_named_in_the_error() {
    let (_tmp, ws) = setup();
    for session in ["s1", "s2"] {
        fail(
            &ws,
            session,
            "ls -la --colr=never",
            "ls: unrecognized option '--colr=never'\nTry 'ls --help' for more information.",
        );
        succeed(&ws, session, "ls -la --color=never");
    }
    auto_curate(&ws);

    let pack = learned(&ws);
    assert_eq!(pack.patterns.len(), 1);
    assert_eq!(pack.patterns[0].signature.as_deref(), Some("bash:ls --colr:bad_flag"));
    assert_eq!(pack.patterns[0].suggestion.as_deref(), Some("ls -la --color=never"));

    assert!(check(&ws, "ls -la --colr=never").is_blocked());
    assert!(check(&ws, "ls --colr /tmp").is_blocked());
    assert!(!check(&ws, "ls -la").is_blocked());
    assert!(!check(&ws, "ls -la --color=never").is_blocked());
}

#[test]
fn command_not_found_rule_matches_program_anywhere_on_path() {
    let (_tmp, ws) = setup();
    for session in ["s1", "s2"] {
        fail(&ws, session, "python3 -m venv .venv", "bash: python3: command not found");
    }
    auto_curate(&ws);

    assert!(check(&ws, "python3 script.py").is_blocked());
    assert!(check(&ws, "/usr/local/bin/python3").is_blocked());
    assert!(!check(&ws, "python3.12 script.py").is_blocked());
}

#[test]
fn dry_run_writes_nothing() {
    let (_tmp, ws) = setup();
    fail(&ws, "s1", "echo a && echo b", AND_ERROR);
    fail(&ws, "s2", "echo a && echo b", AND_ERROR);

    let options = CurateOptions {
        mode: CurateMode::Auto,
        dry_run: true,
    };
    let report = curate::run_curation(&ws, &options, Utc::now()).unwrap();
    assert_eq!(report.summary.created.len(), 1);
    assert!(!report.learned_written);
    assert!(!ws.paths.learned_pack().exists());
    assert!(!ws.paths.active.exists());
    assert!(!ws.paths.curated_log.exists());
}

#[test]
fn second_pass_over_same_ledger_changes_nothing() {
    let (_tmp, ws) = setup();
    fail(&ws, "s1", "echo a && echo b", AND_ERROR);
    fail(&ws, "s2", "echo a && echo b", AND_ERROR);
    auto_curate(&ws);
    let before = std::fs::read(ws.paths.learned_pack()).unwrap();

    let report = auto_curate(&ws);
    assert!(!report.summary.changed());
    assert_eq!(report.summary.unchanged, 1);
    assert!(!report.learned_written);
    assert_eq!(std::fs::read(ws.paths.learned_pack()).unwrap(), before);
}

fn write_custom_rule(ws: &Workspace, rule_id: &str, kind: MatchKind, pattern: &str, message: &str) {
    let mut pack = RulePack::new("custom", "test rules");
    pack.patterns.push(Rule {
        id: rule_id.to_string(),
        name: "custom".to_string(),
        category: "policy".to_string(),
        tool: "Bash".to_string(),
        matcher: MatchSpec::new(kind, pattern),
        message: message.to_string(),
        suggestion: None,
        confidence: None,
        source: None,
        signature: None,
        occurrences: None,
        fix_count: None,
        added: None,
    });
    packs::save_pack(&ws.paths.custom_pack(), &pack, ws.lock_timeout()).unwrap();
}

#[test]
fn allowlist_wins_over_matching_rule() {
    let (_tmp, ws) = setup();
    write_custom_rule(&ws, "custom.ls_flags", MatchKind::Regex, r"^ls\s+-[a-zA-Z]", "BLOCKED: no ls flags");
    ws.rebuild_active(Utc::now()).unwrap();
    assert!(check(&ws, "ls -la").is_blocked());

    let allowlist = Allowlist {
        patterns: vec![AllowEntry::new(AllowKind::Prefix, "ls ")],
        ..Allowlist::default()
    };
    std::fs::write(&ws.paths.allowlist, serde_json::to_vec(&allowlist).unwrap()).unwrap();

    assert_eq!(
        check(&ws, "ls -la"),
        Verdict::Allow(AllowReason::Allowlisted {
            kind: AllowKind::Prefix,
            pattern: "ls ".to_string(),
        })
    );
}

#[test]
fn custom_rule_overrides_learned_rule_with_same_id() {
    let (_tmp, ws) = setup();
    fail(&ws, "s1", "echo a && echo b", AND_ERROR);
    fail(&ws, "s2", "echo a && echo b", AND_ERROR);
    auto_curate(&ws);
    let learned_id = learned(&ws).patterns[0].id.clone();

    write_custom_rule(&ws, &learned_id, MatchKind::Contains, "&&", "BLOCKED: house rule");
    let (active, report) = ws.rebuild_active(Utc::now()).unwrap();
    assert_eq!(report.overridden, 1);
    assert_eq!(active.patterns.iter().filter(|r| r.id == learned_id).count(), 1);

    let Verdict::Block(detail) = check(&ws, "a && b") else {
        panic!("expected a block");
    };
    assert_eq!(detail.message, "BLOCKED: house rule");
}

#[test]
fn broken_pack_is_skipped_and_others_merge() {
    let tmp = TempDir::new().unwrap();
    let config = Config {
        enabled_packs: vec!["common".into(), "broken".into(), "windows".into()],
        ..Config::default()
    };
    let ws = Workspace::with_config(tmp.path(), &tmp.path().join("config.toml"), config);
    std::fs::create_dir_all(&ws.paths.packs_dir).unwrap();
    std::fs::write(ws.paths.packs_dir.join("broken.json"), "{ not json").unwrap();

    let (active, report) = ws.rebuild_active(Utc::now()).unwrap();
    let loaded: Vec<&str> = report.loaded.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(loaded, ["common", "windows"]);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].name, "broken");
    assert_eq!(active.enabled_packs, ["common", "windows"]);

    assert!(check(&ws, "cat README.md").is_blocked());
    assert!(check(&ws, "mkdir build").is_blocked());
    assert!(!check(&ws, "mkdir -p build").is_blocked());
}

#[test]
fn session_end_curates_when_enabled() {
    let (_tmp, ws) = setup();
    fail(&ws, "s1", "echo a && echo b", AND_ERROR);
    fail(&ws, "s1", "echo a && echo b", AND_ERROR);
    let outcome = hook::dispatch(&ws, HookEvent::SessionEnd, r#"{"session_id":"s1"}"#, Utc::now());
    assert_eq!(outcome.exit_code, 0);
    assert_eq!(learned(&ws).patterns.len(), 1);
}
