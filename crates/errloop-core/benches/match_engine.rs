//! Pre-tool-use evaluation latency.
//!
//! Every guarded tool call pays for one `evaluate`, so this is the hot path.
//! Target: a ruleset of ~500 learned rules evaluates in well under 1ms.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use errloop_core::matcher::MatchEngine;
use errloop_core::model::{AllowEntry, AllowKind, Allowlist, MatchKind, MatchSpec, Rule, RuleSource};
use errloop_core::packs::{self, builtin_pack};

fn learned_rule(i: usize) -> Rule {
    let (kind, pattern) = match i % 3 {
        0 => (MatchKind::Exact, format!("tool{i} --frobnicate")),
        1 => (
            MatchKind::Regex,
            format!(r"^\s*(?:\S*/)?tool{i}\s+(?:\S+\s+)*--bad{i}(?:[\s=]|$)"),
        ),
        _ => (MatchKind::Contains, format!("|| tool{i}")),
    };
    Rule {
        id: format!("learned.bash.tool{i}.bench"),
        name: format!("Learned: tool{i}"),
        category: "bad_flag".to_string(),
        tool: "Bash".to_string(),
        matcher: MatchSpec::new(kind, pattern),
        message: format!("BLOCKED: learned from 3 failures of tool{i}"),
        suggestion: Some(format!("tool{i} --good")),
        confidence: Some(0.66),
        source: Some(RuleSource::Learned),
        signature: None,
        occurrences: Some(3),
        fix_count: Some(2),
        added: None,
    }
}

fn ruleset(learned: usize) -> Vec<Rule> {
    let mut rules: Vec<Rule> = packs::BUILTIN_PACKS
        .iter()
        .filter_map(|name| builtin_pack(name))
        .flat_map(|pack| pack.patterns)
        .collect();
    rules.extend((0..learned).map(learned_rule));
    packs::sort_for_evaluation(&mut rules);
    rules
}

const COMMANDS: &[&str] = &[
    "cargo test --workspace",
    "git status",
    "ls src",
    "cat Cargo.toml",
    "tool7 --bad7 input.txt",
    "npm run build && npm test",
];

fn bench_evaluate(c: &mut Criterion) {
    let mut group = c.benchmark_group("match_engine/evaluate");
    let allowlist = Allowlist {
        patterns: vec![AllowEntry::new(AllowKind::Prefix, "git ")],
        ..Allowlist::default()
    };

    for learned in [0_usize, 50, 500] {
        let engine = MatchEngine::new(ruleset(learned), &allowlist);
        group.throughput(Throughput::Elements(COMMANDS.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(learned), &engine, |b, engine| {
            b.iter(|| {
                for command in COMMANDS {
                    std::hint::black_box(engine.evaluate("Bash", command));
                }
            });
        });
    }
    group.finish();
}

fn bench_compile(c: &mut Criterion) {
    let rules = ruleset(500);
    let allowlist = Allowlist::default();
    c.bench_function("match_engine/compile_500", |b| {
        b.iter(|| MatchEngine::new(rules.clone(), &allowlist));
    });
}

criterion_group!(benches, bench_evaluate, bench_compile);
criterion_main!(benches);
