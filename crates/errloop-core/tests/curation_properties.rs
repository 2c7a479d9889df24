//! Properties of curation over arbitrary ledgers.

use chrono::{Duration, TimeZone, Utc};
use errloop_core::curate::{CurateMode, curate_entries};
use errloop_core::event::{FailureEvent, FixEvent, LedgerEntry};
use errloop_core::model::RulePack;
use errloop_core::packs::pack_bytes;
use proptest::prelude::*;
use serde_json::json;

const PROGRAMS: &[&str] = &["echo", "rsync", "python3", "make", "npm", "touch"];
const ERRORS: &[&str] = &[
    "The token '&&' is not recognized as a valid statement separator",
    "rsync: --progres: unknown option",
    "bash: python3: command not found",
    "touch: cannot touch 'x': Permission denied",
    "make: *** No rule to make target 'all'.  Stop.",
    "",
];

#[derive(Debug, Clone)]
struct Step {
    session: u8,
    program: usize,
    error: usize,
    fixed: bool,
}

fn step() -> impl Strategy<Value = Step> {
    (0u8..3, 0..PROGRAMS.len(), 0..ERRORS.len(), any::<bool>()).prop_map(
        |(session, program, error, fixed)| Step {
            session,
            program,
            error,
            fixed,
        },
    )
}

fn ledger(steps: &[Step]) -> Vec<LedgerEntry> {
    let start = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
    let mut entries = Vec::new();
    for (i, step) in steps.iter().enumerate() {
        // Distinct millisecond per step keeps generated ids unique.
        let now = start + Duration::milliseconds(i64::try_from(i).unwrap());
        let session = format!("s{}", step.session);
        let command = format!("{} --progres a && b", PROGRAMS[step.program]);
        let failure = FailureEvent::new(
            "Bash",
            json!({ "command": command }),
            ERRORS[step.error],
            &session,
            None,
            2_000,
            now,
        );
        let failure_id = failure.id.clone();
        entries.push(LedgerEntry::Failure(failure));
        if step.fixed {
            let fix = format!("{} --fixed", PROGRAMS[step.program]);
            entries.push(LedgerEntry::Fix(FixEvent::new(
                Some(failure_id),
                "Bash",
                &fix,
                &session,
                now,
            )));
        }
    }
    entries
}

fn curate(entries: &[LedgerEntry], pack: &mut RulePack, threshold: u64) -> bool {
    curate_entries(entries, pack, threshold, &CurateMode::Auto, "2026-03-01").changed()
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn curation_is_deterministic(steps in prop::collection::vec(step(), 0..24)) {
        let entries = ledger(&steps);
        let mut first = RulePack::new("learned", "");
        let mut second = RulePack::new("learned", "");
        curate(&entries, &mut first, 2);
        curate(&entries, &mut second, 2);
        prop_assert_eq!(pack_bytes(&first).unwrap(), pack_bytes(&second).unwrap());
    }

    #[test]
    fn second_pass_is_byte_identical(steps in prop::collection::vec(step(), 0..24)) {
        let entries = ledger(&steps);
        let mut pack = RulePack::new("learned", "");
        curate(&entries, &mut pack, 2);
        let before = pack_bytes(&pack).unwrap();

        prop_assert!(!curate(&entries, &mut pack, 2));
        prop_assert_eq!(pack_bytes(&pack).unwrap(), before);
    }

    #[test]
    fn confidence_stays_in_unit_range(steps in prop::collection::vec(step(), 1..24)) {
        let entries = ledger(&steps);
        let mut pack = RulePack::new("learned", "");
        curate(&entries, &mut pack, 1);
        for rule in &pack.patterns {
            let confidence = rule.confidence.unwrap_or(-1.0);
            prop_assert!((0.0..=1.0).contains(&confidence), "{} has {}", rule.id, confidence);
            prop_assert!(rule.fix_count <= rule.occurrences);
        }
    }

    #[test]
    fn more_evidence_never_removes_rules(
        steps in prop::collection::vec(step(), 0..16),
        more in prop::collection::vec(step(), 0..16),
    ) {
        let mut pack = RulePack::new("learned", "");
        curate(&ledger(&steps), &mut pack, 2);
        let ids: Vec<String> = pack.patterns.iter().map(|r| r.id.clone()).collect();

        let mut all = steps;
        all.extend(more);
        curate(&ledger(&all), &mut pack, 2);
        for id in &ids {
            prop_assert!(pack.find(id).is_some(), "rule {} disappeared", id);
        }
    }

    #[test]
    fn environmental_and_empty_errors_never_promote(
        steps in prop::collection::vec(step(), 0..24),
    ) {
        let steps: Vec<Step> = steps
            .into_iter()
            .map(|s| Step { error: if s.error % 2 == 0 { 3 } else { 5 }, ..s })
            .collect();
        let mut pack = RulePack::new("learned", "");
        curate_entries(&ledger(&steps), &mut pack, 1, &CurateMode::All, "2026-03-01");
        prop_assert!(pack.patterns.is_empty());
    }
}
