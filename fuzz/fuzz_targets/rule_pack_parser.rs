#![no_main]

use libfuzzer_sys::fuzz_target;
use errloop_core::matcher::MatchEngine;
use errloop_core::model::{Allowlist, DocFormat, RuleSource, parse_pack};

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 || data.len() > 16_384 {
        return;
    }

    let format = match data[0] % 3 {
        0 => DocFormat::Json,
        1 => DocFormat::Yaml,
        _ => DocFormat::Toml,
    };
    let Ok(input) = std::str::from_utf8(&data[1..]) else {
        return;
    };

    let _ = Allowlist::parse(input, format);

    let Ok(parsed) = parse_pack("fuzz", input, format, RuleSource::Custom) else {
        return;
    };
    let engine = MatchEngine::new(parsed.pack.patterns, &Allowlist::default());
    let _ = engine.evaluate("Bash", "echo a && echo b");
});
