#![no_main]

use libfuzzer_sys::fuzz_target;
use errloop_core::ledger::{LedgerReader, parse_line, reconstruct};

fuzz_target!(|data: &[u8]| {
    if data.len() > 16_384 {
        return;
    }

    if let Ok(text) = std::str::from_utf8(data) {
        for line in text.lines() {
            let _ = parse_line(line);
        }
    }

    // Whole-buffer path: malformed lines are skipped, never fatal.
    let entries: Vec<_> = LedgerReader::new(data).collect();
    let linked = reconstruct(&entries);
    assert!(linked.len() <= entries.len());
});
