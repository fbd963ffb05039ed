//! Fuzz target for transparency log checkpoints (signed notes).

#![no_main]

use libfuzzer_sys::fuzz_target;
use sigpolicy::verify::tlog::Checkpoint;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = Checkpoint::parse(s);
    }
});
