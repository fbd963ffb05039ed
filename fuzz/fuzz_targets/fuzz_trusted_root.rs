//! Fuzz target for trusted root documents
//!
//! The document is only trusted after TUF verification, but a compromised or
//! buggy repository must still not be able to crash the parser.

#![no_main]

use libfuzzer_sys::fuzz_target;
use sigpolicy::trust::TrustedRoot;

fuzz_target!(|data: &[u8]| {
    if let Ok(root) = TrustedRoot::from_json(data) {
        for log in &root.tlogs {
            let _ = root.tlog(&log.log_id);
        }
        for authority in &root.certificate_authorities {
            let _ = authority.root();
            let _ = authority.intermediates().len();
        }
    }
});
