//! Fuzz target for Sigstore bundle decoding
//!
//! Bundles come straight from callers and registries, so every byte is
//! attacker controlled.
//!
//! Security concerns:
//! - Base64 decoding of certificates, signatures and proofs
//! - Integer parsing of log indexes, tree sizes and integrated times
//! - Version rules (promise vs. proof, single leaf vs. chain)
//! - Deeply nested or oversized JSON

#![no_main]

use libfuzzer_sys::fuzz_target;
use sigpolicy::bundle::Bundle;
use sigpolicy::verify::certificate::LeafCertificate;
use sigpolicy::verify::tlog::Checkpoint;

fuzz_target!(|data: &[u8]| {
    let Ok(bundle) = Bundle::from_json(data) else {
        return;
    };

    if let Some(der) = bundle.leaf_certificate() {
        let _ = LeafCertificate::parse(der);
    }
    for entry in &bundle.tlog_entries {
        let _ = serde_json::from_slice::<serde_json::Value>(&entry.canonicalized_body);
        if let Some(proof) = &entry.inclusion_proof {
            let _ = Checkpoint::parse(&proof.checkpoint);
        }
    }
});
