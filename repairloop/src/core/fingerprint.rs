//! Specification fingerprints.

use sha2::{Digest, Sha256};

const PREFIX: &str = "sha256:";
const HEX_LEN: usize = 16;

/// Fixed-length digest of specification content: `sha256:` + 16 hex chars.
pub fn spec_fingerprint(spec: &[u8]) -> String {
    let digest = Sha256::digest(spec);
    let hex = hex::encode(digest);
    format!("{PREFIX}{}", &hex[..HEX_LEN])
}
