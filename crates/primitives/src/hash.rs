use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;
use sha2::{Digest, Sha256};

#[must_use]
pub fn base64_sha256(data: &[u8]) -> String {
    STANDARD.encode(Sha256::digest(data))
}

/// Hash of the compact JSON encoding of `value`.
///
/// Object keys are emitted in sorted order, so the result only depends on
/// the content.
#[must_use]
pub fn json_hash(value: &Value) -> String {
    base64_sha256(value.to_string().as_bytes())
}
