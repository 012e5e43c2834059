use core::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;

#[must_use]
#[expect(clippy::trivially_copy_pass_by_ref, reason = "serde skip_serializing_if")]
pub const fn is_false(value: &bool) -> bool {
    !*value
}

/// Random token of `len` bytes, base64 encoded.
///
/// Used for subscription ids, hub challenges and echo strings.
#[must_use]
pub fn random_token(len: usize) -> String {
    let mut bytes = vec![0_u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

fn since_epoch() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// Milliseconds since the unix epoch, saturating at zero for clocks set
/// before it.
#[must_use]
pub fn unix_millis() -> u64 {
    u64::try_from(since_epoch().as_millis()).unwrap_or(u64::MAX)
}

/// Whole seconds since the unix epoch, the unit of joint timestamps.
#[must_use]
pub fn unix_secs() -> u64 {
    since_epoch().as_secs()
}
