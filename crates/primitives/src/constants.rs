/// Version of the wire protocol announced in the `version` notice.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Network discriminator. Peers on a different alt cannot exchange units.
pub const ALT: &str = "1";

pub const PROGRAM: &str = "jointmesh";

pub const PROGRAM_VERSION: &str = env!("CARGO_PKG_VERSION");

const ADDRESS_LEN: usize = 32;

/// Addresses are 32 characters of the RFC 4648 base32 alphabet.
#[must_use]
pub fn is_valid_address(address: &str) -> bool {
    address.len() == ADDRESS_LEN
        && address
            .bytes()
            .all(|b| b.is_ascii_uppercase() || (b'2'..=b'7').contains(&b))
}
