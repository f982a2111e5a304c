//! License key format.
//!
//! Keys are four dash-separated groups of five characters drawn from
//! [`KEY_ALPHABET`], e.g. `7KQ4M-XW2PD-HJ9RT-C3NVB`. Enterprise keys carry
//! [`ENTERPRISE_PREFIX`] in front of the groups so the tier can be recovered
//! from the key alone.

/// Uppercase letters and digits minus `0 O 1 I L`.
pub const KEY_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// Number of random groups in a key.
pub const KEY_GROUPS: usize = 4;

/// Characters per random group.
pub const KEY_GROUP_LEN: usize = 5;

/// Leading segment on enterprise-tier keys.
pub const ENTERPRISE_PREFIX: &str = "ENT-";

/// Normalizes a hand-typed key: trims whitespace and uppercases.
#[must_use]
pub fn normalize_key(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// Returns true if the key carries the enterprise prefix.
#[must_use]
pub fn is_enterprise_key(key: &str) -> bool {
    normalize_key(key).starts_with(ENTERPRISE_PREFIX)
}

/// Checks the key's shape without consulting any ledger.
#[must_use]
pub fn is_well_formed(key: &str) -> bool {
    let key = normalize_key(key);
    let body = key.strip_prefix(ENTERPRISE_PREFIX).unwrap_or(&key);
    let groups: Vec<&str> = body.split('-').collect();
    groups.len() == KEY_GROUPS
        && groups.iter().all(|g| {
            g.len() == KEY_GROUP_LEN && g.bytes().all(|b| KEY_ALPHABET.contains(&b))
        })
}
