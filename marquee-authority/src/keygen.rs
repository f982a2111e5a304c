//! License key generation.

use marquee_types::key::{ENTERPRISE_PREFIX, KEY_ALPHABET, KEY_GROUPS, KEY_GROUP_LEN};
use marquee_types::Plan;
use rand::rngs::OsRng;
use rand::Rng;

/// Generates a fresh key for `plan` from the OS random source.
///
/// Four groups of five characters over a 31-symbol alphabet give roughly
/// 99 bits of entropy.
#[must_use]
pub fn generate_key(plan: Plan) -> String {
    let mut rng = OsRng;
    let groups: Vec<String> = (0..KEY_GROUPS)
        .map(|_| {
            (0..KEY_GROUP_LEN)
                .map(|_| KEY_ALPHABET[rng.gen_range(0..KEY_ALPHABET.len())] as char)
                .collect()
        })
        .collect();
    let body = groups.join("-");
    match plan {
        Plan::Enterprise => format!("{ENTERPRISE_PREFIX}{body}"),
        Plan::Personal | Plan::Business => body,
    }
}
