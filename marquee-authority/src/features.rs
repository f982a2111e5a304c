//! Entitlement resolution.
//!
//! The order below is load-bearing: rows issued before features were stored
//! have an empty `features` column, and their entitlement is recovered from
//! the key prefix before falling back to the plan. Changing the order changes
//! what existing customers are entitled to.

use marquee_types::key::is_enterprise_key;
use marquee_types::Plan;

/// Resolves a license's feature flags.
///
/// 1. A non-empty stored list wins.
/// 2. Otherwise an enterprise-prefixed key gets enterprise features.
/// 3. Otherwise the plan's defaults apply.
#[must_use]
pub fn resolve_features(stored: Option<&[String]>, key: &str, plan: Plan) -> Vec<String> {
    if let Some(stored) = stored.filter(|f| !f.is_empty()) {
        return stored.to_vec();
    }
    if is_enterprise_key(key) {
        return Plan::Enterprise.default_features();
    }
    plan.default_features()
}
