//! License admission middleware.
//!
//! Three axum middlewares that decide per request from the
//! [`LicenseClient`]'s in-memory status, never from the network:
//!
//! - [`enforce_valid`]: everything outside the always-allowed prefixes
//!   requires a valid license (`503 license_unavailable` otherwise).
//! - [`enforce_feature`]: routes tagged with a feature require it
//!   (`403 upgrade_required` otherwise).
//! - [`demo_gate`]: in demo mode only the admin API answers
//!   (`403 demo_mode` otherwise).
//!
//! Admin, health and license paths always pass [`enforce_valid`], so a broken
//! license never blocks its own remediation.
//!
//! ```ignore
//! let gate = Gate::new(client.clone());
//! let channels = Router::new()
//!     .route("/api/channels", get(list_channels))
//!     .route_layer(middleware::from_fn_with_state(
//!         gate.feature(FEATURE_LIVE_CHANNELS),
//!         enforce_feature,
//!     ));
//! let app = gate.protect(Router::new().merge(catalog).merge(channels));
//! ```

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use marquee_license::{ClientStatus, LicenseClient, Mode};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// Which paths the gates treat specially.
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Always served, whatever the license state.
    pub always_allowed_prefixes: Vec<String>,
    /// Still served in demo mode.
    pub admin_prefixes: Vec<String>,
    /// JSON API root; the demo gate only blocks paths under it.
    pub api_prefix: String,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            always_allowed_prefixes: ["/admin", "/api/admin", "/health", "/healthz", "/license"]
                .into_iter()
                .map(String::from)
                .collect(),
            admin_prefixes: ["/admin", "/api/admin"]
                .into_iter()
                .map(String::from)
                .collect(),
            api_prefix: "/api/".to_string(),
        }
    }
}

impl GateConfig {
    #[must_use]
    pub fn is_always_allowed(&self, path: &str) -> bool {
        self.always_allowed_prefixes
            .iter()
            .any(|prefix| has_prefix(path, prefix))
    }

    #[must_use]
    pub fn is_admin(&self, path: &str) -> bool {
        self.admin_prefixes.iter().any(|prefix| has_prefix(path, prefix))
    }

    #[must_use]
    pub fn is_api(&self, path: &str) -> bool {
        path.starts_with(&self.api_prefix)
    }
}

/// Shared state for [`enforce_valid`] and [`demo_gate`].
#[derive(Clone)]
pub struct Gate {
    client: LicenseClient,
    config: Arc<GateConfig>,
}

impl Gate {
    #[must_use]
    pub fn new(client: LicenseClient) -> Self {
        Self::with_config(client, GateConfig::default())
    }

    #[must_use]
    pub fn with_config(client: LicenseClient, config: GateConfig) -> Self {
        Self {
            client,
            config: Arc::new(config),
        }
    }

    /// State for [`enforce_feature`] requiring `feature`.
    #[must_use]
    pub fn feature(&self, feature: impl Into<String>) -> FeatureGate {
        FeatureGate {
            client: self.client.clone(),
            feature: feature.into().into(),
        }
    }

    /// Wraps `router` in the demo gate and the validity gate.
    #[must_use]
    pub fn protect(&self, router: Router) -> Router {
        router
            .layer(middleware::from_fn_with_state(self.clone(), enforce_valid))
            .layer(middleware::from_fn_with_state(self.clone(), demo_gate))
    }
}

/// State for [`enforce_feature`].
#[derive(Clone)]
pub struct FeatureGate {
    client: LicenseClient,
    feature: Arc<str>,
}

/// Requires a valid license outside the always-allowed prefixes.
pub async fn enforce_valid(State(gate): State<Gate>, req: Request<Body>, next: Next) -> Response {
    let path = req.uri().path();
    if gate.config.is_always_allowed(path) || gate.client.is_valid() {
        return next.run(req).await;
    }
    let status = gate.client.status();
    debug!(path, mode = %status.mode, "request refused: license unavailable");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({
            "error": "license_unavailable",
            "mode": status.mode,
            "message": status.message,
        })),
    )
        .into_response()
}

/// Requires the gate's feature flag.
pub async fn enforce_feature(
    State(gate): State<FeatureGate>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if gate.client.has_feature(&gate.feature) {
        return next.run(req).await;
    }
    let status = gate.client.status();
    debug!(path = req.uri().path(), feature = %gate.feature, "request refused: feature not licensed");
    (
        StatusCode::FORBIDDEN,
        Json(json!({
            "error": "upgrade_required",
            "feature": &*gate.feature,
            "plan": status.plan,
            "message": format!("your plan does not include {}; upgrade to use it", gate.feature),
        })),
    )
        .into_response()
}

/// In demo mode, blocks every JSON API path except the admin API.
pub async fn demo_gate(State(gate): State<Gate>, req: Request<Body>, next: Next) -> Response {
    let path = req.uri().path();
    if gate.client.mode() != Mode::Demo || !gate.config.is_api(path) || gate.config.is_admin(path)
    {
        return next.run(req).await;
    }
    debug!(path, "request refused: demo mode");
    (
        StatusCode::FORBIDDEN,
        Json(json!({
            "error": "demo_mode",
            "mode": Mode::Demo,
            "message": "no license key configured; only the admin panel is available",
        })),
    )
        .into_response()
}

/// `GET` handler returning the client's status snapshot.
pub async fn status_handler(State(client): State<LicenseClient>) -> Json<ClientStatus> {
    Json(client.status())
}

/// Matches `prefix` as a whole path segment: `/admin` covers `/admin` and
/// `/admin/users` but not `/administrators`.
fn has_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_matches_whole_segments() {
        assert!(has_prefix("/admin", "/admin"));
        assert!(has_prefix("/admin/users", "/admin"));
        assert!(has_prefix("/admin/users", "/admin/"));
        assert!(!has_prefix("/administrators", "/admin"));
        assert!(!has_prefix("/api/movies", "/admin"));
    }

    #[test]
    fn default_config_classifies_paths() {
        let config = GateConfig::default();
        assert!(config.is_always_allowed("/license/activate"));
        assert!(config.is_always_allowed("/healthz"));
        assert!(config.is_always_allowed("/api/admin/settings"));
        assert!(!config.is_always_allowed("/api/movies"));
        assert!(config.is_admin("/api/admin/license"));
        assert!(!config.is_admin("/license"));
        assert!(config.is_api("/api/movies"));
        assert!(!config.is_api("/stream/abc"));
    }
}
