//! HTTP surface of the authority.

use crate::authority::Authority;
use crate::error::{AuthorityError, AuthorityResult};
use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use marquee_types::{
    ActivateRequest, DeactivateRequest, HeartbeatRequest, LicenseResponse, LicenseStatus,
    ValidateRequest,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

/// Options for the HTTP surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiConfig {
    /// Take the caller address from `X-Forwarded-For`. Only safe behind a
    /// reverse proxy that overwrites the header.
    pub trust_forwarded_for: bool,
}

/// Build the HTTP API router over the given authority, recording socket
/// peers as caller addresses.
pub fn build_router(authority: Arc<Authority>) -> Router {
    build_router_with(authority, ApiConfig::default())
}

/// Build the HTTP API router with explicit options.
pub fn build_router_with(authority: Arc<Authority>, config: ApiConfig) -> Router {
    Router::new()
        .route("/license/validate", post(validate_handler))
        .route("/license/activate", post(activate_handler))
        .route("/license/heartbeat", post(heartbeat_handler))
        .route("/license/deactivate", post(deactivate_handler))
        .route("/health", get(health_handler))
        .layer(Extension(config))
        .with_state(authority)
}

/// HTTP status accompanying a license response.
#[must_use]
pub fn status_code_for(resp: &LicenseResponse) -> StatusCode {
    match resp.status {
        LicenseStatus::Active => StatusCode::OK,
        LicenseStatus::Deactivated if resp.valid => StatusCode::OK,
        LicenseStatus::Deactivated | LicenseStatus::OverLimit => StatusCode::CONFLICT,
        LicenseStatus::Revoked | LicenseStatus::Expired => StatusCode::FORBIDDEN,
        LicenseStatus::Invalid => StatusCode::NOT_FOUND,
    }
}

/// Caller address: the socket peer, or the first `X-Forwarded-For` hop when
/// [`ApiConfig::trust_forwarded_for`] is set.
pub struct ClientIp(pub String);

impl<S: Send + Sync> FromRequestParts<S> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let trusted = parts
            .extensions
            .get::<ApiConfig>()
            .is_some_and(|c| c.trust_forwarded_for);
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .filter(|_| trusted)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let ip = forwarded
            .or_else(|| {
                parts
                    .extensions
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip().to_string())
            })
            .unwrap_or_default();
        Ok(Self(ip))
    }
}

async fn validate_handler(
    State(authority): State<Arc<Authority>>,
    ClientIp(ip): ClientIp,
    body: Result<Json<ValidateRequest>, JsonRejection>,
) -> Response {
    dispatch(authority, body, move |a, req| a.validate(req, &ip)).await
}

async fn activate_handler(
    State(authority): State<Arc<Authority>>,
    ClientIp(ip): ClientIp,
    body: Result<Json<ActivateRequest>, JsonRejection>,
) -> Response {
    dispatch(authority, body, move |a, req| a.activate(req, &ip)).await
}

async fn heartbeat_handler(
    State(authority): State<Arc<Authority>>,
    ClientIp(ip): ClientIp,
    body: Result<Json<HeartbeatRequest>, JsonRejection>,
) -> Response {
    dispatch(authority, body, move |a, req| a.heartbeat(req, &ip)).await
}

async fn deactivate_handler(
    State(authority): State<Arc<Authority>>,
    ClientIp(ip): ClientIp,
    body: Result<Json<DeactivateRequest>, JsonRejection>,
) -> Response {
    dispatch(authority, body, move |a, req| a.deactivate(req, &ip)).await
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Runs a ledger-backed call off the async executor and renders the result.
async fn dispatch<T, F>(
    authority: Arc<Authority>,
    body: Result<Json<T>, JsonRejection>,
    call: F,
) -> Response
where
    T: Send + 'static,
    F: FnOnce(&Authority, &T) -> AuthorityResult<LicenseResponse> + Send + 'static,
{
    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return AuthorityError::InvalidRequest(rejection.body_text()).into_response();
        }
    };
    match tokio::task::spawn_blocking(move || call(&authority, &req)).await {
        Ok(Ok(resp)) => (status_code_for(&resp), Json(resp)).into_response(),
        Ok(Err(e)) => e.into_response(),
        Err(e) => AuthorityError::Task(e.to_string()).into_response(),
    }
}
