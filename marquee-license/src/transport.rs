//! Client side of the `/license/*` wire protocol.

use crate::error::{LicenseError, LicenseResult};
use async_trait::async_trait;
use marquee_types::{
    ActivateRequest, DeactivateRequest, HeartbeatRequest, LicenseResponse, ValidateRequest,
};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// How the client reaches the license authority.
///
/// Implementations return `Ok` for any answer the authority actually gave,
/// including refusals (`valid == false`), and [`LicenseError::Unreachable`]
/// when no trustworthy answer arrived.
#[async_trait]
pub trait AuthorityTransport: Send + Sync {
    async fn validate(&self, req: &ValidateRequest) -> LicenseResult<LicenseResponse>;

    async fn activate(&self, req: &ActivateRequest) -> LicenseResult<LicenseResponse>;

    async fn heartbeat(&self, req: &HeartbeatRequest) -> LicenseResult<LicenseResponse>;

    async fn deactivate(&self, req: &DeactivateRequest) -> LicenseResult<LicenseResponse>;
}

/// JSON-over-HTTP transport.
pub struct HttpTransport {
    base_url: String,
    client: Client,
}

impl HttpTransport {
    /// Creates a transport for the authority at `base_url`, bounding every
    /// call by `timeout`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> LicenseResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn post<T: Serialize + Sync>(&self, path: &str, body: &T) -> LicenseResult<LicenseResponse> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| LicenseError::Unreachable(format!("{path}: {e}")))?;

        let status = response.status();
        if status.is_server_error() {
            let text = response.text().await.unwrap_or_default();
            return Err(LicenseError::Unreachable(format!("{path}: HTTP {status}: {text}")));
        }

        // Refusals arrive as 4xx with the uniform body; anything that does not
        // parse is not a trustworthy answer.
        let resp: LicenseResponse = response
            .json()
            .await
            .map_err(|e| LicenseError::Unreachable(format!("{path}: HTTP {status}: {e}")))?;
        debug!(path, http_status = %status, status = %resp.status, "authority answered");
        Ok(resp)
    }
}

#[async_trait]
impl AuthorityTransport for HttpTransport {
    async fn validate(&self, req: &ValidateRequest) -> LicenseResult<LicenseResponse> {
        self.post("/license/validate", req).await
    }

    async fn activate(&self, req: &ActivateRequest) -> LicenseResult<LicenseResponse> {
        self.post("/license/activate", req).await
    }

    async fn heartbeat(&self, req: &HeartbeatRequest) -> LicenseResult<LicenseResponse> {
        self.post("/license/heartbeat", req).await
    }

    async fn deactivate(&self, req: &DeactivateRequest) -> LicenseResult<LicenseResponse> {
        self.post("/license/deactivate", req).await
    }
}
