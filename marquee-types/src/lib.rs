//! Shared types for the Marquee license authority and its clients.
//!
//! This crate holds everything both sides of the licensing protocol agree on:
//! - Request and response bodies for the four `/license/*` endpoints
//! - Plans, their default slot counts and feature flags
//! - The license key format
//! - Typed ledger identifiers (UUID v7)
//! - A [`Clock`] seam for time-dependent decisions

mod clock;
mod ids;
pub mod key;
mod plan;
pub mod protocol;
mod status;

pub use clock::{Clock, ManualClock, SystemClock};
pub use ids::{DeploymentId, LicenseId};
pub use plan::{Plan, FEATURE_LIVE_CHANNELS};
pub use protocol::{
    ActivateRequest, DeactivateRequest, HeartbeatRequest, LicenseResponse, ValidateRequest,
};
pub use status::LicenseStatus;

/// Errors that can occur when parsing shared types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown plan: {0}")]
    UnknownPlan(String),
}
