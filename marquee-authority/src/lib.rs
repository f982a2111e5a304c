//! Marquee license authority.
//!
//! The server side of the licensing protocol:
//! - Issues dash-segmented keys and records them in the ledger
//! - Validates keys (unknown → invalid, revoked, expired, active)
//! - Admits machines onto a license up to its deployment-slot limit
//! - Tracks liveness through heartbeats and reclaims silent slots hourly
//! - Appends every decision to an audit log
//!
//! Machines talk to it over four JSON endpoints under `/license/`; operators
//! use the `marquee-authority` binary's subcommands.

mod api;
mod authority;
mod error;
mod features;
mod keygen;
pub mod sweeper;

pub use api::{build_router, build_router_with, status_code_for, ApiConfig, ClientIp};
pub use authority::{Authority, IssueRequest, DEFAULT_GRACE_DAYS, DEFAULT_STALE_THRESHOLD_SECS};
pub use error::{AuthorityError, AuthorityResult};
pub use features::resolve_features;
pub use keygen::generate_key;
