//! Deployment ledger for the Marquee license authority.
//!
//! Stores three record kinds in one SQLite file:
//! - **Licenses**: issued keys, plan, slot limit, features, expiry, revocation
//! - **Deployments**: one row per (license, machine fingerprint)
//! - **Events**: append-only audit trail, never updated or deleted
//!
//! The ledger enforces row-level invariants (unique keys, unique
//! fingerprint per license, revocation clears `is_active`). Admission
//! control lives in the authority on top of it.

mod error;
mod records;
mod store;

pub use error::{LedgerError, LedgerResult};
pub use records::{
    DeploymentRecord, DeploymentUpsert, EventRecord, EventType, LicenseRecord, NewEvent,
};
pub use store::Ledger;
