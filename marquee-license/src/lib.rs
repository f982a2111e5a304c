//! Marquee license client.
//!
//! The customer-side half of the licensing protocol:
//! - A stable machine fingerprint bound to the data directory
//! - A local cache of the authority's last answer, written atomically
//! - Startup trust resolution with an offline grace period
//! - One cancellable background heartbeat loop per client
//!
//! # Modes
//!
//! | mode | `is_valid()` |
//! |---|---|
//! | `demo` | true (the admission gate restricts the surface) |
//! | `licensed` | true |
//! | `grace` | true until the grace deadline |
//! | `invalid` | false |

mod client;
mod device;
mod error;
mod store;
mod transport;

pub use client::{
    ClientConfig, ClientStatus, LicenseClient, Mode, DEFAULT_GRACE_WINDOW,
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_REQUEST_TIMEOUT, DEFAULT_VALIDITY_WINDOW,
};
pub use device::{fingerprint_from, machine_fingerprint, DeviceInfo, INSTANCE_ID_FILE};
pub use error::{LicenseError, LicenseResult};
pub use store::{
    read_key_file, write_key_file, CacheStore, LocalCache, CACHE_FILE, KEY_FILE,
};
pub use transport::{AuthorityTransport, HttpTransport};
