use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::authority::{Authority, DEFAULT_STALE_THRESHOLD_SECS};

/// Configuration for the stale-deployment sweep.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// How often to sweep.
    pub interval: Duration,
    /// A deployment with no heartbeat for this long loses its slot.
    pub threshold: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            threshold: Duration::from_secs(DEFAULT_STALE_THRESHOLD_SECS as u64),
        }
    }
}

/// Start the background stale sweep.
///
/// Each pass is best-effort: failures are logged and the next pass runs on
/// schedule. Returns a CancellationToken that stops the loop when cancelled.
pub fn start(authority: Arc<Authority>, config: SweepConfig) -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let interval = config.interval;
    let threshold = chrono::Duration::from_std(config.threshold).unwrap_or_else(|_| {
        warn!(threshold = ?config.threshold, "stale threshold out of range; using default");
        chrono::Duration::seconds(DEFAULT_STALE_THRESHOLD_SECS)
    });

    tokio::spawn(async move {
        info!("stale sweep started (interval={interval:?}, threshold={threshold})");
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("stale sweep stopped");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    debug!("stale sweep pass");
                    let authority = Arc::clone(&authority);
                    match tokio::task::spawn_blocking(move || authority.stale_sweep(threshold)).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => error!("stale sweep error: {e}"),
                        Err(e) => error!("stale sweep task panicked: {e}"),
                    }
                }
            }
        }
    });

    cancel
}
