//! Marquee License Authority
//!
//! Runs the machine-facing licensing endpoints and the hourly stale sweep,
//! and gives operators a command line over the same ledger.
//!
//! Usage:
//!   marquee-authority serve --listen 0.0.0.0:8470
//!   marquee-authority issue --plan business --owner ops@example.com
//!   marquee-authority revoke <KEY>
//!   marquee-authority set-features <KEY> live_channels

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use marquee_authority::sweeper::{self, SweepConfig};
use marquee_authority::{
    build_router_with, ApiConfig, Authority, IssueRequest, DEFAULT_STALE_THRESHOLD_SECS,
};
use marquee_ledger::Ledger;
use marquee_types::Plan;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

/// Upper bound on the stale threshold (ten years).
const MAX_STALE_THRESHOLD_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Parser, Debug)]
#[command(name = "marquee-authority")]
#[command(about = "Marquee license authority")]
struct Args {
    /// Path to the SQLite ledger
    #[arg(long, env = "MARQUEE_DB", default_value = "marquee-ledger.db", global = true)]
    db: PathBuf,

    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the licensing endpoints
    Serve {
        /// Address to listen on
        #[arg(long, env = "MARQUEE_LISTEN", default_value = "0.0.0.0:8470")]
        listen: SocketAddr,

        /// Seconds between stale sweeps
        #[arg(
            long,
            env = "MARQUEE_SWEEP_INTERVAL_SECS",
            default_value_t = 3600,
            value_parser = clap::value_parser!(u64).range(1..)
        )]
        sweep_interval_secs: u64,

        /// Seconds without a heartbeat before a deployment loses its slot
        #[arg(
            long,
            env = "MARQUEE_STALE_THRESHOLD_SECS",
            default_value_t = DEFAULT_STALE_THRESHOLD_SECS as u64,
            value_parser = clap::value_parser!(u64).range(1..=MAX_STALE_THRESHOLD_SECS)
        )]
        stale_threshold_secs: u64,

        /// Record the first X-Forwarded-For hop as the caller address.
        /// Enable only behind a reverse proxy that sets the header.
        #[arg(long, env = "MARQUEE_TRUST_FORWARDED_FOR")]
        trust_forwarded_for: bool,
    },
    /// Issue a new license key
    Issue {
        /// personal, business or enterprise
        #[arg(long)]
        plan: Plan,
        /// Owner contact
        #[arg(long)]
        owner: String,
        /// Deployment slots (defaults to the plan's)
        #[arg(long)]
        max_deployments: Option<u32>,
        /// RFC 3339 expiry, e.g. 2026-01-01T00:00:00Z
        #[arg(long)]
        expires_at: Option<DateTime<Utc>>,
        /// Comma-separated feature override
        #[arg(long, value_delimiter = ',')]
        features: Option<Vec<String>>,
    },
    /// Revoke a license key
    Revoke { key: String },
    /// Change a license's deployment-slot limit
    SetMax { key: String, max: u32 },
    /// Replace a license's feature list, or clear it with --clear
    SetFeatures {
        key: String,
        /// Comma-separated features
        #[arg(value_delimiter = ',', required_unless_present = "clear")]
        features: Vec<String>,
        /// Clear the stored list so features follow the key and plan
        #[arg(long, conflicts_with = "features")]
        clear: bool,
    },
    /// List a license's deployments
    Deployments { key: String },
    /// Print a license's audit trail
    Events { key: String },
    /// Run one stale sweep now
    Sweep {
        #[arg(
            long,
            default_value_t = DEFAULT_STALE_THRESHOLD_SECS as u64,
            value_parser = clap::value_parser!(u64).range(1..=MAX_STALE_THRESHOLD_SECS)
        )]
        stale_threshold_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.as_str().to_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let ledger = Ledger::open(&args.db)
        .with_context(|| format!("Failed to open ledger at {}", args.db.display()))?;
    let authority = Arc::new(Authority::new(ledger));

    match args.command {
        Command::Serve {
            listen,
            sweep_interval_secs,
            stale_threshold_secs,
            trust_forwarded_for,
        } => {
            let sweep = SweepConfig {
                interval: Duration::from_secs(sweep_interval_secs),
                threshold: Duration::from_secs(stale_threshold_secs),
            };
            let api = ApiConfig {
                trust_forwarded_for,
            };
            serve(authority, listen, sweep, api).await
        }
        Command::Issue {
            plan,
            owner,
            max_deployments,
            expires_at,
            features,
        } => {
            let license = authority.issue(IssueRequest {
                plan,
                owner,
                max_deployments,
                expires_at,
                features,
            })?;
            println!("{}", serde_json::to_string_pretty(&license)?);
            Ok(())
        }
        Command::Revoke { key } => {
            let license = authority.revoke(&key)?;
            println!("{}", serde_json::to_string_pretty(&license)?);
            Ok(())
        }
        Command::SetMax { key, max } => {
            let license = authority.set_max_deployments(&key, max)?;
            println!("{}", serde_json::to_string_pretty(&license)?);
            Ok(())
        }
        Command::SetFeatures {
            key,
            features,
            clear,
        } => {
            let features = (!clear).then_some(features);
            let license = authority.set_features(&key, features)?;
            println!("{}", serde_json::to_string_pretty(&license)?);
            Ok(())
        }
        Command::Deployments { key } => {
            let deployments = authority.deployments(&key)?;
            println!("{}", serde_json::to_string_pretty(&deployments)?);
            Ok(())
        }
        Command::Events { key } => {
            let events = authority.events(&key)?;
            println!("{}", serde_json::to_string_pretty(&events)?);
            Ok(())
        }
        Command::Sweep {
            stale_threshold_secs,
        } => {
            let threshold = chrono::Duration::from_std(Duration::from_secs(stale_threshold_secs))
                .context("stale threshold out of range")?;
            let count = authority.stale_sweep(threshold)?;
            println!("reclaimed {count} stale deployment(s)");
            Ok(())
        }
    }
}

async fn serve(
    authority: Arc<Authority>,
    listen: SocketAddr,
    sweep_config: SweepConfig,
    api: ApiConfig,
) -> Result<()> {
    info!("Marquee license authority starting...");
    if api.trust_forwarded_for {
        info!("trusting X-Forwarded-For for caller addresses");
    }
    let sweep = sweeper::start(Arc::clone(&authority), sweep_config);

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {listen}"))?;
    info!("License endpoints listening on {}", listen);

    let app = build_router_with(authority, api);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    })
    .await
    .context("HTTP server failed")?;

    sweep.cancel();
    Ok(())
}
