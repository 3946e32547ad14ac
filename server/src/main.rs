//! Vivid entitlement server.
//!
//! Serves the trial, abuse and referral API and runs the reconciliation jobs
//! (daily expiry sweep, weekly abuse report) in the same process.
//!
//! Usage:
//!   vivid-server --attestation-key <hex> --session-key <hex> --port 8080

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use vivid_abuse::AbuseEngine;
use vivid_registry::Registry;
use vivid_server::{build_router, AppState, Args, Scheduler, ServerConfig};
use vivid_types::{Clock, SystemClock};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    let config = ServerConfig::try_from(args).context("Invalid configuration")?;
    info!("Vivid entitlement server starting...");

    let registry = Arc::new(
        Registry::open(&config.database, config.policy.clone())
            .with_context(|| format!("Failed to open registry at {}", config.database.display()))?,
    );
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let state = Arc::new(AppState::new(
        Arc::clone(&registry),
        AbuseEngine::new(config.engine_config()),
        config.verifier.clone(),
        Arc::clone(&clock),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = config.run_scheduler.then(|| {
        let scheduler = Scheduler::new(registry, clock, config.schedule_config());
        tokio::spawn(scheduler.run(shutdown_rx))
    });

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;
    info!(
        listen = %config.listen,
        trial_days = config.policy.duration_days,
        scheduler = config.run_scheduler,
        "HTTP API listening"
    );

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await
        .context("HTTP server failed")?;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = scheduler {
        handle.await.context("Scheduler task panicked")?;
    }
    info!("Vivid entitlement server stopped");
    Ok(())
}
