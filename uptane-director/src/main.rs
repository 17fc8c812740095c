//! Director worker process
//!
//! Runs the re-signing, rollout and certificate purge workers plus the event
//! dispatcher over in-memory backends until interrupted.

use anyhow::{Context, Result};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uptane_core::TeamId;
use uptane_director::worker::{run_certificate_purge, run_resigner, run_rollouts};
use uptane_director::{
    channel, Backends, Config, Director, EventDispatcher, InMemoryCertificateAuthority, InMemoryInventory,
    InMemoryKeyStorage, InMemoryMetadataStore, Resigner, TracingAuditSink,
};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "uptane_director=info".into());
    let registry = tracing_subscriber::registry().with(filter);

    if env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        resign_interval_secs = config.resign_interval_secs,
        rollout_interval_secs = config.rollout_interval_secs,
        gateway_origin = %config.gateway_origin,
        "starting uptane director"
    );

    let (events, subscriber) = channel(config.max_delivery_attempts);
    let director = Director::new(
        Backends {
            metadata: Arc::new(InMemoryMetadataStore::new()),
            inventory: Arc::new(InMemoryInventory::new()),
            keys: Arc::new(InMemoryKeyStorage::new()),
            ca: Arc::new(InMemoryCertificateAuthority::new()),
        },
        config.clone(),
        events.clone(),
    );

    if let Ok(team) = env::var("BOOTSTRAP_TEAM") {
        director
            .bootstrap_team(&TeamId(team))
            .await
            .context("Failed to bootstrap team")?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let resigner = Resigner::new(director.chains().clone(), events.clone());

    let workers = vec![
        tokio::spawn(run_resigner(
            resigner,
            Duration::from_secs(config.resign_interval_secs),
            shutdown_rx.clone(),
        )),
        tokio::spawn(run_rollouts(
            director.rollouts().clone(),
            Duration::from_secs(config.rollout_interval_secs),
            shutdown_rx.clone(),
        )),
        tokio::spawn(run_certificate_purge(
            director.certificate_authority().clone(),
            Duration::from_secs(config.purge_interval_secs),
            shutdown_rx,
        )),
    ];

    let dispatcher = EventDispatcher::new(director.rollouts().clone(), Arc::new(TracingAuditSink));
    let dispatcher = tokio::spawn(dispatcher.run(subscriber));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("shutting down");

    shutdown_tx.send(true).ok();
    for worker in workers {
        if let Err(e) = worker.await {
            error!(error = %e, "worker task failed");
        }
    }

    // the rollout engine held by the dispatcher keeps the bus open
    dispatcher.abort();
    Ok(())
}
