use anyhow::Result;
use blackwall::clock::{Clock, SystemClock};
use blackwall::config::Config;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::load(None)?;
    info!(sources = config.sources.len(), "Loaded configuration");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let orchestrator = blackwall::bootstrap(&config, clock)
        .await?
        .with_shutdown(shutdown_rx.clone());
    info!("Database initialized successfully");

    let expiration = Arc::clone(orchestrator.expiration()).spawn_schedule(
        Duration::from_secs(config.collection.expiration_interval_secs),
        shutdown_rx.clone(),
    );

    let tick_every = Duration::from_secs(config.collection.tick_secs);
    let mut shutdown = shutdown_rx;
    let collection = tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick_every);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match orchestrator.run_collection_if_due().await {
                        Ok(report) => {
                            let ran = report.runs().count();
                            if ran > 0 {
                                info!(ran, "Collection tick finished");
                            }
                        }
                        Err(e) => error!("Collection tick failed: {:#}", e),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Collection loop shutting down");
                        break;
                    }
                }
            }
        }
    });

    info!(
        tick_secs = config.collection.tick_secs,
        expiration_interval_secs = config.collection.expiration_interval_secs,
        "Blackwall running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    shutdown_tx.send(true)?;

    let (collection, expiration) = tokio::join!(collection, expiration);
    collection?;
    expiration?;

    info!("Shutdown complete");
    Ok(())
}
