pub mod clock;
pub mod collectors;
pub mod config;
pub mod expiration;
pub mod geoip;
pub mod interval;
pub mod models;
pub mod orchestrator;
pub mod stats;
pub mod storage;
pub mod store;
pub mod validator;

use anyhow::Result;
use clock::Clock;
use config::Config;
use expiration::ExpirationEngine;
use geoip::GeoIpService;
use orchestrator::Orchestrator;
use std::sync::Arc;
use store::UnifiedStore;
use tracing::info;

/// Wire the engine together from configuration: storage, GeoIP, store,
/// expiration engine and a loaded source registry.
pub async fn bootstrap(config: &Config, clock: Arc<dyn Clock>) -> Result<Orchestrator> {
    let storage = storage::open(&config.database).await?;

    let geoip = GeoIpService::new(config.geoip.country_db_path.as_deref())?;
    if geoip.is_enabled() {
        info!("GeoIP country lookup enabled");
    }

    let store = UnifiedStore::new(Arc::clone(&storage), Arc::clone(&clock)).with_geoip(geoip);
    let expiration = Arc::new(ExpirationEngine::new(storage, Arc::clone(&clock)));
    let orchestrator = Orchestrator::new(store, expiration, clock, config.collection.run_timeout());
    orchestrator
        .reload_sources(orchestrator::build_registry(config))
        .await?;

    Ok(orchestrator)
}
