//! Expiration engine: keeps `is_active` consistent with `expires_at`.
//!
//! Only one pass runs at a time; concurrent callers queue behind the pass in
//! progress. Merges on unrelated rows are not blocked by the engine itself.

use crate::clock::Clock;
use crate::storage::{ExpirationOutcome, Storage};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info};

pub struct ExpirationEngine {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    pass: Mutex<()>,
}

impl ExpirationEngine {
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            clock,
            pass: Mutex::new(()),
        }
    }

    /// Recompute every entry.
    pub async fn recompute_active_status(&self) -> Result<ExpirationOutcome> {
        let _pass = self.pass.lock().await;
        let outcome = self
            .storage
            .recompute_active(self.clock.timestamp(), None)
            .await?;

        info!(
            activated = outcome.activated,
            expired = outcome.expired,
            "Expiration pass complete"
        );
        Ok(outcome)
    }

    /// Recompute only the given entries, typically those a merge just touched.
    pub async fn recompute_entries(&self, ips: &[String]) -> Result<ExpirationOutcome> {
        if ips.is_empty() {
            return Ok(ExpirationOutcome::default());
        }

        let _pass = self.pass.lock().await;
        let outcome = self
            .storage
            .recompute_active(self.clock.timestamp(), Some(ips))
            .await?;

        debug!(
            entries = ips.len(),
            activated = outcome.activated,
            expired = outcome.expired,
            "Scoped expiration pass complete"
        );
        Ok(outcome)
    }

    /// Run a full pass every `every` until `shutdown` flips to true.
    pub fn spawn_schedule(
        self: Arc<Self>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.recompute_active_status().await {
                            error!("Expiration pass failed: {:#}", e);
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("Expiration schedule shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }
}
