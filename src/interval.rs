//! Interval gating: decides whether a source is due for collection.

use crate::clock::Clock;
use crate::models::{SourceIntervalConfig, SECS_PER_DAY};
use crate::storage::Storage;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct IntervalController {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
}

impl IntervalController {
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    /// True when the source never succeeded or its interval has elapsed.
    /// A source without an interval row is due.
    pub async fn is_due(&self, source: &str) -> Result<bool> {
        let now = self.clock.timestamp();
        Ok(match self.storage.get_source_interval(source).await? {
            Some(config) => is_due_at(&config, now),
            None => true,
        })
    }

    /// Advance `last_success_at`. Only called after a run that merged data
    /// or completed without errors.
    pub async fn mark_success(&self, source: &str, at: DateTime<Utc>) -> Result<()> {
        if !self.storage.mark_success(source, at.timestamp()).await? {
            warn!(source = %source, "No interval row to mark successful");
        }
        Ok(())
    }
}

pub fn is_due_at(config: &SourceIntervalConfig, now: i64) -> bool {
    match config.last_success_at {
        None => true,
        Some(last) => now - last >= config.interval_days * SECS_PER_DAY,
    }
}

/// When the source will next be due, if it has ever succeeded.
pub fn next_due_at(config: &SourceIntervalConfig) -> Option<i64> {
    config
        .last_success_at
        .map(|last| last + config.interval_days * SECS_PER_DAY)
}
