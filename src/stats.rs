//! Read-only aggregate views over the unified store.

use crate::clock::Clock;
use crate::models::SECS_PER_DAY;
use crate::storage::{DimensionCount, Storage, SummaryCounts};
use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct StatisticsSnapshot {
    pub summary: SummaryCounts,
    pub by_source: Vec<DimensionCount>,
    pub by_country: Vec<DimensionCount>,
    pub by_day: Vec<DimensionCount>,
}

#[derive(Clone)]
pub struct StatisticsAggregator {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
}

impl StatisticsAggregator {
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    pub async fn summary(&self) -> Result<SummaryCounts> {
        self.storage.summary().await
    }

    pub async fn by_source(&self) -> Result<Vec<DimensionCount>> {
        self.storage.count_by_source().await
    }

    pub async fn by_country(&self) -> Result<Vec<DimensionCount>> {
        self.storage.count_by_country().await
    }

    /// Daily detection counts, limited to the last `days` days when given.
    pub async fn by_day(&self, days: Option<u32>) -> Result<Vec<DimensionCount>> {
        let since = days.map(|d| {
            let now = self.clock.timestamp();
            let today = now - now.rem_euclid(SECS_PER_DAY);
            today - (i64::from(d) - 1).max(0) * SECS_PER_DAY
        });
        self.storage.count_by_day(since).await
    }

    pub async fn snapshot(&self, days: Option<u32>) -> Result<StatisticsSnapshot> {
        Ok(StatisticsSnapshot {
            summary: self.summary().await?,
            by_source: self.by_source().await?,
            by_country: self.by_country().await?,
            by_day: self.by_day(days).await?,
        })
    }
}
