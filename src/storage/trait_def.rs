use crate::models::{
    BlacklistEntry, CollectionRun, EntryFilter, MergeCounts, NewCollectionRun, NormalizedRecord,
    SourceIntervalConfig,
};
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use sqlx::FromRow;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Status changes applied by one expiration pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ExpirationOutcome {
    pub activated: u64,
    pub expired: u64,
}

/// A single bucket of an aggregate count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct DimensionCount {
    pub dimension: String,
    pub count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, FromRow)]
pub struct SummaryCounts {
    pub total: i64,
    pub active: i64,
    pub expired: i64,
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Initialize the storage (create tables and indexes)
    async fn init(&self) -> Result<()>;

    /// Upsert a batch reported by `source` in one transaction.
    ///
    /// Existing entries keep the earliest detection date, accumulate the
    /// source, keep the largest TTL, and take non-empty attributes from the
    /// batch. `expires_at` is always `detection_date + ttl_days`.
    async fn merge_batch(
        &self,
        source: &str,
        ttl_days: i64,
        records: &[NormalizedRecord],
        now: i64,
    ) -> StorageResult<MergeCounts>;

    async fn get_entry(&self, ip: &str) -> Result<Option<BlacklistEntry>>;

    /// List entries ordered by most recent detection first
    async fn list_entries(
        &self,
        filter: EntryFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<BlacklistEntry>>;

    /// Set `is_active = now < expires_at`, writing only rows whose flag changes.
    /// `scope` restricts the pass to the given IPs.
    async fn recompute_active(
        &self,
        now: i64,
        scope: Option<&[String]>,
    ) -> Result<ExpirationOutcome>;

    async fn count_by_source(&self) -> Result<Vec<DimensionCount>>;

    /// Entries per detection day (`YYYY-MM-DD`, UTC), optionally since a timestamp
    async fn count_by_day(&self, since: Option<i64>) -> Result<Vec<DimensionCount>>;

    /// Entries per country; missing countries are reported as "Unknown"
    async fn count_by_country(&self) -> Result<Vec<DimensionCount>>;

    async fn summary(&self) -> Result<SummaryCounts>;

    /// Append to the run log
    async fn record_run(&self, run: &NewCollectionRun) -> Result<CollectionRun>;

    /// Most recent runs first, optionally for a single source
    async fn recent_runs(&self, source: Option<&str>, limit: i64) -> Result<Vec<CollectionRun>>;

    /// Create the interval row if absent; otherwise only refresh `enabled`.
    async fn ensure_source_interval(
        &self,
        source: &str,
        interval_days: i64,
        enabled: bool,
        now: i64,
    ) -> Result<SourceIntervalConfig>;

    async fn get_source_interval(&self, source: &str) -> Result<Option<SourceIntervalConfig>>;

    async fn list_source_intervals(&self) -> Result<Vec<SourceIntervalConfig>>;

    /// Disable every interval row whose source is not in `keep`
    async fn disable_sources_except(&self, keep: &[String], now: i64) -> Result<u64>;

    async fn set_interval_days(&self, source: &str, interval_days: i64, now: i64) -> Result<bool>;

    async fn mark_success(&self, source: &str, at: i64) -> Result<bool>;
}
