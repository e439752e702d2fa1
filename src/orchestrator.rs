//! Collection orchestrator.
//!
//! One pass fans out an independent pipeline per enabled source:
//! authenticate, fetch, parse, merge, mark success, refresh expiry of the
//! touched entries. Every pipeline that starts leaves a row in the run log,
//! whatever happens to it.

use crate::clock::Clock;
use crate::collectors::{build_collector, AuthFailure, DateRange, FetchFailure, Session, SourceCollector};
use crate::config::{validate_interval_days, Cadence, Config, ConfigError};
use crate::expiration::ExpirationEngine;
use crate::interval::{self, IntervalController};
use crate::models::{CollectionRun, MergeResult, NewCollectionRun, RunStatus, SourceIntervalConfig};
use crate::stats::StatisticsAggregator;
use crate::store::{SourceTtl, UnifiedStore};
use anyhow::Result;
use dashmap::DashSet;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// A configured source ready to run.
#[derive(Clone)]
pub struct RegisteredSource {
    pub collector: Arc<dyn SourceCollector>,
    pub enabled: bool,
    /// Interval given to a source the first time it is seen. Afterwards the
    /// stored value is authoritative.
    pub interval_days: u32,
    pub cadence: Cadence,
}

pub type SourceRegistry = BTreeMap<String, RegisteredSource>;

/// Build one collector per configured source.
pub fn build_registry(config: &Config) -> SourceRegistry {
    config
        .sources
        .iter()
        .map(|(name, source)| {
            let registered = RegisteredSource {
                collector: build_collector(name, source, &config.collection),
                enabled: source.enabled,
                interval_days: source.interval_days,
                cadence: source.cadence,
            };
            (name.clone(), registered)
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Disabled,
    NotDue,
    AlreadyRunning,
    /// Interval state could not be read.
    StateUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SourceOutcome {
    Ran {
        run: NewCollectionRun,
        /// Run log id, absent if the run could not be recorded.
        run_id: Option<i64>,
    },
    Skipped {
        reason: SkipReason,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceReport {
    pub source: String,
    #[serde(flatten)]
    pub outcome: SourceOutcome,
}

impl SourceReport {
    fn skipped(source: &str, reason: SkipReason) -> Self {
        Self {
            source: source.to_string(),
            outcome: SourceOutcome::Skipped { reason },
        }
    }

    pub fn run(&self) -> Option<&NewCollectionRun> {
        match &self.outcome {
            SourceOutcome::Ran { run, .. } => Some(run),
            SourceOutcome::Skipped { .. } => None,
        }
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self.outcome {
            SourceOutcome::Skipped { reason } => Some(reason),
            SourceOutcome::Ran { .. } => None,
        }
    }
}

/// Result of one orchestrator pass, ordered by source name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub sources: Vec<SourceReport>,
}

impl RunReport {
    pub fn source(&self, name: &str) -> Option<&SourceReport> {
        self.sources.iter().find(|r| r.source == name)
    }

    pub fn runs(&self) -> impl Iterator<Item = &NewCollectionRun> {
        self.sources.iter().filter_map(SourceReport::run)
    }
}

/// What the status interface reports per source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub source: String,
    /// False for sources that were removed from configuration.
    pub configured: bool,
    pub enabled: bool,
    pub interval_days: i64,
    pub last_success_at: Option<i64>,
    pub next_due_at: Option<i64>,
    pub due: bool,
    pub running: bool,
    pub last_run: Option<CollectionRun>,
}

/// Marks a source as in flight until dropped.
struct InFlight {
    set: Arc<DashSet<String>>,
    source: String,
}

impl InFlight {
    fn claim(set: &Arc<DashSet<String>>, source: &str) -> Option<Self> {
        set.insert(source.to_string()).then(|| Self {
            set: Arc::clone(set),
            source: source.to_string(),
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set.remove(&self.source);
    }
}

/// What a pipeline got done before it ended or was cut short.
#[derive(Debug, Default)]
struct Progress {
    record_count: u64,
    merged: Option<MergeResult>,
}

impl Progress {
    fn any_merged(&self) -> bool {
        self.merged.as_ref().is_some_and(|m| m.merged() > 0)
    }
}

struct Verdict {
    status: RunStatus,
    error_summary: Option<String>,
}

impl Verdict {
    fn success() -> Self {
        Self {
            status: RunStatus::Success,
            error_summary: None,
        }
    }

    /// Partial once anything reached the store, failed otherwise.
    fn stopped(summary: String, any_merged: bool) -> Self {
        Self {
            status: if any_merged {
                RunStatus::Partial
            } else {
                RunStatus::Failed
            },
            error_summary: Some(summary),
        }
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    store: UnifiedStore,
    intervals: IntervalController,
    expiration: Arc<ExpirationEngine>,
    stats: StatisticsAggregator,
    clock: Arc<dyn Clock>,
    registry: Arc<RwLock<SourceRegistry>>,
    in_flight: Arc<DashSet<String>>,
    run_timeout: Duration,
    shutdown: Option<watch::Receiver<bool>>,
}

impl Orchestrator {
    pub fn new(
        store: UnifiedStore,
        expiration: Arc<ExpirationEngine>,
        clock: Arc<dyn Clock>,
        run_timeout: Duration,
    ) -> Self {
        let storage = Arc::clone(store.storage());
        Self {
            intervals: IntervalController::new(Arc::clone(&storage), Arc::clone(&clock)),
            stats: StatisticsAggregator::new(storage, Arc::clone(&clock)),
            store,
            expiration,
            clock,
            registry: Arc::new(RwLock::new(SourceRegistry::new())),
            in_flight: Arc::new(DashSet::new()),
            run_timeout,
            shutdown: None,
        }
    }

    /// Cancel in-flight pipelines once `shutdown` flips to true.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn store(&self) -> &UnifiedStore {
        &self.store
    }

    pub fn stats(&self) -> &StatisticsAggregator {
        &self.stats
    }

    pub fn expiration(&self) -> &Arc<ExpirationEngine> {
        &self.expiration
    }

    /// Swap in a new set of sources.
    ///
    /// Waits for any in-flight pass to finish. New sources get an interval
    /// row, known ones have `enabled` refreshed, and sources missing from
    /// `sources` are disabled.
    pub async fn reload_sources(&self, sources: SourceRegistry) -> Result<()> {
        let mut registry = self.registry.write().await;
        let storage = self.store.storage();
        let now = self.clock.timestamp();

        for (name, source) in &sources {
            storage
                .ensure_source_interval(name, i64::from(source.interval_days), source.enabled, now)
                .await?;
        }

        let keep: Vec<String> = sources.keys().cloned().collect();
        let disabled = storage.disable_sources_except(&keep, now).await?;
        if disabled > 0 {
            info!(disabled, "Disabled sources no longer configured");
        }

        *registry = sources;
        info!(sources = registry.len(), "Source registry loaded");
        Ok(())
    }

    /// Change a source's collection interval, checked against its cadence.
    pub async fn update_interval(&self, source: &str, interval_days: i64) -> Result<SourceIntervalConfig> {
        let registry = self.registry.write().await;
        let registered = registry
            .get(source)
            .ok_or_else(|| ConfigError::UnknownSource(source.to_string()))?;
        validate_interval_days(source, interval_days, registered.cadence)?;

        let storage = self.store.storage();
        if !storage
            .set_interval_days(source, interval_days, self.clock.timestamp())
            .await?
        {
            return Err(ConfigError::UnknownSource(source.to_string()).into());
        }

        info!(source = %source, interval_days, "Collection interval updated");
        storage
            .get_source_interval(source)
            .await?
            .ok_or_else(|| ConfigError::UnknownSource(source.to_string()).into())
    }

    /// Run every enabled source regardless of its interval.
    pub async fn run_collection_now(&self) -> Result<RunReport> {
        self.run_pass(true, None).await
    }

    /// Run the enabled sources whose interval has elapsed. Cheap to call
    /// often: sources that are not due are skipped without touching the run
    /// log.
    pub async fn run_collection_if_due(&self) -> Result<RunReport> {
        self.run_pass(false, None).await
    }

    pub async fn run_source(&self, source: &str, force: bool) -> Result<SourceReport> {
        let report = self.run_pass(force, Some(source)).await?;
        report
            .sources
            .into_iter()
            .next()
            .ok_or_else(|| ConfigError::UnknownSource(source.to_string()).into())
    }

    async fn run_pass(&self, force: bool, only: Option<&str>) -> Result<RunReport> {
        let registry = self.registry.read().await;
        if let Some(name) = only {
            if !registry.contains_key(name) {
                return Err(ConfigError::UnknownSource(name.to_string()).into());
            }
        }

        let mut reports = Vec::new();
        let mut tasks = JoinSet::new();

        for (name, source) in registry.iter() {
            if only.is_some_and(|only| only != name.as_str()) {
                continue;
            }
            if !source.enabled {
                debug!(source = %name, "Skipping disabled source");
                reports.push(SourceReport::skipped(name, SkipReason::Disabled));
                continue;
            }

            // The claim must cover the due check.
            let Some(claim) = InFlight::claim(&self.in_flight, name) else {
                debug!(source = %name, "Source already running");
                reports.push(SourceReport::skipped(name, SkipReason::AlreadyRunning));
                continue;
            };

            if !force {
                match self.intervals.is_due(name).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(source = %name, "Source not due");
                        reports.push(SourceReport::skipped(name, SkipReason::NotDue));
                        continue;
                    }
                    Err(e) => {
                        error!(source = %name, "Failed to read interval state: {:#}", e);
                        reports.push(SourceReport::skipped(name, SkipReason::StateUnavailable));
                        continue;
                    }
                }
            }

            let worker = self.clone();
            let collector = Arc::clone(&source.collector);
            tasks.spawn(async move {
                let _claim = claim;
                worker.run_pipeline(collector).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => error!("Collection pipeline aborted: {}", e),
            }
        }

        reports.sort_by(|a, b| a.source.cmp(&b.source));
        Ok(RunReport { sources: reports })
    }

    async fn run_pipeline(&self, collector: Arc<dyn SourceCollector>) -> SourceReport {
        let source = collector.name().to_string();
        let started_at = self.clock.timestamp();
        info!(source = %source, "Collection run started");

        let mut progress = Progress::default();
        let outcome = {
            let pipeline = tokio::time::timeout(self.run_timeout, self.collect(collector.as_ref(), &mut progress));
            tokio::select! {
                finished = pipeline => finished.unwrap_or_else(|_| {
                    Err(format!("run timed out after {}s", self.run_timeout.as_secs()))
                }),
                _ = shutdown_requested(self.shutdown.clone()) => Err("cancelled".to_string()),
            }
        };

        let verdict = match outcome {
            Ok(None) => Verdict::success(),
            Ok(Some(failure)) => Verdict::stopped(interruption_summary(&failure), progress.any_merged()),
            Err(summary) => Verdict::stopped(summary, progress.any_merged()),
        };

        // Whatever stopped the pipeline, merged data still counts.
        if verdict.status != RunStatus::Failed {
            if let Err(e) = self.intervals.mark_success(&source, self.clock.now()).await {
                error!(source = %source, "Failed to mark success: {:#}", e);
            }
        }
        if let Some(merged) = &progress.merged {
            if let Err(e) = self.expiration.recompute_entries(&merged.touched).await {
                warn!(source = %source, "Scoped expiration pass failed: {:#}", e);
            }
        }

        let merged = progress.merged.unwrap_or_default();
        let run = NewCollectionRun {
            source: source.clone(),
            started_at,
            finished_at: self.clock.timestamp(),
            status: verdict.status,
            record_count: saturating_i64(progress.record_count),
            inserted: saturating_i64(merged.inserted),
            updated: saturating_i64(merged.updated),
            rejected: saturating_i64(merged.rejected),
            error_summary: verdict.error_summary,
        };

        match run.status {
            RunStatus::Success => info!(
                source = %source,
                records = run.record_count,
                inserted = run.inserted,
                updated = run.updated,
                rejected = run.rejected,
                "Collection run succeeded"
            ),
            RunStatus::Partial | RunStatus::Failed => warn!(
                source = %source,
                status = %run.status,
                records = run.record_count,
                inserted = run.inserted,
                updated = run.updated,
                error = run.error_summary.as_deref().unwrap_or_default(),
                "Collection run did not complete"
            ),
        }

        let run_id = match self.store.storage().record_run(&run).await {
            Ok(recorded) => Some(recorded.id),
            Err(e) => {
                error!(source = %source, "Failed to record collection run: {:#}", e);
                None
            }
        };

        SourceReport {
            source,
            outcome: SourceOutcome::Ran { run, run_id },
        }
    }

    /// Authenticate, fetch and merge. `Ok` carries the failure that cut
    /// fetching short, if any; `Err` is the summary of a run that stopped
    /// before anything was merged.
    async fn collect(
        &self,
        collector: &dyn SourceCollector,
        progress: &mut Progress,
    ) -> Result<Option<FetchFailure>, String> {
        let source = collector.name();
        let profile = collector.profile();

        let session = self.authenticate(collector).await.map_err(|failure| {
            error!(source = %source, error = %failure, "Authentication failed");
            format!("authentication failed: {failure}")
        })?;

        let range = DateRange::lookback(self.clock.now(), profile.lookback_days);
        let batch = collector
            .fetch_raw_batch(&session, &range)
            .await
            .map_err(|failure| {
                error!(source = %source, error = %failure, "Fetch failed");
                format!("fetch failed: {failure}")
            })?;
        debug!(source = %source, pages = batch.pages, records = batch.records.len(), "Fetched batch");
        progress.record_count = batch.records.len() as u64;

        let ttl = SourceTtl {
            source: source.to_string(),
            ttl_days: i64::from(profile.ttl_days),
        };
        let merged = self.store.merge(batch.records, &ttl).await.map_err(|e| {
            error!(source = %source, "Merge failed: {:#}", e);
            format!("storage failure: {e}")
        })?;
        progress.merged = Some(merged);

        Ok(batch.interrupted)
    }

    /// One retry, and only when the failure looks transient. Repeated bad
    /// logins lock the account.
    async fn authenticate(&self, collector: &dyn SourceCollector) -> Result<Session, AuthFailure> {
        match collector.authenticate().await {
            Err(AuthFailure::Network(reason)) => {
                warn!(source = %collector.name(), %reason, "Login failed on network error, retrying once");
                collector.authenticate().await
            }
            other => other,
        }
    }

    /// Per-source scheduling state joined with the latest run.
    pub async fn status(&self) -> Result<Vec<SourceStatus>> {
        let registry = self.registry.read().await;
        let storage = self.store.storage();
        let now = self.clock.timestamp();

        let mut statuses = Vec::new();
        for config in storage.list_source_intervals().await? {
            let last_run = storage
                .recent_runs(Some(&config.source), 1)
                .await?
                .into_iter()
                .next();

            statuses.push(SourceStatus {
                configured: registry.contains_key(&config.source),
                running: self.in_flight.contains(&config.source),
                due: config.enabled && interval::is_due_at(&config, now),
                next_due_at: interval::next_due_at(&config),
                enabled: config.enabled,
                interval_days: config.interval_days,
                last_success_at: config.last_success_at,
                source: config.source,
                last_run,
            });
        }

        Ok(statuses)
    }

    pub async fn recent_runs(&self, source: Option<&str>, limit: i64) -> Result<Vec<CollectionRun>> {
        self.store.storage().recent_runs(source, limit).await
    }
}

fn interruption_summary(failure: &FetchFailure) -> String {
    format!("fetch interrupted: {failure}")
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Resolves once shutdown is signalled. Never resolves without a receiver
/// or after the sender is gone.
async fn shutdown_requested(shutdown: Option<watch::Receiver<bool>>) {
    if let Some(mut shutdown) = shutdown {
        if shutdown.wait_for(|stop| *stop).await.is_ok() {
            return;
        }
    }
    std::future::pending::<()>().await
}
