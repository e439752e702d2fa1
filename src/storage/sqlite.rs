use crate::models::{
    BlacklistEntry, CollectionRun, CollectionRunRow, EntryFilter, EntryRow, MergeCounts,
    NewCollectionRun, NormalizedRecord, SourceIntervalConfig, SECS_PER_DAY,
};
use crate::storage::{
    DimensionCount, ExpirationOutcome, Storage, StorageResult, SummaryCounts,
};
use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Upper bound on bound parameters per scoped statement.
const SCOPE_CHUNK: usize = 500;

const ENTRY_SELECT: &str = r#"
    SELECT e.ip, e.attack_type, e.country, e.detection_date, e.ttl_days, e.expires_at,
           e.is_active, e.created_at, e.updated_at, GROUP_CONCAT(s.source, ',') AS sources
    FROM blacklist_entries e
    LEFT JOIN entry_sources s ON s.ip = e.ip
"#;

pub struct SqliteStorage {
    pool: Arc<SqlitePool>,
    /// SQLite has a single writer; batches queue here instead of failing busy.
    write_lock: Mutex<()>,
}

impl SqliteStorage {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Self {
            pool: Arc::new(pool),
            write_lock: Mutex::new(()),
        })
    }
}

fn push_ip_scope<'a>(qb: &mut QueryBuilder<'a, Sqlite>, ips: &'a [String]) {
    qb.push(" AND ip IN (");
    let mut separated = qb.separated(", ");
    for ip in ips {
        separated.push_bind(ip.as_str());
    }
    separated.push_unseparated(")");
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn init(&self) -> Result<()> {
        // Unified blacklist, one row per IP
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS blacklist_entries (
                ip TEXT PRIMARY KEY,
                attack_type TEXT,
                country TEXT,
                detection_date INTEGER NOT NULL,
                ttl_days INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_expires_at ON blacklist_entries(expires_at)")
            .execute(self.pool.as_ref())
            .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_entries_detection_date ON blacklist_entries(detection_date)",
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_country ON blacklist_entries(country)")
            .execute(self.pool.as_ref())
            .await?;

        // Per-source contributions behind the merged sources set
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entry_sources (
                ip TEXT NOT NULL,
                source TEXT NOT NULL,
                detection_date INTEGER NOT NULL,
                first_seen INTEGER NOT NULL,
                last_seen INTEGER NOT NULL,
                PRIMARY KEY (ip, source)
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entry_sources_source ON entry_sources(source)")
            .execute(self.pool.as_ref())
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS collection_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                finished_at INTEGER NOT NULL,
                status TEXT NOT NULL,
                record_count INTEGER NOT NULL DEFAULT 0,
                inserted INTEGER NOT NULL DEFAULT 0,
                updated INTEGER NOT NULL DEFAULT 0,
                rejected INTEGER NOT NULL DEFAULT 0,
                error_summary TEXT
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_runs_source_started ON collection_runs(source, started_at)",
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS source_intervals (
                source TEXT PRIMARY KEY,
                interval_days INTEGER NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                last_success_at INTEGER,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn merge_batch(
        &self,
        source: &str,
        ttl_days: i64,
        records: &[NormalizedRecord],
        now: i64,
    ) -> StorageResult<MergeCounts> {
        let mut counts = MergeCounts::default();
        if records.is_empty() {
            return Ok(counts);
        }

        let _writer = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        for record in records {
            let existing = sqlx::query_scalar::<_, i64>(
                "SELECT 1 FROM blacklist_entries WHERE ip = ?",
            )
            .bind(&record.ip)
            .fetch_optional(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO blacklist_entries
                    (ip, attack_type, country, detection_date, ttl_days, expires_at,
                     is_active, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)
                ON CONFLICT(ip) DO UPDATE SET
                    attack_type = COALESCE(excluded.attack_type, blacklist_entries.attack_type),
                    country = COALESCE(excluded.country, blacklist_entries.country),
                    detection_date = MIN(blacklist_entries.detection_date, excluded.detection_date),
                    ttl_days = MAX(blacklist_entries.ttl_days, excluded.ttl_days),
                    expires_at = MIN(blacklist_entries.detection_date, excluded.detection_date)
                        + MAX(blacklist_entries.ttl_days, excluded.ttl_days) * 86400,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&record.ip)
            .bind(&record.attack_type)
            .bind(&record.country)
            .bind(record.detection_date)
            .bind(ttl_days)
            .bind(record.detection_date + ttl_days * SECS_PER_DAY)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO entry_sources (ip, source, detection_date, first_seen, last_seen)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(ip, source) DO UPDATE SET
                    detection_date = MIN(entry_sources.detection_date, excluded.detection_date),
                    last_seen = excluded.last_seen
                "#,
            )
            .bind(&record.ip)
            .bind(source)
            .bind(record.detection_date)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            if existing.is_some() {
                counts.updated += 1;
            } else {
                counts.inserted += 1;
            }
        }

        tx.commit().await?;

        Ok(counts)
    }

    async fn get_entry(&self, ip: &str) -> Result<Option<BlacklistEntry>> {
        let query = format!("{ENTRY_SELECT} WHERE e.ip = ? GROUP BY e.ip");
        let row = sqlx::query_as::<_, EntryRow>(&query)
            .bind(ip)
            .fetch_optional(self.pool.as_ref())
            .await?;

        Ok(row.map(BlacklistEntry::from))
    }

    async fn list_entries(
        &self,
        filter: EntryFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<BlacklistEntry>> {
        let condition = match filter {
            EntryFilter::All => "",
            EntryFilter::Active => "WHERE e.is_active = 1",
            EntryFilter::Expired => "WHERE e.is_active = 0",
        };
        let query = format!(
            "{ENTRY_SELECT} {condition} GROUP BY e.ip ORDER BY e.detection_date DESC, e.ip LIMIT ? OFFSET ?"
        );

        let rows = sqlx::query_as::<_, EntryRow>(&query)
            .bind(limit)
            .bind(offset)
            .fetch_all(self.pool.as_ref())
            .await?;

        Ok(rows.into_iter().map(BlacklistEntry::from).collect())
    }

    async fn recompute_active(
        &self,
        now: i64,
        scope: Option<&[String]>,
    ) -> Result<ExpirationOutcome> {
        let mut outcome = ExpirationOutcome::default();

        let chunks: Vec<Option<&[String]>> = match scope {
            None => vec![None],
            Some([]) => return Ok(outcome),
            Some(ips) => ips.chunks(SCOPE_CHUNK).map(Some).collect(),
        };

        let _writer = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        for chunk in chunks {
            let mut expire = QueryBuilder::<Sqlite>::new(
                "UPDATE blacklist_entries SET is_active = 0 WHERE is_active = 1 AND expires_at <= ",
            );
            expire.push_bind(now);
            if let Some(ips) = chunk {
                push_ip_scope(&mut expire, ips);
            }
            outcome.expired += expire.build().execute(&mut *tx).await?.rows_affected();

            let mut activate = QueryBuilder::<Sqlite>::new(
                "UPDATE blacklist_entries SET is_active = 1 WHERE is_active = 0 AND expires_at > ",
            );
            activate.push_bind(now);
            if let Some(ips) = chunk {
                push_ip_scope(&mut activate, ips);
            }
            outcome.activated += activate.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;

        Ok(outcome)
    }

    async fn count_by_source(&self) -> Result<Vec<DimensionCount>> {
        let counts = sqlx::query_as::<_, DimensionCount>(
            r#"
            SELECT source AS dimension, COUNT(*) AS count
            FROM entry_sources
            GROUP BY source
            ORDER BY count DESC, dimension
            "#,
        )
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(counts)
    }

    async fn count_by_day(&self, since: Option<i64>) -> Result<Vec<DimensionCount>> {
        let counts = sqlx::query_as::<_, DimensionCount>(
            r#"
            SELECT date(detection_date, 'unixepoch') AS dimension, COUNT(*) AS count
            FROM blacklist_entries
            WHERE ? IS NULL OR detection_date >= ?
            GROUP BY dimension
            ORDER BY dimension
            "#,
        )
        .bind(since)
        .bind(since)
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(counts)
    }

    async fn count_by_country(&self) -> Result<Vec<DimensionCount>> {
        let counts = sqlx::query_as::<_, DimensionCount>(
            r#"
            SELECT COALESCE(country, 'Unknown') AS dimension, COUNT(*) AS count
            FROM blacklist_entries
            GROUP BY dimension
            ORDER BY count DESC, dimension
            "#,
        )
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(counts)
    }

    async fn summary(&self) -> Result<SummaryCounts> {
        let summary = sqlx::query_as::<_, SummaryCounts>(
            r#"
            SELECT COUNT(*) AS total,
                   COALESCE(SUM(is_active), 0) AS active,
                   COUNT(*) - COALESCE(SUM(is_active), 0) AS expired
            FROM blacklist_entries
            "#,
        )
        .fetch_one(self.pool.as_ref())
        .await?;

        Ok(summary)
    }

    async fn record_run(&self, run: &NewCollectionRun) -> Result<CollectionRun> {
        let _writer = self.write_lock.lock().await;

        let row = sqlx::query_as::<_, CollectionRunRow>(
            r#"
            INSERT INTO collection_runs
                (source, started_at, finished_at, status, record_count, inserted, updated,
                 rejected, error_summary)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id, source, started_at, finished_at, status, record_count, inserted,
                      updated, rejected, error_summary
            "#,
        )
        .bind(&run.source)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.status.as_str())
        .bind(run.record_count)
        .bind(run.inserted)
        .bind(run.updated)
        .bind(run.rejected)
        .bind(&run.error_summary)
        .fetch_one(self.pool.as_ref())
        .await?;

        row.try_into()
    }

    async fn recent_runs(&self, source: Option<&str>, limit: i64) -> Result<Vec<CollectionRun>> {
        let rows = sqlx::query_as::<_, CollectionRunRow>(
            r#"
            SELECT id, source, started_at, finished_at, status, record_count, inserted, updated,
                   rejected, error_summary
            FROM collection_runs
            WHERE ? IS NULL OR source = ?
            ORDER BY started_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(source)
        .bind(source)
        .bind(limit)
        .fetch_all(self.pool.as_ref())
        .await?;

        rows.into_iter().map(CollectionRun::try_from).collect()
    }

    async fn ensure_source_interval(
        &self,
        source: &str,
        interval_days: i64,
        enabled: bool,
        now: i64,
    ) -> Result<SourceIntervalConfig> {
        {
            let _writer = self.write_lock.lock().await;
            sqlx::query(
                r#"
                INSERT INTO source_intervals (source, interval_days, enabled, last_success_at, updated_at)
                VALUES (?, ?, ?, NULL, ?)
                ON CONFLICT(source) DO UPDATE SET
                    enabled = excluded.enabled,
                    updated_at = excluded.updated_at
                WHERE source_intervals.enabled <> excluded.enabled
                "#,
            )
            .bind(source)
            .bind(interval_days)
            .bind(enabled)
            .bind(now)
            .execute(self.pool.as_ref())
            .await?;
        }

        let config = sqlx::query_as::<_, SourceIntervalConfig>(
            r#"
            SELECT source, interval_days, enabled, last_success_at, updated_at
            FROM source_intervals
            WHERE source = ?
            "#,
        )
        .bind(source)
        .fetch_one(self.pool.as_ref())
        .await?;

        Ok(config)
    }

    async fn get_source_interval(&self, source: &str) -> Result<Option<SourceIntervalConfig>> {
        let config = sqlx::query_as::<_, SourceIntervalConfig>(
            r#"
            SELECT source, interval_days, enabled, last_success_at, updated_at
            FROM source_intervals
            WHERE source = ?
            "#,
        )
        .bind(source)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(config)
    }

    async fn list_source_intervals(&self) -> Result<Vec<SourceIntervalConfig>> {
        let configs = sqlx::query_as::<_, SourceIntervalConfig>(
            r#"
            SELECT source, interval_days, enabled, last_success_at, updated_at
            FROM source_intervals
            ORDER BY source
            "#,
        )
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(configs)
    }

    async fn disable_sources_except(&self, keep: &[String], now: i64) -> Result<u64> {
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE source_intervals SET enabled = 0, updated_at = ");
        qb.push_bind(now);
        qb.push(" WHERE enabled = 1");
        if !keep.is_empty() {
            qb.push(" AND source NOT IN (");
            let mut separated = qb.separated(", ");
            for source in keep {
                separated.push_bind(source.as_str());
            }
            separated.push_unseparated(")");
        }

        let _writer = self.write_lock.lock().await;
        let result = qb.build().execute(self.pool.as_ref()).await?;

        Ok(result.rows_affected())
    }

    async fn set_interval_days(&self, source: &str, interval_days: i64, now: i64) -> Result<bool> {
        let _writer = self.write_lock.lock().await;
        let result = sqlx::query(
            r#"
            UPDATE source_intervals
            SET interval_days = ?, updated_at = ?
            WHERE source = ?
            "#,
        )
        .bind(interval_days)
        .bind(now)
        .bind(source)
        .execute(self.pool.as_ref())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_success(&self, source: &str, at: i64) -> Result<bool> {
        let _writer = self.write_lock.lock().await;
        let result = sqlx::query(
            r#"
            UPDATE source_intervals
            SET last_success_at = ?, updated_at = ?
            WHERE source = ?
            "#,
        )
        .bind(at)
        .bind(at)
        .bind(source)
        .execute(self.pool.as_ref())
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
