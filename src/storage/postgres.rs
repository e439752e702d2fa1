use crate::models::{
    BlacklistEntry, CollectionRun, CollectionRunRow, EntryFilter, EntryRow, MergeCounts,
    NewCollectionRun, NormalizedRecord, SourceIntervalConfig, SECS_PER_DAY,
};
use crate::storage::{DimensionCount, ExpirationOutcome, Storage, StorageResult, SummaryCounts};
use anyhow::Result;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;

const ENTRY_SELECT: &str = r#"
    SELECT e.ip, e.attack_type, e.country, e.detection_date, e.ttl_days, e.expires_at,
           e.is_active, e.created_at, e.updated_at,
           string_agg(s.source, ',' ORDER BY s.source) AS sources
    FROM blacklist_entries e
    LEFT JOIN entry_sources s ON s.ip = e.ip
"#;

pub struct PostgresStorage {
    pool: Arc<PgPool>,
}

impl PostgresStorage {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS blacklist_entries (
                ip TEXT PRIMARY KEY,
                attack_type TEXT,
                country TEXT,
                detection_date BIGINT NOT NULL,
                ttl_days BIGINT NOT NULL,
                expires_at BIGINT NOT NULL,
                is_active BOOLEAN NOT NULL DEFAULT TRUE,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL
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

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entry_sources (
                ip TEXT NOT NULL REFERENCES blacklist_entries(ip),
                source TEXT NOT NULL,
                detection_date BIGINT NOT NULL,
                first_seen BIGINT NOT NULL,
                last_seen BIGINT NOT NULL,
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
                id BIGSERIAL PRIMARY KEY,
                source TEXT NOT NULL,
                started_at BIGINT NOT NULL,
                finished_at BIGINT NOT NULL,
                status TEXT NOT NULL,
                record_count BIGINT NOT NULL DEFAULT 0,
                inserted BIGINT NOT NULL DEFAULT 0,
                updated BIGINT NOT NULL DEFAULT 0,
                rejected BIGINT NOT NULL DEFAULT 0,
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
                interval_days BIGINT NOT NULL,
                enabled BOOLEAN NOT NULL DEFAULT TRUE,
                last_success_at BIGINT,
                updated_at BIGINT NOT NULL
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

        // Row locks are taken in the caller's (ascending ip) order
        let mut tx = self.pool.begin().await?;

        for record in records {
            let inserted = sqlx::query_scalar::<_, bool>(
                r#"
                INSERT INTO blacklist_entries
                    (ip, attack_type, country, detection_date, ttl_days, expires_at,
                     is_active, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, TRUE, $7, $7)
                ON CONFLICT (ip) DO UPDATE SET
                    attack_type = COALESCE(EXCLUDED.attack_type, blacklist_entries.attack_type),
                    country = COALESCE(EXCLUDED.country, blacklist_entries.country),
                    detection_date = LEAST(blacklist_entries.detection_date, EXCLUDED.detection_date),
                    ttl_days = GREATEST(blacklist_entries.ttl_days, EXCLUDED.ttl_days),
                    expires_at = LEAST(blacklist_entries.detection_date, EXCLUDED.detection_date)
                        + GREATEST(blacklist_entries.ttl_days, EXCLUDED.ttl_days) * 86400,
                    updated_at = EXCLUDED.updated_at
                RETURNING (xmax = 0)
                "#,
            )
            .bind(&record.ip)
            .bind(&record.attack_type)
            .bind(&record.country)
            .bind(record.detection_date)
            .bind(ttl_days)
            .bind(record.detection_date + ttl_days * SECS_PER_DAY)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO entry_sources (ip, source, detection_date, first_seen, last_seen)
                VALUES ($1, $2, $3, $4, $4)
                ON CONFLICT (ip, source) DO UPDATE SET
                    detection_date = LEAST(entry_sources.detection_date, EXCLUDED.detection_date),
                    last_seen = EXCLUDED.last_seen
                "#,
            )
            .bind(&record.ip)
            .bind(source)
            .bind(record.detection_date)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            if inserted {
                counts.inserted += 1;
            } else {
                counts.updated += 1;
            }
        }

        tx.commit().await?;

        Ok(counts)
    }

    async fn get_entry(&self, ip: &str) -> Result<Option<BlacklistEntry>> {
        let query = format!("{ENTRY_SELECT} WHERE e.ip = $1 GROUP BY e.ip");
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
            EntryFilter::Active => "WHERE e.is_active",
            EntryFilter::Expired => "WHERE NOT e.is_active",
        };
        let query = format!(
            "{ENTRY_SELECT} {condition} GROUP BY e.ip ORDER BY e.detection_date DESC, e.ip LIMIT $1 OFFSET $2"
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
        let mut tx = self.pool.begin().await?;

        let (expired, activated) = match scope {
            None => {
                let expired = sqlx::query(
                    "UPDATE blacklist_entries SET is_active = FALSE WHERE is_active AND expires_at <= $1",
                )
                .bind(now)
                .execute(&mut *tx)
                .await?;
                let activated = sqlx::query(
                    "UPDATE blacklist_entries SET is_active = TRUE WHERE NOT is_active AND expires_at > $1",
                )
                .bind(now)
                .execute(&mut *tx)
                .await?;
                (expired, activated)
            }
            Some([]) => return Ok(ExpirationOutcome::default()),
            Some(ips) => {
                let expired = sqlx::query(
                    r#"
                    UPDATE blacklist_entries SET is_active = FALSE
                    WHERE is_active AND expires_at <= $1 AND ip = ANY($2)
                    "#,
                )
                .bind(now)
                .bind(ips)
                .execute(&mut *tx)
                .await?;
                let activated = sqlx::query(
                    r#"
                    UPDATE blacklist_entries SET is_active = TRUE
                    WHERE NOT is_active AND expires_at > $1 AND ip = ANY($2)
                    "#,
                )
                .bind(now)
                .bind(ips)
                .execute(&mut *tx)
                .await?;
                (expired, activated)
            }
        };

        tx.commit().await?;

        Ok(ExpirationOutcome {
            activated: activated.rows_affected(),
            expired: expired.rows_affected(),
        })
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
            SELECT to_char(to_timestamp(detection_date) AT TIME ZONE 'UTC', 'YYYY-MM-DD') AS dimension,
                   COUNT(*) AS count
            FROM blacklist_entries
            WHERE $1::BIGINT IS NULL OR detection_date >= $1
            GROUP BY dimension
            ORDER BY dimension
            "#,
        )
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
                   COUNT(*) FILTER (WHERE is_active) AS active,
                   COUNT(*) FILTER (WHERE NOT is_active) AS expired
            FROM blacklist_entries
            "#,
        )
        .fetch_one(self.pool.as_ref())
        .await?;

        Ok(summary)
    }

    async fn record_run(&self, run: &NewCollectionRun) -> Result<CollectionRun> {
        let row = sqlx::query_as::<_, CollectionRunRow>(
            r#"
            INSERT INTO collection_runs
                (source, started_at, finished_at, status, record_count, inserted, updated,
                 rejected, error_summary)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
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
            WHERE $1::TEXT IS NULL OR source = $1
            ORDER BY started_at DESC, id DESC
            LIMIT $2
            "#,
        )
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
        sqlx::query(
            r#"
            INSERT INTO source_intervals (source, interval_days, enabled, last_success_at, updated_at)
            VALUES ($1, $2, $3, NULL, $4)
            ON CONFLICT (source) DO UPDATE SET
                enabled = EXCLUDED.enabled,
                updated_at = EXCLUDED.updated_at
            WHERE source_intervals.enabled <> EXCLUDED.enabled
            "#,
        )
        .bind(source)
        .bind(interval_days)
        .bind(enabled)
        .bind(now)
        .execute(self.pool.as_ref())
        .await?;

        let config = sqlx::query_as::<_, SourceIntervalConfig>(
            r#"
            SELECT source, interval_days, enabled, last_success_at, updated_at
            FROM source_intervals
            WHERE source = $1
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
            WHERE source = $1
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
        let result = sqlx::query(
            r#"
            UPDATE source_intervals
            SET enabled = FALSE, updated_at = $1
            WHERE enabled AND NOT (source = ANY($2))
            "#,
        )
        .bind(now)
        .bind(keep)
        .execute(self.pool.as_ref())
        .await?;

        Ok(result.rows_affected())
    }

    async fn set_interval_days(&self, source: &str, interval_days: i64, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE source_intervals
            SET interval_days = $1, updated_at = $2
            WHERE source = $3
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
        let result = sqlx::query(
            r#"
            UPDATE source_intervals
            SET last_success_at = $1, updated_at = $1
            WHERE source = $2
            "#,
        )
        .bind(at)
        .bind(source)
        .execute(self.pool.as_ref())
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
