//! Integration tests for the storage backends.
//!
//! Tests can be filtered by database backend using the DATABASE_BACKEND environment variable:
//! - `DATABASE_BACKEND=sqlite cargo test` - Run only SQLite tests
//! - `DATABASE_BACKEND=postgres cargo test` - Run only PostgreSQL tests
//! - By default, both backends are tested (PostgreSQL only when DATABASE_URL is set)

use blackwall::models::{
    EntryFilter, NewCollectionRun, NormalizedRecord, RunStatus, SECS_PER_DAY,
};
use blackwall::storage::{PostgresStorage, SqliteStorage, Storage};
use chrono::{TimeZone, Utc};
use rand::RngExt;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Get the database backend to test from environment variable
fn should_test_backend(backend: &str) -> bool {
    match std::env::var("DATABASE_BACKEND") {
        Ok(val) => val.to_lowercase() == backend.to_lowercase(),
        Err(_) => true,
    }
}

/// Helper to create SQLite test storage
async fn create_sqlite_storage() -> Arc<dyn Storage> {
    let storage = SqliteStorage::new("sqlite::memory:", 5).await.unwrap();
    storage.init().await.unwrap();
    Arc::new(storage)
}

/// Helper to create PostgreSQL test storage
async fn create_postgres_storage() -> Option<Arc<dyn Storage>> {
    let db_url = std::env::var("DATABASE_URL").ok()?;
    let storage = PostgresStorage::new(&db_url, 5).await.ok()?;
    storage.init().await.ok()?;
    Some(Arc::new(storage))
}

/// Storages to exercise; PostgreSQL data outlives a test run, so tests that
/// share it use random addresses and source names.
async fn storages() -> Vec<(&'static str, Arc<dyn Storage>)> {
    let mut storages = Vec::new();
    if should_test_backend("sqlite") {
        storages.push(("sqlite", create_sqlite_storage().await));
    }
    if should_test_backend("postgres") {
        if let Some(storage) = create_postgres_storage().await {
            storages.push(("postgres", storage));
        }
    }
    storages
}

fn day(y: i32, m: u32, d: u32) -> i64 {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap().timestamp()
}

fn random_ip() -> String {
    let mut rng = rand::rng();
    format!(
        "45.{}.{}.{}",
        rng.random_range(0..=255u8),
        rng.random_range(0..=255u8),
        rng.random_range(1..=254u8)
    )
}

fn random_source(prefix: &str) -> String {
    format!("{prefix}-{}", rand::rng().random_range(0..u32::MAX))
}

fn record(ip: &str, detection_date: i64) -> NormalizedRecord {
    NormalizedRecord {
        ip: ip.to_string(),
        attack_type: None,
        country: None,
        detection_date,
    }
}

#[tokio::test]
async fn test_merge_is_idempotent() {
    for (backend, storage) in storages().await {
        let ip = random_ip();
        let source = random_source("feed");
        let rec = NormalizedRecord {
            attack_type: Some("scan".to_string()),
            country: Some("US".to_string()),
            ..record(&ip, day(2024, 1, 1))
        };

        let first = storage
            .merge_batch(&source, 30, std::slice::from_ref(&rec), day(2024, 1, 2))
            .await
            .unwrap();
        assert_eq!((first.inserted, first.updated), (1, 0), "{backend}");
        let once = storage.get_entry(&ip).await.unwrap().unwrap();

        let second = storage
            .merge_batch(&source, 30, std::slice::from_ref(&rec), day(2024, 1, 3))
            .await
            .unwrap();
        assert_eq!((second.inserted, second.updated), (0, 1), "{backend}");
        let twice = storage.get_entry(&ip).await.unwrap().unwrap();

        assert_eq!(twice.updated_at, day(2024, 1, 3), "{backend}");
        assert_eq!(
            twice,
            blackwall::models::BlacklistEntry {
                updated_at: twice.updated_at,
                ..once.clone()
            },
            "{backend}: only updated_at may change"
        );
        assert_eq!(twice.sources, vec![source.clone()], "{backend}");
        assert_eq!(twice.expires_at, day(2024, 1, 1) + 30 * SECS_PER_DAY, "{backend}");
    }
}

#[tokio::test]
async fn test_merge_commutes_across_sources() {
    for (backend, storage) in storages().await {
        let (ip_ab, ip_ba) = (random_ip(), random_ip());
        let slow = random_source("slow");
        let fast = random_source("fast");
        let now = day(2024, 2, 1);

        let a = |ip: &str| record(ip, day(2024, 1, 1));
        let b = |ip: &str| record(ip, day(2024, 1, 5));

        storage.merge_batch(&slow, 90, &[a(&ip_ab)], now).await.unwrap();
        storage.merge_batch(&fast, 10, &[b(&ip_ab)], now).await.unwrap();

        storage.merge_batch(&fast, 10, &[b(&ip_ba)], now).await.unwrap();
        storage.merge_batch(&slow, 90, &[a(&ip_ba)], now).await.unwrap();

        let ab = storage.get_entry(&ip_ab).await.unwrap().unwrap();
        let ba = storage.get_entry(&ip_ba).await.unwrap().unwrap();

        for entry in [&ab, &ba] {
            assert_eq!(entry.detection_date, day(2024, 1, 1), "{backend}");
            assert_eq!(entry.ttl_days, 90, "{backend}");
            assert_eq!(entry.expires_at, day(2024, 3, 31), "{backend}");
        }
        let expected: BTreeSet<String> = [slow.clone(), fast.clone()].into_iter().collect();
        assert_eq!(ab.sources.iter().cloned().collect::<BTreeSet<_>>(), expected);
        assert_eq!(ab.sources, ba.sources, "{backend}");
    }
}

#[tokio::test]
async fn test_detection_date_never_regresses() {
    for (backend, storage) in storages().await {
        let ip = random_ip();
        let source = random_source("feed");

        storage
            .merge_batch(&source, 10, &[record(&ip, day(2024, 3, 1))], day(2024, 3, 2))
            .await
            .unwrap();
        storage
            .merge_batch(&source, 10, &[record(&ip, day(2024, 2, 1))], day(2024, 3, 3))
            .await
            .unwrap();
        storage
            .merge_batch(&source, 10, &[record(&ip, day(2024, 3, 15))], day(2024, 3, 16))
            .await
            .unwrap();

        let entry = storage.get_entry(&ip).await.unwrap().unwrap();
        assert_eq!(entry.detection_date, day(2024, 2, 1), "{backend}");
        assert_eq!(entry.expires_at, day(2024, 2, 11), "{backend}");
    }
}

#[tokio::test]
async fn test_attributes_only_overwritten_by_non_empty_values() {
    for (backend, storage) in storages().await {
        let ip = random_ip();
        let source = random_source("feed");
        let now = day(2024, 1, 10);

        let first = NormalizedRecord {
            attack_type: Some("ssh brute force".to_string()),
            country: Some("CN".to_string()),
            ..record(&ip, day(2024, 1, 1))
        };
        storage.merge_batch(&source, 30, &[first], now).await.unwrap();

        storage
            .merge_batch(&source, 30, &[record(&ip, day(2024, 1, 2))], now)
            .await
            .unwrap();
        let entry = storage.get_entry(&ip).await.unwrap().unwrap();
        assert_eq!(entry.attack_type.as_deref(), Some("ssh brute force"), "{backend}");
        assert_eq!(entry.country.as_deref(), Some("CN"), "{backend}");

        let relabelled = NormalizedRecord {
            attack_type: Some("web scan".to_string()),
            ..record(&ip, day(2024, 1, 3))
        };
        storage.merge_batch(&source, 30, &[relabelled], now).await.unwrap();
        let entry = storage.get_entry(&ip).await.unwrap().unwrap();
        assert_eq!(entry.attack_type.as_deref(), Some("web scan"), "{backend}");
        assert_eq!(entry.country.as_deref(), Some("CN"), "{backend}");
    }
}

#[tokio::test]
async fn test_recompute_active_flips_exactly_at_expiry() {
    for (backend, storage) in storages().await {
        let ip = random_ip();
        let source = random_source("feed");
        let detected = day(2024, 1, 1);
        let expires = detected + 10 * SECS_PER_DAY;
        let scope = vec![ip.clone()];

        storage
            .merge_batch(&source, 10, &[record(&ip, detected)], detected)
            .await
            .unwrap();

        let outcome = storage.recompute_active(expires - 1, Some(&scope)).await.unwrap();
        assert_eq!((outcome.activated, outcome.expired), (0, 0), "{backend}");
        assert!(storage.get_entry(&ip).await.unwrap().unwrap().is_active);

        let outcome = storage.recompute_active(expires, Some(&scope)).await.unwrap();
        assert_eq!((outcome.activated, outcome.expired), (0, 1), "{backend}");
        assert!(!storage.get_entry(&ip).await.unwrap().unwrap().is_active);

        // Nothing left to write on a second pass
        let outcome = storage.recompute_active(expires, Some(&scope)).await.unwrap();
        assert_eq!((outcome.activated, outcome.expired), (0, 0), "{backend}");
    }
}

#[tokio::test]
async fn test_fresh_report_reactivates_expired_entry() {
    for (backend, storage) in storages().await {
        let ip = random_ip();
        let old_source = random_source("old");
        let new_source = random_source("new");
        let scope = vec![ip.clone()];

        storage
            .merge_batch(&old_source, 10, &[record(&ip, day(2024, 1, 1))], day(2024, 1, 1))
            .await
            .unwrap();
        storage.recompute_active(day(2024, 2, 1), Some(&scope)).await.unwrap();
        assert!(!storage.get_entry(&ip).await.unwrap().unwrap().is_active);

        // A longer-lived source pushes expiry past now
        storage
            .merge_batch(&new_source, 90, &[record(&ip, day(2024, 1, 20))], day(2024, 2, 1))
            .await
            .unwrap();
        let outcome = storage.recompute_active(day(2024, 2, 1), Some(&scope)).await.unwrap();
        assert_eq!(outcome.activated, 1, "{backend}");

        let entry = storage.get_entry(&ip).await.unwrap().unwrap();
        assert!(entry.is_active, "{backend}");
        assert_eq!(entry.expires_at, day(2024, 1, 1) + 90 * SECS_PER_DAY, "{backend}");
    }
}

#[tokio::test]
async fn test_scoped_recompute_leaves_other_entries_alone_sqlite() {
    if !should_test_backend("sqlite") {
        return;
    }

    let storage = create_sqlite_storage().await;
    let records = vec![record("203.0.113.5", day(2024, 1, 1)), record("203.0.113.6", day(2024, 1, 1))];
    storage.merge_batch("feed", 10, &records, day(2024, 1, 1)).await.unwrap();

    let scope = vec!["203.0.113.5".to_string()];
    let outcome = storage.recompute_active(day(2024, 6, 1), Some(&scope)).await.unwrap();
    assert_eq!(outcome.expired, 1);
    assert!(storage.get_entry("203.0.113.6").await.unwrap().unwrap().is_active);

    let outcome = storage.recompute_active(day(2024, 6, 1), None).await.unwrap();
    assert_eq!(outcome.expired, 1);

    let expired = storage.list_entries(EntryFilter::Expired, 10, 0).await.unwrap();
    assert_eq!(expired.len(), 2);
    assert!(storage.list_entries(EntryFilter::Active, 10, 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_merges_for_same_ip() {
    for (backend, storage) in storages().await {
        let ip = random_ip();
        let sources = [random_source("a"), random_source("b")];

        let mut handles = vec![];
        for i in 0..10 {
            let storage = Arc::clone(&storage);
            let ip = ip.clone();
            let source = sources[i % 2].clone();
            let ttl = if i % 2 == 0 { 90 } else { 10 };
            handles.push(tokio::spawn(async move {
                storage
                    .merge_batch(&source, ttl, &[record(&ip, day(2024, 1, 1 + i as u32))], day(2024, 2, 1))
                    .await
            }));
        }

        let mut inserted = 0;
        for handle in handles {
            inserted += handle.await.unwrap().unwrap().inserted;
        }
        assert_eq!(inserted, 1, "{backend}: exactly one merge may insert");

        let entry = storage.get_entry(&ip).await.unwrap().unwrap();
        assert_eq!(entry.detection_date, day(2024, 1, 1), "{backend}");
        assert_eq!(entry.ttl_days, 90, "{backend}");
        let mut expected = sources.to_vec();
        expected.sort();
        assert_eq!(entry.sources, expected, "{backend}");
    }
}

#[tokio::test]
async fn test_run_log_round_trip() {
    for (backend, storage) in storages().await {
        let source = random_source("feed");
        let other = random_source("other");

        let run = |source: &str, started_at: i64, status: RunStatus| NewCollectionRun {
            source: source.to_string(),
            started_at,
            finished_at: started_at + 30,
            status,
            record_count: 100,
            inserted: 80,
            updated: 10,
            rejected: 10,
            error_summary: (status != RunStatus::Success).then(|| "fetch interrupted: request timed out".to_string()),
        };

        let first = storage.record_run(&run(&source, 1_000, RunStatus::Success)).await.unwrap();
        let second = storage.record_run(&run(&source, 2_000, RunStatus::Partial)).await.unwrap();
        storage.record_run(&run(&other, 3_000, RunStatus::Failed)).await.unwrap();
        assert!(second.id > first.id, "{backend}");
        assert_eq!(second.status, RunStatus::Partial);

        let runs = storage.recent_runs(Some(&source), 10).await.unwrap();
        assert_eq!(runs.len(), 2, "{backend}");
        assert_eq!(runs[0].id, second.id);
        assert_eq!(runs[0].error_summary.as_deref(), Some("fetch interrupted: request timed out"));
        assert_eq!(runs[1], first);

        let latest = storage.recent_runs(Some(&source), 1).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].id, second.id);
    }
}

#[tokio::test]
async fn test_source_interval_lifecycle() {
    for (backend, storage) in storages().await {
        let keep = random_source("keep");
        let gone = random_source("gone");

        let created = storage.ensure_source_interval(&keep, 90, true, 100).await.unwrap();
        assert_eq!(created.interval_days, 90, "{backend}");
        assert!(created.enabled);
        assert_eq!(created.last_success_at, None);
        storage.ensure_source_interval(&gone, 3, true, 100).await.unwrap();

        // Operator changes survive a later ensure
        assert!(storage.set_interval_days(&keep, 30, 200).await.unwrap());
        let ensured = storage.ensure_source_interval(&keep, 90, true, 300).await.unwrap();
        assert_eq!(ensured.interval_days, 30, "{backend}");

        assert!(storage.mark_success(&keep, 5_000).await.unwrap());
        assert!(!storage.mark_success(&random_source("missing"), 5_000).await.unwrap());
        assert!(!storage.set_interval_days(&random_source("missing"), 5, 200).await.unwrap());

        storage
            .disable_sources_except(&[keep.clone()], 400)
            .await
            .unwrap();
        let gone_row = storage.get_source_interval(&gone).await.unwrap().unwrap();
        assert!(!gone_row.enabled, "{backend}");

        let keep_row = storage.get_source_interval(&keep).await.unwrap().unwrap();
        assert!(keep_row.enabled, "{backend}");
        assert_eq!(keep_row.last_success_at, Some(5_000));

        let listed = storage.list_source_intervals().await.unwrap();
        assert!(listed.iter().any(|c| c.source == keep));
        assert!(listed.iter().any(|c| c.source == gone && !c.enabled));
    }
}

#[tokio::test]
async fn test_statistics_queries_sqlite() {
    if !should_test_backend("sqlite") {
        return;
    }

    let storage = create_sqlite_storage().await;
    let now = day(2024, 1, 20);
    let with_country = |ip: &str, date: i64, country: Option<&str>| NormalizedRecord {
        country: country.map(str::to_string),
        ..record(ip, date)
    };

    storage
        .merge_batch(
            "regtech",
            90,
            &[
                with_country("203.0.113.1", day(2024, 1, 1), Some("CN")),
                with_country("203.0.113.2", day(2024, 1, 1), Some("CN")),
                with_country("203.0.113.3", day(2024, 1, 2), None),
            ],
            now,
        )
        .await
        .unwrap();
    storage
        .merge_batch(
            "secudium",
            3,
            &[
                with_country("203.0.113.3", day(2024, 1, 2), Some("RU")),
                with_country("203.0.113.4", day(2024, 1, 3), None),
            ],
            now,
        )
        .await
        .unwrap();
    storage.recompute_active(now, None).await.unwrap();

    let summary = storage.summary().await.unwrap();
    assert_eq!((summary.total, summary.active, summary.expired), (4, 3, 1));

    let by_source: Vec<(String, i64)> = storage
        .count_by_source()
        .await
        .unwrap()
        .into_iter()
        .map(|c| (c.dimension, c.count))
        .collect();
    assert_eq!(by_source, vec![("regtech".to_string(), 3), ("secudium".to_string(), 2)]);

    let by_country: Vec<(String, i64)> = storage
        .count_by_country()
        .await
        .unwrap()
        .into_iter()
        .map(|c| (c.dimension, c.count))
        .collect();
    assert_eq!(
        by_country,
        vec![
            ("CN".to_string(), 2),
            ("RU".to_string(), 1),
            ("Unknown".to_string(), 1)
        ]
    );

    let by_day: Vec<(String, i64)> = storage
        .count_by_day(None)
        .await
        .unwrap()
        .into_iter()
        .map(|c| (c.dimension, c.count))
        .collect();
    assert_eq!(
        by_day,
        vec![
            ("2024-01-01".to_string(), 2),
            ("2024-01-02".to_string(), 1),
            ("2024-01-03".to_string(), 1)
        ]
    );

    let since = storage.count_by_day(Some(day(2024, 1, 2))).await.unwrap();
    assert_eq!(since.len(), 2);
}

#[tokio::test]
async fn test_list_entries_pagination_sqlite() {
    if !should_test_backend("sqlite") {
        return;
    }

    let storage = create_sqlite_storage().await;
    let records: Vec<NormalizedRecord> = (1..=5)
        .map(|i| record(&format!("203.0.113.{i}"), day(2024, 1, i)))
        .collect();
    storage.merge_batch("feed", 90, &records, day(2024, 1, 10)).await.unwrap();

    let page = storage.list_entries(EntryFilter::All, 2, 0).await.unwrap();
    let ips: Vec<&str> = page.iter().map(|e| e.ip.as_str()).collect();
    assert_eq!(ips, vec!["203.0.113.5", "203.0.113.4"]);

    let rest = storage.list_entries(EntryFilter::All, 10, 2).await.unwrap();
    assert_eq!(rest.len(), 3);
    assert_eq!(rest[0].sources, vec!["feed".to_string()]);
}
