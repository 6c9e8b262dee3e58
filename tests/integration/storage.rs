//! Both storage backends must behave the same

use assert_matches::assert_matches;
use chrono::{DateTime, Duration, Utc};
use fleetwatch::{
    Protocol,
    evaluation::{Comparator, Threshold},
    storage::{
        BucketSpan, MemoryBackend, NewResult, StorageBackend, StorageError, StoredValue,
        sqlite::SqliteBackend,
    },
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use crate::helpers::job_spec;

fn at(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

async fn records_and_cascades(storage: &dyn StorageBackend) {
    let group = storage.create_group("core", "core network").await.unwrap();
    assert_matches!(
        storage.create_group("core", "again").await,
        Err(StorageError::Conflict(_))
    );

    let monitor = storage
        .create_monitor("routers", "edge routers", Some(group.id))
        .await
        .unwrap();
    let _other = storage.create_monitor("misc", "", None).await.unwrap();
    let in_group = storage.list_monitors(Some(group.id)).await.unwrap();
    assert_eq!(in_group, vec![monitor.clone()]);
    assert_eq!(storage.list_monitors(None).await.unwrap().len(), 2);

    let job = storage
        .create_job(monitor.id, &job_spec("east", 30))
        .await
        .unwrap();
    assert_eq!(storage.get_job(job.id).await.unwrap(), Some(job.clone()));
    assert_matches!(
        storage.create_job(9999, &job_spec("east", 30)).await,
        Err(StorageError::NotFound(_))
    );

    let mut changed = job_spec("west", 60);
    changed.protocol = Protocol::Snmp;
    assert!(storage.update_job(job.id, &changed).await.unwrap());
    let stored = storage.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.spec, changed);

    let evaluation = storage
        .create_evaluation(job.id, Comparator::GreaterOrEqual, &Threshold::Float(0.5))
        .await
        .unwrap();
    assert_eq!(
        storage.list_evaluations(job.id).await.unwrap(),
        vec![evaluation.clone()]
    );
    assert!(
        storage
            .update_evaluation(evaluation.id, Comparator::Equal, &Threshold::Text("up".into()))
            .await
            .unwrap()
    );
    let updated = storage.get_evaluation(evaluation.id).await.unwrap().unwrap();
    assert_eq!(updated.threshold, Threshold::Text("up".into()));

    // Jobs and their evaluations go with their monitor.
    assert!(storage.remove_monitor("routers").await.unwrap());
    assert_eq!(storage.get_job(job.id).await.unwrap(), None);
    assert!(storage.list_evaluations(job.id).await.unwrap().is_empty());
    assert!(storage.list_all_jobs().await.unwrap().is_empty());

    assert!(storage.remove_group("core").await.unwrap());
    assert!(!storage.remove_group("core").await.unwrap());
}

async fn results_and_buckets(storage: &dyn StorageBackend) {
    let job_id = 42;
    let start = at("2024-06-03T10:00:00Z");

    for (minute, value) in [(1, 2.0), (3, 4.0), (12, 10.0)] {
        storage
            .insert_result(NewResult {
                job_id,
                recorded: start + Duration::minutes(minute),
                value: Some(StoredValue::Float(value)),
                parent: None,
            })
            .await
            .unwrap();
    }
    let parent = storage
        .insert_result(NewResult {
            job_id,
            recorded: start + Duration::minutes(70),
            value: None,
            parent: None,
        })
        .await
        .unwrap();
    storage
        .insert_result(NewResult {
            job_id,
            recorded: start + Duration::minutes(70),
            value: Some(StoredValue::Int(5)),
            parent: Some(parent),
        })
        .await
        .unwrap();

    let rows = storage
        .query_results(job_id, start, start + Duration::minutes(12))
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows[0].recorded < rows[1].recorded);

    let hour = storage
        .query_buckets(job_id, BucketSpan::Hour, start)
        .await
        .unwrap();
    assert_eq!(hour.len(), 2);
    assert_eq!(hour[0].start, start);
    assert_eq!(hour[0].value, StoredValue::Float(3.0));
    assert_eq!(hour[1].start, start + Duration::minutes(10));

    let day = storage
        .query_buckets(job_id, BucketSpan::Day, start + Duration::hours(5))
        .await
        .unwrap();
    assert_eq!(day.len(), 2);
    assert_eq!(day[0].start, start);
    assert_eq!(day[1].value, StoredValue::Int(5));

    let week = storage
        .query_buckets(job_id, BucketSpan::Week, start - Duration::days(2))
        .await
        .unwrap();
    assert_eq!(week.len(), 1);
    assert_eq!(week[0].start, at("2024-06-03T00:00:00Z"));

    assert!(storage.health_check().await.unwrap().healthy);
}

#[tokio::test]
async fn test_memory_backend_records() {
    records_and_cascades(&MemoryBackend::new()).await;
}

#[tokio::test]
async fn test_memory_backend_results() {
    results_and_buckets(&MemoryBackend::new()).await;
}

#[tokio::test]
async fn test_sqlite_backend_records() {
    let dir = TempDir::new().unwrap();
    let storage = SqliteBackend::new(dir.path().join("fleet.db")).await.unwrap();
    records_and_cascades(&storage).await;
}

#[tokio::test]
async fn test_sqlite_backend_results() {
    let dir = TempDir::new().unwrap();
    let storage = SqliteBackend::new(dir.path().join("fleet.db")).await.unwrap();
    results_and_buckets(&storage).await;
}

#[tokio::test]
async fn test_sqlite_records_survive_reopening() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fleet.db");

    let job_id = {
        let storage = SqliteBackend::new(&path).await.unwrap();
        let monitor = storage.create_monitor("ups", "", None).await.unwrap();
        storage
            .create_job(monitor.id, &job_spec("default", 10))
            .await
            .unwrap()
            .id
    };

    let storage = SqliteBackend::new(&path).await.unwrap();
    let jobs = storage.list_all_jobs().await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, job_id);
    assert_eq!(jobs[0].spec, job_spec("default", 10));
}
