//! Storage backend trait definition
//!
//! This module defines the `StorageBackend` trait implemented by the
//! in-memory and SQLite backends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::JobId;
use crate::evaluation::{Comparator, Threshold};

use super::error::StorageResult;
use super::schema::{
    BucketSpan, EvaluationRecord, Group, JobRecord, JobSpec, Monitor, NewResult, ResultBucket,
    ResultRow, bucketize,
};

/// Health status of the storage backend
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Is the backend operational?
    pub healthy: bool,

    /// Human-readable status message
    pub message: String,
}

/// Trait for persistent storage backends
///
/// Administrative records (groups, monitors, jobs, evaluations) are looked
/// up by name or id; `update_*` and `remove_*` report whether a record was
/// touched. Result queries are half-open: `[start, end)`.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync` as they are shared between the
/// controller or aggregator actor and the tasks it spawns.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get_group(&self, name: &str) -> StorageResult<Option<Group>>;

    async fn list_groups(&self) -> StorageResult<Vec<Group>>;

    /// Fails with `Conflict` if the name is taken.
    async fn create_group(&self, name: &str, description: &str) -> StorageResult<Group>;

    async fn update_group(&self, id: i64, name: &str, description: &str) -> StorageResult<bool>;

    async fn remove_group(&self, name: &str) -> StorageResult<bool>;

    async fn get_monitor(&self, name: &str) -> StorageResult<Option<Monitor>>;

    /// All monitors, or those of one group.
    async fn list_monitors(&self, group_id: Option<i64>) -> StorageResult<Vec<Monitor>>;

    /// Fails with `Conflict` if the name is taken.
    async fn create_monitor(
        &self,
        name: &str,
        description: &str,
        group_id: Option<i64>,
    ) -> StorageResult<Monitor>;

    async fn update_monitor(
        &self,
        id: i64,
        name: &str,
        description: &str,
        group_id: Option<i64>,
    ) -> StorageResult<bool>;

    /// Removes the monitor together with its jobs.
    async fn remove_monitor(&self, name: &str) -> StorageResult<bool>;

    async fn get_job(&self, id: JobId) -> StorageResult<Option<JobRecord>>;

    async fn list_jobs(&self, monitor_id: i64) -> StorageResult<Vec<JobRecord>>;

    /// Every job, used by the controller to fill its pool at startup.
    async fn list_all_jobs(&self) -> StorageResult<Vec<JobRecord>>;

    async fn create_job(&self, monitor_id: i64, spec: &JobSpec) -> StorageResult<JobRecord>;

    async fn update_job(&self, id: JobId, spec: &JobSpec) -> StorageResult<bool>;

    /// Removes the job together with its evaluations.
    async fn remove_job(&self, id: JobId) -> StorageResult<bool>;

    async fn get_evaluation(&self, id: i64) -> StorageResult<Option<EvaluationRecord>>;

    async fn list_evaluations(&self, job_id: JobId) -> StorageResult<Vec<EvaluationRecord>>;

    async fn create_evaluation(
        &self,
        job_id: JobId,
        comparator: Comparator,
        threshold: &Threshold,
    ) -> StorageResult<EvaluationRecord>;

    async fn update_evaluation(
        &self,
        id: i64,
        comparator: Comparator,
        threshold: &Threshold,
    ) -> StorageResult<bool>;

    async fn remove_evaluation(&self, id: i64) -> StorageResult<bool>;

    /// Stores one row and returns its id.
    async fn insert_result(&self, result: NewResult) -> StorageResult<i64>;

    /// Rows of a job recorded in `[start, end)`, oldest first.
    async fn query_results(
        &self,
        job_id: JobId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<ResultRow>>;

    /// Averages of a job's results over the buckets of `span`.
    async fn query_buckets(
        &self,
        job_id: JobId,
        span: BucketSpan,
        start: DateTime<Utc>,
    ) -> StorageResult<Vec<ResultBucket>> {
        let (origin, width, count) = span.layout(start);
        let end = origin + width * count as i32;
        let rows = self.query_results(job_id, origin, end).await?;
        Ok(bucketize(&rows, origin, width, count))
    }

    async fn health_check(&self) -> StorageResult<HealthStatus>;
}
