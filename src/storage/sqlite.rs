//! SQLite storage backend implementation
//!
//! ## Features
//!
//! - **Embedded**: No separate database server required
//! - **WAL mode**: Readers (controller queries) do not block the aggregator's writes
//! - **Migrations**: Automatic schema versioning with sqlx
//!
//! Timestamps are stored as Unix milliseconds. Thresholds and result values
//! use one nullable column per scalar type.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, instrument};

use crate::JobId;
use crate::evaluation::{Comparator, Threshold};

use super::backend::{HealthStatus, StorageBackend};
use super::error::{StorageError, StorageResult};
use super::schema::{
    EvaluationRecord, Group, JobRecord, JobSpec, Monitor, NewResult, ResultRow, StoredValue,
};

pub struct SqliteBackend {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteBackend {
    /// Opens (creating if missing) the database file and runs migrations.
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite backend at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StorageError::MigrationFailed(e.to_string()))?;

        info!("database migrations complete");

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }

    fn timestamp_to_millis(dt: &DateTime<Utc>) -> i64 {
        dt.timestamp_millis()
    }

    fn millis_to_timestamp(millis: i64) -> StorageResult<DateTime<Utc>> {
        DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| StorageError::Corrupt(format!("timestamp {millis}")))
    }
}

fn group_from_row(row: &SqliteRow) -> Group {
    Group {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
    }
}

fn monitor_from_row(row: &SqliteRow) -> Monitor {
    Monitor {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        group_id: row.get("group_id"),
    }
}

fn job_from_row(row: &SqliteRow) -> StorageResult<JobRecord> {
    let protocol: String = row.get("protocol");
    let frequency: i64 = row.get("frequency");
    Ok(JobRecord {
        id: row.get("id"),
        monitor_id: row.get("monitor_id"),
        spec: JobSpec {
            address: row.get("address"),
            protocol: protocol
                .parse()
                .map_err(|_| StorageError::Corrupt(format!("protocol {protocol}")))?,
            frequency: frequency.max(0) as u64,
            domain: row.get("domain"),
            resource: row.get("resource"),
            segment: row.get("segment"),
        },
    })
}

/// Reads the typed value columns shared by evaluations and results.
fn stored_value(row: &SqliteRow) -> Option<StoredValue> {
    let int: Option<i64> = row.get("int_value");
    let float: Option<f64> = row.get("float_value");
    let string: Option<String> = row.get("string_value");
    int.map(StoredValue::Int)
        .or(float.map(StoredValue::Float))
        .or(string.map(StoredValue::Text))
}

fn value_columns(value: Option<&StoredValue>) -> (Option<i64>, Option<f64>, Option<String>) {
    match value {
        Some(StoredValue::Int(v)) => (Some(*v), None, None),
        Some(StoredValue::Float(v)) => (None, Some(*v), None),
        Some(StoredValue::Text(v)) => (None, None, Some(v.clone())),
        None => (None, None, None),
    }
}

fn threshold_value(threshold: &Threshold) -> StoredValue {
    match threshold {
        Threshold::Int(v) => StoredValue::Int(*v),
        Threshold::Float(v) => StoredValue::Float(*v),
        Threshold::Text(v) => StoredValue::Text(v.clone()),
    }
}

fn evaluation_from_row(row: &SqliteRow) -> StorageResult<EvaluationRecord> {
    let comparator: String = row.get("comparator");
    let id: i64 = row.get("id");
    let threshold = match stored_value(row) {
        Some(StoredValue::Int(v)) => Threshold::Int(v),
        Some(StoredValue::Float(v)) => Threshold::Float(v),
        Some(StoredValue::Text(v)) => Threshold::Text(v),
        None => return Err(StorageError::Corrupt(format!("evaluation {id} has no threshold"))),
    };
    Ok(EvaluationRecord {
        id,
        job_id: row.get("job_id"),
        comparator: comparator
            .parse()
            .map_err(|_| StorageError::Corrupt(format!("comparator {comparator}")))?,
        threshold,
    })
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn get_group(&self, name: &str) -> StorageResult<Option<Group>> {
        let row = sqlx::query("SELECT id, name, description FROM groups WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(group_from_row))
    }

    async fn list_groups(&self) -> StorageResult<Vec<Group>> {
        let rows = sqlx::query("SELECT id, name, description FROM groups ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(group_from_row).collect())
    }

    #[instrument(skip(self))]
    async fn create_group(&self, name: &str, description: &str) -> StorageResult<Group> {
        let id = sqlx::query("INSERT INTO groups (name, description) VALUES (?, ?)")
            .bind(name)
            .bind(description)
            .execute(&self.pool)
            .await?
            .last_insert_rowid();
        Ok(Group {
            id,
            name: name.to_string(),
            description: description.to_string(),
        })
    }

    async fn update_group(&self, id: i64, name: &str, description: &str) -> StorageResult<bool> {
        let result = sqlx::query("UPDATE groups SET name = ?, description = ? WHERE id = ?")
            .bind(name)
            .bind(description)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_group(&self, name: &str) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM groups WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_monitor(&self, name: &str) -> StorageResult<Option<Monitor>> {
        let row =
            sqlx::query("SELECT id, name, description, group_id FROM monitors WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.as_ref().map(monitor_from_row))
    }

    async fn list_monitors(&self, group_id: Option<i64>) -> StorageResult<Vec<Monitor>> {
        let rows = match group_id {
            Some(group_id) => {
                sqlx::query(
                    "SELECT id, name, description, group_id FROM monitors WHERE group_id = ? ORDER BY id",
                )
                .bind(group_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT id, name, description, group_id FROM monitors ORDER BY id")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows.iter().map(monitor_from_row).collect())
    }

    #[instrument(skip(self))]
    async fn create_monitor(
        &self,
        name: &str,
        description: &str,
        group_id: Option<i64>,
    ) -> StorageResult<Monitor> {
        let id = sqlx::query("INSERT INTO monitors (name, description, group_id) VALUES (?, ?, ?)")
            .bind(name)
            .bind(description)
            .bind(group_id)
            .execute(&self.pool)
            .await?
            .last_insert_rowid();
        Ok(Monitor {
            id,
            name: name.to_string(),
            description: description.to_string(),
            group_id,
        })
    }

    async fn update_monitor(
        &self,
        id: i64,
        name: &str,
        description: &str,
        group_id: Option<i64>,
    ) -> StorageResult<bool> {
        let result = sqlx::query(
            "UPDATE monitors SET name = ?, description = ?, group_id = ? WHERE id = ?",
        )
        .bind(name)
        .bind(description)
        .bind(group_id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_monitor(&self, name: &str) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM monitors WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_job(&self, id: JobId) -> StorageResult<Option<JobRecord>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_jobs(&self, monitor_id: i64) -> StorageResult<Vec<JobRecord>> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE monitor_id = ? ORDER BY id")
            .bind(monitor_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn list_all_jobs(&self) -> StorageResult<Vec<JobRecord>> {
        let rows = sqlx::query("SELECT * FROM jobs ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self, spec))]
    async fn create_job(&self, monitor_id: i64, spec: &JobSpec) -> StorageResult<JobRecord> {
        let id = sqlx::query(
            r#"
            INSERT INTO jobs (monitor_id, address, protocol, frequency, domain, resource, segment)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(monitor_id)
        .bind(&spec.address)
        .bind(spec.protocol.as_str())
        .bind(spec.frequency as i64)
        .bind(&spec.domain)
        .bind(&spec.resource)
        .bind(&spec.segment)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                StorageError::NotFound(format!("monitor {monitor_id}"))
            }
            other => other.into(),
        })?
        .last_insert_rowid();
        Ok(JobRecord {
            id,
            monitor_id,
            spec: spec.clone(),
        })
    }

    async fn update_job(&self, id: JobId, spec: &JobSpec) -> StorageResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET address = ?, protocol = ?, frequency = ?, domain = ?, resource = ?, segment = ?
            WHERE id = ?
            "#,
        )
        .bind(&spec.address)
        .bind(spec.protocol.as_str())
        .bind(spec.frequency as i64)
        .bind(&spec.domain)
        .bind(&spec.resource)
        .bind(&spec.segment)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_job(&self, id: JobId) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_evaluation(&self, id: i64) -> StorageResult<Option<EvaluationRecord>> {
        let row = sqlx::query("SELECT * FROM evaluations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(evaluation_from_row).transpose()
    }

    async fn list_evaluations(&self, job_id: JobId) -> StorageResult<Vec<EvaluationRecord>> {
        let rows = sqlx::query("SELECT * FROM evaluations WHERE job_id = ? ORDER BY id")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(evaluation_from_row).collect()
    }

    async fn create_evaluation(
        &self,
        job_id: JobId,
        comparator: Comparator,
        threshold: &Threshold,
    ) -> StorageResult<EvaluationRecord> {
        let value = threshold_value(threshold);
        let (int, float, string) = value_columns(Some(&value));
        let id = sqlx::query(
            r#"
            INSERT INTO evaluations (job_id, comparator, int_value, float_value, string_value)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(job_id)
        .bind(comparator.as_str())
        .bind(int)
        .bind(float)
        .bind(string)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                StorageError::NotFound(format!("job {job_id}"))
            }
            other => other.into(),
        })?
        .last_insert_rowid();
        Ok(EvaluationRecord {
            id,
            job_id,
            comparator,
            threshold: threshold.clone(),
        })
    }

    async fn update_evaluation(
        &self,
        id: i64,
        comparator: Comparator,
        threshold: &Threshold,
    ) -> StorageResult<bool> {
        let value = threshold_value(threshold);
        let (int, float, string) = value_columns(Some(&value));
        let result = sqlx::query(
            r#"
            UPDATE evaluations SET comparator = ?, int_value = ?, float_value = ?, string_value = ?
            WHERE id = ?
            "#,
        )
        .bind(comparator.as_str())
        .bind(int)
        .bind(float)
        .bind(string)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_evaluation(&self, id: i64) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM evaluations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_result(&self, result: NewResult) -> StorageResult<i64> {
        let (int, float, string) = value_columns(result.value.as_ref());
        let id = sqlx::query(
            r#"
            INSERT INTO results (job_id, recorded, int_value, float_value, string_value, parent_id)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(result.job_id)
        .bind(Self::timestamp_to_millis(&result.recorded))
        .bind(int)
        .bind(float)
        .bind(string)
        .bind(result.parent)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn query_results(
        &self,
        job_id: JobId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<ResultRow>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM results
            WHERE job_id = ? AND recorded >= ? AND recorded < ?
            ORDER BY recorded ASC, id ASC
            "#,
        )
        .bind(job_id)
        .bind(Self::timestamp_to_millis(&start))
        .bind(Self::timestamp_to_millis(&end))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ResultRow {
                    id: row.get("id"),
                    job_id: row.get("job_id"),
                    recorded: Self::millis_to_timestamp(row.get("recorded"))?,
                    value: stored_value(row),
                    parent: row.get("parent_id"),
                })
            })
            .collect()
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let count: i64 = sqlx::query("SELECT COUNT(*) AS count FROM results")
            .fetch_one(&self.pool)
            .await?
            .get("count");
        Ok(HealthStatus {
            healthy: true,
            message: format!("SQLite at {}: {} results", self.db_path, count),
        })
    }
}
