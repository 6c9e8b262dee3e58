//! In-memory storage backend (no persistence)
//!
//! Keeps every record in plain vectors behind a lock. Used when no storage is
//! configured and throughout the tests. All data is lost on restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use crate::JobId;
use crate::evaluation::{Comparator, Threshold};

use super::backend::{HealthStatus, StorageBackend};
use super::error::{StorageError, StorageResult};
use super::schema::{EvaluationRecord, Group, JobRecord, JobSpec, Monitor, NewResult, ResultRow};

#[derive(Debug, Default)]
struct Tables {
    groups: Vec<Group>,
    monitors: Vec<Monitor>,
    jobs: Vec<JobRecord>,
    evaluations: Vec<EvaluationRecord>,
    results: Vec<ResultRow>,
    next_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    tables: RwLock<Tables>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get_group(&self, name: &str) -> StorageResult<Option<Group>> {
        let tables = self.tables.read();
        Ok(tables.groups.iter().find(|g| g.name == name).cloned())
    }

    async fn list_groups(&self) -> StorageResult<Vec<Group>> {
        Ok(self.tables.read().groups.clone())
    }

    async fn create_group(&self, name: &str, description: &str) -> StorageResult<Group> {
        let mut tables = self.tables.write();
        if tables.groups.iter().any(|g| g.name == name) {
            return Err(StorageError::Conflict(format!("group {name}")));
        }
        let group = Group {
            id: tables.next_id(),
            name: name.to_string(),
            description: description.to_string(),
        };
        tables.groups.push(group.clone());
        Ok(group)
    }

    async fn update_group(&self, id: i64, name: &str, description: &str) -> StorageResult<bool> {
        let mut tables = self.tables.write();
        if tables.groups.iter().any(|g| g.name == name && g.id != id) {
            return Err(StorageError::Conflict(format!("group {name}")));
        }
        let Some(group) = tables.groups.iter_mut().find(|g| g.id == id) else {
            return Ok(false);
        };
        group.name = name.to_string();
        group.description = description.to_string();
        Ok(true)
    }

    async fn remove_group(&self, name: &str) -> StorageResult<bool> {
        let mut tables = self.tables.write();
        let Some(position) = tables.groups.iter().position(|g| g.name == name) else {
            return Ok(false);
        };
        let group = tables.groups.remove(position);
        for monitor in tables.monitors.iter_mut() {
            if monitor.group_id == Some(group.id) {
                monitor.group_id = None;
            }
        }
        Ok(true)
    }

    async fn get_monitor(&self, name: &str) -> StorageResult<Option<Monitor>> {
        let tables = self.tables.read();
        Ok(tables.monitors.iter().find(|m| m.name == name).cloned())
    }

    async fn list_monitors(&self, group_id: Option<i64>) -> StorageResult<Vec<Monitor>> {
        let tables = self.tables.read();
        Ok(tables
            .monitors
            .iter()
            .filter(|m| group_id.is_none() || m.group_id == group_id)
            .cloned()
            .collect())
    }

    async fn create_monitor(
        &self,
        name: &str,
        description: &str,
        group_id: Option<i64>,
    ) -> StorageResult<Monitor> {
        let mut tables = self.tables.write();
        if tables.monitors.iter().any(|m| m.name == name) {
            return Err(StorageError::Conflict(format!("monitor {name}")));
        }
        let monitor = Monitor {
            id: tables.next_id(),
            name: name.to_string(),
            description: description.to_string(),
            group_id,
        };
        tables.monitors.push(monitor.clone());
        Ok(monitor)
    }

    async fn update_monitor(
        &self,
        id: i64,
        name: &str,
        description: &str,
        group_id: Option<i64>,
    ) -> StorageResult<bool> {
        let mut tables = self.tables.write();
        if tables.monitors.iter().any(|m| m.name == name && m.id != id) {
            return Err(StorageError::Conflict(format!("monitor {name}")));
        }
        let Some(monitor) = tables.monitors.iter_mut().find(|m| m.id == id) else {
            return Ok(false);
        };
        monitor.name = name.to_string();
        monitor.description = description.to_string();
        monitor.group_id = group_id;
        Ok(true)
    }

    async fn remove_monitor(&self, name: &str) -> StorageResult<bool> {
        let mut tables = self.tables.write();
        let Some(position) = tables.monitors.iter().position(|m| m.name == name) else {
            return Ok(false);
        };
        let monitor = tables.monitors.remove(position);
        let removed: Vec<JobId> = tables
            .jobs
            .iter()
            .filter(|j| j.monitor_id == monitor.id)
            .map(|j| j.id)
            .collect();
        tables.jobs.retain(|j| j.monitor_id != monitor.id);
        tables.evaluations.retain(|e| !removed.contains(&e.job_id));
        debug!("removed monitor {name} with {} jobs", removed.len());
        Ok(true)
    }

    async fn get_job(&self, id: JobId) -> StorageResult<Option<JobRecord>> {
        let tables = self.tables.read();
        Ok(tables.jobs.iter().find(|j| j.id == id).cloned())
    }

    async fn list_jobs(&self, monitor_id: i64) -> StorageResult<Vec<JobRecord>> {
        let tables = self.tables.read();
        Ok(tables
            .jobs
            .iter()
            .filter(|j| j.monitor_id == monitor_id)
            .cloned()
            .collect())
    }

    async fn list_all_jobs(&self) -> StorageResult<Vec<JobRecord>> {
        Ok(self.tables.read().jobs.clone())
    }

    async fn create_job(&self, monitor_id: i64, spec: &JobSpec) -> StorageResult<JobRecord> {
        let mut tables = self.tables.write();
        if !tables.monitors.iter().any(|m| m.id == monitor_id) {
            return Err(StorageError::NotFound(format!("monitor {monitor_id}")));
        }
        let job = JobRecord {
            id: tables.next_id(),
            monitor_id,
            spec: spec.clone(),
        };
        tables.jobs.push(job.clone());
        Ok(job)
    }

    async fn update_job(&self, id: JobId, spec: &JobSpec) -> StorageResult<bool> {
        let mut tables = self.tables.write();
        let Some(job) = tables.jobs.iter_mut().find(|j| j.id == id) else {
            return Ok(false);
        };
        job.spec = spec.clone();
        Ok(true)
    }

    async fn remove_job(&self, id: JobId) -> StorageResult<bool> {
        let mut tables = self.tables.write();
        let before = tables.jobs.len();
        tables.jobs.retain(|j| j.id != id);
        tables.evaluations.retain(|e| e.job_id != id);
        Ok(tables.jobs.len() != before)
    }

    async fn get_evaluation(&self, id: i64) -> StorageResult<Option<EvaluationRecord>> {
        let tables = self.tables.read();
        Ok(tables.evaluations.iter().find(|e| e.id == id).cloned())
    }

    async fn list_evaluations(&self, job_id: JobId) -> StorageResult<Vec<EvaluationRecord>> {
        let tables = self.tables.read();
        Ok(tables
            .evaluations
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn create_evaluation(
        &self,
        job_id: JobId,
        comparator: Comparator,
        threshold: &Threshold,
    ) -> StorageResult<EvaluationRecord> {
        let mut tables = self.tables.write();
        if !tables.jobs.iter().any(|j| j.id == job_id) {
            return Err(StorageError::NotFound(format!("job {job_id}")));
        }
        let evaluation = EvaluationRecord {
            id: tables.next_id(),
            job_id,
            comparator,
            threshold: threshold.clone(),
        };
        tables.evaluations.push(evaluation.clone());
        Ok(evaluation)
    }

    async fn update_evaluation(
        &self,
        id: i64,
        comparator: Comparator,
        threshold: &Threshold,
    ) -> StorageResult<bool> {
        let mut tables = self.tables.write();
        let Some(evaluation) = tables.evaluations.iter_mut().find(|e| e.id == id) else {
            return Ok(false);
        };
        evaluation.comparator = comparator;
        evaluation.threshold = threshold.clone();
        Ok(true)
    }

    async fn remove_evaluation(&self, id: i64) -> StorageResult<bool> {
        let mut tables = self.tables.write();
        let before = tables.evaluations.len();
        tables.evaluations.retain(|e| e.id != id);
        Ok(tables.evaluations.len() != before)
    }

    async fn insert_result(&self, result: NewResult) -> StorageResult<i64> {
        let mut tables = self.tables.write();
        let id = tables.next_id();
        tables.results.push(ResultRow {
            id,
            job_id: result.job_id,
            recorded: result.recorded,
            value: result.value,
            parent: result.parent,
        });
        Ok(id)
    }

    async fn query_results(
        &self,
        job_id: JobId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<ResultRow>> {
        let tables = self.tables.read();
        let mut rows: Vec<_> = tables
            .results
            .iter()
            .filter(|r| r.job_id == job_id && r.recorded >= start && r.recorded < end)
            .cloned()
            .collect();
        rows.sort_by_key(|r| (r.recorded, r.id));
        Ok(rows)
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let tables = self.tables.read();
        Ok(HealthStatus {
            healthy: true,
            message: format!(
                "in-memory storage: {} jobs, {} results",
                tables.jobs.len(),
                tables.results.len()
            ),
        })
    }
}
