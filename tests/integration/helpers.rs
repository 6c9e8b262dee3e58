//! Fleet fixtures shared by the integration tests

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use fleetwatch::{
    Job, JobId, NodeRef, Protocol, ResultValue,
    actors::{AggregatorHandle, ControllerHandle, PollerHandle},
    alerts::AlertManager,
    probes::{Probe, ProbeSet},
    rpc::{SchedulerSettings, memory::MemoryNetwork},
    storage::{JobSpec, MemoryBackend, StorageBackend},
};

pub const CONTROLLER: &str = "ctl";

/// Answers every job with the same value and counts the runs.
pub struct FixedProbe {
    pub value: ResultValue,
    pub runs: AtomicUsize,
}

impl FixedProbe {
    pub fn new(value: ResultValue) -> Arc<Self> {
        Arc::new(Self {
            value,
            runs: AtomicUsize::new(0),
        })
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Probe for FixedProbe {
    async fn probe(&self, _job: &Job) -> anyhow::Result<Option<ResultValue>> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(Some(self.value.clone()))
    }
}

pub fn memory_storage() -> Arc<MemoryBackend> {
    Arc::new(MemoryBackend::new())
}

pub fn spawn_controller(
    network: &MemoryNetwork,
    storage: Arc<dyn StorageBackend>,
) -> ControllerHandle {
    ControllerHandle::spawn(
        network.join(NodeRef::controller(CONTROLLER)),
        "default",
        SchedulerSettings::default(),
        storage,
    )
}

pub fn spawn_aggregator(
    network: &MemoryNetwork,
    address: &str,
    storage: Arc<dyn StorageBackend>,
) -> AggregatorHandle {
    let node = NodeRef::aggregator(address);
    AggregatorHandle::spawn(
        network.join(node.clone()),
        NodeRef::controller(CONTROLLER),
        SchedulerSettings::default(),
        storage,
        AlertManager::new(None, node),
    )
}

pub fn spawn_poller(
    network: &MemoryNetwork,
    address: &str,
    segment: &str,
    probe: Arc<dyn Probe>,
) -> PollerHandle {
    PollerHandle::spawn(
        network.join(NodeRef::poller(address)),
        segment,
        SchedulerSettings::default(),
        ProbeSet::uniform(probe),
    )
}

pub fn job_spec(segment: &str, frequency: u64) -> JobSpec {
    JobSpec {
        address: "10.1.0.1".into(),
        protocol: Protocol::Test,
        frequency,
        domain: String::new(),
        resource: "/opt/checks/ping.sh".into(),
        segment: Some(segment.into()),
    }
}

/// Stores `count` jobs of `segment` under a fresh monitor.
pub async fn create_jobs(
    storage: &dyn StorageBackend,
    monitor: &str,
    segment: &str,
    count: usize,
) -> Vec<JobId> {
    let monitor = storage.create_monitor(monitor, "", None).await.unwrap();
    let mut ids = Vec::new();
    for _ in 0..count {
        let record = storage
            .create_job(monitor.id, &job_spec(segment, 10))
            .await
            .unwrap();
        ids.push(record.id);
    }
    ids
}

/// Lets the paused clock run past every offset-delayed dispatch and retry.
pub async fn settle() {
    tokio::time::sleep(Duration::from_secs(90)).await;
}
