//! PollerActor - runs jobs and reports their results
//!
//! ## Message Flow
//!
//! ```text
//! controller/aggregator ──call──► PollerActor ──spawn/end──► JobHandle (one per job)
//!                                      │                        │
//!                                      │◄──── answers ──────────┤ add_result
//!                                      ▼                        ▼
//!                               TransactionScheduler ──────► aggregator
//! ```
//!
//! A poller only accepts calls from controllers and aggregators. Results of
//! every job go to the aggregator last set with `set_aggregator`; while
//! there is none they are cached by the jobs and flushed once an aggregator
//! is set again.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, trace, warn};

use crate::probes::ProbeSet;
use crate::rpc::{
    Connection, Envelope, Identity, Outcome, PollerCall, RpcCall, SchedulerSettings, Stanza,
    TransactionScheduler, Transport,
};
use crate::{Job, JobId, NodeRef, Role};

use super::job::{AggregatorSlot, JobHandle, PollerScheduler};
use super::messages::{PollerCommand, PollerSnapshot};

pub struct PollerActor {
    local: NodeRef,
    segment: String,
    transport: Arc<dyn Transport>,
    inbound: mpsc::UnboundedReceiver<Envelope>,
    scheduler: Arc<PollerScheduler>,
    probes: ProbeSet,
    aggregator: AggregatorSlot,
    /// An aggregator was set before and later failed, or none was ever set.
    orphaned: bool,
    jobs: BTreeMap<JobId, JobHandle>,
    command_rx: mpsc::Receiver<PollerCommand>,
}

impl PollerActor {
    pub fn new(
        connection: Connection,
        segment: impl Into<String>,
        settings: SchedulerSettings,
        probes: ProbeSet,
        command_rx: mpsc::Receiver<PollerCommand>,
    ) -> Self {
        let Connection { transport, inbound } = connection;
        Self {
            local: transport.local().clone(),
            segment: segment.into(),
            scheduler: Arc::new(TransactionScheduler::new(transport.clone(), settings)),
            transport,
            inbound,
            probes,
            aggregator: Arc::new(RwLock::new(None)),
            orphaned: true,
            jobs: BTreeMap::new(),
            command_rx,
        }
    }

    #[instrument(skip(self), fields(poller = %self.local.address()))]
    pub async fn run(mut self) {
        info!("poller joined segment {}", self.segment);

        loop {
            tokio::select! {
                biased;

                Some(envelope) = self.inbound.recv() => {
                    self.handle_envelope(envelope).await;
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        PollerCommand::Snapshot { respond_to } => {
                            let _ = respond_to.send(self.snapshot());
                        }

                        PollerCommand::Shutdown { respond_to } => {
                            debug!("received shutdown command");
                            self.shutdown().await;
                            let _ = respond_to.send(());
                            return;
                        }
                    }
                }

                else => {
                    warn!("inbound and command channels closed, shutting down");
                    break;
                }
            }
        }

        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        for job in self.jobs.values() {
            job.end();
        }
        self.jobs.clear();
        self.scheduler.shutdown();
        if let Err(e) = self.transport.leave().await {
            warn!("failed to leave the fleet: {e:#}");
        }
        info!("poller stopped");
    }

    fn snapshot(&self) -> PollerSnapshot {
        PollerSnapshot {
            aggregator: self.aggregator.read().clone(),
            jobs: self.jobs.keys().copied().collect(),
            cached: self.jobs.values().map(JobHandle::cached).sum(),
        }
    }

    async fn handle_envelope(&mut self, envelope: Envelope) {
        trace!("received {} from {}", envelope.stanza.kind(), envelope.from);
        match &envelope.stanza {
            Stanza::Presence { .. } => {}
            Stanza::Disco => {
                let identity = Identity::new(self.segment.clone(), Role::Poller);
                self.reply(&envelope, Stanza::Identity { identity }).await;
            }
            Stanza::Call { payload } => {
                let stanza = self.handle_call(&envelope.from, payload).await;
                self.reply(&envelope, stanza).await;
            }
            Stanza::Identity { .. } | Stanza::Result { .. } | Stanza::Error { .. } => {
                if let Some(id) = envelope.id {
                    // Results carry no continuation.
                    let _ = self.scheduler.on_response_received(id, &envelope.from);
                }
            }
        }
    }

    async fn reply(&self, request: &Envelope, stanza: Stanza) {
        let reply = request.reply(&self.local, stanza);
        if let Err(e) = self.transport.send(reply).await {
            warn!("failed to answer {}: {e:#}", request.from);
        }
    }

    async fn handle_call(&mut self, sender: &NodeRef, payload: &serde_json::Value) -> Stanza {
        if !matches!(sender.role(), Role::Controller | Role::Aggregator) {
            warn!("refusing call from {sender}");
            return Stanza::Error {
                reason: format!("{sender} may not call pollers"),
            };
        }

        let call = match PollerCall::decode(payload) {
            Ok(call) => call,
            Err(e) => {
                warn!("rejecting call from {sender}: {e}");
                return Stanza::Error {
                    reason: e.to_string(),
                };
            }
        };

        debug!("{} called by {sender}", call.method());
        let outcome = match call {
            PollerCall::RunJob { aggregator, job } => self.run_job(&aggregator, job),
            PollerCall::SetAggregator { aggregator } => self.set_aggregator(aggregator).await,
            PollerCall::RemoveJob { job_id } => self.remove_job(job_id),
            PollerCall::AggregatorFailure => self.aggregator_failure(),
        };
        Stanza::Result { outcome }
    }

    /// Starts `job`. A runner with the same definition keeps running, a
    /// changed definition replaces it.
    fn run_job(&mut self, aggregator: &NodeRef, job: Job) -> Outcome {
        let job_id = job.id;
        if let Some(existing) = self.jobs.get(&job_id) {
            if existing.job() == &job && !existing.is_finished() {
                debug!("job {job_id} already running");
                return Outcome::success(vec![json!(job_id)]);
            }
            existing.end();
        }

        info!("running job {job_id} for {aggregator}");
        let handle = JobHandle::spawn(
            job,
            self.probes.clone(),
            self.scheduler.clone(),
            self.aggregator.clone(),
        );
        self.jobs.insert(job_id, handle);
        Outcome::success(vec![json!(job_id)])
    }

    async fn set_aggregator(&mut self, aggregator: NodeRef) -> Outcome {
        info!("setting aggregator {aggregator}");
        *self.aggregator.write() = Some(aggregator.clone());

        if std::mem::replace(&mut self.orphaned, false) {
            for job in self.jobs.values() {
                job.flush_cache(&aggregator).await;
            }
        }
        Outcome::message("Successfully set aggregator")
    }

    fn remove_job(&mut self, job_id: JobId) -> Outcome {
        match self.jobs.remove(&job_id) {
            Some(job) => {
                job.end();
                Outcome::message(format!("Stopped job {job_id}"))
            }
            None => Outcome::failed(format!("Failed to stop job {job_id}")),
        }
    }

    fn aggregator_failure(&mut self) -> Outcome {
        warn!("parent aggregator failed, caching results");
        *self.aggregator.write() = None;
        self.orphaned = true;
        Outcome::message("Removed parent aggregator")
    }
}

/// Handle for controlling a PollerActor
#[derive(Clone)]
pub struct PollerHandle {
    sender: mpsc::Sender<PollerCommand>,
    pub node: NodeRef,
}

impl PollerHandle {
    pub fn spawn(
        connection: Connection,
        segment: impl Into<String>,
        settings: SchedulerSettings,
        probes: ProbeSet,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let node = connection.local().clone();

        let actor = PollerActor::new(connection, segment, settings, probes, cmd_rx);
        tokio::spawn(actor.run());

        Self {
            sender: cmd_tx,
            node,
        }
    }

    pub async fn snapshot(&self) -> Result<PollerSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PollerCommand::Snapshot { respond_to: tx })
            .await
            .context("failed to send Snapshot command")?;
        rx.await.context("failed to receive snapshot")
    }

    /// Ends every job and leaves the fleet. Returns once done.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PollerCommand::Shutdown { respond_to: tx })
            .await
            .context("failed to send Shutdown command")?;
        rx.await.context("poller stopped before acknowledging shutdown")
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::probes::Probe;
    use crate::rpc::memory::MemoryNetwork;
    use crate::{Protocol, ResultValue};

    struct ConstantProbe;

    #[async_trait]
    impl Probe for ConstantProbe {
        async fn probe(&self, _job: &Job) -> anyhow::Result<Option<ResultValue>> {
            Ok(Some(ResultValue::Int(42)))
        }
    }

    fn job(id: JobId) -> Job {
        Job {
            id,
            address: "10.0.0.1".into(),
            protocol: Protocol::Snmp,
            frequency: 5,
            domain: "public".into(),
            resource: "1.3.6.1.2.1.1.3.0".into(),
            segment: "east".into(),
        }
    }

    struct Fixture {
        network: MemoryNetwork,
        poller: PollerHandle,
        aggregator: Connection,
    }

    fn fixture() -> Fixture {
        let network = MemoryNetwork::new();
        let aggregator = network.join(NodeRef::aggregator("a1"));
        let poller = PollerHandle::spawn(
            network.join(NodeRef::poller("p1")),
            "east",
            SchedulerSettings::default(),
            ProbeSet::uniform(Arc::new(ConstantProbe)),
        );
        Fixture {
            network,
            poller,
            aggregator,
        }
    }

    async fn call(fixture: &mut Fixture, call: PollerCall) -> Stanza {
        let envelope = Envelope {
            id: Some(1),
            from: fixture.aggregator.local().clone(),
            to: Some(fixture.poller.node.clone()),
            stanza: Stanza::Call {
                payload: call.encode().unwrap(),
            },
        };
        fixture.aggregator.transport.send(envelope).await.unwrap();
        loop {
            let reply = fixture.aggregator.inbound.recv().await.unwrap();
            if reply.id == Some(1) {
                return reply.stanza;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn run_job_replies_with_job_id() {
        let mut fixture = fixture();
        let reply = call(
            &mut fixture,
            PollerCall::RunJob {
                aggregator: NodeRef::aggregator("a1"),
                job: job(3),
            },
        )
        .await;

        assert_eq!(
            reply,
            Stanza::Result {
                outcome: Outcome::success(vec![json!(3)])
            }
        );
        assert_eq!(fixture.poller.snapshot().await.unwrap().jobs, vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn results_are_cached_until_an_aggregator_is_set() {
        let mut fixture = fixture();
        call(
            &mut fixture,
            PollerCall::RunJob {
                aggregator: NodeRef::aggregator("a1"),
                job: job(3),
            },
        )
        .await;
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(fixture.poller.snapshot().await.unwrap().cached, 3);

        call(
            &mut fixture,
            PollerCall::SetAggregator {
                aggregator: NodeRef::aggregator("a1"),
            },
        )
        .await;
        let snapshot = fixture.poller.snapshot().await.unwrap();
        assert_eq!(snapshot.cached, 0);
        assert_eq!(snapshot.aggregator, Some(NodeRef::aggregator("a1")));
    }

    async fn run_twice(replacement: Job) -> usize {
        let mut fixture = fixture();
        call(
            &mut fixture,
            PollerCall::RunJob {
                aggregator: NodeRef::aggregator("a1"),
                job: job(3),
            },
        )
        .await;
        tokio::time::sleep(Duration::from_secs(6)).await;
        call(
            &mut fixture,
            PollerCall::RunJob {
                aggregator: NodeRef::aggregator("a1"),
                job: replacement,
            },
        )
        .await;
        tokio::time::sleep(Duration::from_secs(6)).await;

        let snapshot = fixture.poller.snapshot().await.unwrap();
        assert_eq!(snapshot.jobs, vec![3]);
        snapshot.cached
    }

    #[tokio::test(start_paused = true)]
    async fn identical_run_job_keeps_the_running_runner() {
        // Runs at 0, 5 and 10 seconds from the first runner.
        assert_eq!(run_twice(job(3)).await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn changed_run_job_replaces_the_runner() {
        let mut changed = job(3);
        changed.address = "10.0.0.2".into();
        // The old runner and its cache are gone, the new one ran at 6 and 11.
        assert_eq!(run_twice(changed).await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn aggregator_failure_clears_the_aggregator() {
        let mut fixture = fixture();
        call(
            &mut fixture,
            PollerCall::SetAggregator {
                aggregator: NodeRef::aggregator("a1"),
            },
        )
        .await;
        call(&mut fixture, PollerCall::AggregatorFailure).await;

        assert_eq!(fixture.poller.snapshot().await.unwrap().aggregator, None);
    }

    #[tokio::test(start_paused = true)]
    async fn removing_an_unknown_job_fails() {
        let mut fixture = fixture();
        let reply = call(&mut fixture, PollerCall::RemoveJob { job_id: 99 }).await;

        assert_eq!(
            reply,
            Stanza::Result {
                outcome: Outcome::failed("Failed to stop job 99")
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn calls_from_pollers_are_refused() {
        let fixture = fixture();
        let mut other = fixture.network.join(NodeRef::poller("p2"));
        let envelope = Envelope {
            id: Some(5),
            from: other.local().clone(),
            to: Some(fixture.poller.node.clone()),
            stanza: Stanza::Call {
                payload: PollerCall::AggregatorFailure.encode().unwrap(),
            },
        };
        other.transport.send(envelope).await.unwrap();

        let reply = loop {
            let envelope = other.inbound.recv().await.unwrap();
            if envelope.id == Some(5) {
                break envelope.stanza;
            }
        };
        assert!(matches!(reply, Stanza::Error { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn disco_reports_segment() {
        let mut fixture = fixture();
        let envelope = Envelope {
            id: Some(8),
            from: fixture.aggregator.local().clone(),
            to: Some(fixture.poller.node.clone()),
            stanza: Stanza::Disco,
        };
        fixture.aggregator.transport.send(envelope).await.unwrap();

        let reply = loop {
            let envelope = fixture.aggregator.inbound.recv().await.unwrap();
            if envelope.id == Some(8) {
                break envelope.stanza;
            }
        };
        assert_eq!(
            reply,
            Stanza::Identity {
                identity: Identity::new("east", Role::Poller)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_leaves_the_fleet() {
        let fixture = fixture();
        fixture.poller.shutdown().await.unwrap();

        assert!(!fixture.network.is_member(&NodeRef::poller("p1")));
    }
}
