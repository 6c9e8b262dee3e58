//! AggregatorActor - supervises pollers and stores their results
//!
//! ## Message Flow
//!
//! ```text
//! controller ──run_job/move_job──► AggregatorActor ──run_job──► poller
//!                                        │  ◄──── ack ────────────┘ (job recorded)
//! poller ──add_result──► evaluate ──► storage
//!                           └──► AlertManager (streak start / recovery)
//! ```
//!
//! Placement calls are only accepted from the configured controller and
//! results only from pollers this aggregator hosts.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::alerts::AlertManager;
use crate::evaluation::{EvaluationError, Evaluator};
use crate::rpc::{
    AggregatorCall, Connection, ControllerCall, Envelope, Identity, Outcome, PollerCall, Reply,
    ResponseMatch, RpcCall, SchedulerSettings, Stanza, TransactionScheduler, Transport,
};
use crate::storage::{NewResult, StorageBackend, StoredValue};
use crate::{Job, JobId, NodeRef, ResultValue, Role};

use super::messages::{AggregatorCommand, AggregatorSnapshot};

/// Work resumed when a poller answers.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregatorContinuation {
    /// The poller acknowledged `run_job`.
    JobAccepted { poller: NodeRef, job_id: JobId },
}

pub struct AggregatorActor {
    local: NodeRef,
    controller: NodeRef,
    transport: Arc<dyn Transport>,
    inbound: mpsc::UnboundedReceiver<Envelope>,
    scheduler: TransactionScheduler<AggregatorContinuation>,
    storage: Arc<dyn StorageBackend>,
    alerts: AlertManager,
    evaluator: Evaluator,
    /// Hosted pollers and the ids of the jobs they run
    job_map: BTreeMap<NodeRef, Vec<JobId>>,
    command_rx: mpsc::Receiver<AggregatorCommand>,
}

impl AggregatorActor {
    pub fn new(
        connection: Connection,
        controller: NodeRef,
        settings: SchedulerSettings,
        storage: Arc<dyn StorageBackend>,
        alerts: AlertManager,
        command_rx: mpsc::Receiver<AggregatorCommand>,
    ) -> Self {
        let Connection { transport, inbound } = connection;
        Self {
            local: transport.local().clone(),
            controller,
            scheduler: TransactionScheduler::new(transport.clone(), settings),
            transport,
            inbound,
            storage,
            alerts,
            evaluator: Evaluator::new(),
            job_map: BTreeMap::new(),
            command_rx,
        }
    }

    #[instrument(skip(self), fields(aggregator = %self.local.address()))]
    pub async fn run(mut self) {
        info!("aggregator started, controller is {}", self.controller);

        loop {
            tokio::select! {
                biased;

                Some(envelope) = self.inbound.recv() => {
                    self.handle_envelope(envelope).await;
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        AggregatorCommand::Snapshot { respond_to } => {
                            let _ = respond_to.send(self.snapshot());
                        }

                        AggregatorCommand::Shutdown { respond_to } => {
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
        self.scheduler.shutdown();
        if let Err(e) = self.transport.leave().await {
            warn!("failed to leave the fleet: {e:#}");
        }
        info!("aggregator stopped");
    }

    fn snapshot(&self) -> AggregatorSnapshot {
        AggregatorSnapshot {
            pollers: self
                .job_map
                .iter()
                .map(|(poller, jobs)| (poller.address().to_string(), jobs.clone()))
                .collect(),
            failing: self
                .job_map
                .values()
                .flatten()
                .copied()
                .filter(|job_id| self.evaluator.is_failing(*job_id))
                .collect(),
        }
    }

    async fn handle_envelope(&mut self, envelope: Envelope) {
        trace!("received {} from {}", envelope.stanza.kind(), envelope.from);
        match &envelope.stanza {
            Stanza::Presence { available: false } => {
                self.poller_lost(&envelope.from).await;
            }
            Stanza::Presence { available: true } => {}
            Stanza::Disco => {
                let identity = Identity::new("fleet", Role::Aggregator);
                self.reply(&envelope, Stanza::Identity { identity }).await;
            }
            Stanza::Call { payload } => {
                let stanza = self.handle_call(&envelope.from, payload).await;
                self.reply(&envelope, stanza).await;
            }
            Stanza::Identity { .. } | Stanza::Result { .. } | Stanza::Error { .. } => {
                let Some(id) = envelope.id else {
                    return;
                };
                let ResponseMatch::Completed(Some(continuation)) =
                    self.scheduler.on_response_received(id, &envelope.from)
                else {
                    return;
                };
                if let Some(reply) = Reply::from_stanza(envelope.stanza.clone()) {
                    self.resume(continuation, &envelope.from, reply).await;
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

    async fn resume(&mut self, continuation: AggregatorContinuation, sender: &NodeRef, reply: Reply) {
        match continuation {
            AggregatorContinuation::JobAccepted { poller, job_id } => {
                if !reply.is_success() {
                    error!("{sender} refused job {job_id}: {reply:?}");
                    return;
                }
                let Some(jobs) = self.job_map.get_mut(&poller) else {
                    debug!("{poller} left before acknowledging job {job_id}");
                    return;
                };
                if !jobs.contains(&job_id) {
                    jobs.push(job_id);
                }
                if let Err(e) = self.load_evaluations(job_id).await {
                    error!("unable to load evaluations of job {job_id}: {e:#}");
                }
            }
        }
    }

    async fn load_evaluations(&mut self, job_id: JobId) -> Result<()> {
        let evaluations = self
            .storage
            .list_evaluations(job_id)
            .await
            .context("failed to read evaluations")?;
        debug!("job {job_id} has {} evaluations", evaluations.len());
        self.evaluator
            .set_rules(job_id, evaluations.iter().map(|e| e.rule()).collect());
        Ok(())
    }

    /// A hosted poller disappeared: forget it and tell the controller.
    async fn poller_lost(&mut self, poller: &NodeRef) {
        if self.job_map.remove(poller).is_none() {
            return;
        }
        info!("poller {poller} has gone offline");

        let call = ControllerCall::PollerFailure {
            poller: poller.with_role(Role::Poller),
        };
        self.send_call(self.controller.clone(), call.encode(), None, false)
            .await;
    }

    async fn send_call(
        &self,
        to: NodeRef,
        payload: serde_json::Result<serde_json::Value>,
        continuation: Option<AggregatorContinuation>,
        delayed: bool,
    ) {
        let payload = match payload {
            Ok(payload) => payload,
            Err(e) => {
                error!("unable to encode call to {to}: {e}");
                return;
            }
        };
        if let Err(e) = self
            .scheduler
            .send(to.clone(), Stanza::Call { payload }, continuation, delayed)
            .await
        {
            warn!("unable to call {to}: {e}");
        }
    }

    async fn handle_call(&mut self, sender: &NodeRef, payload: &serde_json::Value) -> Stanza {
        let call = match AggregatorCall::decode(payload) {
            Ok(call) => call,
            Err(e) => {
                warn!("rejecting call from {sender}: {e}");
                return Stanza::Error {
                    reason: e.to_string(),
                };
            }
        };

        let allowed = match &call {
            AggregatorCall::AddResult { .. } => self.job_map.contains_key(sender),
            _ => *sender == self.controller,
        };
        if !allowed {
            warn!("{sender} may not call {}", call.method());
            return Stanza::Error {
                reason: format!("{sender} may not call {}", call.method()),
            };
        }

        debug!("{} called by {sender}", call.method());
        let outcome = match call {
            AggregatorCall::RunJob { poller, job } => self.run_job(poller, job).await,
            AggregatorCall::MoveJob { poller, job } => self.move_job(poller, job).await,
            AggregatorCall::AddPoller { poller } => self.add_poller(poller).await,
            AggregatorCall::RemovePoller { poller } => self.remove_poller(&poller),
            AggregatorCall::RemoveJob { job_id } => self.remove_job(job_id).await,
            AggregatorCall::AddResult {
                job_id,
                recorded,
                value,
            } => self.add_result(job_id, recorded, value).await,
        };
        Stanza::Result { outcome }
    }

    /// Forwards the placement to `poller`; the job is recorded once the
    /// poller acknowledges.
    async fn run_job(&mut self, poller: NodeRef, job: Job) -> Outcome {
        if self.job_map.is_empty() {
            return Outcome::failed("There are no pollers connected");
        }

        let job_id = job.id;
        let call = PollerCall::RunJob {
            aggregator: self.local.clone(),
            job,
        };
        let continuation = AggregatorContinuation::JobAccepted {
            poller: poller.clone(),
            job_id,
        };
        self.send_call(poller.clone(), call.encode(), Some(continuation), false)
            .await;
        Outcome::success(vec![json!(poller.address()), json!(job_id)])
    }

    /// Takes over a job that already runs on a poller moving to this
    /// aggregator.
    async fn move_job(&mut self, poller: NodeRef, job: Job) -> Outcome {
        let outcome = self.run_job(poller, job).await;
        if outcome.is_success() {
            Outcome::message("Successfully moved job")
        } else {
            outcome
        }
    }

    async fn add_poller(&mut self, poller: NodeRef) -> Outcome {
        self.job_map.entry(poller.clone()).or_default();
        info!("hosting poller {poller}");

        let call = PollerCall::SetAggregator {
            aggregator: self.local.clone(),
        };
        self.send_call(poller.clone(), call.encode(), None, false).await;
        Outcome::message(format!("Successfully added {}", poller.address()))
    }

    fn remove_poller(&mut self, poller: &NodeRef) -> Outcome {
        match self.job_map.remove(poller) {
            Some(jobs) => {
                info!("released poller {poller} with {} jobs", jobs.len());
                Outcome::success(vec![json!(poller.address())])
            }
            None => Outcome::failed(format!("Failed to remove poller {}", poller.address())),
        }
    }

    async fn remove_job(&mut self, job_id: JobId) -> Outcome {
        let owner = self.job_map.iter_mut().find_map(|(poller, jobs)| {
            let position = jobs.iter().position(|id| *id == job_id)?;
            jobs.remove(position);
            Some(poller.clone())
        });
        self.evaluator.clear(job_id);

        match owner {
            Some(poller) => {
                let call = PollerCall::RemoveJob { job_id };
                self.send_call(poller, call.encode(), None, false).await;
                Outcome::message("Successfully removed job")
            }
            None => Outcome::failed("Failed to remove job"),
        }
    }

    async fn add_result(
        &mut self,
        job_id: JobId,
        recorded: DateTime<Utc>,
        value: ResultValue,
    ) -> Outcome {
        if let Err(e) = self.evaluate(job_id, &value) {
            warn!("job {job_id}: {e}");
            return Outcome::failed("Failed to evaluate returned result");
        }

        match self.store(job_id, recorded, &value).await {
            Ok(()) => Outcome::message("Successfully added result"),
            Err(e) => {
                error!("failed to store result of job {job_id}: {e:#}");
                Outcome::failed("Failed to store result")
            }
        }
    }

    /// Runs every rule over the value, or over each element of a list.
    fn evaluate(&mut self, job_id: JobId, value: &ResultValue) -> Result<(), EvaluationError> {
        let scalars: Vec<&ResultValue> = match value {
            ResultValue::List(values) => values.iter().collect(),
            scalar => vec![scalar],
        };

        for scalar in scalars {
            if scalar.is_list() {
                return Err(EvaluationError::Composite);
            }
            let evaluation = self.evaluator.evaluate(job_id, scalar)?;
            let alerts = self.alerts.clone();
            let scalar = scalar.clone();
            tokio::spawn(async move {
                alerts
                    .send_evaluation_alert(evaluation, job_id, &scalar)
                    .await;
            });
        }
        Ok(())
    }

    async fn store(&self, job_id: JobId, recorded: DateTime<Utc>, value: &ResultValue) -> Result<()> {
        match value {
            ResultValue::List(values) => {
                let parent = self
                    .storage
                    .insert_result(NewResult {
                        job_id,
                        recorded,
                        value: None,
                        parent: None,
                    })
                    .await?;
                for element in values {
                    self.storage
                        .insert_result(NewResult {
                            job_id,
                            recorded,
                            value: StoredValue::from_result(element),
                            parent: Some(parent),
                        })
                        .await?;
                }
            }
            scalar => {
                self.storage
                    .insert_result(NewResult {
                        job_id,
                        recorded,
                        value: StoredValue::from_result(scalar),
                        parent: None,
                    })
                    .await?;
            }
        }
        Ok(())
    }
}

/// Handle for controlling an AggregatorActor
#[derive(Clone)]
pub struct AggregatorHandle {
    sender: mpsc::Sender<AggregatorCommand>,
    pub node: NodeRef,
}

impl AggregatorHandle {
    pub fn spawn(
        connection: Connection,
        controller: NodeRef,
        settings: SchedulerSettings,
        storage: Arc<dyn StorageBackend>,
        alerts: AlertManager,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let node = connection.local().clone();

        let actor =
            AggregatorActor::new(connection, controller, settings, storage, alerts, cmd_rx);
        tokio::spawn(actor.run());

        Self {
            sender: cmd_tx,
            node,
        }
    }

    pub async fn snapshot(&self) -> Result<AggregatorSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(AggregatorCommand::Snapshot { respond_to: tx })
            .await
            .context("failed to send Snapshot command")?;
        rx.await.context("failed to receive snapshot")
    }

    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(AggregatorCommand::Shutdown { respond_to: tx })
            .await
            .context("failed to send Shutdown command")?;
        rx.await
            .context("aggregator stopped before acknowledging shutdown")
    }
}
