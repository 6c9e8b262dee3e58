//! ControllerActor - owns the registry and the administrative records
//!
//! ## Message Flow
//!
//! ```text
//! presence available ──► disco ──► identity ──► Registry::add_entity ─┐
//! presence unavailable ──────────────────────► Registry::remove_entity ┤
//! admin call ──► storage ──► Registry::add_job / remove_job ───────────┤
//!                                                                      ▼
//!                          TransactionScheduler ◄── Registry::take_dispatches
//!                                   │
//!                     answers ──► continuations ──► Registry
//! ```
//!
//! Every event is handled to completion, including the balancing it
//! triggers, before the next one is read. The registry is therefore never
//! shared and needs no locking.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::evaluation::{Comparator, Threshold};
use crate::registry::{Continuation, Registry, RegistrySnapshot};
use crate::rpc::{
    Connection, ControllerCall, Envelope, Identity, Outcome, Reply, ResponseMatch, RpcCall,
    SchedulerSettings, Stanza, TransactionScheduler, Transport,
};
use crate::storage::{BucketSpan, JobRecord, JobSpec, Monitor, StorageBackend, StorageError};
use crate::{JobId, NodeRef, Role};

use super::messages::ControllerCommand;

/// Work resumed when an answer arrives.
#[derive(Debug, Clone, PartialEq)]
pub enum Pending {
    /// Discovery of a node that announced itself.
    Disco { node: NodeRef },
    Registry(Continuation),
}

fn value(v: impl Serialize) -> Value {
    serde_json::to_value(v).unwrap_or_default()
}

fn storage_failure(action: &str, e: StorageError) -> Outcome {
    warn!("{action} failed: {e}");
    Outcome::failed(format!("Failed to {action}: {e}"))
}

pub struct ControllerActor {
    local: NodeRef,
    transport: Arc<dyn Transport>,
    inbound: mpsc::UnboundedReceiver<Envelope>,
    scheduler: TransactionScheduler<Pending>,
    storage: Arc<dyn StorageBackend>,
    registry: Registry,
    command_rx: mpsc::Receiver<ControllerCommand>,
}

impl ControllerActor {
    pub fn new(
        connection: Connection,
        default_segment: impl Into<String>,
        settings: SchedulerSettings,
        storage: Arc<dyn StorageBackend>,
        command_rx: mpsc::Receiver<ControllerCommand>,
    ) -> Self {
        let Connection { transport, inbound } = connection;
        Self {
            local: transport.local().clone(),
            scheduler: TransactionScheduler::new(transport.clone(), settings),
            transport,
            inbound,
            storage,
            registry: Registry::new(default_segment),
            command_rx,
        }
    }

    #[instrument(skip(self), fields(controller = %self.local.address()))]
    pub async fn run(mut self) {
        if let Err(e) = self.load_jobs().await {
            error!("unable to load jobs: {e:#}");
        }

        loop {
            tokio::select! {
                biased;

                Some(envelope) = self.inbound.recv() => {
                    self.handle_envelope(envelope).await;
                    self.flush().await;
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        ControllerCommand::Snapshot { respond_to } => {
                            let _ = respond_to.send(self.registry.snapshot());
                        }

                        ControllerCommand::Shutdown { respond_to } => {
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

    /// Fills the job pool from storage.
    async fn load_jobs(&mut self) -> Result<()> {
        let records = self
            .storage
            .list_all_jobs()
            .await
            .context("failed to list jobs")?;
        let default_segment = self.registry.default_segment().to_string();
        self.registry
            .load_jobs(records.iter().map(|r| r.to_job(&default_segment)));
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.scheduler.shutdown();
        if let Err(e) = self.transport.leave().await {
            warn!("failed to leave the fleet: {e:#}");
        }
        info!("controller stopped");
    }

    /// Hands the calls queued by the registry to the scheduler.
    async fn flush(&mut self) {
        for dispatch in self.registry.take_dispatches() {
            let payload = match dispatch.call.to_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    error!("unable to encode {}: {e}", dispatch.call.method());
                    continue;
                }
            };
            trace!("dispatching {} to {}", dispatch.call.method(), dispatch.to);
            if let Err(e) = self
                .scheduler
                .send(
                    dispatch.to.clone(),
                    Stanza::Call { payload },
                    dispatch.continuation.map(Pending::Registry),
                    dispatch.delayed,
                )
                .await
            {
                warn!("unable to call {}: {e}", dispatch.to);
            }
        }
    }

    async fn handle_envelope(&mut self, envelope: Envelope) {
        trace!("received {} from {}", envelope.stanza.kind(), envelope.from);
        if envelope.from == self.local {
            return;
        }

        match &envelope.stanza {
            Stanza::Presence { available: true } => self.discover(envelope.from.clone()).await,
            Stanza::Presence { available: false } => {
                info!("{} has gone offline", envelope.from);
                self.registry.remove_entity(&envelope.from);
            }
            Stanza::Disco => {
                let identity = Identity::new("fleet", Role::Controller);
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
                let ResponseMatch::Completed(Some(pending)) =
                    self.scheduler.on_response_received(id, &envelope.from)
                else {
                    return;
                };
                if let Some(reply) = Reply::from_stanza(envelope.stanza.clone()) {
                    self.resume(pending, reply);
                }
            }
        }
    }

    async fn discover(&mut self, node: NodeRef) {
        if self.registry.is_registered(&node) {
            return;
        }
        debug!("looking up {node}");
        let pending = Pending::Disco { node: node.clone() };
        if let Err(e) = self
            .scheduler
            .send(node.clone(), Stanza::Disco, Some(pending), false)
            .await
        {
            warn!("unable to look up {node}: {e}");
        }
    }

    async fn reply(&self, request: &Envelope, stanza: Stanza) {
        let reply = request.reply(&self.local, stanza);
        if let Err(e) = self.transport.send(reply).await {
            warn!("failed to answer {}: {e:#}", request.from);
        }
    }

    fn resume(&mut self, pending: Pending, reply: Reply) {
        match pending {
            Pending::Disco { node } => match reply {
                Reply::Identity(identity) => match identity.role() {
                    Some(role @ (Role::Aggregator | Role::Poller)) => {
                        info!("registering {role} {node} ({})", identity.category);
                        self.registry
                            .add_entity(role, &identity.category, node.with_role(role));
                    }
                    _ => debug!("ignoring {node} of type {}", identity.entity_type),
                },
                other => warn!("unexpected discovery answer from {node}: {other:?}"),
            },
            Pending::Registry(Continuation::AssignJob { job_id, poller }) => {
                if reply.is_success() {
                    self.registry.complete_assignment(job_id, &poller);
                } else {
                    warn!("placement of job {job_id} on {poller} refused: {reply:?}");
                    self.registry.abandon_assignment(job_id, &poller);
                    self.registry.assign_pooled_jobs();
                }
            }
            Pending::Registry(Continuation::PollerRemoved { poller }) => {
                if !reply.is_success() {
                    debug!("aggregator no longer knew {poller}: {reply:?}");
                }
                self.registry.poller_removed(&poller);
            }
        }
    }

    async fn handle_call(&mut self, sender: &NodeRef, payload: &Value) -> Stanza {
        let call = match ControllerCall::decode(payload) {
            Ok(call) => call,
            Err(e) => {
                warn!("rejecting call from {sender}: {e}");
                return Stanza::Error {
                    reason: e.to_string(),
                };
            }
        };

        debug!("{} called by {sender}", call.method());
        let outcome = self.execute(sender, call).await;
        Stanza::Result { outcome }
    }

    async fn execute(&mut self, sender: &NodeRef, call: ControllerCall) -> Outcome {
        match call {
            ControllerCall::GetGroup { name } => match self.storage.get_group(&name).await {
                Ok(Some(group)) => Outcome::success(vec![value(group)]),
                Ok(None) => Outcome::failed("No such group exists"),
                Err(e) => storage_failure("read group", e),
            },
            ControllerCall::GetGroups => match self.storage.list_groups().await {
                Ok(groups) => Outcome::success(vec![value(groups)]),
                Err(e) => storage_failure("retrieve groups", e),
            },
            ControllerCall::CreateGroup { name, description } => {
                match self.storage.create_group(&name, &description).await {
                    Ok(group) => Outcome::success(vec![value(group)]),
                    Err(e) => storage_failure("create group", e),
                }
            }
            ControllerCall::UpdateGroup {
                id,
                name,
                description,
            } => match self.storage.update_group(id, &name, &description).await {
                Ok(true) => Outcome::message(format!("Successfully updated group {name}")),
                Ok(false) => Outcome::failed("No such group exists"),
                Err(e) => storage_failure("update group", e),
            },
            ControllerCall::RemoveGroup { name } => match self.storage.remove_group(&name).await {
                Ok(true) => Outcome::message(format!("Successfully removed group {name}")),
                Ok(false) => Outcome::failed(format!("Failed to remove group {name}")),
                Err(e) => storage_failure("remove group", e),
            },

            ControllerCall::GetMonitor { name } => match self.monitor(&name).await {
                Ok(monitor) => Outcome::success(vec![value(monitor)]),
                Err(outcome) => outcome,
            },
            ControllerCall::GetMonitors { group } => {
                let group_id = match group {
                    Some(group) => match self.group_id(&group).await {
                        Ok(id) => Some(id),
                        Err(outcome) => return outcome,
                    },
                    None => None,
                };
                match self.storage.list_monitors(group_id).await {
                    Ok(monitors) => Outcome::success(vec![value(monitors)]),
                    Err(e) => storage_failure("retrieve monitors", e),
                }
            }
            ControllerCall::GetMonitorsByGid { group_id } => {
                match self.storage.list_monitors(Some(group_id)).await {
                    Ok(monitors) => Outcome::success(vec![value(monitors)]),
                    Err(e) => storage_failure("retrieve monitors", e),
                }
            }
            ControllerCall::CreateMonitor {
                name,
                description,
                group,
            } => {
                let group_id = match group {
                    Some(group) => match self.group_id(&group).await {
                        Ok(id) => Some(id),
                        Err(outcome) => return outcome,
                    },
                    None => None,
                };
                match self
                    .storage
                    .create_monitor(&name, &description, group_id)
                    .await
                {
                    Ok(monitor) => Outcome::success(vec![value(monitor)]),
                    Err(e) => storage_failure("create monitor", e),
                }
            }
            ControllerCall::UpdateMonitor {
                id,
                name,
                description,
                group,
            } => {
                let group_id = match group {
                    Some(group) => match self.group_id(&group).await {
                        Ok(id) => Some(id),
                        Err(outcome) => return outcome,
                    },
                    None => None,
                };
                match self
                    .storage
                    .update_monitor(id, &name, &description, group_id)
                    .await
                {
                    Ok(true) => Outcome::message(format!("Successfully updated monitor {name}")),
                    Ok(false) => Outcome::failed("No such monitor exists"),
                    Err(e) => storage_failure("update monitor", e),
                }
            }
            ControllerCall::RemoveMonitor { name } => self.remove_monitor(&name).await,

            ControllerCall::GetJob { monitor, id } => match self.job(&monitor, id).await {
                Ok(job) => Outcome::success(vec![value(job)]),
                Err(outcome) => outcome,
            },
            ControllerCall::GetJobs { monitor } => {
                let monitor = match self.monitor(&monitor).await {
                    Ok(monitor) => monitor,
                    Err(outcome) => return outcome,
                };
                match self.storage.list_jobs(monitor.id).await {
                    Ok(jobs) => Outcome::success(vec![value(jobs)]),
                    Err(e) => storage_failure("retrieve jobs", e),
                }
            }
            ControllerCall::CreateJob { monitor, job } => self.create_job(&monitor, job).await,
            ControllerCall::UpdateJob { monitor, id, job } => {
                self.update_job(&monitor, id, job).await
            }
            ControllerCall::RemoveJob { monitor, id } => self.remove_job(&monitor, id).await,

            ControllerCall::GetEvaluation { id } => match self.storage.get_evaluation(id).await {
                Ok(Some(evaluation)) => Outcome::success(vec![value(evaluation)]),
                Ok(None) => Outcome::failed("No such evaluation exists"),
                Err(e) => storage_failure("read evaluation", e),
            },
            ControllerCall::GetEvaluations { job } => {
                match self.storage.list_evaluations(job).await {
                    Ok(evaluations) => Outcome::success(vec![value(evaluations)]),
                    Err(e) => storage_failure("retrieve evaluations", e),
                }
            }
            ControllerCall::CreateEvaluation {
                job,
                comparator,
                threshold,
            } => self.create_evaluation(job, comparator, threshold).await,
            ControllerCall::UpdateEvaluation {
                id,
                comparator,
                threshold,
            } => match self
                .storage
                .update_evaluation(id, comparator, &threshold)
                .await
            {
                Ok(true) => Outcome::message("Successfully updated evaluation"),
                Ok(false) => Outcome::failed("No such evaluation exists"),
                Err(e) => storage_failure("update evaluation", e),
            },
            ControllerCall::RemoveEvaluation { id } => {
                match self.storage.remove_evaluation(id).await {
                    Ok(true) => Outcome::message("Successfully removed evaluation"),
                    Ok(false) => Outcome::failed("No such evaluation exists"),
                    Err(e) => storage_failure("remove evaluation", e),
                }
            }

            ControllerCall::GetResults {
                monitor,
                job,
                start,
                end,
            } => self.results(&monitor, job, start, end).await,
            ControllerCall::GetResultsHour {
                monitor,
                job,
                start,
            } => self.bucketed_results(&monitor, job, BucketSpan::Hour, start).await,
            ControllerCall::GetResultsDay {
                monitor,
                job,
                start,
            } => self.bucketed_results(&monitor, job, BucketSpan::Day, start).await,
            ControllerCall::GetResultsWeek {
                monitor,
                job,
                start,
            } => self.bucketed_results(&monitor, job, BucketSpan::Week, start).await,

            ControllerCall::PollerFailure { poller } => {
                match self
                    .registry
                    .poller_failure(sender, &poller.with_role(Role::Poller))
                {
                    Ok(()) => Outcome::message("Removed failed poller"),
                    Err(e) => {
                        warn!("poller failure reported by {sender}: {e}");
                        Outcome::failed("Failed to remove poller")
                    }
                }
            }
        }
    }

    async fn group_id(&self, name: &str) -> Result<i64, Outcome> {
        match self.storage.get_group(name).await {
            Ok(Some(group)) => Ok(group.id),
            Ok(None) => Err(Outcome::failed("No such group exists")),
            Err(e) => Err(storage_failure("read group", e)),
        }
    }

    async fn monitor(&self, name: &str) -> Result<Monitor, Outcome> {
        match self.storage.get_monitor(name).await {
            Ok(Some(monitor)) => Ok(monitor),
            Ok(None) => Err(Outcome::failed("No such monitor exists")),
            Err(e) => Err(storage_failure("read monitor", e)),
        }
    }

    /// A job, provided it belongs to the named monitor.
    async fn job(&self, monitor: &str, id: JobId) -> Result<JobRecord, Outcome> {
        let monitor = self.monitor(monitor).await?;
        match self.storage.get_job(id).await {
            Ok(Some(job)) if job.monitor_id == monitor.id => Ok(job),
            Ok(_) => Err(Outcome::failed("No such job exists")),
            Err(e) => Err(storage_failure("read job", e)),
        }
    }

    async fn remove_monitor(&mut self, name: &str) -> Outcome {
        let monitor = match self.monitor(name).await {
            Ok(monitor) => monitor,
            Err(outcome) => return outcome,
        };
        let jobs = match self.storage.list_jobs(monitor.id).await {
            Ok(jobs) => jobs,
            Err(e) => return storage_failure("retrieve jobs", e),
        };
        match self.storage.remove_monitor(name).await {
            Ok(true) => {
                for job in jobs {
                    self.registry.remove_job(job.id);
                }
                Outcome::message(format!("Successfully removed monitor {name}"))
            }
            Ok(false) => Outcome::failed(format!("Failed to remove monitor {name}")),
            Err(e) => storage_failure("remove monitor", e),
        }
    }

    async fn create_job(&mut self, monitor: &str, spec: JobSpec) -> Outcome {
        let monitor = match self.monitor(monitor).await {
            Ok(monitor) => monitor,
            Err(outcome) => return outcome,
        };
        match self.storage.create_job(monitor.id, &spec).await {
            Ok(record) => {
                let job = record.to_job(self.registry.default_segment());
                info!("job {} created for {}", job.id, monitor.name);
                self.registry.add_job(job);
                self.registry.assign_pooled_jobs();
                Outcome::success(vec![value(record)])
            }
            Err(e) => storage_failure("create job", e),
        }
    }

    async fn update_job(&mut self, monitor: &str, id: JobId, spec: JobSpec) -> Outcome {
        let existing = match self.job(monitor, id).await {
            Ok(job) => job,
            Err(outcome) => return outcome,
        };
        match self.storage.update_job(id, &spec).await {
            Ok(true) => {
                let record = JobRecord {
                    id,
                    monitor_id: existing.monitor_id,
                    spec,
                };
                self.registry
                    .add_job(record.to_job(self.registry.default_segment()));
                self.registry.assign_pooled_jobs();
                Outcome::message("Successfully updated job")
            }
            Ok(false) => Outcome::failed("No such job exists"),
            Err(e) => storage_failure("update job", e),
        }
    }

    async fn remove_job(&mut self, monitor: &str, id: JobId) -> Outcome {
        if let Err(outcome) = self.job(monitor, id).await {
            return outcome;
        }
        match self.storage.remove_job(id).await {
            Ok(true) => {
                self.registry.remove_job(id);
                Outcome::message("Successfully removed job")
            }
            Ok(false) => Outcome::failed("No such job exists"),
            Err(e) => storage_failure("remove job", e),
        }
    }

    async fn create_evaluation(
        &self,
        job: JobId,
        comparator: Comparator,
        threshold: Threshold,
    ) -> Outcome {
        match self
            .storage
            .create_evaluation(job, comparator, &threshold)
            .await
        {
            Ok(evaluation) => Outcome::success(vec![value(evaluation)]),
            Err(e) => storage_failure("create evaluation", e),
        }
    }

    /// Raw rows strictly between `start` and `end`.
    async fn results(
        &self,
        monitor: &str,
        job: JobId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Outcome {
        if let Err(outcome) = self.job(monitor, job).await {
            return outcome;
        }
        match self.storage.query_results(job, start, end).await {
            Ok(rows) => {
                let rows: Vec<Value> = rows
                    .into_iter()
                    .filter(|row| row.recorded > start)
                    .map(value)
                    .collect();
                if rows.is_empty() {
                    Outcome::failed("No such results exist")
                } else {
                    Outcome::success(rows)
                }
            }
            Err(e) => storage_failure("retrieve results", e),
        }
    }

    async fn bucketed_results(
        &self,
        monitor: &str,
        job: JobId,
        span: BucketSpan,
        start: DateTime<Utc>,
    ) -> Outcome {
        let record = match self.job(monitor, job).await {
            Ok(record) => record,
            Err(outcome) => return outcome,
        };
        match self.storage.query_buckets(job, span, start).await {
            Ok(buckets) if buckets.is_empty() => Outcome::failed("No such results exist"),
            Ok(buckets) => Outcome::success(vec![value(record), json!(buckets)]),
            Err(e) => storage_failure("retrieve results", e),
        }
    }
}

/// Handle for controlling a ControllerActor
#[derive(Clone)]
pub struct ControllerHandle {
    sender: mpsc::Sender<ControllerCommand>,
    pub node: NodeRef,
}

impl ControllerHandle {
    pub fn spawn(
        connection: Connection,
        default_segment: impl Into<String>,
        settings: SchedulerSettings,
        storage: Arc<dyn StorageBackend>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let node = connection.local().clone();

        let actor = ControllerActor::new(connection, default_segment, settings, storage, cmd_rx);
        tokio::spawn(actor.run());

        Self {
            sender: cmd_tx,
            node,
        }
    }

    pub async fn snapshot(&self) -> Result<RegistrySnapshot> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerCommand::Snapshot { respond_to: tx })
            .await
            .context("failed to send Snapshot command")?;
        rx.await.context("failed to receive snapshot")
    }

    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerCommand::Shutdown { respond_to: tx })
            .await
            .context("failed to send Shutdown command")?;
        rx.await
            .context("controller stopped before acknowledging shutdown")
    }
}
