//! Entity registry
//!
//! The controller's view of the fleet: which aggregators exist, which pollers
//! each of them supervises, which jobs each poller runs, and the pools of
//! pollers and jobs not placed yet. The registry never talks to the network.
//! Every operation that needs a remote call queues a [`Dispatch`] which the
//! controller drains with [`Registry::take_dispatches`] and hands to its
//! transaction scheduler.
//!
//! Invariants maintained by every operation:
//!
//! - a poller is either pooled or listed under exactly one aggregator
//! - a job id is either pooled or listed under exactly one poller
//!
//! Balancing lives in [`balance`].

pub mod balance;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::rpc::messages::{AggregatorCall, PollerCall, RpcCall};
use crate::{Job, JobId, NodeRef, Role};

pub type Segment = String;

/// A remote call produced by a registry operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Aggregator(AggregatorCall),
    Poller(PollerCall),
}

impl Outbound {
    pub fn method(&self) -> &'static str {
        match self {
            Outbound::Aggregator(call) => call.method(),
            Outbound::Poller(call) => call.method(),
        }
    }

    pub fn to_payload(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            Outbound::Aggregator(call) => call.encode(),
            Outbound::Poller(call) => call.encode(),
        }
    }
}

/// Work to resume once the answer to a dispatched call arrives.
#[derive(Debug, Clone, PartialEq)]
pub enum Continuation {
    /// The aggregator accepted (or refused) a placement of `job_id` on `poller`.
    AssignJob { job_id: JobId, poller: NodeRef },
    /// The aggregator released `poller`.
    PollerRemoved { poller: NodeRef },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub to: NodeRef,
    pub call: Outbound,
    pub delayed: bool,
    pub continuation: Option<Continuation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    UnknownAggregator(NodeRef),
    UnknownPoller(NodeRef),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::UnknownAggregator(node) => write!(f, "unknown aggregator {node}"),
            RegistryError::UnknownPoller(node) => write!(f, "unknown poller {node}"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Where a job currently lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobLocation {
    Pool,
    Poller(NodeRef),
}

/// Plain view of the registry, keyed by node address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistrySnapshot {
    pub aggregators: BTreeMap<String, Vec<String>>,
    pub pollers: BTreeMap<String, Vec<JobId>>,
    pub poller_pool: Vec<String>,
    pub job_pool: Vec<JobId>,
    pub pending: BTreeMap<JobId, String>,
}

#[derive(Debug, Default)]
pub struct Registry {
    default_segment: Segment,
    /// aggregator → pollers it supervises, in assignment order
    poller_map: BTreeMap<NodeRef, Vec<(NodeRef, Segment)>>,
    /// pollers not yet given to an aggregator
    poller_pool: BTreeMap<NodeRef, Segment>,
    /// poller → jobs it runs; every known poller has an entry
    job_map: BTreeMap<NodeRef, Vec<Job>>,
    job_pool: Vec<Job>,
    /// placements dispatched but not yet acknowledged
    pending: HashMap<JobId, NodeRef>,
    /// pollers whose removal has been requested from their aggregator
    departing: BTreeSet<NodeRef>,
    /// departing pollers that were discovered again, registered anew once
    /// their removal completes
    rejoining: BTreeMap<NodeRef, Segment>,
    outbox: Vec<Dispatch>,
}

impl Registry {
    pub fn new(default_segment: impl Into<Segment>) -> Self {
        Self {
            default_segment: default_segment.into(),
            ..Default::default()
        }
    }

    pub fn default_segment(&self) -> &str {
        &self.default_segment
    }

    /// Puts freshly loaded jobs into the pool.
    pub fn load_jobs(&mut self, jobs: impl IntoIterator<Item = Job>) {
        for job in jobs {
            self.add_job(job);
        }
        info!("{} jobs pooled", self.job_pool.len());
    }

    /// Drains the calls queued by previous operations.
    pub fn take_dispatches(&mut self) -> Vec<Dispatch> {
        std::mem::take(&mut self.outbox)
    }

    pub(crate) fn dispatch(
        &mut self,
        to: &NodeRef,
        call: Outbound,
        delayed: bool,
        continuation: Option<Continuation>,
    ) {
        debug!("queueing {} for {to}", call.method());
        self.outbox.push(Dispatch {
            to: to.clone(),
            call,
            delayed,
            continuation,
        });
    }

    /// Known and not on its way out.
    pub fn is_registered(&self, node: &NodeRef) -> bool {
        if self.departing.contains(node) {
            return false;
        }
        self.poller_map.contains_key(node) || self.job_map.contains_key(node)
    }

    pub fn is_departing(&self, poller: &NodeRef) -> bool {
        self.departing.contains(poller)
    }

    /// Registers a node confirmed by service discovery and rebalances.
    /// Nodes already known are left untouched. A departing poller is
    /// registered again once its removal completes.
    pub fn add_entity(&mut self, role: Role, segment: &str, node: NodeRef) {
        if role == Role::Poller && self.departing.contains(&node) {
            info!("{node} is back, registering it once its removal completes");
            self.rejoining
                .insert(node.with_role(Role::Poller), segment.to_string());
            return;
        }
        if self.is_registered(&node) {
            debug!("{node} is already registered");
            return;
        }

        match role {
            Role::Aggregator => {
                self.poller_map.insert(node.with_role(Role::Aggregator), Vec::new());
                self.assign_pooled_pollers();
                if self.poller_map.len() > 1 {
                    self.rebalance_pollers();
                }
                self.assign_pooled_jobs();
            }
            Role::Poller => {
                let node = node.with_role(Role::Poller);
                self.job_map.insert(node.clone(), Vec::new());
                self.poller_pool.insert(node, segment.to_string());
                self.assign_pooled_pollers();
                if self.poller_map.len() > 1 {
                    self.rebalance_pollers();
                }
                self.assign_pooled_jobs();
                if self.job_map.len() > 1 {
                    self.rebalance_jobs();
                }
            }
            Role::Controller => {
                warn!("refusing to register controller {node}");
                return;
            }
        }
        info!("node {node} was successfully registered with the controller");
    }

    /// Handles presence loss of a node.
    pub fn remove_entity(&mut self, node: &NodeRef) {
        if self.poller_map.contains_key(node) {
            self.remove_aggregator(node);
        } else if self.job_map.contains_key(node) || self.poller_pool.contains_key(node) {
            self.remove_poller(node);
        } else {
            debug!("{node} is not registered, nothing to remove");
        }
    }

    /// Returns the pollers of a lost aggregator to the pool and places them
    /// elsewhere. If no aggregator is left, each poller is told its
    /// aggregator failed.
    pub fn remove_aggregator(&mut self, aggregator: &NodeRef) {
        let Some(pollers) = self.poller_map.remove(aggregator) else {
            debug!("{aggregator} is not a registered aggregator");
            return;
        };
        info!(
            "removed aggregator {aggregator}, pooling {} pollers",
            pollers.len()
        );

        // Nobody is left to answer the removal of departing pollers.
        let (departing, pollers): (Vec<_>, Vec<_>) = pollers
            .into_iter()
            .partition(|(poller, _)| self.departing.contains(poller));
        for (poller, _) in &departing {
            self.release(poller);
        }
        for (poller, segment) in &pollers {
            self.drop_pending_for(poller);
            self.poller_pool.insert(poller.clone(), segment.clone());
        }

        if !self.assign_pooled_pollers() {
            let rejoined = departing
                .iter()
                .filter(|(poller, _)| self.rejoining.contains_key(poller));
            let orphans: Vec<NodeRef> = pollers
                .iter()
                .chain(rejoined)
                .map(|(poller, _)| poller.clone())
                .collect();
            for poller in &orphans {
                self.dispatch(
                    poller,
                    Outbound::Poller(PollerCall::AggregatorFailure),
                    false,
                    None,
                );
            }
        } else {
            self.assign_pooled_jobs();
        }
        for (poller, _) in &departing {
            self.register_rejoined(poller);
        }
    }

    /// Starts the removal of a lost poller. Assigned pollers are released
    /// through their aggregator and finish in [`Registry::poller_removed`];
    /// pooled ones are dropped at once.
    pub fn remove_poller(&mut self, poller: &NodeRef) {
        if self.departing.contains(poller) {
            debug!("removal of {poller} already requested");
            self.rejoining.remove(poller);
            return;
        }
        if let Some(owner) = self.owner_of(poller).cloned() {
            info!("asking {owner} to release {poller}");
            self.departing.insert(poller.clone());
            self.dispatch(
                &owner,
                Outbound::Aggregator(AggregatorCall::RemovePoller {
                    poller: poller.clone(),
                }),
                false,
                Some(Continuation::PollerRemoved {
                    poller: poller.clone(),
                }),
            );
            return;
        }

        self.poller_pool.remove(poller);
        self.drop_pending_for(poller);
        if let Some(jobs) = self.job_map.remove(poller) {
            for job in jobs {
                info!("returning job {} to the pool", job.id);
                self.job_pool.push(job);
            }
        }
        info!("removed unassigned poller {poller}");
        self.assign_pooled_jobs();
    }

    /// Completion of a `remove_poller` call: the poller's jobs go back to the
    /// pool and get placed again. Runs whatever the aggregator answered.
    pub fn poller_removed(&mut self, poller: &NodeRef) {
        if !self.departing.contains(poller) {
            debug!("{poller} is not departing, ignoring its removal");
            return;
        }
        self.release(poller);
        info!("removed poller {poller}");
        if !self.register_rejoined(poller) {
            self.assign_pooled_jobs();
        }
    }

    /// Forgets a poller everywhere and returns its jobs to the pool.
    fn release(&mut self, poller: &NodeRef) {
        self.departing.remove(poller);
        self.drop_pending_for(poller);
        for pollers in self.poller_map.values_mut() {
            pollers.retain(|(p, _)| p != poller);
        }
        self.poller_pool.remove(poller);
        if let Some(jobs) = self.job_map.remove(poller) {
            for job in jobs {
                info!("returning job {} to the pool", job.id);
                self.job_pool.push(job);
            }
        }
    }

    /// Registers a released poller again if it came back while departing.
    fn register_rejoined(&mut self, poller: &NodeRef) -> bool {
        let Some(segment) = self.rejoining.remove(poller) else {
            return false;
        };
        self.add_entity(Role::Poller, &segment, poller.clone());
        true
    }

    /// A poller failure observed by its aggregator.
    pub fn poller_failure(
        &mut self,
        aggregator: &NodeRef,
        poller: &NodeRef,
    ) -> Result<(), RegistryError> {
        let pollers = self
            .poller_map
            .get_mut(aggregator)
            .ok_or_else(|| RegistryError::UnknownAggregator(aggregator.clone()))?;
        let position = pollers
            .iter()
            .position(|(p, _)| p == poller)
            .ok_or_else(|| RegistryError::UnknownPoller(poller.clone()))?;
        pollers.remove(position);

        self.release(poller);
        warn!("{aggregator} reported failure of {poller}");

        self.rebalance_pollers();
        if !self.register_rejoined(poller) {
            self.assign_pooled_jobs();
        }
        Ok(())
    }

    /// Pools a job. A job with the same id anywhere in the registry is
    /// replaced.
    pub fn add_job(&mut self, job: Job) {
        self.remove_job(job.id);
        self.job_pool.push(job);
    }

    /// Forgets a job wherever it is. A placed job is also stopped on its
    /// poller.
    pub fn remove_job(&mut self, job_id: JobId) -> Option<Job> {
        if let Some(position) = self.job_pool.iter().position(|j| j.id == job_id) {
            let job = self.job_pool.remove(position);
            if let Some(poller) = self.pending.remove(&job_id) {
                self.stop_on(&poller, job_id);
            }
            return Some(job);
        }

        let (poller, position) = self.job_map.iter().find_map(|(poller, jobs)| {
            jobs.iter()
                .position(|j| j.id == job_id)
                .map(|position| (poller.clone(), position))
        })?;
        let job = self
            .job_map
            .get_mut(&poller)
            .map(|jobs| jobs.remove(position))?;
        self.stop_on(&poller, job_id);
        Some(job)
    }

    fn stop_on(&mut self, poller: &NodeRef, job_id: JobId) {
        if let Some(owner) = self.owner_of(poller).cloned() {
            self.dispatch(
                &owner,
                Outbound::Aggregator(AggregatorCall::RemoveJob { job_id }),
                false,
                None,
            );
        }
    }

    /// Acknowledgement of a placement. Moves the job from the pool to the
    /// poller when both are still known.
    pub fn complete_assignment(&mut self, job_id: JobId, poller: &NodeRef) -> bool {
        if self.pending.get(&job_id) == Some(poller) {
            self.pending.remove(&job_id);
        }

        let Some(position) = self.job_pool.iter().position(|j| j.id == job_id) else {
            debug!("job {job_id} is no longer pooled");
            return false;
        };
        let Some(jobs) = self.job_map.get_mut(poller) else {
            warn!("{poller} left before job {job_id} was confirmed");
            return false;
        };

        let job = self.job_pool.remove(position);
        jobs.push(job);
        info!("job {job_id} assigned to {poller}");
        true
    }

    /// A placement was refused. The job stays pooled and becomes eligible
    /// again.
    pub fn abandon_assignment(&mut self, job_id: JobId, poller: &NodeRef) {
        if self.pending.get(&job_id) == Some(poller) {
            self.pending.remove(&job_id);
        }
    }

    fn drop_pending_for(&mut self, poller: &NodeRef) {
        self.pending.retain(|_, p| p != poller);
    }

    pub fn aggregators(&self) -> impl Iterator<Item = &NodeRef> {
        self.poller_map.keys()
    }

    pub fn pollers_of(&self, aggregator: &NodeRef) -> Vec<&NodeRef> {
        self.poller_map
            .get(aggregator)
            .map(|pollers| pollers.iter().map(|(p, _)| p).collect())
            .unwrap_or_default()
    }

    pub fn owner_of(&self, poller: &NodeRef) -> Option<&NodeRef> {
        self.poller_map
            .iter()
            .find(|(_, pollers)| pollers.iter().any(|(p, _)| p == poller))
            .map(|(aggregator, _)| aggregator)
    }

    pub fn jobs_of(&self, poller: &NodeRef) -> &[Job] {
        self.job_map.get(poller).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn pooled_pollers(&self) -> impl Iterator<Item = &NodeRef> {
        self.poller_pool.keys()
    }

    pub fn job_pool(&self) -> &[Job] {
        &self.job_pool
    }

    pub fn pending_poller(&self, job_id: JobId) -> Option<&NodeRef> {
        self.pending.get(&job_id)
    }

    pub fn locate_job(&self, job_id: JobId) -> Option<JobLocation> {
        if self.job_pool.iter().any(|j| j.id == job_id) {
            return Some(JobLocation::Pool);
        }
        self.job_map
            .iter()
            .find(|(_, jobs)| jobs.iter().any(|j| j.id == job_id))
            .map(|(poller, _)| JobLocation::Poller(poller.clone()))
    }

    /// Checks the placement invariants, describing the first violation.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut seen_pollers = BTreeSet::new();
        for pollers in self.poller_map.values() {
            for (poller, _) in pollers {
                if !seen_pollers.insert(poller) {
                    return Err(format!("{poller} is listed under two aggregators"));
                }
                if self.poller_pool.contains_key(poller) {
                    return Err(format!("{poller} is both pooled and assigned"));
                }
            }
        }

        let mut seen_jobs = BTreeSet::new();
        let placed = self.job_map.values().flatten();
        for job in self.job_pool.iter().chain(placed) {
            if !seen_jobs.insert(job.id) {
                return Err(format!("job {} appears in more than one place", job.id));
            }
        }
        Ok(())
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            aggregators: self
                .poller_map
                .iter()
                .map(|(aggregator, pollers)| {
                    (
                        aggregator.address().to_string(),
                        pollers.iter().map(|(p, _)| p.address().to_string()).collect(),
                    )
                })
                .collect(),
            pollers: self
                .job_map
                .iter()
                .map(|(poller, jobs)| {
                    (
                        poller.address().to_string(),
                        jobs.iter().map(|j| j.id).collect(),
                    )
                })
                .collect(),
            poller_pool: self
                .poller_pool
                .keys()
                .map(|p| p.address().to_string())
                .collect(),
            job_pool: self.job_pool.iter().map(|j| j.id).collect(),
            pending: self
                .pending
                .iter()
                .map(|(id, p)| (*id, p.address().to_string()))
                .collect(),
        }
    }
}
