//! Message types for actor communication
//!
//! Every node actor is driven by two inputs: envelopes from the messaging
//! substrate and commands from its handle. This module defines the commands
//! and the snapshots they return.

use std::collections::BTreeMap;

use serde::Serialize;
use tokio::sync::oneshot;

use crate::registry::RegistrySnapshot;
use crate::{JobId, NodeRef};

/// Commands that can be sent to the ControllerActor
#[derive(Debug)]
pub enum ControllerCommand {
    /// Copy of the registry state
    Snapshot {
        respond_to: oneshot::Sender<RegistrySnapshot>,
    },

    /// Cancel pending transactions and leave the fleet
    Shutdown { respond_to: oneshot::Sender<()> },
}

/// Commands that can be sent to the AggregatorActor
#[derive(Debug)]
pub enum AggregatorCommand {
    Snapshot {
        respond_to: oneshot::Sender<AggregatorSnapshot>,
    },

    Shutdown { respond_to: oneshot::Sender<()> },
}

/// Commands that can be sent to the PollerActor
#[derive(Debug)]
pub enum PollerCommand {
    Snapshot {
        respond_to: oneshot::Sender<PollerSnapshot>,
    },

    /// End every job, cancel pending transactions and leave the fleet
    Shutdown { respond_to: oneshot::Sender<()> },
}

/// What an aggregator currently hosts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregatorSnapshot {
    /// Poller address → ids of the jobs it runs
    pub pollers: BTreeMap<String, Vec<JobId>>,

    /// Jobs whose last evaluation failed
    pub failing: Vec<JobId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollerSnapshot {
    pub aggregator: Option<NodeRef>,

    /// Ids of the running jobs, ascending
    pub jobs: Vec<JobId>,

    /// Results waiting for an aggregator, over all jobs
    pub cached: usize,
}
