pub mod actors;
pub mod alerts;
pub mod config;
pub mod evaluation;
pub mod probes;
pub mod registry;
pub mod rpc;
pub mod storage;
pub mod util;

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

pub type JobId = i64;

/// The three kinds of node taking part in a fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Controller,
    Aggregator,
    Poller,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Controller => "controller",
            Role::Aggregator => "aggregator",
            Role::Poller => "poller",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identity of a node on the messaging substrate.
///
/// Addresses are normalised (trimmed, lower-cased) on construction. Equality,
/// ordering and hashing only look at the address, so two references to the
/// same node compare equal even if one of them was built with a stale role.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "NodeRefRepr")]
pub struct NodeRef {
    role: Role,
    address: String,
}

#[derive(Deserialize)]
struct NodeRefRepr {
    role: Role,
    address: String,
}

impl From<NodeRefRepr> for NodeRef {
    fn from(repr: NodeRefRepr) -> Self {
        NodeRef::new(repr.role, repr.address)
    }
}

impl NodeRef {
    pub fn new(role: Role, address: impl AsRef<str>) -> Self {
        Self {
            role,
            address: address.as_ref().trim().to_lowercase(),
        }
    }

    pub fn controller(address: impl AsRef<str>) -> Self {
        Self::new(Role::Controller, address)
    }

    pub fn aggregator(address: impl AsRef<str>) -> Self {
        Self::new(Role::Aggregator, address)
    }

    pub fn poller(address: impl AsRef<str>) -> Self {
        Self::new(Role::Poller, address)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Same node, seen under a different role.
    pub fn with_role(&self, role: Role) -> Self {
        Self {
            role,
            address: self.address.clone(),
        }
    }
}

impl PartialEq for NodeRef {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for NodeRef {}

impl Hash for NodeRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl PartialOrd for NodeRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeRef {
    fn cmp(&self, other: &Self) -> Ordering {
        self.address.cmp(&other.address)
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.role, self.address)
    }
}

/// How a job collects its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Snmp,
    Test,
    Libvirt,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Snmp => "snmp",
            Protocol::Test => "test",
            Protocol::Libvirt => "libvirt",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "snmp" => Ok(Protocol::Snmp),
            "test" => Ok(Protocol::Test),
            "libvirt" => Ok(Protocol::Libvirt),
            other => Err(anyhow::anyhow!("unknown protocol '{other}'")),
        }
    }
}

/// A periodic monitoring task as it travels through the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub address: String,
    pub protocol: Protocol,
    /// Seconds between two probe executions.
    pub frequency: u64,
    pub domain: String,
    pub resource: String,
    pub segment: String,
}

impl Job {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.frequency.max(1))
    }
}

/// A value produced by a probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResultValue {
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<ResultValue>),
}

impl ResultValue {
    pub fn is_list(&self) -> bool {
        matches!(self, ResultValue::List(_))
    }
}

impl fmt::Display for ResultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultValue::Int(v) => write!(f, "{v}"),
            ResultValue::Float(v) => write!(f, "{v}"),
            ResultValue::Text(v) => f.write_str(v),
            ResultValue::List(values) => {
                f.write_str("[")?;
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{value}")?;
                }
                f.write_str("]")
            }
        }
    }
}

/// A single probe outcome, timestamped at second precision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub recorded: DateTime<Utc>,
    pub value: ResultValue,
}

impl JobResult {
    pub fn new(job_id: JobId, recorded: DateTime<Utc>, value: ResultValue) -> Self {
        Self {
            job_id,
            recorded: recorded.trunc_subsecs(0),
            value,
        }
    }

    pub fn now(job_id: JobId, value: ResultValue) -> Self {
        Self::new(job_id, Utc::now(), value)
    }
}
