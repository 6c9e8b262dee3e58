//! Wire types exchanged between fleet nodes
//!
//! Calls are encoded as `{"method": ..., "params": {...}}` objects inside a
//! [`Stanza::Call`]. Each role accepts exactly the methods of its call enum;
//! anything else is answered with an error stanza.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::evaluation::{Comparator, Threshold};
use crate::storage::schema::JobSpec;
use crate::{Job, JobId, NodeRef, ResultValue, Role};

pub type CorrelationId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Transaction id. Present on calls, discovery queries and their answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CorrelationId>,
    pub from: NodeRef,
    /// `None` broadcasts to every member (presence only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<NodeRef>,
    pub stanza: Stanza,
}

impl Envelope {
    pub fn presence(from: NodeRef, available: bool) -> Self {
        Self {
            id: None,
            from,
            to: None,
            stanza: Stanza::Presence { available },
        }
    }

    /// Builds the answer to this envelope, keeping its transaction id.
    pub fn reply(&self, from: &NodeRef, stanza: Stanza) -> Self {
        Self {
            id: self.id,
            from: from.clone(),
            to: Some(self.from.clone()),
            stanza,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Stanza {
    Presence { available: bool },
    Call { payload: Value },
    Disco,
    Identity { identity: Identity },
    Result { outcome: Outcome },
    Error { reason: String },
}

impl Stanza {
    pub fn kind(&self) -> &'static str {
        match self {
            Stanza::Presence { .. } => "presence",
            Stanza::Call { .. } => "call",
            Stanza::Disco => "disco",
            Stanza::Identity { .. } => "identity",
            Stanza::Result { .. } => "result",
            Stanza::Error { .. } => "error",
        }
    }
}

/// Discovery answer. The category of a poller is its segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub category: String,
    #[serde(rename = "type")]
    pub entity_type: String,
}

impl Identity {
    pub fn new(category: impl Into<String>, role: Role) -> Self {
        Self {
            category: category.into(),
            entity_type: role.as_str().to_string(),
        }
    }

    pub fn role(&self) -> Option<Role> {
        match self.entity_type.as_str() {
            "aggregator" => Some(Role::Aggregator),
            "poller" => Some(Role::Poller),
            "controller" => Some(Role::Controller),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    Failure,
}

/// Reply to a call: a status and a list of values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub status: Status,
    #[serde(default)]
    pub values: Vec<Value>,
}

impl Outcome {
    pub fn success(values: Vec<Value>) -> Self {
        Self {
            status: Status::Success,
            values,
        }
    }

    pub fn failure(values: Vec<Value>) -> Self {
        Self {
            status: Status::Failure,
            values,
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self::success(vec![Value::String(message.into())])
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::failure(vec![Value::String(message.into())])
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

/// The answer half of a transaction, as handed to continuations.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Identity(Identity),
    Outcome(Outcome),
    Error(String),
}

impl Reply {
    /// Extracts the reply carried by a stanza, if it completes a transaction.
    pub fn from_stanza(stanza: Stanza) -> Option<Self> {
        match stanza {
            Stanza::Identity { identity } => Some(Reply::Identity(identity)),
            Stanza::Result { outcome } => Some(Reply::Outcome(outcome)),
            Stanza::Error { reason } => Some(Reply::Error(reason)),
            Stanza::Presence { .. } | Stanza::Call { .. } | Stanza::Disco => None,
        }
    }

    pub fn is_success(&self) -> bool {
        match self {
            Reply::Identity(_) => true,
            Reply::Outcome(outcome) => outcome.is_success(),
            Reply::Error(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The method is not in the receiving role's allow-list.
    NotAllowed(String),
    /// Method is known but its parameters do not match.
    ArgumentMismatch(String),
    Malformed(String),
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::NotAllowed(method) => write!(f, "method '{method}' is not allowed"),
            CallError::ArgumentMismatch(msg) => write!(f, "argument mismatch: {msg}"),
            CallError::Malformed(msg) => write!(f, "malformed call: {msg}"),
        }
    }
}

impl std::error::Error for CallError {}

/// A set of remotely invocable methods.
pub trait RpcCall: Serialize + DeserializeOwned {
    const METHODS: &'static [&'static str];

    fn method(&self) -> &'static str;

    fn decode(payload: &Value) -> Result<Self, CallError> {
        let method = payload
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| CallError::Malformed("missing method name".to_string()))?;
        if !Self::METHODS.contains(&method) {
            return Err(CallError::NotAllowed(method.to_string()));
        }
        Self::deserialize(payload).map_err(|e| CallError::ArgumentMismatch(e.to_string()))
    }

    fn encode(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}

/// Methods served by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "method",
    content = "params",
    rename_all = "snake_case",
    deny_unknown_fields
)]
pub enum ControllerCall {
    GetGroup {
        name: String,
    },
    GetGroups,
    CreateGroup {
        name: String,
        description: String,
    },
    UpdateGroup {
        id: i64,
        name: String,
        description: String,
    },
    RemoveGroup {
        name: String,
    },
    GetMonitor {
        name: String,
    },
    GetMonitors {
        #[serde(default)]
        group: Option<String>,
    },
    GetMonitorsByGid {
        group_id: i64,
    },
    CreateMonitor {
        name: String,
        description: String,
        #[serde(default)]
        group: Option<String>,
    },
    UpdateMonitor {
        id: i64,
        name: String,
        description: String,
        #[serde(default)]
        group: Option<String>,
    },
    RemoveMonitor {
        name: String,
    },
    GetJob {
        monitor: String,
        id: JobId,
    },
    GetJobs {
        monitor: String,
    },
    CreateJob {
        monitor: String,
        job: JobSpec,
    },
    UpdateJob {
        monitor: String,
        id: JobId,
        job: JobSpec,
    },
    RemoveJob {
        monitor: String,
        id: JobId,
    },
    GetEvaluation {
        id: i64,
    },
    GetEvaluations {
        job: JobId,
    },
    CreateEvaluation {
        job: JobId,
        comparator: Comparator,
        threshold: Threshold,
    },
    UpdateEvaluation {
        id: i64,
        comparator: Comparator,
        threshold: Threshold,
    },
    RemoveEvaluation {
        id: i64,
    },
    GetResults {
        monitor: String,
        job: JobId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    GetResultsHour {
        monitor: String,
        job: JobId,
        start: DateTime<Utc>,
    },
    GetResultsDay {
        monitor: String,
        job: JobId,
        start: DateTime<Utc>,
    },
    GetResultsWeek {
        monitor: String,
        job: JobId,
        start: DateTime<Utc>,
    },
    PollerFailure {
        poller: NodeRef,
    },
}

impl RpcCall for ControllerCall {
    const METHODS: &'static [&'static str] = &[
        "get_group",
        "get_groups",
        "create_group",
        "update_group",
        "remove_group",
        "get_monitor",
        "get_monitors",
        "get_monitors_by_gid",
        "create_monitor",
        "update_monitor",
        "remove_monitor",
        "get_job",
        "get_jobs",
        "create_job",
        "update_job",
        "remove_job",
        "get_evaluation",
        "get_evaluations",
        "create_evaluation",
        "update_evaluation",
        "remove_evaluation",
        "get_results",
        "get_results_hour",
        "get_results_day",
        "get_results_week",
        "poller_failure",
    ];

    fn method(&self) -> &'static str {
        match self {
            ControllerCall::GetGroup { .. } => "get_group",
            ControllerCall::GetGroups => "get_groups",
            ControllerCall::CreateGroup { .. } => "create_group",
            ControllerCall::UpdateGroup { .. } => "update_group",
            ControllerCall::RemoveGroup { .. } => "remove_group",
            ControllerCall::GetMonitor { .. } => "get_monitor",
            ControllerCall::GetMonitors { .. } => "get_monitors",
            ControllerCall::GetMonitorsByGid { .. } => "get_monitors_by_gid",
            ControllerCall::CreateMonitor { .. } => "create_monitor",
            ControllerCall::UpdateMonitor { .. } => "update_monitor",
            ControllerCall::RemoveMonitor { .. } => "remove_monitor",
            ControllerCall::GetJob { .. } => "get_job",
            ControllerCall::GetJobs { .. } => "get_jobs",
            ControllerCall::CreateJob { .. } => "create_job",
            ControllerCall::UpdateJob { .. } => "update_job",
            ControllerCall::RemoveJob { .. } => "remove_job",
            ControllerCall::GetEvaluation { .. } => "get_evaluation",
            ControllerCall::GetEvaluations { .. } => "get_evaluations",
            ControllerCall::CreateEvaluation { .. } => "create_evaluation",
            ControllerCall::UpdateEvaluation { .. } => "update_evaluation",
            ControllerCall::RemoveEvaluation { .. } => "remove_evaluation",
            ControllerCall::GetResults { .. } => "get_results",
            ControllerCall::GetResultsHour { .. } => "get_results_hour",
            ControllerCall::GetResultsDay { .. } => "get_results_day",
            ControllerCall::GetResultsWeek { .. } => "get_results_week",
            ControllerCall::PollerFailure { .. } => "poller_failure",
        }
    }
}

/// Methods served by aggregators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "method",
    content = "params",
    rename_all = "snake_case",
    deny_unknown_fields
)]
pub enum AggregatorCall {
    RunJob {
        poller: NodeRef,
        job: Job,
    },
    MoveJob {
        poller: NodeRef,
        job: Job,
    },
    AddPoller {
        poller: NodeRef,
    },
    RemovePoller {
        poller: NodeRef,
    },
    RemoveJob {
        job_id: JobId,
    },
    AddResult {
        job_id: JobId,
        recorded: DateTime<Utc>,
        value: ResultValue,
    },
}

impl RpcCall for AggregatorCall {
    const METHODS: &'static [&'static str] = &[
        "run_job",
        "move_job",
        "add_poller",
        "remove_poller",
        "remove_job",
        "add_result",
    ];

    fn method(&self) -> &'static str {
        match self {
            AggregatorCall::RunJob { .. } => "run_job",
            AggregatorCall::MoveJob { .. } => "move_job",
            AggregatorCall::AddPoller { .. } => "add_poller",
            AggregatorCall::RemovePoller { .. } => "remove_poller",
            AggregatorCall::RemoveJob { .. } => "remove_job",
            AggregatorCall::AddResult { .. } => "add_result",
        }
    }
}

/// Methods served by pollers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "method",
    content = "params",
    rename_all = "snake_case",
    deny_unknown_fields
)]
pub enum PollerCall {
    RunJob { aggregator: NodeRef, job: Job },
    SetAggregator { aggregator: NodeRef },
    RemoveJob { job_id: JobId },
    AggregatorFailure,
}

impl RpcCall for PollerCall {
    const METHODS: &'static [&'static str] = &[
        "run_job",
        "set_aggregator",
        "remove_job",
        "aggregator_failure",
    ];

    fn method(&self) -> &'static str {
        match self {
            PollerCall::RunJob { .. } => "run_job",
            PollerCall::SetAggregator { .. } => "set_aggregator",
            PollerCall::RemoveJob { .. } => "remove_job",
            PollerCall::AggregatorFailure => "aggregator_failure",
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::Protocol;

    fn job() -> Job {
        Job {
            id: 7,
            address: "10.0.0.1".into(),
            protocol: Protocol::Snmp,
            frequency: 30,
            domain: "public".into(),
            resource: "1.3.6.1.2.1.1.3.0".into(),
            segment: "east".into(),
        }
    }

    #[test]
    fn calls_use_method_and_params() {
        let call = AggregatorCall::RunJob {
            poller: NodeRef::poller("p1"),
            job: job(),
        };
        let payload = call.encode().unwrap();

        assert_eq!(payload["method"], "run_job");
        assert_eq!(payload["params"]["poller"]["address"], "p1");
        assert_eq!(AggregatorCall::decode(&payload).unwrap(), call);
    }

    #[test]
    fn unit_calls_round_trip_without_params() {
        let payload = json!({ "method": "aggregator_failure" });

        assert_eq!(
            PollerCall::decode(&payload).unwrap(),
            PollerCall::AggregatorFailure
        );
    }

    #[test]
    fn methods_outside_the_allow_list_are_rejected() {
        let payload = json!({ "method": "set_aggregator", "params": { "aggregator": { "role": "aggregator", "address": "a" } } });

        assert_matches!(
            AggregatorCall::decode(&payload),
            Err(CallError::NotAllowed(method)) if method == "set_aggregator"
        );
    }

    #[test]
    fn extra_or_missing_params_are_argument_mismatches() {
        let extra = json!({ "method": "remove_job", "params": { "job_id": 1, "force": true } });
        let missing = json!({ "method": "remove_job", "params": {} });

        assert_matches!(
            PollerCall::decode(&extra),
            Err(CallError::ArgumentMismatch(_))
        );
        assert_matches!(
            PollerCall::decode(&missing),
            Err(CallError::ArgumentMismatch(_))
        );
    }

    #[test]
    fn every_listed_method_has_a_variant() {
        let call = ControllerCall::PollerFailure {
            poller: NodeRef::poller("p"),
        };
        assert!(ControllerCall::METHODS.contains(&call.method()));
        assert_eq!(ControllerCall::METHODS.len(), 26);
    }

    #[test]
    fn replies_complete_on_identity_result_and_error() {
        let identity = Identity::new("east", Role::Poller);
        assert_eq!(identity.role(), Some(Role::Poller));

        assert!(Reply::from_stanza(Stanza::Identity { identity }).is_some());
        assert!(
            Reply::from_stanza(Stanza::Error {
                reason: "boom".into()
            })
            .is_some()
        );
        assert!(Reply::from_stanza(Stanza::Disco).is_none());
        assert!(!Reply::Error("boom".into()).is_success());
    }

    #[test]
    fn envelope_reply_keeps_transaction_id() {
        let request = Envelope {
            id: Some(42),
            from: NodeRef::controller("controller"),
            to: Some(NodeRef::poller("p1")),
            stanza: Stanza::Disco,
        };
        let reply = request.reply(
            &NodeRef::poller("p1"),
            Stanza::Identity {
                identity: Identity::new("east", Role::Poller),
            },
        );

        assert_eq!(reply.id, Some(42));
        assert_eq!(reply.to, Some(NodeRef::controller("controller")));
    }
}
