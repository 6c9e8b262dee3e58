//! Messaging between fleet nodes
//!
//! Every node talks to the others through a [`transport::Transport`]: presence
//! announcements, discovery queries and remote calls all travel as
//! [`messages::Envelope`]s. Calls that expect an answer are tracked by the
//! [`scheduler::TransactionScheduler`], which retransmits once and pairs
//! responses with the continuation registered for them.

pub mod memory;
pub mod messages;
pub mod mqtt;
pub mod scheduler;
pub mod transport;

pub use messages::{
    AggregatorCall, CallError, ControllerCall, CorrelationId, Envelope, Identity, Outcome,
    PollerCall, Reply, RpcCall, Stanza, Status,
};
pub use scheduler::{ResponseMatch, SchedulerError, SchedulerSettings, TransactionScheduler};
pub use transport::{Connection, Transport};
