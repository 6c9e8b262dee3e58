//! Node actors of the monitoring fleet
//!
//! Each node runs one actor as an independent async task. The actor owns all
//! mutable node state and is driven by envelopes from the messaging substrate
//! and by commands from its handle.
//!
//! ## Architecture Overview
//!
//! ```text
//!                 ┌──────────────────┐
//!                 │    Controller    │ registry, admin records
//!                 └────────┬─────────┘
//!                          │ add_poller / run_job / move_job
//!            ┌─────────────┴─────────────┐
//!            │                           │
//!    ┌───────▼───────┐           ┌───────▼───────┐
//!    │ Aggregator A  │           │ Aggregator B  │ results, evaluation, alerts
//!    └───────┬───────┘           └───────┬───────┘
//!            │ run_job / set_aggregator  │
//!      ┌─────┴─────┐               ┌─────┴─────┐
//!  ┌───▼───┐   ┌───▼───┐       ┌───▼───┐   ┌───▼───┐
//!  │Poller │   │Poller │       │Poller │   │Poller │ periodic probes
//!  └───────┘   └───────┘       └───────┘   └───────┘
//! ```
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: each handle talks to its actor over an mpsc channel
//! 2. **Calls**: nodes call each other through the transaction scheduler
//! 3. **Request/Response**: oneshot channels for snapshots and shutdown

pub mod aggregator;
pub mod controller;
pub mod job;
pub mod messages;
pub mod poller;

pub use aggregator::AggregatorHandle;
pub use controller::ControllerHandle;
pub use poller::PollerHandle;
