//! Transaction scheduler
//!
//! Tracks every outbound request that expects an answer. Each request gets a
//! clock-derived, strictly increasing correlation id and a single retry timer:
//! if no answer has arrived `retry_after` after the first send, the request is
//! transmitted one more time and then left alone. Answers are matched by id and
//! hand back the continuation registered with the request.
//!
//! ```text
//! send ──► pending[id] ──► transport
//!              │    └── retry timer (delay + retry_after) ──► transport (once)
//!              ▼
//! on_response_received(id) ──► continuation
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tokio::task::AbortHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, trace, warn};

use crate::NodeRef;

use super::messages::{CorrelationId, Envelope, Stanza};
use super::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub retry_after: Duration,
    /// Upper bound (exclusive) of the random offset applied to delayed sends.
    pub max_offset: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            retry_after: Duration::from_secs(10),
            max_offset: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// The scheduler has been shut down.
    Unavailable,
}

impl std::fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerError::Unavailable => write!(f, "transaction scheduler is shut down"),
        }
    }
}

impl std::error::Error for SchedulerError {}

/// What became of an incoming answer.
#[derive(Debug, PartialEq)]
pub enum ResponseMatch<T> {
    /// The transaction was pending and is now complete.
    Completed(Option<T>),
    /// No pending transaction with this id; the answer is ignored.
    Unknown,
}

struct PendingCall<T> {
    to: NodeRef,
    send_task: Option<AbortHandle>,
    retry_task: AbortHandle,
    on_response: Option<T>,
    created_at: Instant,
}

type PendingTable<T> = Arc<parking_lot::Mutex<Option<HashMap<CorrelationId, PendingCall<T>>>>>;

pub struct TransactionScheduler<T> {
    transport: Arc<dyn Transport>,
    settings: SchedulerSettings,
    /// `None` once shut down.
    pending: PendingTable<T>,
    last_id: AtomicU64,
}

impl<T: Send + 'static> TransactionScheduler<T> {
    pub fn new(transport: Arc<dyn Transport>, settings: SchedulerSettings) -> Self {
        Self {
            transport,
            settings,
            pending: Arc::new(parking_lot::Mutex::new(Some(HashMap::new()))),
            last_id: AtomicU64::new(0),
        }
    }

    pub fn local(&self) -> &NodeRef {
        self.transport.local()
    }

    /// Hands out centisecond wall-clock ids, bumped past the previous id when
    /// the clock has not moved or went backwards.
    fn next_id(&self) -> CorrelationId {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| (d.as_millis() / 10) as u64)
            .unwrap_or_default();
        let mut last = self.last_id.load(Ordering::Relaxed);
        loop {
            let next = now.max(last + 1);
            match self
                .last_id
                .compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }

    /// Registers a transaction and transmits it.
    ///
    /// Non-delayed requests go out before this returns. Delayed requests are
    /// sent after a random offset in `[0, max_offset)`. Either way a single
    /// retransmission is scheduled for `offset + retry_after`.
    pub async fn send(
        &self,
        to: NodeRef,
        stanza: Stanza,
        on_response: Option<T>,
        delayed: bool,
    ) -> Result<CorrelationId, SchedulerError> {
        let offset = if delayed && !self.settings.max_offset.is_zero() {
            let max = self.settings.max_offset.as_millis() as u64;
            Duration::from_millis(rand::rng().random_range(0..max))
        } else {
            Duration::ZERO
        };

        let envelope = {
            let mut guard = self.pending.lock();
            let table = guard.as_mut().ok_or(SchedulerError::Unavailable)?;

            let id = self.next_id();
            let envelope = Envelope {
                id: Some(id),
                from: self.local().clone(),
                to: Some(to.clone()),
                stanza,
            };

            let retry_task = tokio::spawn(retransmit(
                self.pending.clone(),
                self.transport.clone(),
                id,
                envelope.clone(),
                offset + self.settings.retry_after,
            ))
            .abort_handle();

            let send_task = delayed.then(|| {
                let transport = self.transport.clone();
                let envelope = envelope.clone();
                tokio::spawn(async move {
                    sleep(offset).await;
                    if let Err(e) = transport.send(envelope).await {
                        warn!("delayed send of transaction {id} failed: {e:#}");
                    }
                })
                .abort_handle()
            });

            table.insert(
                id,
                PendingCall {
                    to,
                    send_task,
                    retry_task,
                    on_response,
                    created_at: Instant::now(),
                },
            );
            envelope
        };

        let id = envelope.id.unwrap_or_default();
        if delayed {
            trace!("transaction {id} scheduled in {offset:?}");
        } else if let Err(e) = self.transport.send(envelope).await {
            warn!("send of transaction {id} failed: {e:#}");
        }
        Ok(id)
    }

    /// Completes the transaction `id` if it is pending and answered by the
    /// node it was sent to. The retry timer is cancelled before returning.
    pub fn on_response_received(&self, id: CorrelationId, sender: &NodeRef) -> ResponseMatch<T> {
        let completed = {
            let mut guard = self.pending.lock();
            let Some(table) = guard.as_mut() else {
                return ResponseMatch::Unknown;
            };
            match table.get(&id) {
                Some(call) if call.to == *sender => table.remove(&id),
                Some(call) => {
                    debug!("answer to {id} from {sender}, expected {}", call.to);
                    None
                }
                None => None,
            }
        };

        match completed {
            Some(call) => {
                call.retry_task.abort();
                trace!(
                    "transaction {id} completed after {:?}",
                    call.created_at.elapsed()
                );
                ResponseMatch::Completed(call.on_response)
            }
            None => {
                debug!("ignoring answer to unknown transaction {id} from {sender}");
                ResponseMatch::Unknown
            }
        }
    }

    pub fn is_pending(&self, id: CorrelationId) -> bool {
        self.pending
            .lock()
            .as_ref()
            .is_some_and(|table| table.contains_key(&id))
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().as_ref().map_or(0, HashMap::len)
    }

    /// Cancels every outstanding timer. Later sends fail with
    /// [`SchedulerError::Unavailable`].
    pub fn shutdown(&self) {
        let table = self.pending.lock().take();
        if let Some(table) = table {
            debug!("scheduler shutting down with {} pending", table.len());
            for call in table.into_values() {
                call.retry_task.abort();
                if let Some(task) = call.send_task {
                    task.abort();
                }
            }
        }
    }
}

async fn retransmit<T>(
    pending: PendingTable<T>,
    transport: Arc<dyn Transport>,
    id: CorrelationId,
    envelope: Envelope,
    after: Duration,
) {
    sleep(after).await;

    let still_pending = pending
        .lock()
        .as_ref()
        .is_some_and(|table| table.contains_key(&id));
    if !still_pending {
        return;
    }

    let to = envelope
        .to
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_default();
    warn!("no answer to transaction {id} from {to}, sending once more");
    if let Err(e) = transport.send(envelope).await {
        error!("retry of transaction {id} failed: {e:#}");
    }
}
