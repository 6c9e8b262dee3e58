//! Job runner - executes one job periodically on a poller
//!
//! ## Timing
//!
//! The loop keeps an accumulating deadline instead of sleeping a fixed
//! period after each probe, so probe latency does not add up:
//!
//! ```text
//! deadline:  0 ──── 5 ──── 10 ──── 15
//! probe:     [2s]   [2s]   [2s]    [2s]
//! sleep:        3s     3s      3s
//! ```
//!
//! A probe overrunning its period delays the next run by at most one
//! period; a runner that fell further behind realigns on the current time.
//!
//! ## Results
//!
//! Each result goes to the current aggregator through the transaction
//! scheduler. Without an aggregator, results are cached until
//! [`JobHandle::flush_cache`] is called.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, trace, warn};

use crate::probes::ProbeSet;
use crate::rpc::{AggregatorCall, RpcCall, Stanza, TransactionScheduler};
use crate::{Job, JobId, JobResult, NodeRef};

/// The aggregator results are reported to, shared by every job of a poller.
pub type AggregatorSlot = Arc<RwLock<Option<NodeRef>>>;

/// Scheduler used by pollers. Their transactions carry no continuation.
pub type PollerScheduler = TransactionScheduler<()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    Running,
    Stopped,
}

struct JobRunner {
    job: Job,
    probes: ProbeSet,
    scheduler: Arc<PollerScheduler>,
    aggregator: AggregatorSlot,
    cache: Arc<Mutex<Vec<JobResult>>>,
    state: Arc<Mutex<JobState>>,
    cancel: CancellationToken,
}

impl JobRunner {
    #[instrument(skip(self), fields(job = self.job.id))]
    async fn run(self) {
        *self.state.lock() = JobState::Running;
        debug!(
            "starting {} job on {} every {}s",
            self.job.protocol, self.job.address, self.job.frequency
        );

        let period = self.job.period();
        let mut next_deadline = Instant::now();

        while !self.cancel.is_cancelled() {
            self.run_once().await;

            next_deadline += period;
            let now = Instant::now();
            if now > next_deadline + period {
                warn!(
                    "job {} is {:?} behind schedule, realigning",
                    self.job.id,
                    now - next_deadline
                );
                next_deadline = now;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = sleep_until(next_deadline) => {}
            }
        }

        *self.state.lock() = JobState::Stopped;
        debug!("job stopped");
    }

    async fn run_once(&self) {
        let probe = self.probes.for_protocol(self.job.protocol);
        match probe.probe(&self.job).await {
            Ok(Some(value)) => {
                let result = JobResult::now(self.job.id, value);
                self.deliver(result).await;
            }
            Ok(None) => trace!("probe produced no value"),
            Err(e) => error!("probe of job {} failed: {e:#}", self.job.id),
        }
    }

    async fn deliver(&self, result: JobResult) {
        let aggregator = self.aggregator.read().clone();
        match aggregator {
            Some(aggregator) => {
                send_result(&self.scheduler, aggregator, result, false).await;
            }
            None => {
                trace!("no aggregator, caching result");
                self.cache.lock().push(result);
            }
        }
    }
}

async fn send_result(
    scheduler: &PollerScheduler,
    aggregator: NodeRef,
    result: JobResult,
    delayed: bool,
) {
    let job_id = result.job_id;
    let call = AggregatorCall::AddResult {
        job_id: result.job_id,
        recorded: result.recorded,
        value: result.value,
    };
    let payload = match call.encode() {
        Ok(payload) => payload,
        Err(e) => {
            error!("unable to encode result of job {job_id}: {e}");
            return;
        }
    };
    if let Err(e) = scheduler
        .send(aggregator, Stanza::Call { payload }, None, delayed)
        .await
    {
        warn!("dropping result of job {job_id}: {e}");
    }
}

/// Handle to a running job.
pub struct JobHandle {
    job: Job,
    scheduler: Arc<PollerScheduler>,
    cache: Arc<Mutex<Vec<JobResult>>>,
    state: Arc<Mutex<JobState>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl JobHandle {
    pub fn spawn(
        job: Job,
        probes: ProbeSet,
        scheduler: Arc<PollerScheduler>,
        aggregator: AggregatorSlot,
    ) -> Self {
        let cache = Arc::new(Mutex::new(Vec::new()));
        let state = Arc::new(Mutex::new(JobState::Created));
        let cancel = CancellationToken::new();

        let runner = JobRunner {
            job: job.clone(),
            probes,
            scheduler: scheduler.clone(),
            aggregator,
            cache: cache.clone(),
            state: state.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(runner.run());

        Self {
            job,
            scheduler,
            cache,
            state,
            cancel,
            task,
        }
    }

    pub fn id(&self) -> JobId {
        self.job.id
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn state(&self) -> JobState {
        *self.state.lock()
    }

    /// Number of results waiting for an aggregator.
    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }

    /// Stops the job before its next period. A probe in flight completes.
    pub fn end(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Sends every cached result to `aggregator`, offset-delayed, and empties
    /// the cache.
    pub async fn flush_cache(&self, aggregator: &NodeRef) {
        let cached = std::mem::take(&mut *self.cache.lock());
        if cached.is_empty() {
            return;
        }
        debug!(
            "flushing {} cached results of job {} to {aggregator}",
            cached.len(),
            self.job.id
        );
        for result in cached {
            send_result(&self.scheduler, aggregator.clone(), result, true).await;
        }
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
