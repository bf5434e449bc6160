//! Dispatch worker pool.
//!
//! A fixed number of named threads claim leased tasks from a [`TaskQueue`]
//! and hand them to the [`Dispatcher`]. A task is acked once the dispatcher
//! has taken responsibility for it (terminal outcome or pending vendor job).
//! A storage error leaves the task leased for redelivery, up to
//! `max_deliveries`; anything else the dispatcher rejects is dead-lettered.

use std::io;
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use taskforge_core::TaskError;

use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::ledger::QuotaLedger;
use crate::store::ResultStore;

use super::store::{QueueError, TaskQueue};

/// Dispatch pool configuration.
#[derive(Debug, Clone)]
pub struct DispatchPoolConfig {
    pub workers: usize,
    /// How long an idle worker waits before claiming again.
    pub idle_sleep: Duration,
    /// Lease taken on each claimed task.
    pub lease_ttl: Duration,
    /// Deliveries a task may use up on storage errors before it is
    /// dead-lettered.
    pub max_deliveries: u32,
    /// Thread name prefix and log field.
    pub name: String,
}

impl Default for DispatchPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            idle_sleep: Duration::from_millis(100),
            lease_ttl: Duration::from_secs(600),
            max_deliveries: 5,
            name: "dispatch".to_string(),
        }
    }
}

impl DispatchPoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolStats {
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub pending: u64,
    pub skipped: u64,
    pub deferred: u64,
    pub dead_lettered: u64,
    pub uptime_secs: u64,
}

impl PoolStats {
    fn record(&mut self, outcome: DispatchOutcome) {
        self.dispatched += 1;
        match outcome {
            DispatchOutcome::Succeeded => self.succeeded += 1,
            DispatchOutcome::Failed | DispatchOutcome::Expired => self.failed += 1,
            DispatchOutcome::Pending => self.pending += 1,
            DispatchOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// Result of one claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Nothing to claim.
    Idle,
    Dispatched(DispatchOutcome),
    /// A store write failed; the task stays leased and is redelivered when
    /// the lease expires.
    Deferred(String),
    /// The payload was rejected and parked with this reason.
    DeadLettered(String),
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct DispatchPoolHandle {
    shutdown: Vec<mpsc::Sender<()>>,
    joins: Vec<thread::JoinHandle<()>>,
    stats: Arc<Mutex<PoolStats>>,
    started: Instant,
}

impl DispatchPoolHandle {
    /// Request graceful shutdown and wait for every worker to finish its
    /// current task.
    pub fn shutdown(self) {
        for tx in &self.shutdown {
            let _ = tx.send(());
        }
        for join in self.joins {
            let _ = join.join();
        }
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

pub struct DispatchPool<Q, S, L> {
    queue: Q,
    dispatcher: Arc<Dispatcher<S, L>>,
    config: DispatchPoolConfig,
}

impl<Q: TaskQueue, S: ResultStore, L: QuotaLedger> DispatchPool<Q, S, L> {
    pub fn new(queue: Q, dispatcher: Arc<Dispatcher<S, L>>, config: DispatchPoolConfig) -> Self {
        Self {
            queue,
            dispatcher,
            config,
        }
    }

    /// Claim and dispatch one task (for tests or synchronous use).
    pub fn run_once(&self, worker: &str) -> Result<Delivery, QueueError> {
        let Some(task) = self.queue.claim_next(worker, self.config.lease_ttl)? else {
            return Ok(Delivery::Idle);
        };
        debug!(worker, task_id = %task.id, task_type = %task.task_type, deliveries = task.deliveries, "claimed task");

        match self.dispatcher.dispatch(&task.payload, task.task_type) {
            Ok(outcome) => {
                self.queue.ack(&task.id)?;
                Ok(Delivery::Dispatched(outcome))
            }
            Err(e @ TaskError::Storage(_)) if task.deliveries < self.config.max_deliveries => {
                warn!(worker, task_id = %task.id, deliveries = task.deliveries, error = %e, "task outcome not recorded, leaving for redelivery");
                Ok(Delivery::Deferred(e.to_string()))
            }
            Err(e) => {
                warn!(worker, task_id = %task.id, task_type = %task.task_type, error = %e, "task rejected, dead-lettering");
                let reason = e.to_string();
                self.queue.dead_letter(&task.id, reason.clone())?;
                Ok(Delivery::DeadLettered(reason))
            }
        }
    }
}

impl<Q, S, L> DispatchPool<Q, S, L>
where
    Q: TaskQueue + 'static,
    S: ResultStore + 'static,
    L: QuotaLedger + 'static,
{
    /// Spawn the configured number of worker threads.
    pub fn spawn(self) -> io::Result<DispatchPoolHandle> {
        let workers = self.config.workers.max(1);
        let pool = Arc::new(self);
        let stats = Arc::new(Mutex::new(PoolStats::default()));

        let mut shutdown = Vec::with_capacity(workers);
        let mut joins = Vec::with_capacity(workers);
        for i in 0..workers {
            let (tx, rx) = mpsc::channel::<()>();
            let worker = format!("{}-{i}", pool.config.name);
            let worker_pool = pool.clone();
            let worker_stats = stats.clone();
            let spawned = thread::Builder::new()
                .name(worker.clone())
                .spawn(move || worker_loop(&worker_pool, &worker, rx, &worker_stats));
            match spawned {
                Ok(join) => {
                    shutdown.push(tx);
                    joins.push(join);
                }
                Err(e) => {
                    DispatchPoolHandle {
                        shutdown,
                        joins,
                        stats,
                        started: Instant::now(),
                    }
                    .shutdown();
                    return Err(e);
                }
            }
        }

        info!(pool = %pool.config.name, workers, "dispatch pool started");
        Ok(DispatchPoolHandle {
            shutdown,
            joins,
            stats,
            started: Instant::now(),
        })
    }
}

fn worker_loop<Q: TaskQueue, S: ResultStore, L: QuotaLedger>(
    pool: &DispatchPool<Q, S, L>,
    worker: &str,
    shutdown_rx: mpsc::Receiver<()>,
    stats: &Mutex<PoolStats>,
) {
    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        let idle = match pool.run_once(worker) {
            Ok(Delivery::Idle) => true,
            Ok(Delivery::Dispatched(outcome)) => {
                stats
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .record(outcome);
                false
            }
            Ok(Delivery::Deferred(_)) => {
                stats
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .deferred += 1;
                true
            }
            Ok(Delivery::DeadLettered(_)) => {
                stats
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .dead_lettered += 1;
                false
            }
            Err(e) => {
                error!(worker, error = %e, "queue error");
                true
            }
        };

        if idle {
            match shutdown_rx.recv_timeout(pool.config.idle_sleep) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => {}
            }
        }
    }

    debug!(worker, "dispatch worker stopped");
}
