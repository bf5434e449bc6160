//! Pending-task poller: drives accepted vendor jobs to a terminal outcome.
//!
//! ## Tick
//!
//! ```text
//! due_pending_tasks(now) ──▶ split across `concurrency` threads
//!                                   │
//!                   ┌───────────────┼────────────────┐
//!               deadline?       handler.poll      decode error
//!                   │          ╱     │      ╲          │
//!                 fail     rearm  complete  fail   fail row only
//! ```
//!
//! Every terminal path goes through [`Settler`], whose conditional queue-row
//! write decides who settles; the pending row is closed afterwards. Two
//! pollers racing on the same task settle it once, and a store error defers
//! the task to the next tick without touching quota.

use std::io;
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use taskforge_ai::CallContext;
use taskforge_core::{
    PendingPayload, PendingTask, PendingTaskUpdate, QueueTaskStatus, TaskError, TaskId,
    TaskPayload, Transition,
};

use crate::fault;
use crate::handlers::{validate_completion, HandlerRegistry, PollOutcome, VendorJobRef};
use crate::jobs::PollSchedule;
use crate::ledger::QuotaLedger;
use crate::settle::{Settled, Settler};
use crate::store::{ResultStore, StoreError};

#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Pause between ticks.
    pub tick: Duration,
    /// Due tasks fetched per tick.
    pub batch_size: usize,
    /// Threads polling vendors within one tick.
    pub concurrency: usize,
    pub call_timeout: Duration,
    pub schedule: PollSchedule,
    pub name: String,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            batch_size: 64,
            concurrency: 8,
            call_timeout: Duration::from_secs(60),
            schedule: PollSchedule::default(),
            name: "pending-poller".to_string(),
        }
    }
}

impl PollerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }
}

/// What one poll did to a pending task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDisposition {
    /// Still running at the vendor; scheduled again.
    Rearmed,
    Succeeded,
    Failed,
    /// Already terminal, or lost the race to another poller.
    Skipped,
    /// A store write failed; the task stays Processing for the next tick.
    Deferred,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PollSummary {
    pub due: usize,
    pub rearmed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub deferred: usize,
}

impl PollSummary {
    fn record(&mut self, disposition: PollDisposition) {
        match disposition {
            PollDisposition::Rearmed => self.rearmed += 1,
            PollDisposition::Succeeded => self.succeeded += 1,
            PollDisposition::Failed => self.failed += 1,
            PollDisposition::Skipped => self.skipped += 1,
            PollDisposition::Deferred => self.deferred += 1,
        }
    }
}

/// Poller runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PollerStats {
    pub ticks: u64,
    pub polled: u64,
    pub rearmed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub deferred: u64,
    pub tick_errors: u64,
}

/// Handle to control a running poller.
#[derive(Debug)]
pub struct PollerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<PollerStats>>,
}

impl PollerHandle {
    /// Request graceful shutdown and wait for the current tick to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> PollerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub struct PendingTaskPoller<S, L> {
    handlers: Arc<HandlerRegistry>,
    settler: Arc<Settler<S, L>>,
    config: PollerConfig,
}

impl<S: ResultStore, L: QuotaLedger> PendingTaskPoller<S, L> {
    pub fn new(
        handlers: Arc<HandlerRegistry>,
        settler: Arc<Settler<S, L>>,
        config: PollerConfig,
    ) -> Self {
        Self {
            handlers,
            settler,
            config,
        }
    }

    /// Poll every task due at `now`, up to the batch size.
    pub fn poll_due(&self, now: DateTime<Utc>) -> Result<PollSummary, StoreError> {
        let due = self
            .settler
            .store()
            .due_pending_tasks(now, self.config.batch_size)?;
        let mut summary = PollSummary {
            due: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            return Ok(summary);
        }

        let workers = self.config.concurrency.max(1);
        if workers == 1 || due.len() == 1 {
            for task in &due {
                summary.record(self.poll_one(task, now));
            }
            return Ok(summary);
        }

        let chunk = due.len().div_ceil(workers);
        thread::scope(|scope| {
            let joins: Vec<_> = due
                .chunks(chunk)
                .map(|tasks| {
                    scope.spawn(move || {
                        tasks
                            .iter()
                            .map(|task| self.poll_one(task, now))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            for join in joins {
                match join.join() {
                    Ok(dispositions) => dispositions
                        .into_iter()
                        .for_each(|d| summary.record(d)),
                    Err(_) => error!(poller = %self.config.name, "poll thread panicked"),
                }
            }
        });
        Ok(summary)
    }

    /// Poll a single pending task.
    pub fn poll_one(&self, task: &PendingTask, now: DateTime<Utc>) -> PollDisposition {
        if task.status.is_terminal() {
            return PollDisposition::Skipped;
        }
        let task_id = &task.task_id;

        if let Some(status) = self.settled_status(task_id) {
            debug!(task_id = %task_id, "queue task already terminal, closing pending task");
            let update = match status {
                QueueTaskStatus::Success => PendingTaskUpdate::succeeded(),
                _ => PendingTaskUpdate::failed(),
            };
            self.close_pending(task_id, update);
            return PollDisposition::Skipped;
        }

        let (payload, job) = match replay(task) {
            Ok(replayed) => replayed,
            Err(e) => {
                error!(task_id = %task_id, error = %e, "pending task payload cannot be replayed");
                let settled = self.settler.fail_unreplayable(task_id, &e);
                return self.after_settlement(task_id, settled, PendingTaskUpdate::failed());
            }
        };

        if task.deadline_passed(now) {
            warn!(task_id = %task_id, deadline_at = %task.deadline_at, attempts = task.execute_times, "pending task deadline exceeded");
            return self.finish_failed(task_id, &payload, &TaskError::DeadlineExceeded);
        }

        let Some(handler) = self.handlers.get(task.task_type) else {
            let err = TaskError::NoHandler(task.task_type.to_string());
            return self.finish_failed(task_id, &payload, &err);
        };

        let ctx = CallContext::new(task_id.clone(), self.config.call_timeout);
        match fault::guard(|| handler.poll(&ctx, &payload, &job)) {
            Ok(PollOutcome::InProgress) => self.rearm(task, now),
            Err(e) if e.is_transient() => {
                warn!(task_id = %task_id, vendor = %job.vendor, error = %e, "vendor status unavailable, retrying later");
                self.rearm(task, now)
            }
            Ok(PollOutcome::Failed(message)) => {
                self.finish_failed(task_id, &payload, &TaskError::vendor_failed(message))
            }
            Err(e) => self.finish_failed(task_id, &payload, &e),
            Ok(PollOutcome::Completed(completion)) => {
                let completion = match validate_completion(handler.as_ref(), completion) {
                    Ok(c) => c,
                    Err(e) => return self.finish_failed(task_id, &payload, &e),
                };
                let settled = self
                    .settler
                    .complete(task_id, handler.as_ref(), &payload, completion);
                self.after_settlement(task_id, settled, PendingTaskUpdate::succeeded())
            }
        }
    }

    /// Terminal status of the queue row, if it already has one.
    fn settled_status(&self, task_id: &TaskId) -> Option<QueueTaskStatus> {
        match self.settler.store().get_queue_task(task_id) {
            Ok(Some(row)) if row.status.is_terminal() => Some(row.status),
            Ok(_) => None,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "could not read queue row");
                None
            }
        }
    }

    fn rearm(&self, task: &PendingTask, now: DateTime<Utc>) -> PollDisposition {
        let attempts = task.execute_times.saturating_add(1);
        let next = self
            .config
            .schedule
            .next_poll_at(now, attempts.saturating_add(1));
        match self
            .settler
            .store()
            .update_pending_task(&task.task_id, &PendingTaskUpdate::rearm(next, attempts))
        {
            Ok(Transition::Applied) => {
                debug!(task_id = %task.task_id, attempts, next_execute_at = %next, "pending task rearmed");
                PollDisposition::Rearmed
            }
            Ok(Transition::AlreadyTerminal) => PollDisposition::Skipped,
            Err(e) => {
                error!(task_id = %task.task_id, error = %e, "failed to rearm pending task");
                PollDisposition::Deferred
            }
        }
    }

    /// Close the pending row once the queue row carries the outcome.
    ///
    /// The pending row only schedules polls; the queue row is the settlement
    /// guard. A close that errors leaves the row Processing and the next poll
    /// closes it without settling again.
    fn after_settlement(
        &self,
        task_id: &TaskId,
        settled: Settled,
        close: PendingTaskUpdate,
    ) -> PollDisposition {
        let disposition = match settled {
            Settled::Unrecorded(reason) => {
                warn!(task_id = %task_id, error = %reason, "settlement not recorded, retrying next tick");
                return PollDisposition::Deferred;
            }
            Settled::AlreadySettled => PollDisposition::Skipped,
            Settled::Succeeded { .. } => PollDisposition::Succeeded,
            Settled::Failed { .. } => PollDisposition::Failed,
        };
        self.close_pending(task_id, close);
        disposition
    }

    fn close_pending(&self, task_id: &TaskId, update: PendingTaskUpdate) {
        match self.settler.store().update_pending_task(task_id, &update) {
            Ok(Transition::Applied) => {}
            Ok(Transition::AlreadyTerminal) => {
                debug!(task_id = %task_id, "pending task already closed");
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "failed to close pending task");
            }
        }
    }

    fn finish_failed(&self, task_id: &TaskId, payload: &TaskPayload, err: &TaskError) -> PollDisposition {
        let settled = self.settler.fail(task_id, payload, err);
        self.after_settlement(task_id, settled, PendingTaskUpdate::failed())
    }
}

impl<S, L> PendingTaskPoller<S, L>
where
    S: ResultStore + 'static,
    L: QuotaLedger + 'static,
{
    /// Spawn the poller in a background thread.
    pub fn spawn(self) -> io::Result<PollerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(PollerStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(self.config.name.clone())
            .spawn(move || poller_loop(self, shutdown_rx, stats_clone))?;

        Ok(PollerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn replay(task: &PendingTask) -> Result<(TaskPayload, VendorJobRef), TaskError> {
    let pending: PendingPayload = serde_json::from_value(task.payload.clone())?;
    let payload = pending.task_payload(task.task_type)?;
    let job = VendorJobRef {
        vendor: pending.vendor,
        job_id: pending.vendor_job_id,
    };
    Ok((payload, job))
}

fn poller_loop<S: ResultStore, L: QuotaLedger>(
    poller: PendingTaskPoller<S, L>,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<PollerStats>>,
) {
    let name = poller.config.name.clone();
    info!(poller = %name, tick_ms = poller.config.tick.as_millis() as u64, "pending task poller started");

    loop {
        match shutdown_rx.recv_timeout(poller.config.tick) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }

        let result = poller.poll_due(Utc::now());
        let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
        s.ticks += 1;
        match result {
            Ok(summary) => {
                s.polled += summary.due as u64;
                s.rearmed += summary.rearmed as u64;
                s.succeeded += summary.succeeded as u64;
                s.failed += summary.failed as u64;
                s.deferred += summary.deferred as u64;
                if summary.due > 0 {
                    debug!(poller = %name, due = summary.due, succeeded = summary.succeeded, failed = summary.failed, "poll tick finished");
                }
            }
            Err(e) => {
                s.tick_errors += 1;
                error!(poller = %name, error = %e, "failed to load due pending tasks");
            }
        }
    }

    info!(poller = %name, "pending task poller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compensator::QuotaCompensator;
    use crate::handlers::TaskHandler;
    use crate::ledger::InMemoryQuotaLedger;
    use crate::store::{InMemoryResultStore, PendingTaskStore, QueueTaskStore};
    use crate::testing::{
        image_payload, pending_task, seed_task, FlakyStore, PanickingHandler, StubHandler,
    };
    use taskforge_core::{
        CompletionResult, PendingTaskStatus, QueueTaskStatus, TaskType, UserId,
    };

    struct Fixture {
        store: Arc<InMemoryResultStore>,
        ledger: Arc<InMemoryQuotaLedger>,
        poller: PendingTaskPoller<Arc<InMemoryResultStore>, Arc<InMemoryQuotaLedger>>,
    }

    fn fixture(handler: Arc<dyn TaskHandler>) -> Fixture {
        let store = InMemoryResultStore::arc();
        let ledger = InMemoryQuotaLedger::arc();
        ledger.deposit(UserId::new(1), 1_000).unwrap();
        let compensator = QuotaCompensator::new(
            ledger.clone(),
            taskforge_core::PriceBook::default().with_model_price("wanx-v1", 40),
        );
        let settler = Arc::new(Settler::new(
            store.clone(),
            compensator,
            Duration::from_secs(3600),
        ));
        let handlers = Arc::new(HandlerRegistry::new().with(TaskType::ImageCompletion, handler));
        let poller = PendingTaskPoller::new(handlers, settler, PollerConfig::default());
        Fixture {
            store,
            ledger,
            poller,
        }
    }

    fn accepted(f: &Fixture, id: &str) -> PendingTask {
        let payload = seed_task(&f.store, &f.ledger, image_payload(1, 100), id);
        let task = pending_task(&payload, "dashscope", "job-1");
        f.store.create_pending_task(task.clone()).unwrap();
        task
    }

    #[test]
    fn in_progress_job_is_rearmed() {
        let f = fixture(Arc::new(StubHandler::default().polling(vec![Ok(PollOutcome::InProgress)])));
        let task = accepted(&f, "p1");
        let now = Utc::now();

        assert_eq!(f.poller.poll_one(&task, now), PollDisposition::Rearmed);

        let stored = f.store.get_pending_task(&task.task_id).unwrap().unwrap();
        assert_eq!(stored.status, PendingTaskStatus::Processing);
        assert_eq!(stored.execute_times, 1);
        assert!(stored.next_execute_at > now);
    }

    #[test]
    fn transient_poll_error_keeps_waiting() {
        let f = fixture(Arc::new(
            StubHandler::default().polling(vec![Err(TaskError::vendor_unavailable("503"))]),
        ));
        let task = accepted(&f, "p1");
        assert_eq!(f.poller.poll_one(&task, Utc::now()), PollDisposition::Rearmed);
        assert_eq!(f.ledger.balance(UserId::new(1)).unwrap().freezed, 100);
    }

    #[test]
    fn completed_job_settles_and_closes_pending_row() {
        let f = fixture(Arc::new(StubHandler::default().polling(vec![Ok(
            PollOutcome::Completed(crate::handlers::Completion::assets(vec!["u1".into()])),
        )])));
        let task = accepted(&f, "p1");

        assert_eq!(f.poller.poll_one(&task, Utc::now()), PollDisposition::Succeeded);
        assert_eq!(
            f.store.get_pending_task(&task.task_id).unwrap().unwrap().status,
            PendingTaskStatus::Success
        );
        assert_eq!(
            f.store.get_queue_task(&task.task_id).unwrap().unwrap().status,
            QueueTaskStatus::Success
        );
        let balance = f.ledger.balance(UserId::new(1)).unwrap();
        assert_eq!((balance.freezed, balance.used), (0, 40));
    }

    #[test]
    fn async_result_records_the_source_image() {
        use crate::handlers::vendor::{VendorRoute, VendorTaskHandler};
        use crate::testing::ScriptedVendor;
        use taskforge_ai::{VendorJobStatus, VendorRegistry};

        let vendor = ScriptedVendor::accepting("job-1")
            .then_status(Ok(VendorJobStatus::succeeded(vec!["u1".into()])));
        let f = fixture(Arc::new(VendorTaskHandler::new(
            VendorRegistry::new().with("dashscope", vendor),
            VendorRoute::FromPayload,
        )));
        let mut payload = image_payload(1, 100);
        if let TaskPayload::ImageCompletion(p) = &mut payload {
            p.image = Some("https://origin/img.png".into());
        }
        let payload = seed_task(&f.store, &f.ledger, payload, "p1");
        let task = pending_task(&payload, "dashscope", "job-1");
        f.store.create_pending_task(task.clone()).unwrap();

        assert_eq!(f.poller.poll_one(&task, Utc::now()), PollDisposition::Succeeded);
        let row = f.store.get_queue_task(&task.task_id).unwrap().unwrap();
        let result: CompletionResult = serde_json::from_value(row.result.unwrap()).unwrap();
        assert_eq!(result.origin_image.as_deref(), Some("https://origin/img.png"));
        assert_eq!(result.resources, vec!["u1".to_string()]);
    }

    #[test]
    fn vendor_failure_fails_task_with_vendor_message() {
        let f = fixture(Arc::new(
            StubHandler::default().polling(vec![Ok(PollOutcome::Failed("content rejected".into()))]),
        ));
        let task = accepted(&f, "p1");

        assert_eq!(f.poller.poll_one(&task, Utc::now()), PollDisposition::Failed);
        let row = f.store.get_queue_task(&task.task_id).unwrap().unwrap();
        assert_eq!(row.result.unwrap()["errors"][0], "content rejected");
        assert_eq!(f.ledger.balance(UserId::new(1)).unwrap().freezed, 0);
    }

    #[test]
    fn deadline_fails_without_polling_vendor() {
        let handler = Arc::new(StubHandler::default());
        let f = fixture(handler.clone());
        let mut task = accepted(&f, "p1");
        task.deadline_at = Utc::now() - chrono::Duration::seconds(1);

        assert_eq!(f.poller.poll_one(&task, Utc::now()), PollDisposition::Failed);
        assert_eq!(handler.polls(), 0);
        let row = f.store.get_queue_task(&task.task_id).unwrap().unwrap();
        assert_eq!(row.result.unwrap()["errors"][0], TaskError::DeadlineExceeded.to_string());
    }

    #[test]
    fn empty_vendor_output_fails() {
        let f = fixture(Arc::new(StubHandler::default().polling(vec![Ok(
            PollOutcome::Completed(crate::handlers::Completion::assets(vec![" ".into()])),
        )])));
        let task = accepted(&f, "p1");
        assert_eq!(f.poller.poll_one(&task, Utc::now()), PollDisposition::Failed);
        let row = f.store.get_queue_task(&task.task_id).unwrap().unwrap();
        assert_eq!(row.result.unwrap()["errors"][0], TaskError::EmptyOutput.to_string());
    }

    #[test]
    fn panicking_poll_fails_task() {
        let f = fixture(Arc::new(PanickingHandler::new("poll exploded")));
        let task = accepted(&f, "p1");
        assert_eq!(f.poller.poll_one(&task, Utc::now()), PollDisposition::Failed);
        assert_eq!(f.ledger.balance(UserId::new(1)).unwrap().freezed, 0);
    }

    #[test]
    fn corrupt_payload_fails_row_only() {
        let f = fixture(Arc::new(StubHandler::default()));
        let mut task = accepted(&f, "p1");
        task.payload = serde_json::json!({ "garbage": true });

        assert_eq!(f.poller.poll_one(&task, Utc::now()), PollDisposition::Failed);
        assert_eq!(
            f.store.get_queue_task(&task.task_id).unwrap().unwrap().status,
            QueueTaskStatus::Failed
        );
        assert_eq!(f.ledger.balance(UserId::new(1)).unwrap().freezed, 100);
    }

    #[test]
    fn second_poll_of_closed_task_is_skipped() {
        let f = fixture(Arc::new(StubHandler::default().polling(vec![
            Ok(PollOutcome::Failed("no".into())),
            Ok(PollOutcome::Failed("no".into())),
        ])));
        let task = accepted(&f, "p1");
        let now = Utc::now();
        assert_eq!(f.poller.poll_one(&task, now), PollDisposition::Failed);
        assert_eq!(f.poller.poll_one(&task, now), PollDisposition::Skipped);
        let unfreezes = f
            .ledger
            .entries_for(&task.task_id)
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == crate::ledger::LedgerEntryKind::Unfreeze)
            .count();
        assert_eq!(unfreezes, 1);
    }

    #[test]
    fn store_errors_defer_settlement_and_never_bill_twice() {
        let store = FlakyStore::new();
        let ledger = InMemoryQuotaLedger::arc();
        ledger.deposit(UserId::new(1), 1_000).unwrap();
        let settler = Arc::new(Settler::new(
            store.clone(),
            QuotaCompensator::new(
                ledger.clone(),
                taskforge_core::PriceBook::default().with_model_price("wanx-v1", 40),
            ),
            Duration::from_secs(3600),
        ));
        let completed = || {
            Ok(PollOutcome::Completed(crate::handlers::Completion::assets(vec!["u1".into()])))
        };
        let handler = Arc::new(StubHandler::default().polling(vec![completed(), completed(), completed()]));
        let handlers =
            Arc::new(HandlerRegistry::new().with(TaskType::ImageCompletion, handler.clone()));
        let poller = PendingTaskPoller::new(handlers, settler, PollerConfig::default());

        let payload = seed_task(&store, &ledger, image_payload(1, 100), "p1");
        let task = pending_task(&payload, "dashscope", "job-1");
        store.create_pending_task(task.clone()).unwrap();
        store.fail_queue_writes(1);
        store.fail_pending_writes(1);
        let now = Utc::now();

        assert_eq!(poller.poll_one(&task, now), PollDisposition::Deferred);
        assert_eq!(ledger.balance(UserId::new(1)).unwrap().freezed, 100);
        assert_eq!(
            store.get_pending_task(&task.task_id).unwrap().unwrap().status,
            PendingTaskStatus::Processing
        );

        // Settles, but the pending row close errors and stays Processing.
        assert_eq!(poller.poll_one(&task, now), PollDisposition::Succeeded);
        assert_eq!(
            store.get_pending_task(&task.task_id).unwrap().unwrap().status,
            PendingTaskStatus::Processing
        );

        assert_eq!(poller.poll_one(&task, now), PollDisposition::Skipped);
        assert_eq!(handler.polls(), 2);
        assert_eq!(
            store.get_pending_task(&task.task_id).unwrap().unwrap().status,
            PendingTaskStatus::Success
        );
        let consumes = ledger
            .entries_for(&task.task_id)
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == crate::ledger::LedgerEntryKind::Consume)
            .count();
        assert_eq!(consumes, 1);
        let balance = ledger.balance(UserId::new(1)).unwrap();
        assert_eq!((balance.rest, balance.freezed, balance.used), (960, 0, 40));
    }

    #[test]
    fn poll_due_only_touches_due_tasks() {
        let f = fixture(Arc::new(StubHandler::default().polling(vec![
            Ok(PollOutcome::InProgress),
            Ok(PollOutcome::InProgress),
        ])));
        let early = accepted(&f, "due");
        let later = accepted(&f, "later");
        f.store
            .update_pending_task(
                &later.task_id,
                &PendingTaskUpdate::rearm(Utc::now() + chrono::Duration::hours(1), 0),
            )
            .unwrap();

        let summary = f
            .poller
            .poll_due(early.next_execute_at + chrono::Duration::seconds(1))
            .unwrap();
        assert_eq!(summary.due, 1);
        assert_eq!(summary.rearmed, 1);
    }

    #[test]
    fn spawned_poller_stops_on_shutdown() {
        let f = fixture(Arc::new(StubHandler::default()));
        let mut poller = f.poller;
        poller.config.tick = Duration::from_millis(10);
        let handle = poller.spawn().unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(handle.stats().ticks >= 1);
        handle.shutdown();
    }
}
