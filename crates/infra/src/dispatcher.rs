//! Task dispatcher: first execution of a freshly submitted task.
//!
//! ## Flow
//!
//! ```text
//! raw bytes ──▶ decode ──▶ redelivery guard ──▶ submission window
//!                                                     │
//!                               handler (panic-guarded)
//!                              ╱          │           ╲
//!                       Completed     Accepted       Err
//!                          │             │             │
//!                  Settler::complete  PendingTask   Settler::fail
//! ```
//!
//! An undecodable payload escapes as a decode error (the queue dead-letters
//! it), and a queue row that cannot be written escapes as a storage error
//! (the delivery is retried). Every other failure ends as a failed queue row
//! with the freeze released.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use taskforge_ai::CallContext;
use taskforge_core::{
    PendingPayload, PendingTask, PendingTaskStatus, QueueTaskStatus, TaskError, TaskId,
    TaskPayload, TaskResult, TaskType,
};

use crate::fault;
use crate::handlers::{validate_completion, HandlerOutcome, HandlerRegistry, VendorJobRef};
use crate::jobs::PollSchedule;
use crate::ledger::QuotaLedger;
use crate::settle::{Settled, Settler};
use crate::store::{ResultStore, StoreError};

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Tasks not started within this window are abandoned.
    pub submission_window: Duration,
    /// Longer window for group chat.
    pub group_chat_window: Duration,
    /// Deadline handed to vendor calls.
    pub call_timeout: Duration,
    /// How long an accepted vendor job may stay pending.
    pub pending_deadline: Duration,
    pub poll_schedule: PollSchedule,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            submission_window: Duration::from_secs(5 * 60),
            group_chat_window: Duration::from_secs(15 * 60),
            call_timeout: Duration::from_secs(60),
            pending_deadline: Duration::from_secs(30 * 60),
            poll_schedule: PollSchedule::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn window_for(&self, task_type: TaskType) -> Duration {
        match task_type {
            TaskType::GroupChat => self.group_chat_window,
            _ => self.submission_window,
        }
    }
}

/// What happened to a dispatched task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Succeeded,
    Failed,
    /// Abandoned without contacting the vendor.
    Expired,
    /// Waiting on a vendor job; the poller takes over.
    Pending,
    /// Redelivery of a task that was already handled.
    Skipped,
}

pub struct Dispatcher<S, L> {
    handlers: Arc<HandlerRegistry>,
    settler: Arc<Settler<S, L>>,
    config: DispatcherConfig,
}

fn add(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl<S: ResultStore, L: QuotaLedger> Dispatcher<S, L> {
    pub fn new(
        handlers: Arc<HandlerRegistry>,
        settler: Arc<Settler<S, L>>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            handlers,
            settler,
            config,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Run one delivery of a queued task.
    pub fn dispatch(&self, raw: &[u8], task_type: TaskType) -> TaskResult<DispatchOutcome> {
        let payload = TaskPayload::decode(task_type, raw)?;
        let task_id = payload.require_id()?.clone();

        if self.already_handled(&task_id) {
            debug!(task_id = %task_id, "redelivered task already handled, skipping");
            return Ok(DispatchOutcome::Skipped);
        }

        let now = Utc::now();
        if now > add(payload.created_at(), self.config.window_for(task_type)) {
            warn!(task_id = %task_id, task_type = %task_type, created_at = %payload.created_at(), "task expired before start");
            return Ok(
                match self
                    .settler
                    .fail(&task_id, &payload, &TaskError::SubmissionExpired)
                    .recorded()?
                {
                    Settled::AlreadySettled => DispatchOutcome::Skipped,
                    _ => DispatchOutcome::Expired,
                },
            );
        }

        let Some(handler) = self.handlers.get(task_type) else {
            let err = TaskError::NoHandler(task_type.to_string());
            error!(task_id = %task_id, task_type = %task_type, "no handler registered");
            return self.fail(&task_id, &payload, &err);
        };

        let ctx = CallContext::new(task_id.clone(), self.config.call_timeout);
        match fault::guard(|| handler.handle(&ctx, &payload)) {
            Err(e) => {
                warn!(task_id = %task_id, task_type = %task_type, error = %e, "handler failed");
                self.fail(&task_id, &payload, &e)
            }
            Ok(HandlerOutcome::Completed(completion)) => {
                match validate_completion(handler.as_ref(), completion) {
                    Ok(completion) => {
                        let settled = self
                            .settler
                            .complete(&task_id, handler.as_ref(), &payload, completion)
                            .recorded()?;
                        Ok(match settled {
                            Settled::AlreadySettled => DispatchOutcome::Skipped,
                            _ => DispatchOutcome::Succeeded,
                        })
                    }
                    Err(e) => self.fail(&task_id, &payload, &e),
                }
            }
            Ok(HandlerOutcome::Accepted(job)) => self.await_vendor(&task_id, &payload, job, now),
        }
    }

    fn already_handled(&self, task_id: &TaskId) -> bool {
        let store = self.settler.store();
        match store.get_queue_task(task_id) {
            Ok(Some(row)) if row.status.is_terminal() => return true,
            Ok(_) => {}
            Err(e) => warn!(task_id = %task_id, error = %e, "could not read queue row"),
        }
        match store.get_pending_task(task_id) {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "could not read pending task");
                false
            }
        }
    }

    /// Settle a failure. A queue row that could not be written surfaces as a
    /// storage error so the delivery is retried.
    fn fail(
        &self,
        task_id: &TaskId,
        payload: &TaskPayload,
        err: &TaskError,
    ) -> TaskResult<DispatchOutcome> {
        Ok(match self.settler.fail(task_id, payload, err).recorded()? {
            Settled::AlreadySettled => DispatchOutcome::Skipped,
            _ => DispatchOutcome::Failed,
        })
    }

    fn await_vendor(
        &self,
        task_id: &TaskId,
        payload: &TaskPayload,
        job: VendorJobRef,
        now: DateTime<Utc>,
    ) -> TaskResult<DispatchOutcome> {
        let replay = match PendingPayload::new(&job.vendor, &job.job_id, payload)
            .and_then(|p| Ok(serde_json::to_value(p)?))
        {
            Ok(v) => v,
            Err(e) => return self.fail(task_id, payload, &e),
        };

        let record = PendingTask {
            task_id: task_id.clone(),
            task_type: payload.task_type(),
            payload: replay,
            status: PendingTaskStatus::Processing,
            next_execute_at: self.config.poll_schedule.next_poll_at(now, 1),
            deadline_at: add(now, self.config.pending_deadline),
            execute_times: 0,
            created_at: now,
            updated_at: now,
        };

        let store = self.settler.store();
        match store.create_pending_task(record) {
            Ok(()) => {}
            Err(StoreError::AlreadyExists(_)) => {
                debug!(task_id = %task_id, "pending task already registered");
                return Ok(DispatchOutcome::Skipped);
            }
            Err(e) => {
                error!(task_id = %task_id, vendor = %job.vendor, job_id = %job.job_id, error = %e, "failed to register pending task");
                return self.fail(task_id, payload, &e.into());
            }
        }

        if let Err(e) = store.update_queue_task(task_id, QueueTaskStatus::Running, None) {
            warn!(task_id = %task_id, error = %e, "failed to mark queue task running");
        }
        debug!(task_id = %task_id, vendor = %job.vendor, job_id = %job.job_id, "task waiting on vendor");
        Ok(DispatchOutcome::Pending)
    }
}
