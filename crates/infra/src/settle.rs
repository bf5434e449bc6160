//! Terminal outcome recording shared by the dispatcher and the poller.
//!
//! Every terminal outcome goes through [`Settler`]:
//!
//! ```text
//! queue row ──(conditional)──▶ history mirror ──▶ ledger ──▶ chained task
//! ```
//!
//! The queue row write comes first and doubles as the idempotency guard: a
//! caller that finds the row already terminal stops there, so quota is settled
//! at most once per task. If that write itself errors nothing else is touched
//! and the caller retries later. Every later step is best-effort and logged on
//! error.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use taskforge_core::{
    CompletionResult, ErrorResult, HistoryUpdate, QueueTaskStatus, TaskError, TaskId,
    TaskPayload, TaskResult, Transition,
};

use crate::compensator::{QuotaCompensator, Settlement};
use crate::fault;
use crate::handlers::{Completion, TaskHandler};
use crate::ledger::QuotaLedger;
use crate::sink::TaskSink;
use crate::store::ResultStore;

/// How a settlement attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settled {
    Succeeded {
        cost: i64,
        settlement: Settlement,
        chained: Option<TaskId>,
    },
    Failed {
        settlement: Settlement,
    },
    /// Someone else already recorded a terminal outcome. Nothing was written.
    AlreadySettled,
    /// The queue row could not be written. Nothing was settled; retry later.
    Unrecorded(String),
}

impl Settled {
    /// Map [`Settled::Unrecorded`] to a storage error.
    pub fn recorded(self) -> TaskResult<Self> {
        match self {
            Settled::Unrecorded(reason) => Err(TaskError::storage(reason)),
            other => Ok(other),
        }
    }
}

pub struct Settler<S, L> {
    store: S,
    compensator: QuotaCompensator<L>,
    sink: Option<Arc<dyn TaskSink>>,
    result_ttl: Duration,
}

impl<S: ResultStore, L: QuotaLedger> Settler<S, L> {
    pub fn new(store: S, compensator: QuotaCompensator<L>, result_ttl: Duration) -> Self {
        Self {
            store,
            compensator,
            sink: None,
            result_ttl,
        }
    }

    /// Sink used for follow-up tasks. Without one, follow-ups are dropped.
    pub fn with_sink(mut self, sink: Arc<dyn TaskSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn compensator(&self) -> &QuotaCompensator<L> {
        &self.compensator
    }

    /// Record a failure: queue row failed, history failed, freeze released.
    pub fn fail(&self, task_id: &TaskId, payload: &TaskPayload, err: &TaskError) -> Settled {
        let message = err.to_string();
        let result = serde_json::to_value(ErrorResult::single(message.clone())).ok();

        match self
            .store
            .update_queue_task(task_id, QueueTaskStatus::Failed, result)
        {
            Ok(Transition::AlreadyTerminal) => {
                debug!(task_id = %task_id, "task already terminal, skipping failure settlement");
                return Settled::AlreadySettled;
            }
            Ok(Transition::Applied) => {}
            Err(e) => {
                error!(task_id = %task_id, error = %e, "failed to mark queue task failed, quota left frozen");
                return Settled::Unrecorded(e.to_string());
            }
        }

        if payload.task_type().has_history() {
            if let Err(e) = self.store.update_history_record(
                payload.uid(),
                task_id,
                &HistoryUpdate::failed(message.clone()),
            ) {
                warn!(task_id = %task_id, error = %e, "failed to mark history failed");
            }
        }

        let settlement = self.compensator.release(payload);
        info!(
            task_id = %task_id,
            task_type = %payload.task_type(),
            user_id = %payload.uid(),
            error = %message,
            "task failed"
        );
        Settled::Failed { settlement }
    }

    /// Record a failure for a task whose payload cannot be rebuilt. Only the
    /// queue row can be updated; there is no owner to release quota for.
    pub fn fail_unreplayable(&self, task_id: &TaskId, err: &TaskError) -> Settled {
        let result = serde_json::to_value(ErrorResult::single(err.to_string())).ok();
        match self
            .store
            .update_queue_task(task_id, QueueTaskStatus::Failed, result)
        {
            Ok(Transition::AlreadyTerminal) => Settled::AlreadySettled,
            Ok(Transition::Applied) => {
                error!(task_id = %task_id, error = %err, "task failed without a replayable payload, quota not released");
                Settled::Failed {
                    settlement: Settlement::LedgerFailed(err.to_string()),
                }
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "failed to mark queue task failed");
                Settled::Unrecorded(e.to_string())
            }
        }
    }

    /// Record a success: queue row, history, consume, then the follow-up task.
    ///
    /// `completion` must already be validated.
    pub fn complete(
        &self,
        task_id: &TaskId,
        handler: &dyn TaskHandler,
        payload: &TaskPayload,
        completion: Completion,
    ) -> Settled {
        let cost = self.compensator.realized_cost(payload, &completion);
        let ttl = chrono::Duration::from_std(self.result_ttl).unwrap_or(chrono::Duration::days(7));
        let (req_width, req_height) = payload.dimensions();

        let result = CompletionResult {
            origin_image: completion.origin_image.clone(),
            resources: completion.resources.clone(),
            valid_before: Some(Utc::now() + ttl),
            width: completion.width.or(req_width),
            height: completion.height.or(req_height),
        };
        let result = match serde_json::to_value(&result) {
            Ok(v) => Some(v),
            Err(e) => {
                error!(task_id = %task_id, error = %e, "failed to encode completion result");
                None
            }
        };

        match self
            .store
            .update_queue_task(task_id, QueueTaskStatus::Success, result)
        {
            Ok(Transition::AlreadyTerminal) => {
                debug!(task_id = %task_id, "task already terminal, skipping success settlement");
                return Settled::AlreadySettled;
            }
            Ok(Transition::Applied) => {}
            Err(e) => {
                error!(task_id = %task_id, error = %e, "failed to mark queue task succeeded, quota left frozen");
                return Settled::Unrecorded(e.to_string());
            }
        }

        if payload.task_type().has_history() {
            let update = HistoryUpdate::succeeded(completion.history_answer(), cost);
            if let Err(e) = self
                .store
                .update_history_record(payload.uid(), task_id, &update)
            {
                warn!(task_id = %task_id, error = %e, "failed to mark history succeeded");
            }
        }

        let settlement = self.compensator.consume(payload, &completion, cost);
        let chained = self.chain(task_id, handler, payload, &completion);

        info!(
            task_id = %task_id,
            task_type = %payload.task_type(),
            user_id = %payload.uid(),
            resources = completion.resources.len(),
            cost,
            "task succeeded"
        );
        Settled::Succeeded {
            cost,
            settlement,
            chained,
        }
    }

    fn chain(
        &self,
        task_id: &TaskId,
        handler: &dyn TaskHandler,
        payload: &TaskPayload,
        completion: &Completion,
    ) -> Option<TaskId> {
        let sink = self.sink.as_ref()?;
        let next = match fault::guard(|| Ok(handler.follow_up(payload, completion))) {
            Ok(next) => next?,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "building follow-up task failed");
                return None;
            }
        };

        let next_type = next.task_type();
        match sink.enqueue(next) {
            Ok(id) => {
                debug!(task_id = %task_id, chained_task_id = %id, task_type = %next_type, "follow-up task enqueued");
                Some(id)
            }
            Err(e) => {
                warn!(task_id = %task_id, task_type = %next_type, error = %e, "failed to enqueue follow-up task");
                None
            }
        }
    }
}
