//! Submission and status read path.

use std::sync::Arc;

use tracing::{debug, info, warn};

use taskforge_core::{
    CompletionResult, ErrorResult, HistoryRecord, HistoryUpdate, QueueTaskStatus, TaskError,
    TaskId, TaskPayload, TaskResult, TaskStatusView, UserId,
};

use crate::ledger::QuotaLedger;
use crate::sink::TaskSink;
use crate::store::ResultStore;

/// Front door of the engine: accepts new tasks and reports their status.
pub struct TaskService<S, L> {
    store: S,
    ledger: L,
    sink: Arc<dyn TaskSink>,
}

impl<S: ResultStore, L: QuotaLedger> TaskService<S, L> {
    pub fn new(store: S, ledger: L, sink: Arc<dyn TaskSink>) -> Self {
        Self {
            store,
            ledger,
            sink,
        }
    }

    /// Reserve quota for `payload` and queue it.
    ///
    /// The payload's `quota` is the estimate to freeze. Ids are assigned
    /// here, so a payload that already carries one is rejected before any
    /// quota or history is touched. On success the task is visible as
    /// Running and its id is returned.
    pub fn submit(&self, mut payload: TaskPayload) -> TaskResult<TaskId> {
        let uid = payload.uid();
        let quota = payload.quota();
        if let Some(id) = payload.id() {
            return Err(TaskError::decode(format!(
                "task id {id} is assigned at submission"
            )));
        }
        if quota < 0 {
            return Err(TaskError::decode(format!("negative quota {quota}")));
        }

        let balance = self.ledger.balance(uid)?;
        if balance.available() < quota {
            return Err(TaskError::QuotaNotEnough {
                required: quota,
                available: balance.available(),
            });
        }

        let task_id = TaskId::generate();
        payload.assign_id(task_id.clone())?;
        payload.meta_mut().frozen_quota = quota;

        if quota > 0 {
            self.ledger.freeze(uid, quota, &task_id)?;
        }

        let mut history_created = false;
        if payload.task_type().has_history() {
            match HistoryRecord::pending(&payload) {
                Ok(record) => match self.store.create_history_record(record) {
                    Ok(()) => history_created = true,
                    Err(e) => {
                        warn!(task_id = %task_id, user_id = %uid, error = %e, "failed to create history record");
                    }
                },
                Err(e) => warn!(task_id = %task_id, error = %e, "failed to build history record"),
            }
        }

        let task_type = payload.task_type();
        if let Err(e) = self.sink.enqueue(payload) {
            warn!(task_id = %task_id, user_id = %uid, error = %e, "submission could not be queued, releasing quota");
            if quota > 0 {
                if let Err(le) = self.ledger.unfreeze(uid, quota, &task_id) {
                    warn!(task_id = %task_id, user_id = %uid, error = %le, "failed to release quota of unqueued task");
                }
            }
            if history_created {
                if let Err(se) = self.store.update_history_record(
                    uid,
                    &task_id,
                    &HistoryUpdate::failed(e.to_string()),
                ) {
                    warn!(task_id = %task_id, error = %se, "failed to mark history failed");
                }
            }
            return Err(e);
        }

        info!(task_id = %task_id, task_type = %task_type, user_id = %uid, quota, "task submitted");
        Ok(task_id)
    }

    /// Status of `task_id` as seen by `uid`. Tasks owned by someone else are
    /// reported as not found.
    pub fn status(&self, task_id: &TaskId, uid: UserId) -> TaskResult<TaskStatusView> {
        let row = match self.store.get_queue_task(task_id)? {
            Some(row) if row.uid == uid => row,
            Some(_) => {
                debug!(task_id = %task_id, user_id = %uid, "status requested by non-owner");
                return Err(TaskError::NotFound);
            }
            None => return Err(TaskError::NotFound),
        };

        match row.status {
            QueueTaskStatus::Running => Ok(TaskStatusView::Running),
            QueueTaskStatus::Success => {
                let result = match row.result {
                    Some(value) => serde_json::from_value::<CompletionResult>(value)
                        .unwrap_or_else(|e| {
                            warn!(task_id = %task_id, error = %e, "unreadable completion result");
                            CompletionResult::default()
                        }),
                    None => {
                        warn!(task_id = %task_id, "succeeded task has no result");
                        CompletionResult::default()
                    }
                };
                Ok(result.into())
            }
            QueueTaskStatus::Failed => {
                let errors = row
                    .result
                    .and_then(|value| match serde_json::from_value::<ErrorResult>(value) {
                        Ok(result) => Some(result.errors),
                        Err(e) => {
                            warn!(task_id = %task_id, error = %e, "unreadable failure result");
                            None
                        }
                    })
                    .unwrap_or_default();
                Ok(TaskStatusView::Failed { errors })
            }
        }
    }
}
