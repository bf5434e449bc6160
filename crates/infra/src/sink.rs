//! Entry point for putting payloads on the queue.

use tracing::{debug, warn};

use taskforge_core::{
    ErrorResult, QueueTask, QueueTaskStatus, TaskError, TaskId, TaskPayload, TaskResult,
};

use crate::jobs::{QueuedTask, TaskQueue};
use crate::store::QueueTaskStore;

/// Anything that accepts new tasks: submission and chaining both go through it.
pub trait TaskSink: Send + Sync {
    /// Enqueue `payload`, assigning an id if it has none. Returns the task id.
    fn enqueue(&self, payload: TaskPayload) -> TaskResult<TaskId>;
}

/// Sink backed by a [`TaskQueue`]. Creates the queue row before the task
/// becomes visible to workers.
pub struct QueueSink<Q, S> {
    queue: Q,
    store: S,
}

impl<Q: TaskQueue, S: QueueTaskStore> QueueSink<Q, S> {
    pub fn new(queue: Q, store: S) -> Self {
        Self { queue, store }
    }
}

impl<Q: TaskQueue, S: QueueTaskStore> TaskSink for QueueSink<Q, S> {
    fn enqueue(&self, mut payload: TaskPayload) -> TaskResult<TaskId> {
        let id = match payload.id() {
            Some(id) => id.clone(),
            None => {
                let id = TaskId::generate();
                payload.assign_id(id.clone())?;
                id
            }
        };
        let task_type = payload.task_type();
        let raw = payload.encode()?;

        self.store.create_queue_task(QueueTask::running(
            id.clone(),
            payload.uid(),
            task_type,
            payload.title(),
        ))?;

        if let Err(e) = self.queue.enqueue(QueuedTask::new(id.clone(), task_type, raw)) {
            warn!(task_id = %id, task_type = %task_type, error = %e, "enqueue failed");
            let result = serde_json::to_value(ErrorResult::single(e.to_string()))?;
            if let Err(store_err) =
                self.store
                    .update_queue_task(&id, QueueTaskStatus::Failed, Some(result))
            {
                warn!(task_id = %id, error = %store_err, "failed to mark unqueued task as failed");
            }
            return Err(TaskError::storage(e.to_string()));
        }

        debug!(task_id = %id, task_type = %task_type, "task enqueued");
        Ok(id)
    }
}
