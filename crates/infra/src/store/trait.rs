use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use taskforge_core::{
    HistoryRecord, HistoryUpdate, PendingTask, PendingTaskUpdate, QueueTask, QueueTaskStatus,
    TaskError, TaskId, Transition, UserId,
};

/// Result store error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("record already exists: {0}")]
    AlreadyExists(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<StoreError> for TaskError {
    fn from(value: StoreError) -> Self {
        TaskError::storage(value.to_string())
    }
}

/// Queue rows: the user-facing status of every submitted task.
///
/// ## Monotonicity
///
/// `update_queue_task` is a conditional write. A row that already carries a
/// terminal status is left untouched and the call reports
/// [`Transition::AlreadyTerminal`]. Callers use this as the idempotency guard
/// for settlement: only the writer that observed `Applied` settles quota.
pub trait QueueTaskStore: Send + Sync {
    fn create_queue_task(&self, task: QueueTask) -> Result<(), StoreError>;

    fn get_queue_task(&self, id: &TaskId) -> Result<Option<QueueTask>, StoreError>;

    fn update_queue_task(
        &self,
        id: &TaskId,
        status: QueueTaskStatus,
        result: Option<JsonValue>,
    ) -> Result<Transition, StoreError>;
}

/// Pending tasks: work waiting on a vendor job.
///
/// Same conditional-write rule as [`QueueTaskStore`]: an update against a
/// record that left `Processing` is ignored.
pub trait PendingTaskStore: Send + Sync {
    fn create_pending_task(&self, task: PendingTask) -> Result<(), StoreError>;

    fn get_pending_task(&self, id: &TaskId) -> Result<Option<PendingTask>, StoreError>;

    fn update_pending_task(
        &self,
        id: &TaskId,
        update: &PendingTaskUpdate,
    ) -> Result<Transition, StoreError>;

    /// Processing tasks whose `next_execute_at` is not in the future, oldest first.
    fn due_pending_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PendingTask>, StoreError>;
}

/// User-visible history mirror.
pub trait HistoryStore: Send + Sync {
    fn create_history_record(&self, record: HistoryRecord) -> Result<(), StoreError>;

    fn get_history_record(
        &self,
        uid: UserId,
        task_id: &TaskId,
    ) -> Result<Option<HistoryRecord>, StoreError>;

    fn update_history_record(
        &self,
        uid: UserId,
        task_id: &TaskId,
        update: &HistoryUpdate,
    ) -> Result<(), StoreError>;
}

/// Everything the engine persists.
pub trait ResultStore: QueueTaskStore + PendingTaskStore + HistoryStore {}

impl<T: QueueTaskStore + PendingTaskStore + HistoryStore + ?Sized> ResultStore for T {}

impl<T: QueueTaskStore + ?Sized> QueueTaskStore for Arc<T> {
    fn create_queue_task(&self, task: QueueTask) -> Result<(), StoreError> {
        (**self).create_queue_task(task)
    }

    fn get_queue_task(&self, id: &TaskId) -> Result<Option<QueueTask>, StoreError> {
        (**self).get_queue_task(id)
    }

    fn update_queue_task(
        &self,
        id: &TaskId,
        status: QueueTaskStatus,
        result: Option<JsonValue>,
    ) -> Result<Transition, StoreError> {
        (**self).update_queue_task(id, status, result)
    }
}

impl<T: PendingTaskStore + ?Sized> PendingTaskStore for Arc<T> {
    fn create_pending_task(&self, task: PendingTask) -> Result<(), StoreError> {
        (**self).create_pending_task(task)
    }

    fn get_pending_task(&self, id: &TaskId) -> Result<Option<PendingTask>, StoreError> {
        (**self).get_pending_task(id)
    }

    fn update_pending_task(
        &self,
        id: &TaskId,
        update: &PendingTaskUpdate,
    ) -> Result<Transition, StoreError> {
        (**self).update_pending_task(id, update)
    }

    fn due_pending_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PendingTask>, StoreError> {
        (**self).due_pending_tasks(now, limit)
    }
}

impl<T: HistoryStore + ?Sized> HistoryStore for Arc<T> {
    fn create_history_record(&self, record: HistoryRecord) -> Result<(), StoreError> {
        (**self).create_history_record(record)
    }

    fn get_history_record(
        &self,
        uid: UserId,
        task_id: &TaskId,
    ) -> Result<Option<HistoryRecord>, StoreError> {
        (**self).get_history_record(uid, task_id)
    }

    fn update_history_record(
        &self,
        uid: UserId,
        task_id: &TaskId,
        update: &HistoryUpdate,
    ) -> Result<(), StoreError> {
        (**self).update_history_record(uid, task_id, update)
    }
}
