use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use taskforge_core::{
    HistoryRecord, HistoryUpdate, PendingTask, PendingTaskUpdate, QueueTask, QueueTaskStatus,
    TaskId, Transition, UserId,
};

use super::r#trait::{HistoryStore, PendingTaskStore, QueueTaskStore, StoreError};

fn poisoned<T>(_: PoisonError<T>) -> StoreError {
    StoreError::Storage("lock poisoned".to_string())
}

/// In-memory result store.
///
/// Intended for tests/dev. Rows are kept forever.
#[derive(Debug, Default)]
pub struct InMemoryResultStore {
    queue: RwLock<HashMap<TaskId, QueueTask>>,
    pending: RwLock<HashMap<TaskId, PendingTask>>,
    history: RwLock<HashMap<(UserId, TaskId), HistoryRecord>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of pending tasks, whatever their status.
    pub fn pending_count(&self) -> Result<usize, StoreError> {
        Ok(self.pending.read().map_err(poisoned)?.len())
    }
}

impl QueueTaskStore for InMemoryResultStore {
    fn create_queue_task(&self, task: QueueTask) -> Result<(), StoreError> {
        let mut queue = self.queue.write().map_err(poisoned)?;
        if queue.contains_key(&task.id) {
            return Err(StoreError::AlreadyExists(task.id.to_string()));
        }
        queue.insert(task.id.clone(), task);
        Ok(())
    }

    fn get_queue_task(&self, id: &TaskId) -> Result<Option<QueueTask>, StoreError> {
        Ok(self.queue.read().map_err(poisoned)?.get(id).cloned())
    }

    fn update_queue_task(
        &self,
        id: &TaskId,
        status: QueueTaskStatus,
        result: Option<JsonValue>,
    ) -> Result<Transition, StoreError> {
        let mut queue = self.queue.write().map_err(poisoned)?;
        let task = queue
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if task.status.is_terminal() {
            return Ok(Transition::AlreadyTerminal);
        }

        task.status = status;
        if result.is_some() {
            task.result = result;
        }
        task.updated_at = Utc::now();
        Ok(Transition::Applied)
    }
}

impl PendingTaskStore for InMemoryResultStore {
    fn create_pending_task(&self, task: PendingTask) -> Result<(), StoreError> {
        let mut pending = self.pending.write().map_err(poisoned)?;
        if pending.contains_key(&task.task_id) {
            return Err(StoreError::AlreadyExists(task.task_id.to_string()));
        }
        pending.insert(task.task_id.clone(), task);
        Ok(())
    }

    fn get_pending_task(&self, id: &TaskId) -> Result<Option<PendingTask>, StoreError> {
        Ok(self.pending.read().map_err(poisoned)?.get(id).cloned())
    }

    fn update_pending_task(
        &self,
        id: &TaskId,
        update: &PendingTaskUpdate,
    ) -> Result<Transition, StoreError> {
        let mut pending = self.pending.write().map_err(poisoned)?;
        let task = pending
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if task.status.is_terminal() {
            return Ok(Transition::AlreadyTerminal);
        }

        task.status = update.status;
        if let Some(next) = update.next_execute_at {
            task.next_execute_at = next;
        }
        if let Some(times) = update.execute_times {
            task.execute_times = times;
        }
        task.updated_at = Utc::now();
        Ok(Transition::Applied)
    }

    fn due_pending_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PendingTask>, StoreError> {
        let pending = self.pending.read().map_err(poisoned)?;
        let mut due: Vec<PendingTask> = pending
            .values()
            .filter(|t| t.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.next_execute_at
                .cmp(&b.next_execute_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        due.truncate(limit);
        Ok(due)
    }
}

impl HistoryStore for InMemoryResultStore {
    fn create_history_record(&self, record: HistoryRecord) -> Result<(), StoreError> {
        let key = (record.uid, record.task_id.clone());
        let mut history = self.history.write().map_err(poisoned)?;
        if history.contains_key(&key) {
            return Err(StoreError::AlreadyExists(record.task_id.to_string()));
        }
        history.insert(key, record);
        Ok(())
    }

    fn get_history_record(
        &self,
        uid: UserId,
        task_id: &TaskId,
    ) -> Result<Option<HistoryRecord>, StoreError> {
        let history = self.history.read().map_err(poisoned)?;
        Ok(history.get(&(uid, task_id.clone())).cloned())
    }

    fn update_history_record(
        &self,
        uid: UserId,
        task_id: &TaskId,
        update: &HistoryUpdate,
    ) -> Result<(), StoreError> {
        let mut history = self.history.write().map_err(poisoned)?;
        let record = history
            .get_mut(&(uid, task_id.clone()))
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;

        if let Some(status) = update.status {
            record.status = status;
        }
        if let Some(answer) = &update.answer {
            record.answer = Some(answer.clone());
        }
        if let Some(used) = update.quota_used {
            record.quota_used = used;
        }
        if let Some(error) = &update.error {
            record.error = Some(error.clone());
        }
        record.updated_at = Utc::now();
        Ok(())
    }
}
