//! Task queue implementations.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;

use taskforge_core::TaskId;

use super::types::{DeadLetterEntry, Lease, QueuedTask};

/// Task queue abstraction.
///
/// Delivery is at-least-once: a claimed task that is neither acked nor
/// dead-lettered before its lease expires is handed out again.
pub trait TaskQueue: Send + Sync {
    /// Push a new task.
    fn enqueue(&self, task: QueuedTask) -> Result<TaskId, QueueError>;

    /// Claim the oldest claimable task for `worker`.
    /// Returns None if nothing is available.
    fn claim_next(&self, worker: &str, lease_ttl: Duration)
    -> Result<Option<QueuedTask>, QueueError>;

    /// Remove a finished task.
    fn ack(&self, id: &TaskId) -> Result<(), QueueError>;

    /// Remove a task that cannot be processed and keep it for inspection.
    fn dead_letter(&self, id: &TaskId, reason: String) -> Result<(), QueueError>;

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError>;

    fn stats(&self) -> Result<QueueStats, QueueError>;
}

/// Task queue error.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("task not found: {0}")]
    NotFound(TaskId),
    #[error("task already queued: {0}")]
    AlreadyExists(TaskId),
    #[error("queue error: {0}")]
    Storage(String),
}

/// Queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub ready: usize,
    pub leased: usize,
    pub dead_lettered: usize,
}

fn poisoned<T>(_: PoisonError<T>) -> QueueError {
    QueueError::Storage("lock poisoned".to_string())
}

/// In-memory task queue for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryTaskQueue {
    tasks: RwLock<HashMap<TaskId, QueuedTask>>,
    dead_letters: RwLock<Vec<DeadLetterEntry>>,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl TaskQueue for InMemoryTaskQueue {
    fn enqueue(&self, task: QueuedTask) -> Result<TaskId, QueueError> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        if tasks.contains_key(&task.id) {
            return Err(QueueError::AlreadyExists(task.id));
        }
        let id = task.id.clone();
        tasks.insert(id.clone(), task);
        Ok(id)
    }

    fn claim_next(
        &self,
        worker: &str,
        lease_ttl: Duration,
    ) -> Result<Option<QueuedTask>, QueueError> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        let now = Utc::now();

        // FIFO among claimable tasks; id breaks ties for equal timestamps.
        let next = tasks
            .values()
            .filter(|t| t.is_claimable(now))
            .min_by(|a, b| {
                a.enqueued_at
                    .cmp(&b.enqueued_at)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|t| t.id.clone());

        let Some(id) = next else {
            return Ok(None);
        };
        let ttl = chrono::Duration::from_std(lease_ttl)
            .map_err(|e| QueueError::Storage(format!("invalid lease ttl: {e}")))?;

        match tasks.get_mut(&id) {
            Some(task) => {
                task.deliveries += 1;
                task.lease = Some(Lease {
                    worker: worker.to_string(),
                    expires_at: now + ttl,
                });
                Ok(Some(task.clone()))
            }
            None => Ok(None),
        }
    }

    fn ack(&self, id: &TaskId) -> Result<(), QueueError> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        tasks
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| QueueError::NotFound(id.clone()))
    }

    fn dead_letter(&self, id: &TaskId, reason: String) -> Result<(), QueueError> {
        let task = {
            let mut tasks = self.tasks.write().map_err(poisoned)?;
            tasks
                .remove(id)
                .ok_or_else(|| QueueError::NotFound(id.clone()))?
        };
        let mut dead = self.dead_letters.write().map_err(poisoned)?;
        dead.push(DeadLetterEntry {
            task,
            reason,
            dead_lettered_at: Utc::now(),
        });
        Ok(())
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        let dead = self.dead_letters.read().map_err(poisoned)?;
        Ok(dead.iter().take(limit).cloned().collect())
    }

    fn stats(&self) -> Result<QueueStats, QueueError> {
        let tasks = self.tasks.read().map_err(poisoned)?;
        let now = Utc::now();
        let leased = tasks.values().filter(|t| !t.is_claimable(now)).count();
        Ok(QueueStats {
            ready: tasks.len() - leased,
            leased,
            dead_lettered: self.dead_letters.read().map_err(poisoned)?.len(),
        })
    }
}

impl TaskQueue for Arc<InMemoryTaskQueue> {
    fn enqueue(&self, task: QueuedTask) -> Result<TaskId, QueueError> {
        (**self).enqueue(task)
    }

    fn claim_next(
        &self,
        worker: &str,
        lease_ttl: Duration,
    ) -> Result<Option<QueuedTask>, QueueError> {
        (**self).claim_next(worker, lease_ttl)
    }

    fn ack(&self, id: &TaskId) -> Result<(), QueueError> {
        (**self).ack(id)
    }

    fn dead_letter(&self, id: &TaskId, reason: String) -> Result<(), QueueError> {
        (**self).dead_letter(id, reason)
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        (**self).list_dead_letters(limit)
    }

    fn stats(&self) -> Result<QueueStats, QueueError> {
        (**self).stats()
    }
}
