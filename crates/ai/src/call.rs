use std::time::{Duration, Instant};

use taskforge_core::TaskId;

/// Per-invocation context handed to vendor and chat clients.
///
/// Carries the task being served and a deadline the client must honour for
/// its blocking calls (HTTP timeouts and the like).
#[derive(Debug, Clone)]
pub struct CallContext {
    task_id: TaskId,
    deadline: Instant,
}

impl CallContext {
    pub fn new(task_id: TaskId, timeout: Duration) -> Self {
        Self {
            task_id,
            deadline: Instant::now() + timeout,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}
