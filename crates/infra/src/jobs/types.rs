//! Queue envelope types and the pending-task poll schedule.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use taskforge_core::{TaskId, TaskType};

/// A claim on a queued task held by one worker until `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub worker: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Raw task as it sits on the queue: the type tag plus the encoded payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedTask {
    pub id: TaskId,
    pub task_type: TaskType,
    pub payload: Vec<u8>,
    pub enqueued_at: DateTime<Utc>,
    /// Number of times the task has been claimed.
    pub deliveries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
}

impl QueuedTask {
    pub fn new(id: TaskId, task_type: TaskType, payload: Vec<u8>) -> Self {
        Self {
            id,
            task_type,
            payload,
            enqueued_at: Utc::now(),
            deliveries: 0,
            lease: None,
        }
    }

    /// Claimable when never leased or when the previous lease lapsed.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().is_none_or(|l| l.is_expired(now))
    }
}

/// A task that could not be dispatched at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub task: QueuedTask,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// How the wait between polls grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time
    #[default]
    Fixed,
    /// base * 2^(n-1)
    Exponential,
    /// base * n
    Linear,
}

impl std::str::FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            other => Err(format!("unknown backoff strategy: {other}")),
        }
    }
}

/// Delay before the next poll of a pending task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSchedule {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5))
    }
}

impl PollSchedule {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    pub fn linear(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Linear,
        }
    }

    /// Delay after the `attempt`-th unfinished poll (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow((attempt - 1).min(31));
                self.base_delay
                    .saturating_mul(factor)
                    .min(self.max_delay.max(self.base_delay))
            }
            BackoffStrategy::Linear => self
                .base_delay
                .saturating_mul(attempt)
                .min(self.max_delay.max(self.base_delay)),
        }
    }

    pub fn next_poll_at(&self, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay_for_attempt(attempt))
            .unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
