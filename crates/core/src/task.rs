//! Persisted task records and the results attached to them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TaskResult;
use crate::id::{TaskId, UserId};
use crate::payload::{TaskPayload, TaskType};

/// Status of the user-facing queue row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueTaskStatus {
    Running,
    Success,
    Failed,
}

impl QueueTaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueTaskStatus::Success | QueueTaskStatus::Failed)
    }
}

/// The queue row. Terminal status and result never change once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueTask {
    pub id: TaskId,
    pub uid: UserId,
    pub task_type: TaskType,
    pub title: String,
    pub status: QueueTaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueTask {
    pub fn running(id: TaskId, uid: UserId, task_type: TaskType, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            uid,
            task_type,
            title: title.into(),
            status: QueueTaskStatus::Running,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingTaskStatus {
    Processing,
    Success,
    Failed,
}

impl PendingTaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PendingTaskStatus::Processing)
    }
}

/// A task waiting on a third-party job.
///
/// Leaves `Processing` exactly once. Terminal records are kept, never polled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTask {
    pub task_id: TaskId,
    pub task_type: TaskType,
    /// Serialized [`crate::PendingPayload`] used to replay the task.
    pub payload: serde_json::Value,
    pub status: PendingTaskStatus,
    pub next_execute_at: DateTime<Utc>,
    pub deadline_at: DateTime<Utc>,
    pub execute_times: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PendingTask {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == PendingTaskStatus::Processing && self.next_execute_at <= now
    }

    pub fn deadline_passed(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline_at
    }
}

/// Change applied to a pending task by the poller.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTaskUpdate {
    pub status: PendingTaskStatus,
    pub next_execute_at: Option<DateTime<Utc>>,
    pub execute_times: Option<u32>,
}

impl PendingTaskUpdate {
    /// Keep waiting: schedule the next poll and bump the counter.
    pub fn rearm(next_execute_at: DateTime<Utc>, execute_times: u32) -> Self {
        Self {
            status: PendingTaskStatus::Processing,
            next_execute_at: Some(next_execute_at),
            execute_times: Some(execute_times),
        }
    }

    pub fn succeeded() -> Self {
        Self {
            status: PendingTaskStatus::Success,
            next_execute_at: None,
            execute_times: None,
        }
    }

    pub fn failed() -> Self {
        Self {
            status: PendingTaskStatus::Failed,
            next_execute_at: None,
            execute_times: None,
        }
    }
}

/// Outcome of a conditional write against a record with a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The record was already terminal; nothing was written.
    AlreadyTerminal,
}

impl Transition {
    pub fn applied(&self) -> bool {
        matches!(self, Transition::Applied)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    Pending,
    Success,
    Failed,
}

/// User-visible mirror of a task (creative history / chat message row).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub uid: UserId,
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub model: String,
    pub title: String,
    pub quota_reserved: i64,
    pub status: HistoryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default)]
    pub quota_used: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl HistoryRecord {
    /// Fresh record for a just-submitted task. The payload must carry its id.
    pub fn pending(payload: &TaskPayload) -> TaskResult<Self> {
        let now = Utc::now();
        Ok(Self {
            uid: payload.uid(),
            task_id: payload.require_id()?.clone(),
            task_type: payload.task_type(),
            model: payload.model().to_string(),
            title: payload.title(),
            quota_reserved: payload.frozen_quota(),
            status: HistoryStatus::Pending,
            answer: None,
            quota_used: 0,
            error: None,
            created_at: now,
            updated_at: now,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct HistoryUpdate {
    pub status: Option<HistoryStatus>,
    pub answer: Option<String>,
    pub quota_used: Option<i64>,
    pub error: Option<String>,
}

impl HistoryUpdate {
    pub fn succeeded(answer: impl Into<String>, quota_used: i64) -> Self {
        Self {
            status: Some(HistoryStatus::Success),
            answer: Some(answer.into()),
            quota_used: Some(quota_used),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(HistoryStatus::Failed),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Replace the answer only, leaving status untouched.
    pub fn answer(answer: impl Into<String>) -> Self {
        Self {
            answer: Some(answer.into()),
            ..Default::default()
        }
    }
}

/// Result blob stored on a successful queue row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_image: Option<String>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_before: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// Result blob stored on a failed queue row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResult {
    pub errors: Vec<String>,
}

impl ErrorResult {
    pub fn single(error: impl Into<String>) -> Self {
        Self {
            errors: vec![error.into()],
        }
    }
}

/// What the status read path returns to a task's owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskStatusView {
    Running,
    Success {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin_image: Option<String>,
        resources: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        valid_before: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        width: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        height: Option<u32>,
    },
    Failed {
        errors: Vec<String>,
    },
}

impl From<CompletionResult> for TaskStatusView {
    fn from(value: CompletionResult) -> Self {
        TaskStatusView::Success {
            origin_image: value.origin_image,
            resources: value.resources,
            valid_before: value.valid_before,
            width: value.width,
            height: value.height,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn pending_task_is_due_only_while_processing() {
        let now = Utc::now();
        let mut task = PendingTask {
            task_id: "t".parse().unwrap(),
            task_type: TaskType::ImageCompletion,
            payload: serde_json::Value::Null,
            status: PendingTaskStatus::Processing,
            next_execute_at: now - Duration::seconds(1),
            deadline_at: now + Duration::minutes(30),
            execute_times: 0,
            created_at: now,
            updated_at: now,
        };
        assert!(task.is_due(now));
        assert!(!task.deadline_passed(now));

        task.status = PendingTaskStatus::Success;
        assert!(!task.is_due(now));
    }

    #[test]
    fn status_view_serializes_with_status_tag() {
        let view = TaskStatusView::Failed {
            errors: vec!["boom".into()],
        };
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["errors"][0], "boom");

        let json = serde_json::to_value(TaskStatusView::Running).unwrap();
        assert_eq!(json, serde_json::json!({ "status": "running" }));
    }

    #[test]
    fn empty_result_parses_as_completion() {
        let parsed: CompletionResult = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(parsed.resources.is_empty());
        assert!(parsed.valid_before.is_none());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!QueueTaskStatus::Running.is_terminal());
        assert!(QueueTaskStatus::Success.is_terminal());
        assert!(QueueTaskStatus::Failed.is_terminal());
        assert!(!PendingTaskStatus::Processing.is_terminal());
        assert!(PendingTaskStatus::Failed.is_terminal());
    }
}
