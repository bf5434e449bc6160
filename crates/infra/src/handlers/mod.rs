//! Task handlers and the registry that routes task types to them.
//!
//! ## Contract
//!
//! A handler turns a payload into one of two outcomes:
//!
//! - `Completed`: the work is done and settlement can happen now
//! - `Accepted`: a vendor job was started; the poller takes over and calls
//!   [`TaskHandler::poll`] until the job finishes or the deadline passes
//!
//! Handlers never touch queue rows, pending tasks or the ledger. Errors and
//! panics are converted to failures by the caller.

pub mod download;
pub mod group_chat;
pub mod vendor;

use std::collections::HashMap;
use std::sync::Arc;

use taskforge_ai::CallContext;
use taskforge_core::{TaskError, TaskPayload, TaskResult, TaskType};

pub use download::ImageDownloadHandler;
pub use group_chat::GroupChatHandler;
pub use vendor::{VendorRoute, VendorTaskHandler};

/// Finished output of a task.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Completion {
    pub resources: Vec<String>,
    pub origin_image: Option<String>,
    /// Text answer for tasks that produce no assets.
    pub answer: Option<String>,
    /// Realized cost reported by the handler (metered settlement).
    pub metered_cost: Option<i64>,
    pub vendor: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl Completion {
    pub fn assets(resources: Vec<String>) -> Self {
        Self {
            resources,
            ..Default::default()
        }
    }

    pub fn text(answer: impl Into<String>) -> Self {
        Self {
            answer: Some(answer.into()),
            ..Default::default()
        }
    }

    pub fn with_vendor(mut self, vendor: impl Into<String>) -> Self {
        self.vendor = Some(vendor.into());
        self
    }

    pub fn with_origin_image(mut self, origin: impl Into<String>) -> Self {
        self.origin_image = Some(origin.into());
        self
    }

    pub fn with_metered_cost(mut self, cost: i64) -> Self {
        self.metered_cost = Some(cost);
        self
    }

    /// What the history mirror shows as the answer.
    pub fn history_answer(&self) -> String {
        match &self.answer {
            Some(answer) => answer.clone(),
            None => serde_json::Value::from(self.resources.clone()).to_string(),
        }
    }
}

/// Reference to a job running at a vendor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorJobRef {
    pub vendor: String,
    pub job_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Completed(Completion),
    Accepted(VendorJobRef),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Not finished yet; poll again later.
    InProgress,
    Completed(Completion),
    /// The vendor gave up on the job.
    Failed(String),
}

pub trait TaskHandler: Send + Sync {
    fn handle(&self, ctx: &CallContext, payload: &TaskPayload) -> TaskResult<HandlerOutcome>;

    /// Check on a job previously returned as [`HandlerOutcome::Accepted`].
    ///
    /// [`TaskError::VendorUnavailable`] means "could not ask right now" and
    /// keeps the task waiting; any other error fails it.
    fn poll(
        &self,
        _ctx: &CallContext,
        payload: &TaskPayload,
        _job: &VendorJobRef,
    ) -> TaskResult<PollOutcome> {
        Err(TaskError::handler(format!(
            "{} tasks do not wait on vendor jobs",
            payload.task_type()
        )))
    }

    /// Payload to enqueue after a successful completion.
    fn follow_up(&self, _payload: &TaskPayload, _completion: &Completion) -> Option<TaskPayload> {
        None
    }

    /// Whether success requires at least one resource.
    fn produces_assets(&self) -> bool {
        true
    }
}

/// Task type to handler routing, built once at startup.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task_type: TaskType, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(task_type, handler);
    }

    pub fn with(mut self, task_type: TaskType, handler: Arc<dyn TaskHandler>) -> Self {
        self.register(task_type, handler);
        self
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&task_type).cloned()
    }

    pub fn task_types(&self) -> Vec<TaskType> {
        let mut types: Vec<TaskType> = self.handlers.keys().copied().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}

/// Drop blank resources and enforce non-empty output where the handler
/// promises assets.
pub fn validate_completion(
    handler: &dyn TaskHandler,
    mut completion: Completion,
) -> TaskResult<Completion> {
    completion.resources.retain(|r| !r.trim().is_empty());
    if handler.produces_assets() && completion.resources.is_empty() {
        return Err(TaskError::EmptyOutput);
    }
    Ok(completion)
}
