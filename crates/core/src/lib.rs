//! `taskforge-core`: task model building blocks.
//!
//! Pure data and policy types shared by the vendor boundary and the engine
//! (no threads, no storage).

pub mod chat;
pub mod error;
pub mod id;
pub mod payload;
pub mod quota;
pub mod task;

pub use chat::{ChatMessage, ChatRole};
pub use error::{TaskError, TaskResult};
pub use id::{TaskId, UserId};
pub use payload::{
    ArtisticTextPayload, GroupChatPayload, ImageColorizationPayload, ImageCompletionPayload,
    ImageDownloadPayload, ImageToVideoPayload, ImageUpscalePayload, PendingPayload, TaskMeta,
    TaskPayload, TaskType,
};
pub use quota::{ConsumeMeta, PriceBook, QuotaBalance, SettlementPolicy};
pub use task::{
    CompletionResult, ErrorResult, HistoryRecord, HistoryStatus, HistoryUpdate, PendingTask,
    PendingTaskStatus, PendingTaskUpdate, QueueTask, QueueTaskStatus, TaskStatusView, Transition,
};
