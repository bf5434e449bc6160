//! Task payloads: the serializable unit of work handed to handlers.
//!
//! A payload is pure data. Each variant carries a [`TaskMeta`] block with the
//! fields every stage needs (identity, owner, price, model, submission time)
//! plus the vendor-specific request fields. The raw bytes on the queue are the
//! JSON encoding of the variant struct; the task type travels next to them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chat::ChatMessage;
use crate::error::{TaskError, TaskResult};
use crate::id::{TaskId, UserId};

/// Task-type tag used for handler routing and payload decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    ImageCompletion,
    ArtisticText,
    ImageToVideo,
    ImageUpscale,
    ImageColorization,
    GroupChat,
    ImageDownload,
}

impl TaskType {
    pub const ALL: [TaskType; 7] = [
        TaskType::ImageCompletion,
        TaskType::ArtisticText,
        TaskType::ImageToVideo,
        TaskType::ImageUpscale,
        TaskType::ImageColorization,
        TaskType::GroupChat,
        TaskType::ImageDownload,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::ImageCompletion => "image_completion",
            TaskType::ArtisticText => "artistic_text",
            TaskType::ImageToVideo => "image_to_video",
            TaskType::ImageUpscale => "image_upscale",
            TaskType::ImageColorization => "image_colorization",
            TaskType::GroupChat => "group_chat",
            TaskType::ImageDownload => "image_download",
        }
    }

    /// Whether tasks of this type mirror their outcome into a user-visible
    /// history record.
    pub fn has_history(&self) -> bool {
        !matches!(self, TaskType::ImageDownload)
    }
}

impl core::fmt::Display for TaskType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for TaskType {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| TaskError::decode(format!("unknown task type: {s}")))
    }
}

/// Fields shared by every payload variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMeta {
    /// Assigned at submission; `None` until then.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TaskId>,
    pub uid: UserId,
    /// Estimated cost in quota units.
    #[serde(default)]
    pub quota: i64,
    /// Amount actually frozen at submission.
    #[serde(default)]
    pub frozen_quota: i64,
    #[serde(default)]
    pub model: String,
    pub created_at: DateTime<Utc>,
}

impl TaskMeta {
    pub fn new(uid: UserId, model: impl Into<String>, quota: i64) -> Self {
        Self {
            id: None,
            uid,
            quota,
            frozen_quota: 0,
            model: model.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageCompletionPayload {
    #[serde(flatten)]
    pub meta: TaskMeta,
    /// Vendor name used to pick the client at dispatch time.
    pub vendor: String,
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    /// Reference image for image-to-image requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default = "one")]
    pub image_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style_preset: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtisticTextPayload {
    #[serde(flatten)]
    pub meta: TaskMeta,
    pub text: String,
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    #[serde(default = "one")]
    pub image_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageToVideoPayload {
    #[serde(flatten)]
    pub meta: TaskMeta,
    pub image: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUpscalePayload {
    #[serde(flatten)]
    pub meta: TaskMeta,
    pub image: String,
    #[serde(default = "two")]
    pub scale: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageColorizationPayload {
    #[serde(flatten)]
    pub meta: TaskMeta,
    pub image: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupChatPayload {
    #[serde(flatten)]
    pub meta: TaskMeta,
    pub group_id: i64,
    /// Message row that receives the answer.
    pub message_id: i64,
    pub context_messages: Vec<ChatMessage>,
}

/// Copies vendor-hosted resources of a finished task to permanent storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageDownloadPayload {
    #[serde(flatten)]
    pub meta: TaskMeta,
    pub source_task_id: TaskId,
    pub resources: Vec<String>,
}

fn one() -> u32 {
    1
}

fn two() -> u32 {
    2
}

/// Tagged union over all task payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskPayload {
    ImageCompletion(ImageCompletionPayload),
    ArtisticText(ArtisticTextPayload),
    ImageToVideo(ImageToVideoPayload),
    ImageUpscale(ImageUpscalePayload),
    ImageColorization(ImageColorizationPayload),
    GroupChat(GroupChatPayload),
    ImageDownload(ImageDownloadPayload),
}

impl TaskPayload {
    /// Decode the raw queue bytes of a payload of the given type.
    pub fn decode(task_type: TaskType, raw: &[u8]) -> TaskResult<Self> {
        let payload = match task_type {
            TaskType::ImageCompletion => Self::ImageCompletion(serde_json::from_slice(raw)?),
            TaskType::ArtisticText => Self::ArtisticText(serde_json::from_slice(raw)?),
            TaskType::ImageToVideo => Self::ImageToVideo(serde_json::from_slice(raw)?),
            TaskType::ImageUpscale => Self::ImageUpscale(serde_json::from_slice(raw)?),
            TaskType::ImageColorization => Self::ImageColorization(serde_json::from_slice(raw)?),
            TaskType::GroupChat => Self::GroupChat(serde_json::from_slice(raw)?),
            TaskType::ImageDownload => Self::ImageDownload(serde_json::from_slice(raw)?),
        };
        Ok(payload)
    }

    /// Decode a payload previously stored as a JSON value.
    pub fn from_value(task_type: TaskType, value: &serde_json::Value) -> TaskResult<Self> {
        let raw = serde_json::to_vec(value)?;
        Self::decode(task_type, &raw)
    }

    pub fn encode(&self) -> TaskResult<Vec<u8>> {
        let raw = match self {
            Self::ImageCompletion(p) => serde_json::to_vec(p)?,
            Self::ArtisticText(p) => serde_json::to_vec(p)?,
            Self::ImageToVideo(p) => serde_json::to_vec(p)?,
            Self::ImageUpscale(p) => serde_json::to_vec(p)?,
            Self::ImageColorization(p) => serde_json::to_vec(p)?,
            Self::GroupChat(p) => serde_json::to_vec(p)?,
            Self::ImageDownload(p) => serde_json::to_vec(p)?,
        };
        Ok(raw)
    }

    pub fn to_value(&self) -> TaskResult<serde_json::Value> {
        Ok(serde_json::from_slice(&self.encode()?)?)
    }

    pub fn task_type(&self) -> TaskType {
        match self {
            Self::ImageCompletion(_) => TaskType::ImageCompletion,
            Self::ArtisticText(_) => TaskType::ArtisticText,
            Self::ImageToVideo(_) => TaskType::ImageToVideo,
            Self::ImageUpscale(_) => TaskType::ImageUpscale,
            Self::ImageColorization(_) => TaskType::ImageColorization,
            Self::GroupChat(_) => TaskType::GroupChat,
            Self::ImageDownload(_) => TaskType::ImageDownload,
        }
    }

    pub fn meta(&self) -> &TaskMeta {
        match self {
            Self::ImageCompletion(p) => &p.meta,
            Self::ArtisticText(p) => &p.meta,
            Self::ImageToVideo(p) => &p.meta,
            Self::ImageUpscale(p) => &p.meta,
            Self::ImageColorization(p) => &p.meta,
            Self::GroupChat(p) => &p.meta,
            Self::ImageDownload(p) => &p.meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut TaskMeta {
        match self {
            Self::ImageCompletion(p) => &mut p.meta,
            Self::ArtisticText(p) => &mut p.meta,
            Self::ImageToVideo(p) => &mut p.meta,
            Self::ImageUpscale(p) => &mut p.meta,
            Self::ImageColorization(p) => &mut p.meta,
            Self::GroupChat(p) => &mut p.meta,
            Self::ImageDownload(p) => &mut p.meta,
        }
    }

    pub fn id(&self) -> Option<&TaskId> {
        self.meta().id.as_ref()
    }

    /// The assigned id, or a decode error for payloads that never got one.
    pub fn require_id(&self) -> TaskResult<&TaskId> {
        self.id()
            .ok_or_else(|| TaskError::decode("payload has no task id"))
    }

    /// Assign the task id. An id can be assigned only once.
    pub fn assign_id(&mut self, id: TaskId) -> TaskResult<()> {
        let meta = self.meta_mut();
        match &meta.id {
            Some(existing) if *existing == id => Ok(()),
            Some(existing) => Err(TaskError::handler(format!(
                "task id already assigned: {existing}"
            ))),
            None => {
                meta.id = Some(id);
                Ok(())
            }
        }
    }

    pub fn uid(&self) -> UserId {
        self.meta().uid
    }

    pub fn quota(&self) -> i64 {
        self.meta().quota
    }

    pub fn frozen_quota(&self) -> i64 {
        self.meta().frozen_quota
    }

    pub fn model(&self) -> &str {
        &self.meta().model
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.meta().created_at
    }

    /// Vendor named by the payload itself, if the variant carries one.
    pub fn vendor(&self) -> Option<&str> {
        match self {
            Self::ImageCompletion(p) => Some(p.vendor.as_str()),
            _ => None,
        }
    }

    /// Short human-readable title for the queue row and history record.
    pub fn title(&self) -> String {
        let text = match self {
            Self::ImageCompletion(p) => p.prompt.as_str(),
            Self::ArtisticText(p) => p.text.as_str(),
            Self::ImageToVideo(p) => p.prompt.as_str(),
            Self::ImageUpscale(_) => "image upscale",
            Self::ImageColorization(_) => "image colorization",
            Self::GroupChat(p) => p
                .context_messages
                .last()
                .map(|m| m.content.as_str())
                .unwrap_or("group chat"),
            Self::ImageDownload(_) => "image download",
        };
        text.chars().take(70).collect()
    }

    /// Source image the task works from, if any.
    pub fn image(&self) -> Option<&str> {
        match self {
            Self::ImageCompletion(p) => p.image.as_deref(),
            Self::ImageToVideo(p) => Some(p.image.as_str()),
            Self::ImageUpscale(p) => Some(p.image.as_str()),
            Self::ImageColorization(p) => Some(p.image.as_str()),
            Self::ArtisticText(_) | Self::GroupChat(_) | Self::ImageDownload(_) => None,
        }
    }

    /// Requested output size, when known up front.
    pub fn dimensions(&self) -> (Option<u32>, Option<u32>) {
        match self {
            Self::ImageCompletion(p) => (p.width, p.height),
            _ => (None, None),
        }
    }
}

/// Replay record stored on a pending task: the vendor job reference plus the
/// original payload so the poller can rebuild it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingPayload {
    pub vendor: String,
    pub vendor_job_id: String,
    pub payload: serde_json::Value,
}

impl PendingPayload {
    pub fn new(
        vendor: impl Into<String>,
        vendor_job_id: impl Into<String>,
        payload: &TaskPayload,
    ) -> TaskResult<Self> {
        Ok(Self {
            vendor: vendor.into(),
            vendor_job_id: vendor_job_id.into(),
            payload: payload.to_value()?,
        })
    }

    pub fn task_payload(&self, task_type: TaskType) -> TaskResult<TaskPayload> {
        TaskPayload::from_value(task_type, &self.payload)
    }
}
