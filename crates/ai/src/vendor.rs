//! Vendor job boundary.
//!
//! A vendor either answers a submission directly with finished resources or
//! accepts it and hands back a job id that is later polled with
//! [`VendorJobClient::query_status`]. Request encoding for each provider lives
//! behind this trait.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::call::CallContext;

/// What kind of generation is being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VendorJobKind {
    TextToImage,
    ImageToImage,
    ArtisticText,
    ImageToVideo,
    Upscale,
    Colorize,
}

/// Provider-neutral generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorRequest {
    pub kind: VendorJobKind,
    pub model: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
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
    pub scale: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style_preset: Option<String>,
}

impl VendorRequest {
    pub fn new(kind: VendorJobKind, model: impl Into<String>) -> Self {
        Self {
            kind,
            model: model.into(),
            prompt: String::new(),
            negative_prompt: String::new(),
            image: None,
            text: None,
            image_count: 1,
            width: None,
            height: None,
            steps: None,
            seed: None,
            scale: None,
            style_preset: None,
        }
    }
}

/// Answer to a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VendorSubmission {
    /// The vendor finished synchronously.
    Completed { resources: Vec<String> },
    /// The vendor queued the work under `job_id`.
    Accepted { job_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VendorJobState {
    Pending,
    Running,
    Success,
    Failed,
    Unknown,
}

impl VendorJobState {
    /// Pending, running and unknown all mean "ask again later".
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            VendorJobState::Pending | VendorJobState::Running | VendorJobState::Unknown
        )
    }
}

/// Result of a status query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorJobStatus {
    pub state: VendorJobState,
    /// Resource URLs, populated on success. May contain blanks.
    pub resources: Vec<String>,
    /// Vendor-provided failure detail.
    pub message: Option<String>,
}

impl VendorJobStatus {
    pub fn in_state(state: VendorJobState) -> Self {
        Self {
            state,
            resources: Vec::new(),
            message: None,
        }
    }

    pub fn succeeded(resources: Vec<String>) -> Self {
        Self {
            state: VendorJobState::Success,
            resources,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            state: VendorJobState::Failed,
            resources: Vec::new(),
            message: Some(message.into()),
        }
    }

    /// Resource URLs with blank entries removed.
    pub fn usable_resources(&self) -> Vec<String> {
        self.resources
            .iter()
            .filter(|r| !r.trim().is_empty())
            .cloned()
            .collect()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VendorError {
    /// Network failure, timeout, 5xx and the like.
    #[error("vendor transport error: {0}")]
    Transport(String),

    /// The vendor refused the request (bad input, moderation, quota on their side).
    #[error("vendor rejected request: {0}")]
    Rejected(String),

    #[error("vendor returned an unreadable response: {0}")]
    InvalidResponse(String),
}

/// Client for one AI vendor.
pub trait VendorJobClient: Send + Sync {
    fn submit(
        &self,
        ctx: &CallContext,
        request: &VendorRequest,
    ) -> Result<VendorSubmission, VendorError>;

    fn query_status(&self, ctx: &CallContext, job_id: &str)
    -> Result<VendorJobStatus, VendorError>;
}

/// Vendor clients by name, built at startup.
#[derive(Default, Clone)]
pub struct VendorRegistry {
    clients: HashMap<String, Arc<dyn VendorJobClient>>,
}

impl VendorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, client: Arc<dyn VendorJobClient>) {
        self.clients.insert(name.into(), client);
    }

    pub fn with(mut self, name: impl Into<String>, client: Arc<dyn VendorJobClient>) -> Self {
        self.register(name, client);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn VendorJobClient>> {
        self.clients.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.clients.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for VendorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VendorRegistry")
            .field("vendors", &self.names())
            .finish()
    }
}
