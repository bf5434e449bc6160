//! Chat completion boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use taskforge_core::ChatMessage;

use crate::call::CallContext;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChatResponse {
    pub text: String,
    /// Vendor-side error code; a non-empty code means the answer is unusable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Completion tokens as reported by the vendor.
    #[serde(default)]
    pub output_tokens: usize,
}

impl ChatResponse {
    pub fn text(text: impl Into<String>, output_tokens: usize) -> Self {
        Self {
            text: text.into(),
            output_tokens,
            ..Default::default()
        }
    }

    pub fn failure(&self) -> Option<String> {
        let code = self.error_code.as_deref().filter(|c| !c.is_empty())?;
        Some(match &self.error {
            Some(detail) if !detail.is_empty() => format!("{code}: {detail}"),
            _ => code.to_string(),
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("chat transport error: {0}")]
    Transport(String),
    #[error("chat request rejected: {0}")]
    Rejected(String),
}

pub trait ChatClient: Send + Sync {
    fn chat(&self, ctx: &CallContext, request: &ChatRequest) -> Result<ChatResponse, ChatError>;
}
