//! Conversation context reduction.
//!
//! Chat requests built from a group's history can be arbitrarily long and
//! arbitrarily shaped. Before a request reaches a [`crate::ChatClient`] it is
//! normalized and cut down to fit the model's context window:
//!
//! ```text
//! drop blank ─▶ split system ─▶ end on user ─▶ collapse runs ─▶ start on user
//!                                                      │
//!                              token budget ◀─ max turns
//! ```

use std::collections::HashMap;

use thiserror::Error;

use taskforge_core::{ChatMessage, ChatRole};

use crate::chat::ChatRequest;

/// Placeholder appended when a conversation does not end with a user turn.
pub const CONTINUE_PROMPT: &str = "continue";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("exceeds max context length: needs {required} tokens, limit is {limit}")]
    ContextExceedsLimit { required: usize, limit: usize },
}

/// A request that fits the model, plus its prompt token count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReducedRequest {
    pub request: ChatRequest,
    pub input_tokens: usize,
}

pub trait ConversationContextReducer: Send + Sync {
    /// Reduce `request` to at most `max_turns` exchanges and `max_tokens`
    /// prompt tokens. System messages are always kept.
    fn fix(
        &self,
        request: ChatRequest,
        max_turns: usize,
        max_tokens: usize,
    ) -> Result<ReducedRequest, ContextError>;
}

/// Token estimation for a single message.
pub trait TokenCounter: Send + Sync {
    fn count(&self, model: &str, message: &ChatMessage) -> usize;
}

/// Rough estimate: four characters per token plus a fixed per-message overhead.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApproxTokenCounter;

impl TokenCounter for ApproxTokenCounter {
    fn count(&self, _model: &str, message: &ChatMessage) -> usize {
        4 + message.content.chars().count().div_ceil(4)
    }
}

/// Default reducer: keeps the most recent exchanges that fit.
#[derive(Debug, Clone)]
pub struct WindowedContextReducer<C: TokenCounter = ApproxTokenCounter> {
    counter: C,
    model_limits: HashMap<String, usize>,
    default_limit: usize,
}

impl WindowedContextReducer<ApproxTokenCounter> {
    pub fn new(default_limit: usize) -> Self {
        Self::with_counter(ApproxTokenCounter, default_limit)
    }
}

impl<C: TokenCounter> WindowedContextReducer<C> {
    pub fn with_counter(counter: C, default_limit: usize) -> Self {
        Self {
            counter,
            model_limits: HashMap::new(),
            default_limit,
        }
    }

    pub fn with_model_limit(mut self, model: impl Into<String>, limit: usize) -> Self {
        self.model_limits.insert(model.into(), limit);
        self
    }

    fn model_limit(&self, model: &str) -> usize {
        self.model_limits
            .get(model)
            .copied()
            .unwrap_or(self.default_limit)
    }
}

/// Newest-first, strictly alternating, starting (newest) and ending (oldest)
/// on a user message.
fn normalize(conversation: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let mut conversation = conversation;
    if conversation.last().map(|m| m.role) != Some(ChatRole::User) {
        conversation.push(ChatMessage::user(CONTINUE_PROMPT));
    }

    let mut newest_first: Vec<ChatMessage> = Vec::with_capacity(conversation.len());
    for message in conversation.into_iter().rev() {
        if newest_first.last().map(|m| m.role) == Some(message.role) {
            continue;
        }
        newest_first.push(message);
    }

    if newest_first.len() % 2 == 0 {
        newest_first.pop();
    }
    newest_first
}

impl<C: TokenCounter> ConversationContextReducer for WindowedContextReducer<C> {
    fn fix(
        &self,
        request: ChatRequest,
        max_turns: usize,
        max_tokens: usize,
    ) -> Result<ReducedRequest, ContextError> {
        let ChatRequest { model, messages } = request;

        let (system, conversation): (Vec<_>, Vec<_>) = messages
            .into_iter()
            .filter(|m| !m.is_blank())
            .partition(|m| m.role == ChatRole::System);

        let mut newest_first = normalize(conversation);
        newest_first.truncate(max_turns * 2 + 1);

        let system_tokens: usize = system.iter().map(|m| self.counter.count(&model, m)).sum();
        let model_limit = self.model_limit(&model);
        let limit = max_tokens.min(model_limit.saturating_sub(system_tokens));

        // The newest user message is mandatory; older exchanges are added in
        // (assistant, user) pairs while they fit.
        let mut kept = 0;
        let mut used = 0;
        let mut iter = newest_first.iter();
        if let Some(latest) = iter.next() {
            let tokens = self.counter.count(&model, latest);
            if tokens > limit {
                return Err(ContextError::ContextExceedsLimit {
                    required: system_tokens + tokens,
                    limit: model_limit.min(max_tokens + system_tokens),
                });
            }
            used = tokens;
            kept = 1;
        }
        while let (Some(assistant), Some(user)) = (iter.next(), iter.next()) {
            let pair = self.counter.count(&model, assistant) + self.counter.count(&model, user);
            if used + pair > limit {
                break;
            }
            used += pair;
            kept += 2;
        }
        newest_first.truncate(kept);

        let mut messages = system;
        messages.extend(newest_first.into_iter().rev());

        Ok(ReducedRequest {
            request: ChatRequest { model, messages },
            input_tokens: system_tokens + used,
        })
    }
}
