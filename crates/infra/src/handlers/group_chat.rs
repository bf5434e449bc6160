//! Group chat answers.

use std::sync::Arc;

use taskforge_ai::{CallContext, ChatClient, ChatRequest, ConversationContextReducer};
use taskforge_core::{PriceBook, TaskError, TaskPayload, TaskResult};

use super::{Completion, HandlerOutcome, TaskHandler};

pub const DEFAULT_MAX_TURNS: usize = 5;
pub const DEFAULT_MAX_TOKENS: usize = 200 * 1024;

/// Answers a group chat message synchronously.
///
/// The conversation is reduced to fit the model before the call, and the
/// realized token usage is reported as the metered cost.
pub struct GroupChatHandler {
    chat: Arc<dyn ChatClient>,
    reducer: Arc<dyn ConversationContextReducer>,
    prices: PriceBook,
    max_turns: usize,
    max_tokens: usize,
}

impl GroupChatHandler {
    pub fn new(
        chat: Arc<dyn ChatClient>,
        reducer: Arc<dyn ConversationContextReducer>,
        prices: PriceBook,
    ) -> Self {
        Self {
            chat,
            reducer,
            prices,
            max_turns: DEFAULT_MAX_TURNS,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn with_limits(mut self, max_turns: usize, max_tokens: usize) -> Self {
        self.max_turns = max_turns;
        self.max_tokens = max_tokens;
        self
    }
}

impl TaskHandler for GroupChatHandler {
    fn handle(&self, ctx: &CallContext, payload: &TaskPayload) -> TaskResult<HandlerOutcome> {
        let TaskPayload::GroupChat(chat) = payload else {
            return Err(TaskError::handler(format!(
                "group chat handler cannot serve {}",
                payload.task_type()
            )));
        };

        let request = ChatRequest::new(&chat.meta.model, chat.context_messages.clone());
        let reduced = self
            .reducer
            .fix(request, self.max_turns, self.max_tokens)
            .map_err(|e| TaskError::handler(e.to_string()))?;

        let response = self
            .chat
            .chat(ctx, &reduced.request)
            .map_err(|e| TaskError::vendor_failed(e.to_string()))?;
        if let Some(failure) = response.failure() {
            return Err(TaskError::vendor_failed(failure));
        }

        let tokens = reduced.input_tokens + response.output_tokens;
        Ok(HandlerOutcome::Completed(
            Completion::text(response.text).with_metered_cost(self.prices.chat_cost(tokens)),
        ))
    }

    fn produces_assets(&self) -> bool {
        false
    }
}
