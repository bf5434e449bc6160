//! `taskforge-ai`
//!
//! **Responsibility:** boundary to the external AI services.
//!
//! This crate only describes what the engine needs from vendors:
//! - It does not know about queues, ledgers or persisted task state.
//! - Implementations do blocking I/O and must honour the [`CallContext`] deadline.
//! - Provider-specific wire formats live in the implementations, not here.

pub mod asset;
pub mod call;
pub mod chat;
pub mod context;
pub mod vendor;

pub use asset::{AssetError, AssetStore};
pub use call::CallContext;
pub use chat::{ChatClient, ChatError, ChatRequest, ChatResponse};
pub use context::{
    ApproxTokenCounter, ContextError, ConversationContextReducer, ReducedRequest, TokenCounter,
    WindowedContextReducer, CONTINUE_PROMPT,
};
pub use vendor::{
    VendorError, VendorJobClient, VendorJobKind, VendorJobState, VendorJobStatus, VendorRegistry,
    VendorRequest, VendorSubmission,
};
