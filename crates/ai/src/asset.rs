//! Permanent storage for vendor-hosted resources.

use thiserror::Error;

use taskforge_core::UserId;

use crate::call::CallContext;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AssetError {
    #[error("failed to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },
    #[error("failed to store asset: {0}")]
    Store(String),
}

/// Copies a vendor URL (which usually expires) into storage we control.
pub trait AssetStore: Send + Sync {
    /// Returns the permanent URL of the stored copy.
    fn persist(&self, ctx: &CallContext, owner: UserId, url: &str) -> Result<String, AssetError>;
}
