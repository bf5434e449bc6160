//! Copies vendor-hosted resources of a finished task to permanent storage.

use std::sync::Arc;

use tracing::warn;

use taskforge_ai::{AssetStore, CallContext};
use taskforge_core::{HistoryUpdate, TaskError, TaskPayload, TaskResult};

use super::{Completion, HandlerOutcome, TaskHandler};
use crate::store::HistoryStore;

pub struct ImageDownloadHandler {
    assets: Arc<dyn AssetStore>,
    history: Arc<dyn HistoryStore>,
}

impl ImageDownloadHandler {
    pub fn new(assets: Arc<dyn AssetStore>, history: Arc<dyn HistoryStore>) -> Self {
        Self { assets, history }
    }
}

impl TaskHandler for ImageDownloadHandler {
    fn handle(&self, ctx: &CallContext, payload: &TaskPayload) -> TaskResult<HandlerOutcome> {
        let TaskPayload::ImageDownload(download) = payload else {
            return Err(TaskError::handler(format!(
                "image download handler cannot serve {}",
                payload.task_type()
            )));
        };

        let owner = download.meta.uid;
        let persisted = download
            .resources
            .iter()
            .filter(|url| !url.trim().is_empty())
            .map(|url| self.assets.persist(ctx, owner, url))
            .collect::<Result<Vec<String>, _>>()
            .map_err(|e| TaskError::handler(e.to_string()))?;

        // The source task is already terminal; only its history answer moves
        // to the permanent copies.
        let completion = Completion::assets(persisted);
        let update = HistoryUpdate::answer(completion.history_answer());
        if let Err(e) = self
            .history
            .update_history_record(owner, &download.source_task_id, &update)
        {
            warn!(
                task_id = %ctx.task_id(),
                source_task_id = %download.source_task_id,
                error = %e,
                "failed to point history at persisted assets"
            );
        }

        Ok(HandlerOutcome::Completed(completion))
    }
}
