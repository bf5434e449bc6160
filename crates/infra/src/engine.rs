//! Wiring of the whole engine from an [`EngineConfig`].
//!
//! ```text
//!            submit                 claim
//! client ──▶ TaskService ──▶ queue ──────▶ DispatchPool ──▶ Dispatcher
//!                                                                │ Accepted
//!                                                          pending tasks
//!                                                                │
//!                                            PendingTaskPoller ◀─┘
//! ```
//!
//! Dispatcher and poller share one [`Settler`], whose sink feeds chained
//! follow-up tasks back into the queue.

use std::io;
use std::sync::Arc;

use tracing::info;

use taskforge_ai::{
    AssetStore, ChatClient, ConversationContextReducer, VendorRegistry, WindowedContextReducer,
};
use taskforge_core::{PriceBook, TaskType};

use crate::compensator::QuotaCompensator;
use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::handlers::{
    GroupChatHandler, HandlerRegistry, ImageDownloadHandler, VendorRoute, VendorTaskHandler,
};
use crate::jobs::{DispatchPool, DispatchPoolHandle, PoolStats, TaskQueue};
use crate::ledger::QuotaLedger;
use crate::poller::{PendingTaskPoller, PollerHandle, PollerStats};
use crate::service::TaskService;
use crate::settle::Settler;
use crate::sink::{QueueSink, TaskSink};
use crate::store::{HistoryStore, ResultStore};

/// Default context window assumed for chat models without a known limit.
pub const DEFAULT_CHAT_CONTEXT_LIMIT: usize = 32 * 1024;

/// Vendors bound to the task types that do not name one in their payload.
#[derive(Debug, Clone)]
pub struct VendorBindings {
    pub artistic_text: String,
    pub image_to_video: String,
    pub upscale: String,
    pub colorization: String,
}

impl Default for VendorBindings {
    fn default() -> Self {
        Self {
            artistic_text: "dashscope".to_string(),
            image_to_video: "dashscope".to_string(),
            upscale: "dashscope".to_string(),
            colorization: "dashscope".to_string(),
        }
    }
}

/// Register the standard handler for every task type.
pub fn standard_handlers(
    config: &EngineConfig,
    vendors: VendorRegistry,
    bindings: &VendorBindings,
    chat: Arc<dyn ChatClient>,
    assets: Arc<dyn AssetStore>,
    history: Arc<dyn HistoryStore>,
) -> HandlerRegistry {
    let vendor_handler = |route: VendorRoute| {
        Arc::new(
            VendorTaskHandler::new(vendors.clone(), route)
                .with_asset_persistence(config.persist_assets),
        )
    };
    let reducer: Arc<dyn ConversationContextReducer> =
        Arc::new(WindowedContextReducer::new(DEFAULT_CHAT_CONTEXT_LIMIT));
    let chat_handler = GroupChatHandler::new(chat, reducer, config.price_book())
        .with_limits(config.chat_max_turns, config.chat_max_tokens);

    HandlerRegistry::new()
        .with(TaskType::ImageCompletion, vendor_handler(VendorRoute::FromPayload))
        .with(
            TaskType::ArtisticText,
            vendor_handler(VendorRoute::Fixed(bindings.artistic_text.clone())),
        )
        .with(
            TaskType::ImageToVideo,
            vendor_handler(VendorRoute::Fixed(bindings.image_to_video.clone())),
        )
        .with(
            TaskType::ImageUpscale,
            vendor_handler(VendorRoute::Fixed(bindings.upscale.clone())),
        )
        .with(
            TaskType::ImageColorization,
            vendor_handler(VendorRoute::Fixed(bindings.colorization.clone())),
        )
        .with(TaskType::GroupChat, Arc::new(chat_handler))
        .with(
            TaskType::ImageDownload,
            Arc::new(ImageDownloadHandler::new(assets, history)),
        )
}

/// Assembled but not yet running engine.
pub struct TaskEngine<Q, S, L> {
    service: Arc<TaskService<S, L>>,
    pool: DispatchPool<Q, S, L>,
    poller: PendingTaskPoller<S, L>,
}

impl<Q, S, L> TaskEngine<Q, S, L>
where
    Q: TaskQueue + Clone + 'static,
    S: ResultStore + Clone + 'static,
    L: QuotaLedger + Clone + 'static,
{
    pub fn new(
        config: &EngineConfig,
        queue: Q,
        store: S,
        ledger: L,
        prices: PriceBook,
        handlers: HandlerRegistry,
    ) -> Self {
        let handlers = Arc::new(handlers);
        let sink: Arc<dyn TaskSink> = Arc::new(QueueSink::new(queue.clone(), store.clone()));
        let settler = Arc::new(
            Settler::new(
                store.clone(),
                QuotaCompensator::new(ledger.clone(), prices),
                config.result_ttl,
            )
            .with_sink(sink.clone()),
        );

        let dispatcher = Arc::new(Dispatcher::new(
            handlers.clone(),
            settler.clone(),
            config.dispatcher(),
        ));
        Self {
            service: Arc::new(TaskService::new(store, ledger, sink)),
            pool: DispatchPool::new(queue, dispatcher, config.dispatch_pool()),
            poller: PendingTaskPoller::new(handlers, settler, config.poller()),
        }
    }

    pub fn service(&self) -> Arc<TaskService<S, L>> {
        self.service.clone()
    }

    /// Start the dispatch workers and the pending-task poller.
    pub fn start(self) -> io::Result<EngineHandle<S, L>> {
        let pool = self.pool.spawn()?;
        let poller = match self.poller.spawn() {
            Ok(poller) => poller,
            Err(e) => {
                pool.shutdown();
                return Err(e);
            }
        };
        info!("task engine started");
        Ok(EngineHandle {
            service: self.service,
            pool,
            poller,
        })
    }
}

/// Running engine.
pub struct EngineHandle<S, L> {
    service: Arc<TaskService<S, L>>,
    pool: DispatchPoolHandle,
    poller: PollerHandle,
}

impl<S: ResultStore, L: QuotaLedger> EngineHandle<S, L> {
    pub fn service(&self) -> &TaskService<S, L> {
        &self.service
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn poller_stats(&self) -> PollerStats {
        self.poller.stats()
    }

    /// Stop taking new work, then wait for in-flight work to finish.
    pub fn shutdown(self) {
        self.pool.shutdown();
        self.poller.shutdown();
        info!("task engine stopped");
    }
}
