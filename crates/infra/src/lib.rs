//! Infrastructure layer: dispatch, polling, settlement, stores and config.

pub mod compensator;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod fault;
pub mod handlers;
pub mod jobs;
pub mod ledger;
pub mod poller;
pub mod service;
pub mod settle;
pub mod sink;
pub mod store;

#[cfg(test)]
mod integration_tests;
#[cfg(test)]
pub(crate) mod testing;

pub use compensator::{QuotaCompensator, Settlement};
pub use config::{ConfigError, EngineConfig};
pub use dispatcher::{DispatchOutcome, Dispatcher, DispatcherConfig};
pub use engine::{EngineHandle, TaskEngine, VendorBindings, standard_handlers};
pub use ledger::{InMemoryQuotaLedger, LedgerError, QuotaLedger};
pub use poller::{PendingTaskPoller, PollDisposition, PollSummary, PollerConfig};
pub use service::TaskService;
pub use settle::{Settled, Settler};
pub use sink::{QueueSink, TaskSink};
