//! Result store: queue rows, pending tasks and the history mirror.
//!
//! The engine never talks to a database directly. Everything it persists
//! goes through the traits in this module; [`InMemoryResultStore`] backs
//! tests and local runs.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryResultStore;
pub use r#trait::{HistoryStore, PendingTaskStore, QueueTaskStore, ResultStore, StoreError};
