//! Task queue and dispatch workers.
//!
//! ## Design
//!
//! - Tasks are typed envelopes carrying an encoded payload
//! - Delivery is at-least-once through expiring leases
//! - Undecodable payloads go to a dead-letter list for inspection
//! - Poll scheduling for accepted vendor jobs lives here too
//!
//! ## Components
//!
//! - `QueuedTask`: queue envelope with lease and delivery count
//! - `TaskQueue`: queue abstraction (in-memory implementation provided)
//! - `DispatchPool`: worker threads feeding the dispatcher
//! - `PollSchedule`: delay between pending-task polls

pub mod executor;
pub mod store;
pub mod types;

pub use executor::{Delivery, DispatchPool, DispatchPoolConfig, DispatchPoolHandle, PoolStats};
pub use store::{InMemoryTaskQueue, QueueError, QueueStats, TaskQueue};
pub use types::{BackoffStrategy, DeadLetterEntry, Lease, PollSchedule, QueuedTask};
