//! Engine configuration loaded from `TASKFORGE_*` environment variables.
//!
//! Every key has a default; a key that is set but unparsable is an error
//! rather than silently falling back.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use taskforge_core::PriceBook;

use crate::dispatcher::DispatcherConfig;
use crate::handlers::group_chat::{DEFAULT_MAX_TOKENS, DEFAULT_MAX_TURNS};
use crate::jobs::{BackoffStrategy, DispatchPoolConfig, PollSchedule};
use crate::poller::PollerConfig;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub dispatch_workers: usize,
    pub submission_window: Duration,
    pub group_chat_window: Duration,
    pub call_timeout: Duration,
    pub poll_interval: Duration,
    pub poll_strategy: BackoffStrategy,
    pub poll_max_interval: Duration,
    pub pending_deadline: Duration,
    pub result_ttl: Duration,
    pub poller_tick: Duration,
    pub poller_batch: usize,
    pub poller_concurrency: usize,
    pub lease_ttl: Duration,
    pub max_deliveries: u32,
    pub persist_assets: bool,
    pub chat_max_turns: usize,
    pub chat_max_tokens: usize,
    pub default_unit_price: i64,
    pub chat_price_per_1k_tokens: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dispatch_workers: 4,
            submission_window: Duration::from_secs(300),
            group_chat_window: Duration::from_secs(900),
            call_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(5),
            poll_strategy: BackoffStrategy::Fixed,
            poll_max_interval: Duration::from_secs(60),
            pending_deadline: Duration::from_secs(1800),
            result_ttl: Duration::from_secs(168 * 3600),
            poller_tick: Duration::from_millis(1000),
            poller_batch: 64,
            poller_concurrency: 8,
            lease_ttl: Duration::from_secs(600),
            max_deliveries: 5,
            persist_assets: true,
            chat_max_turns: DEFAULT_MAX_TURNS,
            chat_max_tokens: DEFAULT_MAX_TOKENS,
            default_unit_price: 20,
            chat_price_per_1k_tokens: 1,
        }
    }
}

struct Reader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Reader<F> {
    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match (self.lookup)(key) {
            None => Ok(default),
            Some(raw) if raw.trim().is_empty() => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn secs(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }

    fn positive<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr + Default + PartialEq,
        T::Err: std::fmt::Display,
    {
        let value = self.parse(key, default)?;
        if value == T::default() {
            return Err(ConfigError::Invalid {
                key,
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(value)
    }
}

impl EngineConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through `lookup`, which maps a key to its raw
    /// value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        let r = Reader { lookup };
        Ok(Self {
            dispatch_workers: r.positive("TASKFORGE_DISPATCH_WORKERS", d.dispatch_workers)?,
            submission_window: r.secs("TASKFORGE_SUBMISSION_WINDOW_SECS", d.submission_window)?,
            group_chat_window: r.secs("TASKFORGE_GROUP_CHAT_WINDOW_SECS", d.group_chat_window)?,
            call_timeout: r.secs("TASKFORGE_CALL_TIMEOUT_SECS", d.call_timeout)?,
            poll_interval: r.secs("TASKFORGE_POLL_INTERVAL_SECS", d.poll_interval)?,
            poll_strategy: r.parse("TASKFORGE_POLL_STRATEGY", d.poll_strategy)?,
            poll_max_interval: r.secs("TASKFORGE_POLL_MAX_INTERVAL_SECS", d.poll_max_interval)?,
            pending_deadline: r.secs("TASKFORGE_PENDING_DEADLINE_SECS", d.pending_deadline)?,
            result_ttl: r
                .parse("TASKFORGE_RESULT_TTL_HOURS", 168u64)
                .map(|h| Duration::from_secs(h.saturating_mul(3600)))?,
            poller_tick: r
                .parse("TASKFORGE_POLLER_TICK_MS", 1000u64)
                .map(Duration::from_millis)?,
            poller_batch: r.positive("TASKFORGE_POLLER_BATCH", d.poller_batch)?,
            poller_concurrency: r.positive("TASKFORGE_POLLER_CONCURRENCY", d.poller_concurrency)?,
            lease_ttl: r.secs("TASKFORGE_LEASE_TTL_SECS", d.lease_ttl)?,
            max_deliveries: r.positive("TASKFORGE_MAX_DELIVERIES", d.max_deliveries)?,
            persist_assets: r.parse("TASKFORGE_PERSIST_ASSETS", d.persist_assets)?,
            chat_max_turns: r.parse("TASKFORGE_CHAT_MAX_TURNS", d.chat_max_turns)?,
            chat_max_tokens: r.positive("TASKFORGE_CHAT_MAX_TOKENS", d.chat_max_tokens)?,
            default_unit_price: r.parse("TASKFORGE_DEFAULT_UNIT_PRICE", d.default_unit_price)?,
            chat_price_per_1k_tokens: r.parse(
                "TASKFORGE_CHAT_PRICE_PER_1K_TOKENS",
                d.chat_price_per_1k_tokens,
            )?,
        })
    }

    pub fn poll_schedule(&self) -> PollSchedule {
        match self.poll_strategy {
            BackoffStrategy::Fixed => PollSchedule::fixed(self.poll_interval),
            BackoffStrategy::Linear => PollSchedule::linear(self.poll_interval, self.poll_max_interval),
            BackoffStrategy::Exponential => {
                PollSchedule::exponential(self.poll_interval, self.poll_max_interval)
            }
        }
    }

    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            submission_window: self.submission_window,
            group_chat_window: self.group_chat_window,
            call_timeout: self.call_timeout,
            pending_deadline: self.pending_deadline,
            poll_schedule: self.poll_schedule(),
        }
    }

    pub fn poller(&self) -> PollerConfig {
        PollerConfig {
            tick: self.poller_tick,
            batch_size: self.poller_batch,
            concurrency: self.poller_concurrency,
            call_timeout: self.call_timeout,
            schedule: self.poll_schedule(),
            ..PollerConfig::default()
        }
    }

    pub fn dispatch_pool(&self) -> DispatchPoolConfig {
        DispatchPoolConfig {
            workers: self.dispatch_workers,
            lease_ttl: self.lease_ttl,
            max_deliveries: self.max_deliveries,
            ..DispatchPoolConfig::default()
        }
    }

    /// Price book with the configured defaults and no per-model overrides.
    pub fn price_book(&self) -> PriceBook {
        PriceBook {
            default_unit_price: self.default_unit_price,
            chat_price_per_1k_tokens: self.chat_price_per_1k_tokens,
            ..PriceBook::default()
        }
    }
}
