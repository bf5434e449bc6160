//! Quota value types and the settlement cost policy.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::id::TaskId;
use crate::payload::TaskType;

/// A user's quota position as reported by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QuotaBalance {
    pub rest: i64,
    pub freezed: i64,
    pub used: i64,
}

impl QuotaBalance {
    /// Quota that can still be reserved by a new submission.
    pub fn available(&self) -> i64 {
        self.rest - self.freezed
    }
}

/// Context attached to a consume call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeMeta {
    pub task_id: TaskId,
    /// The amount frozen at submission; the ledger releases all of it.
    pub frozen: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
}

/// How the realized cost of a successful task is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementPolicy {
    /// Unit price of the model times the number of delivered resources.
    PerUnit,
    /// Whatever was frozen at submission.
    Frozen,
    /// Cost reported by the handler (e.g. token usage). Falls back to the
    /// frozen amount when the handler reports nothing.
    Metered,
}

impl SettlementPolicy {
    pub fn default_for(task_type: TaskType) -> Self {
        match task_type {
            TaskType::ImageCompletion | TaskType::ArtisticText => SettlementPolicy::PerUnit,
            TaskType::GroupChat => SettlementPolicy::Metered,
            TaskType::ImageToVideo
            | TaskType::ImageUpscale
            | TaskType::ImageColorization
            | TaskType::ImageDownload => SettlementPolicy::Frozen,
        }
    }

    pub fn realized_cost(
        &self,
        prices: &PriceBook,
        model: &str,
        frozen: i64,
        delivered: usize,
        metered: Option<i64>,
    ) -> i64 {
        match self {
            SettlementPolicy::PerUnit => prices.unit_price(model) * delivered as i64,
            SettlementPolicy::Frozen => frozen,
            SettlementPolicy::Metered => metered.unwrap_or(frozen),
        }
    }
}

/// Prices in quota units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBook {
    pub default_unit_price: i64,
    #[serde(default)]
    pub model_unit_prices: HashMap<String, i64>,
    pub chat_price_per_1k_tokens: i64,
}

impl Default for PriceBook {
    fn default() -> Self {
        Self {
            default_unit_price: 20,
            model_unit_prices: HashMap::new(),
            chat_price_per_1k_tokens: 1,
        }
    }
}

impl PriceBook {
    pub fn with_model_price(mut self, model: impl Into<String>, price: i64) -> Self {
        self.model_unit_prices.insert(model.into(), price);
        self
    }

    pub fn unit_price(&self, model: &str) -> i64 {
        self.model_unit_prices
            .get(model)
            .copied()
            .unwrap_or(self.default_unit_price)
    }

    /// Token usage priced per started thousand tokens.
    pub fn chat_cost(&self, tokens: usize) -> i64 {
        if tokens == 0 {
            return 0;
        }
        let thousands = tokens.div_ceil(1000) as i64;
        thousands * self.chat_price_per_1k_tokens
    }
}
