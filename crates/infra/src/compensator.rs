//! Quota compensation: the ledger side of settling a task.
//!
//! A freeze is taken at submission. When the task reaches its single terminal
//! outcome the compensator issues exactly one counter-entry:
//!
//! ```text
//! Success ──▶ consume(realized cost, releases the frozen amount)
//! Failed  ──▶ unfreeze(frozen amount)
//! ```
//!
//! Exclusivity is enforced by the callers, which only settle after winning the
//! conditional terminal write on the queue row.

use std::collections::HashMap;

use tracing::{debug, error};

use taskforge_core::{ConsumeMeta, PriceBook, SettlementPolicy, TaskPayload, TaskType};

use crate::handlers::Completion;
use crate::ledger::QuotaLedger;

/// What the ledger was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Consumed { amount: i64 },
    Released { amount: i64 },
    /// Nothing was frozen and nothing is owed.
    Nothing,
    /// The ledger call failed; the error has been logged.
    LedgerFailed(String),
}

pub struct QuotaCompensator<L> {
    ledger: L,
    prices: PriceBook,
    policies: HashMap<TaskType, SettlementPolicy>,
}

impl<L: QuotaLedger> QuotaCompensator<L> {
    pub fn new(ledger: L, prices: PriceBook) -> Self {
        Self {
            ledger,
            prices,
            policies: HashMap::new(),
        }
    }

    /// Override the settlement policy of one task type.
    pub fn with_policy(mut self, task_type: TaskType, policy: SettlementPolicy) -> Self {
        self.policies.insert(task_type, policy);
        self
    }

    pub fn policy(&self, task_type: TaskType) -> SettlementPolicy {
        self.policies
            .get(&task_type)
            .copied()
            .unwrap_or_else(|| SettlementPolicy::default_for(task_type))
    }

    pub fn prices(&self) -> &PriceBook {
        &self.prices
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn realized_cost(&self, payload: &TaskPayload, completion: &Completion) -> i64 {
        self.policy(payload.task_type()).realized_cost(
            &self.prices,
            payload.model(),
            payload.frozen_quota(),
            completion.resources.len(),
            completion.metered_cost,
        )
    }

    /// Charge `amount` for a successful task and drop its freeze.
    pub fn consume(&self, payload: &TaskPayload, completion: &Completion, amount: i64) -> Settlement {
        let frozen = payload.frozen_quota();
        if amount == 0 && frozen == 0 {
            return Settlement::Nothing;
        }
        let Some(task_id) = payload.id().cloned() else {
            return Settlement::LedgerFailed("payload has no task id".to_string());
        };

        let models = if payload.model().is_empty() {
            Vec::new()
        } else {
            vec![payload.model().to_string()]
        };
        let meta = ConsumeMeta {
            task_id,
            frozen,
            vendor: completion.vendor.clone(),
            models,
        };

        match self.ledger.consume(payload.uid(), amount, &meta) {
            Ok(()) => {
                debug!(task_id = %meta.task_id, user_id = %payload.uid(), amount, frozen, "quota consumed");
                Settlement::Consumed { amount }
            }
            Err(e) => {
                error!(task_id = %meta.task_id, user_id = %payload.uid(), amount, error = %e, "quota consume failed");
                Settlement::LedgerFailed(e.to_string())
            }
        }
    }

    /// Release the full freeze of a failed task.
    pub fn release(&self, payload: &TaskPayload) -> Settlement {
        let frozen = payload.frozen_quota();
        if frozen <= 0 {
            return Settlement::Nothing;
        }
        let Some(task_id) = payload.id() else {
            return Settlement::LedgerFailed("payload has no task id".to_string());
        };

        match self.ledger.unfreeze(payload.uid(), frozen, task_id) {
            Ok(()) => {
                debug!(task_id = %task_id, user_id = %payload.uid(), amount = frozen, "quota released");
                Settlement::Released { amount: frozen }
            }
            Err(e) => {
                error!(task_id = %task_id, user_id = %payload.uid(), amount = frozen, error = %e, "quota release failed");
                Settlement::LedgerFailed(e.to_string())
            }
        }
    }
}
