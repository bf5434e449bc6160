//! Quota ledger boundary and an in-memory implementation.
//!
//! The ledger owns the per-user balance: `rest` (spendable), `freezed`
//! (reserved by in-flight tasks) and `used` (lifetime consumption). The engine
//! only ever issues three calls per task: one `freeze` at submission and then
//! exactly one of `consume` or `unfreeze`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use taskforge_core::{ConsumeMeta, QuotaBalance, TaskError, TaskId, UserId};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("quota not enough: required {required}, available {available}")]
    InsufficientQuota { required: i64, available: i64 },
    #[error("invalid amount: {0}")]
    InvalidAmount(i64),
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

impl From<LedgerError> for TaskError {
    fn from(value: LedgerError) -> Self {
        match value {
            LedgerError::InsufficientQuota {
                required,
                available,
            } => TaskError::QuotaNotEnough {
                required,
                available,
            },
            other => TaskError::storage(other.to_string()),
        }
    }
}

pub trait QuotaLedger: Send + Sync {
    fn balance(&self, uid: UserId) -> Result<QuotaBalance, LedgerError>;

    /// Reserve `amount` for `task_id`.
    fn freeze(&self, uid: UserId, amount: i64, task_id: &TaskId) -> Result<(), LedgerError>;

    /// Charge `amount` and release the `meta.frozen` reservation.
    fn consume(&self, uid: UserId, amount: i64, meta: &ConsumeMeta) -> Result<(), LedgerError>;

    /// Release a reservation without charging.
    fn unfreeze(&self, uid: UserId, amount: i64, task_id: &TaskId) -> Result<(), LedgerError>;
}

impl<T: QuotaLedger + ?Sized> QuotaLedger for Arc<T> {
    fn balance(&self, uid: UserId) -> Result<QuotaBalance, LedgerError> {
        (**self).balance(uid)
    }

    fn freeze(&self, uid: UserId, amount: i64, task_id: &TaskId) -> Result<(), LedgerError> {
        (**self).freeze(uid, amount, task_id)
    }

    fn consume(&self, uid: UserId, amount: i64, meta: &ConsumeMeta) -> Result<(), LedgerError> {
        (**self).consume(uid, amount, meta)
    }

    fn unfreeze(&self, uid: UserId, amount: i64, task_id: &TaskId) -> Result<(), LedgerError> {
        (**self).unfreeze(uid, amount, task_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryKind {
    Freeze,
    Consume,
    Unfreeze,
}

/// Journal line recorded by [`InMemoryQuotaLedger`] for every call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub uid: UserId,
    pub task_id: TaskId,
    pub kind: LedgerEntryKind,
    pub amount: i64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct LedgerState {
    accounts: HashMap<UserId, QuotaBalance>,
    journal: Vec<LedgerEntry>,
}

/// In-memory ledger for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryQuotaLedger {
    state: Mutex<LedgerState>,
}

fn poisoned<T>(_: PoisonError<T>) -> LedgerError {
    LedgerError::Unavailable("lock poisoned".to_string())
}

impl InMemoryQuotaLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Add spendable quota to a user.
    pub fn deposit(&self, uid: UserId, amount: i64) -> Result<(), LedgerError> {
        if amount < 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let mut state = self.state.lock().map_err(poisoned)?;
        state.accounts.entry(uid).or_default().rest += amount;
        Ok(())
    }

    pub fn journal(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        Ok(self.state.lock().map_err(poisoned)?.journal.clone())
    }

    pub fn entries_for(&self, task_id: &TaskId) -> Result<Vec<LedgerEntry>, LedgerError> {
        let state = self.state.lock().map_err(poisoned)?;
        Ok(state
            .journal
            .iter()
            .filter(|e| &e.task_id == task_id)
            .cloned()
            .collect())
    }
}

impl QuotaLedger for InMemoryQuotaLedger {
    fn balance(&self, uid: UserId) -> Result<QuotaBalance, LedgerError> {
        let state = self.state.lock().map_err(poisoned)?;
        Ok(state.accounts.get(&uid).copied().unwrap_or_default())
    }

    fn freeze(&self, uid: UserId, amount: i64, task_id: &TaskId) -> Result<(), LedgerError> {
        if amount < 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let mut guard = self.state.lock().map_err(poisoned)?;
        let state = &mut *guard;
        let account = state.accounts.entry(uid).or_default();
        if account.available() < amount {
            return Err(LedgerError::InsufficientQuota {
                required: amount,
                available: account.available(),
            });
        }
        account.freezed += amount;
        state.journal.push(LedgerEntry {
            uid,
            task_id: task_id.clone(),
            kind: LedgerEntryKind::Freeze,
            amount,
            at: Utc::now(),
        });
        Ok(())
    }

    fn consume(&self, uid: UserId, amount: i64, meta: &ConsumeMeta) -> Result<(), LedgerError> {
        if amount < 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let mut guard = self.state.lock().map_err(poisoned)?;
        let state = &mut *guard;
        let account = state.accounts.entry(uid).or_default();
        account.freezed = (account.freezed - meta.frozen).max(0);
        account.rest -= amount;
        account.used += amount;
        state.journal.push(LedgerEntry {
            uid,
            task_id: meta.task_id.clone(),
            kind: LedgerEntryKind::Consume,
            amount,
            at: Utc::now(),
        });
        Ok(())
    }

    fn unfreeze(&self, uid: UserId, amount: i64, task_id: &TaskId) -> Result<(), LedgerError> {
        if amount < 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let mut guard = self.state.lock().map_err(poisoned)?;
        let state = &mut *guard;
        let account = state.accounts.entry(uid).or_default();
        account.freezed = (account.freezed - amount).max(0);
        state.journal.push(LedgerEntry {
            uid,
            task_id: task_id.clone(),
            kind: LedgerEntryKind::Unfreeze,
            amount,
            at: Utc::now(),
        });
        Ok(())
    }
}
