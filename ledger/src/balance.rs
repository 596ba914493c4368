//! Account balance tracking.

use atomicledger_common::{AccountId, Currency, Money};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Balance fields of one account, in minor units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Balances {
    /// Fiat balance (kopecks).
    pub rub: i64,
    /// Stable-token balance (micro-USDT).
    pub usdt: i64,
}

impl Balances {
    pub fn new(rub: i64, usdt: i64) -> Self {
        Self { rub, usdt }
    }

    /// Raw units of one field.
    pub fn get(&self, currency: Currency) -> i64 {
        match currency {
            Currency::Rub => self.rub,
            Currency::Usdt => self.usdt,
        }
    }

    /// Overwrite one field.
    pub fn set(&mut self, currency: Currency, units: i64) {
        match currency {
            Currency::Rub => self.rub = units,
            Currency::Usdt => self.usdt = units,
        }
    }

    /// One field as money.
    pub fn money(&self, currency: Currency) -> Money {
        Money::from_units(self.get(currency), currency)
    }

    /// Check if every listed field matches `other`.
    pub fn matches_on(&self, other: &Balances, fields: &[Currency]) -> bool {
        fields.iter().all(|c| self.get(*c) == other.get(*c))
    }
}

/// Account balance row at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalance {
    /// Account identifier.
    pub account_id: AccountId,
    /// Balance fields.
    pub balances: Balances,
    /// When this row was last written.
    pub updated_at: DateTime<Utc>,
}

impl AccountBalance {
    /// Create a new zero balance.
    pub fn zero(account_id: AccountId) -> Self {
        Self {
            account_id,
            balances: Balances::default(),
            updated_at: Utc::now(),
        }
    }
}

/// Why a delta cannot be applied to a balance snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeltaError {
    #[error("insufficient {currency}: required {required}, available {available}")]
    Insufficient {
        currency: Currency,
        required: i64,
        available: i64,
    },

    #[error("{0} balance overflow")]
    Overflow(Currency),
}

/// One signed change to a balance field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub currency: Currency,
    pub units: i64,
    /// The field must not go negative.
    pub guarded: bool,
}

/// A pure balance transformation, evaluated against the value read at
/// mutation time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BalanceDelta {
    changes: Vec<FieldChange>,
}

impl BalanceDelta {
    /// Increase a field.
    pub fn credit(amount: Money) -> Self {
        Self::default().with_credit(amount)
    }

    /// Decrease a field, refusing to go below zero.
    pub fn debit(amount: Money) -> Self {
        Self::default().with_debit(amount)
    }

    /// Move `from` out of one field and `to` into another, as one unit.
    pub fn exchange(from: Money, to: Money) -> Self {
        Self::default().with_debit(from).with_credit(to)
    }

    pub fn with_credit(mut self, amount: Money) -> Self {
        self.changes.push(FieldChange {
            currency: amount.currency,
            units: amount.units,
            guarded: false,
        });
        self
    }

    pub fn with_debit(mut self, amount: Money) -> Self {
        self.changes.push(FieldChange {
            currency: amount.currency,
            units: -amount.units,
            guarded: true,
        });
        self
    }

    pub fn changes(&self) -> &[FieldChange] {
        &self.changes
    }

    pub fn is_empty(&self) -> bool {
        self.changes.iter().all(|c| c.units == 0)
    }

    /// Fields this delta writes, deduplicated in column order.
    pub fn touched(&self) -> Vec<Currency> {
        Currency::ALL
            .into_iter()
            .filter(|c| self.changes.iter().any(|change| change.currency == *c))
            .collect()
    }

    /// Net change of one field.
    pub fn net(&self, currency: Currency) -> i64 {
        self.changes
            .iter()
            .filter(|c| c.currency == currency)
            .map(|c| c.units)
            .sum()
    }

    /// Check if a field must stay non-negative.
    pub fn is_guarded(&self, currency: Currency) -> bool {
        self.changes
            .iter()
            .any(|c| c.currency == currency && c.guarded)
    }

    /// Compute the new balances, or fail without side effects.
    pub fn apply(&self, current: &Balances) -> Result<Balances, DeltaError> {
        let mut next = *current;
        for currency in self.touched() {
            let available = current.get(currency);
            let net = self.net(currency);
            let updated = available
                .checked_add(net)
                .ok_or(DeltaError::Overflow(currency))?;
            if self.is_guarded(currency) && updated < 0 {
                return Err(DeltaError::Insufficient {
                    currency,
                    required: -net,
                    available,
                });
            }
            next.set(currency, updated);
        }
        Ok(next)
    }
}
