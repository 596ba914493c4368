//! Pending balance-change requests awaiting confirmation.

use crate::{AccountId, InvoiceId, Money, WithdrawId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Deposit intent created when a payment is expected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: InvoiceId,
    pub account_id: AccountId,
    pub amount: Money,
    /// Flips false→true exactly once, when the deposit is applied.
    pub done: bool,
    pub created_at: DateTime<Utc>,
}

impl Invoice {
    pub fn new(id: InvoiceId, account_id: AccountId, amount: Money) -> Self {
        Self {
            id,
            account_id,
            amount,
            done: false,
            created_at: Utc::now(),
        }
    }
}

/// Withdrawal intent awaiting payout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawRequest {
    pub id: WithdrawId,
    pub account_id: AccountId,
    pub amount: Money,
    /// Flips false→true exactly once, when the debit is applied.
    pub done: bool,
    pub created_at: DateTime<Utc>,
}

impl WithdrawRequest {
    pub fn new(id: WithdrawId, account_id: AccountId, amount: Money) -> Self {
        Self {
            id,
            account_id,
            amount,
            done: false,
            created_at: Utc::now(),
        }
    }
}
