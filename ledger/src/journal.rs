//! Append-only transaction journal.
//!
//! Every terminal mutation outcome is recorded for audit. Entries are never
//! read back to drive ledger logic, and a failing sink never changes the
//! result of the mutation it describes.

use async_trait::async_trait;
use atomicledger_common::{AccountId, Money, Reference};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::balance::Balances;
use crate::store::StoreResult;

/// Kind of balance mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Deposit,
    Withdraw,
    Exchange,
    InvoiceSettlement,
    TradeStake,
    TradeSettlement,
    StakeRefund,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Deposit => "deposit",
            OperationKind::Withdraw => "withdraw",
            OperationKind::Exchange => "exchange",
            OperationKind::InvoiceSettlement => "invoice_settlement",
            OperationKind::TradeStake => "trade_stake",
            OperationKind::TradeSettlement => "trade_settlement",
            OperationKind::StakeRefund => "stake_refund",
        }
    }
}

/// Outcome recorded for a mutation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Applied,
    AlreadySettled,
    Rejected,
    Conflict,
    Failed,
    Degraded,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Applied => "applied",
            EntryStatus::AlreadySettled => "already_settled",
            EntryStatus::Rejected => "rejected",
            EntryStatus::Conflict => "conflict",
            EntryStatus::Failed => "failed",
            EntryStatus::Degraded => "degraded",
        }
    }
}

/// Immutable record of one mutation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: Uuid,
    pub kind: OperationKind,
    pub account_id: AccountId,
    pub amount: Money,
    pub balance_before: Option<Balances>,
    pub balance_after: Option<Balances>,
    pub reference: Option<Reference>,
    pub status: EntryStatus,
    /// `atomic` or `optimistic`; absent when rejected before any path ran.
    pub path: Option<String>,
    pub attempts: u32,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl JournalEntry {
    pub fn new(
        kind: OperationKind,
        account_id: AccountId,
        amount: Money,
        reference: Option<Reference>,
        status: EntryStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            account_id,
            amount,
            balance_before: None,
            balance_after: None,
            reference,
            status,
            path: None,
            attempts: 0,
            details: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_balances(mut self, before: Balances, after: Balances) -> Self {
        self.balance_before = Some(before);
        self.balance_after = Some(after);
        self
    }

    pub fn with_path(mut self, path: &str, attempts: u32) -> Self {
        self.path = Some(path.to_string());
        self.attempts = attempts;
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Net change this entry applied to a balance snapshot.
    pub fn applied_change(&self) -> Option<(i64, i64)> {
        match (self.status, self.balance_before, self.balance_after) {
            (EntryStatus::Applied, Some(before), Some(after)) => {
                Some((after.rub - before.rub, after.usdt - before.usdt))
            }
            _ => None,
        }
    }
}

/// Destination for journal entries.
#[async_trait]
pub trait JournalSink: Send + Sync {
    async fn append(&self, entry: &JournalEntry) -> StoreResult<()>;
}

/// Journal kept in process memory, for tests and the simulator.
#[derive(Default)]
pub struct MemoryJournal {
    entries: Mutex<Vec<JournalEntry>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all entries in append order.
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Entries for one account.
    pub fn for_account(&self, account_id: &AccountId) -> Vec<JournalEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| &e.account_id == account_id)
            .cloned()
            .collect()
    }

    /// Sum of applied changes for one account, as (rub, usdt).
    pub fn net_applied(&self, account_id: &AccountId) -> (i64, i64) {
        self.for_account(account_id)
            .iter()
            .filter_map(JournalEntry::applied_change)
            .fold((0, 0), |(rub, usdt), (r, u)| (rub + r, usdt + u))
    }
}

#[async_trait]
impl JournalSink for MemoryJournal {
    async fn append(&self, entry: &JournalEntry) -> StoreResult<()> {
        self.entries.lock().push(entry.clone());
        Ok(())
    }
}

/// Journal that writes entries to the tracing pipeline.
pub struct TracingJournal;

#[async_trait]
impl JournalSink for TracingJournal {
    async fn append(&self, entry: &JournalEntry) -> StoreResult<()> {
        info!(
            target: "ledger_journal",
            entry_id = %entry.id,
            operation = entry.kind.as_str(),
            account = %entry.account_id,
            amount = %entry.amount,
            status = entry.status.as_str(),
            reference = ?entry.reference.as_ref().map(|r| r.to_string()),
            before = ?entry.balance_before,
            after = ?entry.balance_after,
            attempts = entry.attempts,
            "Ledger transaction"
        );
        Ok(())
    }
}
