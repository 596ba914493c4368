//! In-memory ledger store.
//!
//! Backed by concurrent hash maps. Each conditional write holds the shard
//! lock of the affected row for its whole read-compare-write, which gives
//! the same guarantees as a row-level conditional UPDATE. Guards are taken
//! in a fixed order (request or trade record, then account row) and never
//! held across an await.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use atomicledger_common::{
    AccountId, Currency, ForcedOutcome, Invoice, InvoiceId, Trade, TradeId, TradeOutcome,
    WithdrawId, WithdrawRequest,
};

use crate::balance::{AccountBalance, Balances, DeltaError};
use crate::store::{
    AtomicOutcome, Claim, ClaimResult, LedgerStore, Mutation, StoreError, StoreResult,
};

#[derive(Debug, Clone)]
struct AccountRow {
    balance: AccountBalance,
    forced_outcome: ForcedOutcome,
}

impl AccountRow {
    fn new(account_id: AccountId) -> Self {
        Self {
            balance: AccountBalance::zero(account_id),
            forced_outcome: ForcedOutcome::default(),
        }
    }
}

/// Ledger store kept in process memory.
pub struct InMemoryStore {
    accounts: DashMap<AccountId, AccountRow>,
    trades: DashMap<TradeId, Trade>,
    /// Account → its single active trade.
    active_trades: DashMap<AccountId, TradeId>,
    invoices: DashMap<InvoiceId, Invoice>,
    withdrawals: DashMap<WithdrawId, WithdrawRequest>,
    atomic_path: bool,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Create an empty store with the atomic primitive enabled.
    pub fn new() -> Self {
        Self {
            accounts: DashMap::new(),
            trades: DashMap::new(),
            active_trades: DashMap::new(),
            invoices: DashMap::new(),
            withdrawals: DashMap::new(),
            atomic_path: true,
        }
    }

    /// Report the atomic primitive as unavailable, forcing the optimistic
    /// path.
    pub fn without_atomic_path(mut self) -> Self {
        self.atomic_path = false;
        self
    }

    /// Snapshot of every account row.
    pub fn snapshot(&self) -> Vec<AccountBalance> {
        self.accounts
            .iter()
            .map(|row| row.balance.clone())
            .collect()
    }

    /// Apply the delta to the locked account row.
    fn write_delta(&self, mutation: &Mutation) -> StoreResult<AtomicOutcome> {
        if mutation.create_account {
            self.accounts
                .entry(mutation.account_id.clone())
                .or_insert_with(|| AccountRow::new(mutation.account_id.clone()));
        }
        let mut row = self
            .accounts
            .get_mut(&mutation.account_id)
            .ok_or_else(|| StoreError::AccountNotFound(mutation.account_id.clone()))?;

        let before = row.balance.balances;
        match mutation.delta.apply(&before) {
            Ok(after) => {
                row.balance.balances = after;
                row.balance.updated_at = Utc::now();
                Ok(AtomicOutcome::Applied { before, after })
            }
            Err(DeltaError::Insufficient {
                currency, available, ..
            }) => Ok(AtomicOutcome::Insufficient { currency, available }),
            Err(e @ DeltaError::Overflow(_)) => Err(StoreError::Backend(e.to_string())),
        }
    }

    fn check_account(&self, mutation: &Mutation) -> StoreResult<()> {
        if !mutation.create_account && !self.accounts.contains_key(&mutation.account_id) {
            return Err(StoreError::AccountNotFound(mutation.account_id.clone()));
        }
        Ok(())
    }

    fn release_active(&self, trade: &Trade) {
        self.active_trades
            .remove_if(&trade.account_id, |_, active| *active == trade.id);
    }
}

#[async_trait]
impl LedgerStore for InMemoryStore {
    async fn load_balances(&self, account_id: &AccountId) -> StoreResult<Option<AccountBalance>> {
        Ok(self.accounts.get(account_id).map(|row| row.balance.clone()))
    }

    async fn ensure_account(&self, account_id: &AccountId) -> StoreResult<AccountBalance> {
        let row = self
            .accounts
            .entry(account_id.clone())
            .or_insert_with(|| AccountRow::new(account_id.clone()));
        Ok(row.balance.clone())
    }

    async fn compare_and_set(
        &self,
        account_id: &AccountId,
        fields: &[Currency],
        expected: &Balances,
        next: &Balances,
    ) -> StoreResult<bool> {
        let Some(mut row) = self.accounts.get_mut(account_id) else {
            return Ok(false);
        };
        if !row.balance.balances.matches_on(expected, fields) {
            return Ok(false);
        }
        for currency in fields {
            row.balance.balances.set(*currency, next.get(*currency));
        }
        row.balance.updated_at = Utc::now();
        Ok(true)
    }

    async fn apply_atomic(&self, mutation: &Mutation) -> StoreResult<AtomicOutcome> {
        if !self.atomic_path {
            return Err(StoreError::Unsupported);
        }

        let Some(claim) = &mutation.claim else {
            return self.write_delta(mutation);
        };
        self.check_account(mutation)?;
        let not_found = || StoreError::RecordNotFound(claim.reference());

        match claim {
            Claim::Invoice(id) => {
                let mut invoice = self
                    .invoices
                    .get_mut(id)
                    .ok_or_else(not_found)?;
                if invoice.done {
                    return Ok(AtomicOutcome::AlreadyFinal);
                }
                let outcome = self.write_delta(mutation)?;
                if matches!(outcome, AtomicOutcome::Applied { .. }) {
                    invoice.done = true;
                }
                Ok(outcome)
            }
            Claim::Withdraw(id) => {
                let mut request = self
                    .withdrawals
                    .get_mut(id)
                    .ok_or_else(not_found)?;
                if request.done {
                    return Ok(AtomicOutcome::AlreadyFinal);
                }
                let outcome = self.write_delta(mutation)?;
                if matches!(outcome, AtomicOutcome::Applied { .. }) {
                    request.done = true;
                }
                Ok(outcome)
            }
            Claim::Trade { id, outcome: result } => {
                let closed = {
                    let mut trade = self
                        .trades
                        .get_mut(id)
                        .ok_or_else(not_found)?;
                    if !trade.is_active {
                        return Ok(AtomicOutcome::AlreadyFinal);
                    }
                    let outcome = self.write_delta(mutation)?;
                    if !matches!(outcome, AtomicOutcome::Applied { .. }) {
                        return Ok(outcome);
                    }
                    trade
                        .close(*result)
                        .map_err(|e| StoreError::Backend(e.to_string()))?;
                    (trade.clone(), outcome)
                };
                self.release_active(&closed.0);
                Ok(closed.1)
            }
        }
    }

    async fn forced_outcome(&self, account_id: &AccountId) -> StoreResult<ForcedOutcome> {
        self.accounts
            .get(account_id)
            .map(|row| row.forced_outcome)
            .ok_or_else(|| StoreError::AccountNotFound(account_id.clone()))
    }

    async fn set_forced_outcome(
        &self,
        account_id: &AccountId,
        outcome: ForcedOutcome,
    ) -> StoreResult<()> {
        self.accounts
            .entry(account_id.clone())
            .or_insert_with(|| AccountRow::new(account_id.clone()))
            .forced_outcome = outcome;
        Ok(())
    }

    async fn claim(&self, claim: &Claim) -> StoreResult<ClaimResult> {
        let not_found = || StoreError::RecordNotFound(claim.reference());
        match claim {
            Claim::Invoice(id) => {
                let mut invoice = self.invoices.get_mut(id).ok_or_else(not_found)?;
                if invoice.done {
                    return Ok(ClaimResult::AlreadyFinal);
                }
                invoice.done = true;
                Ok(ClaimResult::Claimed)
            }
            Claim::Withdraw(id) => {
                let mut request = self.withdrawals.get_mut(id).ok_or_else(not_found)?;
                if request.done {
                    return Ok(ClaimResult::AlreadyFinal);
                }
                request.done = true;
                Ok(ClaimResult::Claimed)
            }
            Claim::Trade { id, outcome } => {
                let closed = {
                    let mut trade = self.trades.get_mut(id).ok_or_else(not_found)?;
                    if !trade.is_active {
                        return Ok(ClaimResult::AlreadyFinal);
                    }
                    trade
                        .close(*outcome)
                        .map_err(|e| StoreError::Backend(e.to_string()))?;
                    trade.clone()
                };
                self.release_active(&closed);
                Ok(ClaimResult::Claimed)
            }
        }
    }

    async fn release(&self, claim: &Claim) -> StoreResult<()> {
        match claim {
            Claim::Invoice(id) => {
                if let Some(mut invoice) = self.invoices.get_mut(id) {
                    invoice.done = false;
                }
            }
            Claim::Withdraw(id) => {
                if let Some(mut request) = self.withdrawals.get_mut(id) {
                    request.done = false;
                }
            }
            // Closed trades stay closed
            Claim::Trade { .. } => {}
        }
        Ok(())
    }

    async fn insert_trade(&self, trade: &Trade) -> StoreResult<()> {
        match self.active_trades.entry(trade.account_id.clone()) {
            Entry::Occupied(_) => Err(StoreError::ActiveTradeExists(trade.account_id.clone())),
            Entry::Vacant(slot) => {
                if self.trades.contains_key(&trade.id) {
                    return Err(StoreError::Duplicate(format!("trade {}", trade.id)));
                }
                self.trades.insert(trade.id, trade.clone());
                slot.insert(trade.id);
                Ok(())
            }
        }
    }

    async fn get_trade(&self, id: &TradeId) -> StoreResult<Option<Trade>> {
        Ok(self.trades.get(id).map(|t| t.clone()))
    }

    async fn active_trade(&self, account_id: &AccountId) -> StoreResult<Option<Trade>> {
        let Some(id) = self.active_trades.get(account_id).map(|id| *id) else {
            return Ok(None);
        };
        Ok(self
            .trades
            .get(&id)
            .filter(|t| t.is_active)
            .map(|t| t.clone()))
    }

    async fn due_trades(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Trade>> {
        let mut due: Vec<Trade> = self
            .trades
            .iter()
            .filter(|t| t.is_due(now))
            .map(|t| t.clone())
            .collect();
        due.sort_by_key(|t| t.settle_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn force_close_trade(&self, id: &TradeId, outcome: TradeOutcome) -> StoreResult<bool> {
        let closed = {
            let Some(mut trade) = self.trades.get_mut(id) else {
                return Err(StoreError::RecordNotFound(atomicledger_common::Reference::Trade(*id)));
            };
            if !trade.is_active {
                return Ok(false);
            }
            trade
                .close(outcome)
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            trade.degraded = true;
            trade.clone()
        };
        self.release_active(&closed);
        Ok(true)
    }

    async fn mark_trade_degraded(&self, id: &TradeId) -> StoreResult<()> {
        if let Some(mut trade) = self.trades.get_mut(id) {
            trade.degraded = true;
        }
        Ok(())
    }

    async fn insert_invoice(&self, invoice: &Invoice) -> StoreResult<()> {
        match self.invoices.entry(invoice.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(format!("invoice {}", invoice.id))),
            Entry::Vacant(slot) => {
                slot.insert(invoice.clone());
                Ok(())
            }
        }
    }

    async fn get_invoice(&self, id: &InvoiceId) -> StoreResult<Option<Invoice>> {
        Ok(self.invoices.get(id).map(|i| i.clone()))
    }

    async fn insert_withdraw(&self, request: &WithdrawRequest) -> StoreResult<()> {
        match self.withdrawals.entry(request.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(format!("withdraw {}", request.id))),
            Entry::Vacant(slot) => {
                slot.insert(request.clone());
                Ok(())
            }
        }
    }

    async fn get_withdraw(&self, id: &WithdrawId) -> StoreResult<Option<WithdrawRequest>> {
        Ok(self.withdrawals.get(id).map(|w| w.clone()))
    }
}
