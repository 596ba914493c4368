//! Ledger operations.
//!
//! Each operation validates its inputs, turns them into a [`Mutation`] and
//! hands it to the [`MutationEngine`]. Operations add no retries of their
//! own.

use std::sync::Arc;

use tracing::{info, instrument};

use atomicledger_common::{
    AccountId, Currency, ExchangeRate, Invoice, InvoiceId, LedgerError, Money, Reference, Result,
    Trade, TradeOutcome, WithdrawId, WithdrawRequest,
};

use crate::balance::{BalanceDelta, Balances};
use crate::engine::{MutationEngine, MutationOutcome, MutationPath};
use crate::journal::OperationKind;
use crate::store::{Claim, LedgerStore, Mutation, StoreError};

/// Result of a ledger operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerReceipt {
    pub account_id: AccountId,
    /// Balances after the operation.
    pub balances: Balances,
    /// Primary amount of the operation.
    pub amount: Money,
    /// Destination amount of an exchange.
    pub converted: Option<Money>,
    /// The correlated record was already final; nothing was applied.
    pub already_settled: bool,
    /// Protocol that applied the change, if any.
    pub path: Option<MutationPath>,
}

/// Deposit, withdraw, exchange and settlement operations.
pub struct LedgerOperations {
    store: Arc<dyn LedgerStore>,
    engine: Arc<MutationEngine>,
}

impl LedgerOperations {
    /// Create a new operations facade.
    pub fn new(store: Arc<dyn LedgerStore>, engine: Arc<MutationEngine>) -> Self {
        Self { store, engine }
    }

    pub fn engine(&self) -> &Arc<MutationEngine> {
        &self.engine
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Credit an account, creating it on first deposit. With an invoice the
    /// credit happens at most once.
    #[instrument(skip(self), fields(account = %account_id, amount = %amount))]
    pub async fn deposit(
        &self,
        account_id: &AccountId,
        amount: Money,
        invoice_id: Option<InvoiceId>,
    ) -> Result<LedgerReceipt> {
        require_account(account_id)?;
        require_positive("amount", &amount)?;

        let mut mutation = Mutation::new(
            account_id.clone(),
            OperationKind::Deposit,
            amount,
            BalanceDelta::credit(amount),
        )
        .creating_account();

        if let Some(id) = invoice_id {
            let invoice = self
                .store
                .get_invoice(&id)
                .await?
                .ok_or_else(|| LedgerError::RecordNotFound(Reference::Invoice(id.clone())))?;
            require_match("invoice_id", &invoice.account_id, &invoice.amount, account_id, &amount)?;
            mutation = mutation.with_claim(Claim::Invoice(id));
        }

        self.run(mutation).await
    }

    /// Debit an account. With a withdrawal request the debit happens at
    /// most once.
    #[instrument(skip(self), fields(account = %account_id, amount = %amount))]
    pub async fn withdraw(
        &self,
        account_id: &AccountId,
        amount: Money,
        withdraw_id: Option<WithdrawId>,
    ) -> Result<LedgerReceipt> {
        require_account(account_id)?;
        require_positive("amount", &amount)?;

        let mut mutation = Mutation::new(
            account_id.clone(),
            OperationKind::Withdraw,
            amount,
            BalanceDelta::debit(amount),
        );

        if let Some(id) = withdraw_id {
            let request = self
                .store
                .get_withdraw(&id)
                .await?
                .ok_or_else(|| LedgerError::RecordNotFound(Reference::Withdraw(id.clone())))?;
            require_match("withdraw_id", &request.account_id, &request.amount, account_id, &amount)?;
            mutation = mutation.with_claim(Claim::Withdraw(id));
        }

        self.run(mutation).await
    }

    /// Move `amount` out of one balance field and `amount × rate` into
    /// another, both or neither.
    #[instrument(skip(self), fields(account = %account_id, amount = %amount, to = %to, rate = %rate))]
    pub async fn exchange(
        &self,
        account_id: &AccountId,
        amount: Money,
        to: Currency,
        rate: ExchangeRate,
    ) -> Result<LedgerReceipt> {
        require_account(account_id)?;
        require_positive("amount", &amount)?;
        if amount.currency == to {
            return Err(LedgerError::invalid(
                "to_currency",
                "source and destination currency must differ",
            ));
        }

        let converted = rate
            .convert(&amount, to)
            .map_err(|e| LedgerError::invalid_amount("rate", e))?;
        if !converted.is_positive() {
            return Err(LedgerError::invalid(
                "amount",
                format!("{} at rate {} converts to nothing", amount, rate),
            ));
        }

        let mutation = Mutation::new(
            account_id.clone(),
            OperationKind::Exchange,
            amount,
            BalanceDelta::exchange(amount, converted),
        );
        let mut receipt = self.run(mutation).await?;
        receipt.converted = Some(converted);
        Ok(receipt)
    }

    /// Record a pending invoice. An existing invoice with the same id is
    /// returned as is when it matches.
    #[instrument(skip(self), fields(account = %account_id, amount = %amount))]
    pub async fn register_invoice(
        &self,
        account_id: &AccountId,
        amount: Money,
        invoice_id: Option<InvoiceId>,
    ) -> Result<Invoice> {
        require_account(account_id)?;
        require_positive("amount", &amount)?;

        let invoice = Invoice::new(
            invoice_id.unwrap_or_else(InvoiceId::generate),
            account_id.clone(),
            amount,
        );
        match self.store.insert_invoice(&invoice).await {
            Ok(()) => {
                info!(invoice_id = %invoice.id, "Invoice registered");
                Ok(invoice)
            }
            Err(StoreError::Duplicate(_)) => {
                let existing = self
                    .store
                    .get_invoice(&invoice.id)
                    .await?
                    .ok_or_else(|| LedgerError::InternalError(format!("invoice {} vanished", invoice.id)))?;
                require_match("invoice_id", &existing.account_id, &existing.amount, account_id, &amount)?;
                Ok(existing)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Record a pending withdrawal request.
    pub async fn register_withdraw(
        &self,
        account_id: &AccountId,
        amount: Money,
        withdraw_id: WithdrawId,
    ) -> Result<WithdrawRequest> {
        require_account(account_id)?;
        require_positive("amount", &amount)?;

        let request = WithdrawRequest::new(withdraw_id, account_id.clone(), amount);
        self.store.insert_withdraw(&request).await?;
        Ok(request)
    }

    /// Apply a pending invoice's deposit exactly once.
    #[instrument(skip(self), fields(invoice = %invoice_id))]
    pub async fn settle_invoice(&self, invoice_id: &InvoiceId) -> Result<LedgerReceipt> {
        let invoice = self
            .store
            .get_invoice(invoice_id)
            .await?
            .ok_or_else(|| LedgerError::RecordNotFound(Reference::Invoice(invoice_id.clone())))?;

        let mutation = Mutation::new(
            invoice.account_id.clone(),
            OperationKind::InvoiceSettlement,
            invoice.amount,
            BalanceDelta::credit(invoice.amount),
        )
        .creating_account()
        .with_claim(Claim::Invoice(invoice.id));

        self.run(mutation).await
    }

    /// Take a trade stake out of the account.
    pub async fn debit_stake(&self, account_id: &AccountId, stake: Money) -> Result<LedgerReceipt> {
        require_positive("amount", &stake)?;
        let mutation = Mutation::new(
            account_id.clone(),
            OperationKind::TradeStake,
            stake,
            BalanceDelta::debit(stake),
        );
        self.run(mutation).await
    }

    /// Return a stake whose trade could not be recorded.
    pub async fn refund_stake(&self, account_id: &AccountId, stake: Money) -> Result<LedgerReceipt> {
        let mutation = Mutation::new(
            account_id.clone(),
            OperationKind::StakeRefund,
            stake,
            BalanceDelta::credit(stake),
        );
        self.run(mutation).await
    }

    /// Credit a trade payout and close the trade, exactly once.
    pub async fn settle_trade_balance(
        &self,
        trade: &Trade,
        outcome: TradeOutcome,
        credit: Money,
    ) -> Result<LedgerReceipt> {
        let mutation = Mutation::new(
            trade.account_id.clone(),
            OperationKind::TradeSettlement,
            credit,
            BalanceDelta::credit(credit),
        )
        .with_claim(Claim::Trade {
            id: trade.id,
            outcome,
        });
        self.run(mutation).await
    }

    /// Current balances of an account.
    pub async fn balances(&self, account_id: &AccountId) -> Result<Balances> {
        self.store
            .load_balances(account_id)
            .await?
            .map(|row| row.balances)
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.clone()))
    }

    async fn run(&self, mutation: Mutation) -> Result<LedgerReceipt> {
        let account_id = mutation.account_id.clone();
        let amount = mutation.amount;

        match self.engine.apply(mutation).await? {
            MutationOutcome::Applied(applied) => Ok(LedgerReceipt {
                account_id,
                balances: applied.after,
                amount,
                converted: None,
                already_settled: false,
                path: Some(applied.path),
            }),
            MutationOutcome::AlreadySettled => {
                let balances = self
                    .store
                    .load_balances(&account_id)
                    .await?
                    .map(|row| row.balances)
                    .unwrap_or_default();
                Ok(LedgerReceipt {
                    account_id,
                    balances,
                    amount,
                    converted: None,
                    already_settled: true,
                    path: None,
                })
            }
        }
    }
}

fn require_account(account_id: &AccountId) -> Result<()> {
    if !account_id.is_valid() {
        return Err(LedgerError::invalid("account_id", "malformed account id"));
    }
    Ok(())
}

fn require_positive(field: &str, amount: &Money) -> Result<()> {
    if !amount.is_positive() {
        return Err(LedgerError::invalid(field, "amount must be positive"));
    }
    Ok(())
}

/// A pending request must be settled for its own account and amount.
fn require_match(
    field: &str,
    owner: &AccountId,
    expected: &Money,
    account_id: &AccountId,
    amount: &Money,
) -> Result<()> {
    if owner != account_id {
        return Err(LedgerError::invalid(field, "request belongs to another account"));
    }
    if expected != amount {
        return Err(LedgerError::invalid(
            field,
            format!("request is for {}, got {}", expected, amount),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::journal::{EntryStatus, MemoryJournal};
    use crate::memory::InMemoryStore;
    use atomicledger_common::ForcedOutcome;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn rub(units: i64) -> Money {
        Money::from_units(units, Currency::Rub)
    }

    fn usdt(units: i64) -> Money {
        Money::from_units(units, Currency::Usdt)
    }

    fn create_test_ops(store: InMemoryStore) -> (LedgerOperations, Arc<InMemoryStore>, Arc<MemoryJournal>) {
        let store = Arc::new(store);
        let journal = Arc::new(MemoryJournal::new());
        let config = EngineConfig {
            backoff_base: Duration::from_millis(1),
            ..EngineConfig::default()
        };
        let engine = Arc::new(MutationEngine::new(store.clone(), journal.clone(), config));
        (LedgerOperations::new(store.clone(), engine), store, journal)
    }

    fn both_stores() -> [InMemoryStore; 2] {
        [InMemoryStore::new(), InMemoryStore::new().without_atomic_path()]
    }

    #[tokio::test]
    async fn test_deposit_touches_only_target_field() {
        for store in both_stores() {
            let (ops, _, _) = create_test_ops(store);
            let account = AccountId::new("200");
            ops.deposit(&account, usdt(3_000_000), None).await.unwrap();

            let receipt = ops.deposit(&account, rub(12_345), None).await.unwrap();
            assert_eq!(receipt.balances, Balances::new(12_345, 3_000_000));
            assert!(!receipt.already_settled);
        }
    }

    #[tokio::test]
    async fn test_withdraw_insufficient_leaves_balance() {
        for store in both_stores() {
            let (ops, _, _) = create_test_ops(store);
            let account = AccountId::new("201");
            ops.deposit(&account, rub(1_000), None).await.unwrap();

            let err = ops.withdraw(&account, rub(1_001), None).await.unwrap_err();
            assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
            assert_eq!(ops.balances(&account).await.unwrap().rub, 1_000);

            let receipt = ops.withdraw(&account, rub(1_000), None).await.unwrap();
            assert_eq!(receipt.balances.rub, 0);
        }
    }

    #[tokio::test]
    async fn test_withdraw_unknown_account() {
        let (ops, _, _) = create_test_ops(InMemoryStore::new());
        let err = ops
            .withdraw(&AccountId::new("nobody"), rub(1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::AccountNotFound(_)));
    }

    #[tokio::test]
    async fn test_exchange_moves_both_fields() {
        for store in both_stores() {
            let (ops, _, _) = create_test_ops(store);
            let account = AccountId::new("202");
            ops.deposit(&account, rub(10_000), None).await.unwrap();

            // 90 RUB at 0.011 USDT per RUB
            let rate = ExchangeRate::new(dec!(0.011)).unwrap();
            let receipt = ops
                .exchange(&account, rub(9_000), Currency::Usdt, rate)
                .await
                .unwrap();
            assert_eq!(receipt.converted, Some(usdt(990_000)));
            assert_eq!(receipt.balances, Balances::new(1_000, 990_000));

            // Not enough RUB left: neither field moves
            let err = ops
                .exchange(&account, rub(1_001), Currency::Usdt, rate)
                .await
                .unwrap_err();
            assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
            assert_eq!(ops.balances(&account).await.unwrap(), Balances::new(1_000, 990_000));
        }
    }

    #[tokio::test]
    async fn test_exchange_validation() {
        let (ops, _, journal) = create_test_ops(InMemoryStore::new());
        let account = AccountId::new("203");
        ops.deposit(&account, rub(100), None).await.unwrap();
        let rate = ExchangeRate::new(dec!(0.000001)).unwrap();

        let same = ops.exchange(&account, rub(1), Currency::Rub, rate).await;
        assert!(matches!(same, Err(LedgerError::Validation { .. })));

        // 0.01 RUB × 0.000001 rounds to zero micro-USDT
        let dust = ops.exchange(&account, rub(1), Currency::Usdt, rate).await;
        assert!(matches!(dust, Err(LedgerError::Validation { .. })));

        // Rejected before reaching the engine
        assert_eq!(journal.len(), 1);
    }

    #[tokio::test]
    async fn test_invoice_fulfilled_once() {
        for store in both_stores() {
            let (ops, store, _) = create_test_ops(store);
            let account = AccountId::new("204");
            let invoice = ops
                .register_invoice(&account, rub(5_000), Some(InvoiceId::new("inv-77")))
                .await
                .unwrap();

            let first = ops
                .deposit(&account, rub(5_000), Some(invoice.id.clone()))
                .await
                .unwrap();
            let second = ops
                .deposit(&account, rub(5_000), Some(invoice.id.clone()))
                .await
                .unwrap();
            let third = ops.settle_invoice(&invoice.id).await.unwrap();

            assert!(!first.already_settled);
            assert!(second.already_settled);
            assert!(third.already_settled);
            assert_eq!(second.balances.rub, 5_000);
            assert!(store.get_invoice(&invoice.id).await.unwrap().unwrap().done);
        }
    }

    #[tokio::test]
    async fn test_invoice_must_match_request() {
        let (ops, _, _) = create_test_ops(InMemoryStore::new());
        let account = AccountId::new("205");
        let invoice = ops.register_invoice(&account, rub(5_000), None).await.unwrap();

        let wrong_amount = ops.deposit(&account, rub(4_999), Some(invoice.id.clone())).await;
        assert!(matches!(wrong_amount, Err(LedgerError::Validation { .. })));

        let wrong_account = ops
            .deposit(&AccountId::new("206"), rub(5_000), Some(invoice.id.clone()))
            .await;
        assert!(matches!(wrong_account, Err(LedgerError::Validation { .. })));

        let missing = ops.settle_invoice(&InvoiceId::new("nope")).await;
        assert!(matches!(missing, Err(LedgerError::RecordNotFound(_))));
    }

    #[tokio::test]
    async fn test_register_invoice_is_idempotent() {
        let (ops, _, _) = create_test_ops(InMemoryStore::new());
        let account = AccountId::new("207");
        let id = InvoiceId::new("inv-dup");

        let first = ops.register_invoice(&account, rub(10), Some(id.clone())).await.unwrap();
        let again = ops.register_invoice(&account, rub(10), Some(id.clone())).await.unwrap();
        assert_eq!(first.id, again.id);

        let clash = ops.register_invoice(&account, rub(11), Some(id)).await;
        assert!(matches!(clash, Err(LedgerError::Validation { .. })));
    }

    #[tokio::test]
    async fn test_withdraw_request_debited_once() {
        for store in both_stores() {
            let (ops, _, journal) = create_test_ops(store);
            let account = AccountId::new("208");
            ops.deposit(&account, rub(900), None).await.unwrap();
            let request = ops
                .register_withdraw(&account, rub(400), WithdrawId::new("wd-1"))
                .await
                .unwrap();

            ops.withdraw(&account, rub(400), Some(request.id.clone())).await.unwrap();
            let again = ops
                .withdraw(&account, rub(400), Some(request.id.clone()))
                .await
                .unwrap();

            assert!(again.already_settled);
            assert_eq!(ops.balances(&account).await.unwrap().rub, 500);
            assert_eq!(
                journal.entries().last().unwrap().status,
                EntryStatus::AlreadySettled
            );
        }
    }

    #[tokio::test]
    async fn test_trade_settlement_idempotent() {
        for store in both_stores() {
            let (ops, store, _) = create_test_ops(store);
            let account = AccountId::new("209");
            ops.deposit(&account, rub(10_000), None).await.unwrap();

            let trade = Trade::open(
                account.clone(),
                rub(10_000),
                chrono::Duration::seconds(1),
                ForcedOutcome::Lose,
            );
            store.insert_trade(&trade).await.unwrap();

            let first = ops
                .settle_trade_balance(&trade, TradeOutcome::Lose, rub(2_500))
                .await
                .unwrap();
            let second = ops
                .settle_trade_balance(&trade, TradeOutcome::Lose, rub(2_500))
                .await
                .unwrap();

            assert_eq!(first.balances.rub, 12_500);
            assert!(second.already_settled);
            assert_eq!(ops.balances(&account).await.unwrap().rub, 12_500);

            let closed = store.get_trade(&trade.id).await.unwrap().unwrap();
            assert_eq!(closed.outcome(), Some(TradeOutcome::Lose));
        }
    }

    #[tokio::test]
    async fn test_rejects_non_positive_amounts() {
        let (ops, _, _) = create_test_ops(InMemoryStore::new());
        let account = AccountId::new("210");
        assert!(ops.deposit(&account, rub(0), None).await.is_err());
        assert!(ops.deposit(&account, rub(-5), None).await.is_err());
        assert!(ops.deposit(&AccountId::new("bad id!"), rub(5), None).await.is_err());
    }
}
