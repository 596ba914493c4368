//! Core service implementation.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use atomicledger_common::{
    AccountId, Currency, ExchangeRate, InvoiceId, LedgerError, Money, Result, Trade, TradeId,
    WithdrawId,
};
use atomicledger_ledger::{
    Balances, JournalSink, LedgerOperations, LedgerReceipt, LedgerStore, MutationEngine,
};

use crate::config::CoordinatorConfig;
use crate::metrics::{Metrics, SharedMetrics};
use crate::notifier::{LedgerEvent, NotificationDispatcher, Notifier};
use crate::settlement_worker::SettlementWorker;
use crate::state::CoordinatorState;
use crate::trade_manager::{SettlementResult, TradeManager};

/// Retry hint returned while the service is not running.
const RETRY_AFTER_MS: u64 = 1000;

/// The ledger service: owns the engine, the trade manager and the
/// settlement worker, and gates every request on its lifecycle state.
pub struct Coordinator {
    /// Configuration.
    config: CoordinatorConfig,
    /// Node ID for this instance.
    node_id: String,
    /// Current lifecycle state.
    state: Arc<RwLock<CoordinatorState>>,
    /// Ledger operations over the shared store.
    ops: Arc<LedgerOperations>,
    /// Trade lifecycle.
    trades: Arc<TradeManager>,
    /// Outbound notifications.
    notifications: Arc<NotificationDispatcher>,
    /// Service metrics.
    metrics: SharedMetrics,
    /// Shutdown signal for background tasks.
    shutdown_tx: watch::Sender<bool>,
    /// Running settlement worker.
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// Create a new coordinator over injected store, journal and notifier.
    pub fn new(
        config: CoordinatorConfig,
        node_id: String,
        store: Arc<dyn LedgerStore>,
        journal: Arc<dyn JournalSink>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let metrics: SharedMetrics = Arc::new(Metrics::new());

        let engine = Arc::new(MutationEngine::new(
            store.clone(),
            journal,
            config.engine.clone(),
        ));
        let ops = Arc::new(LedgerOperations::new(store.clone(), engine));
        let notifications = Arc::new(NotificationDispatcher::new(notifier, metrics.clone()));
        let trades = Arc::new(TradeManager::new(
            store,
            ops.clone(),
            notifications.clone(),
            config.settlement.clone(),
            metrics.clone(),
        ));

        Self {
            config,
            node_id,
            state: Arc::new(RwLock::new(CoordinatorState::Starting)),
            ops,
            trades,
            notifications,
            metrics,
            shutdown_tx,
            worker: Mutex::new(None),
        }
    }

    /// Start the coordinator and its settlement worker.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        info!(node_id = %self.node_id, "Starting coordinator");

        let worker = SettlementWorker::new(self.trades.clone(), self.shutdown_tx.subscribe());
        *self.worker.lock() = Some(tokio::spawn(worker.run()));

        *self.state.write() = CoordinatorState::Running;

        info!(
            node_id = %self.node_id,
            atomic_path = self.config.engine.use_atomic_path,
            "Coordinator started successfully"
        );
        Ok(())
    }

    /// Stop the coordinator gracefully.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<()> {
        info!(node_id = %self.node_id, "Stopping coordinator");

        *self.state.write() = CoordinatorState::ShuttingDown;

        let _ = self.shutdown_tx.send(true);
        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                warn!(error = %e, "Settlement worker ended abnormally");
            }
        }

        *self.state.write() = CoordinatorState::Stopped;

        info!(node_id = %self.node_id, "Coordinator stopped");
        Ok(())
    }

    /// Credit an account.
    pub async fn deposit(
        &self,
        account_id: &AccountId,
        amount: Money,
        invoice_id: Option<InvoiceId>,
    ) -> Result<LedgerReceipt> {
        self.ensure_running()?;
        let receipt = self.ops.deposit(account_id, amount, invoice_id.clone()).await?;
        self.notify_deposit(&receipt, invoice_id).await;
        Ok(receipt)
    }

    /// Debit an account.
    pub async fn withdraw(
        &self,
        account_id: &AccountId,
        amount: Money,
        withdraw_id: Option<WithdrawId>,
    ) -> Result<LedgerReceipt> {
        self.ensure_running()?;
        let receipt = self.ops.withdraw(account_id, amount, withdraw_id).await?;
        if !receipt.already_settled {
            self.notifications
                .dispatch(LedgerEvent::WithdrawalApplied {
                    account_id: receipt.account_id.clone(),
                    amount: receipt.amount,
                    balances: receipt.balances,
                })
                .await;
        }
        Ok(receipt)
    }

    /// Convert between balance fields.
    pub async fn exchange(
        &self,
        account_id: &AccountId,
        amount: Money,
        to: Currency,
        rate: ExchangeRate,
    ) -> Result<LedgerReceipt> {
        self.ensure_running()?;
        let receipt = self.ops.exchange(account_id, amount, to, rate).await?;
        if let Some(converted) = receipt.converted {
            self.notifications
                .dispatch(LedgerEvent::ExchangeApplied {
                    account_id: receipt.account_id.clone(),
                    from: receipt.amount,
                    to: converted,
                    balances: receipt.balances,
                })
                .await;
        }
        Ok(receipt)
    }

    /// Apply a pending invoice.
    pub async fn settle_invoice(&self, invoice_id: &InvoiceId) -> Result<LedgerReceipt> {
        self.ensure_running()?;
        let receipt = self.ops.settle_invoice(invoice_id).await?;
        self.notify_deposit(&receipt, Some(invoice_id.clone())).await;
        Ok(receipt)
    }

    /// Confirmed external payment: record the invoice if new, then apply it.
    #[instrument(skip(self), fields(account = %account_id, amount = %amount))]
    pub async fn process_deposit(
        &self,
        account_id: &AccountId,
        amount: Money,
        invoice_id: Option<InvoiceId>,
    ) -> Result<LedgerReceipt> {
        self.ensure_running()?;
        let invoice = self.ops.register_invoice(account_id, amount, invoice_id).await?;
        let receipt = self.ops.settle_invoice(&invoice.id).await?;
        self.notify_deposit(&receipt, Some(invoice.id)).await;
        Ok(receipt)
    }

    /// Open a trade.
    pub async fn open_trade(
        &self,
        account_id: &AccountId,
        stake: Money,
        duration_secs: i64,
    ) -> Result<Trade> {
        self.ensure_running()?;
        self.trades.open_trade(account_id, stake, duration_secs).await
    }

    /// Settle a trade now rather than waiting for the worker.
    pub async fn settle_trade(&self, trade_id: &TradeId) -> Result<SettlementResult> {
        self.ensure_running()?;
        self.trades.settle_trade(trade_id).await
    }

    /// Current balances of an account.
    pub async fn balances(&self, account_id: &AccountId) -> Result<Balances> {
        self.ensure_running()?;
        self.ops.balances(account_id).await
    }

    /// Check if the coordinator is accepting requests.
    pub fn is_accepting_requests(&self) -> bool {
        self.state.read().accepts_requests()
    }

    /// Get the current coordinator state.
    pub fn state(&self) -> CoordinatorState {
        *self.state.read()
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    /// Service and engine metrics in Prometheus text format.
    pub fn metrics_text(&self) -> String {
        let engine = self.ops.engine().stats().snapshot();
        self.metrics.to_prometheus(&engine)
    }

    // --- Private methods ---

    fn ensure_running(&self) -> Result<()> {
        if self.is_accepting_requests() {
            Ok(())
        } else {
            Err(LedgerError::Unavailable {
                retry_after_ms: RETRY_AFTER_MS,
            })
        }
    }

    async fn notify_deposit(&self, receipt: &LedgerReceipt, invoice_id: Option<InvoiceId>) {
        if receipt.already_settled {
            return;
        }
        self.notifications
            .dispatch(LedgerEvent::DepositApplied {
                account_id: receipt.account_id.clone(),
                amount: receipt.amount,
                invoice_id,
                balances: receipt.balances,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atomicledger_ledger::{InMemoryStore, MemoryJournal};
    use tokio_test::{assert_err, assert_ok};

    use crate::notifier::LogNotifier;

    fn create_test_coordinator() -> Coordinator {
        Coordinator::new(
            CoordinatorConfig::default(),
            "test-node-1".to_string(),
            Arc::new(InMemoryStore::new()),
            Arc::new(MemoryJournal::new()),
            Arc::new(LogNotifier),
        )
    }

    fn rub(units: i64) -> Money {
        Money::from_units(units, Currency::Rub)
    }

    #[tokio::test]
    async fn test_coordinator_creation() {
        let coordinator = create_test_coordinator();
        assert_eq!(coordinator.state(), CoordinatorState::Starting);
        assert!(!coordinator.is_accepting_requests());
    }

    #[tokio::test]
    async fn test_coordinator_start_stop() {
        let coordinator = create_test_coordinator();

        assert_ok!(coordinator.start().await);
        assert_eq!(coordinator.state(), CoordinatorState::Running);

        assert_ok!(coordinator.stop().await);
        assert_eq!(coordinator.state(), CoordinatorState::Stopped);
        assert_err!(coordinator.balances(&AccountId::new("1")).await);
    }

    #[tokio::test]
    async fn test_rejects_requests_when_not_running() {
        let coordinator = create_test_coordinator();
        let err = coordinator
            .deposit(&AccountId::new("1"), rub(100), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Unavailable { retry_after_ms: 1000 }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_process_deposit_applies_once() {
        let coordinator = create_test_coordinator();
        coordinator.start().await.unwrap();

        let account = AccountId::new("42");
        let invoice = InvoiceId::new("pay-1");
        let first = coordinator
            .process_deposit(&account, rub(50_000), Some(invoice.clone()))
            .await
            .unwrap();
        let second = coordinator
            .process_deposit(&account, rub(50_000), Some(invoice))
            .await
            .unwrap();

        assert!(!first.already_settled);
        assert!(second.already_settled);
        assert_eq!(second.balances.rub, 50_000);
        assert_eq!(coordinator.metrics().snapshot().notifications_sent, 1);

        coordinator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_trade_round_trip_through_service() {
        let coordinator = create_test_coordinator();
        coordinator.start().await.unwrap();

        let account = AccountId::new("43");
        coordinator.deposit(&account, rub(10_000), None).await.unwrap();
        let trade = coordinator.open_trade(&account, rub(10_000), 60).await.unwrap();

        let result = coordinator.settle_trade(&trade.id).await.unwrap();
        let balance = coordinator.balances(&account).await.unwrap().rub;
        match result {
            SettlementResult::Settled { outcome, .. } if outcome.is_win() => assert_eq!(balance, 17_500),
            SettlementResult::Settled { .. } => assert_eq!(balance, 2_500),
            other => panic!("unexpected settlement result: {:?}", other),
        }

        let text = coordinator.metrics_text();
        assert!(text.contains("atomicledger_trades_settled 1"));

        coordinator.stop().await.unwrap();
    }
}
