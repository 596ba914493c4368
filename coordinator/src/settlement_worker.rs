//! Background worker that settles trades once they are due.
//!
//! The due time is stored with each trade, so trades opened before a
//! restart are picked up by the next poll.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::trade_manager::TradeManager;

/// Polls for due trades until told to stop.
pub struct SettlementWorker {
    trades: Arc<TradeManager>,
    shutdown: watch::Receiver<bool>,
}

impl SettlementWorker {
    pub fn new(trades: Arc<TradeManager>, shutdown: watch::Receiver<bool>) -> Self {
        Self { trades, shutdown }
    }

    /// Run one poll; returns the number of trades settled.
    pub async fn run_once(&self) -> usize {
        match self.trades.settle_due().await {
            Ok(0) => 0,
            Ok(settled) => {
                info!(settled, "Settled due trades");
                settled
            }
            Err(e) => {
                warn!(error = %e, "Failed to load due trades");
                0
            }
        }
    }

    /// Poll at the configured interval until shutdown is signalled.
    pub async fn run(mut self) {
        let interval = self.trades.config().poll_interval;
        info!(interval_ms = interval.as_millis() as u64, "Settlement worker started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.run_once().await;
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        debug!("Shutdown sender dropped");
                        break;
                    }
                }
            }
        }

        info!("Settlement worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;

    use atomicledger_common::{AccountId, Currency, ForcedOutcome, Money, Trade};
    use atomicledger_ledger::{
        EngineConfig, InMemoryStore, LedgerOperations, LedgerStore, MemoryJournal, MutationEngine,
    };

    use crate::config::SettlementConfig;
    use crate::metrics::{Metrics, SharedMetrics};
    use crate::notifier::{LogNotifier, NotificationDispatcher};

    fn create_test_trades(store: Arc<InMemoryStore>) -> (Arc<TradeManager>, Arc<LedgerOperations>) {
        let journal = Arc::new(MemoryJournal::new());
        let engine = Arc::new(MutationEngine::new(
            store.clone(),
            journal,
            EngineConfig::default(),
        ));
        let ops = Arc::new(LedgerOperations::new(store.clone(), engine));
        let metrics: SharedMetrics = Arc::new(Metrics::new());
        let notifications = Arc::new(NotificationDispatcher::new(Arc::new(LogNotifier), metrics.clone()));
        let config = SettlementConfig {
            poll_interval: Duration::from_millis(10),
            ..SettlementConfig::default()
        };
        let trades = Arc::new(TradeManager::new(
            store,
            ops.clone(),
            notifications,
            config,
            metrics,
        ));
        (trades, ops)
    }

    async fn overdue_trade(store: &InMemoryStore, ops: &LedgerOperations, account: &AccountId) {
        let stake = Money::from_units(1_000, Currency::Usdt);
        ops.deposit(account, stake, None).await.unwrap();
        store
            .set_forced_outcome(account, ForcedOutcome::Lose)
            .await
            .unwrap();
        let mut trade = Trade::open(
            account.clone(),
            stake,
            chrono::Duration::seconds(1),
            ForcedOutcome::Lose,
        );
        trade.settle_at = Utc::now() - chrono::Duration::seconds(5);
        store.insert_trade(&trade).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_once_settles_overdue() {
        let store = Arc::new(InMemoryStore::new());
        let (trades, ops) = create_test_trades(store.clone());
        let account = AccountId::new("700");
        overdue_trade(&store, &ops, &account).await;

        let (_tx, rx) = watch::channel(false);
        let worker = SettlementWorker::new(trades, rx);

        assert_eq!(worker.run_once().await, 1);
        assert_eq!(worker.run_once().await, 0);
        // 1000 deposited, stake left in place, lose refund 250
        assert_eq!(ops.balances(&account).await.unwrap().usdt, 1_250);
    }

    #[tokio::test]
    async fn test_worker_loop_stops_on_signal() {
        let store = Arc::new(InMemoryStore::new());
        let (trades, ops) = create_test_trades(store.clone());
        let account = AccountId::new("701");
        overdue_trade(&store, &ops, &account).await;

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(SettlementWorker::new(trades, rx).run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(store.active_trade(&account).await.unwrap().is_none());
    }
}
