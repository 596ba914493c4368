//! Simulation controller.
//!
//! Spawns workers that hammer a shared in-memory ledger with random
//! operations, then checks that every account's balance equals the sum of
//! the changes its journal says were applied. Trades go through the
//! service's trade manager, so stake debits, payouts and degraded closes
//! are all covered by the check.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use atomicledger_common::{AccountId, Currency, ExchangeRate, LedgerError, Money};
use atomicledger_coordinator::config::SettlementConfig;
use atomicledger_coordinator::metrics::{Metrics, MetricsSnapshot, SharedMetrics};
use atomicledger_coordinator::notifier::NotificationDispatcher;
use atomicledger_coordinator::{LogNotifier, SettlementResult, TradeManager};
use atomicledger_ledger::{
    EngineConfig, EngineStatsSnapshot, InMemoryStore, LedgerOperations, MemoryJournal,
    MutationEngine,
};

use crate::metrics::SimulationMetrics;

/// Funds each account starts with, per currency, in major units.
const INITIAL_RUB: i64 = 100_000;
const INITIAL_USDT: i64 = 1_000;
/// Shortest trade the manager accepts.
const TRADE_DURATION_SECS: i64 = 1;

/// Simulation parameters.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub accounts: usize,
    pub workers: usize,
    pub operations: usize,
    pub seed: Option<u64>,
    /// Probability that an operation targets the hot account.
    pub contention: f64,
    /// Disable the store's atomic primitive so every write is a
    /// compare-and-swap.
    pub optimistic_only: bool,
}

/// Result of comparing balances with the journal.
#[derive(Debug, Clone, Default)]
pub struct VerificationReport {
    pub accounts: usize,
    pub mismatches: Vec<String>,
}

impl VerificationReport {
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
enum Operation {
    Deposit,
    Withdraw,
    Exchange,
    Invoice,
    Trade,
}

impl Operation {
    fn pick(rng: &mut StdRng) -> Self {
        match rng.gen_range(0..10) {
            0..=2 => Operation::Deposit,
            3..=4 => Operation::Withdraw,
            5..=6 => Operation::Exchange,
            7 => Operation::Invoice,
            _ => Operation::Trade,
        }
    }
}

/// Controls the simulation.
pub struct SimulationController {
    config: SimulationConfig,
    store: Arc<InMemoryStore>,
    journal: Arc<MemoryJournal>,
    ops: Arc<LedgerOperations>,
    trades: Arc<TradeManager>,
    trade_metrics: SharedMetrics,
    accounts: Arc<Vec<AccountId>>,
}

impl SimulationController {
    /// Create a new simulation controller.
    pub fn new(config: SimulationConfig) -> Self {
        let store = if config.optimistic_only {
            Arc::new(InMemoryStore::new().without_atomic_path())
        } else {
            Arc::new(InMemoryStore::new())
        };
        let journal = Arc::new(MemoryJournal::new());
        let engine_config = EngineConfig {
            max_attempts: 8,
            backoff_base: Duration::from_micros(200),
            ..EngineConfig::default()
        };
        let engine = Arc::new(MutationEngine::new(store.clone(), journal.clone(), engine_config));
        let ops = Arc::new(LedgerOperations::new(store.clone(), engine));
        let trade_metrics: SharedMetrics = Arc::new(Metrics::new());
        let notifications = Arc::new(NotificationDispatcher::new(
            Arc::new(LogNotifier),
            trade_metrics.clone(),
        ));
        let trades = Arc::new(TradeManager::new(
            store.clone(),
            ops.clone(),
            notifications,
            SettlementConfig::default(),
            trade_metrics.clone(),
        ));
        let accounts = (0..config.accounts)
            .map(|i| AccountId::new(i.to_string()))
            .collect();

        Self {
            config,
            store,
            journal,
            ops,
            trades,
            trade_metrics,
            accounts: Arc::new(accounts),
        }
    }

    /// Fund every simulated account.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        info!("Initializing simulation with {} accounts", self.accounts.len());

        for account in self.accounts.iter() {
            self.ops
                .deposit(account, Money::from_units(INITIAL_RUB * 100, Currency::Rub), None)
                .await?;
            self.ops
                .deposit(account, Money::from_units(INITIAL_USDT * 1_000_000, Currency::Usdt), None)
                .await?;
        }

        Ok(())
    }

    /// Run every worker to completion and return the merged metrics.
    pub async fn run(&self) -> anyhow::Result<(SimulationMetrics, Duration)> {
        let per_worker = self.config.operations / self.config.workers.max(1);
        let base_seed = self.config.seed.unwrap_or_else(rand::random);
        info!(
            workers = self.config.workers,
            per_worker,
            seed = base_seed,
            contention = self.config.contention,
            "Running simulation"
        );

        let start = Instant::now();
        let mut handles = Vec::with_capacity(self.config.workers);
        for worker_id in 0..self.config.workers {
            let worker = Worker {
                id: worker_id,
                rng: StdRng::seed_from_u64(base_seed.wrapping_add(worker_id as u64)),
                ops: self.ops.clone(),
                trades: self.trades.clone(),
                accounts: self.accounts.clone(),
                contention: self.config.contention,
                metrics: SimulationMetrics::new(),
            };
            handles.push(tokio::spawn(worker.run(per_worker)));
        }

        let mut metrics = SimulationMetrics::new();
        for handle in handles {
            metrics.merge(&handle.await?);
        }

        Ok((metrics, start.elapsed()))
    }

    /// Check every balance against the journal.
    pub fn verify(&self) -> VerificationReport {
        let rows = self.store.snapshot();
        let mut report = VerificationReport {
            accounts: rows.len(),
            mismatches: Vec::new(),
        };

        for row in rows {
            let (rub, usdt) = self.journal.net_applied(&row.account_id);
            if row.balances.rub != rub || row.balances.usdt != usdt {
                report.mismatches.push(format!(
                    "{}: balance ({}, {}) but journal sums to ({}, {})",
                    row.account_id, row.balances.rub, row.balances.usdt, rub, usdt
                ));
            }
            if row.balances.rub < 0 || row.balances.usdt < 0 {
                report.mismatches.push(format!(
                    "{}: negative balance ({}, {})",
                    row.account_id, row.balances.rub, row.balances.usdt
                ));
            }
        }

        report
    }

    pub fn engine_stats(&self) -> EngineStatsSnapshot {
        self.ops.engine().stats().snapshot()
    }

    pub fn trade_stats(&self) -> MetricsSnapshot {
        self.trade_metrics.snapshot()
    }
}

struct Worker {
    id: usize,
    rng: StdRng,
    ops: Arc<LedgerOperations>,
    trades: Arc<TradeManager>,
    accounts: Arc<Vec<AccountId>>,
    contention: f64,
    metrics: SimulationMetrics,
}

impl Worker {
    async fn run(mut self, operations: usize) -> SimulationMetrics {
        for _ in 0..operations {
            let account = self.pick_account();
            let operation = Operation::pick(&mut self.rng);
            let started = Instant::now();

            let result = match operation {
                Operation::Deposit => self.deposit(&account).await,
                Operation::Withdraw => self.withdraw(&account).await,
                Operation::Exchange => self.exchange(&account).await,
                Operation::Invoice => self.invoice(&account).await,
                Operation::Trade => self.trade(&account).await,
            };

            let latency = started.elapsed().as_micros() as u64;
            match result {
                Ok(already_settled) => self.metrics.record_success(already_settled, latency),
                Err(e) => {
                    debug!(worker = self.id, ?operation, error = %e, "Operation failed");
                    self.metrics.record_failure(&e);
                }
            }
        }
        self.metrics
    }

    fn pick_account(&mut self) -> AccountId {
        if self.rng.gen_bool(self.contention.clamp(0.0, 1.0)) {
            return self.accounts[0].clone();
        }
        let idx = self.rng.gen_range(0..self.accounts.len());
        self.accounts[idx].clone()
    }

    fn random_amount(&mut self, currency: Currency) -> Money {
        let units = match currency {
            Currency::Rub => self.rng.gen_range(100..500_000),
            Currency::Usdt => self.rng.gen_range(10_000..50_000_000),
        };
        Money::from_units(units, currency)
    }

    fn random_currency(&mut self) -> Currency {
        if self.rng.gen_bool(0.5) {
            Currency::Rub
        } else {
            Currency::Usdt
        }
    }

    async fn deposit(&mut self, account: &AccountId) -> Result<bool, LedgerError> {
        let currency = self.random_currency();
        let amount = self.random_amount(currency);
        let receipt = self.ops.deposit(account, amount, None).await?;
        Ok(receipt.already_settled)
    }

    async fn withdraw(&mut self, account: &AccountId) -> Result<bool, LedgerError> {
        let currency = self.random_currency();
        let amount = self.random_amount(currency);
        let receipt = self.ops.withdraw(account, amount, None).await?;
        Ok(receipt.already_settled)
    }

    async fn exchange(&mut self, account: &AccountId) -> Result<bool, LedgerError> {
        let (amount, to, rate) = if self.rng.gen_bool(0.5) {
            (self.random_amount(Currency::Rub), Currency::Usdt, Decimal::new(108, 4))
        } else {
            (self.random_amount(Currency::Usdt), Currency::Rub, Decimal::new(925, 1))
        };
        let rate = ExchangeRate::new(rate).map_err(|e| LedgerError::invalid_amount("rate", e))?;
        let receipt = self.ops.exchange(account, amount, to, rate).await?;
        Ok(receipt.already_settled)
    }

    /// Register an invoice and settle it twice; the replay must not credit.
    async fn invoice(&mut self, account: &AccountId) -> Result<bool, LedgerError> {
        let amount = self.random_amount(Currency::Rub);
        let invoice = self.ops.register_invoice(account, amount, None).await?;
        let first = self.ops.settle_invoice(&invoice.id).await?;
        let replay = self.ops.settle_invoice(&invoice.id).await?;
        if !replay.already_settled {
            warn!(invoice_id = %invoice.id, "Invoice credited twice");
            return Err(LedgerError::InternalError(format!(
                "invoice {} credited twice",
                invoice.id
            )));
        }
        Ok(first.already_settled)
    }

    /// Open a trade and settle it twice; the replay must not credit.
    async fn trade(&mut self, account: &AccountId) -> Result<bool, LedgerError> {
        let currency = self.random_currency();
        let stake = self.random_amount(currency);
        let trade = self.trades.open_trade(account, stake, TRADE_DURATION_SECS).await?;

        match self.trades.settle_trade(&trade.id).await? {
            SettlementResult::Settled { .. } => {}
            SettlementResult::AlreadySettled { .. } => return Ok(true),
            SettlementResult::Degraded { reason, .. } => {
                return Err(LedgerError::InternalError(format!(
                    "trade {} closed without payout: {}",
                    trade.id, reason
                )));
            }
        }

        match self.trades.settle_trade(&trade.id).await? {
            SettlementResult::AlreadySettled { .. } => Ok(false),
            other => {
                warn!(trade_id = %trade.id, result = ?other, "Trade settled twice");
                Err(LedgerError::InternalError(format!(
                    "trade {} settled twice",
                    trade.id
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config(optimistic_only: bool) -> SimulationConfig {
        SimulationConfig {
            accounts: 4,
            workers: 8,
            operations: 800,
            seed: Some(7),
            contention: 0.5,
            optimistic_only,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_balances_match_journal_atomic_path() {
        let controller = SimulationController::new(create_test_config(false));
        controller.initialize().await.unwrap();
        let (metrics, _) = controller.run().await.unwrap();

        assert_eq!(metrics.total_operations, 800);
        let trades = controller.trade_stats();
        assert!(trades.trades_opened > 0);
        assert_eq!(trades.trades_opened, trades.trades_settled + trades.trades_degraded);
        let report = controller.verify();
        assert_eq!(report.accounts, 4);
        assert!(report.is_consistent(), "{:?}", report.mismatches);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_balances_match_journal_optimistic_path() {
        let controller = SimulationController::new(create_test_config(true));
        controller.initialize().await.unwrap();
        controller.run().await.unwrap();

        let report = controller.verify();
        assert!(report.is_consistent(), "{:?}", report.mismatches);
        assert!(controller.engine_stats().fallbacks > 0);
    }
}
