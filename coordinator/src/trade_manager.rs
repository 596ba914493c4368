//! Trade lifecycle management.
//!
//! A trade moves `Active → Closed` exactly once. Opening takes (or checks)
//! the stake and records the trade; settlement resolves the outcome,
//! credits the payout and closes the trade in one ledger mutation. When
//! the credit cannot be applied the trade is still closed, flagged as
//! degraded for manual reconciliation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, instrument, warn};

use atomicledger_common::{
    AccountId, LedgerError, Money, Reference, Result, Trade, TradeId, TradeOutcome,
};
use atomicledger_ledger::{
    Balances, Claim, ClaimResult, EntryStatus, JournalEntry, LedgerOperations,
    LedgerReceipt, LedgerStore, OperationKind, StoreError,
};

use crate::config::SettlementConfig;
use crate::metrics::SharedMetrics;
use crate::notifier::{LedgerEvent, NotificationDispatcher};

/// Result of a settlement attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementResult {
    /// Payout credited and trade closed.
    Settled {
        outcome: TradeOutcome,
        credited: Money,
        balances: Balances,
    },
    /// The trade was already closed; nothing changed.
    AlreadySettled { outcome: Option<TradeOutcome> },
    /// Closed without a credit.
    Degraded { outcome: TradeOutcome, reason: String },
}

/// Opens and settles trades.
pub struct TradeManager {
    store: Arc<dyn LedgerStore>,
    ops: Arc<LedgerOperations>,
    notifications: Arc<NotificationDispatcher>,
    config: SettlementConfig,
    metrics: SharedMetrics,
}

impl TradeManager {
    /// Create a new trade manager.
    pub fn new(
        store: Arc<dyn LedgerStore>,
        ops: Arc<LedgerOperations>,
        notifications: Arc<NotificationDispatcher>,
        config: SettlementConfig,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            store,
            ops,
            notifications,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &SettlementConfig {
        &self.config
    }

    /// Open a trade for an account with no other active trade.
    #[instrument(skip(self), fields(account = %account_id, stake = %stake))]
    pub async fn open_trade(
        &self,
        account_id: &AccountId,
        stake: Money,
        duration_secs: i64,
    ) -> Result<Trade> {
        if !account_id.is_valid() {
            return Err(LedgerError::invalid("account_id", "malformed account id"));
        }
        if !stake.is_positive() {
            return Err(LedgerError::invalid("amount", "stake must be positive"));
        }
        let duration = self.validate_duration(duration_secs)?;

        if self.store.active_trade(account_id).await?.is_some() {
            return Err(LedgerError::ActiveTradeExists(account_id.clone()));
        }

        if self.config.debit_stake_on_open {
            self.ops.debit_stake(account_id, stake).await?;
        } else {
            let available = self.ops.balances(account_id).await?.money(stake.currency);
            if available.units < stake.units {
                return Err(LedgerError::InsufficientBalance {
                    required: stake.to_string(),
                    available: available.to_string(),
                });
            }
        }

        let forced = self.store.forced_outcome(account_id).await?;
        let trade = Trade::open(account_id.clone(), stake, duration, forced);

        if let Err(e) = self.store.insert_trade(&trade).await {
            return Err(self.undo_open(&trade, e).await);
        }

        self.metrics.trade_opened();
        info!(
            trade_id = %trade.id,
            settle_at = %trade.settle_at,
            forced_outcome = forced.as_str(),
            "Trade opened"
        );
        self.notifications
            .dispatch(LedgerEvent::TradeOpened {
                trade_id: trade.id,
                account_id: trade.account_id.clone(),
                stake,
                duration_secs: trade.duration_secs,
            })
            .await;

        Ok(trade)
    }

    /// Settle a trade. Safe to call any number of times.
    #[instrument(skip(self), fields(trade_id = %trade_id))]
    pub async fn settle_trade(&self, trade_id: &TradeId) -> Result<SettlementResult> {
        let trade = self
            .store
            .get_trade(trade_id)
            .await?
            .ok_or_else(|| LedgerError::RecordNotFound(Reference::Trade(*trade_id)))?;

        if !trade.is_active {
            self.metrics.trade_already_settled();
            return Ok(SettlementResult::AlreadySettled {
                outcome: trade.outcome(),
            });
        }

        let outcome = resolve_outcome(&trade);
        let credit = self
            .config
            .payouts
            .credit_for(&trade.stake, outcome)
            .map_err(|e| LedgerError::InternalError(format!("payout: {}", e)))?;

        let settled = if credit.is_positive() {
            self.ops.settle_trade_balance(&trade, outcome, credit).await
        } else {
            self.close_without_credit(&trade, outcome).await
        };

        match settled {
            Ok(receipt) if receipt.already_settled => {
                self.metrics.trade_already_settled();
                let current = self.store.get_trade(trade_id).await?;
                Ok(SettlementResult::AlreadySettled {
                    outcome: current.and_then(|t| t.outcome()),
                })
            }
            Ok(receipt) => {
                self.metrics.trade_settled();
                info!(outcome = %outcome, credited = %credit, "Trade settled");
                self.notifications
                    .dispatch(LedgerEvent::TradeSettled {
                        trade_id: trade.id,
                        account_id: trade.account_id.clone(),
                        outcome,
                        credited: credit,
                        balances: receipt.balances,
                    })
                    .await;
                Ok(SettlementResult::Settled {
                    outcome,
                    credited: credit,
                    balances: receipt.balances,
                })
            }
            Err(e) => self.degrade(&trade, outcome, credit, e).await,
        }
    }

    /// Settle every trade whose time has come, up to one batch.
    pub async fn settle_due(&self) -> Result<usize> {
        let due = self
            .store
            .due_trades(Utc::now(), self.config.batch_size)
            .await?;

        let mut settled = 0;
        for trade in due {
            match self.settle_trade(&trade.id).await {
                Ok(SettlementResult::AlreadySettled { .. }) => {}
                Ok(_) => settled += 1,
                Err(e) => {
                    warn!(trade_id = %trade.id, error = %e, "Settlement failed, will retry");
                }
            }
        }
        Ok(settled)
    }

    fn validate_duration(&self, duration_secs: i64) -> Result<chrono::Duration> {
        let secs = u64::try_from(duration_secs)
            .map_err(|_| LedgerError::invalid("duration_secs", "duration must be positive"))?;
        let duration = Duration::from_secs(secs);
        if duration < self.config.min_duration || duration > self.config.max_duration {
            return Err(LedgerError::invalid(
                "duration_secs",
                format!(
                    "duration must be between {}s and {}s",
                    self.config.min_duration.as_secs(),
                    self.config.max_duration.as_secs()
                ),
            ));
        }
        Ok(chrono::Duration::seconds(duration_secs))
    }

    /// The trade could not be recorded; give the stake back if it was
    /// taken and the trade is definitely absent.
    async fn undo_open(&self, trade: &Trade, err: StoreError) -> LedgerError {
        let inserted = match &err {
            StoreError::ActiveTradeExists(_) | StoreError::Duplicate(_) => Some(false),
            _ => match self.store.get_trade(&trade.id).await {
                Ok(found) => Some(found.is_some()),
                Err(e) => {
                    error!(trade_id = %trade.id, error = %e, "Cannot tell whether trade was recorded");
                    None
                }
            },
        };

        match inserted {
            Some(true) => {
                warn!(trade_id = %trade.id, error = %err, "Trade recorded despite insert error");
            }
            Some(false) if self.config.debit_stake_on_open => {
                match self.ops.refund_stake(&trade.account_id, trade.stake).await {
                    Ok(_) => {
                        self.metrics.stake_refunded();
                        info!(trade_id = %trade.id, "Stake refunded after failed trade insert");
                    }
                    Err(e) => {
                        error!(trade_id = %trade.id, error = %e, "Stake refund failed");
                    }
                }
            }
            _ => {}
        }
        err.into()
    }

    /// Close a trade whose payout rounds to nothing.
    async fn close_without_credit(
        &self,
        trade: &Trade,
        outcome: TradeOutcome,
    ) -> Result<LedgerReceipt> {
        let claim = Claim::Trade {
            id: trade.id,
            outcome,
        };
        let already_settled = self.store.claim(&claim).await? == ClaimResult::AlreadyFinal;
        let balances = self.ops.balances(&trade.account_id).await?;
        Ok(LedgerReceipt {
            account_id: trade.account_id.clone(),
            balances,
            amount: Money::zero(trade.stake.currency),
            converted: None,
            already_settled,
            path: None,
        })
    }

    /// Manual-close fallback after the payout failed.
    async fn degrade(
        &self,
        trade: &Trade,
        outcome: TradeOutcome,
        credit: Money,
        cause: LedgerError,
    ) -> Result<SettlementResult> {
        let closed_here = self.store.force_close_trade(&trade.id, outcome).await?;
        let current = self.store.get_trade(&trade.id).await?;

        // Someone else closed it normally while we were failing
        if !closed_here {
            if let Some(current) = current.as_ref().filter(|t| !t.degraded) {
                self.metrics.trade_already_settled();
                return Ok(SettlementResult::AlreadySettled {
                    outcome: current.outcome(),
                });
            }
        }

        let outcome = current.and_then(|t| t.outcome()).unwrap_or(outcome);
        let reason = cause.to_string();
        self.metrics.trade_degraded();
        warn!(
            outcome = %outcome,
            credit = %credit,
            reason = %reason,
            "Trade closed without payout, needs reconciliation"
        );

        let entry = JournalEntry::new(
            OperationKind::TradeSettlement,
            trade.account_id.clone(),
            credit,
            Some(Reference::Trade(trade.id)),
            EntryStatus::Degraded,
        )
        .with_details(reason.clone());
        self.ops.engine().record(entry).await;

        self.notifications
            .dispatch(LedgerEvent::TradeDegraded {
                trade_id: trade.id,
                account_id: trade.account_id.clone(),
                outcome,
                reason: reason.clone(),
            })
            .await;

        Ok(SettlementResult::Degraded { outcome, reason })
    }
}

/// The captured override decides; otherwise a fair coin.
pub fn resolve_outcome(trade: &Trade) -> TradeOutcome {
    trade
        .forced_outcome
        .pinned()
        .unwrap_or_else(|| TradeOutcome::from_is_win(rand::random::<bool>()))
}
