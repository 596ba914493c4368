//! Outbound notifications about ledger events.
//!
//! Delivery is best-effort: a failing notifier is logged and counted, and
//! never changes the result of the operation that produced the event.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use atomicledger_common::{AccountId, InvoiceId, Money, TradeId, TradeOutcome};
use atomicledger_ledger::Balances;

use crate::config::NotifierConfig;
use crate::metrics::SharedMetrics;

/// Notification delivery errors.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification transport failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("notification rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Events worth telling someone about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEvent {
    DepositApplied {
        account_id: AccountId,
        amount: Money,
        invoice_id: Option<InvoiceId>,
        balances: Balances,
    },
    WithdrawalApplied {
        account_id: AccountId,
        amount: Money,
        balances: Balances,
    },
    ExchangeApplied {
        account_id: AccountId,
        from: Money,
        to: Money,
        balances: Balances,
    },
    TradeOpened {
        trade_id: TradeId,
        account_id: AccountId,
        stake: Money,
        duration_secs: i64,
    },
    TradeSettled {
        trade_id: TradeId,
        account_id: AccountId,
        outcome: TradeOutcome,
        credited: Money,
        balances: Balances,
    },
    /// Closed without a credit; needs manual reconciliation.
    TradeDegraded {
        trade_id: TradeId,
        account_id: AccountId,
        outcome: TradeOutcome,
        reason: String,
    },
}

impl LedgerEvent {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerEvent::DepositApplied { .. } => "deposit_applied",
            LedgerEvent::WithdrawalApplied { .. } => "withdrawal_applied",
            LedgerEvent::ExchangeApplied { .. } => "exchange_applied",
            LedgerEvent::TradeOpened { .. } => "trade_opened",
            LedgerEvent::TradeSettled { .. } => "trade_settled",
            LedgerEvent::TradeDegraded { .. } => "trade_degraded",
        }
    }

    /// Plain-text message body.
    pub fn message(&self) -> String {
        match self {
            LedgerEvent::DepositApplied {
                account_id,
                amount,
                invoice_id,
                ..
            } => match invoice_id {
                Some(id) => format!("Deposit {} credited to {} (invoice {})", amount, account_id, id),
                None => format!("Deposit {} credited to {}", amount, account_id),
            },
            LedgerEvent::WithdrawalApplied {
                account_id, amount, ..
            } => format!("Withdrawal {} debited from {}", amount, account_id),
            LedgerEvent::ExchangeApplied {
                account_id, from, to, ..
            } => format!("Exchange {} -> {} for {}", from, to, account_id),
            LedgerEvent::TradeOpened {
                trade_id,
                account_id,
                stake,
                duration_secs,
            } => format!(
                "Trade {} opened for {}: {} for {}s",
                trade_id, account_id, stake, duration_secs
            ),
            LedgerEvent::TradeSettled {
                trade_id,
                account_id,
                outcome,
                credited,
                ..
            } => format!(
                "Trade {} for {} closed ({}), credited {}",
                trade_id, account_id, outcome, credited
            ),
            LedgerEvent::TradeDegraded {
                trade_id,
                account_id,
                outcome,
                reason,
            } => format!(
                "Trade {} for {} closed ({}) WITHOUT credit: {}",
                trade_id, account_id, outcome, reason
            ),
        }
    }
}

/// Receiver of ledger events.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &LedgerEvent) -> Result<(), NotifyError>;
}

/// Notifier that writes events to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &LedgerEvent) -> Result<(), NotifyError> {
        info!(event = event.kind(), message = %event.message(), "Ledger event");
        Ok(())
    }
}

/// Notifier that posts events to Telegram chats through the Bot API.
pub struct TelegramNotifier {
    client: reqwest::Client,
    endpoint: String,
    chat_ids: Vec<String>,
}

impl TelegramNotifier {
    /// Create a notifier for a bot token and its target chats.
    pub fn new(
        api_base: &str,
        token: &str,
        chat_ids: Vec<String>,
        timeout: Duration,
    ) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/bot{}/sendMessage", api_base.trim_end_matches('/'), token),
            chat_ids,
        })
    }

    /// Build from configuration; `None` when no token is configured.
    pub fn from_config(config: &NotifierConfig) -> Result<Option<Self>, NotifyError> {
        match &config.telegram_bot_token {
            Some(token) => Self::new(
                &config.telegram_api_base,
                token,
                config.telegram_chat_ids.clone(),
                config.timeout,
            )
            .map(Some),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, event: &LedgerEvent) -> Result<(), NotifyError> {
        let text = event.message();
        for chat_id in &self.chat_ids {
            let response = self
                .client
                .post(&self.endpoint)
                .json(&json!({
                    "chat_id": chat_id,
                    "text": text,
                }))
                .send()
                .await?;

            if !response.status().is_success() {
                let status = response.status().as_u16();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".to_string());
                return Err(NotifyError::Rejected { status, body });
            }
        }
        Ok(())
    }
}

/// Delivers events to the configured notifier without failing callers.
pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
    metrics: SharedMetrics,
}

impl NotificationDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, metrics: SharedMetrics) -> Self {
        Self { notifier, metrics }
    }

    pub async fn dispatch(&self, event: LedgerEvent) {
        match self.notifier.notify(&event).await {
            Ok(()) => self.metrics.notification_sent(),
            Err(e) => {
                self.metrics.notification_failed();
                warn!(event = event.kind(), error = %e, "Notification failed");
            }
        }
    }
}
