//! AtomicLedger Coordinator
//!
//! The ledger service: exposes deposits, withdrawals, exchanges, invoice
//! settlement and trades over HTTP, and settles due trades in the
//! background.

pub mod api;
pub mod coordinator;
pub mod config;
pub mod metrics;
pub mod notifier;
pub mod settlement_worker;
pub mod state;
pub mod trade_manager;

pub use api::create_router;
pub use coordinator::Coordinator;
pub use config::CoordinatorConfig;
pub use notifier::{LogNotifier, Notifier, TelegramNotifier};
pub use trade_manager::{SettlementResult, TradeManager};
