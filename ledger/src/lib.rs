//! AtomicLedger Ledger Engine
//!
//! Per-account balance fields mutated exactly once under concurrent access.
//! Every money-moving operation goes through [`MutationEngine`], which
//! prefers the store's atomic primitive and falls back to bounded
//! optimistic compare-and-swap.

pub mod balance;
pub mod store;
pub mod memory;
pub mod postgres;
pub mod journal;
pub mod engine;
pub mod operations;

pub use balance::{AccountBalance, BalanceDelta, Balances, DeltaError};
pub use store::{AtomicOutcome, Claim, ClaimResult, LedgerStore, Mutation, StoreError, StoreResult};
pub use memory::InMemoryStore;
pub use postgres::PgStore;
pub use journal::{EntryStatus, JournalEntry, JournalSink, MemoryJournal, OperationKind, TracingJournal};
pub use engine::{
    AppliedMutation, EngineConfig, EngineStats, EngineStatsSnapshot, MutationEngine,
    MutationOutcome, MutationPath,
};
pub use operations::{LedgerOperations, LedgerReceipt};
