//! Ledger store accessor.
//!
//! The store is the only shared mutable resource. Correctness relies on
//! its conditional writes, never on process-local locks, so several
//! service replicas can share one store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use atomicledger_common::{
    AccountId, Currency, ForcedOutcome, Invoice, InvoiceId, LedgerError, Money, Reference, Trade,
    TradeId, TradeOutcome, WithdrawId, WithdrawRequest,
};

use crate::balance::{AccountBalance, BalanceDelta, Balances};
use crate::journal::OperationKind;

/// Errors raised by store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("record not found: {0}")]
    RecordNotFound(Reference),

    /// The backend has no atomic mutation primitive.
    #[error("atomic mutation primitive unavailable")]
    Unsupported,

    #[error("account {0} already has an active trade")]
    ActiveTradeExists(AccountId),

    #[error("duplicate record: {0}")]
    Duplicate(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store error: {0}")]
    Backend(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AccountNotFound(id) => LedgerError::AccountNotFound(id),
            StoreError::RecordNotFound(reference) => LedgerError::RecordNotFound(reference),
            StoreError::ActiveTradeExists(id) => LedgerError::ActiveTradeExists(id),
            StoreError::Duplicate(what) => LedgerError::invalid("id", format!("duplicate {}", what)),
            StoreError::Database(e) => LedgerError::DatabaseError(e.to_string()),
            other @ (StoreError::Unsupported | StoreError::Backend(_)) => {
                LedgerError::InternalError(other.to_string())
            }
        }
    }
}

/// The record finalized together with a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// Flip `invoice.done` false→true.
    Invoice(InvoiceId),
    /// Flip `withdraw.done` false→true.
    Withdraw(WithdrawId),
    /// Close an active trade with its outcome.
    Trade { id: TradeId, outcome: TradeOutcome },
}

impl Claim {
    pub fn reference(&self) -> Reference {
        match self {
            Claim::Invoice(id) => Reference::Invoice(id.clone()),
            Claim::Withdraw(id) => Reference::Withdraw(id.clone()),
            Claim::Trade { id, .. } => Reference::Trade(*id),
        }
    }
}

/// Result of trying to finalize a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimResult {
    /// This caller flipped the flag.
    Claimed,
    /// The record was already finalized.
    AlreadyFinal,
}

/// A balance mutation request.
#[derive(Debug, Clone)]
pub struct Mutation {
    pub account_id: AccountId,
    pub kind: OperationKind,
    /// Primary amount, for the journal.
    pub amount: Money,
    pub delta: BalanceDelta,
    pub claim: Option<Claim>,
    /// Create the account row on first observation.
    pub create_account: bool,
}

impl Mutation {
    pub fn new(account_id: AccountId, kind: OperationKind, amount: Money, delta: BalanceDelta) -> Self {
        Self {
            account_id,
            kind,
            amount,
            delta,
            claim: None,
            create_account: false,
        }
    }

    pub fn with_claim(mut self, claim: Claim) -> Self {
        self.claim = Some(claim);
        self
    }

    pub fn creating_account(mut self) -> Self {
        self.create_account = true;
        self
    }

    pub fn reference(&self) -> Option<Reference> {
        self.claim.as_ref().map(Claim::reference)
    }
}

/// Result of the store's atomic primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtomicOutcome {
    /// Claim finalized and delta written in one step.
    Applied { before: Balances, after: Balances },
    /// The claim was already finalized; nothing written.
    AlreadyFinal,
    /// A guarded field would go negative; nothing written.
    Insufficient { currency: Currency, available: i64 },
}

/// Point reads and conditional writes over balances, trades and pending
/// requests.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    // --- balances ---

    /// Read an account row.
    async fn load_balances(&self, account_id: &AccountId) -> StoreResult<Option<AccountBalance>>;

    /// Read an account row, creating a zero row if absent.
    async fn ensure_account(&self, account_id: &AccountId) -> StoreResult<AccountBalance>;

    /// Write `next` on the listed fields only if they still equal
    /// `expected`. Returns false when zero rows matched.
    async fn compare_and_set(
        &self,
        account_id: &AccountId,
        fields: &[Currency],
        expected: &Balances,
        next: &Balances,
    ) -> StoreResult<bool>;

    /// Read, validate, finalize the claim and write in one indivisible
    /// step. Backends without such a primitive return `Unsupported`.
    async fn apply_atomic(&self, mutation: &Mutation) -> StoreResult<AtomicOutcome>;

    /// Forced-outcome preference of an account.
    async fn forced_outcome(&self, account_id: &AccountId) -> StoreResult<ForcedOutcome>;

    async fn set_forced_outcome(
        &self,
        account_id: &AccountId,
        outcome: ForcedOutcome,
    ) -> StoreResult<()>;

    // --- claims ---

    /// Conditionally finalize the claimed record.
    async fn claim(&self, claim: &Claim) -> StoreResult<ClaimResult>;

    /// Undo an invoice or withdrawal claim (done true→false).
    async fn release(&self, claim: &Claim) -> StoreResult<()>;

    // --- trades ---

    /// Insert a trade unless the account already has an active one.
    async fn insert_trade(&self, trade: &Trade) -> StoreResult<()>;

    async fn get_trade(&self, id: &TradeId) -> StoreResult<Option<Trade>>;

    async fn active_trade(&self, account_id: &AccountId) -> StoreResult<Option<Trade>>;

    /// Active trades whose `settle_at` has passed, oldest first.
    async fn due_trades(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Trade>>;

    /// Close an active trade without touching balances and flag it for
    /// reconciliation. Returns false if it was already closed.
    async fn force_close_trade(&self, id: &TradeId, outcome: TradeOutcome) -> StoreResult<bool>;

    /// Flag a closed trade whose payout was not applied.
    async fn mark_trade_degraded(&self, id: &TradeId) -> StoreResult<()>;

    // --- pending requests ---

    async fn insert_invoice(&self, invoice: &Invoice) -> StoreResult<()>;

    async fn get_invoice(&self, id: &InvoiceId) -> StoreResult<Option<Invoice>>;

    async fn insert_withdraw(&self, request: &WithdrawRequest) -> StoreResult<()>;

    async fn get_withdraw(&self, id: &WithdrawId) -> StoreResult<Option<WithdrawRequest>>;
}
