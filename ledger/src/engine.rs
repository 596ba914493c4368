//! Atomic mutation engine.
//!
//! Applies a [`Mutation`] exactly once despite concurrent writers on the
//! same account. The store's atomic primitive is tried first; when it is
//! unavailable or fails, the engine falls back to optimistic concurrency
//! control: read, compute, conditional write, re-read. Losing the
//! conditional write is a conflict, retried with linear backoff up to a
//! fixed budget, after which the conflict is returned to the caller.
//! There is no unconditional-overwrite tier.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use atomicledger_common::{constants, DurationExt, LedgerError, Result};

use crate::balance::{Balances, DeltaError};
use crate::journal::{EntryStatus, JournalEntry, JournalSink};
use crate::store::{AtomicOutcome, Claim, ClaimResult, LedgerStore, Mutation, StoreError};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Conditional-write attempts per mutation.
    pub max_attempts: u32,
    /// Backoff before attempt `n + 1` is `backoff_base * n`.
    pub backoff_base: Duration,
    /// Try the store's atomic primitive first.
    pub use_atomic_path: bool,
    /// Upper bound on one journal append.
    pub journal_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: constants::MAX_MUTATION_ATTEMPTS,
            backoff_base: constants::mutation_backoff_base().as_std(),
            use_atomic_path: true,
            journal_timeout: constants::journal_append_timeout().as_std(),
        }
    }
}

/// Which protocol applied the mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPath {
    Atomic,
    Optimistic,
}

impl MutationPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationPath::Atomic => "atomic",
            MutationPath::Optimistic => "optimistic",
        }
    }
}

/// A mutation that was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMutation {
    pub before: Balances,
    pub after: Balances,
    pub path: MutationPath,
    pub attempts: u32,
    /// The read-back after the write matched the written value.
    pub verified: bool,
}

/// Successful outcome of a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    Applied(AppliedMutation),
    /// The correlated record was already finalized; nothing written.
    AlreadySettled,
}

/// Counters exported by the service metrics endpoint.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub applied: AtomicU64,
    pub already_settled: AtomicU64,
    pub rejected: AtomicU64,
    pub conflicts: AtomicU64,
    pub retries: AtomicU64,
    pub fallbacks: AtomicU64,
    pub failures: AtomicU64,
    pub journal_failures: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStatsSnapshot {
    pub applied: u64,
    pub already_settled: u64,
    pub rejected: u64,
    pub conflicts: u64,
    pub retries: u64,
    pub fallbacks: u64,
    pub failures: u64,
    pub journal_failures: u64,
}

impl EngineStats {
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            applied: self.applied.load(Ordering::Relaxed),
            already_settled: self.already_settled.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            journal_failures: self.journal_failures.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// The mutation engine. Shared via `Arc`; holds no locks.
pub struct MutationEngine {
    store: Arc<dyn LedgerStore>,
    journal: Arc<dyn JournalSink>,
    config: EngineConfig,
    stats: EngineStats,
}

impl MutationEngine {
    /// Create a new engine.
    pub fn new(
        store: Arc<dyn LedgerStore>,
        journal: Arc<dyn JournalSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            journal,
            config,
            stats: EngineStats::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Apply a mutation exactly once.
    #[instrument(skip(self, mutation), fields(account = %mutation.account_id, operation = mutation.kind.as_str()))]
    pub async fn apply(&self, mutation: Mutation) -> Result<MutationOutcome> {
        if !mutation.account_id.is_valid() {
            return self
                .reject(&mutation, LedgerError::invalid("account_id", "malformed account id"))
                .await;
        }
        if mutation.delta.is_empty() {
            return self
                .reject(&mutation, LedgerError::invalid("amount", "mutation changes nothing"))
                .await;
        }

        if self.config.use_atomic_path {
            match self.store.apply_atomic(&mutation).await {
                Ok(AtomicOutcome::Applied { before, after }) => {
                    let applied = AppliedMutation {
                        before,
                        after,
                        path: MutationPath::Atomic,
                        attempts: 1,
                        verified: true,
                    };
                    return Ok(self.finish_applied(&mutation, applied).await);
                }
                Ok(AtomicOutcome::AlreadyFinal) => {
                    return Ok(self.finish_already_settled(&mutation).await);
                }
                Ok(AtomicOutcome::Insufficient { currency, available }) => {
                    let err = DeltaError::Insufficient {
                        currency,
                        required: -mutation.delta.net(currency),
                        available,
                    };
                    return self.reject(&mutation, delta_error(err)).await;
                }
                Err(e @ (StoreError::AccountNotFound(_) | StoreError::RecordNotFound(_))) => {
                    return self.reject(&mutation, e.into()).await;
                }
                Err(StoreError::Unsupported) => {
                    debug!("Atomic primitive unavailable, using optimistic path");
                }
                Err(e) => {
                    warn!(error = %e, "Atomic mutation failed, falling back to optimistic path");
                }
            }
            bump(&self.stats.fallbacks);
        }

        self.apply_optimistic(mutation).await
    }

    async fn apply_optimistic(&self, mutation: Mutation) -> Result<MutationOutcome> {
        if let Some(claim) = &mutation.claim {
            match self.store.claim(claim).await {
                Ok(ClaimResult::Claimed) => {}
                Ok(ClaimResult::AlreadyFinal) => {
                    return Ok(self.finish_already_settled(&mutation).await);
                }
                Err(e) => return self.fail(&mutation, e.into(), 0).await,
            }
        }

        match self.compare_and_swap(&mutation).await {
            Ok(applied) => Ok(self.finish_applied(&mutation, applied).await),
            Err((err, attempts)) => {
                if let Some(claim) = &mutation.claim {
                    self.undo_claim(claim).await;
                }
                match err {
                    LedgerError::Validation { .. } | LedgerError::InsufficientBalance { .. } => {
                        self.reject(&mutation, err).await
                    }
                    _ => self.fail(&mutation, err, attempts).await,
                }
            }
        }
    }

    /// Bounded read / compute / conditional-write loop.
    async fn compare_and_swap(
        &self,
        mutation: &Mutation,
    ) -> std::result::Result<AppliedMutation, (LedgerError, u32)> {
        let fields = mutation.delta.touched();
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let row = if mutation.create_account {
                self.store.ensure_account(&mutation.account_id).await
            } else {
                self.store
                    .load_balances(&mutation.account_id)
                    .await
                    .and_then(|row| {
                        row.ok_or_else(|| StoreError::AccountNotFound(mutation.account_id.clone()))
                    })
            }
            .map_err(|e| (LedgerError::from(e), attempt))?;

            let before = row.balances;
            let after = mutation
                .delta
                .apply(&before)
                .map_err(|e| (delta_error(e), attempt))?;

            let written = self
                .store
                .compare_and_set(&mutation.account_id, &fields, &before, &after)
                .await
                .map_err(|e| (LedgerError::from(e), attempt))?;

            if written {
                let verified = self.verify(mutation, &fields, &after).await;
                return Ok(AppliedMutation {
                    before,
                    after,
                    path: MutationPath::Optimistic,
                    attempts: attempt,
                    verified,
                });
            }

            bump(&self.stats.conflicts);
            debug!(attempt, max_attempts, "Conditional write lost a race");

            if attempt < max_attempts {
                bump(&self.stats.retries);
                tokio::time::sleep(self.config.backoff_base * attempt).await;
            }
        }

        Err((
            LedgerError::Conflict {
                account: mutation.account_id.clone(),
                attempts: max_attempts,
            },
            max_attempts,
        ))
    }

    /// Re-read after a successful conditional write. A mismatch means a later
    /// writer already moved the row; our write stands and is not repeated.
    async fn verify(&self, mutation: &Mutation, fields: &[atomicledger_common::Currency], written: &Balances) -> bool {
        match self.store.load_balances(&mutation.account_id).await {
            Ok(Some(row)) if row.balances.matches_on(written, fields) => true,
            Ok(row) => {
                warn!(
                    expected = ?written,
                    observed = ?row.map(|r| r.balances),
                    "Balance moved after conditional write"
                );
                false
            }
            Err(e) => {
                warn!(error = %e, "Could not verify balance after write");
                false
            }
        }
    }

    async fn undo_claim(&self, claim: &Claim) {
        let result = match claim {
            Claim::Trade { id, .. } => self.store.mark_trade_degraded(id).await,
            _ => self.store.release(claim).await,
        };
        if let Err(e) = result {
            warn!(reference = %claim.reference(), error = %e, "Failed to undo claim");
        }
    }

    async fn finish_applied(&self, mutation: &Mutation, applied: AppliedMutation) -> MutationOutcome {
        bump(&self.stats.applied);
        info!(
            amount = %mutation.amount,
            path = applied.path.as_str(),
            attempts = applied.attempts,
            "Mutation applied"
        );
        let entry = self
            .entry(mutation, EntryStatus::Applied)
            .with_balances(applied.before, applied.after)
            .with_path(applied.path.as_str(), applied.attempts);
        self.record(entry).await;
        MutationOutcome::Applied(applied)
    }

    async fn finish_already_settled(&self, mutation: &Mutation) -> MutationOutcome {
        bump(&self.stats.already_settled);
        info!(reference = ?mutation.reference().map(|r| r.to_string()), "Already settled, nothing applied");
        self.record(self.entry(mutation, EntryStatus::AlreadySettled)).await;
        MutationOutcome::AlreadySettled
    }

    async fn reject(&self, mutation: &Mutation, err: LedgerError) -> Result<MutationOutcome> {
        bump(&self.stats.rejected);
        info!(error = %err, "Mutation rejected");
        self.record(
            self.entry(mutation, EntryStatus::Rejected)
                .with_details(err.to_string()),
        )
        .await;
        Err(err)
    }

    async fn fail(&self, mutation: &Mutation, err: LedgerError, attempts: u32) -> Result<MutationOutcome> {
        let status = if matches!(err, LedgerError::Conflict { .. }) {
            EntryStatus::Conflict
        } else if err.is_not_found() {
            EntryStatus::Rejected
        } else {
            bump(&self.stats.failures);
            EntryStatus::Failed
        };
        warn!(error = %err, attempts, "Mutation failed");
        self.record(
            self.entry(mutation, status)
                .with_path(MutationPath::Optimistic.as_str(), attempts)
                .with_details(err.to_string()),
        )
        .await;
        Err(err)
    }

    fn entry(&self, mutation: &Mutation, status: EntryStatus) -> JournalEntry {
        JournalEntry::new(
            mutation.kind,
            mutation.account_id.clone(),
            mutation.amount,
            mutation.reference(),
            status,
        )
    }

    /// Best-effort journal append bounded by `journal_timeout`; never fails
    /// the caller.
    pub async fn record(&self, entry: JournalEntry) {
        match tokio::time::timeout(self.config.journal_timeout, self.journal.append(&entry)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                bump(&self.stats.journal_failures);
                warn!(entry_id = %entry.id, error = %e, "Journal append failed");
            }
            Err(_) => {
                bump(&self.stats.journal_failures);
                warn!(entry_id = %entry.id, "Journal append timed out");
            }
        }
    }
}

fn delta_error(err: DeltaError) -> LedgerError {
    match err {
        DeltaError::Insufficient {
            currency,
            required,
            available,
        } => LedgerError::InsufficientBalance {
            required: atomicledger_common::Money::from_units(required, currency).to_string(),
            available: atomicledger_common::Money::from_units(available, currency).to_string(),
        },
        DeltaError::Overflow(_) => LedgerError::invalid("amount", err.to_string()),
    }
}
