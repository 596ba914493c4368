//! PostgreSQL ledger store.
//!
//! Conditional writes are single `UPDATE ... WHERE` statements whose row
//! count decides the race. The atomic path calls the `ledger_apply_delta`
//! stored function created by the bundled migration.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Executor, Row};
use tracing::info;

use atomicledger_common::{
    AccountId, Currency, ForcedOutcome, Invoice, InvoiceId, Money, Reference, Trade, TradeId,
    TradeOutcome, WithdrawId, WithdrawRequest,
};

use crate::balance::{AccountBalance, Balances};
use crate::journal::{JournalEntry, JournalSink};
use crate::store::{
    AtomicOutcome, Claim, ClaimResult, LedgerStore, Mutation, StoreError, StoreResult,
};

const MIGRATION_SQL: &str = include_str!("../migrations/0001_ledger.sql");

/// `undefined_function`
const UNDEFINED_FUNCTION: &str = "42883";
/// `unique_violation`
const UNIQUE_VIOLATION: &str = "23505";
/// Partial unique index allowing one active trade per account.
const ONE_ACTIVE_TRADE: &str = "trades_one_active";

const TRADE_COLUMNS: &str = "trade_id, account_id, currency, stake, duration_secs, is_active, \
     is_win, forced_outcome, degraded, created_at, settle_at, closed_at";

/// Ledger store backed by a PostgreSQL pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect a new pool.
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables, indexes and the atomic mutation function.
    pub async fn migrate(&self) -> StoreResult<()> {
        self.pool.execute(MIGRATION_SQL).await?;
        info!("Ledger schema migrated");
        Ok(())
    }

    async fn trade_exists(&self, id: &TradeId) -> StoreResult<bool> {
        let row = sqlx::query("SELECT 1 FROM trades WHERE trade_id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Resolve a lost claim: the record is either final or missing.
    async fn claim_lost(&self, claim: &Claim) -> StoreResult<ClaimResult> {
        let exists = match claim {
            Claim::Invoice(id) => sqlx::query("SELECT 1 FROM invoices WHERE invoice_id = $1")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?
                .is_some(),
            Claim::Withdraw(id) => sqlx::query("SELECT 1 FROM withdrawals WHERE withdraw_id = $1")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?
                .is_some(),
            Claim::Trade { id, .. } => self.trade_exists(id).await?,
        };
        if exists {
            Ok(ClaimResult::AlreadyFinal)
        } else {
            Err(StoreError::RecordNotFound(claim.reference()))
        }
    }
}

/// Conditional update over the listed balance columns.
///
/// `$1` is the account id, then one new value per field, then one expected
/// value per field.
fn cas_statement(fields: &[Currency]) -> String {
    let mut sql = String::from("UPDATE accounts SET updated_at = now()");
    for (i, currency) in fields.iter().enumerate() {
        sql.push_str(&format!(", {} = ${}", currency.column(), i + 2));
    }
    sql.push_str(" WHERE account_id = $1");
    for (i, currency) in fields.iter().enumerate() {
        sql.push_str(&format!(
            " AND {} = ${}",
            currency.column(),
            i + 2 + fields.len()
        ));
    }
    sql
}

/// Map the status row returned by `ledger_apply_delta`.
fn decode_atomic(
    mutation: &Mutation,
    status: &str,
    before: Option<Balances>,
    after: Option<Balances>,
) -> StoreResult<AtomicOutcome> {
    match (status, before, after) {
        ("applied", Some(before), Some(after)) => Ok(AtomicOutcome::Applied { before, after }),
        ("already_final", _, _) => Ok(AtomicOutcome::AlreadyFinal),
        ("insufficient_rub", Some(before), _) => Ok(AtomicOutcome::Insufficient {
            currency: Currency::Rub,
            available: before.rub,
        }),
        ("insufficient_usdt", Some(before), _) => Ok(AtomicOutcome::Insufficient {
            currency: Currency::Usdt,
            available: before.usdt,
        }),
        ("account_not_found", _, _) => Err(StoreError::AccountNotFound(mutation.account_id.clone())),
        ("record_not_found", _, _) => match mutation.reference() {
            Some(reference) => Err(StoreError::RecordNotFound(reference)),
            None => Err(StoreError::Backend("record_not_found without a claim".into())),
        },
        (other, _, _) => Err(StoreError::Backend(format!(
            "unexpected ledger_apply_delta status: {}",
            other
        ))),
    }
}

/// What a failed statement means to the ledger.
#[derive(Debug, PartialEq, Eq)]
enum DbFailure {
    /// `ledger_apply_delta` is not installed.
    MissingFunction,
    /// A unique index rejected the row.
    UniqueViolation(String),
    Other,
}

fn classify(code: Option<&str>, constraint: Option<&str>) -> DbFailure {
    match code {
        Some(UNDEFINED_FUNCTION) => DbFailure::MissingFunction,
        Some(UNIQUE_VIOLATION) => DbFailure::UniqueViolation(constraint.unwrap_or_default().to_string()),
        _ => DbFailure::Other,
    }
}

fn db_failure(err: &sqlx::Error) -> DbFailure {
    match err {
        sqlx::Error::Database(db) => classify(db.code().as_deref(), db.constraint()),
        _ => DbFailure::Other,
    }
}

/// Map an atomic-path failure; a missing function sends the engine to
/// compare-and-swap.
fn atomic_error(err: sqlx::Error) -> StoreError {
    atomic_failure(db_failure(&err)).unwrap_or_else(|| err.into())
}

fn atomic_failure(failure: DbFailure) -> Option<StoreError> {
    match failure {
        DbFailure::MissingFunction => Some(StoreError::Unsupported),
        _ => None,
    }
}

/// Map a failed insert; `one_active` names the account whose active-trade
/// index may have fired.
fn insert_error(err: sqlx::Error, record: String, one_active: Option<&AccountId>) -> StoreError {
    insert_failure(db_failure(&err), record, one_active).unwrap_or_else(|| err.into())
}

fn insert_failure(
    failure: DbFailure,
    record: String,
    one_active: Option<&AccountId>,
) -> Option<StoreError> {
    match (failure, one_active) {
        (DbFailure::UniqueViolation(constraint), Some(account_id))
            if constraint == ONE_ACTIVE_TRADE =>
        {
            Some(StoreError::ActiveTradeExists(account_id.clone()))
        }
        (DbFailure::UniqueViolation(_), _) => Some(StoreError::Duplicate(record)),
        _ => None,
    }
}

fn decode_currency(value: &str) -> StoreResult<Currency> {
    value
        .parse()
        .map_err(|e: atomicledger_common::AmountError| StoreError::Backend(e.to_string()))
}

fn decode_forced(value: &str) -> StoreResult<ForcedOutcome> {
    value.parse().map_err(StoreError::Backend)
}

fn balance_from_row(row: &PgRow) -> StoreResult<AccountBalance> {
    Ok(AccountBalance {
        account_id: AccountId::new(row.try_get::<String, _>("account_id")?),
        balances: Balances::new(row.try_get("balance_rub")?, row.try_get("balance_usdt")?),
        updated_at: row.try_get("updated_at")?,
    })
}

fn trade_from_row(row: &PgRow) -> StoreResult<Trade> {
    let currency = decode_currency(&row.try_get::<String, _>("currency")?)?;
    Ok(Trade {
        id: TradeId::from_uuid(row.try_get("trade_id")?),
        account_id: AccountId::new(row.try_get::<String, _>("account_id")?),
        stake: Money::from_units(row.try_get("stake")?, currency),
        duration_secs: row.try_get("duration_secs")?,
        is_active: row.try_get("is_active")?,
        is_win: row.try_get("is_win")?,
        forced_outcome: decode_forced(&row.try_get::<String, _>("forced_outcome")?)?,
        created_at: row.try_get("created_at")?,
        settle_at: row.try_get("settle_at")?,
        closed_at: row.try_get("closed_at")?,
        degraded: row.try_get("degraded")?,
    })
}

fn request_parts(row: &PgRow) -> StoreResult<(AccountId, Money, bool, DateTime<Utc>)> {
    let currency = decode_currency(&row.try_get::<String, _>("currency")?)?;
    Ok((
        AccountId::new(row.try_get::<String, _>("account_id")?),
        Money::from_units(row.try_get("amount")?, currency),
        row.try_get("done")?,
        row.try_get("created_at")?,
    ))
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn load_balances(&self, account_id: &AccountId) -> StoreResult<Option<AccountBalance>> {
        let row = sqlx::query(
            "SELECT account_id, balance_rub, balance_usdt, updated_at FROM accounts WHERE account_id = $1",
        )
        .bind(account_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(balance_from_row).transpose()
    }

    async fn ensure_account(&self, account_id: &AccountId) -> StoreResult<AccountBalance> {
        sqlx::query("INSERT INTO accounts (account_id) VALUES ($1) ON CONFLICT (account_id) DO NOTHING")
            .bind(account_id.as_str())
            .execute(&self.pool)
            .await?;
        self.load_balances(account_id)
            .await?
            .ok_or_else(|| StoreError::AccountNotFound(account_id.clone()))
    }

    async fn compare_and_set(
        &self,
        account_id: &AccountId,
        fields: &[Currency],
        expected: &Balances,
        next: &Balances,
    ) -> StoreResult<bool> {
        let sql = cas_statement(fields);
        let mut query = sqlx::query(&sql).bind(account_id.as_str());
        for currency in fields {
            query = query.bind(next.get(*currency));
        }
        for currency in fields {
            query = query.bind(expected.get(*currency));
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn apply_atomic(&self, mutation: &Mutation) -> StoreResult<AtomicOutcome> {
        let (ref_kind, ref_id, is_win) = match &mutation.claim {
            None => (None, None, None),
            Some(Claim::Invoice(id)) => (Some("invoice"), Some(id.to_string()), None),
            Some(Claim::Withdraw(id)) => (Some("withdraw"), Some(id.to_string()), None),
            Some(Claim::Trade { id, outcome }) => {
                (Some("trade"), Some(id.to_string()), Some(outcome.is_win()))
            }
        };

        let result = sqlx::query(
            "SELECT status, rub_before, usdt_before, rub_after, usdt_after \
             FROM ledger_apply_delta($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(mutation.account_id.as_str())
        .bind(mutation.delta.net(Currency::Rub))
        .bind(mutation.delta.net(Currency::Usdt))
        .bind(mutation.delta.is_guarded(Currency::Rub))
        .bind(mutation.delta.is_guarded(Currency::Usdt))
        .bind(mutation.create_account)
        .bind(ref_kind)
        .bind(ref_id)
        .bind(is_win)
        .fetch_one(&self.pool)
        .await;

        let row = result.map_err(atomic_error)?;

        let status: String = row.try_get("status")?;
        let pair = |rub: &str, usdt: &str| -> StoreResult<Option<Balances>> {
            let rub: Option<i64> = row.try_get(rub)?;
            let usdt: Option<i64> = row.try_get(usdt)?;
            Ok(rub.zip(usdt).map(|(r, u)| Balances::new(r, u)))
        };
        let before = pair("rub_before", "usdt_before")?;
        let after = pair("rub_after", "usdt_after")?;
        decode_atomic(mutation, &status, before, after)
    }

    async fn forced_outcome(&self, account_id: &AccountId) -> StoreResult<ForcedOutcome> {
        let row = sqlx::query("SELECT forced_outcome FROM accounts WHERE account_id = $1")
            .bind(account_id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::AccountNotFound(account_id.clone()))?;
        decode_forced(&row.try_get::<String, _>("forced_outcome")?)
    }

    async fn set_forced_outcome(
        &self,
        account_id: &AccountId,
        outcome: ForcedOutcome,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO accounts (account_id, forced_outcome) VALUES ($1, $2) \
             ON CONFLICT (account_id) DO UPDATE SET forced_outcome = EXCLUDED.forced_outcome",
        )
        .bind(account_id.as_str())
        .bind(outcome.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim(&self, claim: &Claim) -> StoreResult<ClaimResult> {
        let result = match claim {
            Claim::Invoice(id) => {
                sqlx::query("UPDATE invoices SET done = TRUE WHERE invoice_id = $1 AND NOT done")
                    .bind(id.as_str())
                    .execute(&self.pool)
                    .await?
            }
            Claim::Withdraw(id) => {
                sqlx::query("UPDATE withdrawals SET done = TRUE WHERE withdraw_id = $1 AND NOT done")
                    .bind(id.as_str())
                    .execute(&self.pool)
                    .await?
            }
            Claim::Trade { id, outcome } => {
                sqlx::query(
                    "UPDATE trades SET is_active = FALSE, is_win = $2, closed_at = now() \
                     WHERE trade_id = $1 AND is_active",
                )
                .bind(id.as_uuid())
                .bind(outcome.is_win())
                .execute(&self.pool)
                .await?
            }
        };

        if result.rows_affected() == 1 {
            Ok(ClaimResult::Claimed)
        } else {
            self.claim_lost(claim).await
        }
    }

    async fn release(&self, claim: &Claim) -> StoreResult<()> {
        match claim {
            Claim::Invoice(id) => {
                sqlx::query("UPDATE invoices SET done = FALSE WHERE invoice_id = $1")
                    .bind(id.as_str())
                    .execute(&self.pool)
                    .await?;
            }
            Claim::Withdraw(id) => {
                sqlx::query("UPDATE withdrawals SET done = FALSE WHERE withdraw_id = $1")
                    .bind(id.as_str())
                    .execute(&self.pool)
                    .await?;
            }
            Claim::Trade { .. } => {}
        }
        Ok(())
    }

    async fn insert_trade(&self, trade: &Trade) -> StoreResult<()> {
        let result = sqlx::query(&format!(
            "INSERT INTO trades ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            TRADE_COLUMNS
        ))
        .bind(trade.id.as_uuid())
        .bind(trade.account_id.as_str())
        .bind(trade.stake.currency.code())
        .bind(trade.stake.units)
        .bind(trade.duration_secs)
        .bind(trade.is_active)
        .bind(trade.is_win)
        .bind(trade.forced_outcome.as_str())
        .bind(trade.degraded)
        .bind(trade.created_at)
        .bind(trade.settle_at)
        .bind(trade.closed_at)
        .execute(&self.pool)
        .await;

        result
            .map(|_| ())
            .map_err(|e| insert_error(e, format!("trade {}", trade.id), Some(&trade.account_id)))
    }

    async fn get_trade(&self, id: &TradeId) -> StoreResult<Option<Trade>> {
        let row = sqlx::query(&format!("SELECT {} FROM trades WHERE trade_id = $1", TRADE_COLUMNS))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(trade_from_row).transpose()
    }

    async fn active_trade(&self, account_id: &AccountId) -> StoreResult<Option<Trade>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM trades WHERE account_id = $1 AND is_active",
            TRADE_COLUMNS
        ))
        .bind(account_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(trade_from_row).transpose()
    }

    async fn due_trades(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Trade>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM trades WHERE is_active AND settle_at <= $1 ORDER BY settle_at LIMIT $2",
            TRADE_COLUMNS
        ))
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(trade_from_row).collect()
    }

    async fn force_close_trade(&self, id: &TradeId, outcome: TradeOutcome) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE trades SET is_active = FALSE, is_win = $2, degraded = TRUE, closed_at = now() \
             WHERE trade_id = $1 AND is_active",
        )
        .bind(id.as_uuid())
        .bind(outcome.is_win())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.trade_exists(id).await? {
            Ok(false)
        } else {
            Err(StoreError::RecordNotFound(Reference::Trade(*id)))
        }
    }

    async fn mark_trade_degraded(&self, id: &TradeId) -> StoreResult<()> {
        sqlx::query("UPDATE trades SET degraded = TRUE WHERE trade_id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_invoice(&self, invoice: &Invoice) -> StoreResult<()> {
        let result = sqlx::query(
            "INSERT INTO invoices (invoice_id, account_id, currency, amount, done, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(invoice.id.as_str())
        .bind(invoice.account_id.as_str())
        .bind(invoice.amount.currency.code())
        .bind(invoice.amount.units)
        .bind(invoice.done)
        .bind(invoice.created_at)
        .execute(&self.pool)
        .await;

        result
            .map(|_| ())
            .map_err(|e| insert_error(e, format!("invoice {}", invoice.id), None))
    }

    async fn get_invoice(&self, id: &InvoiceId) -> StoreResult<Option<Invoice>> {
        let row = sqlx::query(
            "SELECT account_id, currency, amount, done, created_at FROM invoices WHERE invoice_id = $1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let (account_id, amount, done, created_at) = request_parts(&row)?;
        Ok(Some(Invoice {
            id: id.clone(),
            account_id,
            amount,
            done,
            created_at,
        }))
    }

    async fn insert_withdraw(&self, request: &WithdrawRequest) -> StoreResult<()> {
        let result = sqlx::query(
            "INSERT INTO withdrawals (withdraw_id, account_id, currency, amount, done, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(request.id.as_str())
        .bind(request.account_id.as_str())
        .bind(request.amount.currency.code())
        .bind(request.amount.units)
        .bind(request.done)
        .bind(request.created_at)
        .execute(&self.pool)
        .await;

        result
            .map(|_| ())
            .map_err(|e| insert_error(e, format!("withdraw {}", request.id), None))
    }

    async fn get_withdraw(&self, id: &WithdrawId) -> StoreResult<Option<WithdrawRequest>> {
        let row = sqlx::query(
            "SELECT account_id, currency, amount, done, created_at FROM withdrawals WHERE withdraw_id = $1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let (account_id, amount, done, created_at) = request_parts(&row)?;
        Ok(Some(WithdrawRequest {
            id: id.clone(),
            account_id,
            amount,
            done,
            created_at,
        }))
    }
}

#[async_trait]
impl JournalSink for PgStore {
    async fn append(&self, entry: &JournalEntry) -> StoreResult<()> {
        let before = entry.balance_before;
        let after = entry.balance_after;
        sqlx::query(
            "INSERT INTO ledger_transactions (entry_id, operation, account_id, currency, amount, \
             rub_before, usdt_before, rub_after, usdt_after, reference_kind, reference_id, \
             status, path, attempts, details, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
        )
        .bind(entry.id)
        .bind(entry.kind.as_str())
        .bind(entry.account_id.as_str())
        .bind(entry.amount.currency.code())
        .bind(entry.amount.units)
        .bind(before.map(|b| b.rub))
        .bind(before.map(|b| b.usdt))
        .bind(after.map(|b| b.rub))
        .bind(after.map(|b| b.usdt))
        .bind(entry.reference.as_ref().map(Reference::kind))
        .bind(entry.reference.as_ref().map(reference_id))
        .bind(entry.status.as_str())
        .bind(entry.path.as_deref())
        .bind(i32::try_from(entry.attempts).unwrap_or(i32::MAX))
        .bind(entry.details.as_deref())
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn reference_id(reference: &Reference) -> String {
    match reference {
        Reference::Invoice(id) => id.to_string(),
        Reference::Withdraw(id) => id.to_string(),
        Reference::Trade(id) => id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::balance::BalanceDelta;
    use crate::engine::{EngineConfig, MutationEngine, MutationOutcome, MutationPath};
    use crate::journal::OperationKind;

    /// Store on a private schema of the database named by `DATABASE_URL`.
    async fn create_test_store() -> PgStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        // One connection so the search path sticks
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await
            .unwrap();
        let schema = format!("ledger_test_{}", uuid::Uuid::new_v4().simple());
        pool.execute(format!("CREATE SCHEMA {0}; SET search_path TO {0}", schema).as_str())
            .await
            .unwrap();
        let store = PgStore::from_pool(pool);
        store.migrate().await.unwrap();
        store
    }

    fn rub(units: i64) -> Money {
        Money::from_units(units, Currency::Rub)
    }

    fn create_test_mutation(claim: Option<Claim>) -> Mutation {
        let amount = Money::from_units(100, Currency::Rub);
        let mutation = Mutation::new(
            AccountId::new("42"),
            OperationKind::Withdraw,
            amount,
            BalanceDelta::debit(amount),
        );
        match claim {
            Some(claim) => mutation.with_claim(claim),
            None => mutation,
        }
    }

    #[test]
    fn test_cas_statement_single_field() {
        assert_eq!(
            cas_statement(&[Currency::Usdt]),
            "UPDATE accounts SET updated_at = now(), balance_usdt = $2 \
             WHERE account_id = $1 AND balance_usdt = $3"
        );
    }

    #[test]
    fn test_cas_statement_both_fields() {
        assert_eq!(
            cas_statement(&Currency::ALL),
            "UPDATE accounts SET updated_at = now(), balance_rub = $2, balance_usdt = $3 \
             WHERE account_id = $1 AND balance_rub = $4 AND balance_usdt = $5"
        );
    }

    #[test]
    fn test_decode_atomic_statuses() {
        let mutation = create_test_mutation(Some(Claim::Withdraw(WithdrawId::new("w-9"))));
        let before = Balances::new(500, 0);
        let after = Balances::new(400, 0);

        assert_eq!(
            decode_atomic(&mutation, "applied", Some(before), Some(after)).unwrap(),
            AtomicOutcome::Applied { before, after }
        );
        assert_eq!(
            decode_atomic(&mutation, "already_final", None, None).unwrap(),
            AtomicOutcome::AlreadyFinal
        );
        assert_eq!(
            decode_atomic(&mutation, "insufficient_rub", Some(Balances::new(50, 0)), None).unwrap(),
            AtomicOutcome::Insufficient {
                currency: Currency::Rub,
                available: 50
            }
        );
        assert!(matches!(
            decode_atomic(&mutation, "record_not_found", None, None),
            Err(StoreError::RecordNotFound(Reference::Withdraw(_)))
        ));
        assert!(matches!(
            decode_atomic(&mutation, "account_not_found", None, None),
            Err(StoreError::AccountNotFound(_))
        ));
        assert!(matches!(
            decode_atomic(&mutation, "bogus", None, None),
            Err(StoreError::Backend(_))
        ));
    }

    #[test]
    fn test_migration_defines_atomic_function() {
        assert!(MIGRATION_SQL.contains("CREATE OR REPLACE FUNCTION ledger_apply_delta"));
        assert!(MIGRATION_SQL.contains(ONE_ACTIVE_TRADE));
    }

    #[test]
    fn test_sqlstate_classification() {
        assert_eq!(classify(Some("42883"), None), DbFailure::MissingFunction);
        assert_eq!(
            classify(Some("23505"), Some("invoices_pkey")),
            DbFailure::UniqueViolation("invoices_pkey".to_string())
        );
        assert_eq!(classify(Some("40001"), None), DbFailure::Other);
        assert_eq!(classify(None, None), DbFailure::Other);
    }

    #[test]
    fn test_missing_function_means_unsupported() {
        assert!(matches!(
            atomic_failure(DbFailure::MissingFunction),
            Some(StoreError::Unsupported)
        ));
        assert!(atomic_failure(DbFailure::UniqueViolation("x".to_string())).is_none());
        assert!(matches!(
            atomic_error(sqlx::Error::RowNotFound),
            StoreError::Database(_)
        ));
    }

    #[test]
    fn test_unique_violation_mapping() {
        let account = AccountId::new("42");

        assert!(matches!(
            insert_failure(
                DbFailure::UniqueViolation(ONE_ACTIVE_TRADE.to_string()),
                "trade t-1".to_string(),
                Some(&account)
            ),
            Some(StoreError::ActiveTradeExists(id)) if id == account
        ));
        assert!(matches!(
            insert_failure(
                DbFailure::UniqueViolation("trades_pkey".to_string()),
                "trade t-1".to_string(),
                Some(&account)
            ),
            Some(StoreError::Duplicate(record)) if record == "trade t-1"
        ));
        assert!(matches!(
            insert_failure(
                DbFailure::UniqueViolation("invoices_pkey".to_string()),
                "invoice i-1".to_string(),
                None
            ),
            Some(StoreError::Duplicate(_))
        ));
        assert!(insert_failure(DbFailure::Other, "invoice i-1".to_string(), None).is_none());
        assert!(matches!(
            insert_error(sqlx::Error::RowNotFound, "invoice i-1".to_string(), None),
            StoreError::Database(_)
        ));
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_pg_compare_and_set_detects_stale_read() {
        let store = create_test_store().await;
        let account = AccountId::new("1001");

        let row = store.ensure_account(&account).await.unwrap();
        assert_eq!(row.balances, Balances::default());

        let next = Balances::new(500, 0);
        assert!(store
            .compare_and_set(&account, &[Currency::Rub], &row.balances, &next)
            .await
            .unwrap());
        // Zero rows match the stale snapshot
        assert!(!store
            .compare_and_set(&account, &[Currency::Rub], &row.balances, &Balances::new(900, 0))
            .await
            .unwrap());

        let stored = store.load_balances(&account).await.unwrap().unwrap();
        assert_eq!(stored.balances, next);
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_pg_atomic_path_then_fallback() {
        let store = Arc::new(create_test_store().await);
        let account = AccountId::new("1002");
        let mutation = Mutation::new(
            account.clone(),
            OperationKind::Deposit,
            rub(2_500),
            BalanceDelta::credit(rub(2_500)),
        )
        .creating_account();

        assert!(matches!(
            store.apply_atomic(&mutation).await.unwrap(),
            AtomicOutcome::Applied { after, .. } if after.rub == 2_500
        ));

        store
            .pool()
            .execute("DROP FUNCTION ledger_apply_delta")
            .await
            .unwrap();
        assert!(matches!(
            store.apply_atomic(&mutation).await,
            Err(StoreError::Unsupported)
        ));

        let engine = MutationEngine::new(store.clone(), store.clone(), EngineConfig::default());
        match engine.apply(mutation).await.unwrap() {
            MutationOutcome::Applied(applied) => {
                assert_eq!(applied.path, MutationPath::Optimistic);
                assert_eq!(applied.after.rub, 5_000);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        let paths: Vec<Option<String>> =
            sqlx::query_scalar("SELECT path FROM ledger_transactions WHERE account_id = $1")
                .bind(account.as_str())
                .fetch_all(store.pool())
                .await
                .unwrap();
        assert!(paths.contains(&Some("optimistic".to_string())));
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_pg_claims_finalize_once() {
        let store = create_test_store().await;
        let invoice = Invoice::new(InvoiceId::new("inv-1"), AccountId::new("1003"), rub(100));

        store.insert_invoice(&invoice).await.unwrap();
        assert!(matches!(
            store.insert_invoice(&invoice).await,
            Err(StoreError::Duplicate(_))
        ));

        let claim = Claim::Invoice(invoice.id.clone());
        assert_eq!(store.claim(&claim).await.unwrap(), ClaimResult::Claimed);
        assert_eq!(store.claim(&claim).await.unwrap(), ClaimResult::AlreadyFinal);

        store.release(&claim).await.unwrap();
        assert_eq!(store.claim(&claim).await.unwrap(), ClaimResult::Claimed);

        assert!(matches!(
            store.claim(&Claim::Invoice(InvoiceId::new("inv-missing"))).await,
            Err(StoreError::RecordNotFound(_))
        ));
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_pg_one_active_trade_per_account() {
        let store = create_test_store().await;
        let account = AccountId::new("1004");
        store.ensure_account(&account).await.unwrap();

        let first = Trade::open(
            account.clone(),
            rub(100),
            chrono::Duration::seconds(30),
            ForcedOutcome::Random,
        );
        store.insert_trade(&first).await.unwrap();

        let second = Trade::open(
            account.clone(),
            rub(100),
            chrono::Duration::seconds(30),
            ForcedOutcome::Random,
        );
        assert!(matches!(
            store.insert_trade(&second).await,
            Err(StoreError::ActiveTradeExists(id)) if id == account
        ));

        let claim = Claim::Trade {
            id: first.id,
            outcome: TradeOutcome::Lose,
        };
        assert_eq!(store.claim(&claim).await.unwrap(), ClaimResult::Claimed);
        store.insert_trade(&second).await.unwrap();
    }
}
