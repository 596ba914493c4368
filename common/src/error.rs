//! Error types for ledger operations.

use crate::{AccountId, AmountError, Reference};
use thiserror::Error;

/// Main error type for ledger operations.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Malformed, missing or non-positive input.
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// Account does not exist.
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// Referenced invoice, withdrawal or trade does not exist.
    #[error("Record not found: {0}")]
    RecordNotFound(Reference),

    /// Balance too low for a withdrawal-class operation.
    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: String, available: String },

    /// Conditional write kept losing to concurrent writers.
    #[error("Concurrent modification of account {account} after {attempts} attempts")]
    Conflict { account: AccountId, attempts: u32 },

    /// The account already has an open trade.
    #[error("Account {0} already has an active trade")]
    ActiveTradeExists(AccountId),

    /// Service is not accepting requests.
    #[error("Service unavailable, retry after {retry_after_ms}ms")]
    Unavailable { retry_after_ms: u64 },

    /// Database error.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Unexpected internal failure.
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl LedgerError {
    /// Build a validation error tied to a request field.
    pub fn invalid(field: &str, message: impl Into<String>) -> Self {
        LedgerError::Validation {
            message: message.into(),
            field: Some(field.to_string()),
        }
    }

    /// Build a validation error from an amount parsing failure.
    pub fn invalid_amount(field: &str, error: AmountError) -> Self {
        Self::invalid(field, error.to_string())
    }

    /// Check if this error is retryable by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::Conflict { .. } | LedgerError::Unavailable { .. }
        )
    }

    /// Check if this error is a missing account or record.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            LedgerError::AccountNotFound(_) | LedgerError::RecordNotFound(_)
        )
    }

    /// Get error code for responses and logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            LedgerError::Validation { .. } => "validation_error",
            LedgerError::AccountNotFound(_) => "account_not_found",
            LedgerError::RecordNotFound(_) => "record_not_found",
            LedgerError::InsufficientBalance { .. } => "insufficient_balance",
            LedgerError::Conflict { .. } => "conflict",
            LedgerError::ActiveTradeExists(_) => "active_trade_exists",
            LedgerError::Unavailable { .. } => "unavailable",
            LedgerError::DatabaseError(_) => "database_error",
            LedgerError::InternalError(_) => "internal_error",
        }
    }

    /// Offending request field, if any.
    pub fn field(&self) -> Option<&str> {
        match self {
            LedgerError::Validation { field, .. } => field.as_deref(),
            _ => None,
        }
    }
}

/// Result type alias for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        let conflict = LedgerError::Conflict {
            account: AccountId::new("1"),
            attempts: 3,
        };
        assert!(conflict.is_retryable());
        assert_eq!(conflict.error_code(), "conflict");

        let insufficient = LedgerError::InsufficientBalance {
            required: "10".into(),
            available: "5".into(),
        };
        assert!(!insufficient.is_retryable());
    }

    #[test]
    fn test_validation_field() {
        let err = LedgerError::invalid_amount("amount", AmountError::NotPositive);
        assert_eq!(err.field(), Some("amount"));
        assert_eq!(err.to_string(), "Validation failed: amount must be positive");
    }
}
