//! Monetary types for the ledger.
//!
//! Balances are held as signed integer minor units so that conditional
//! writes compare exact values. `rust_decimal` is used only at the edges,
//! for parsing request amounts and for rate arithmetic.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A currency supported by the ledger. Each one maps to one balance field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    /// Fiat balance.
    #[serde(alias = "rub")]
    Rub,
    /// Stable-token balance.
    #[serde(alias = "usdt")]
    Usdt,
}

impl Currency {
    /// All supported currencies, in column order.
    pub const ALL: [Currency; 2] = [Currency::Rub, Currency::Usdt];

    /// Get the currency code.
    pub fn code(&self) -> &'static str {
        match self {
            Currency::Rub => "RUB",
            Currency::Usdt => "USDT",
        }
    }

    /// Number of fractional digits held in minor units.
    pub fn scale(&self) -> u32 {
        match self {
            Currency::Rub => 2,
            Currency::Usdt => 6,
        }
    }

    /// Balance column backing this currency.
    pub fn column(&self) -> &'static str {
        match self {
            Currency::Rub => "balance_rub",
            Currency::Usdt => "balance_usdt",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl FromStr for Currency {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "RUB" => Ok(Currency::Rub),
            "USDT" => Ok(Currency::Usdt),
            other => Err(AmountError::UnknownCurrency(other.to_string())),
        }
    }
}

/// Reasons an amount, rate or currency is rejected before any write.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmountError {
    #[error("amount is not a number: {0}")]
    Malformed(String),

    #[error("amount must be positive")]
    NotPositive,

    #[error("{currency} supports at most {scale} decimal places")]
    TooPrecise { currency: Currency, scale: u32 },

    #[error("amount out of range")]
    Overflow,

    #[error("unsupported currency: {0}")]
    UnknownCurrency(String),

    #[error("exchange rate must be positive")]
    InvalidRate,
}

/// A monetary amount in integer minor units of one currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
    /// Signed minor units (kopecks, micro-USDT).
    pub units: i64,
    /// Currency of the amount.
    pub currency: Currency,
}

impl Money {
    /// Create from raw minor units.
    pub fn from_units(units: i64, currency: Currency) -> Self {
        Self { units, currency }
    }

    /// Create a zero amount in the given currency.
    pub fn zero(currency: Currency) -> Self {
        Self { units: 0, currency }
    }

    /// Convert a decimal into minor units, rejecting excess precision.
    pub fn from_decimal(value: Decimal, currency: Currency) -> Result<Self, AmountError> {
        let value = value.normalize();
        let scale = currency.scale();
        if value.scale() > scale {
            return Err(AmountError::TooPrecise { currency, scale });
        }
        let units = value
            .checked_mul(Decimal::from(10i64.pow(scale)))
            .and_then(|scaled| scaled.to_i64())
            .ok_or(AmountError::Overflow)?;
        Ok(Self { units, currency })
    }

    /// Parse a positive request amount.
    pub fn parse_positive(value: &str, currency: Currency) -> Result<Self, AmountError> {
        let decimal = Decimal::from_str(value.trim())
            .or_else(|_| Decimal::from_scientific(value.trim()))
            .map_err(|_| AmountError::Malformed(value.to_string()))?;
        let money = Self::from_decimal(decimal, currency)?;
        if !money.is_positive() {
            return Err(AmountError::NotPositive);
        }
        Ok(money)
    }

    /// Decimal representation of the amount.
    pub fn to_decimal(&self) -> Decimal {
        Decimal::new(self.units, self.currency.scale())
    }

    /// Check if the amount is positive.
    pub fn is_positive(&self) -> bool {
        self.units > 0
    }

    /// Scale the amount by a decimal factor, rounding toward zero.
    pub fn scale_by(&self, factor: Decimal) -> Result<Money, AmountError> {
        let scaled = self
            .to_decimal()
            .checked_mul(factor)
            .ok_or(AmountError::Overflow)?
            .round_dp_with_strategy(self.currency.scale(), RoundingStrategy::ToZero);
        Money::from_decimal(scaled, self.currency)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.to_decimal(), self.currency)
    }
}

/// Conversion rate between two balance fields: one unit of the source
/// currency buys `rate` units of the destination currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRate(Decimal);

impl ExchangeRate {
    /// Create a rate, rejecting zero and negative values.
    pub fn new(rate: Decimal) -> Result<Self, AmountError> {
        if rate <= Decimal::ZERO {
            return Err(AmountError::InvalidRate);
        }
        Ok(Self(rate))
    }

    /// Parse a rate from a string.
    pub fn parse(value: &str) -> Result<Self, AmountError> {
        let rate = Decimal::from_str(value.trim())
            .or_else(|_| Decimal::from_scientific(value.trim()))
            .map_err(|_| AmountError::Malformed(value.to_string()))?;
        Self::new(rate)
    }

    /// Get the rate value.
    pub fn value(&self) -> Decimal {
        self.0
    }

    /// Convert an amount into the target currency, rounding toward zero
    /// to the target scale.
    pub fn convert(&self, amount: &Money, target: Currency) -> Result<Money, AmountError> {
        let converted = amount
            .to_decimal()
            .checked_mul(self.0)
            .ok_or(AmountError::Overflow)?
            .round_dp_with_strategy(target.scale(), RoundingStrategy::ToZero);
        Money::from_decimal(converted, target)
    }
}

impl fmt::Display for ExchangeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
