//! Trade types and the trade state machine.

use crate::{AccountId, AmountError, Money, TradeId};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    /// Stake is at risk, settlement pending.
    Active,
    /// Outcome resolved. Terminal.
    Closed,
}

impl TradeStatus {
    /// Check if transition to given state is valid.
    pub fn can_transition_to(&self, next: TradeStatus) -> bool {
        matches!((self, next), (TradeStatus::Active, TradeStatus::Closed))
    }
}

/// Resolved result of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeOutcome {
    Win,
    Lose,
}

impl TradeOutcome {
    pub fn is_win(&self) -> bool {
        matches!(self, TradeOutcome::Win)
    }

    pub fn from_is_win(is_win: bool) -> Self {
        if is_win {
            TradeOutcome::Win
        } else {
            TradeOutcome::Lose
        }
    }
}

impl fmt::Display for TradeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeOutcome::Win => write!(f, "win"),
            TradeOutcome::Lose => write!(f, "lose"),
        }
    }
}

/// Per-account override of trade outcomes, set by operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForcedOutcome {
    Win,
    Lose,
    /// No override: a fair coin decides.
    #[default]
    Random,
}

impl ForcedOutcome {
    /// The outcome this override pins, if any.
    pub fn pinned(&self) -> Option<TradeOutcome> {
        match self {
            ForcedOutcome::Win => Some(TradeOutcome::Win),
            ForcedOutcome::Lose => Some(TradeOutcome::Lose),
            ForcedOutcome::Random => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ForcedOutcome::Win => "win",
            ForcedOutcome::Lose => "lose",
            ForcedOutcome::Random => "random",
        }
    }
}

impl FromStr for ForcedOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "win" => Ok(ForcedOutcome::Win),
            "lose" => Ok(ForcedOutcome::Lose),
            "random" | "" => Ok(ForcedOutcome::Random),
            other => Err(format!("unknown forced outcome: {}", other)),
        }
    }
}

/// A timed wager on one balance field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    /// Unique trade identifier.
    pub id: TradeId,
    /// Owning account.
    pub account_id: AccountId,
    /// Stake, fixed at creation.
    pub stake: Money,
    /// Trade duration in seconds, fixed at creation.
    pub duration_secs: i64,
    /// True until settled.
    pub is_active: bool,
    /// Resolved outcome; `None` while active.
    pub is_win: Option<bool>,
    /// Override captured from the account when the trade was opened.
    pub forced_outcome: ForcedOutcome,
    /// When the trade was opened.
    pub created_at: DateTime<Utc>,
    /// When settlement becomes due.
    pub settle_at: DateTime<Utc>,
    /// When the trade was closed.
    pub closed_at: Option<DateTime<Utc>>,
    /// Closed without applying the payout; needs reconciliation.
    pub degraded: bool,
}

impl Trade {
    /// Open a new trade.
    pub fn open(
        account_id: AccountId,
        stake: Money,
        duration: Duration,
        forced_outcome: ForcedOutcome,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TradeId::new(),
            account_id,
            stake,
            duration_secs: duration.num_seconds(),
            is_active: true,
            is_win: None,
            forced_outcome,
            created_at: now,
            settle_at: now + duration,
            closed_at: None,
            degraded: false,
        }
    }

    /// Current lifecycle state.
    pub fn status(&self) -> TradeStatus {
        if self.is_active {
            TradeStatus::Active
        } else {
            TradeStatus::Closed
        }
    }

    /// Resolved outcome, once closed.
    pub fn outcome(&self) -> Option<TradeOutcome> {
        self.is_win.map(TradeOutcome::from_is_win)
    }

    /// Check if settlement is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active && now >= self.settle_at
    }

    /// Close the trade with an outcome.
    pub fn close(&mut self, outcome: TradeOutcome) -> Result<(), InvalidTransition> {
        if !self.status().can_transition_to(TradeStatus::Closed) {
            return Err(InvalidTransition {
                from: self.status(),
                to: TradeStatus::Closed,
            });
        }
        self.is_active = false;
        self.is_win = Some(outcome.is_win());
        self.closed_at = Some(Utc::now());
        Ok(())
    }
}

/// Credit applied to the stake's balance field when a trade settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutSchedule {
    /// Multiple of the stake credited on a win (principal plus profit).
    pub win_multiplier: Decimal,
    /// Multiple of the stake refunded on a loss.
    pub lose_refund: Decimal,
}

impl PayoutSchedule {
    pub fn new(win_multiplier: Decimal, lose_refund: Decimal) -> Self {
        Self {
            win_multiplier,
            lose_refund,
        }
    }

    /// Amount credited for a settled trade.
    pub fn credit_for(&self, stake: &Money, outcome: TradeOutcome) -> Result<Money, AmountError> {
        match outcome {
            TradeOutcome::Win => stake.scale_by(self.win_multiplier),
            TradeOutcome::Lose => stake.scale_by(self.lose_refund),
        }
    }
}

impl Default for PayoutSchedule {
    fn default() -> Self {
        // 75% profit on a win, 25% refund on a loss
        Self {
            win_multiplier: Decimal::new(175, 2),
            lose_refund: Decimal::new(25, 2),
        }
    }
}

/// Error when attempting invalid state transition.
#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub from: TradeStatus,
    pub to: TradeStatus,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Invalid state transition from {:?} to {:?}",
            self.from, self.to
        )
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Currency;

    fn create_test_trade() -> Trade {
        Trade::open(
            AccountId::new("1001"),
            Money::from_units(100_000_000, Currency::Usdt),
            Duration::seconds(30),
            ForcedOutcome::Random,
        )
    }

    #[test]
    fn test_trade_creation() {
        let trade = create_test_trade();
        assert_eq!(trade.status(), TradeStatus::Active);
        assert_eq!(trade.is_win, None);
        assert_eq!(trade.settle_at - trade.created_at, Duration::seconds(30));
        assert!(!trade.is_due(trade.created_at));
        assert!(trade.is_due(trade.settle_at));
    }

    #[test]
    fn test_close_once() {
        let mut trade = create_test_trade();
        assert!(trade.close(TradeOutcome::Win).is_ok());
        assert_eq!(trade.outcome(), Some(TradeOutcome::Win));
        assert!(!trade.is_due(trade.settle_at));

        // Closed is terminal
        assert!(trade.close(TradeOutcome::Lose).is_err());
        assert_eq!(trade.outcome(), Some(TradeOutcome::Win));
    }

    #[test]
    fn test_default_payouts() {
        let payouts = PayoutSchedule::default();
        let stake = Money::from_units(10_000, Currency::Rub);

        let win = payouts.credit_for(&stake, TradeOutcome::Win).unwrap();
        let lose = payouts.credit_for(&stake, TradeOutcome::Lose).unwrap();
        assert_eq!(win.units, 17_500);
        assert_eq!(lose.units, 2_500);
    }

    #[test]
    fn test_forced_outcome_parsing() {
        assert_eq!("win".parse::<ForcedOutcome>().unwrap(), ForcedOutcome::Win);
        assert_eq!(ForcedOutcome::Random.pinned(), None);
        assert!("maybe".parse::<ForcedOutcome>().is_err());
    }
}
