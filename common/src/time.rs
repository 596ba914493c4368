//! Time utilities and constants for the ledger.

use chrono::Duration;

/// Ledger timing constants.
pub mod constants {
    use super::Duration;

    /// Conditional-write attempts before a mutation reports a conflict.
    pub const MAX_MUTATION_ATTEMPTS: u32 = 3;

    /// Base delay of the linear retry backoff (25 milliseconds).
    pub fn mutation_backoff_base() -> Duration {
        Duration::milliseconds(25)
    }

    /// Upper bound on a single journal append (250 milliseconds).
    pub fn journal_append_timeout() -> Duration {
        Duration::milliseconds(250)
    }

    /// Settlement worker polling interval (1 second).
    pub fn settlement_poll_interval() -> Duration {
        Duration::seconds(1)
    }

    /// Shortest allowed trade (1 second).
    pub fn min_trade_duration() -> Duration {
        Duration::seconds(1)
    }

    /// Longest allowed trade (24 hours).
    pub fn max_trade_duration() -> Duration {
        Duration::hours(24)
    }
}

/// Conversion of chrono durations to std durations.
pub trait DurationExt {
    fn as_std(&self) -> std::time::Duration;
}

impl DurationExt for Duration {
    fn as_std(&self) -> std::time::Duration {
        self.to_std().unwrap_or(std::time::Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_duration_clamps_to_zero() {
        assert_eq!(Duration::seconds(-5).as_std(), std::time::Duration::ZERO);
        assert_eq!(
            constants::mutation_backoff_base().as_std(),
            std::time::Duration::from_millis(25)
        );
    }
}
