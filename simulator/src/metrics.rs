//! Simulation metrics.

use std::collections::VecDeque;

use atomicledger_common::LedgerError;

/// Per-run operation counters and latency samples.
#[derive(Debug, Clone)]
pub struct SimulationMetrics {
    /// Operations attempted.
    pub total_operations: u64,
    /// Operations that changed a balance.
    pub applied: u64,
    /// Replays of an already final invoice, withdrawal or trade.
    pub already_settled: u64,
    /// Rejected for insufficient balance.
    pub insufficient: u64,
    /// Gave up after losing every conditional write.
    pub conflicts: u64,
    /// Trade refused because the account already had one open.
    pub trade_busy: u64,
    /// Any other failure.
    pub failed: u64,
    /// Latency samples (µs).
    latency_samples: VecDeque<u64>,
    /// Maximum samples to keep.
    max_samples: usize,
}

impl SimulationMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self {
            total_operations: 0,
            applied: 0,
            already_settled: 0,
            insufficient: 0,
            conflicts: 0,
            trade_busy: 0,
            failed: 0,
            latency_samples: VecDeque::with_capacity(10000),
            max_samples: 10000,
        }
    }

    /// Record an operation that returned normally.
    pub fn record_success(&mut self, already_settled: bool, latency_us: u64) {
        self.total_operations += 1;
        if already_settled {
            self.already_settled += 1;
        } else {
            self.applied += 1;
        }

        if self.latency_samples.len() >= self.max_samples {
            self.latency_samples.pop_front();
        }
        self.latency_samples.push_back(latency_us);
    }

    /// Record a failed operation.
    pub fn record_failure(&mut self, error: &LedgerError) {
        self.total_operations += 1;
        match error {
            LedgerError::InsufficientBalance { .. } => self.insufficient += 1,
            LedgerError::Conflict { .. } => self.conflicts += 1,
            LedgerError::ActiveTradeExists(_) => self.trade_busy += 1,
            _ => self.failed += 1,
        }
    }

    /// Fold another worker's metrics into these.
    pub fn merge(&mut self, other: &SimulationMetrics) {
        self.total_operations += other.total_operations;
        self.applied += other.applied;
        self.already_settled += other.already_settled;
        self.insufficient += other.insufficient;
        self.conflicts += other.conflicts;
        self.trade_busy += other.trade_busy;
        self.failed += other.failed;
        for sample in &other.latency_samples {
            if self.latency_samples.len() >= self.max_samples {
                self.latency_samples.pop_front();
            }
            self.latency_samples.push_back(*sample);
        }
    }

    /// Get average latency in µs.
    pub fn average_latency_us(&self) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let sum: u64 = self.latency_samples.iter().sum();
        sum / self.latency_samples.len() as u64
    }

    /// Get p99 latency.
    pub fn p99_latency_us(&self) -> u64 {
        self.percentile_latency(99)
    }

    fn percentile_latency(&self, percentile: usize) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let mut sorted: Vec<_> = self.latency_samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (sorted.len() * percentile / 100).min(sorted.len() - 1);
        sorted[idx]
    }

    /// Get throughput (operations per second).
    pub fn throughput(&self, elapsed_secs: f64) -> f64 {
        if elapsed_secs <= 0.0 {
            return 0.0;
        }

        self.total_operations as f64 / elapsed_secs
    }
}

impl Default for SimulationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atomicledger_common::AccountId;

    #[test]
    fn test_metrics() {
        let mut metrics = SimulationMetrics::new();

        metrics.record_success(false, 100);
        metrics.record_success(false, 200);
        metrics.record_success(true, 150);
        metrics.record_failure(&LedgerError::Conflict {
            account: AccountId::new("0"),
            attempts: 3,
        });

        assert_eq!(metrics.total_operations, 4);
        assert_eq!(metrics.applied, 2);
        assert_eq!(metrics.already_settled, 1);
        assert_eq!(metrics.conflicts, 1);
        assert_eq!(metrics.average_latency_us(), 150);
        assert_eq!(metrics.p99_latency_us(), 200);
    }

    #[test]
    fn test_merge() {
        let mut a = SimulationMetrics::new();
        a.record_success(false, 10);
        let mut b = SimulationMetrics::new();
        b.record_failure(&LedgerError::InsufficientBalance {
            required: "1".to_string(),
            available: "0".to_string(),
        });
        b.record_failure(&LedgerError::ActiveTradeExists(AccountId::new("0")));

        a.merge(&b);
        assert_eq!(a.total_operations, 3);
        assert_eq!(a.insufficient, 1);
        assert_eq!(a.trade_busy, 1);
        assert_eq!(a.failed, 0);
        assert_eq!(a.throughput(2.0), 1.5);
    }
}
