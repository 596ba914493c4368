//! Metrics collection for service monitoring.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use atomicledger_ledger::EngineStatsSnapshot;

/// Service metrics.
pub struct Metrics {
    /// API requests received.
    pub requests_total: AtomicU64,
    /// API requests answered with an error.
    pub requests_failed: AtomicU64,
    /// Trades opened.
    pub trades_opened: AtomicU64,
    /// Trades settled with a balance credit.
    pub trades_settled: AtomicU64,
    /// Settlement calls for trades that were already closed.
    pub trades_already_settled: AtomicU64,
    /// Trades closed without a credit.
    pub trades_degraded: AtomicU64,
    /// Stakes refunded after a lost trade insert.
    pub stake_refunds: AtomicU64,
    /// Notifications delivered.
    pub notifications_sent: AtomicU64,
    /// Notifications that failed.
    pub notifications_failed: AtomicU64,
}

impl Metrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            trades_opened: AtomicU64::new(0),
            trades_settled: AtomicU64::new(0),
            trades_already_settled: AtomicU64::new(0),
            trades_degraded: AtomicU64::new(0),
            stake_refunds: AtomicU64::new(0),
            notifications_sent: AtomicU64::new(0),
            notifications_failed: AtomicU64::new(0),
        }
    }

    pub fn request_received(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn trade_opened(&self) {
        self.trades_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn trade_settled(&self) {
        self.trades_settled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn trade_already_settled(&self) {
        self.trades_already_settled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn trade_degraded(&self) {
        self.trades_degraded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stake_refunded(&self) {
        self.stake_refunds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn notification_sent(&self) {
        self.notifications_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn notification_failed(&self) {
        self.notifications_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            trades_opened: self.trades_opened.load(Ordering::Relaxed),
            trades_settled: self.trades_settled.load(Ordering::Relaxed),
            trades_already_settled: self.trades_already_settled.load(Ordering::Relaxed),
            trades_degraded: self.trades_degraded.load(Ordering::Relaxed),
            stake_refunds: self.stake_refunds.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            notifications_failed: self.notifications_failed.load(Ordering::Relaxed),
        }
    }

    /// Export service and engine metrics in Prometheus format.
    pub fn to_prometheus(&self, engine: &EngineStatsSnapshot) -> String {
        let s = self.snapshot();
        let series: [(&str, &str, &str, u64); 17] = [
            ("requests_total", "counter", "Total API requests", s.requests_total),
            ("requests_failed", "counter", "API requests answered with an error", s.requests_failed),
            ("trades_opened", "counter", "Trades opened", s.trades_opened),
            ("trades_settled", "counter", "Trades settled with a credit", s.trades_settled),
            ("trades_already_settled", "counter", "Settlement calls for closed trades", s.trades_already_settled),
            ("trades_degraded", "counter", "Trades closed without a credit", s.trades_degraded),
            ("stake_refunds", "counter", "Stakes refunded after a lost trade insert", s.stake_refunds),
            ("notifications_sent", "counter", "Notifications delivered", s.notifications_sent),
            ("notifications_failed", "counter", "Notifications that failed", s.notifications_failed),
            ("mutations_applied", "counter", "Balance mutations applied", engine.applied),
            ("mutations_already_settled", "counter", "Mutations skipped as already settled", engine.already_settled),
            ("mutations_rejected", "counter", "Mutations rejected before any write", engine.rejected),
            ("mutation_conflicts", "counter", "Conditional writes lost to a concurrent writer", engine.conflicts),
            ("mutation_retries", "counter", "Mutation retries after a conflict", engine.retries),
            ("mutation_fallbacks", "counter", "Mutations that used the optimistic path", engine.fallbacks),
            ("mutation_failures", "counter", "Mutations failed with an internal error", engine.failures),
            ("journal_failures", "counter", "Journal appends that failed or timed out", engine.journal_failures),
        ];

        let mut out = String::new();
        for (name, kind, help, value) in series {
            let _ = writeln!(out, "# HELP atomicledger_{} {}", name, help);
            let _ = writeln!(out, "# TYPE atomicledger_{} {}", name, kind);
            let _ = writeln!(out, "atomicledger_{} {}\n", name, value);
        }
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_failed: u64,
    pub trades_opened: u64,
    pub trades_settled: u64,
    pub trades_already_settled: u64,
    pub trades_degraded: u64,
    pub stake_refunds: u64,
    pub notifications_sent: u64,
    pub notifications_failed: u64,
}

/// Shared metrics instance.
pub type SharedMetrics = Arc<Metrics>;
