//! Atomic supervisor counters.
//!
//! Monotonic display counters; `Relaxed` ordering throughout.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Supervisor statistics, owned by the supervisor loop.
#[derive(Default)]
pub struct SupervisorStats {
    health_checks: AtomicU64,
    insecure_reports: AtomicU64,
    oracle_errors: AtomicU64,
    failovers: AtomicU64,
    failed_failovers: AtomicU64,
}

/// Point-in-time copy of the counters, logged as JSON on exit.
#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub health_checks: u64,
    pub insecure_reports: u64,
    pub oracle_errors: u64,
    pub failovers: u64,
    pub failed_failovers: u64,
}

impl SupervisorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_health_checks(&self) {
        self.health_checks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_insecure_reports(&self) {
        self.insecure_reports.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_oracle_errors(&self) {
        self.oracle_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failovers(&self) {
        self.failovers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed_failovers(&self) {
        self.failed_failovers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            health_checks: self.health_checks.load(Ordering::Relaxed),
            insecure_reports: self.insecure_reports.load(Ordering::Relaxed),
            oracle_errors: self.oracle_errors.load(Ordering::Relaxed),
            failovers: self.failovers.load(Ordering::Relaxed),
            failed_failovers: self.failed_failovers.load(Ordering::Relaxed),
        }
    }
}
