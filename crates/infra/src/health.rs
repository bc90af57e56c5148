//! Process health shared between workers and the host's probe.
//!
//! Only fatal storage unavailability degrades health; transient publish
//! failures and saga conflicts are recovered locally and never surface
//! here.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Consecutive storage failures before the dispatcher reports degraded.
pub const DEGRADED_AFTER: u32 = 3;

/// Cheap cloneable health flag.
#[derive(Debug, Clone, Default)]
pub struct HealthState {
    degraded: Arc<AtomicBool>,
    consecutive_storage_failures: Arc<AtomicU32>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    /// False while the outbox store is unreachable.
    pub fn is_healthy(&self) -> bool {
        !self.degraded.load(Ordering::Relaxed)
    }

    pub(crate) fn record_storage_failure(&self) {
        let failures = self
            .consecutive_storage_failures
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        if failures >= DEGRADED_AFTER {
            self.degraded.store(true, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_storage_success(&self) {
        self.consecutive_storage_failures.store(0, Ordering::Relaxed);
        self.degraded.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degrades_after_repeated_failures_and_recovers() {
        let health = HealthState::new();
        assert!(health.is_healthy());

        for _ in 0..DEGRADED_AFTER - 1 {
            health.record_storage_failure();
            assert!(health.is_healthy());
        }
        health.record_storage_failure();
        assert!(!health.is_healthy());

        health.record_storage_success();
        assert!(health.is_healthy());
    }
}
