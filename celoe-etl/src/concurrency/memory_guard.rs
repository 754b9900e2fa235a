use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;

use crate::bail;
use crate::error::{ErrorKind, EtlResult};

/// Represents a memory snapshot.
#[derive(Debug, Clone, Copy)]
struct MemorySnapshot {
    used: u64,
    total: u64,
}

impl MemorySnapshot {
    /// Refreshes memory readings from the operating system.
    fn from_system(system: &mut sysinfo::System) -> Self {
        system.refresh_memory_specifics(sysinfo::MemoryRefreshKind::nothing().with_ram());

        match system.cgroup_limits() {
            Some(cgroup) => MemorySnapshot {
                used: cgroup.rss,
                total: cgroup.total_memory,
            },
            None => MemorySnapshot {
                used: system.used_memory(),
                total: system.total_memory(),
            },
        }
    }

    /// Returns the fraction of the byte budget currently in use.
    ///
    /// The fraction may exceed `1.0` when usage is already past the budget;
    /// a zero budget reads as fully used.
    fn budget_fraction(&self, limit_bytes: u64) -> f32 {
        let fraction = self.used as f32 / limit_bytes as f32;
        if fraction.is_nan() {
            return 1.0;
        }

        fraction
    }
}

/// Two-tier ceiling over a configured memory budget, checked between
/// extraction pages.
///
/// Usage is measured against the budget, not against total system memory.
/// Crossing the soft threshold logs a warning so operators can shrink the
/// page size; crossing the hard threshold aborts the window with a
/// [`ErrorKind::MemoryLimitExceeded`] error before the process gets OOM
/// killed. Idempotent loads make the abort safe to retry.
#[derive(Debug, Clone)]
pub struct MemoryGuard {
    // sysinfo docs suggest to use a single instance of `System` across the program.
    system: Arc<Mutex<sysinfo::System>>,
    limit_bytes: u64,
    soft_threshold: f32,
    hard_threshold: f32,
}

impl MemoryGuard {
    pub fn new(limit_mb: u64, soft_threshold: f32, hard_threshold: f32) -> Self {
        Self {
            system: Arc::new(Mutex::new(sysinfo::System::new())),
            limit_bytes: limit_mb.saturating_mul(1024 * 1024),
            soft_threshold,
            hard_threshold,
        }
    }

    /// Samples current memory usage and enforces the budget thresholds.
    pub async fn check(&self) -> EtlResult<()> {
        let snapshot = {
            let mut system = self.system.lock().await;
            MemorySnapshot::from_system(&mut system)
        };
        let used_fraction = snapshot.budget_fraction(self.limit_bytes);

        if used_fraction >= self.hard_threshold {
            bail!(
                ErrorKind::MemoryLimitExceeded,
                "Memory usage crossed the hard ceiling, aborting the window",
                format!(
                    "{} bytes used of a {} byte budget",
                    snapshot.used, self.limit_bytes
                )
            );
        }

        if used_fraction >= self.soft_threshold {
            warn!(
                used_memory_bytes = snapshot.used,
                limit_bytes = self.limit_bytes,
                total_memory_bytes = snapshot.total,
                used_fraction,
                "memory usage crossed the soft ceiling"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn guard_with_a_huge_budget_passes() {
        let guard = MemoryGuard::new(u64::MAX, 1.0, 1.1);
        guard.check().await.unwrap();
    }

    #[tokio::test]
    async fn guard_with_zero_hard_threshold_trips() {
        let guard = MemoryGuard::new(512, 0.0, 0.0);
        let err = guard.check().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MemoryLimitExceeded);
    }

    #[tokio::test]
    async fn usage_is_measured_against_the_budget_not_the_machine() {
        // One megabyte is far below what any running process uses, so the
        // hard ceiling trips even though the machine itself has headroom.
        let guard = MemoryGuard::new(1, 0.8, 0.95);
        let err = guard.check().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MemoryLimitExceeded);
    }
}
