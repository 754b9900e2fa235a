//! Recovery of scheduler log rows left behind by crashed runs.

use celoe_config::shared::StuckConfig;
use chrono::{Duration, Utc};
use tracing::{info, warn};

use crate::error::EtlResult;
use crate::store::base::StateStore;
use crate::types::{LogLevel, SchedulerLogRecord};

/// Force-fails runs that can no longer be making progress.
///
/// Two passes with different cutoffs: rows still in `running` status after the
/// soft timeout, then rows with no end time at all after the hard timeout,
/// whatever their status says. The second pass catches rows that were only
/// partially written when their process died. The store re-checks staleness at
/// update time, so a run that legitimately finishes between the query and the
/// update is left alone.
#[derive(Debug, Clone)]
pub struct StuckRunReclaimer<S> {
    store: S,
    config: StuckConfig,
}

impl<S: StateStore> StuckRunReclaimer<S> {
    pub fn new(store: S, config: StuckConfig) -> Self {
        Self { store, config }
    }

    /// Reclaims stuck runs and returns how many rows were transitioned.
    pub async fn reclaim(&self) -> EtlResult<u64> {
        let now = Utc::now();
        let mut cleared = 0u64;

        let stuck_cutoff = now - Duration::minutes(self.config.timeout_minutes);
        for run in self.store.stuck_runs(stuck_cutoff).await? {
            cleared += self
                .force_fail(&run, "Run exceeded the stuck timeout while running")
                .await? as u64;
        }

        let hard_cutoff = now - Duration::minutes(self.config.hard_timeout_minutes);
        for run in self.store.unfinished_runs(hard_cutoff).await? {
            cleared += self
                .force_fail(&run, "Run never recorded an end time")
                .await? as u64;
        }

        if cleared > 0 {
            info!(cleared, "reclaimed stuck scheduler log rows");
        }

        Ok(cleared)
    }

    async fn force_fail(&self, run: &SchedulerLogRecord, reason: &str) -> EtlResult<bool> {
        let running_minutes = run
            .start_time
            .map(|start| (Utc::now() - start).num_minutes())
            .unwrap_or(0);
        let message = format!("{reason} (started {running_minutes} minutes ago)");

        let transitioned = self.store.force_fail_run(run.id, &message).await?;
        if !transitioned {
            return Ok(false);
        }

        warn!(
            log_id = run.id,
            run_type = %run.run_type,
            running_minutes,
            "force-failed stuck run"
        );

        // Best effort: losing the log line must not fail the reclaim.
        let _ = self
            .store
            .append_realtime(run.id, LogLevel::Error, &message, None)
            .await;

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::store::memory::MemoryStateStore;
    use crate::types::{LogId, RunStatus};

    fn config() -> StuckConfig {
        StuckConfig {
            timeout_minutes: 10,
            hard_timeout_minutes: 30,
        }
    }

    fn staged_run(id: LogId, status: RunStatus, started_minutes_ago: i64) -> SchedulerLogRecord {
        let start = Utc::now() - Duration::minutes(started_minutes_ago);
        SchedulerLogRecord {
            id,
            status,
            run_type: "activity_counts".to_string(),
            requested_start_date: NaiveDate::from_ymd_opt(2024, 3, 1),
            extracted_start_date: None,
            extracted_end_date: None,
            start_time: Some(start),
            end_time: None,
            duration_seconds: None,
            offset: 0,
            row_count: 0,
            message: None,
            created_at: start,
        }
    }

    #[tokio::test]
    async fn running_rows_past_the_timeout_are_force_failed() {
        let store = MemoryStateStore::new();
        store
            .insert_run_for_test(staged_run(1, RunStatus::Running, 20))
            .await;
        store
            .insert_run_for_test(staged_run(2, RunStatus::Running, 5))
            .await;

        let reclaimer = StuckRunReclaimer::new(store.clone(), config());
        let cleared = reclaimer.reclaim().await.unwrap();

        assert_eq!(cleared, 1);
        let stale = store.get_run(1).await.unwrap().unwrap();
        assert_eq!(stale.status, RunStatus::Failed);
        assert!(stale.end_time.is_some());

        let fresh = store.get_run(2).await.unwrap().unwrap();
        assert_eq!(fresh.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn partially_written_rows_are_caught_by_the_hard_timeout() {
        let store = MemoryStateStore::new();
        // Pending with no end time: missed by the running-status pass.
        store
            .insert_run_for_test(staged_run(1, RunStatus::Pending, 45))
            .await;
        store
            .insert_run_for_test(staged_run(2, RunStatus::Pending, 15))
            .await;

        let reclaimer = StuckRunReclaimer::new(store.clone(), config());
        let cleared = reclaimer.reclaim().await.unwrap();

        assert_eq!(cleared, 1);
        assert_eq!(
            store.get_run(1).await.unwrap().unwrap().status,
            RunStatus::Failed
        );
        assert_eq!(
            store.get_run(2).await.unwrap().unwrap().status,
            RunStatus::Pending
        );
    }

    #[tokio::test]
    async fn finished_rows_are_never_touched() {
        let store = MemoryStateStore::new();
        let mut finished = staged_run(1, RunStatus::Finished, 60);
        finished.end_time = Some(Utc::now() - Duration::minutes(55));
        store.insert_run_for_test(finished).await;

        let reclaimer = StuckRunReclaimer::new(store.clone(), config());
        let cleared = reclaimer.reclaim().await.unwrap();

        assert_eq!(cleared, 0);
        assert_eq!(
            store.get_run(1).await.unwrap().unwrap().status,
            RunStatus::Finished
        );
    }

    #[tokio::test]
    async fn reclaiming_writes_a_realtime_log_entry() {
        let store = MemoryStateStore::new();
        store
            .insert_run_for_test(staged_run(7, RunStatus::Running, 20))
            .await;

        let reclaimer = StuckRunReclaimer::new(store.clone(), config());
        reclaimer.reclaim().await.unwrap();

        let entries = store.realtime_entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].log_id, 7);
        assert_eq!(entries[0].level, "error");
    }
}
