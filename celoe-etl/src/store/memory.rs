use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use tokio::sync::Mutex;

use crate::error::EtlResult;
use crate::store::base::StateStore;
use crate::types::{
    LogFilter, LogId, LogLevel, RealtimeLogEntry, RunStatus, SchedulerLogRecord, WatermarkRecord,
};

#[derive(Debug, Default)]
struct Inner {
    watermarks: HashMap<String, WatermarkRecord>,
    runs: BTreeMap<LogId, SchedulerLogRecord>,
    realtime: Vec<RealtimeLogEntry>,
    next_log_id: LogId,
    next_realtime_id: i64,
}

/// In-memory state store for tests and development.
///
/// Mirrors the semantics of the Postgres store, including the monotonic
/// watermark guard and the status re-check on forced failure.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all realtime log entries, for test assertions.
    pub async fn realtime_entries(&self) -> Vec<RealtimeLogEntry> {
        let inner = self.inner.lock().await;
        inner.realtime.clone()
    }

    /// Inserts a pre-shaped scheduler log row, for tests that need to stage
    /// stuck or partially written runs.
    pub async fn insert_run_for_test(&self, record: SchedulerLogRecord) {
        let mut inner = self.inner.lock().await;
        inner.next_log_id = inner.next_log_id.max(record.id);
        inner.runs.insert(record.id, record);
    }
}

impl StateStore for MemoryStateStore {
    async fn get_watermark(&self, process_name: &str) -> EtlResult<Option<WatermarkRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner.watermarks.get(process_name).cloned())
    }

    async fn advance_watermark(&self, process_name: &str, date: NaiveDate) -> EtlResult<()> {
        let mut inner = self.inner.lock().await;

        match inner.watermarks.get_mut(process_name) {
            Some(watermark) if watermark.last_date >= date => {}
            Some(watermark) => {
                watermark.last_date = date;
                watermark.last_timestamp = date.and_time(NaiveTime::MIN).and_utc().timestamp();
                watermark.updated_at = Utc::now();
            }
            None => {
                inner.watermarks.insert(
                    process_name.to_string(),
                    WatermarkRecord {
                        process_name: process_name.to_string(),
                        last_date: date,
                        last_timestamp: date.and_time(NaiveTime::MIN).and_utc().timestamp(),
                        updated_at: Utc::now(),
                    },
                );
            }
        }

        Ok(())
    }

    async fn reset_watermark(&self, process_name: &str) -> EtlResult<()> {
        let mut inner = self.inner.lock().await;
        inner.watermarks.remove(process_name);
        Ok(())
    }

    async fn start_run(&self, run_type: &str, requested_start_date: NaiveDate) -> EtlResult<LogId> {
        let mut inner = self.inner.lock().await;
        inner.next_log_id += 1;
        let log_id = inner.next_log_id;

        let now = Utc::now();
        inner.runs.insert(
            log_id,
            SchedulerLogRecord {
                id: log_id,
                status: RunStatus::Running,
                run_type: run_type.to_string(),
                requested_start_date: Some(requested_start_date),
                extracted_start_date: None,
                extracted_end_date: None,
                start_time: Some(now),
                end_time: None,
                duration_seconds: None,
                offset: 0,
                row_count: 0,
                message: None,
                created_at: now,
            },
        );

        Ok(log_id)
    }

    async fn mark_progress(&self, log_id: LogId, offset: i64, row_count: i64) -> EtlResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(run) = inner.runs.get_mut(&log_id)
            && run.status == RunStatus::Running
        {
            run.offset = offset;
            run.row_count = row_count;
        }

        Ok(())
    }

    async fn complete_run(
        &self,
        log_id: LogId,
        row_count: i64,
        extracted_start_date: NaiveDate,
        extracted_end_date: NaiveDate,
    ) -> EtlResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(run) = inner.runs.get_mut(&log_id) {
            let now = Utc::now();
            run.status = RunStatus::Finished;
            run.row_count = row_count;
            run.extracted_start_date = Some(extracted_start_date);
            run.extracted_end_date = Some(extracted_end_date);
            run.end_time = Some(now);
            run.duration_seconds = run.start_time.map(|start| (now - start).num_seconds());
        }

        Ok(())
    }

    async fn fail_run(&self, log_id: LogId, message: &str) -> EtlResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(run) = inner.runs.get_mut(&log_id) {
            let now = Utc::now();
            run.status = RunStatus::Failed;
            run.message = Some(message.to_string());
            run.end_time = Some(now);
            run.duration_seconds = run.start_time.map(|start| (now - start).num_seconds());
        }

        Ok(())
    }

    async fn append_realtime(
        &self,
        log_id: LogId,
        level: LogLevel,
        message: &str,
        progress: Option<f64>,
    ) -> EtlResult<()> {
        let mut inner = self.inner.lock().await;
        inner.next_realtime_id += 1;
        let id = inner.next_realtime_id;

        inner.realtime.push(RealtimeLogEntry {
            id,
            log_id,
            logged_at: Utc::now(),
            level: level.as_str().to_string(),
            message: message.to_string(),
            progress,
        });

        Ok(())
    }

    async fn get_run(&self, log_id: LogId) -> EtlResult<Option<SchedulerLogRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner.runs.get(&log_id).cloned())
    }

    async fn latest_run(&self, run_type: Option<&str>) -> EtlResult<Option<SchedulerLogRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .runs
            .values()
            .rev()
            .find(|run| run_type.is_none_or(|run_type| run.run_type == run_type))
            .cloned())
    }

    async fn list_runs(&self, filter: &LogFilter) -> EtlResult<Vec<SchedulerLogRecord>> {
        let inner = self.inner.lock().await;
        let limit = if filter.limit == 0 { 50 } else { filter.limit } as usize;

        Ok(inner
            .runs
            .values()
            .rev()
            .filter(|run| {
                filter
                    .run_type
                    .as_deref()
                    .is_none_or(|run_type| run.run_type == run_type)
                    && filter.status.is_none_or(|status| run.status == status)
            })
            .skip(filter.offset() as usize)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn stuck_runs(&self, cutoff: DateTime<Utc>) -> EtlResult<Vec<SchedulerLogRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .runs
            .values()
            .filter(|run| {
                run.status == RunStatus::Running
                    && run.start_time.is_some_and(|start| start < cutoff)
            })
            .cloned()
            .collect())
    }

    async fn unfinished_runs(&self, cutoff: DateTime<Utc>) -> EtlResult<Vec<SchedulerLogRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .runs
            .values()
            .filter(|run| {
                run.end_time.is_none() && run.start_time.is_some_and(|start| start < cutoff)
            })
            .cloned()
            .collect())
    }

    async fn force_fail_run(&self, log_id: LogId, message: &str) -> EtlResult<bool> {
        let mut inner = self.inner.lock().await;
        let Some(run) = inner.runs.get_mut(&log_id) else {
            return Ok(false);
        };

        // Same re-check as the Postgres store: rows that reached a terminal
        // state with an end time are left alone.
        if run.status != RunStatus::Running && run.end_time.is_some() {
            return Ok(false);
        }

        let now = Utc::now();
        run.status = RunStatus::Failed;
        run.message = Some(message.to_string());
        run.end_time = Some(now);
        run.duration_seconds = run.start_time.map(|start| (now - start).num_seconds());

        Ok(true)
    }
}
