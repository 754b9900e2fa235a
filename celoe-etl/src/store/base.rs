use std::future::Future;

use chrono::{DateTime, NaiveDate, Utc};

use crate::error::EtlResult;
use crate::types::{LogFilter, LogId, LogLevel, SchedulerLogRecord, WatermarkRecord};

/// Persistence for watermarks, the scheduler log and the realtime log stream.
///
/// All engine state lives behind this trait so the pipeline can run against
/// the Postgres-backed store in production and the in-memory store in tests.
/// Implementations must be cheaply cloneable and safe for concurrent use by
/// multiple window workers.
pub trait StateStore {
    /// Returns the watermark for a named process, if one has been committed.
    fn get_watermark(
        &self,
        process_name: &str,
    ) -> impl Future<Output = EtlResult<Option<WatermarkRecord>>> + Send;

    /// Advances the watermark for a process to `date`.
    ///
    /// Implementations must keep `last_date` monotonically non-decreasing: a
    /// call with an earlier date than the stored one is a no-op.
    fn advance_watermark(
        &self,
        process_name: &str,
        date: NaiveDate,
    ) -> impl Future<Output = EtlResult<()>> + Send;

    /// Removes the watermark for a process. Used by explicit clear operations
    /// only; normal scheduling never moves a watermark backwards.
    fn reset_watermark(&self, process_name: &str) -> impl Future<Output = EtlResult<()>> + Send;

    /// Inserts a scheduler log row in `running` status and returns its id.
    fn start_run(
        &self,
        run_type: &str,
        requested_start_date: NaiveDate,
    ) -> impl Future<Output = EtlResult<LogId>> + Send;

    /// Updates the offset and row counters of a running log row.
    ///
    /// Best-effort progress visibility for long single-pass extractions;
    /// callers treat failures as non-fatal.
    fn mark_progress(
        &self,
        log_id: LogId,
        offset: i64,
        row_count: i64,
    ) -> impl Future<Output = EtlResult<()>> + Send;

    /// Transitions a running log row to `finished`, stamping the end time and
    /// the derived duration.
    fn complete_run(
        &self,
        log_id: LogId,
        row_count: i64,
        extracted_start_date: NaiveDate,
        extracted_end_date: NaiveDate,
    ) -> impl Future<Output = EtlResult<()>> + Send;

    /// Transitions a running log row to `failed`, stamping the end time, the
    /// derived duration and the error message.
    fn fail_run(
        &self,
        log_id: LogId,
        message: &str,
    ) -> impl Future<Output = EtlResult<()>> + Send;

    /// Appends an entry to the realtime log stream.
    ///
    /// Implementations create the backing table lazily on first use. Callers
    /// swallow errors from this method; observability must never abort a run.
    fn append_realtime(
        &self,
        log_id: LogId,
        level: LogLevel,
        message: &str,
        progress: Option<f64>,
    ) -> impl Future<Output = EtlResult<()>> + Send;

    /// Returns a scheduler log row by id.
    fn get_run(
        &self,
        log_id: LogId,
    ) -> impl Future<Output = EtlResult<Option<SchedulerLogRecord>>> + Send;

    /// Returns the most recently created scheduler log row, optionally
    /// restricted to a run type.
    fn latest_run(
        &self,
        run_type: Option<&str>,
    ) -> impl Future<Output = EtlResult<Option<SchedulerLogRecord>>> + Send;

    /// Returns scheduler log rows matching the filter, newest first.
    fn list_runs(
        &self,
        filter: &LogFilter,
    ) -> impl Future<Output = EtlResult<Vec<SchedulerLogRecord>>> + Send;

    /// Returns rows still in `running` status that started before `cutoff`.
    fn stuck_runs(
        &self,
        cutoff: DateTime<Utc>,
    ) -> impl Future<Output = EtlResult<Vec<SchedulerLogRecord>>> + Send;

    /// Returns non-terminal rows with no end time that started before
    /// `cutoff`, independent of status. Defensive net for partially written
    /// log rows.
    fn unfinished_runs(
        &self,
        cutoff: DateTime<Utc>,
    ) -> impl Future<Output = EtlResult<Vec<SchedulerLogRecord>>> + Send;

    /// Force-transitions a row to `failed`, re-checking at update time that it
    /// has not legitimately finished in the meantime.
    ///
    /// Returns whether the row was transitioned.
    fn force_fail_run(
        &self,
        log_id: LogId,
        message: &str,
    ) -> impl Future<Output = EtlResult<bool>> + Send;
}
