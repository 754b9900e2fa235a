use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;
use crate::store::base::StateStore;
use crate::types::{LogFilter, LogId, LogLevel, RunStatus, SchedulerLogRecord, WatermarkRecord};

/// A state store backed by the `celoeapi` schema of the reporting database.
///
/// The watermark and scheduler log tables are created by migrations; the
/// realtime log table is created lazily on first append so that observability
/// works even before the migration set has caught up.
#[derive(Debug, Clone)]
pub struct PostgresStateStore {
    pool: PgPool,
}

impl PostgresStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn record_from_row(row: &PgRow) -> EtlResult<SchedulerLogRecord> {
        let status: i16 = row.try_get("status")?;
        let status = RunStatus::from_i16(status).ok_or_else(|| {
            etl_error!(
                ErrorKind::InvalidState,
                "Unknown scheduler log status",
                status
            )
        })?;

        Ok(SchedulerLogRecord {
            id: row.try_get("id")?,
            status,
            run_type: row.try_get("type")?,
            requested_start_date: row.try_get("requested_start_date")?,
            extracted_start_date: row.try_get("extracted_start_date")?,
            extracted_end_date: row.try_get("extracted_end_date")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            duration_seconds: row.try_get("duration_seconds")?,
            offset: row.try_get("offset")?,
            row_count: row.try_get("row_count")?,
            message: row.try_get("message")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl StateStore for PostgresStateStore {
    async fn get_watermark(&self, process_name: &str) -> EtlResult<Option<WatermarkRecord>> {
        let row = sqlx::query(
            r#"
            select process_name, last_date, last_timestamp, updated_at
            from celoeapi.etl_watermarks
            where process_name = $1
            "#,
        )
        .bind(process_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(WatermarkRecord {
                process_name: row.try_get("process_name")?,
                last_date: row.try_get("last_date")?,
                last_timestamp: row.try_get("last_timestamp")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    async fn advance_watermark(&self, process_name: &str, date: NaiveDate) -> EtlResult<()> {
        let last_timestamp = date.and_time(NaiveTime::MIN).and_utc().timestamp();

        // The conflict guard keeps last_date monotonically non-decreasing even
        // if a backfill commits windows out of order.
        sqlx::query(
            r#"
            insert into celoeapi.etl_watermarks (process_name, last_date, last_timestamp, updated_at)
            values ($1, $2, $3, now())
            on conflict (process_name) do update
            set last_date = excluded.last_date,
                last_timestamp = excluded.last_timestamp,
                updated_at = now()
            where etl_watermarks.last_date < excluded.last_date
            "#,
        )
        .bind(process_name)
        .bind(date)
        .bind(last_timestamp)
        .execute(&self.pool)
        .await?;

        debug!(process_name, %date, "advanced watermark");

        Ok(())
    }

    async fn reset_watermark(&self, process_name: &str) -> EtlResult<()> {
        sqlx::query("delete from celoeapi.etl_watermarks where process_name = $1")
            .bind(process_name)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn start_run(&self, run_type: &str, requested_start_date: NaiveDate) -> EtlResult<LogId> {
        let log_id: i64 = sqlx::query_scalar(
            r#"
            insert into celoeapi.etl_scheduler_logs
                (status, type, requested_start_date, start_time, "offset", row_count, created_at)
            values ($1, $2, $3, now(), 0, 0, now())
            returning id
            "#,
        )
        .bind(RunStatus::Running.as_i16())
        .bind(run_type)
        .bind(requested_start_date)
        .fetch_one(&self.pool)
        .await?;

        Ok(log_id)
    }

    async fn mark_progress(&self, log_id: LogId, offset: i64, row_count: i64) -> EtlResult<()> {
        sqlx::query(
            r#"
            update celoeapi.etl_scheduler_logs
            set "offset" = $2, row_count = $3
            where id = $1 and status = $4
            "#,
        )
        .bind(log_id)
        .bind(offset)
        .bind(row_count)
        .bind(RunStatus::Running.as_i16())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn complete_run(
        &self,
        log_id: LogId,
        row_count: i64,
        extracted_start_date: NaiveDate,
        extracted_end_date: NaiveDate,
    ) -> EtlResult<()> {
        sqlx::query(
            r#"
            update celoeapi.etl_scheduler_logs
            set status = $2,
                row_count = $3,
                extracted_start_date = $4,
                extracted_end_date = $5,
                end_time = now(),
                duration_seconds = extract(epoch from now() - start_time)::bigint
            where id = $1
            "#,
        )
        .bind(log_id)
        .bind(RunStatus::Finished.as_i16())
        .bind(row_count)
        .bind(extracted_start_date)
        .bind(extracted_end_date)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fail_run(&self, log_id: LogId, message: &str) -> EtlResult<()> {
        sqlx::query(
            r#"
            update celoeapi.etl_scheduler_logs
            set status = $2,
                message = $3,
                end_time = now(),
                duration_seconds = extract(epoch from now() - start_time)::bigint
            where id = $1
            "#,
        )
        .bind(log_id)
        .bind(RunStatus::Failed.as_i16())
        .bind(message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn append_realtime(
        &self,
        log_id: LogId,
        level: LogLevel,
        message: &str,
        progress: Option<f64>,
    ) -> EtlResult<()> {
        // Lazy schema creation: the stream table may not have been migrated
        // yet when the first run executes.
        sqlx::query(
            r#"
            create table if not exists celoeapi.etl_realtime_logs (
                id bigint generated always as identity primary key,
                log_id bigint not null,
                logged_at timestamptz not null default now(),
                level text not null,
                message text not null,
                progress double precision
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            insert into celoeapi.etl_realtime_logs (log_id, level, message, progress)
            values ($1, $2, $3, $4)
            "#,
        )
        .bind(log_id)
        .bind(level.as_str())
        .bind(message)
        .bind(progress)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_run(&self, log_id: LogId) -> EtlResult<Option<SchedulerLogRecord>> {
        let row = sqlx::query(
            r#"
            select id, status, type, requested_start_date, extracted_start_date,
                   extracted_end_date, start_time, end_time, duration_seconds,
                   "offset", row_count, message, created_at
            from celoeapi.etl_scheduler_logs
            where id = $1
            "#,
        )
        .bind(log_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| Self::record_from_row(&row)).transpose()
    }

    async fn latest_run(&self, run_type: Option<&str>) -> EtlResult<Option<SchedulerLogRecord>> {
        let row = sqlx::query(
            r#"
            select id, status, type, requested_start_date, extracted_start_date,
                   extracted_end_date, start_time, end_time, duration_seconds,
                   "offset", row_count, message, created_at
            from celoeapi.etl_scheduler_logs
            where ($1::text is null or type = $1)
            order by created_at desc, id desc
            limit 1
            "#,
        )
        .bind(run_type)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| Self::record_from_row(&row)).transpose()
    }

    async fn list_runs(&self, filter: &LogFilter) -> EtlResult<Vec<SchedulerLogRecord>> {
        let limit = if filter.limit == 0 { 50 } else { filter.limit };

        let rows = sqlx::query(
            r#"
            select id, status, type, requested_start_date, extracted_start_date,
                   extracted_end_date, start_time, end_time, duration_seconds,
                   "offset", row_count, message, created_at
            from celoeapi.etl_scheduler_logs
            where ($1::text is null or type = $1)
              and ($2::smallint is null or status = $2)
            order by created_at desc, id desc
            limit $3 offset $4
            "#,
        )
        .bind(filter.run_type.as_deref())
        .bind(filter.status.map(|status| status.as_i16()))
        .bind(limit as i64)
        .bind(filter.offset() as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::record_from_row).collect()
    }

    async fn stuck_runs(&self, cutoff: DateTime<Utc>) -> EtlResult<Vec<SchedulerLogRecord>> {
        let rows = sqlx::query(
            r#"
            select id, status, type, requested_start_date, extracted_start_date,
                   extracted_end_date, start_time, end_time, duration_seconds,
                   "offset", row_count, message, created_at
            from celoeapi.etl_scheduler_logs
            where status = $1 and start_time < $2
            "#,
        )
        .bind(RunStatus::Running.as_i16())
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::record_from_row).collect()
    }

    async fn unfinished_runs(&self, cutoff: DateTime<Utc>) -> EtlResult<Vec<SchedulerLogRecord>> {
        let rows = sqlx::query(
            r#"
            select id, status, type, requested_start_date, extracted_start_date,
                   extracted_end_date, start_time, end_time, duration_seconds,
                   "offset", row_count, message, created_at
            from celoeapi.etl_scheduler_logs
            where end_time is null and start_time < $1
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::record_from_row).collect()
    }

    async fn force_fail_run(&self, log_id: LogId, message: &str) -> EtlResult<bool> {
        // The where clause re-checks staleness at update time: a row that
        // finished in the interim has an end_time and a terminal status, so it
        // is left alone.
        let result = sqlx::query(
            r#"
            update celoeapi.etl_scheduler_logs
            set status = $2,
                message = $3,
                end_time = now(),
                duration_seconds = extract(epoch from now() - start_time)::bigint
            where id = $1 and (status = $4 or end_time is null)
            "#,
        )
        .bind(log_id)
        .bind(RunStatus::Failed.as_i16())
        .bind(message)
        .bind(RunStatus::Running.as_i16())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
