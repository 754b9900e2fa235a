//! Core data types shared across the ETL engine.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::Serialize;

/// Identifier of a scheduler log row.
pub type LogId = i64;

/// A single calendar day treated as the unit of idempotent extract/load.
///
/// Windows are produced by the planner, dispatched by the coordinator and
/// consumed by exactly one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionWindow {
    /// The logical extraction date the loaded facts represent.
    pub date: NaiveDate,
    /// Concurrency slot assigned by the coordinator, for logging only.
    pub slot: u16,
}

impl ExtractionWindow {
    pub fn new(date: NaiveDate) -> Self {
        Self { date, slot: 0 }
    }

    /// Returns the half-open `[00:00, next day 00:00)` range of this window
    /// as UTC epoch seconds, matching the `timecreated` columns of the source.
    pub fn epoch_bounds(&self) -> (i64, i64) {
        let start = self.date.and_time(NaiveTime::MIN).and_utc().timestamp();
        let end = self
            .date
            .succ_opt()
            .unwrap_or(NaiveDate::MAX)
            .and_time(NaiveTime::MIN)
            .and_utc()
            .timestamp();

        (start, end)
    }
}

/// The fact tables produced by window-scoped extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FactKind {
    ActivityCounts,
    UserCounts,
    StudentQuizDetail,
    StudentAssignmentDetail,
    StudentResourceAccess,
}

impl FactKind {
    /// All fact kinds, in the order they are processed within a window.
    pub const ALL: &'static [FactKind] = &[
        FactKind::ActivityCounts,
        FactKind::UserCounts,
        FactKind::StudentQuizDetail,
        FactKind::StudentAssignmentDetail,
        FactKind::StudentResourceAccess,
    ];

    /// Stable name used as watermark process name and scheduler log type.
    pub fn process_name(&self) -> &'static str {
        match self {
            FactKind::ActivityCounts => "activity_counts",
            FactKind::UserCounts => "user_counts",
            FactKind::StudentQuizDetail => "student_quiz_detail",
            FactKind::StudentAssignmentDetail => "student_assignment_detail",
            FactKind::StudentResourceAccess => "student_resource_access",
        }
    }
}

/// Snapshot-style dimension tables kept current via upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DimensionKind {
    CourseCategories,
}

impl DimensionKind {
    pub fn process_name(&self) -> &'static str {
        match self {
            DimensionKind::CourseCategories => "course_categories",
        }
    }
}

/// Lifecycle status of a scheduler log row.
///
/// Stored as a smallint; the numeric values are part of the reporting API
/// contract and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Finished,
    Running,
    Failed,
}

impl RunStatus {
    pub fn as_i16(&self) -> i16 {
        match self {
            RunStatus::Pending => 0,
            RunStatus::Finished => 1,
            RunStatus::Running => 2,
            RunStatus::Failed => 3,
        }
    }

    pub fn from_i16(value: i16) -> Option<RunStatus> {
        match value {
            0 => Some(RunStatus::Pending),
            1 => Some(RunStatus::Finished),
            2 => Some(RunStatus::Running),
            3 => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

/// Severity of a realtime log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Debug,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Debug => "debug",
        }
    }
}

/// A typed value destined for one target column.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    I32(i32),
    I64(i64),
    F64(f64),
    String(String),
    Date(NaiveDate),
    TimestampTz(DateTime<Utc>),
}

/// A complete row of data shaped for a target table.
///
/// Values are ordered to match the column order of the table's
/// [`crate::tables::TableSpec`].
#[derive(Debug, Clone, PartialEq)]
pub struct TargetRow {
    values: Vec<Cell>,
}

impl TargetRow {
    pub fn new(values: Vec<Cell>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[Cell] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Cell> {
        self.values
    }
}

/// One row of the scheduler log table, tracking a full ETL run.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerLogRecord {
    pub id: LogId,
    pub status: RunStatus,
    pub run_type: String,
    pub requested_start_date: Option<NaiveDate>,
    pub extracted_start_date: Option<NaiveDate>,
    pub extracted_end_date: Option<NaiveDate>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub offset: i64,
    pub row_count: i64,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One append-only entry of the fine-grained realtime log stream.
#[derive(Debug, Clone, Serialize)]
pub struct RealtimeLogEntry {
    pub id: i64,
    pub log_id: LogId,
    pub logged_at: DateTime<Utc>,
    pub level: String,
    pub message: String,
    pub progress: Option<f64>,
}

/// Last successfully committed window boundary for a named process.
#[derive(Debug, Clone, PartialEq)]
pub struct WatermarkRecord {
    pub process_name: String,
    pub last_date: NaiveDate,
    pub last_timestamp: i64,
    pub updated_at: DateTime<Utc>,
}

/// Pagination and filtering options for scheduler log queries.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub run_type: Option<String>,
    pub status: Option<RunStatus>,
    pub page: u64,
    pub limit: u64,
}

impl LogFilter {
    /// Row offset implied by `page` and `limit`, with page numbering from 1.
    pub fn offset(&self) -> u64 {
        self.page.saturating_sub(1) * self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_bounds_are_half_open_one_day() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let (start, end) = ExtractionWindow::new(date).epoch_bounds();
        assert_eq!(end - start, 86_400);
        assert_eq!(start % 86_400, 0);
    }

    #[test]
    fn run_status_round_trips_through_i16() {
        for status in [
            RunStatus::Pending,
            RunStatus::Finished,
            RunStatus::Running,
            RunStatus::Failed,
        ] {
            assert_eq!(RunStatus::from_i16(status.as_i16()), Some(status));
        }
        assert_eq!(RunStatus::from_i16(7), None);
    }

    #[test]
    fn log_filter_offset_starts_at_page_one() {
        let filter = LogFilter {
            page: 1,
            limit: 25,
            ..Default::default()
        };
        assert_eq!(filter.offset(), 0);

        let filter = LogFilter {
            page: 3,
            limit: 25,
            ..Default::default()
        };
        assert_eq!(filter.offset(), 50);
    }
}
