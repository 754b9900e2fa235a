use chrono::DateTime;
use sqlx::mysql::MySqlRow;
use sqlx::{MySqlPool, Row};

use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;
use crate::source::base::SourceReader;
use crate::types::{Cell, DimensionKind, ExtractionWindow, FactKind, TargetRow};

/// Moodle components whose `viewed` events count as file views.
const FILE_COMPONENT: &str = "mod_resource";
/// Interactive video content is delivered through H5P on this platform.
const VIDEO_COMPONENT: &str = "mod_hvp";
const FORUM_COMPONENT: &str = "mod_forum";
const QUIZ_COMPONENT: &str = "mod_quiz";
const ASSIGNMENT_COMPONENT: &str = "mod_assign";
const URL_COMPONENT: &str = "mod_url";

/// Reads fact and dimension rows from a Moodle MySQL database.
///
/// All queries are read-only and parameterized; window-scoped queries filter
/// on `timecreated >= start and timecreated < end` so a calendar day maps to
/// exactly one half-open epoch range. Pages are ordered by a stable key
/// (course id or source row id) so offset pagination never skips or repeats
/// rows within a window.
#[derive(Debug, Clone)]
pub struct MoodleSourceReader {
    pool: MySqlPool,
}

impl MoodleSourceReader {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    async fn count_activity_courses(&self, start: i64, end: i64) -> EtlResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            select count(distinct l.courseid)
            from mdl_logstore_standard_log l
            where l.action = 'viewed'
              and l.courseid > 1
              and l.timecreated >= ? and l.timecreated < ?
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn fetch_activity_counts(
        &self,
        window: &ExtractionWindow,
        start: i64,
        end: i64,
        offset: i64,
        limit: i64,
    ) -> EtlResult<Vec<TargetRow>> {
        let rows = sqlx::query(
            r#"
            select l.courseid as course_id,
                   cast(sum(l.component = ?) as signed) as file_views,
                   cast(sum(l.component = ?) as signed) as video_views,
                   cast(sum(l.component = ?) as signed) as forum_views,
                   cast(sum(l.component = ?) as signed) as quiz_views,
                   cast(sum(l.component = ?) as signed) as assignment_views,
                   cast(sum(l.component = ?) as signed) as url_views,
                   count(distinct l.userid) as active_users
            from mdl_logstore_standard_log l
            where l.action = 'viewed'
              and l.courseid > 1
              and l.timecreated >= ? and l.timecreated < ?
            group by l.courseid
            order by l.courseid
            limit ? offset ?
            "#,
        )
        .bind(FILE_COMPONENT)
        .bind(VIDEO_COMPONENT)
        .bind(FORUM_COMPONENT)
        .bind(QUIZ_COMPONENT)
        .bind(ASSIGNMENT_COMPONENT)
        .bind(URL_COMPONENT)
        .bind(start)
        .bind(end)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(TargetRow::new(vec![
                    Cell::I64(row.try_get("course_id")?),
                    Cell::I64(row.try_get("file_views")?),
                    Cell::I64(row.try_get("video_views")?),
                    Cell::I64(row.try_get("forum_views")?),
                    Cell::I64(row.try_get("quiz_views")?),
                    Cell::I64(row.try_get("assignment_views")?),
                    Cell::I64(row.try_get("url_views")?),
                    Cell::I64(row.try_get("active_users")?),
                    Cell::Date(window.date),
                ]))
            })
            .collect()
    }

    async fn count_enrolled_courses(&self) -> EtlResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            select count(distinct c.id)
            from mdl_course c
            join mdl_context ctx on ctx.instanceid = c.id and ctx.contextlevel = 50
            join mdl_role_assignments ra on ra.contextid = ctx.id
            where c.id > 1
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Enrolment counts are a snapshot, not an event aggregate: the window
    /// only stamps the extraction date on the rows.
    async fn fetch_user_counts(
        &self,
        window: &ExtractionWindow,
        offset: i64,
        limit: i64,
    ) -> EtlResult<Vec<TargetRow>> {
        let rows = sqlx::query(
            r#"
            select c.id as course_id,
                   cast(count(distinct case
                       when r.shortname in ('editingteacher', 'teacher') then ra.userid
                   end) as signed) as num_teachers,
                   cast(count(distinct case
                       when r.shortname = 'student' then ra.userid
                   end) as signed) as num_students
            from mdl_course c
            join mdl_context ctx on ctx.instanceid = c.id and ctx.contextlevel = 50
            join mdl_role_assignments ra on ra.contextid = ctx.id
            join mdl_role r on r.id = ra.roleid
            where c.id > 1
            group by c.id
            order by c.id
            limit ? offset ?
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(TargetRow::new(vec![
                    Cell::I64(row.try_get("course_id")?),
                    Cell::I64(row.try_get("num_teachers")?),
                    Cell::I64(row.try_get("num_students")?),
                    Cell::Date(window.date),
                ]))
            })
            .collect()
    }

    async fn count_quiz_attempts(&self, start: i64, end: i64) -> EtlResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            select count(*)
            from mdl_quiz_attempts qa
            where qa.timestart >= ? and qa.timestart < ?
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn fetch_quiz_detail(
        &self,
        window: &ExtractionWindow,
        start: i64,
        end: i64,
        offset: i64,
        limit: i64,
    ) -> EtlResult<Vec<TargetRow>> {
        let rows = sqlx::query(
            r#"
            select qa.quiz as quiz_id,
                   qa.userid as user_id,
                   q.course as course_id,
                   qa.attempt as attempt_number,
                   qa.timestart as time_start,
                   qa.timefinish as time_finish,
                   cast(qa.sumgrades as double) as grade
            from mdl_quiz_attempts qa
            join mdl_quiz q on q.id = qa.quiz
            where qa.timestart >= ? and qa.timestart < ?
            order by qa.id
            limit ? offset ?
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let grade: Option<f64> = row.try_get("grade")?;
                Ok(TargetRow::new(vec![
                    Cell::I64(row.try_get("quiz_id")?),
                    Cell::I64(row.try_get("user_id")?),
                    Cell::I64(row.try_get("course_id")?),
                    Cell::I64(row.try_get("attempt_number")?),
                    epoch_cell(row, "time_start")?,
                    epoch_cell(row, "time_finish")?,
                    grade.map_or(Cell::Null, Cell::F64),
                    Cell::Date(window.date),
                ]))
            })
            .collect()
    }

    async fn count_assignment_submissions(&self, start: i64, end: i64) -> EtlResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            select count(*)
            from mdl_assign_submission s
            where s.latest = 1
              and s.timemodified >= ? and s.timemodified < ?
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn fetch_assignment_detail(
        &self,
        window: &ExtractionWindow,
        start: i64,
        end: i64,
        offset: i64,
        limit: i64,
    ) -> EtlResult<Vec<TargetRow>> {
        let rows = sqlx::query(
            r#"
            select s.assignment as assignment_id,
                   s.userid as user_id,
                   a.course as course_id,
                   s.status as submission_status,
                   s.timemodified as time_submitted,
                   cast(g.grade as double) as grade
            from mdl_assign_submission s
            join mdl_assign a on a.id = s.assignment
            left join mdl_assign_grades g
                on g.assignment = s.assignment and g.userid = s.userid
            where s.latest = 1
              and s.timemodified >= ? and s.timemodified < ?
            order by s.id
            limit ? offset ?
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let grade: Option<f64> = row.try_get("grade")?;
                Ok(TargetRow::new(vec![
                    Cell::I64(row.try_get("assignment_id")?),
                    Cell::I64(row.try_get("user_id")?),
                    Cell::I64(row.try_get("course_id")?),
                    Cell::String(row.try_get("submission_status")?),
                    epoch_cell(row, "time_submitted")?,
                    grade.map_or(Cell::Null, Cell::F64),
                    Cell::Date(window.date),
                ]))
            })
            .collect()
    }

    async fn count_resource_views(&self, start: i64, end: i64) -> EtlResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            select count(*)
            from mdl_logstore_standard_log l
            where l.component = ?
              and l.action = 'viewed'
              and l.contextlevel = 70
              and l.timecreated >= ? and l.timecreated < ?
            "#,
        )
        .bind(FILE_COMPONENT)
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn fetch_resource_access(
        &self,
        window: &ExtractionWindow,
        start: i64,
        end: i64,
        offset: i64,
        limit: i64,
    ) -> EtlResult<Vec<TargetRow>> {
        let rows = sqlx::query(
            r#"
            select cm.instance as resource_id,
                   l.userid as user_id,
                   l.courseid as course_id,
                   l.timecreated as access_time
            from mdl_logstore_standard_log l
            join mdl_course_modules cm on cm.id = l.contextinstanceid
            where l.component = ?
              and l.action = 'viewed'
              and l.contextlevel = 70
              and l.timecreated >= ? and l.timecreated < ?
            order by l.id
            limit ? offset ?
            "#,
        )
        .bind(FILE_COMPONENT)
        .bind(start)
        .bind(end)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(TargetRow::new(vec![
                    Cell::I64(row.try_get("resource_id")?),
                    Cell::I64(row.try_get("user_id")?),
                    Cell::I64(row.try_get("course_id")?),
                    epoch_cell(row, "access_time")?,
                    Cell::Date(window.date),
                ]))
            })
            .collect()
    }
}

/// Converts an epoch-seconds column to a timestamp cell. Moodle stores `0`
/// for "never happened" timestamps, which maps to null.
fn epoch_cell(row: &MySqlRow, column: &str) -> EtlResult<Cell> {
    let seconds: i64 = row.try_get(column)?;
    if seconds == 0 {
        return Ok(Cell::Null);
    }

    let timestamp = DateTime::from_timestamp(seconds, 0).ok_or_else(|| {
        etl_error!(
            ErrorKind::ConversionError,
            "Epoch seconds are out of the representable timestamp range",
            format!("{column} = {seconds}")
        )
    })?;

    Ok(Cell::TimestampTz(timestamp))
}

impl SourceReader for MoodleSourceReader {
    async fn check_connectivity(&self) -> EtlResult<()> {
        sqlx::query("select 1")
            .execute(&self.pool)
            .await
            .map_err(|err| {
                etl_error!(
                    ErrorKind::SourceUnavailable,
                    "The LMS database did not respond to a connectivity probe",
                    source: err
                )
            })?;

        Ok(())
    }

    async fn count_rows(&self, kind: FactKind, window: &ExtractionWindow) -> EtlResult<i64> {
        let (start, end) = window.epoch_bounds();

        match kind {
            FactKind::ActivityCounts => self.count_activity_courses(start, end).await,
            FactKind::UserCounts => self.count_enrolled_courses().await,
            FactKind::StudentQuizDetail => self.count_quiz_attempts(start, end).await,
            FactKind::StudentAssignmentDetail => {
                self.count_assignment_submissions(start, end).await
            }
            FactKind::StudentResourceAccess => self.count_resource_views(start, end).await,
        }
    }

    async fn fetch_page(
        &self,
        kind: FactKind,
        window: &ExtractionWindow,
        offset: i64,
        limit: i64,
    ) -> EtlResult<Vec<TargetRow>> {
        let (start, end) = window.epoch_bounds();

        match kind {
            FactKind::ActivityCounts => {
                self.fetch_activity_counts(window, start, end, offset, limit)
                    .await
            }
            FactKind::UserCounts => self.fetch_user_counts(window, offset, limit).await,
            FactKind::StudentQuizDetail => {
                self.fetch_quiz_detail(window, start, end, offset, limit)
                    .await
            }
            FactKind::StudentAssignmentDetail => {
                self.fetch_assignment_detail(window, start, end, offset, limit)
                    .await
            }
            FactKind::StudentResourceAccess => {
                self.fetch_resource_access(window, start, end, offset, limit)
                    .await
            }
        }
    }

    async fn list_dimension(&self, kind: DimensionKind) -> EtlResult<Vec<TargetRow>> {
        match kind {
            DimensionKind::CourseCategories => {
                let rows = sqlx::query(
                    r#"
                    select cc.id as category_id,
                           cc.name,
                           cc.parent as parent_id,
                           cc.depth
                    from mdl_course_categories cc
                    order by cc.id
                    "#,
                )
                .fetch_all(&self.pool)
                .await?;

                rows.iter()
                    .map(|row| {
                        let parent_id: i64 = row.try_get("parent_id")?;
                        Ok(TargetRow::new(vec![
                            Cell::I64(row.try_get("category_id")?),
                            Cell::String(row.try_get("name")?),
                            // Moodle encodes "top level" as parent = 0.
                            if parent_id == 0 {
                                Cell::Null
                            } else {
                                Cell::I64(parent_id)
                            },
                            Cell::I64(row.try_get("depth")?),
                        ]))
                    })
                    .collect()
            }
        }
    }
}
