use std::fmt::Write;

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{PgPool, Postgres};
use tracing::debug;

use crate::bail;
use crate::destination::base::Destination;
use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;
use crate::tables::{COURSE_SUMMARY_TABLE, ColumnType, TableSpec};
use crate::types::{Cell, TargetRow};

/// Schema holding every table this engine writes.
pub const TARGET_SCHEMA: &str = "celoeapi";

/// Destination backed by the Postgres reporting database.
#[derive(Debug, Clone)]
pub struct PostgresDestination {
    pool: PgPool,
}

impl PostgresDestination {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Builds a multi-row insert statement with one placeholder per cell.
fn insert_statement(spec: &TableSpec, row_count: usize) -> String {
    let columns: Vec<&str> = spec.column_names().collect();
    let width = spec.columns.len();

    let mut sql = format!(
        "insert into {TARGET_SCHEMA}.{} ({}) values ",
        spec.table,
        columns.join(", ")
    );

    for row in 0..row_count {
        if row > 0 {
            sql.push_str(", ");
        }
        sql.push('(');
        for column in 0..width {
            if column > 0 {
                sql.push_str(", ");
            }
            let _ = write!(sql, "${}", row * width + column + 1);
        }
        sql.push(')');
    }

    sql
}

/// Appends the conflict clause that turns an insert into an upsert.
fn upsert_clause(spec: &TableSpec) -> String {
    let updates: Vec<String> = spec
        .non_key_columns()
        .map(|column| format!("{column} = excluded.{column}"))
        .collect();

    format!(
        " on conflict ({}) do update set {}",
        spec.conflict_key.join(", "),
        updates.join(", ")
    )
}

fn bind_cell<'q>(
    query: Query<'q, Postgres, PgArguments>,
    cell: &Cell,
    ty: ColumnType,
) -> Query<'q, Postgres, PgArguments> {
    match cell {
        // Nulls are bound with the column's concrete type so statement
        // preparation does not have to guess.
        Cell::Null => match ty {
            ColumnType::BigInt => query.bind(None::<i64>),
            ColumnType::Double => query.bind(None::<f64>),
            ColumnType::Text => query.bind(None::<String>),
            ColumnType::Date => query.bind(None::<NaiveDate>),
            ColumnType::TimestampTz => query.bind(None::<DateTime<Utc>>),
        },
        Cell::I32(value) => query.bind(i64::from(*value)),
        Cell::I64(value) => query.bind(*value),
        Cell::F64(value) => query.bind(*value),
        Cell::String(value) => query.bind(value.clone()),
        Cell::Date(value) => query.bind(*value),
        Cell::TimestampTz(value) => query.bind(*value),
    }
}

fn check_row_shape(spec: &TableSpec, rows: &[TargetRow]) -> EtlResult<()> {
    for row in rows {
        if row.values().len() != spec.columns.len() {
            bail!(
                ErrorKind::ConversionError,
                "Extracted row does not match the target table's column count",
                format!(
                    "table {} expects {} columns, row has {}",
                    spec.table,
                    spec.columns.len(),
                    row.values().len()
                )
            );
        }
    }

    Ok(())
}

fn bind_rows<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    spec: &TableSpec,
    rows: &[TargetRow],
) -> Query<'q, Postgres, PgArguments> {
    for row in rows {
        for (cell, column) in row.values().iter().zip(spec.columns) {
            query = bind_cell(query, cell, column.ty);
        }
    }

    query
}

impl Destination for PostgresDestination {
    async fn table_exists(&self, table: &str) -> EtlResult<bool> {
        let exists: bool = sqlx::query_scalar("select to_regclass($1) is not null")
            .bind(format!("{TARGET_SCHEMA}.{table}"))
            .fetch_one(&self.pool)
            .await?;

        Ok(exists)
    }

    async fn delete_window(&self, spec: &TableSpec, date: NaiveDate) -> EtlResult<u64> {
        let result = sqlx::query(&format!(
            "delete from {TARGET_SCHEMA}.{} where extraction_date = $1",
            spec.table
        ))
        .bind(date)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            etl_error!(
                ErrorKind::TargetQueryFailed,
                "Failed to delete the extraction window from the target table",
                spec.table,
                source: err
            )
        })?;

        debug!(table = spec.table, %date, deleted = result.rows_affected(), "cleared window");

        Ok(result.rows_affected())
    }

    async fn insert_chunk(&self, spec: &TableSpec, rows: &[TargetRow]) -> EtlResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        check_row_shape(spec, rows)?;

        let sql = insert_statement(spec, rows.len());
        let query = bind_rows(sqlx::query(&sql), spec, rows);

        // One transaction per chunk keeps individual transactions small and
        // makes partial progress visible to the retry path.
        let mut tx = self.pool.begin().await?;
        let result = query.execute(&mut *tx).await.map_err(|err| {
            etl_error!(
                ErrorKind::LoadChunkFailed,
                "Failed to insert a chunk of rows into the target table",
                spec.table,
                source: err
            )
        })?;
        tx.commit().await?;

        Ok(result.rows_affected())
    }

    async fn truncate(&self, spec: &TableSpec) -> EtlResult<()> {
        sqlx::query(&format!("truncate table {TARGET_SCHEMA}.{}", spec.table))
            .execute(&self.pool)
            .await
            .map_err(|err| {
                etl_error!(
                    ErrorKind::TargetQueryFailed,
                    "Failed to truncate the target table",
                    spec.table,
                    source: err
                )
            })?;

        Ok(())
    }

    async fn upsert_dimension(&self, spec: &TableSpec, rows: &[TargetRow]) -> EtlResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        check_row_shape(spec, rows)?;

        let mut sql = insert_statement(spec, rows.len());
        sql.push_str(&upsert_clause(spec));
        let query = bind_rows(sqlx::query(&sql), spec, rows);

        let result = query.execute(&self.pool).await.map_err(|err| {
            etl_error!(
                ErrorKind::TargetQueryFailed,
                "Failed to upsert dimension rows into the target table",
                spec.table,
                source: err
            )
        })?;

        Ok(result.rows_affected())
    }

    async fn rebuild_course_summary(&self, date: NaiveDate) -> EtlResult<u64> {
        // The summary is derived data, so it is rebuilt atomically with its
        // window delete.
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "delete from {TARGET_SCHEMA}.{COURSE_SUMMARY_TABLE} where extraction_date = $1"
        ))
        .bind(date)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(&format!(
            r#"
            insert into {TARGET_SCHEMA}.{COURSE_SUMMARY_TABLE}
                (course_id, file_views, video_views, forum_views, quiz_views,
                 assignment_views, url_views, active_users, num_teachers,
                 num_students, extraction_date)
            select a.course_id,
                   a.file_views,
                   a.video_views,
                   a.forum_views,
                   a.quiz_views,
                   a.assignment_views,
                   a.url_views,
                   a.active_users,
                   coalesce(u.num_teachers, 0),
                   coalesce(u.num_students, 0),
                   a.extraction_date
            from {TARGET_SCHEMA}.activity_counts_etl a
            left join {TARGET_SCHEMA}.user_counts_etl u
                on u.course_id = a.course_id
               and u.extraction_date = a.extraction_date
            where a.extraction_date = $1
            "#
        ))
        .bind(date)
        .execute(&mut *tx)
        .await
        .map_err(|err| {
            etl_error!(
                ErrorKind::TargetQueryFailed,
                "Failed to rebuild the course summary table",
                source: err
            )
        })?;

        tx.commit().await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::{dimension_spec, fact_spec};
    use crate::types::{DimensionKind, FactKind};

    #[test]
    fn insert_statement_numbers_placeholders_row_major() {
        let spec = fact_spec(FactKind::UserCounts);
        let sql = insert_statement(spec, 2);

        assert_eq!(
            sql,
            "insert into celoeapi.user_counts_etl \
             (course_id, num_teachers, num_students, extraction_date) \
             values ($1, $2, $3, $4), ($5, $6, $7, $8)"
        );
    }

    #[test]
    fn upsert_clause_excludes_the_conflict_key() {
        let spec = dimension_spec(DimensionKind::CourseCategories);
        let clause = upsert_clause(spec);

        assert_eq!(
            clause,
            " on conflict (category_id) do update set \
             name = excluded.name, parent_id = excluded.parent_id, depth = excluded.depth"
        );
    }

    #[test]
    fn mismatched_row_shape_is_rejected() {
        let spec = fact_spec(FactKind::UserCounts);
        let rows = vec![TargetRow::new(vec![Cell::I64(1)])];

        let err = check_row_shape(spec, &rows).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConversionError);
    }
}
