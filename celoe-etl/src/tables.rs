//! Static descriptions of the target tables in the `celoeapi` schema.
//!
//! One [`TableSpec`] per table replaces per-table copies of the extract/load
//! code: the extractor shapes rows to a spec's column order and the loader
//! builds its delete/insert/upsert statements from the same spec.

use crate::types::{DimensionKind, FactKind};

/// Postgres type of a target column. Needed to bind typed nulls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    BigInt,
    Double,
    Text,
    Date,
    TimestampTz,
}

/// One column of a target table.
#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
}

const fn col(name: &'static str, ty: ColumnType) -> Column {
    Column { name, ty }
}

/// Shape of a target table.
#[derive(Debug, Clone, Copy)]
pub struct TableSpec {
    /// Table name, unqualified. The destination prefixes the schema.
    pub table: &'static str,
    /// Columns in insert order.
    pub columns: &'static [Column],
    /// Natural unique key used for dimension upserts. Empty for fact tables,
    /// which are replaced per extraction window instead.
    pub conflict_key: &'static [&'static str],
}

impl TableSpec {
    /// Column names in insert order.
    pub fn column_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns.iter().map(|column| column.name)
    }

    /// Columns updated by an upsert: every column not part of the conflict key.
    pub fn non_key_columns(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns
            .iter()
            .map(|column| column.name)
            .filter(|name| !self.conflict_key.contains(name))
    }
}

/// Column holding the logical extraction date in every fact table.
pub const EXTRACTION_DATE_COLUMN: &str = "extraction_date";

/// The summary table rebuilt from the fact tables after each run.
pub const COURSE_SUMMARY_TABLE: &str = "course_summary_etl";

static ACTIVITY_COUNTS: TableSpec = TableSpec {
    table: "activity_counts_etl",
    columns: &[
        col("course_id", ColumnType::BigInt),
        col("file_views", ColumnType::BigInt),
        col("video_views", ColumnType::BigInt),
        col("forum_views", ColumnType::BigInt),
        col("quiz_views", ColumnType::BigInt),
        col("assignment_views", ColumnType::BigInt),
        col("url_views", ColumnType::BigInt),
        col("active_users", ColumnType::BigInt),
        col("extraction_date", ColumnType::Date),
    ],
    conflict_key: &[],
};

static USER_COUNTS: TableSpec = TableSpec {
    table: "user_counts_etl",
    columns: &[
        col("course_id", ColumnType::BigInt),
        col("num_teachers", ColumnType::BigInt),
        col("num_students", ColumnType::BigInt),
        col("extraction_date", ColumnType::Date),
    ],
    conflict_key: &[],
};

static STUDENT_QUIZ_DETAIL: TableSpec = TableSpec {
    table: "student_quiz_detail_etl",
    columns: &[
        col("quiz_id", ColumnType::BigInt),
        col("user_id", ColumnType::BigInt),
        col("course_id", ColumnType::BigInt),
        col("attempt_number", ColumnType::BigInt),
        col("time_start", ColumnType::TimestampTz),
        col("time_finish", ColumnType::TimestampTz),
        col("grade", ColumnType::Double),
        col("extraction_date", ColumnType::Date),
    ],
    conflict_key: &[],
};

static STUDENT_ASSIGNMENT_DETAIL: TableSpec = TableSpec {
    table: "student_assignment_detail_etl",
    columns: &[
        col("assignment_id", ColumnType::BigInt),
        col("user_id", ColumnType::BigInt),
        col("course_id", ColumnType::BigInt),
        col("submission_status", ColumnType::Text),
        col("time_submitted", ColumnType::TimestampTz),
        col("grade", ColumnType::Double),
        col("extraction_date", ColumnType::Date),
    ],
    conflict_key: &[],
};

static STUDENT_RESOURCE_ACCESS: TableSpec = TableSpec {
    table: "student_resource_access_etl",
    columns: &[
        col("resource_id", ColumnType::BigInt),
        col("user_id", ColumnType::BigInt),
        col("course_id", ColumnType::BigInt),
        col("access_time", ColumnType::TimestampTz),
        col("extraction_date", ColumnType::Date),
    ],
    conflict_key: &[],
};

static COURSE_SUMMARY: TableSpec = TableSpec {
    table: COURSE_SUMMARY_TABLE,
    columns: &[
        col("course_id", ColumnType::BigInt),
        col("file_views", ColumnType::BigInt),
        col("video_views", ColumnType::BigInt),
        col("forum_views", ColumnType::BigInt),
        col("quiz_views", ColumnType::BigInt),
        col("assignment_views", ColumnType::BigInt),
        col("url_views", ColumnType::BigInt),
        col("active_users", ColumnType::BigInt),
        col("num_teachers", ColumnType::BigInt),
        col("num_students", ColumnType::BigInt),
        col("extraction_date", ColumnType::Date),
    ],
    conflict_key: &[],
};

static COURSE_CATEGORIES: TableSpec = TableSpec {
    table: "course_categories",
    columns: &[
        col("category_id", ColumnType::BigInt),
        col("name", ColumnType::Text),
        col("parent_id", ColumnType::BigInt),
        col("depth", ColumnType::BigInt),
    ],
    conflict_key: &["category_id"],
};

/// Returns the table spec for a fact kind.
pub fn fact_spec(kind: FactKind) -> &'static TableSpec {
    match kind {
        FactKind::ActivityCounts => &ACTIVITY_COUNTS,
        FactKind::UserCounts => &USER_COUNTS,
        FactKind::StudentQuizDetail => &STUDENT_QUIZ_DETAIL,
        FactKind::StudentAssignmentDetail => &STUDENT_ASSIGNMENT_DETAIL,
        FactKind::StudentResourceAccess => &STUDENT_RESOURCE_ACCESS,
    }
}

/// Returns the table spec of the derived per-course summary.
pub fn summary_spec() -> &'static TableSpec {
    &COURSE_SUMMARY
}

/// Returns the table spec for a dimension kind.
pub fn dimension_spec(kind: DimensionKind) -> &'static TableSpec {
    match kind {
        DimensionKind::CourseCategories => &COURSE_CATEGORIES,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_fact_table_ends_with_extraction_date() {
        for kind in FactKind::ALL {
            let spec = fact_spec(*kind);
            let last = spec.columns.last().unwrap();
            assert_eq!(last.name, EXTRACTION_DATE_COLUMN);
            assert_eq!(last.ty, ColumnType::Date);
            assert!(spec.conflict_key.is_empty());
        }
    }

    #[test]
    fn dimension_upsert_updates_only_non_key_columns() {
        let spec = dimension_spec(DimensionKind::CourseCategories);
        let non_key: Vec<_> = spec.non_key_columns().collect();
        assert_eq!(non_key, vec!["name", "parent_id", "depth"]);
    }
}
