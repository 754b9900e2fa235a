use std::future::Future;

use chrono::NaiveDate;

use crate::error::EtlResult;
use crate::tables::TableSpec;
use crate::types::TargetRow;

/// Write access to the reporting database.
///
/// Fact tables are replaced one extraction window at a time: delete the
/// window, then insert the fresh rows in chunks. Each chunk commits in its own
/// transaction, which bounds transaction size on wide windows; a failed chunk
/// leaves earlier chunks committed, and the delete-then-insert retry converges
/// on the correct state.
pub trait Destination {
    /// Whether the target table exists. Probed before loading so a partially
    /// migrated schema degrades to a skipped table instead of a failed run.
    fn table_exists(&self, table: &str) -> impl Future<Output = EtlResult<bool>> + Send;

    /// Deletes all rows of one extraction window. Returns the deleted count.
    fn delete_window(
        &self,
        spec: &TableSpec,
        date: NaiveDate,
    ) -> impl Future<Output = EtlResult<u64>> + Send;

    /// Inserts one chunk of rows in its own transaction. Returns the inserted
    /// count.
    fn insert_chunk(
        &self,
        spec: &TableSpec,
        rows: &[TargetRow],
    ) -> impl Future<Output = EtlResult<u64>> + Send;

    /// Removes every row of a table. Used by explicit clear operations.
    fn truncate(&self, spec: &TableSpec) -> impl Future<Output = EtlResult<()>> + Send;

    /// Inserts or updates dimension rows by their natural key.
    fn upsert_dimension(
        &self,
        spec: &TableSpec,
        rows: &[TargetRow],
    ) -> impl Future<Output = EtlResult<u64>> + Send;

    /// Rebuilds the per-course summary for one extraction date from the fact
    /// tables already loaded for that date. Returns the summary row count.
    fn rebuild_course_summary(
        &self,
        date: NaiveDate,
    ) -> impl Future<Output = EtlResult<u64>> + Send;
}
