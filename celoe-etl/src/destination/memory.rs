use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::Mutex;

use crate::bail;
use crate::destination::base::Destination;
use crate::error::{ErrorKind, EtlResult};
use crate::tables::TableSpec;
use crate::types::{Cell, TargetRow};

#[derive(Debug, Default)]
struct Inner {
    /// Rows per table, in insertion order.
    tables: HashMap<String, Vec<TargetRow>>,
    missing_tables: HashSet<String>,
    summary_rows: HashMap<NaiveDate, u64>,
    chunks_inserted: u64,
    fail_after_chunks: Option<u64>,
}

/// In-memory destination for tests.
///
/// Supports the same operations as the Postgres destination and adds fault
/// injection: a table can be declared missing, and inserts can be made to fail
/// after a fixed number of chunks to exercise the partial-load retry path.
#[derive(Debug, Clone, Default)]
pub struct MemoryDestination {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a table missing, so `table_exists` reports false for it.
    pub async fn set_table_missing(&self, table: &str) {
        let mut inner = self.inner.lock().await;
        inner.missing_tables.insert(table.to_string());
    }

    /// Makes every insert after the first `chunks` chunks fail.
    pub async fn fail_after_chunks(&self, chunks: u64) {
        let mut inner = self.inner.lock().await;
        inner.fail_after_chunks = Some(chunks);
    }

    /// Clears fault injection so subsequent inserts succeed again.
    pub async fn heal(&self) {
        let mut inner = self.inner.lock().await;
        inner.fail_after_chunks = None;
    }

    /// Returns a copy of all rows currently in `table`.
    pub async fn table_rows(&self, table: &str) -> Vec<TargetRow> {
        let inner = self.inner.lock().await;
        inner.tables.get(table).cloned().unwrap_or_default()
    }

    /// Returns the rows of `table` whose extraction date equals `date`,
    /// assuming the date is the last cell as it is for every fact table.
    pub async fn window_rows(&self, table: &str, date: NaiveDate) -> Vec<TargetRow> {
        let inner = self.inner.lock().await;
        inner
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| row.values().last() == Some(&Cell::Date(date)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns the number of summary rows recorded for `date`.
    pub async fn summary_row_count(&self, date: NaiveDate) -> u64 {
        let inner = self.inner.lock().await;
        inner.summary_rows.get(&date).copied().unwrap_or(0)
    }
}

impl Destination for MemoryDestination {
    async fn table_exists(&self, table: &str) -> EtlResult<bool> {
        let inner = self.inner.lock().await;
        Ok(!inner.missing_tables.contains(table))
    }

    async fn delete_window(&self, spec: &TableSpec, date: NaiveDate) -> EtlResult<u64> {
        let mut inner = self.inner.lock().await;
        let Some(rows) = inner.tables.get_mut(spec.table) else {
            return Ok(0);
        };

        let before = rows.len();
        rows.retain(|row| row.values().last() != Some(&Cell::Date(date)));

        Ok((before - rows.len()) as u64)
    }

    async fn insert_chunk(&self, spec: &TableSpec, rows: &[TargetRow]) -> EtlResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut inner = self.inner.lock().await;
        if let Some(limit) = inner.fail_after_chunks
            && inner.chunks_inserted >= limit
        {
            bail!(
                ErrorKind::LoadChunkFailed,
                "Failed to insert a chunk of rows into the target table",
                spec.table
            );
        }

        inner.chunks_inserted += 1;
        inner
            .tables
            .entry(spec.table.to_string())
            .or_default()
            .extend_from_slice(rows);

        Ok(rows.len() as u64)
    }

    async fn truncate(&self, spec: &TableSpec) -> EtlResult<()> {
        let mut inner = self.inner.lock().await;
        inner.tables.remove(spec.table);
        Ok(())
    }

    async fn upsert_dimension(&self, spec: &TableSpec, rows: &[TargetRow]) -> EtlResult<u64> {
        let key_positions: Vec<usize> = spec
            .columns
            .iter()
            .enumerate()
            .filter(|(_, column)| spec.conflict_key.contains(&column.name))
            .map(|(position, _)| position)
            .collect();

        let mut inner = self.inner.lock().await;
        let table = inner.tables.entry(spec.table.to_string()).or_default();

        for row in rows {
            let key = |candidate: &TargetRow| {
                key_positions
                    .iter()
                    .map(|&position| candidate.values()[position].clone())
                    .collect::<Vec<_>>()
            };

            match table.iter_mut().find(|existing| key(existing) == key(row)) {
                Some(existing) => *existing = row.clone(),
                None => table.push(row.clone()),
            }
        }

        Ok(rows.len() as u64)
    }

    async fn rebuild_course_summary(&self, date: NaiveDate) -> EtlResult<u64> {
        let mut inner = self.inner.lock().await;

        // Summary cardinality follows the activity fact: one row per course
        // that saw activity in the window.
        let count = inner
            .tables
            .get("activity_counts_etl")
            .map(|rows| {
                rows.iter()
                    .filter(|row| row.values().last() == Some(&Cell::Date(date)))
                    .count() as u64
            })
            .unwrap_or(0);

        inner.summary_rows.insert(date, count);

        Ok(count)
    }
}
