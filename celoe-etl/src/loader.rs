//! Window-idempotent loading of extracted rows into the reporting database.

use std::future::Future;

use celoe_config::shared::BatchConfig;
use tracing::{debug, info, warn};

use crate::concurrency::memory_guard::MemoryGuard;
use crate::destination::base::Destination;
use crate::error::EtlResult;
use crate::source::base::SourceReader;
use crate::tables::{TableSpec, dimension_spec, fact_spec};
use crate::types::{DimensionKind, ExtractionWindow, FactKind};

/// Observes page-level progress while a fact window loads.
///
/// The loader counts the source rows up front and reports after every page
/// with the rows loaded so far against that total. Reports are advisory, so
/// the callback is infallible.
pub trait ProgressObserver {
    fn on_progress(
        &self,
        kind: FactKind,
        loaded: u64,
        total: i64,
    ) -> impl Future<Output = ()> + Send;
}

/// The unit observer discards progress reports.
impl ProgressObserver for () {
    async fn on_progress(&self, _kind: FactKind, _loaded: u64, _total: i64) {}
}

/// Replaces fact windows and refreshes dimensions.
///
/// A fact window load is delete-then-insert: the window's rows are removed and
/// the fresh extraction is inserted page by page, each insert chunk in its own
/// transaction. Running the same load twice therefore converges on the same
/// state, which is what makes failed runs safe to retry.
#[derive(Debug, Clone)]
pub struct IdempotentLoader<R, D> {
    source: R,
    destination: D,
    batch: BatchConfig,
    memory_guard: Option<MemoryGuard>,
}

impl<R: SourceReader, D: Destination> IdempotentLoader<R, D> {
    pub fn new(source: R, destination: D, batch: BatchConfig) -> Self {
        Self {
            source,
            destination,
            batch,
            memory_guard: None,
        }
    }

    /// Enables memory ceiling checks between extraction pages.
    pub fn with_memory_guard(mut self, guard: MemoryGuard) -> Self {
        self.memory_guard = Some(guard);
        self
    }

    /// Loads one fact for one extraction window. Returns the inserted row
    /// count.
    ///
    /// A missing target table is not an error: the load is skipped with a
    /// warning so one unmigrated table does not fail the whole run.
    pub async fn load_fact_window(
        &self,
        kind: FactKind,
        window: &ExtractionWindow,
    ) -> EtlResult<u64> {
        self.load_fact_window_observed(kind, window, &()).await
    }

    /// Like [`Self::load_fact_window`], reporting page-level progress to the
    /// observer.
    pub async fn load_fact_window_observed<P>(
        &self,
        kind: FactKind,
        window: &ExtractionWindow,
        observer: &P,
    ) -> EtlResult<u64>
    where
        P: ProgressObserver + Sync,
    {
        let spec = fact_spec(kind);

        if !self.destination.table_exists(spec.table).await? {
            warn!(
                table = spec.table,
                "target table does not exist, skipping load"
            );
            return Ok(0);
        }

        let total = self.source.count_rows(kind, window).await?;

        let deleted = self.destination.delete_window(spec, window.date).await?;
        debug!(
            table = spec.table,
            date = %window.date,
            deleted,
            expected = total,
            "replaced extraction window"
        );

        match self.fill_window(spec, kind, window, total, observer).await {
            Ok(inserted) => {
                info!(
                    process = kind.process_name(),
                    date = %window.date,
                    rows = inserted,
                    "loaded fact window"
                );
                Ok(inserted)
            }
            Err(err) => {
                // A failed load must leave the window empty, never partially
                // filled, so the chunks committed before the failure are
                // removed before the error propagates.
                if let Err(cleanup) = self.destination.delete_window(spec, window.date).await {
                    warn!(
                        table = spec.table,
                        date = %window.date,
                        error = %cleanup,
                        "could not clear partially loaded window"
                    );
                }
                Err(err)
            }
        }
    }

    async fn fill_window<P>(
        &self,
        spec: &'static TableSpec,
        kind: FactKind,
        window: &ExtractionWindow,
        total: i64,
        observer: &P,
    ) -> EtlResult<u64>
    where
        P: ProgressObserver + Sync,
    {
        let page_size = self.batch.page_size as i64;
        let mut offset = 0i64;
        let mut inserted = 0u64;

        loop {
            if let Some(guard) = &self.memory_guard {
                guard.check().await?;
            }

            let page = self
                .source
                .fetch_page(kind, window, offset, page_size)
                .await?;
            if page.is_empty() {
                break;
            }

            let page_len = page.len();
            for chunk in page.chunks(self.batch.insert_chunk_size) {
                inserted += self.destination.insert_chunk(spec, chunk).await?;
            }

            offset += page_len as i64;
            observer.on_progress(kind, inserted, total).await;
            if (page_len as i64) < page_size {
                break;
            }
        }

        Ok(inserted)
    }

    /// Refreshes a dimension snapshot via upsert. Returns the written row
    /// count.
    pub async fn refresh_dimension(&self, kind: DimensionKind) -> EtlResult<u64> {
        let spec = dimension_spec(kind);

        if !self.destination.table_exists(spec.table).await? {
            warn!(
                table = spec.table,
                "target table does not exist, skipping refresh"
            );
            return Ok(0);
        }

        let rows = self.source.list_dimension(kind).await?;
        let mut written = 0u64;
        for chunk in rows.chunks(self.batch.insert_chunk_size) {
            written += self.destination.upsert_dimension(spec, chunk).await?;
        }

        info!(
            process = kind.process_name(),
            rows = written,
            "refreshed dimension"
        );

        Ok(written)
    }

    pub fn source(&self) -> &R {
        &self.source
    }

    pub fn destination(&self) -> &D {
        &self.destination
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::destination::memory::MemoryDestination;
    use crate::error::ErrorKind;
    use crate::source::memory::MemorySourceReader;
    use crate::types::{Cell, TargetRow};

    fn date(value: &str) -> NaiveDate {
        NaiveDate::parse_from_str(value, "%Y-%m-%d").unwrap()
    }

    fn user_count_row(course_id: i64, day: NaiveDate) -> TargetRow {
        TargetRow::new(vec![
            Cell::I64(course_id),
            Cell::I64(2),
            Cell::I64(40),
            Cell::Date(day),
        ])
    }

    fn category_row(category_id: i64, name: &str) -> TargetRow {
        TargetRow::new(vec![
            Cell::I64(category_id),
            Cell::String(name.to_string()),
            Cell::Null,
            Cell::I64(1),
        ])
    }

    fn small_batches() -> BatchConfig {
        BatchConfig {
            page_size: 2,
            insert_chunk_size: 2,
        }
    }

    async fn seeded_loader(
        rows: Vec<TargetRow>,
        day: NaiveDate,
    ) -> IdempotentLoader<MemorySourceReader, MemoryDestination> {
        let source = MemorySourceReader::new();
        source.seed_fact(FactKind::UserCounts, day, rows).await;

        IdempotentLoader::new(source, MemoryDestination::new(), small_batches())
    }

    #[tokio::test]
    async fn loading_the_same_window_twice_does_not_duplicate_rows() {
        let day = date("2024-03-01");
        let rows: Vec<_> = (1..=5).map(|id| user_count_row(id, day)).collect();
        let loader = seeded_loader(rows, day).await;
        let window = ExtractionWindow::new(day);

        let first = loader
            .load_fact_window(FactKind::UserCounts, &window)
            .await
            .unwrap();
        let second = loader
            .load_fact_window(FactKind::UserCounts, &window)
            .await
            .unwrap();

        assert_eq!(first, 5);
        assert_eq!(second, 5);
        let loaded = loader.destination().window_rows("user_counts_etl", day).await;
        assert_eq!(loaded.len(), 5);
    }

    #[tokio::test]
    async fn loading_only_touches_the_requested_window() {
        let first_day = date("2024-03-01");
        let second_day = date("2024-03-02");

        let source = MemorySourceReader::new();
        source
            .seed_fact(
                FactKind::UserCounts,
                first_day,
                vec![user_count_row(1, first_day)],
            )
            .await;
        source
            .seed_fact(
                FactKind::UserCounts,
                second_day,
                vec![user_count_row(1, second_day), user_count_row(2, second_day)],
            )
            .await;

        let loader = IdempotentLoader::new(source, MemoryDestination::new(), small_batches());
        loader
            .load_fact_window(FactKind::UserCounts, &ExtractionWindow::new(first_day))
            .await
            .unwrap();
        loader
            .load_fact_window(FactKind::UserCounts, &ExtractionWindow::new(second_day))
            .await
            .unwrap();

        // Reloading the second day must leave the first day untouched.
        loader
            .load_fact_window(FactKind::UserCounts, &ExtractionWindow::new(second_day))
            .await
            .unwrap();

        let destination = loader.destination();
        assert_eq!(
            destination.window_rows("user_counts_etl", first_day).await.len(),
            1
        );
        assert_eq!(
            destination.window_rows("user_counts_etl", second_day).await.len(),
            2
        );
    }

    #[tokio::test]
    async fn missing_target_table_skips_the_load() {
        let day = date("2024-03-01");
        let loader = seeded_loader(vec![user_count_row(1, day)], day).await;
        loader
            .destination()
            .set_table_missing("user_counts_etl")
            .await;

        let inserted = loader
            .load_fact_window(FactKind::UserCounts, &ExtractionWindow::new(day))
            .await
            .unwrap();

        assert_eq!(inserted, 0);
        assert!(loader.destination().table_rows("user_counts_etl").await.is_empty());
    }

    #[tokio::test]
    async fn failed_chunk_aborts_and_retry_converges() {
        let day = date("2024-03-01");
        let rows: Vec<_> = (1..=6).map(|id| user_count_row(id, day)).collect();
        let loader = seeded_loader(rows, day).await;
        let window = ExtractionWindow::new(day);

        loader.destination().fail_after_chunks(1).await;
        let err = loader
            .load_fact_window(FactKind::UserCounts, &window)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LoadChunkFailed);

        // The chunk committed before the failure is rolled back by the
        // cleanup delete: the window holds zero rows, not a partial load.
        let after_failure = loader.destination().window_rows("user_counts_etl", day).await;
        assert!(after_failure.is_empty());

        loader.destination().heal().await;
        let inserted = loader
            .load_fact_window(FactKind::UserCounts, &window)
            .await
            .unwrap();

        assert_eq!(inserted, 6);
        let loaded = loader.destination().window_rows("user_counts_etl", day).await;
        assert_eq!(loaded.len(), 6);
    }

    #[tokio::test]
    async fn progress_reports_carry_the_upfront_total() {
        struct Recorder(std::sync::Mutex<Vec<(u64, i64)>>);

        impl ProgressObserver for Recorder {
            async fn on_progress(&self, _kind: FactKind, loaded: u64, total: i64) {
                self.0.lock().unwrap().push((loaded, total));
            }
        }

        let day = date("2024-03-01");
        let rows: Vec<_> = (1..=5).map(|id| user_count_row(id, day)).collect();
        let loader = seeded_loader(rows, day).await;
        let recorder = Recorder(std::sync::Mutex::new(Vec::new()));

        loader
            .load_fact_window_observed(FactKind::UserCounts, &ExtractionWindow::new(day), &recorder)
            .await
            .unwrap();

        // Three pages of at most two rows, each reported against the full count.
        let reports = recorder.0.into_inner().unwrap();
        assert_eq!(reports, vec![(2, 5), (4, 5), (5, 5)]);
    }

    #[tokio::test]
    async fn dimension_refresh_upserts_by_natural_key() {
        let source = MemorySourceReader::new();
        source
            .seed_dimension(
                DimensionKind::CourseCategories,
                vec![category_row(1, "Science"), category_row(2, "Arts")],
            )
            .await;

        let loader = IdempotentLoader::new(source, MemoryDestination::new(), small_batches());
        loader
            .refresh_dimension(DimensionKind::CourseCategories)
            .await
            .unwrap();

        // Rename a category and refresh again.
        loader
            .source()
            .seed_dimension(
                DimensionKind::CourseCategories,
                vec![category_row(1, "Natural Science"), category_row(2, "Arts")],
            )
            .await;
        loader
            .refresh_dimension(DimensionKind::CourseCategories)
            .await
            .unwrap();

        let rows = loader.destination().table_rows("course_categories").await;
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[0].values()[1],
            Cell::String("Natural Science".to_string())
        );
    }
}
