//! The run orchestrator tying planning, extraction, loading and tracking
//! together.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use celoe_config::shared::PipelineConfig;
use chrono::NaiveDate;
use tracing::info;

use crate::concurrency::coordinator::WindowCoordinator;
use crate::concurrency::memory_guard::MemoryGuard;
use crate::destination::base::Destination;
use crate::error::{EtlError, EtlResult};
use crate::loader::{IdempotentLoader, ProgressObserver};
use crate::planner::{WindowPlanner, parse_extraction_date};
use crate::reclaim::StuckRunReclaimer;
use crate::source::base::SourceReader;
use crate::store::base::StateStore;
use crate::tables::{fact_spec, summary_spec};
use crate::types::{
    DimensionKind, FactKind, LogFilter, LogId, LogLevel, SchedulerLogRecord,
};

/// What a completed run did.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub log_id: LogId,
    pub windows_planned: usize,
    pub windows_completed: usize,
    pub rows_loaded: u64,
    pub committed_through: Option<NaiveDate>,
}

/// Target of a clear operation.
#[derive(Debug, Clone, Copy)]
pub enum ClearScope {
    /// Remove one extraction date from every fact table and the summary.
    /// Watermarks are untouched; the date can be re-run as a single window.
    Window(NaiveDate),
    /// Remove all loaded facts and the summary and reset every watermark, so
    /// the next run starts from scratch.
    All,
}

/// Streams page-level loader progress into the scheduler log row.
///
/// The `offset` column tracks rows loaded by the fact currently extracting
/// and `row_count` the run-cumulative total. Writes are observability only
/// and never fail a load.
struct StoreProgress<S> {
    store: S,
    log_id: LogId,
    rows_before: u64,
}

impl<S: StateStore + Sync> ProgressObserver for StoreProgress<S> {
    async fn on_progress(&self, _kind: FactKind, loaded: u64, _total: i64) {
        let run_rows = self.rows_before + loaded;
        let _ = self
            .store
            .mark_progress(self.log_id, loaded as i64, run_rows as i64)
            .await;
    }
}

/// The batch ETL engine.
///
/// Generic over the source reader, the state store and the destination so the
/// whole engine runs against in-memory implementations in tests. Every run is
/// tracked in the scheduler log: exactly one of `finished` or `failed` is the
/// terminal state, and the realtime log stream records progress along the way.
/// Realtime and progress writes are best effort and never fail a run.
#[derive(Debug, Clone)]
pub struct EtlPipeline<R, S, D> {
    source: R,
    store: S,
    destination: D,
    config: PipelineConfig,
}

impl<R, S, D> EtlPipeline<R, S, D>
where
    R: SourceReader + Clone + Send + Sync + 'static,
    S: StateStore + Clone + Send + Sync + 'static,
    D: Destination + Clone + Send + Sync + 'static,
{
    pub fn new(source: R, store: S, destination: D, config: PipelineConfig) -> Self {
        Self {
            source,
            store,
            destination,
            config,
        }
    }

    /// Full refresh: truncates every loaded fact, resets the watermarks and
    /// re-extracts all windows from `start` up to the current day, taking a
    /// fresh dimension snapshot along the way.
    pub async fn run_full(&self, start: &str) -> EtlResult<RunSummary> {
        // Validate before destroying anything.
        self.source.check_connectivity().await?;
        parse_extraction_date(start)?;

        self.clear(ClearScope::All).await?;
        self.run("full", start, None, true).await
    }

    /// Runs the windows in `[start, end]`, or up to today when `end` is
    /// absent. `force` bypasses the watermark clamp for deliberate
    /// reprocessing.
    pub async fn run_backfill(
        &self,
        start: &str,
        end: Option<&str>,
        force: bool,
    ) -> EtlResult<RunSummary> {
        self.run("backfill", start, end, force).await
    }

    /// Re-runs exactly one extraction date, regardless of the watermark.
    pub async fn run_single_window(&self, date: &str) -> EtlResult<RunSummary> {
        self.run("single", date, Some(date), true).await
    }

    /// Force-fails scheduler log rows abandoned by crashed runs. Returns the
    /// number of rows transitioned.
    pub async fn reclaim_stuck(&self) -> EtlResult<u64> {
        StuckRunReclaimer::new(self.store.clone(), self.config.stuck.clone())
            .reclaim()
            .await
    }

    /// Returns the most recent run, optionally restricted to a run type.
    pub async fn get_status(
        &self,
        run_type: Option<&str>,
    ) -> EtlResult<Option<SchedulerLogRecord>> {
        self.store.latest_run(run_type).await
    }

    /// Returns scheduler log rows matching the filter, newest first.
    pub async fn get_logs(&self, filter: &LogFilter) -> EtlResult<Vec<SchedulerLogRecord>> {
        self.store.list_runs(filter).await
    }

    /// Removes loaded data according to `scope`.
    pub async fn clear(&self, scope: ClearScope) -> EtlResult<()> {
        match scope {
            ClearScope::Window(date) => {
                for kind in FactKind::ALL {
                    let spec = fact_spec(*kind);
                    if self.destination.table_exists(spec.table).await? {
                        self.destination.delete_window(spec, date).await?;
                    }
                }
                if self.destination.table_exists(summary_spec().table).await? {
                    self.destination.delete_window(summary_spec(), date).await?;
                }
                info!(%date, "cleared one extraction window");
            }
            ClearScope::All => {
                for kind in FactKind::ALL {
                    let spec = fact_spec(*kind);
                    if self.destination.table_exists(spec.table).await? {
                        self.destination.truncate(spec).await?;
                    }
                    self.store.reset_watermark(kind.process_name()).await?;
                }
                if self.destination.table_exists(summary_spec().table).await? {
                    self.destination.truncate(summary_spec()).await?;
                }
                info!("cleared all loaded facts and reset watermarks");
            }
        }

        Ok(())
    }

    async fn run(
        &self,
        run_type: &str,
        start: &str,
        end: Option<&str>,
        force: bool,
    ) -> EtlResult<RunSummary> {
        // Fail before writing any tracking state if the source is down or the
        // range is malformed.
        self.source.check_connectivity().await?;
        let requested_start = parse_extraction_date(start)?;

        let planner = WindowPlanner::new(&self.store);
        let process = self.lagging_process().await?;
        let windows = planner.plan(process, start, end, force).await?;

        let log_id = self.store.start_run(run_type, requested_start).await?;
        info!(log_id, run_type, planned = windows.len(), "run started");

        if windows.is_empty() {
            let _ = self
                .store
                .append_realtime(log_id, LogLevel::Info, "no windows to process", Some(1.0))
                .await;
            self.store
                .complete_run(log_id, 0, requested_start, requested_start)
                .await?;

            return Ok(RunSummary {
                log_id,
                windows_planned: 0,
                windows_completed: 0,
                rows_loaded: 0,
                committed_through: None,
            });
        }

        match self.execute_windows(log_id, &windows).await {
            Ok(summary) => {
                self.store
                    .complete_run(log_id, summary.rows_loaded as i64, windows[0], windows[windows.len() - 1])
                    .await?;
                info!(log_id, rows = summary.rows_loaded, "run finished");
                Ok(summary)
            }
            Err(err) => {
                self.store.fail_run(log_id, &err.to_string()).await?;
                let _ = self
                    .store
                    .append_realtime(log_id, LogLevel::Error, &err.to_string(), None)
                    .await;
                Err(err)
            }
        }
    }

    async fn execute_windows(
        &self,
        log_id: LogId,
        windows: &[NaiveDate],
    ) -> EtlResult<RunSummary> {
        let loader = self.build_loader();

        // Dimensions first: window facts may be joined against them as soon
        // as they land.
        loader.refresh_dimension(DimensionKind::CourseCategories).await?;

        let windows_total = windows.len() as u64;
        let windows_done = Arc::new(AtomicU64::new(0));
        let rows_total = Arc::new(AtomicU64::new(0));

        let worker = {
            let loader = loader.clone();
            let store = self.store.clone();
            let destination = self.destination.clone();
            let windows_done = windows_done.clone();
            let rows_total = rows_total.clone();

            move |window: crate::types::ExtractionWindow| {
                let loader = loader.clone();
                let store = store.clone();
                let destination = destination.clone();
                let windows_done = windows_done.clone();
                let rows_total = rows_total.clone();

                async move {
                    let mut rows = 0u64;
                    for kind in FactKind::ALL {
                        let progress = StoreProgress {
                            store: store.clone(),
                            log_id,
                            rows_before: rows_total.load(Ordering::SeqCst) + rows,
                        };
                        rows += loader
                            .load_fact_window_observed(*kind, &window, &progress)
                            .await?;
                    }
                    destination.rebuild_course_summary(window.date).await?;

                    let done = windows_done.fetch_add(1, Ordering::SeqCst) + 1;
                    rows_total.fetch_add(rows, Ordering::SeqCst);
                    let progress = done as f64 / windows_total as f64;

                    // Realtime writes are observability only.
                    let _ = store
                        .append_realtime(
                            log_id,
                            LogLevel::Info,
                            &format!("window {} loaded {rows} rows", window.date),
                            Some(progress),
                        )
                        .await;

                    Ok(rows)
                }
            }
        };

        let store = &self.store;
        let commit = move |date: NaiveDate| async move {
            for kind in FactKind::ALL {
                store.advance_watermark(kind.process_name(), date).await?;
            }
            Ok(())
        };

        let coordinator = WindowCoordinator::new(self.config.max_concurrency);
        let outcome = coordinator.run_windows(windows, worker, commit).await;

        let summary = RunSummary {
            log_id,
            windows_planned: windows.len(),
            windows_completed: outcome.completed.len(),
            rows_loaded: outcome.total_rows(),
            committed_through: outcome.committed_through,
        };

        if outcome.errors.is_empty() {
            Ok(summary)
        } else {
            Err(EtlError::from(outcome.errors))
        }
    }

    fn build_loader(&self) -> IdempotentLoader<R, D> {
        let loader = IdempotentLoader::new(
            self.source.clone(),
            self.destination.clone(),
            self.config.batch.clone(),
        );

        if self.config.memory.limit_mb > 0 {
            loader.with_memory_guard(MemoryGuard::new(
                self.config.memory.limit_mb,
                self.config.memory.soft_threshold,
                self.config.memory.hard_threshold,
            ))
        } else {
            loader
        }
    }

    /// Picks the process whose watermark is furthest behind, so planning never
    /// skips a day some fact has not committed yet. The per-window loads are
    /// idempotent, so facts that are already ahead just get replaced in place.
    async fn lagging_process(&self) -> EtlResult<&'static str> {
        let mut lagging = FactKind::ALL[0].process_name();
        let mut lagging_date: Option<NaiveDate> = None;
        let mut first = true;

        for kind in FactKind::ALL {
            let watermark = self.store.get_watermark(kind.process_name()).await?;
            let date = match watermark {
                // A fact with no watermark at all lags everything.
                None => return Ok(kind.process_name()),
                Some(watermark) => watermark.last_date,
            };

            if first || Some(date) < lagging_date {
                lagging = kind.process_name();
                lagging_date = Some(date);
                first = false;
            }
        }

        Ok(lagging)
    }
}

#[cfg(test)]
mod tests {
    use celoe_config::shared::{BatchConfig, MemoryConfig, StuckConfig};
    use celoe_telemetry::tracing::init_test_tracing;
    use chrono::Utc;

    use super::*;
    use crate::destination::memory::MemoryDestination;
    use crate::error::ErrorKind;
    use crate::source::memory::MemorySourceReader;
    use crate::store::memory::MemoryStateStore;
    use crate::types::{Cell, RunStatus, TargetRow};

    fn date(value: &str) -> NaiveDate {
        NaiveDate::parse_from_str(value, "%Y-%m-%d").unwrap()
    }

    fn test_config(max_concurrency: u16) -> PipelineConfig {
        PipelineConfig {
            batch: BatchConfig {
                page_size: 100,
                insert_chunk_size: 2,
            },
            // Disable the guard: test hosts have arbitrary memory pressure.
            memory: MemoryConfig {
                limit_mb: 0,
                soft_threshold: 0.8,
                hard_threshold: 0.95,
            },
            stuck: StuckConfig {
                timeout_minutes: 10,
                hard_timeout_minutes: 30,
            },
            max_concurrency,
        }
    }

    fn activity_row(course_id: i64, day: NaiveDate) -> TargetRow {
        TargetRow::new(vec![
            Cell::I64(course_id),
            Cell::I64(3),
            Cell::I64(1),
            Cell::I64(2),
            Cell::I64(0),
            Cell::I64(4),
            Cell::I64(1),
            Cell::I64(9),
            Cell::Date(day),
        ])
    }

    fn user_count_row(course_id: i64, day: NaiveDate) -> TargetRow {
        TargetRow::new(vec![
            Cell::I64(course_id),
            Cell::I64(1),
            Cell::I64(30),
            Cell::Date(day),
        ])
    }

    async fn seeded_pipeline(
        days: &[NaiveDate],
        max_concurrency: u16,
    ) -> EtlPipeline<MemorySourceReader, MemoryStateStore, MemoryDestination> {
        init_test_tracing();

        let source = MemorySourceReader::new();
        for &day in days {
            source
                .seed_fact(
                    FactKind::ActivityCounts,
                    day,
                    vec![activity_row(10, day), activity_row(11, day)],
                )
                .await;
            source
                .seed_fact(FactKind::UserCounts, day, vec![user_count_row(10, day)])
                .await;
        }

        EtlPipeline::new(
            source,
            MemoryStateStore::new(),
            MemoryDestination::new(),
            test_config(max_concurrency),
        )
    }

    #[tokio::test]
    async fn backfill_loads_every_window_and_advances_watermarks() {
        let days = [date("2024-03-01"), date("2024-03-02"), date("2024-03-03")];
        let pipeline = seeded_pipeline(&days, 1).await;

        let summary = pipeline
            .run_backfill("2024-03-01", Some("2024-03-03"), false)
            .await
            .unwrap();

        assert_eq!(summary.windows_planned, 3);
        assert_eq!(summary.windows_completed, 3);
        assert_eq!(summary.rows_loaded, 9);
        assert_eq!(summary.committed_through, Some(date("2024-03-03")));

        for kind in FactKind::ALL {
            let watermark = pipeline
                .store
                .get_watermark(kind.process_name())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(watermark.last_date, date("2024-03-03"));
        }

        let status = pipeline.get_status(Some("backfill")).await.unwrap().unwrap();
        assert_eq!(status.status, RunStatus::Finished);
        assert_eq!(status.row_count, 9);
        assert_eq!(status.extracted_start_date, Some(date("2024-03-01")));
        assert_eq!(status.extracted_end_date, Some(date("2024-03-03")));
        // The last page-level progress report came from the final day's
        // user-counts fact, which holds one row.
        assert_eq!(status.offset, 1);

        assert_eq!(
            pipeline
                .destination
                .window_rows("activity_counts_etl", date("2024-03-02"))
                .await
                .len(),
            2
        );
        assert_eq!(
            pipeline.destination.summary_row_count(date("2024-03-02")).await,
            2
        );
    }

    #[tokio::test]
    async fn second_run_over_the_same_range_plans_nothing() {
        let days = [date("2024-03-01"), date("2024-03-02")];
        let pipeline = seeded_pipeline(&days, 1).await;

        pipeline
            .run_backfill("2024-03-01", Some("2024-03-02"), false)
            .await
            .unwrap();
        let second = pipeline
            .run_backfill("2024-03-01", Some("2024-03-02"), false)
            .await
            .unwrap();

        assert_eq!(second.windows_planned, 0);
        assert_eq!(second.rows_loaded, 0);

        // No duplicated rows either.
        assert_eq!(
            pipeline
                .destination
                .window_rows("user_counts_etl", date("2024-03-01"))
                .await
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn failed_window_fails_the_run_and_holds_the_watermark_back() {
        let days = [date("2024-03-01"), date("2024-03-02")];
        let pipeline = seeded_pipeline(&days, 1).await;

        // Day one consumes two chunks (activity, user counts) and day two's
        // activity chunk makes three; day two's user-counts chunk then fails.
        pipeline.destination.fail_after_chunks(3).await;

        let err = pipeline
            .run_backfill("2024-03-01", Some("2024-03-02"), false)
            .await
            .unwrap_err();
        assert!(err.kinds().contains(&ErrorKind::LoadChunkFailed));

        let status = pipeline.get_status(None).await.unwrap().unwrap();
        assert_eq!(status.status, RunStatus::Failed);
        assert!(status.message.is_some());

        let watermark = pipeline
            .store
            .get_watermark("activity_counts")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(watermark.last_date, date("2024-03-01"));

        // A retry picks up from the failed day and converges.
        pipeline.destination.heal().await;
        let retry = pipeline
            .run_backfill("2024-03-01", Some("2024-03-02"), false)
            .await
            .unwrap();
        assert_eq!(retry.windows_planned, 1);
        assert_eq!(
            pipeline
                .destination
                .window_rows("activity_counts_etl", date("2024-03-02"))
                .await
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn single_window_rerun_bypasses_the_watermark() {
        let days = [date("2024-03-01")];
        let pipeline = seeded_pipeline(&days, 1).await;

        pipeline
            .run_backfill("2024-03-01", Some("2024-03-01"), false)
            .await
            .unwrap();
        let rerun = pipeline.run_single_window("2024-03-01").await.unwrap();

        assert_eq!(rerun.windows_planned, 1);
        assert_eq!(rerun.rows_loaded, 3);
        assert_eq!(
            pipeline
                .destination
                .window_rows("activity_counts_etl", date("2024-03-01"))
                .await
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn concurrent_backfill_loads_all_windows() {
        let days = [
            date("2024-03-01"),
            date("2024-03-02"),
            date("2024-03-03"),
            date("2024-03-04"),
        ];
        let pipeline = seeded_pipeline(&days, 3).await;

        let summary = pipeline
            .run_backfill("2024-03-01", Some("2024-03-04"), false)
            .await
            .unwrap();

        assert_eq!(summary.windows_completed, 4);
        assert_eq!(summary.committed_through, Some(date("2024-03-04")));
    }

    #[tokio::test]
    async fn unavailable_source_fails_before_tracking_starts() {
        let pipeline = seeded_pipeline(&[date("2024-03-01")], 1).await;
        pipeline.source.set_unavailable(true).await;

        let err = pipeline
            .run_backfill("2024-03-01", Some("2024-03-01"), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SourceUnavailable);

        // No scheduler log row was written.
        assert!(pipeline.get_status(None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_all_truncates_facts_and_resets_watermarks() {
        let days = [date("2024-03-01")];
        let pipeline = seeded_pipeline(&days, 1).await;
        pipeline
            .run_backfill("2024-03-01", Some("2024-03-01"), false)
            .await
            .unwrap();

        pipeline.clear(ClearScope::All).await.unwrap();

        assert!(pipeline
            .destination
            .table_rows("activity_counts_etl")
            .await
            .is_empty());
        assert!(pipeline
            .store
            .get_watermark("activity_counts")
            .await
            .unwrap()
            .is_none());

        // The cleared range plans again from scratch.
        let rerun = pipeline
            .run_backfill("2024-03-01", Some("2024-03-01"), false)
            .await
            .unwrap();
        assert_eq!(rerun.windows_planned, 1);
    }

    #[tokio::test]
    async fn clear_window_removes_exactly_one_date() {
        let days = [date("2024-03-01"), date("2024-03-02")];
        let pipeline = seeded_pipeline(&days, 1).await;
        pipeline
            .run_backfill("2024-03-01", Some("2024-03-02"), false)
            .await
            .unwrap();

        pipeline
            .clear(ClearScope::Window(date("2024-03-01")))
            .await
            .unwrap();

        assert!(pipeline
            .destination
            .window_rows("activity_counts_etl", date("2024-03-01"))
            .await
            .is_empty());
        assert_eq!(
            pipeline
                .destination
                .window_rows("activity_counts_etl", date("2024-03-02"))
                .await
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn full_run_refreshes_already_committed_days() {
        let today = Utc::now().date_naive();
        let yesterday = today.pred_opt().unwrap();
        let start = yesterday.format("%Y-%m-%d").to_string();
        let pipeline = seeded_pipeline(&[yesterday, today], 1).await;

        pipeline.run_backfill(&start, None, false).await.unwrap();

        // The watermark clamp leaves nothing for a plain backfill to do.
        let stale = pipeline.run_backfill(&start, None, false).await.unwrap();
        assert_eq!(stale.windows_planned, 0);

        let refresh = pipeline.run_full(&start).await.unwrap();

        assert_eq!(refresh.windows_planned, 2);
        assert_eq!(refresh.rows_loaded, 6);
        assert_eq!(refresh.committed_through, Some(today));
        assert_eq!(
            pipeline
                .destination
                .window_rows("activity_counts_etl", today)
                .await
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn run_end_defaults_to_today() {
        let today = Utc::now().date_naive();
        let pipeline = seeded_pipeline(&[today], 1).await;

        let summary = pipeline
            .run_full(&today.format("%Y-%m-%d").to_string())
            .await
            .unwrap();

        assert_eq!(summary.windows_planned, 1);
        assert_eq!(summary.committed_through, Some(today));
    }
}
