use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::etl_error;
use crate::types::ExtractionWindow;

/// One successfully processed window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowReport {
    pub date: NaiveDate,
    pub rows: u64,
}

/// Result of dispatching a batch of windows.
#[derive(Debug, Default)]
pub struct RunOutcome {
    /// Windows that completed, in date order.
    pub completed: Vec<WindowReport>,
    /// The last date the commit callback was invoked for. Always the end of
    /// a contiguous run of successes starting at the first planned date.
    pub committed_through: Option<NaiveDate>,
    /// Errors from failed windows, one per window.
    pub errors: Vec<EtlError>,
}

impl RunOutcome {
    pub fn total_rows(&self) -> u64 {
        self.completed.iter().map(|report| report.rows).sum()
    }

    /// Collapses the outcome into a result, aggregating window errors.
    pub fn into_result(self) -> EtlResult<Vec<WindowReport>> {
        if self.errors.is_empty() {
            Ok(self.completed)
        } else {
            Err(self.errors.into())
        }
    }
}

/// Dispatches day-windows to workers with bounded fan-out.
///
/// With a concurrency of 1 the windows run strictly in order and each success
/// commits before the next window starts. With higher concurrency the windows
/// run in a [`JoinSet`] gated by a [`Semaphore`], and commits happen only
/// after the whole batch settles, walking the date order and stopping at the
/// first failure. Either way the committed prefix is contiguous: a crash or a
/// failed day can never leave a later day committed over an earlier hole.
#[derive(Debug, Clone, Copy)]
pub struct WindowCoordinator {
    max_concurrency: u16,
}

impl WindowCoordinator {
    pub fn new(max_concurrency: u16) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Runs `worker` over every date and invokes `commit` for the contiguous
    /// successful prefix. A failed window never aborts windows already in
    /// flight.
    pub async fn run_windows<W, WFut, C, CFut>(
        &self,
        dates: &[NaiveDate],
        worker: W,
        commit: C,
    ) -> RunOutcome
    where
        W: Fn(ExtractionWindow) -> WFut + Send + Sync + Clone + 'static,
        WFut: Future<Output = EtlResult<u64>> + Send + 'static,
        C: Fn(NaiveDate) -> CFut,
        CFut: Future<Output = EtlResult<()>>,
    {
        if self.max_concurrency == 1 {
            self.run_sequential(dates, worker, commit).await
        } else {
            self.run_concurrent(dates, worker, commit).await
        }
    }

    async fn run_sequential<W, WFut, C, CFut>(
        &self,
        dates: &[NaiveDate],
        worker: W,
        commit: C,
    ) -> RunOutcome
    where
        W: Fn(ExtractionWindow) -> WFut,
        WFut: Future<Output = EtlResult<u64>>,
        C: Fn(NaiveDate) -> CFut,
        CFut: Future<Output = EtlResult<()>>,
    {
        let mut outcome = RunOutcome::default();

        for &date in dates {
            match worker(ExtractionWindow::new(date)).await {
                Ok(rows) => {
                    if let Err(err) = commit(date).await {
                        outcome.errors.push(err);
                        break;
                    }
                    outcome.completed.push(WindowReport { date, rows });
                    outcome.committed_through = Some(date);
                }
                Err(err) => {
                    // Later windows are not attempted: committing past a
                    // failed day would break watermark contiguity.
                    error!(%date, error = %err, "window failed, stopping sequential run");
                    outcome.errors.push(err);
                    break;
                }
            }
        }

        outcome
    }

    async fn run_concurrent<W, WFut, C, CFut>(
        &self,
        dates: &[NaiveDate],
        worker: W,
        commit: C,
    ) -> RunOutcome
    where
        W: Fn(ExtractionWindow) -> WFut + Send + Sync + Clone + 'static,
        WFut: Future<Output = EtlResult<u64>> + Send + 'static,
        C: Fn(NaiveDate) -> CFut,
        CFut: Future<Output = EtlResult<()>>,
    {
        let permits = Arc::new(Semaphore::new(self.max_concurrency as usize));
        let mut tasks = JoinSet::new();

        for (index, &date) in dates.iter().enumerate() {
            let permits = permits.clone();
            let worker = worker.clone();
            let slot = (index % self.max_concurrency as usize) as u16;

            tasks.spawn(async move {
                // The semaphore is never closed while tasks are running.
                let _permit = permits.acquire_owned().await;
                let window = ExtractionWindow { date, slot };
                (date, worker(window).await)
            });
        }

        let mut results: HashMap<NaiveDate, EtlResult<u64>> = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((date, result)) => {
                    results.insert(date, result);
                }
                Err(err) => {
                    // The date is reconstructed below from the gap in the
                    // results map.
                    error!(error = %err, "window worker panicked");
                }
            }
        }

        let mut outcome = RunOutcome::default();
        let mut prefix_intact = true;

        for &date in dates {
            match results.remove(&date) {
                Some(Ok(rows)) => {
                    if prefix_intact {
                        if let Err(err) = commit(date).await {
                            outcome.errors.push(err);
                            prefix_intact = false;
                        } else {
                            outcome.committed_through = Some(date);
                        }
                    }
                    outcome.completed.push(WindowReport { date, rows });
                }
                Some(Err(err)) => {
                    prefix_intact = false;
                    outcome.errors.push(err);
                }
                None => {
                    // The task for this date panicked before reporting.
                    prefix_intact = false;
                    outcome.errors.push(etl_error!(
                        ErrorKind::WorkerPanic,
                        "A window worker panicked before reporting a result",
                        date.to_string()
                    ));
                }
            }
        }

        info!(
            planned = dates.len(),
            completed = outcome.completed.len(),
            committed_through = ?outcome.committed_through,
            "window batch settled"
        );

        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::bail;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    fn committed() -> Arc<Mutex<Vec<NaiveDate>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test]
    async fn sequential_commits_each_window_in_order() {
        let coordinator = WindowCoordinator::new(1);
        let dates = vec![date(1), date(2), date(3)];
        let commits = committed();

        let commits_clone = commits.clone();
        let outcome = coordinator
            .run_windows(
                &dates,
                |_window| async move { Ok(10) },
                move |day| {
                    let commits = commits_clone.clone();
                    async move {
                        commits.lock().unwrap().push(day);
                        Ok(())
                    }
                },
            )
            .await;

        assert_eq!(outcome.completed.len(), 3);
        assert_eq!(outcome.total_rows(), 30);
        assert_eq!(outcome.committed_through, Some(date(3)));
        assert_eq!(*commits.lock().unwrap(), dates);
    }

    #[tokio::test]
    async fn sequential_stops_at_the_first_failed_window() {
        let coordinator = WindowCoordinator::new(1);
        let dates = vec![date(1), date(2), date(3)];
        let commits = committed();

        let commits_clone = commits.clone();
        let outcome = coordinator
            .run_windows(
                &dates,
                |window| async move {
                    if window.date == date(2) {
                        bail!(ErrorKind::SourceQueryFailed, "Query failed");
                    }
                    Ok(5)
                },
                move |day| {
                    let commits = commits_clone.clone();
                    async move {
                        commits.lock().unwrap().push(day);
                        Ok(())
                    }
                },
            )
            .await;

        assert_eq!(outcome.committed_through, Some(date(1)));
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(*commits.lock().unwrap(), vec![date(1)]);
    }

    #[tokio::test]
    async fn concurrent_commits_only_the_contiguous_prefix() {
        let coordinator = WindowCoordinator::new(3);
        let dates = vec![date(1), date(2), date(3), date(4)];
        let commits = committed();

        let commits_clone = commits.clone();
        let outcome = coordinator
            .run_windows(
                &dates,
                |window| async move {
                    if window.date == date(3) {
                        bail!(ErrorKind::SourceQueryFailed, "Query failed");
                    }
                    Ok(5)
                },
                move |day| {
                    let commits = commits_clone.clone();
                    async move {
                        commits.lock().unwrap().push(day);
                        Ok(())
                    }
                },
            )
            .await;

        // Days 1, 2 and 4 completed, but the watermark may only reach day 2.
        assert_eq!(outcome.completed.len(), 3);
        assert_eq!(outcome.committed_through, Some(date(2)));
        assert_eq!(*commits.lock().unwrap(), vec![date(1), date(2)]);
        assert_eq!(outcome.errors.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_run_with_all_successes_commits_everything() {
        let coordinator = WindowCoordinator::new(4);
        let dates: Vec<_> = (1..=8).map(date).collect();
        let commits = committed();

        let commits_clone = commits.clone();
        let outcome = coordinator
            .run_windows(
                &dates,
                |_window| async move { Ok(1) },
                move |day| {
                    let commits = commits_clone.clone();
                    async move {
                        commits.lock().unwrap().push(day);
                        Ok(())
                    }
                },
            )
            .await;

        assert_eq!(outcome.committed_through, Some(date(8)));
        assert_eq!(outcome.total_rows(), 8);
        assert!(outcome.into_result().is_ok());
        assert_eq!(*commits.lock().unwrap(), dates);
    }

    #[tokio::test]
    async fn panicking_worker_surfaces_as_an_error() {
        let coordinator = WindowCoordinator::new(2);
        let dates = vec![date(1), date(2)];

        let outcome = coordinator
            .run_windows(
                &dates,
                |window| async move {
                    if window.date == date(2) {
                        panic!("worker exploded");
                    }
                    Ok(1)
                },
                |_day| async move { Ok(()) },
            )
            .await;

        assert_eq!(outcome.completed.len(), 1);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].kind(), ErrorKind::WorkerPanic);
    }
}
