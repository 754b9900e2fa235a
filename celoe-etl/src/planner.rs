//! Watermark-based incremental window planning.

use chrono::{NaiveDate, Utc};
use tracing::info;

use crate::bail;
use crate::error::{ErrorKind, EtlResult};
use crate::store::base::StateStore;

/// Computes the ordered set of day-windows to process for a named process.
///
/// The planner consults the persisted watermark so that days already committed
/// are not scheduled again, enumerates one window per day in the requested
/// range, and rejects malformed or inverted ranges before any extraction I/O
/// happens.
#[derive(Debug)]
pub struct WindowPlanner<'a, S> {
    store: &'a S,
}

impl<'a, S: StateStore> WindowPlanner<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Plans the windows for `[requested_start, requested_end]`, both inclusive.
    ///
    /// `requested_end` defaults to the current UTC calendar day. Unless `force`
    /// is set, the start is clamped forward past the watermark of
    /// `process_name`, so a caller asking for an already-committed range gets
    /// an empty plan instead of silently double counting. `force` bypasses the
    /// clamp for deliberate reprocessing; idempotent loads make that safe.
    ///
    /// The returned dates are ascending. Ordering matters: the sequential
    /// execution path advances the watermark after each window in commit order.
    pub async fn plan(
        &self,
        process_name: &str,
        requested_start: &str,
        requested_end: Option<&str>,
        force: bool,
    ) -> EtlResult<Vec<NaiveDate>> {
        let mut start = parse_extraction_date(requested_start)?;
        let end = match requested_end {
            Some(requested_end) => parse_extraction_date(requested_end)?,
            None => Utc::now().date_naive(),
        };

        if start > end {
            bail!(
                ErrorKind::InvalidRange,
                "Requested start date is after the end date",
                format!("{start} > {end}")
            );
        }

        if !force
            && let Some(watermark) = self.store.get_watermark(process_name).await?
            && watermark.last_date >= start
        {
            // The watermark day itself is already committed; resume on the
            // next one.
            let resume = watermark.last_date.succ_opt().unwrap_or(NaiveDate::MAX);
            info!(
                process_name,
                requested_start = %start,
                watermark = %watermark.last_date,
                "clamping start date forward past the watermark"
            );
            start = resume;
        }

        let mut windows = Vec::new();
        let mut current = start;
        while current <= end {
            windows.push(current);
            let Some(next) = current.succ_opt() else {
                break;
            };
            current = next;
        }

        Ok(windows)
    }
}

/// Parses a `YYYY-MM-DD` extraction date, rejecting anything else.
pub fn parse_extraction_date(value: &str) -> EtlResult<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|err| {
        crate::etl_error!(
            ErrorKind::InvalidRange,
            "Extraction dates must be well-formed YYYY-MM-DD strings",
            value,
            source: err
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStateStore;

    fn date(value: &str) -> NaiveDate {
        NaiveDate::parse_from_str(value, "%Y-%m-%d").unwrap()
    }

    #[tokio::test]
    async fn plan_enumerates_inclusive_ascending_days() {
        let store = MemoryStateStore::new();
        let planner = WindowPlanner::new(&store);

        let windows = planner
            .plan("activity_counts", "2024-01-01", Some("2024-01-03"), false)
            .await
            .unwrap();

        assert_eq!(
            windows,
            vec![date("2024-01-01"), date("2024-01-02"), date("2024-01-03")]
        );
    }

    #[tokio::test]
    async fn plan_rejects_inverted_range() {
        let store = MemoryStateStore::new();
        let planner = WindowPlanner::new(&store);

        let err = planner
            .plan("activity_counts", "2024-01-05", Some("2024-01-01"), false)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidRange);
    }

    #[tokio::test]
    async fn plan_rejects_malformed_start_date() {
        let store = MemoryStateStore::new();
        let planner = WindowPlanner::new(&store);

        let err = planner
            .plan("activity_counts", "01/05/2024", Some("2024-01-06"), false)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidRange);
    }

    #[tokio::test]
    async fn plan_clamps_start_past_watermark() {
        let store = MemoryStateStore::new();
        store
            .advance_watermark("activity_counts", date("2024-01-02"))
            .await
            .unwrap();

        let planner = WindowPlanner::new(&store);
        let windows = planner
            .plan("activity_counts", "2024-01-01", Some("2024-01-04"), false)
            .await
            .unwrap();

        assert_eq!(windows, vec![date("2024-01-03"), date("2024-01-04")]);
    }

    #[tokio::test]
    async fn plan_with_fully_committed_range_is_empty() {
        let store = MemoryStateStore::new();
        store
            .advance_watermark("activity_counts", date("2024-01-04"))
            .await
            .unwrap();

        let planner = WindowPlanner::new(&store);
        let windows = planner
            .plan("activity_counts", "2024-01-01", Some("2024-01-04"), false)
            .await
            .unwrap();

        assert!(windows.is_empty());
    }

    #[tokio::test]
    async fn force_bypasses_watermark_clamp() {
        let store = MemoryStateStore::new();
        store
            .advance_watermark("activity_counts", date("2024-01-04"))
            .await
            .unwrap();

        let planner = WindowPlanner::new(&store);
        let windows = planner
            .plan("activity_counts", "2024-01-03", Some("2024-01-04"), true)
            .await
            .unwrap();

        assert_eq!(windows, vec![date("2024-01-03"), date("2024-01-04")]);
    }
}
