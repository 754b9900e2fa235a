use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::Mutex;

use crate::bail;
use crate::error::{ErrorKind, EtlResult};
use crate::source::base::SourceReader;
use crate::types::{DimensionKind, ExtractionWindow, FactKind, TargetRow};

#[derive(Debug, Default)]
struct Inner {
    facts: HashMap<(FactKind, NaiveDate), Vec<TargetRow>>,
    dimensions: HashMap<DimensionKind, Vec<TargetRow>>,
    unavailable: bool,
}

/// In-memory source for tests: pre-seeded rows keyed by fact kind and date,
/// paginated the same way the MySQL reader paginates.
#[derive(Debug, Clone, Default)]
pub struct MemorySourceReader {
    inner: Arc<Mutex<Inner>>,
}

impl MemorySourceReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_fact(&self, kind: FactKind, date: NaiveDate, rows: Vec<TargetRow>) {
        let mut inner = self.inner.lock().await;
        inner.facts.insert((kind, date), rows);
    }

    pub async fn seed_dimension(&self, kind: DimensionKind, rows: Vec<TargetRow>) {
        let mut inner = self.inner.lock().await;
        inner.dimensions.insert(kind, rows);
    }

    /// Makes every subsequent call fail with a source-unavailable error.
    pub async fn set_unavailable(&self, unavailable: bool) {
        let mut inner = self.inner.lock().await;
        inner.unavailable = unavailable;
    }
}

impl SourceReader for MemorySourceReader {
    async fn check_connectivity(&self) -> EtlResult<()> {
        let inner = self.inner.lock().await;
        if inner.unavailable {
            bail!(
                ErrorKind::SourceUnavailable,
                "The LMS database did not respond to a connectivity probe"
            );
        }

        Ok(())
    }

    async fn count_rows(&self, kind: FactKind, window: &ExtractionWindow) -> EtlResult<i64> {
        let inner = self.inner.lock().await;
        if inner.unavailable {
            bail!(
                ErrorKind::SourceUnavailable,
                "The LMS database did not respond"
            );
        }

        Ok(inner
            .facts
            .get(&(kind, window.date))
            .map_or(0, |rows| rows.len() as i64))
    }

    async fn fetch_page(
        &self,
        kind: FactKind,
        window: &ExtractionWindow,
        offset: i64,
        limit: i64,
    ) -> EtlResult<Vec<TargetRow>> {
        let inner = self.inner.lock().await;
        if inner.unavailable {
            bail!(
                ErrorKind::SourceUnavailable,
                "The LMS database did not respond"
            );
        }

        let Some(rows) = inner.facts.get(&(kind, window.date)) else {
            return Ok(Vec::new());
        };

        Ok(rows
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn list_dimension(&self, kind: DimensionKind) -> EtlResult<Vec<TargetRow>> {
        let inner = self.inner.lock().await;
        if inner.unavailable {
            bail!(
                ErrorKind::SourceUnavailable,
                "The LMS database did not respond"
            );
        }

        Ok(inner.dimensions.get(&kind).cloned().unwrap_or_default())
    }
}
