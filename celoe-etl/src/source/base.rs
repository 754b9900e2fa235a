use std::future::Future;

use crate::error::EtlResult;
use crate::types::{DimensionKind, ExtractionWindow, FactKind, TargetRow};

/// Read access to the LMS source database.
///
/// Facts are extracted page by page so a large window never has to be held in
/// memory at once; every page query is scoped to the window's epoch bounds, so
/// re-reading a page is safe. Dimensions are small snapshot tables read in one
/// pass.
pub trait SourceReader {
    /// Verifies the source is reachable. Run as a preflight so connectivity
    /// problems surface before any scheduler log row is written.
    fn check_connectivity(&self) -> impl Future<Output = EtlResult<()>> + Send;

    /// Returns how many rows the fact query yields for this window. The
    /// loader counts before paging begins so progress reports carry a total.
    fn count_rows(
        &self,
        kind: FactKind,
        window: &ExtractionWindow,
    ) -> impl Future<Output = EtlResult<i64>> + Send;

    /// Fetches one page of fact rows, shaped to the column order of the
    /// fact's [`crate::tables::TableSpec`]. Results are deterministically
    /// ordered so pages never overlap.
    fn fetch_page(
        &self,
        kind: FactKind,
        window: &ExtractionWindow,
        offset: i64,
        limit: i64,
    ) -> impl Future<Output = EtlResult<Vec<TargetRow>>> + Send;

    /// Reads the full current snapshot of a dimension.
    fn list_dimension(
        &self,
        kind: DimensionKind,
    ) -> impl Future<Output = EtlResult<Vec<TargetRow>>> + Send;
}
