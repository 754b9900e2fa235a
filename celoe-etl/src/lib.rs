//! Batch ETL engine turning Moodle LMS activity into the `celoeapi`
//! reporting schema.
//!
//! Each calendar day is an idempotent extraction window: the planner derives
//! the windows to run from persisted watermarks, the loader replaces each
//! window with delete-then-insert, and the coordinator fans windows out to
//! workers while keeping the committed watermark prefix contiguous. Every run
//! is tracked in a scheduler log with a realtime log stream alongside it.

pub mod concurrency;
pub mod destination;
pub mod error;
pub mod loader;
mod macros;
pub mod migrations;
pub mod pipeline;
pub mod planner;
pub mod reclaim;
pub mod source;
pub mod store;
pub mod tables;
pub mod types;
