//! Tracing initialization shared by the ETL binaries and tests.

pub mod tracing;
