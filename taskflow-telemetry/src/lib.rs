//! Logging and metrics initialization shared by taskflow binaries and tests.

pub mod metrics;
pub mod tracing;
