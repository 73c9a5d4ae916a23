mod macros;

pub mod concurrency;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod task;
pub mod workers;
