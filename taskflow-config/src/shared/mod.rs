//! Shared configuration types for taskflow components.

mod base;
mod pool;
mod rate_limit;
mod runner;
mod stage;

pub use base::ValidationError;
pub use pool::PoolConfig;
pub use rate_limit::RateLimitConfig;
pub use runner::RunnerConfig;
pub use stage::StageConfig;
