//! Configuration types and loading for taskflow services.
//!
//! Shared types live in [`shared`] and are consumed directly by the orchestration core. Services
//! load them with [`load_config`] from layered files and environment overrides.

pub mod environment;
mod load;
pub mod shared;

pub use load::{Config, LoadConfigError, load_config, load_config_from};
