//! Workers that execute tasks in the background.
//!
//! A [`pool::WorkerPool`] runs a fixed number of workers draining a job channel that a
//! [`producer::Producer`] fills. Both implement [`base::Worker`] and report progress through their
//! [`base::WorkerHandle`].

pub mod base;
pub mod pool;
pub mod producer;
