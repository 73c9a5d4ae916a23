//! Concurrency primitives the orchestration layers are built from.
//!
//! Everything that blocks in this module can be bound to a [`context::Context`] and gives up with
//! a cancellation error once the context fires:
//!
//! - [`context`] propagates cancellation and deadlines down a tree of contexts.
//! - [`channel`] moves values between tasks with bounded buffering and explicit close semantics.
//! - [`rate_limiter`] spaces admissions using a [`timer::TickSource`].
//! - [`wait_group`] tracks completion of a dynamic set of tasks.
//!
//! [`guarded`] is orthogonal: it protects shared state with closure-scoped locks that never block
//! across an await point.

pub mod channel;
pub mod context;
pub mod guarded;
pub mod rate_limiter;
pub mod timer;
pub mod wait_group;
