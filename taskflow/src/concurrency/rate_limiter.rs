//! Strict periodic admission gate.
//!
//! A [`RateLimiter`] admits one caller per tick of its [`TickSource`]. The default source is a
//! tokio interval with [`MissedTickBehavior::Delay`]: the first admission is immediate and ticks
//! missed while nobody was waiting are not replayed as a burst.

use std::time::Duration;

use metrics::counter;
use taskflow_config::shared::RateLimitConfig;
use tokio::time::{Interval, MissedTickBehavior};

use crate::bail;
use crate::concurrency::context::{Context, check_cancelled, fired};
use crate::concurrency::timer::TickSource;
use crate::error::{ErrorKind, FlowResult};
use crate::metrics::TASKFLOW_ADMISSIONS_TOTAL;

/// Admits at most one caller per tick.
#[derive(Debug)]
pub struct RateLimiter<S = Interval> {
    source: S,
    ctx: Option<Context>,
    admitted: u64,
}

impl RateLimiter<Interval> {
    /// Creates a limiter admitting one caller every `interval`.
    ///
    /// A zero interval is rejected with [`ErrorKind::InvalidConfiguration`].
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn new(interval: Duration) -> FlowResult<Self> {
        if interval.is_zero() {
            bail!(
                ErrorKind::InvalidConfiguration,
                "Rate limiter interval must be greater than zero"
            );
        }

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Ok(Self::with_source(ticker))
    }

    /// Creates a limiter from validated configuration.
    pub fn from_config(config: &RateLimitConfig) -> FlowResult<Self> {
        config.validate()?;
        Self::new(config.interval())
    }
}

impl<S> RateLimiter<S>
where
    S: TickSource,
{
    /// Creates a limiter driven by an arbitrary tick source.
    pub fn with_source(source: S) -> Self {
        Self {
            source,
            ctx: None,
            admitted: 0,
        }
    }

    /// Binds the limiter to `ctx`; waiting for admission fails once the context fires.
    pub fn with_context(mut self, ctx: &Context) -> Self {
        self.ctx = Some(ctx.clone());
        self
    }

    /// Waits for the next admission.
    pub async fn admit(&mut self) -> FlowResult<()> {
        check_cancelled(self.ctx.as_ref())?;

        tokio::select! {
            biased;
            cause = fired(self.ctx.as_ref()) => Err(cause.into()),
            _ = self.source.tick() => {
                self.admitted += 1;
                counter!(TASKFLOW_ADMISSIONS_TOTAL).increment(1);
                Ok(())
            }
        }
    }

    /// Returns how many admissions were granted so far.
    pub fn admitted(&self) -> u64 {
        self.admitted
    }
}
