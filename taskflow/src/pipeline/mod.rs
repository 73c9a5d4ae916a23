//! Multi-stage processing pipelines.
//!
//! [`Pipeline`] chains the stages of [`stage`] under one cancellation context. Each stage owns the
//! channel it writes to, so dropping the final receiver abandons the whole chain and stages stop
//! on their next send.

pub mod fan;
pub mod stage;

use std::future::Future;

use taskflow_config::shared::StageConfig;

use crate::concurrency::channel::Receiver;
use crate::concurrency::context::{Cause, Context};
use crate::concurrency::rate_limiter::RateLimiter;
use crate::concurrency::timer::TickSource;
use crate::error::{FlowError, FlowResult};
use crate::task::Flow;

/// Builder chaining stages over a stream of [`Flow`] values.
#[derive(Debug)]
pub struct Pipeline<T> {
    ctx: Context,
    head: Receiver<Flow<T>>,
}

/// Everything a pipeline produced, split by kind.
#[derive(Debug)]
pub struct PipelineOutput<T> {
    pub items: Vec<T>,
    pub failures: Vec<FlowError>,
    /// Set when the run was cut short.
    pub interrupted: Option<Cause>,
}

impl<T> Pipeline<T>
where
    T: Send + 'static,
{
    /// Starts a pipeline from the values of `items`.
    pub fn from_iter<I>(ctx: &Context, items: I, capacity: usize) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self {
            ctx: ctx.clone(),
            head: stage::source(ctx, items, capacity),
        }
    }

    /// Starts a pipeline from an existing channel.
    pub fn from_receiver(ctx: &Context, head: Receiver<Flow<T>>) -> Self {
        Self {
            ctx: ctx.clone(),
            head,
        }
    }

    /// Appends a [`stage::map`] stage.
    pub fn map<B, F>(self, name: &str, config: &StageConfig, transform: F) -> FlowResult<Pipeline<B>>
    where
        B: Send + 'static,
        F: Fn(T) -> FlowResult<B> + Send + Sync + 'static,
    {
        let head = stage::map(&self.ctx, name, config, self.head, transform)?;
        Ok(Pipeline {
            ctx: self.ctx,
            head,
        })
    }

    /// Appends a [`stage::filter`] stage.
    pub fn filter<P>(self, name: &str, config: &StageConfig, predicate: P) -> FlowResult<Self>
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let head = stage::filter(&self.ctx, name, config, self.head, predicate)?;
        Ok(Self {
            ctx: self.ctx,
            head,
        })
    }

    /// Appends a [`stage::then`] stage.
    pub fn then<B, F, Fut>(
        self,
        name: &str,
        config: &StageConfig,
        transform: F,
    ) -> FlowResult<Pipeline<B>>
    where
        B: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FlowResult<B>> + Send + 'static,
    {
        let head = stage::then(&self.ctx, name, config, self.head, transform)?;
        Ok(Pipeline {
            ctx: self.ctx,
            head,
        })
    }

    /// Appends a [`stage::throttle`] stage.
    pub fn throttle<S>(self, name: &str, capacity: usize, limiter: RateLimiter<S>) -> FlowResult<Self>
    where
        S: TickSource + 'static,
    {
        let head = stage::throttle(&self.ctx, name, capacity, self.head, limiter)?;
        Ok(Self {
            ctx: self.ctx,
            head,
        })
    }

    /// Returns the receiver of the last stage.
    pub fn into_receiver(self) -> Receiver<Flow<T>> {
        self.head
    }

    /// Drains the last stage until it closes.
    pub async fn collect(self) -> FlowResult<PipelineOutput<T>> {
        let mut output = PipelineOutput {
            items: Vec::new(),
            failures: Vec::new(),
            interrupted: None,
        };

        while let Some(flow) = self.head.recv().await? {
            match flow {
                Flow::Item(item) => output.items.push(item),
                Flow::Failed(err) => output.failures.push(err),
                Flow::Interrupted(cause) => output.interrupted = Some(cause),
            }
        }

        Ok(output)
    }
}
