//! The unit of work a runner executes.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use serde_json::Value;

use crate::cancel::CancelToken;
use crate::domain::{EntryId, JobResult};

/// Everything a job gets to see about the entry it is running.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub entry_id: EntryId,
    pub payload: Value,
    /// 1-based; counts every dequeue of this entry, reclamations included.
    pub attempt: u32,
    pub cancel: CancelToken,
}

/// Application work, executed once per dequeued entry.
///
/// Jobs report failure through [`JobResult`], not through panics; a
/// panicking job is caught by the runner and treated as a failure, but
/// loses the chance to say why.
#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self, ctx: JobContext) -> JobResult;
}

type JobFuture = Pin<Box<dyn Future<Output = JobResult> + Send>>;

/// Closure adapter so tests and small callers need not declare a struct.
pub struct JobFn<F> {
    f: F,
}

/// Wrap an async closure as a [`Job`].
pub fn job_fn<F, Fut>(f: F) -> JobFn<impl Fn(JobContext) -> JobFuture + Send + Sync>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    JobFn {
        f: move |ctx| Box::pin(f(ctx)) as JobFuture,
    }
}

#[async_trait]
impl<F> Job for JobFn<F>
where
    F: Fn(JobContext) -> JobFuture + Send + Sync,
{
    async fn run(&self, ctx: JobContext) -> JobResult {
        (self.f)(ctx).await
    }
}
