//! The seam between the pool and the query layer. Squall never parses or
//! compiles queries itself; it runs anything that can state its lock
//! requirement up front and evaluate cooperatively.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::base::{JobId, LockSet, SquallError, SquallResult};

/// A unit of work the pool can schedule.
///
/// The lock set is read once, before admission, and must cover everything
/// the body will touch; a body that cannot name its databases declares
/// [`Resource::Global`]. Long-running bodies are expected to call
/// [`JobContext::checkpoint`] between units of work so that stop requests
/// are honored promptly.
///
/// [`Resource::Global`]: crate::base::Resource::Global
#[async_trait]
pub trait QueryTask: Send {
    type Output: Send + 'static;

    /// Short human-readable text shown in job listings.
    fn description(&self) -> String;

    /// Everything the body will touch, declared before it runs.
    fn lock_set(&self) -> LockSet;

    async fn evaluate(&mut self, ctx: &JobContext) -> SquallResult<Self::Output>;
}

/// Identity and stop flag of one evaluation, handed to the body.
#[derive(Debug, Clone)]
pub struct JobContext {
    id: JobId,
    stop: CancellationToken,
}

impl JobContext {
    pub(crate) fn new(id: JobId, stop: CancellationToken) -> Self {
        Self { id, stop }
    }

    /// The id of the job this evaluation belongs to.
    pub const fn id(&self) -> JobId {
        self.id
    }

    /// Cooperative stop check. Call this between units of work; once a stop
    /// has been requested it returns `Err(JobStopped)` and the body should
    /// unwind. Nothing is ever preempted.
    pub fn checkpoint(&self) -> SquallResult<()> {
        if self.stop.is_cancelled() {
            return Err(SquallError::JobStopped(self.id));
        }
        Ok(())
    }

    /// Resolves once a stop has been requested. The awaitable twin of
    /// [`checkpoint`], for bodies built around `select!`.
    ///
    /// [`checkpoint`]: Self::checkpoint
    pub async fn stopped(&self) {
        self.stop.cancelled().await;
    }
}

/// Adapter that turns a closure into a [`QueryTask`].
pub struct FnTask<F> {
    description: String,
    locks: LockSet,
    body: F,
}

impl<F> FnTask<F>
where
    F: FnMut(JobContext) -> BoxFuture<'static, SquallResult<()>> + Send,
{
    pub fn new(description: impl Into<String>, locks: LockSet, body: F) -> Self {
        Self {
            description: description.into(),
            locks,
            body,
        }
    }
}

#[async_trait]
impl<F> QueryTask for FnTask<F>
where
    F: FnMut(JobContext) -> BoxFuture<'static, SquallResult<()>> + Send,
{
    type Output = ();

    fn description(&self) -> String {
        self.description.clone()
    }

    fn lock_set(&self) -> LockSet {
        self.locks.clone()
    }

    async fn evaluate(&mut self, ctx: &JobContext) -> SquallResult<()> {
        (self.body)(ctx.clone()).await
    }
}

/// A task that does nothing but hold its locks for a while. Stands in for a
/// long-running query in the demo binary and across the test suite.
pub struct SleepTask {
    locks: LockSet,
    duration: Duration,
}

impl SleepTask {
    pub fn new(locks: LockSet, duration: Duration) -> Self {
        Self { locks, duration }
    }

    /// A sleeper that touches no resources at all.
    pub fn non_locking(duration: Duration) -> Self {
        Self::new(LockSet::new(), duration)
    }
}

#[async_trait]
impl QueryTask for SleepTask {
    type Output = ();

    fn description(&self) -> String {
        format!("sleep {:?}", self.duration)
    }

    fn lock_set(&self) -> LockSet {
        self.locks.clone()
    }

    async fn evaluate(&mut self, ctx: &JobContext) -> SquallResult<()> {
        tokio::select! {
            _ = tokio::time::sleep(self.duration) => Ok(()),
            _ = ctx.stopped() => Err(SquallError::JobStopped(ctx.id())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> (JobContext, CancellationToken) {
        let stop = CancellationToken::new();
        (JobContext::new(JobId::START, stop.clone()), stop)
    }

    #[test]
    fn test_checkpoint_passes_until_stop() {
        let (ctx, stop) = context();
        assert!(ctx.checkpoint().is_ok());

        stop.cancel();
        match ctx.checkpoint() {
            Err(SquallError::JobStopped(id)) => assert_eq!(id, ctx.id()),
            other => panic!("expected JobStopped, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sleep_task_finishes_without_stop() {
        let (ctx, _stop) = context();
        let mut task = SleepTask::non_locking(Duration::from_millis(5));
        assert!(task.evaluate(&ctx).await.is_ok());
    }

    #[tokio::test]
    async fn test_sleep_task_unwinds_on_stop() {
        let (ctx, stop) = context();
        let mut task = SleepTask::non_locking(Duration::from_secs(60));

        let evaluation = task.evaluate(&ctx);
        tokio::pin!(evaluation);

        // not done yet
        let probe = tokio::time::timeout(Duration::from_millis(20), &mut evaluation).await;
        assert!(probe.is_err(), "sleeper should still be running");

        stop.cancel();
        let res = tokio::time::timeout(Duration::from_secs(1), evaluation)
            .await
            .expect("sleeper should honor the stop request promptly");
        assert!(matches!(res, Err(SquallError::JobStopped(_))));
    }
}
