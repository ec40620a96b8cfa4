//! # Job Pool
//!
//! The scheduler. Every job, detached or inline, runs the same linear
//! pipeline:
//!
//! ```not_rust
//! register -> admit -> acquire -> evaluate -> release -> settle
//! ```
//!
//! Locking jobs pass the admission gate and then the lock table; a job
//! with an empty lock set jumps straight to evaluation, unlimited and
//! unblockable. A stop request observed before evaluation skips the body
//! entirely; one observed during evaluation is honored at the body's next
//! checkpoint. On every path all holdings are released before the job
//! settles.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::base::{JobId, JobState, LockSet, SquallError, SquallResult};
use crate::config::{JobOptions, PoolConfig};
use crate::ctrl::gate::{Admission, GatePass, ParallelGate};
use crate::ctrl::jobs::{JobRegistry, JobSnapshot};
use crate::ctrl::locks::{Acquire, LockHold, LockManager};
use crate::task::{JobContext, QueryTask};

/// How long `shutdown` waits for each live job to honor its stop request.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

struct PoolShared {
    registry: JobRegistry,
    gate: ParallelGate,
    locks: LockManager,
}

/// The entry point of the crate: schedules [`QueryTask`]s, bounds their
/// parallelism, arbitrates their locks and tracks their lifecycle.
pub struct JobPool {
    shared: Arc<PoolShared>,
    is_shutdown: bool,
}

impl JobPool {
    /// Brings up a pool with the given limits.
    pub async fn init(config: PoolConfig) -> Self {
        info!(
            max_parallel = config.max_parallel,
            retention = ?config.retention,
            "starting job pool"
        );
        let shared = Arc::new(PoolShared {
            registry: JobRegistry::new(config.retention),
            gate: ParallelGate::new(config.max_parallel),
            locks: LockManager::init().await,
        });
        Self {
            shared,
            is_shutdown: false,
        }
    }

    /// Registers `task` and evaluates it on a task of its own. Returns the
    /// id right away; the outcome stays observable through [`list`] and
    /// [`wait`] for the retention window.
    ///
    /// [`list`]: Self::list
    /// [`wait`]: Self::wait
    pub fn submit<T>(&self, task: T) -> JobId
    where
        T: QueryTask + 'static,
    {
        self.submit_with(task, JobOptions::default())
    }

    /// [`submit`](Self::submit) with per-job options.
    pub fn submit_with<T>(&self, task: T, options: JobOptions) -> JobId
    where
        T: QueryTask + 'static,
    {
        let (id, stop, locks) = self.register_task(&task);
        arm_timeout(&self.shared, id, options.timeout, &stop);

        let shared = Arc::clone(&self.shared);
        tokio::task::spawn(async move {
            if let Err(error) = run_pipeline(&shared, id, stop, locks, task).await {
                debug!(job = %id, %error, "detached job finished with an error");
            }
        });
        id
    }

    /// Evaluates `task` on the caller's task and hands back its output.
    /// The job is registered like any other, so it shows up in listings
    /// and can be stopped while it runs; a stop surfaces as
    /// `Err(JobStopped)`.
    pub async fn run<T>(&self, task: T) -> SquallResult<T::Output>
    where
        T: QueryTask,
    {
        self.run_with(task, JobOptions::default()).await
    }

    /// [`run`](Self::run) with per-job options.
    pub async fn run_with<T>(&self, task: T, options: JobOptions) -> SquallResult<T::Output>
    where
        T: QueryTask,
    {
        let (id, stop, locks) = self.register_task(&task);
        arm_timeout(&self.shared, id, options.timeout, &stop);
        run_pipeline(&self.shared, id, stop, locks, task).await
    }

    /// Reads the task's lock set exactly once; registration and acquisition
    /// share the same copy, so the listed set is the acquired set.
    fn register_task<T: QueryTask>(&self, task: &T) -> (JobId, CancellationToken, LockSet) {
        let locks = task.lock_set();
        let (id, stop) = self
            .shared
            .registry
            .register(&task.description(), locks.clone());
        (id, stop, locks)
    }

    /// A point-in-time copy of every retained job, ascending by id. Served
    /// from the registry alone; never waits for any database lock.
    pub fn list(&self) -> Vec<JobSnapshot> {
        self.shared.registry.list()
    }

    /// Requests `id` to stop. Settled jobs accept the request as a no-op.
    pub fn stop(&self, id: JobId) -> SquallResult<()> {
        self.shared.registry.stop(id)
    }

    /// Requests every job that has not settled yet to stop.
    pub fn stop_all(&self) {
        self.shared.registry.stop_all();
    }

    /// Waits until `id` settles and returns its terminal state. Immediate
    /// for settled jobs; never influences the job itself.
    pub async fn wait(&self, id: JobId) -> SquallResult<JobState> {
        self.shared.registry.wait(id).await
    }

    /// Like [`wait`](Self::wait), with an upper bound. Expiry is the
    /// distinct outcome `Ok(None)`, not an error.
    pub async fn wait_timeout(
        &self,
        id: JobId,
        limit: Duration,
    ) -> SquallResult<Option<JobState>> {
        self.shared.registry.wait_timeout(id, limit).await
    }

    /// Stops every live job and waits, bounded per job, for each to settle.
    pub async fn shutdown(&mut self) {
        assert!(!self.is_shutdown, "pool was shut down twice");
        self.is_shutdown = true;

        info!("shutting down job pool");
        self.shared.registry.stop_all();
        for id in self.shared.registry.live_ids() {
            match self.shared.registry.wait_timeout(id, SHUTDOWN_GRACE).await {
                Ok(Some(state)) => trace!(job = %id, ?state, "job settled"),
                Ok(None) => warn!(job = %id, "job ignored the stop request"),
                // evicted in the meantime, nothing left to wait for
                Err(_unknown) => {}
            }
        }
        info!("job pool shut down");
    }
}

impl Drop for JobPool {
    fn drop(&mut self) {
        if !self.is_shutdown {
            // detached jobs still observe their stop tokens and unwind
            self.shared.registry.stop_all();
        }
    }
}

/// The pipeline every job runs, start to settle.
#[instrument(skip_all, level = "debug", fields(job = %id))]
async fn run_pipeline<T: QueryTask>(
    shared: &PoolShared,
    id: JobId,
    stop: CancellationToken,
    locks: LockSet,
    mut task: T,
) -> SquallResult<T::Output> {
    // a stop that lands before the first poll is honored without running
    // the body; non-locking jobs have no later wait that would observe it
    if stop.is_cancelled() {
        debug!("stopped before starting");
        shared.registry.set_stopped(id);
        return Err(SquallError::JobStopped(id));
    }

    let mut pass: Option<GatePass> = None;
    let mut hold: Option<LockHold> = None;
    if !locks.is_empty() {
        // -- Phase 1: admission --
        pass = match shared.gate.admit(&stop).await {
            Admission::Admitted(pass) => Some(pass),
            Admission::Cancelled => {
                debug!("stopped while waiting for admission");
                shared.registry.set_stopped(id);
                return Err(SquallError::JobStopped(id));
            }
        };

        // -- Phase 2: locking --
        hold = match shared.locks.acquire(id, &locks, &stop).await {
            Acquire::Acquired(hold) => Some(hold),
            Acquire::Cancelled => {
                debug!("stopped while waiting for locks");
                drop(pass);
                shared.registry.set_stopped(id);
                return Err(SquallError::JobStopped(id));
            }
        };
    }

    // -- Phase 3: evaluation --
    shared.registry.set_running(id);
    let ctx = JobContext::new(id, stop);
    let outcome = task.evaluate(&ctx).await;

    // -- Phase 4: release and settle --
    drop(hold);
    drop(pass);
    match outcome {
        Err(SquallError::JobStopped(_)) => {
            shared.registry.set_stopped(id);
            Err(SquallError::JobStopped(id))
        }
        outcome => {
            // evaluation errors are still a completed evaluation
            shared.registry.set_completed(id);
            outcome
        }
    }
}

/// Fires the job's stop flag once `timeout` elapses. The watchdog stands
/// down as soon as the job settles or is stopped by other means.
fn arm_timeout(
    shared: &Arc<PoolShared>,
    id: JobId,
    timeout: Option<Duration>,
    stop: &CancellationToken,
) {
    let Some(limit) = timeout else {
        return;
    };

    let shared = Arc::clone(shared);
    let stop = stop.clone();
    tokio::task::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(limit) => {
                debug!(job = %id, ?limit, "evaluation timeout expired; requesting stop");
                stop.cancel();
            }
            _ = stop.cancelled() => {}
            _ = shared.registry.wait(id) => {}
        }
    });
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::base::{LockMode, LockSet, Resource};
    use crate::task::SleepTask;
    use crate::tests::setup_tracing;

    const LONG: Duration = Duration::from_secs(60);
    const SHORT: Duration = Duration::from_millis(10);

    async fn pool() -> JobPool {
        setup_tracing();
        JobPool::init(PoolConfig::for_testing()).await
    }

    fn db_write(name: &str) -> LockSet {
        LockSet::new().write(Resource::Database(name.to_string()))
    }

    fn count_in(pool: &JobPool, state: JobState) -> usize {
        pool.list().iter().filter(|job| job.state == state).count()
    }

    fn state_of(pool: &JobPool, id: JobId) -> JobState {
        pool.list()
            .into_iter()
            .find(|job| job.id == id)
            .expect("job is listed")
            .state
    }

    /// Polls `check` until it holds, failing the test after two seconds.
    async fn eventually(what: &str, check: impl Fn() -> bool) {
        let result = tokio::time::timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(result.is_ok(), "timed out waiting until {what}");
    }

    #[tokio::test]
    async fn test_submitted_job_runs_to_completion() {
        let pool = pool().await;
        let id = pool.submit(SleepTask::new(db_write("docs"), SHORT));

        let state = tokio::time::timeout(Duration::from_secs(2), pool.wait(id))
            .await
            .expect("job should settle quickly")
            .expect("job is known");
        assert_eq!(state, JobState::Completed);
        assert_eq!(state_of(&pool, id), JobState::Completed);
    }

    #[tokio::test]
    async fn test_run_returns_the_output() {
        struct Answer;

        #[async_trait]
        impl QueryTask for Answer {
            type Output = u32;

            fn description(&self) -> String {
                "the answer".to_string()
            }

            fn lock_set(&self) -> LockSet {
                LockSet::new()
            }

            async fn evaluate(&mut self, _ctx: &JobContext) -> SquallResult<u32> {
                Ok(42)
            }
        }

        let pool = pool().await;
        let answer = pool.run(Answer).await.expect("evaluation succeeds");
        assert_eq!(answer, 42);
        assert_eq!(count_in(&pool, JobState::Completed), 1);
    }

    #[tokio::test]
    async fn test_run_surfaces_evaluation_errors_as_completed() {
        let pool = pool().await;
        let task = crate::task::FnTask::new("failing query", db_write("docs"), |_ctx| {
            Box::pin(async { Err(SquallError::Eval("division by zero".to_string())) })
        });

        let outcome = pool.run(task).await;
        assert!(matches!(outcome, Err(SquallError::Eval(_))));
        // the evaluation ran and finished; only stops end differently
        assert_eq!(count_in(&pool, JobState::Completed), 1);
    }

    #[tokio::test]
    async fn test_run_reports_stop_as_job_stopped() {
        let pool = Arc::new(pool().await);

        let runner = {
            let pool = Arc::clone(&pool);
            tokio::task::spawn(async move { pool.run(SleepTask::new(db_write("docs"), LONG)).await })
        };

        eventually("the job is running", || {
            count_in(&pool, JobState::Running) == 1
        })
        .await;
        let running = pool.list()[0].id;
        pool.stop(running).expect("job is known");

        let outcome = runner.await.expect("runner task does not panic");
        assert!(matches!(outcome, Err(SquallError::JobStopped(id)) if id == running));
        assert_eq!(state_of(&pool, running), JobState::Stopped);
    }

    #[tokio::test]
    async fn test_gate_caps_locking_jobs() {
        let pool = pool().await;

        // disjoint databases: only the two-slot gate limits them
        let ids = [
            pool.submit(SleepTask::new(db_write("d1"), LONG)),
            pool.submit(SleepTask::new(db_write("d2"), LONG)),
            pool.submit(SleepTask::new(db_write("d3"), LONG)),
        ];

        eventually("two jobs hold evaluation slots", || {
            count_in(&pool, JobState::Running) == 2
        })
        .await;

        // the cap holds: the third stays queued
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count_in(&pool, JobState::Running), 2);
        assert_eq!(count_in(&pool, JobState::Queued), 1);

        pool.stop_all();
        for id in ids {
            let state = tokio::time::timeout(Duration::from_secs(2), pool.wait(id))
                .await
                .expect("stopped jobs settle")
                .expect("job is known");
            assert_eq!(state, JobState::Stopped);
        }
    }

    #[tokio::test]
    async fn test_non_locking_jobs_ignore_the_cap() {
        let pool = pool().await;

        // saturate the gate
        let _w1 = pool.submit(SleepTask::new(db_write("d1"), LONG));
        let _w2 = pool.submit(SleepTask::new(db_write("d2"), LONG));
        eventually("the gate is saturated", || {
            count_in(&pool, JobState::Running) == 2
        })
        .await;

        // three more non-locking jobs all run and finish regardless
        let free = [
            pool.submit(SleepTask::non_locking(SHORT)),
            pool.submit(SleepTask::non_locking(SHORT)),
            pool.submit(SleepTask::non_locking(SHORT)),
        ];
        for id in free {
            let state = tokio::time::timeout(Duration::from_secs(2), pool.wait(id))
                .await
                .expect("non-locking jobs are not capped")
                .expect("job is known");
            assert_eq!(state, JobState::Completed);
        }
    }

    #[tokio::test]
    async fn test_non_locking_job_runs_during_global_write() {
        let pool = pool().await;

        // a long non-locking job does not hinder a global writer
        let free = pool.submit(SleepTask::non_locking(LONG));
        eventually("the non-locking job is running", || {
            count_in(&pool, JobState::Running) == 1
        })
        .await;

        let writer = pool.submit(SleepTask::new(LockSet::global(LockMode::Write), SHORT));
        let state = tokio::time::timeout(Duration::from_secs(2), pool.wait(writer))
            .await
            .expect("global writer should not wait for a non-locking job")
            .expect("job is known");
        assert_eq!(state, JobState::Completed);

        // and a long global writer does not hinder a non-locking job
        let writer = pool.submit(SleepTask::new(LockSet::global(LockMode::Write), LONG));
        eventually("the global writer is running", || {
            state_of(&pool, writer) == JobState::Running
        })
        .await;

        let late = pool.submit(SleepTask::non_locking(SHORT));
        let state = tokio::time::timeout(Duration::from_secs(2), pool.wait(late))
            .await
            .expect("non-locking job should not wait for the global writer")
            .expect("job is known");
        assert_eq!(state, JobState::Completed);
        assert_eq!(state_of(&pool, free), JobState::Running);
    }

    #[tokio::test]
    async fn test_stop_then_wait_settles_exactly_once() {
        let pool = pool().await;
        let id = pool.submit(SleepTask::new(db_write("docs"), LONG));
        eventually("the job is running", || {
            state_of(&pool, id) == JobState::Running
        })
        .await;

        pool.stop(id).expect("job is known");
        let state = tokio::time::timeout(Duration::from_secs(2), pool.wait(id))
            .await
            .expect("a stopped sleeper settles promptly")
            .expect("job is known");
        assert_eq!(state, JobState::Stopped);

        // settled: a second wait returns immediately with the same answer
        let state = tokio::time::timeout(Duration::from_millis(50), pool.wait(id))
            .await
            .expect("wait on a settled job returns immediately")
            .expect("job is known");
        assert_eq!(state, JobState::Stopped);
    }

    #[tokio::test]
    async fn test_job_stopped_while_queued_never_runs() {
        let pool = pool().await;

        let holder = pool.submit(SleepTask::new(db_write("docs"), LONG));
        eventually("the first writer holds the database", || {
            state_of(&pool, holder) == JobState::Running
        })
        .await;

        // same database: the second writer parks in the lock queue
        let parked = pool.submit(SleepTask::new(db_write("docs"), LONG));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(state_of(&pool, parked), JobState::Queued);

        pool.stop(parked).expect("job is known");
        let state = tokio::time::timeout(Duration::from_secs(2), pool.wait(parked))
            .await
            .expect("a stop resolves the parked wait")
            .expect("job is known");
        assert_eq!(state, JobState::Stopped);

        // the holder was never disturbed
        assert_eq!(state_of(&pool, holder), JobState::Running);
    }

    #[tokio::test]
    async fn test_stop_before_first_poll_skips_the_body() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let pool = pool().await;
        let ran = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&ran);
        let body = crate::task::FnTask::new("instant", LockSet::new(), move |_ctx| {
            let flag = Arc::clone(&flag);
            Box::pin(async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
        });

        // no await between submit and stop: on the single-threaded test
        // runtime the detached job has not been polled yet
        let id = pool.submit(body);
        pool.stop(id).expect("job is known");

        let state = tokio::time::timeout(Duration::from_secs(2), pool.wait(id))
            .await
            .expect("a pre-stopped job settles promptly")
            .expect("job is known");
        assert_eq!(state, JobState::Stopped);
        assert!(!ran.load(Ordering::SeqCst), "the body must not have run");
    }

    #[tokio::test]
    async fn test_registered_lock_set_governs_acquisition() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        /// Declares a write on `docs` when first asked, then claims to be
        /// non-locking.
        struct ShiftyTask {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl QueryTask for ShiftyTask {
            type Output = ();

            fn description(&self) -> String {
                "shifty lock declaration".to_string()
            }

            fn lock_set(&self) -> LockSet {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    LockSet::new().write(Resource::Database("docs".to_string()))
                } else {
                    LockSet::new()
                }
            }

            async fn evaluate(&mut self, _ctx: &JobContext) -> SquallResult<()> {
                Ok(())
            }
        }

        let pool = pool().await;
        let holder = pool.submit(SleepTask::new(db_write("docs"), LONG));
        eventually("the holder runs", || {
            state_of(&pool, holder) == JobState::Running
        })
        .await;

        // the set captured at registration is the one acquisition uses:
        // the job queues behind the holder instead of slipping through as
        // non-locking
        let shifty = pool.submit(ShiftyTask {
            calls: AtomicUsize::new(0),
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(state_of(&pool, shifty), JobState::Queued);

        pool.stop_all();
        for id in [holder, shifty] {
            let state = tokio::time::timeout(Duration::from_secs(2), pool.wait(id))
                .await
                .expect("stopped jobs settle")
                .expect("job is known");
            assert_eq!(state, JobState::Stopped);
        }
    }

    #[tokio::test]
    async fn test_unknown_ids_are_rejected() {
        let pool = pool().await;

        let err = pool.stop(JobId::START).unwrap_err();
        assert!(matches!(err, SquallError::UnknownJob(_)));
        let err = pool.wait(JobId::START).await.unwrap_err();
        assert!(matches!(err, SquallError::UnknownJob(_)));
    }

    #[tokio::test]
    async fn test_contended_writers_with_responsive_listing() {
        let pool = pool().await;

        // three writers on one database: one runs, one parks in the lock
        // queue, one never passes the two-slot gate
        let writers = [
            pool.submit(SleepTask::new(db_write("docs"), LONG)),
            pool.submit(SleepTask::new(db_write("docs"), LONG)),
            pool.submit(SleepTask::new(db_write("docs"), LONG)),
        ];
        eventually("one writer runs, two stay queued", || {
            count_in(&pool, JobState::Running) == 1 && count_in(&pool, JobState::Queued) == 2
        })
        .await;

        // listings and non-locking jobs stay responsive meanwhile
        let free = pool.submit(SleepTask::non_locking(SHORT));
        let state = tokio::time::timeout(Duration::from_secs(2), pool.wait(free))
            .await
            .expect("non-locking job is not held up by the contention")
            .expect("job is known");
        assert_eq!(state, JobState::Completed);

        // stop everything the listing shows, then wait for each entry
        for job in pool.list() {
            pool.stop(job.id).expect("listed jobs are known");
        }
        for id in writers {
            let state = tokio::time::timeout(Duration::from_secs(2), pool.wait(id))
                .await
                .expect("stopped writers settle")
                .expect("job is known");
            assert_eq!(state, JobState::Stopped);
        }
        assert!(pool.list().iter().all(|job| job.state.is_terminal()));
    }

    #[tokio::test]
    async fn test_evaluation_timeout_stops_the_job() {
        let pool = pool().await;

        let slow = pool.submit_with(
            SleepTask::new(db_write("docs"), LONG),
            JobOptions::with_timeout(Duration::from_millis(50)),
        );
        let state = tokio::time::timeout(Duration::from_secs(2), pool.wait(slow))
            .await
            .expect("the timeout fires and the job settles")
            .expect("job is known");
        assert_eq!(state, JobState::Stopped);

        // a generous timeout never fires
        let fast = pool.submit_with(
            SleepTask::new(db_write("docs"), SHORT),
            JobOptions::with_timeout(LONG),
        );
        let state = tokio::time::timeout(Duration::from_secs(2), pool.wait(fast))
            .await
            .expect("the job finishes on its own")
            .expect("job is known");
        assert_eq!(state, JobState::Completed);
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        setup_tracing();
        let mut pool = JobPool::init(PoolConfig::for_testing()).await;

        pool.submit(SleepTask::new(db_write("d1"), LONG));
        pool.submit(SleepTask::new(db_write("d1"), LONG));
        pool.submit(SleepTask::non_locking(LONG));
        eventually("jobs are underway", || {
            count_in(&pool, JobState::Running) >= 1
        })
        .await;

        pool.shutdown().await;
        assert_eq!(count_in(&pool, JobState::Stopped), 3);
    }
}
