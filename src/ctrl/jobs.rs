//! # Job Registry
//!
//! Identity and lifecycle bookkeeping for every job the pool has seen
//! recently. The registry hands out ids, enforces the forward-only state
//! machine, carries each job's stop token, and answers introspection
//! queries (`list`, `wait`) without ever touching a database lock.
//!
//! Settled jobs stay listed for a retention window so that their outcome
//! can still be observed, then get swept out during a later registration.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::base::{JobId, JobState, LockSet, SquallError, SquallResult, format_duration};

/// Point-in-time view of one job, as returned by listings.
#[derive(Debug, Display, Clone, Serialize)]
#[display("{id} [{state}] {} {description}", format_duration(*duration))]
pub struct JobSnapshot {
    pub id: JobId,
    /// Opaque text supplied by the task, shown in listings.
    pub description: String,
    pub state: JobState,
    /// The declared lock requirement. Empty for non-locking jobs.
    pub locks: LockSet,
    /// Time since registration, frozen once the job settles.
    pub duration: Duration,
}

/// Bookkeeping for one registered job.
struct JobEntry {
    description: String,
    locks: LockSet,
    state: JobState,
    stop: CancellationToken,
    registered_at: Instant,
    finished_at: Option<Instant>,
    /// Broadcasts every state change to `wait` subscribers.
    state_tx: watch::Sender<JobState>,
}

impl JobEntry {
    fn duration(&self) -> Duration {
        match self.finished_at {
            Some(finished) => finished.duration_since(self.registered_at),
            None => self.registered_at.elapsed(),
        }
    }
}

struct RegistryInner {
    /// The id the next registration receives.
    next_id: JobId,
    entries: BTreeMap<JobId, JobEntry>,
}

impl RegistryInner {
    /// Drops settled entries whose retention window has passed.
    fn evict_settled(&mut self, retention: Duration) {
        self.entries.retain(|id, entry| {
            let evict = entry.state.is_terminal()
                && entry.finished_at.is_some_and(|at| at.elapsed() >= retention);
            if evict {
                trace!(job = %id, "evicting settled job");
            }
            !evict
        });
    }
}

/// The shared job table. All sections under the lock are short and never
/// await; waiting for termination runs on a detached watch subscription.
pub(crate) struct JobRegistry {
    retention: Duration,
    inner: RwLock<RegistryInner>,
}

impl JobRegistry {
    pub(crate) fn new(retention: Duration) -> Self {
        Self {
            retention,
            inner: RwLock::new(RegistryInner {
                next_id: JobId::START,
                entries: BTreeMap::new(),
            }),
        }
    }

    /// Registers a new job, visible to [`list`](Self::list) from here on,
    /// and returns its id together with the stop token the rest of the
    /// pipeline watches. Settled jobs past their retention are swept out
    /// on this occasion.
    pub(crate) fn register(&self, description: &str, locks: LockSet) -> (JobId, CancellationToken) {
        let stop = CancellationToken::new();
        let mut inner = self.write();
        inner.evict_settled(self.retention);

        let id = inner.next_id;
        inner.next_id = id.successor();

        let (state_tx, _) = watch::channel(JobState::Queued);
        inner.entries.insert(
            id,
            JobEntry {
                description: description.to_string(),
                locks,
                state: JobState::Queued,
                stop: stop.clone(),
                registered_at: Instant::now(),
                finished_at: None,
                state_tx,
            },
        );
        debug!(job = %id, %description, "registered");
        (id, stop)
    }

    pub(crate) fn set_running(&self, id: JobId) {
        self.transition(id, JobState::Running);
    }

    pub(crate) fn set_completed(&self, id: JobId) {
        self.transition(id, JobState::Completed);
    }

    pub(crate) fn set_stopped(&self, id: JobId) {
        self.transition(id, JobState::Stopped);
    }

    fn transition(&self, id: JobId, to: JobState) {
        let mut inner = self.write();
        let Some(entry) = inner.entries.get_mut(&id) else {
            error!(job = %id, ?to, "state change for an unknown job");
            return;
        };

        let from = entry.state;
        let legal = matches!(
            (from, to),
            (JobState::Queued, JobState::Running)
                | (JobState::Queued, JobState::Stopped)
                | (JobState::Running, JobState::Completed)
                | (JobState::Running, JobState::Stopped)
        );
        if !legal {
            // a stop request against an already settled job is accepted
            // quietly; everything else is a pipeline bug
            if !(from.is_terminal() && to == JobState::Stopped) {
                error!(job = %id, ?from, ?to, "illegal state change rejected");
            }
            return;
        }

        entry.state = to;
        if to.is_terminal() {
            entry.finished_at = Some(Instant::now());
        }
        debug!(job = %id, ?from, ?to, "state change");
        entry.state_tx.send_replace(to);
    }

    /// A point-in-time copy of every retained job, ascending by id.
    pub(crate) fn list(&self) -> Vec<JobSnapshot> {
        let inner = self.read();
        inner
            .entries
            .iter()
            .map(|(id, entry)| JobSnapshot {
                id: *id,
                description: entry.description.clone(),
                state: entry.state,
                locks: entry.locks.clone(),
                duration: entry.duration(),
            })
            .collect()
    }

    /// Requests the job to stop. The state changes when the job itself
    /// observes the token, not here; settled jobs accept the request as a
    /// no-op.
    pub(crate) fn stop(&self, id: JobId) -> SquallResult<()> {
        let inner = self.read();
        let Some(entry) = inner.entries.get(&id) else {
            return Err(SquallError::UnknownJob(id));
        };
        trace!(job = %id, "stop requested");
        entry.stop.cancel();
        Ok(())
    }

    /// Requests every job that has not settled yet to stop.
    pub(crate) fn stop_all(&self) {
        let inner = self.read();
        for (id, entry) in &inner.entries {
            if !entry.state.is_terminal() {
                trace!(job = %id, "stop requested");
                entry.stop.cancel();
            }
        }
    }

    /// Ids of all jobs that have not settled yet, ascending.
    pub(crate) fn live_ids(&self) -> Vec<JobId> {
        let inner = self.read();
        inner
            .entries
            .iter()
            .filter(|(_, entry)| !entry.state.is_terminal())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Waits until the job settles and returns its terminal state,
    /// immediately for jobs that already did. Waiting never influences the
    /// job itself.
    pub(crate) async fn wait(&self, id: JobId) -> SquallResult<JobState> {
        // subscribe under the lock, wait outside of it
        let mut state_rx = {
            let inner = self.read();
            let Some(entry) = inner.entries.get(&id) else {
                return Err(SquallError::UnknownJob(id));
            };
            entry.state_tx.subscribe()
        };

        let state = state_rx
            .wait_for(JobState::is_terminal)
            .await
            .expect("a settled state is broadcast before an entry can be evicted");
        Ok(*state)
    }

    /// Like [`wait`](Self::wait), with an upper bound. Expiry is the
    /// distinct outcome `Ok(None)`, not an error.
    pub(crate) async fn wait_timeout(
        &self,
        id: JobId,
        limit: Duration,
    ) -> SquallResult<Option<JobState>> {
        match tokio::time::timeout(limit, self.wait(id)).await {
            Ok(settled) => settled.map(Some),
            Err(_elapsed) => Ok(None),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner
            .read()
            .expect("job registry lock should not be poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner
            .write()
            .expect("job registry lock should not be poisoned")
    }
}
