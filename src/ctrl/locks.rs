//! # Lock Table
//!
//! All database locking runs through a single table task that owns every
//! piece of lock state and is driven purely by messages. Requesters talk to
//! it through the [`LockManager`] handle; nothing else can see or mutate
//! holder and waiter state, so the table needs no internal locking of its
//! own.
//!
//! ```not_rust
//!  acquire(job, locks)          LockTable task
//!        |                            |
//!        |---- Acquire{..., tx} ----->|  queue at the gate, walk the
//!        |                            |  database sequence, park at the
//!        |<======= LockHold ==========|  first busy one
//!        |                            |
//!   drop(LockHold)                    |
//!        |---- Release(job) --------->|  free everything, wake waiters
//! ```
//!
//! ## Acquisition Order
//!
//! A job's entries are acquired strictly in [`Resource`] order: the gate
//! stage first (see below), then databases ascending by name. A job keeps
//! what it already acquired while waiting for the next entry. Since every
//! job walks the same total order, no two jobs can each hold something the
//! other is waiting for, and waits can only chain forward - acquisition
//! cycles cannot form.
//!
//! ## The Gate Stage
//!
//! Sets that lock the whole store conflict with every other grant in either
//! mode. That rule is realized as a first stage every request passes:
//! database-level sets take the gate in `Intent` mode (mutually compatible,
//! just a marker that local locking is in progress), whole-store sets take
//! it in `Exclusive` mode. An exclusive gate holder therefore excludes all
//! other jobs, and is excluded by any of them, before a single database is
//! looked at.
//!
//! ## Fairness
//!
//! Every queue in the table (the gate queue and one queue per database) is
//! strictly first-come-first-served: the front blocks everyone behind it,
//! and a newly arriving request may only take a database directly when
//! nobody queues for it. Compatible requests at the front of a queue are
//! granted together. A waiting writer consequently cannot be starved by a
//! stream of later readers.

use std::collections::{HashMap, VecDeque};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::base::{JobId, LockMode, LockSet, Resource};

/// How a request occupies the gate stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateMode {
    /// Database-level locking in progress. Intents share the gate.
    Intent,
    /// The whole store is locked. Excludes intents and other exclusives.
    Exclusive,
}

/// # Gate State
///
/// ## Compatibility
///
/// | Requested \ Held | Intent | Exclusive |
/// |------------------|--------|-----------|
/// |      Intent      |  Yes   |    No     |
/// |     Exclusive    |  No    |    No     |
#[derive(Debug, Default)]
struct GateState {
    exclusive: bool,
    intents: u32,
}

impl GateState {
    #[inline]
    const fn allows(&self, mode: GateMode) -> bool {
        match mode {
            GateMode::Intent => !self.exclusive,
            GateMode::Exclusive => !self.exclusive && self.intents == 0,
        }
    }

    fn acquire(&mut self, mode: GateMode) {
        match mode {
            GateMode::Intent => self.intents += 1,
            GateMode::Exclusive => self.exclusive = true,
        }
    }

    fn release(&mut self, mode: GateMode) {
        match mode {
            GateMode::Intent => self.intents -= 1,
            GateMode::Exclusive => self.exclusive = false,
        }
    }
}

/// # Database Lock State
///
/// ## Compatibility
///
/// | Requested \ Held | Read | Write |
/// |------------------|------|-------|
/// |       Read       | Yes  |  No   |
/// |       Write      | No   |  No   |
#[derive(Debug, Default)]
struct DbLockState {
    write_locked: bool,
    read_locks: u32,
}

impl DbLockState {
    #[inline]
    const fn allows(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Read => !self.write_locked,
            LockMode::Write => !self.write_locked && self.read_locks == 0,
        }
    }

    fn acquire(&mut self, mode: LockMode) {
        match mode {
            LockMode::Read => self.read_locks += 1,
            LockMode::Write => self.write_locked = true,
        }
    }

    fn release(&mut self, mode: LockMode) {
        match mode {
            LockMode::Read => self.read_locks -= 1,
            LockMode::Write => self.write_locked = false,
        }
    }

    /// Returns `true` when all the locks are released, otherwise `false`.
    #[inline]
    const fn all_released(&self) -> bool {
        !self.write_locked && self.read_locks == 0
    }
}

/// Lock state and wait queue of one database, created on first touch and
/// garbage collected once both are empty.
#[derive(Debug, Default)]
struct DbState {
    locks: DbLockState,
    queue: VecDeque<JobId>,
}

pub(crate) struct LockRequest {
    job: JobId,
    locks: LockSet,
    grant_tx: oneshot::Sender<LockHold>,
}

pub(crate) enum TableMessage {
    Acquire(LockRequest),
    /// Give back everything the job holds, including a queue slot it may
    /// still occupy. Sent by [`LockHold`] on drop and by requesters that
    /// stop waiting.
    Release(JobId),
}

/// Everything the table knows about one queued or granted job.
struct LockRecord {
    gate_mode: GateMode,
    /// True once the gate stage has been passed.
    holds_gate: bool,
    /// The database sequence in canonical order. Empty for whole-store
    /// requests, whose only stage is the exclusive gate.
    dbs: Vec<(String, LockMode)>,
    /// Databases before this index are held; the one at it is being waited
    /// for. Equal to the sequence length once fully granted.
    next_db: usize,
    /// Present while the requester is still waiting for the full grant.
    grant_tx: Option<oneshot::Sender<LockHold>>,
}

/// Proof that a job holds its full lock set. Dropping it returns every lock
/// to the table.
#[derive(Debug)]
pub(crate) struct LockHold {
    job: JobId,
    #[debug(skip)]
    tx: mpsc::UnboundedSender<TableMessage>,
}

impl Drop for LockHold {
    fn drop(&mut self) {
        // signal to the table that the resources can be handed out again
        if self.tx.send(TableMessage::Release(self.job)).is_err() {
            debug!(job = %self.job, "lock table gone before release");
        }
    }
}

struct LockTable {
    gate: GateState,
    /// Jobs waiting for the gate stage, in arrival order.
    gate_queue: VecDeque<JobId>,
    dbs: HashMap<String, DbState>,
    /// Every queued or granted job, keyed by id.
    records: HashMap<JobId, LockRecord>,
    /// The transmitter of messages to this table.
    tx: mpsc::UnboundedSender<TableMessage>,
    /// The receiver of messages to this table.
    rx: mpsc::UnboundedReceiver<TableMessage>,
}

impl LockTable {
    async fn run(&mut self) {
        loop {
            tokio::select! {
                Some(msg) = self.rx.recv() => self.handle_message(msg),
                else => break,
            }
        }
    }

    fn handle_message(&mut self, message: TableMessage) {
        match message {
            TableMessage::Acquire(request) => self.handle_acquire(request),
            TableMessage::Release(job) => self.release(job),
        }
    }

    fn handle_acquire(&mut self, request: LockRequest) {
        let LockRequest {
            job,
            locks,
            grant_tx,
        } = request;

        let gate_mode = if locks.is_global() {
            GateMode::Exclusive
        } else {
            GateMode::Intent
        };
        let dbs: Vec<(String, LockMode)> = locks
            .iter()
            .filter_map(|(res, mode)| match res {
                Resource::Database(name) => Some((name.clone(), *mode)),
                Resource::Global => None,
            })
            .collect();

        trace!(%job, %locks, "queueing lock request");
        let previous = self.records.insert(
            job,
            LockRecord {
                gate_mode,
                holds_gate: false,
                dbs,
                next_db: 0,
                grant_tx: Some(grant_tx),
            },
        );
        assert!(previous.is_none(), "job {job} queued a second lock request");

        self.gate_queue.push_back(job);
        self.pump_gate();
    }

    /// Full release of one job: its locks, and the queue slot it may still
    /// occupy. A job unknown to the table is a no-op, which absorbs the
    /// duplicate release after a stop raced with a grant.
    fn release(&mut self, job: JobId) {
        let Some(record) = self.records.remove(&job) else {
            trace!(%job, "release for a job with no holdings");
            return;
        };
        trace!(%job, "releasing");

        // a job still waiting is parked in exactly one queue
        if record.grant_tx.is_some() {
            if record.holds_gate {
                let (name, _) = &record.dbs[record.next_db];
                let state = self
                    .dbs
                    .get_mut(name)
                    .expect("a parked job's database should have state");
                state.queue.retain(|waiting| *waiting != job);
            } else {
                self.gate_queue.retain(|waiting| *waiting != job);
            }
        }

        if record.holds_gate {
            self.gate.release(record.gate_mode);
        }
        for (name, mode) in &record.dbs[..record.next_db] {
            let state = self
                .dbs
                .get_mut(name)
                .expect("resource should have been locked before");
            state.locks.release(*mode);
        }

        // freed capacity may unblock the gate and every touched database
        self.pump_gate();
        for (name, _) in &record.dbs[..record.next_db] {
            self.pump_db(name);
        }
        if record.grant_tx.is_some() && record.holds_gate {
            // vacating a queue slot can unblock the jobs parked behind it
            let (name, _) = &record.dbs[record.next_db];
            self.pump_db(name);
        }
    }

    /// Admit the longest compatible prefix of the gate queue, advancing each
    /// admitted job into its database sequence.
    fn pump_gate(&mut self) {
        while let Some(&job) = self.gate_queue.front() {
            let record = self
                .records
                .get(&job)
                .expect("queued job should have a record");
            if !self.gate.allows(record.gate_mode) {
                break;
            }
            let mode = record.gate_mode;
            self.gate_queue.pop_front();
            self.gate.acquire(mode);
            self.records
                .get_mut(&job)
                .expect("queued job should have a record")
                .holds_gate = true;
            self.advance(job);
        }
    }

    /// Grant `name` to the longest compatible prefix of its queue, advancing
    /// each granted job further along its sequence.
    fn pump_db(&mut self, name: &str) {
        loop {
            let state = self
                .dbs
                .get_mut(name)
                .expect("pumped database should have state");
            let Some(&job) = state.queue.front() else {
                break;
            };
            let record = self
                .records
                .get(&job)
                .expect("queued job should have a record");
            let mode = record.dbs[record.next_db].1;
            if !state.locks.allows(mode) {
                break;
            }
            state.queue.pop_front();
            state.locks.acquire(mode);
            self.records
                .get_mut(&job)
                .expect("queued job should have a record")
                .next_db += 1;
            self.advance(job);
        }

        // NB: when nothing is held or queued anymore, we can do 'garbage
        // collection' on this entry, to prevent accumulation over time
        if let Some(state) = self.dbs.get(name)
            && state.locks.all_released()
            && state.queue.is_empty()
        {
            self.dbs.remove(name);
        }
    }

    /// Walk `job` forward through its database sequence. Every database
    /// whose queue is empty and whose state allows the mode is taken
    /// directly; the first busy one parks the job in that database's queue,
    /// with everything acquired so far kept.
    fn advance(&mut self, job: JobId) {
        loop {
            let record = self
                .records
                .get(&job)
                .expect("advancing job should have a record");
            if record.next_db == record.dbs.len() {
                self.finish_grant(job);
                return;
            }

            let (name, mode) = record.dbs[record.next_db].clone();
            let state = self.dbs.entry(name).or_default();
            if state.queue.is_empty() && state.locks.allows(mode) {
                state.locks.acquire(mode);
                self.records
                    .get_mut(&job)
                    .expect("advancing job should have a record")
                    .next_db += 1;
            } else {
                state.queue.push_back(job);
                return;
            }
        }
    }

    /// Send the hold back to the requester once the whole sequence is held.
    fn finish_grant(&mut self, job: JobId) {
        let record = self
            .records
            .get_mut(&job)
            .expect("granted job should have a record");
        let grant_tx = record
            .grant_tx
            .take()
            .expect("a job should not be granted twice");

        trace!(%job, "lock set fully granted");
        let hold = LockHold {
            job,
            tx: self.tx.clone(),
        };
        if let Err(hold) = grant_tx.send(hold) {
            // the requester gave up while the grant was in flight; dropping
            // the hold routes the release back through the queue
            drop(hold);
        }
    }
}

/// Outcome of one acquisition attempt.
pub(crate) enum Acquire {
    /// Every entry of the set is held. Dropping the hold releases them all.
    Acquired(LockHold),
    /// The stop flag fired while waiting; nothing is held.
    Cancelled,
}

/// Manages access to all databases of the store. The management happens
/// through communication with the [`LockTable`], which runs in a background
/// task and listens for incoming messages through an async channel.
pub(crate) struct LockManager {
    tx: mpsc::UnboundedSender<TableMessage>,
}

impl LockManager {
    pub(crate) async fn init() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut table = LockTable {
            gate: GateState::default(),
            gate_queue: VecDeque::new(),
            dbs: HashMap::new(),
            records: HashMap::new(),
            tx: tx.clone(),
            rx,
        };
        tokio::task::spawn(async move {
            table.run().await;
        });

        Self { tx }
    }

    /// Take every entry of `locks` for `job`, waiting as long as needed.
    /// A stop request observed while waiting unwinds anything partially
    /// acquired and returns [`Acquire::Cancelled`].
    pub(crate) async fn acquire(
        &self,
        job: JobId,
        locks: &LockSet,
        stop: &CancellationToken,
    ) -> Acquire {
        if stop.is_cancelled() {
            return Acquire::Cancelled;
        }

        let (grant_tx, grant_rx) = oneshot::channel();
        let request = LockRequest {
            job,
            locks: locks.clone(),
            grant_tx,
        };
        self.tx
            .send(TableMessage::Acquire(request))
            .expect("lock table channel should not be closed");

        tokio::select! {
            granted = grant_rx => match granted {
                Ok(hold) => Acquire::Acquired(hold),
                Err(_recv_error) => {
                    panic!("Channel closed: lock table task has likely crashed!")
                }
            },
            _ = stop.cancelled() => {
                // the table unwinds whatever this job already holds; when
                // the grant raced ahead, dropping the receiver releases it
                if self.tx.send(TableMessage::Release(job)).is_err() {
                    debug!(%job, "lock table gone before release");
                }
                Acquire::Cancelled
            }
        }
    }
}
