//! Admission control for resource-touching jobs.
//!
//! The gate caps how many locking jobs may evaluate at the same time. It
//! deliberately knows nothing about locks: a job first takes a gate slot,
//! then queues for its locks, so at most `max_parallel` jobs ever compete
//! inside the lock table. Non-locking jobs never come near the gate.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

pub(crate) struct ParallelGate {
    slots: Arc<Semaphore>,
}

/// An occupied evaluation slot. Dropping it frees the slot, so a slot can
/// neither leak nor be freed twice.
#[derive(Debug)]
pub(crate) struct GatePass {
    _permit: OwnedSemaphorePermit,
}

pub(crate) enum Admission {
    Admitted(GatePass),
    /// The stop flag fired while queued; no slot is held.
    Cancelled,
}

impl ParallelGate {
    pub(crate) fn new(max_parallel: usize) -> Self {
        assert!(max_parallel >= 1, "gate width must be at least one");
        Self {
            slots: Arc::new(Semaphore::new(max_parallel)),
        }
    }

    /// Wait for a free evaluation slot. Waiters are served in arrival order.
    pub(crate) async fn admit(&self, stop: &CancellationToken) -> Admission {
        if stop.is_cancelled() {
            return Admission::Cancelled;
        }

        tokio::select! {
            permit = self.slots.clone().acquire_owned() => {
                let permit = permit.expect("gate semaphore should never be closed");
                Admission::Admitted(GatePass { _permit: permit })
            }
            _ = stop.cancelled() => Admission::Cancelled,
        }
    }
}
