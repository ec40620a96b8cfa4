//! The control plane: admission, locking and lifecycle bookkeeping for
//! every job the pool schedules. [`pool`] wires the three together; the
//! submodules never call each other.

pub(crate) mod gate;
pub mod jobs;
pub(crate) mod locks;
pub mod pool;

pub use jobs::JobSnapshot;
pub use pool::JobPool;
