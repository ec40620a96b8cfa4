#[macro_use]
extern crate derive_more;
#[macro_use]
extern crate tracing;

pub mod base;
pub mod config;
pub mod ctrl;
pub mod task;

pub use crate::base::{JobId, JobState, LockMode, LockSet, Resource, SquallError, SquallResult};
pub use crate::config::{JobOptions, PoolConfig};
pub use crate::ctrl::{JobPool, JobSnapshot};
pub use crate::task::{FnTask, JobContext, QueryTask, SleepTask};
