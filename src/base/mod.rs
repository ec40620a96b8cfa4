//! This module contains base types that are used across Squall.
//!
//! - [`JobId`]: A job identifier new-type. Ids are handed out in ascending
//!   order and never reused within a process.
//! - [`JobState`]: The lifecycle of a registered job.
//! - [`Resource`]: A lockable unit, either one database or the whole store.
//! - [`LockMode`]: How a job intends to use a resource.
//! - [`LockSet`]: The full lock requirement of one job, canonical by
//!   construction.

use std::time::Duration;

use itertools::Itertools;
use nonmax::NonMaxU64;
use serde::{Deserialize, Serialize};

pub mod error;

pub use error::*;

#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[debug("JobId({_0})")]
#[display("job:{_0}")]
pub struct JobId(NonMaxU64);

impl JobId {
    /// The first id a registry hands out.
    pub const START: Self = unsafe { Self::new_unchecked(1) };
    /// The highest representable id. The niche at `u64::MAX` keeps
    /// `Option<JobId>` pointer-sized.
    pub const MAX: Self = unsafe { Self::new_unchecked(u64::MAX - 1) };

    /// Creates a new `JobId` without verifying that it is within bounds.
    ///
    /// # Safety
    ///
    /// Caller has to ensure that `val` is at most [`JobId::MAX`].
    #[inline]
    pub(crate) const unsafe fn new_unchecked(val: u64) -> Self {
        // SAFETY: User has to ensure that `val <= Self::MAX`
        return Self(unsafe { NonMaxU64::new_unchecked(val) });
    }

    /// Returns the value as a u64 primitive type.
    #[inline]
    pub const fn get(&self) -> u64 {
        return self.0.get();
    }

    /// The id that will be handed out after this one.
    #[inline]
    pub(crate) const fn successor(&self) -> Self {
        // SAFETY: ids start at START and a single process never hands out
        // 2^64 - 1 of them
        unsafe { Self::new_unchecked(self.0.get() + 1) }
    }
}

/// Lifecycle of a registered job. Transitions only move forward:
///
/// ```not_rust
/// Queued ---> Running ---> Completed
///    |           |
///    +-----------+-------> Stopped
/// ```
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Registered, but still short of an evaluation slot or of its locks.
    Queued,
    /// Holds its slot and all of its locks; the body is being evaluated.
    Running,
    /// The body finished on its own.
    Completed,
    /// The job honored a stop request, either before or during evaluation.
    Stopped,
}

impl JobState {
    /// Terminal states never transition again.
    #[inline]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Stopped)
    }
}

/// A lockable unit.
///
/// ## Resource Ordering
///
/// The derived order puts [`Global`] before every database and sorts
/// databases by name. Every job acquires its resources in exactly this
/// order, which rules out acquisition cycles between jobs.
///
/// [`Global`]: Resource::Global
#[derive(Debug, Display, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Resource {
    /// The whole store. Conflicts with every other grant, whatever the mode.
    /// Declared by jobs whose database accesses cannot be named up front.
    #[display("GLOBAL")]
    Global,
    /// A single named database.
    #[display("{_0}")]
    Database(String),
}

/// How a job intends to use a resource.
#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum LockMode {
    /// The resource is only inspected. Readers share.
    Read,
    /// The resource is modified. The holder excludes everyone else.
    Write,
}

impl LockMode {
    /// The stronger of two modes. `Write` wins.
    #[inline]
    pub(crate) const fn strongest(self, other: Self) -> Self {
        match (self, other) {
            (LockMode::Read, LockMode::Read) => LockMode::Read,
            _ => LockMode::Write,
        }
    }
}

/// The full lock requirement of one job.
///
/// Canonical by construction: entries are sorted ascending ([`Resource`]
/// order, so [`Global`] first), one entry per resource with `Write` winning
/// over `Read`, and a set containing [`Global`] collapses to that single
/// entry. The collapse is sound because `Global` conflicts with everything
/// in either mode, so the dropped database entries cannot change which
/// schedules are admissible.
///
/// An empty set marks a non-locking job; such jobs bypass admission and the
/// lock table entirely.
///
/// [`Global`]: Resource::Global
#[derive(Debug, Display, Clone, Default, PartialEq, Eq, Serialize)]
#[display("{}", entries.iter().map(|(res, mode)| format!("{res}:{mode}")).join(", "))]
#[serde(transparent)]
pub struct LockSet {
    entries: Vec<(Resource, LockMode)>,
}

impl LockSet {
    /// The empty requirement of a non-locking job.
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Shorthand for the set that locks the whole store.
    pub fn global(mode: LockMode) -> Self {
        let mut set = Self::new();
        set.insert(Resource::Global, mode);
        set
    }

    /// Builder-style insert of a read entry.
    pub fn read(mut self, resource: Resource) -> Self {
        self.insert(resource, LockMode::Read);
        self
    }

    /// Builder-style insert of a write entry.
    pub fn write(mut self, resource: Resource) -> Self {
        self.insert(resource, LockMode::Write);
        self
    }

    /// Add one requirement, keeping the set canonical.
    pub fn insert(&mut self, resource: Resource, mode: LockMode) {
        match self
            .entries
            .binary_search_by(|(held, _)| held.cmp(&resource))
        {
            Ok(idx) => {
                let held = &mut self.entries[idx].1;
                *held = held.strongest(mode);
            }
            Err(idx) => self.entries.insert(idx, (resource, mode)),
        }

        // a Global entry makes every database entry redundant
        if matches!(self.entries.first(), Some((Resource::Global, _))) && self.entries.len() > 1 {
            let strongest = self
                .entries
                .iter()
                .fold(LockMode::Read, |acc, (_, mode)| acc.strongest(*mode));
            self.entries.clear();
            self.entries.push((Resource::Global, strongest));
        }
    }

    /// Whether this set locks the whole store.
    pub fn is_global(&self) -> bool {
        matches!(self.entries.first(), Some((Resource::Global, _)))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Entries in canonical (acquisition) order.
    pub fn iter(&self) -> impl Iterator<Item = &(Resource, LockMode)> {
        self.entries.iter()
    }

    pub fn contains(&self, resource: &Resource) -> bool {
        self.entries
            .binary_search_by(|(held, _)| held.cmp(resource))
            .is_ok()
    }

    /// The mode this set requires for `resource`, if any.
    pub fn mode_of(&self, resource: &Resource) -> Option<LockMode> {
        self.entries
            .binary_search_by(|(held, _)| held.cmp(resource))
            .ok()
            .map(|idx| self.entries[idx].1)
    }
}

/// Formats a duration the way job listings print it, with millisecond
/// precision.
pub(crate) fn format_duration(duration: Duration) -> String {
    format!("{:.3}s", duration.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db(name: &str) -> Resource {
        Resource::Database(name.to_string())
    }

    #[test]
    fn test_job_id_successor_is_ascending() {
        let first = JobId::START;
        let second = first.successor();
        assert!(second > first);
        assert_eq!(second.get(), first.get() + 1);
        assert_eq!(format!("{first}"), "job:1");
    }

    #[test]
    fn test_job_state_terminality() {
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Stopped.is_terminal());
    }

    #[test]
    fn test_lock_set_orders_global_first() {
        let set = LockSet::new()
            .read(db("factbook"))
            .write(Resource::Global)
            .read(db("addresses"));
        assert!(set.is_global());
        assert_eq!(set.len(), 1);
        assert_eq!(set.mode_of(&Resource::Global), Some(LockMode::Write));
    }

    #[test]
    fn test_lock_set_sorts_databases_by_name() {
        let set = LockSet::new()
            .write(db("zoo"))
            .read(db("addresses"))
            .write(db("factbook"));
        let names: Vec<_> = set.iter().map(|(res, _)| format!("{res}")).collect();
        assert_eq!(names, vec!["addresses", "factbook", "zoo"]);
    }

    #[test]
    fn test_lock_set_write_wins_on_duplicate() {
        let set = LockSet::new().read(db("docs")).write(db("docs"));
        assert_eq!(set.len(), 1);
        assert_eq!(set.mode_of(&db("docs")), Some(LockMode::Write));

        // same outcome with the insert order reversed
        let set = LockSet::new().write(db("docs")).read(db("docs"));
        assert_eq!(set.mode_of(&db("docs")), Some(LockMode::Write));
    }

    #[test]
    fn test_lock_set_global_collapse_keeps_strongest_mode() {
        let set = LockSet::new()
            .read(Resource::Global)
            .write(db("docs"))
            .read(db("logs"));
        assert_eq!(set.len(), 1);
        assert_eq!(set.mode_of(&Resource::Global), Some(LockMode::Write));
    }

    #[test]
    fn test_lock_set_permutations_are_equal() {
        let forward = LockSet::new().write(db("d1")).write(db("d2"));
        let backward = LockSet::new().write(db("d2")).write(db("d1"));
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_lock_set_display() {
        let set = LockSet::new().write(db("docs")).read(db("logs"));
        assert_eq!(format!("{set}"), "docs:Write, logs:Read");
        assert_eq!(format!("{}", LockSet::global(LockMode::Read)), "GLOBAL:Read");
    }
}
