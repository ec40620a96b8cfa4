use std::time::Duration;

/// Configuration for a job pool and its admission gate.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on concurrently evaluating resource-touching jobs.
    /// Non-locking jobs are not counted against it. Must be at least one.
    pub max_parallel: usize,
    /// How long finished jobs stay visible to listings before eviction.
    pub retention: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_parallel: 8,
            retention: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    /// A config tuned for fast testing.
    ///
    /// - **max_parallel:** Two slots, so queueing behind the gate is easy to
    ///   provoke.
    #[cfg(test)]
    pub fn for_testing() -> Self {
        Self {
            max_parallel: 2,
            ..Default::default()
        }
    }
}

/// Per-job options supplied at submission.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Cooperative evaluation deadline, measured from registration so that
    /// queue time counts against it. On expiry the job's stop flag is fired;
    /// the job still unwinds at its own pace and ends `Stopped`.
    pub timeout: Option<Duration>,
}

impl JobOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}
