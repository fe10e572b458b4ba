use std::time::Duration;

/// Configuration for the job orchestrator.
///
/// Every knob that was an ad hoc constant in earlier iterations of the
/// backend lives here, so a single structure is handed to
/// [`Orchestrator::new`](crate::orchestrator::Orchestrator::new).
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How long a completed job's fingerprint stays reusable in the cache.
    pub cache_ttl: Duration,
    /// Maximum retry attempts for transient execution failures.
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries.
    pub backoff_base: Duration,
    /// Upper bound on a single backoff delay.
    pub backoff_cap: Duration,
    /// Number of jobs that may execute concurrently.
    pub worker_pool_size: usize,
    /// Maximum number of queued run requests before admission is rejected.
    pub queue_depth: usize,
    /// Advisory deadline handed to the solver engine so it can wind down.
    pub soft_deadline: Duration,
    /// Hard deadline after which the worker is reclaimed and the job fails.
    pub hard_deadline: Duration,
    /// Terminal jobs older than this are removed by the maintenance sweep.
    pub purge_after: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(7 * 24 * 3600),
            max_retries: 3,
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(60),
            worker_pool_size: 4,
            queue_depth: 256,
            soft_deadline: Duration::from_secs(3000),
            hard_deadline: Duration::from_secs(3600),
            purge_after: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_workers(mut self, n: usize) -> Self {
        self.worker_pool_size = n;
        self
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, base: Duration, cap: Duration) -> Self {
        self.max_retries = max_retries;
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    pub fn with_deadlines(mut self, soft: Duration, hard: Duration) -> Self {
        self.soft_deadline = soft;
        self.hard_deadline = hard;
        self
    }

    /// Backoff delay before retry attempt `attempt` (zero-based), capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_cap)
    }
}
