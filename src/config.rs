//! Configuration for a herder pool.

use std::time::Duration;

/// Tunables for [`init_pool`](crate::init_pool).
#[derive(Debug, Clone)]
pub struct HerderConfig {
    /// Maximum number of ready items drained per `wait` call (spec section
    /// 4.2). Defaults to 1024, matching `MAX_EVENTS` in the kernel module
    /// this engine is modeled on.
    pub max_events: usize,
    /// How long a Herder's `wait` blocks before returning with zero events
    /// absent any readiness or should-wake signal.
    pub wait_timeout: Duration,
    /// Bound on the worker pool's job queue, when this crate's own
    /// [`ChannelWorkerPool`](crate::worker_pool::ChannelWorkerPool) is used.
    pub worker_queue_capacity: usize,
    /// Fixed set of logical CPU ids to run one Herder on each. `None` uses
    /// every CPU `core_affinity` discovers, i.e. one Herder per online CPU
    /// (spec section 4.1). Tests pass a short explicit list to get a
    /// deterministic herder count.
    pub cpu_ids: Option<Vec<usize>>,
}

impl Default for HerderConfig {
    fn default() -> Self {
        Self {
            max_events: 1024,
            wait_timeout: Duration::from_millis(500),
            worker_queue_capacity: 4096,
            cpu_ids: None,
        }
    }
}
