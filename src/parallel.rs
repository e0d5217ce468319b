//! Worker pool sizing for the E-step.
//!
//! Pair evaluation is spread over a bounded rayon pool. Sizing is a pure
//! function of the available parallelism so callers can inject it; one unit
//! is left for the coordinating thread that merges results.

use log::{debug, info};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::Result;

/// Workers to use given `available` parallel units: `available - 1`, at least 1.
#[inline]
pub fn worker_count(available: usize) -> usize {
    available.saturating_sub(1).max(1)
}

/// `worker_count` over what the host reports.
pub fn default_workers() -> usize {
    let available = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let workers = worker_count(available);
    debug!("{} parallel units available, using {} workers", available, workers);
    workers
}

/// Build a named, bounded pool for EMD batches.
pub fn build_pool(workers: usize) -> Result<ThreadPool> {
    let workers = workers.max(1);
    info!("Starting EMD worker pool with {} threads", workers);
    let pool = ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("barspace-emd-{}", i))
        .build()?;
    Ok(pool)
}
