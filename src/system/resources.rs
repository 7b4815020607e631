//! CPU resources available to the decode kernels.

use std::thread;

/// Number of hardware threads, or 1 when it cannot be determined.
pub fn hardware_concurrency() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or_else(|e| {
            tracing::warn!("Could not query hardware concurrency: {}", e);
            1
        })
}

/// Default decode thread count: one core is left to the host application.
pub fn default_thread_count() -> i32 {
    let threads = hardware_concurrency().saturating_sub(1).max(1);
    i32::try_from(threads).unwrap_or(i32::MAX)
}
