//! Background purging of expired in-memory buffers
//!
//! A tokio task wakes up every `interval` (or when triggered) and asks the
//! target to drop whatever has outlived its lifetime.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::logging::services;

/// Outcome of one purge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub buffers: u64,
    pub bytes: u64,
}

/// Something that holds expiring entries
pub trait Evictable: Send + Sync + 'static {
    fn purge_expired(&self, now: Instant) -> EvictionReport;
}

/// Eviction statistics
#[derive(Debug, Default)]
pub struct EvictionStats {
    pub buffers_evicted: AtomicU64,
    pub bytes_evicted: AtomicU64,
    pub eviction_runs: AtomicU64,
}

impl EvictionStats {
    fn record(&self, report: EvictionReport) {
        self.eviction_runs.fetch_add(1, Ordering::Relaxed);
        self.buffers_evicted.fetch_add(report.buffers, Ordering::Relaxed);
        self.bytes_evicted.fetch_add(report.bytes, Ordering::Relaxed);
    }

    pub fn runs(&self) -> u64 {
        self.eviction_runs.load(Ordering::Relaxed)
    }

    pub fn buffers(&self) -> u64 {
        self.buffers_evicted.load(Ordering::Relaxed)
    }
}

/// Handle to control the background eviction task
pub struct EvictionHandle {
    shutdown: Arc<AtomicBool>,
    notify: Arc<Notify>,
    stats: Arc<EvictionStats>,
    join_handle: Option<tokio::task::JoinHandle<()>>,
}

impl EvictionHandle {
    /// Run a purge now instead of waiting for the interval
    pub fn trigger(&self) {
        self.notify.notify_one();
    }

    pub fn stats(&self) -> &Arc<EvictionStats> {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.load(Ordering::SeqCst)
    }

    /// Stop the task, waiting up to five seconds for it to finish
    pub async fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_one();

        if let Some(handle) = self.join_handle.take() {
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(Ok(())) => debug!(service = services::BUFFER_CACHE, "Eviction task stopped"),
                Ok(Err(e)) => warn!(service = services::BUFFER_CACHE, error = %e, "Eviction task panicked"),
                Err(_) => warn!(service = services::BUFFER_CACHE, "Eviction task did not stop in time"),
            }
        }
    }
}

impl Drop for EvictionHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.join_handle.take() {
            handle.abort();
        }
    }
}

/// Spawn the purge loop on the current tokio runtime
pub fn spawn_eviction<E: Evictable>(target: Arc<E>, interval: Duration) -> EvictionHandle {
    let shutdown = Arc::new(AtomicBool::new(false));
    let notify = Arc::new(Notify::new());
    let stats = Arc::new(EvictionStats::default());

    let join_handle = tokio::spawn(run_eviction_loop(
        target,
        interval,
        Arc::clone(&shutdown),
        Arc::clone(&notify),
        Arc::clone(&stats),
    ));

    info!(
        service = services::BUFFER_CACHE,
        interval_secs = interval.as_secs_f64(),
        "Eviction task started"
    );

    EvictionHandle {
        shutdown,
        notify,
        stats,
        join_handle: Some(join_handle),
    }
}

async fn run_eviction_loop<E: Evictable>(
    target: Arc<E>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
    notify: Arc<Notify>,
    stats: Arc<EvictionStats>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = notify.notified() => {}
        }

        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let report = target.purge_expired(Instant::now());
        stats.record(report);
    }

    debug!(service = services::BUFFER_CACHE, "Eviction loop exited");
}
