//! Background housekeeping thread
//!
//! Each cycle the thread:
//! 1. Refreshes this attacher's `last_activity`, stopping for good once
//!    another client's sweep has reclaimed its slot
//! 2. Sweeps the client table for dead or watchdog-expired clients
//! 3. Writes a snapshot when `flush_cadence` has elapsed since the last one
//!
//! The thread holds the database lock only for the duration of each step.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::engine::Shared;
use crate::error::{OdbError, OdbResult};

/// Counters maintained by the housekeeping thread.
#[derive(Debug, Default)]
pub struct HousekeepingStats {
    cycles: AtomicU64,
    reclaimed: AtomicU64,
    flushes: AtomicU64,
}

impl HousekeepingStats {
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Clients reclaimed by this thread's sweeps.
    pub fn reclaimed(&self) -> u64 {
        self.reclaimed.load(Ordering::Relaxed)
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }
}

/// Handle to a running housekeeping thread.
/// Dropping this handle signals the thread to stop.
pub struct HousekeepingHandle {
    shutdown: Arc<AtomicBool>,
    stats: Arc<HousekeepingStats>,
    thread: Option<thread::JoinHandle<()>>,
}

impl HousekeepingHandle {
    /// Request shutdown and wait for the thread to finish.
    pub fn shutdown(mut self) {
        self.stop();
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |h| !h.is_finished())
    }

    pub fn stats(&self) -> Arc<HousekeepingStats> {
        Arc::clone(&self.stats)
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("housekeeping thread panicked");
            }
        }
    }
}

impl Drop for HousekeepingHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

pub(crate) fn start_housekeeping(shared: Arc<Shared>) -> OdbResult<HousekeepingHandle> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let stats = Arc::new(HousekeepingStats::default());
    let cadence = shared.config.housekeeping_cadence;
    let flush_cadence = shared.config.flush_cadence;
    let directory = shared.config.directory.clone();

    let thread = {
        let shutdown = Arc::clone(&shutdown);
        let stats = Arc::clone(&stats);
        thread::Builder::new()
            .name(format!("odb-housekeeping-{}", shared.name))
            .spawn(move || housekeeping_loop(&shared, cadence, flush_cadence, &shutdown, &stats))
            .map_err(|e| OdbError::Io {
                path: Some(directory),
                kind: std::io::ErrorKind::Other,
                message: format!("Failed to spawn housekeeping thread: {}", e),
            })?
    };

    Ok(HousekeepingHandle {
        shutdown,
        stats,
        thread: Some(thread),
    })
}

fn housekeeping_loop(
    shared: &Shared,
    cadence: Duration,
    flush_cadence: Duration,
    shutdown: &AtomicBool,
    stats: &HousekeepingStats,
) {
    let step = cadence.min(Duration::from_millis(50));
    let mut last_flush = Instant::now();

    loop {
        let wake_time = Instant::now() + cadence;
        while Instant::now() < wake_time {
            if shutdown.load(Ordering::Acquire) {
                return;
            }
            thread::sleep(step);
        }
        if shutdown.load(Ordering::Acquire) {
            return;
        }

        if let Err(e) = shared.heartbeat() {
            warn!(error = %e, "housekeeping stopped");
            return;
        }
        let reclaimed = shared.cleanup();
        stats.reclaimed.fetch_add(reclaimed.len() as u64, Ordering::Relaxed);

        if !flush_cadence.is_zero() && last_flush.elapsed() >= flush_cadence {
            match shared.flush() {
                Ok(()) => {
                    stats.flushes.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => warn!(error = %e, "periodic flush failed"),
            }
            last_flush = Instant::now();
        }

        let cycles = stats.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(cycles, reclaimed = reclaimed.len(), "housekeeping cycle");
    }
}
