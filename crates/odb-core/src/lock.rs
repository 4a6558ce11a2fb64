//! Two-layer recursive database lock
//!
//! The outer layer is a `parking_lot::ReentrantMutex` that serializes the
//! threads of this process and carries the recursion depth. The inner layer
//! is an exclusive advisory lock on `<name>.LCK`, taken only on the 0 -> 1
//! depth transition, that serializes every attached process. While the
//! depth is non-zero the mapping is writable; page protection (when
//! enabled) is restored when it drops back to zero.
//!
//! Waiting for the file lock is bounded by `lock_timeout`. Expiry means
//! another attacher is wedged inside a critical section, and this process
//! aborts instead of returning an error.

use std::cell::Cell;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use tracing::trace;

use crate::error::{OdbError, OdbResult};
use crate::region::{fatal, Region};

const POLL_INTERVAL: Duration = Duration::from_micros(200);

/// Cross-process recursive lock for one attachment.
pub(crate) struct DbLock {
    depth: ReentrantMutex<Cell<u32>>,
    file: File,
    path: PathBuf,
    timeout: Duration,
}

impl DbLock {
    pub fn open(path: &Path, timeout: Duration) -> OdbResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| OdbError::io(path, e, "Failed to open lock file"))?;
        Ok(Self {
            depth: ReentrantMutex::new(Cell::new(0)),
            file,
            path: path.to_path_buf(),
            timeout,
        })
    }

    /// Take the file lock, polling until `timeout`. Aborts on expiry.
    pub fn lock_file(&self) {
        let start = Instant::now();
        let contended = fs2::lock_contended_error().raw_os_error();
        loop {
            match self.file.try_lock_exclusive() {
                Ok(()) => return,
                Err(e) if e.raw_os_error() == contended || e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= self.timeout {
                        fatal(&format!(
                            "timeout after {:?} waiting for {}; region considered wedged",
                            self.timeout,
                            self.path.display()
                        ));
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => fatal(&format!("cannot lock {}: {}", self.path.display(), e)),
            }
        }
    }

    pub fn unlock_file(&self) {
        // explicit trait call: std::fs::File grew its own unlock in 1.89
        if let Err(e) = FileExt::unlock(&self.file) {
            fatal(&format!("cannot unlock {}: {}", self.path.display(), e));
        }
    }

    /// Enter the critical section; nested calls from the same thread are free.
    pub fn acquire<'a>(&'a self, region: &'a Region) -> LockGuard<'a> {
        let guard = self.depth.lock();
        let depth = guard.get();
        if depth == 0 {
            self.lock_file();
            region.set_writable(true);
            trace!(path = %self.path.display(), "database lock acquired");
        }
        guard.set(depth + 1);
        LockGuard {
            lock: self,
            region,
            guard,
        }
    }

    /// Current recursion depth as seen from the calling thread.
    pub fn depth(&self) -> u32 {
        self.depth.lock().get()
    }
}

/// Held while inside the critical section.
pub(crate) struct LockGuard<'a> {
    lock: &'a DbLock,
    region: &'a Region,
    guard: ReentrantMutexGuard<'a, Cell<u32>>,
}

impl LockGuard<'_> {
    /// True for the outermost guard of this thread.
    pub fn is_outermost(&self) -> bool {
        self.guard.get() == 1
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let depth = self.guard.get();
        if depth == 0 {
            fatal("database lock released more often than acquired");
        }
        self.guard.set(depth - 1);
        if depth == 1 {
            self.region.set_writable(false);
            self.lock.unlock_file();
            trace!(path = %self.lock.path.display(), "database lock released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Region) {
        let dir = TempDir::new().unwrap();
        let (region, _) = Region::map(&dir.path().join("t.shm"), 4096, true).unwrap();
        (dir, region)
    }

    #[test]
    fn test_lock_is_recursive() {
        let (dir, region) = setup();
        let lock = DbLock::open(&dir.path().join("t.LCK"), Duration::from_secs(1)).unwrap();
        {
            let outer = lock.acquire(&region);
            assert!(outer.is_outermost());
            {
                let inner = lock.acquire(&region);
                assert!(!inner.is_outermost());
                region.mem().set_u32(16, 7);
            }
            region.mem().set_u32(20, 8);
        }
        assert_eq!(lock.depth(), 0);
        assert_eq!(region.mem().u32_at(16), 7);
    }

    #[test]
    fn test_two_attachments_exclude_each_other() {
        let (dir, region) = setup();
        let path = dir.path().join("t.LCK");
        let a = DbLock::open(&path, Duration::from_secs(5)).unwrap();
        let b = Arc::new(DbLock::open(&path, Duration::from_secs(5)).unwrap());

        let entered = Arc::new(AtomicBool::new(false));
        let guard = a.acquire(&region);

        let b2 = Arc::clone(&b);
        let entered2 = Arc::clone(&entered);
        let waiter = thread::spawn(move || {
            b2.lock_file();
            entered2.store(true, Ordering::SeqCst);
            b2.unlock_file();
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));
        drop(guard);
        waiter.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }
}
