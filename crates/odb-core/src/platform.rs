//! Platform-specific system calls
//!
//! Concerns that need the OS directly: making snapshot bytes durable,
//! probing whether another attacher's process still exists, flipping page
//! protection on the shared mapping, and the wall clock stored in the region.

use std::fs::File;
use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

/// Ensures data is durably written to persistent storage before returning.
///
/// Platform behaviors:
/// - Linux: fdatasync()
/// - macOS/iOS: fcntl(F_FULLFSYNC), the only way past the drive's write cache
/// - Windows: FlushFileBuffers()
/// - Other: file.sync_data()
pub fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the fd comes from a live File reference.
        let result = unsafe { libc::fdatasync(file.as_raw_fd()) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the fd comes from a live File reference.
        let result = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_FULLFSYNC) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::FlushFileBuffers;
        // SAFETY: the handle comes from a live File reference.
        let result = unsafe { FlushFileBuffers(file.as_raw_handle() as *mut _) };
        if result != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios", target_os = "windows")))]
    {
        file.sync_data()
    }
}

/// Current process id as stored in the client table.
pub fn current_pid() -> u32 {
    std::process::id()
}

/// Wall clock in whole seconds, as stored in `Key::last_written`.
pub fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().min(u32::MAX as u64) as u32)
        .unwrap_or(0)
}

/// Wall clock in milliseconds, as stored in `ClientEntry::last_activity`.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// True unless the OS reports that no process with `pid` exists.
///
/// A process owned by another user answers EPERM; it exists, so it counts
/// as alive.
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }

    #[cfg(unix)]
    {
        if pid > i32::MAX as u32 {
            return false;
        }
        // SAFETY: signal 0 performs only the existence and permission check.
        let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
        if result == 0 {
            return true;
        }
        io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
    }

    #[cfg(not(unix))]
    {
        // Without a cheap liveness check, only the watchdog reclaims clients.
        true
    }
}

/// Switch the protection of a mapped range between read-only and read-write.
///
/// `base` must be the page-aligned start of a live mapping of `len` bytes.
pub fn protect(base: *mut u8, len: usize, writable: bool) -> io::Result<()> {
    #[cfg(unix)]
    {
        let prot = if writable {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_READ
        };
        // SAFETY: caller guarantees base/len describe a live mapping.
        let result = unsafe { libc::mprotect(base as *mut libc::c_void, len, prot) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (base, len, writable);
        Err(io::Error::new(io::ErrorKind::Unsupported, "page protection not supported"))
    }
}
