//! Configuration for an online database region
//!
//! Provides presets for a long-running server region and for small
//! regions used in tests and embedded tools, plus builder methods for
//! custom configurations.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{OdbError, OdbResult};
use crate::format::{ALIGN, HEADER_SIZE};

/// Smallest area the allocator is allowed to manage
const MIN_AREA_SIZE: usize = 4 * 1024;

/// Region configuration with presets
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the shared region file, its lock file and snapshots
    pub directory: PathBuf,
    /// Total region size in bytes when the region is created
    pub region_size: usize,
    /// Fraction of the space after the header given to the index area
    pub key_area_ratio: f64,
    /// Bounded wait on the cross-process lock; expiry aborts the process
    pub lock_timeout: Duration,
    /// Watchdog recorded for this client; zero disables expiry
    pub watchdog_timeout: Duration,
    /// Keep the mapping read-only outside of locked sections
    pub protect: bool,
    /// Reject names and string payloads that are not valid UTF-8
    pub check_utf8: bool,
    /// Run the validator when attaching
    pub validate_on_attach: bool,
    /// Heartbeat and cleanup cadence of the housekeeping thread
    pub housekeeping_cadence: Duration,
    /// Snapshot cadence of the housekeeping thread; zero disables it
    pub flush_cadence: Duration,
    /// Write a snapshot when the last client detaches
    pub flush_on_close: bool,
}

impl Config {
    /// Long-running experiment server: 8 MiB region
    pub fn server() -> Self {
        Self {
            directory: std::env::temp_dir(),
            region_size: 8 * 1024 * 1024,
            key_area_ratio: 0.4,
            lock_timeout: Duration::from_secs(10),
            watchdog_timeout: Duration::from_secs(10),
            protect: false,
            check_utf8: true,
            validate_on_attach: true,
            housekeeping_cadence: Duration::from_secs(1),
            flush_cadence: Duration::from_secs(60),
            flush_on_close: true,
        }
    }

    /// Small region for tests and short-lived tools: 512 KiB, no snapshots
    pub fn small() -> Self {
        Self {
            region_size: 512 * 1024,
            lock_timeout: Duration::from_secs(5),
            housekeeping_cadence: Duration::from_millis(200),
            flush_cadence: Duration::ZERO,
            flush_on_close: false,
            ..Self::server()
        }
    }

    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = directory.into();
        self
    }

    pub fn with_region_size(mut self, region_size: usize) -> Self {
        self.region_size = region_size;
        self
    }

    pub fn with_key_area_ratio(mut self, ratio: f64) -> Self {
        self.key_area_ratio = ratio;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_watchdog_timeout(mut self, timeout: Duration) -> Self {
        self.watchdog_timeout = timeout;
        self
    }

    pub fn with_protect(mut self, protect: bool) -> Self {
        self.protect = protect;
        self
    }

    pub fn with_check_utf8(mut self, check: bool) -> Self {
        self.check_utf8 = check;
        self
    }

    pub fn with_validate_on_attach(mut self, validate: bool) -> Self {
        self.validate_on_attach = validate;
        self
    }

    pub fn with_housekeeping_cadence(mut self, cadence: Duration) -> Self {
        self.housekeeping_cadence = cadence;
        self
    }

    pub fn with_flush_cadence(mut self, cadence: Duration) -> Self {
        self.flush_cadence = cadence;
        self
    }

    pub fn with_flush_on_close(mut self, flush: bool) -> Self {
        self.flush_on_close = flush;
        self
    }

    /// Split the space after the header into (key_size, data_size).
    pub fn area_sizes(&self) -> (u32, u32) {
        let body = self.region_size.saturating_sub(HEADER_SIZE);
        let align = ALIGN as usize;
        let key = ((body as f64 * self.key_area_ratio) as usize) & !(align - 1);
        let data = (body - key) & !(align - 1);
        (key as u32, data as u32)
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> OdbResult<()> {
        let invalid = |msg: &str| Err(OdbError::InvalidConfig(msg.into()));

        if self.region_size > u32::MAX as usize {
            return invalid("region_size must fit in 32-bit offsets");
        }
        if self.key_area_ratio <= 0.0 || self.key_area_ratio >= 1.0 {
            return invalid("key_area_ratio must be in (0.0, 1.0)");
        }
        let (key, data) = self.area_sizes();
        if (key as usize) < MIN_AREA_SIZE || (data as usize) < MIN_AREA_SIZE {
            return invalid("region_size too small for the header and two 4 KiB areas");
        }
        if self.lock_timeout.is_zero() {
            return invalid("lock_timeout must be > 0");
        }
        if self.watchdog_timeout.as_millis() > u32::MAX as u128 {
            return invalid("watchdog_timeout must fit in 32-bit milliseconds");
        }
        if self.housekeeping_cadence.is_zero() {
            return invalid("housekeeping_cadence must be > 0");
        }
        if self.directory.as_os_str().is_empty() {
            return invalid("directory must not be empty");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::server()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_presets_valid() {
        assert!(Config::server().validate().is_ok());
        assert!(Config::small().validate().is_ok());
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_area_split_is_aligned_and_fits() {
        let config = Config::small();
        let (key, data) = config.area_sizes();
        assert_eq!(key % ALIGN, 0);
        assert_eq!(data % ALIGN, 0);
        assert!(HEADER_SIZE + key as usize + data as usize <= config.region_size);
        assert!(key < data);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Config::small().with_key_area_ratio(1.0).validate().is_err());
        assert!(Config::small().with_region_size(HEADER_SIZE).validate().is_err());
        assert!(Config::small().with_lock_timeout(Duration::ZERO).validate().is_err());
        let past_u32 = Duration::from_millis(u32::MAX as u64 + 1);
        assert!(Config::small().with_watchdog_timeout(past_u32).validate().is_err());
        assert!(matches!(
            Config::small().with_directory("").validate(),
            Err(OdbError::InvalidConfig(_))
        ));
    }
}
