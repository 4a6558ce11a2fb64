//! Shared region mapping and offset-based access
//!
//! The region is a file mapped `MAP_SHARED` by every attacher. All access
//! goes through [`Mem`], which resolves an offset against this process's base
//! address at the moment of use and bounds-checks it. Memory shared with
//! other processes is never turned into long-lived Rust references.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};
use tracing::{error, info};

use crate::error::{OdbError, OdbResult};
use crate::format::{
    client_offset, open_record_offset, ClientEntry, Key, KeyList, OpenRecord, RegionHeader,
    KEYLIST_SIZE, KEY_SIZE,
};
use crate::platform;

/// Log and terminate the process.
pub(crate) fn fatal(reason: &str) -> ! {
    error!(reason, "fatal online database error, aborting process");
    std::process::abort()
}

/// Offset-based view of a mapped region.
///
/// Copyable. Every accessor bounds-checks and aborts on a violation.
#[derive(Clone, Copy)]
pub(crate) struct Mem {
    base: *mut u8,
    len: usize,
}

impl Mem {
    fn check(&self, offset: usize, n: usize) {
        match offset.checked_add(n) {
            Some(end) if end <= self.len => {}
            _ => fatal(&format!(
                "offset {} (+{}) outside region of {} bytes",
                offset, n, self.len
            )),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        self.check(offset, buf.len());
        // SAFETY: bounds checked above; the mapping outlives every Mem.
        unsafe { std::ptr::copy_nonoverlapping(self.base.add(offset), buf.as_mut_ptr(), buf.len()) }
    }

    pub fn write(&self, offset: usize, data: &[u8]) {
        self.check(offset, data.len());
        // SAFETY: bounds checked above; the caller holds the region lock.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), self.base.add(offset), data.len()) }
    }

    pub fn bytes(&self, offset: usize, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        self.read(offset, &mut buf);
        buf
    }

    pub fn fill(&self, offset: usize, n: usize, byte: u8) {
        self.check(offset, n);
        // SAFETY: bounds checked above.
        unsafe { std::ptr::write_bytes(self.base.add(offset), byte, n) }
    }

    /// Overlap-safe move of `n` bytes.
    pub fn copy(&self, src: usize, dst: usize, n: usize) {
        self.check(src, n);
        self.check(dst, n);
        // SAFETY: both ranges checked; ptr::copy tolerates overlap.
        unsafe { std::ptr::copy(self.base.add(src), self.base.add(dst), n) }
    }

    pub fn u32_at(&self, offset: usize) -> u32 {
        let mut b = [0u8; 4];
        self.read(offset, &mut b);
        u32::from_le_bytes(b)
    }

    pub fn set_u32(&self, offset: usize, value: u32) {
        self.write(offset, &value.to_le_bytes());
    }

    pub fn header(&self) -> RegionHeader {
        RegionHeader::from_bytes(&self.bytes(0, RegionHeader::ENCODED_SIZE))
    }

    pub fn set_header(&self, header: &RegionHeader) {
        self.write(0, &header.to_bytes());
    }

    pub fn key(&self, offset: u32) -> Key {
        let mut buf = [0u8; KEY_SIZE as usize];
        self.read(offset as usize, &mut buf);
        Key::from_bytes(&buf)
    }

    pub fn set_key(&self, offset: u32, key: &Key) {
        self.write(offset as usize, &key.to_bytes());
    }

    pub fn keylist(&self, offset: u32) -> KeyList {
        let mut buf = [0u8; KEYLIST_SIZE as usize];
        self.read(offset as usize, &mut buf);
        KeyList::from_bytes(&buf)
    }

    pub fn set_keylist(&self, offset: u32, list: &KeyList) {
        self.write(offset as usize, &list.to_bytes());
    }

    pub fn client(&self, index: usize) -> ClientEntry {
        ClientEntry::from_bytes(&self.bytes(client_offset(index), ClientEntry::ENCODED_SIZE))
    }

    pub fn set_client(&self, index: usize, entry: &ClientEntry) {
        self.write(client_offset(index), &entry.to_bytes());
    }

    pub fn open_record(&self, index: usize, slot: usize) -> OpenRecord {
        OpenRecord::from_bytes(&self.bytes(open_record_offset(index, slot), 8))
    }

    pub fn set_open_record(&self, index: usize, slot: usize, record: &OpenRecord) {
        self.write(open_record_offset(index, slot), &record.to_bytes());
    }
}

/// A process-local mapping of one shared region file.
pub struct Region {
    path: PathBuf,
    _file: File,
    mmap: MmapMut,
    base: *mut u8,
    protect: bool,
}

// SAFETY: the raw base pointer refers into `mmap`, which lives as long as the
// Region; all dereferences go through Mem under the database lock.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Map the region file at `path`, creating it with `create_size` zeroed
    /// bytes if it does not exist yet. Returns the mapping and whether it was
    /// freshly created (and so still needs formatting).
    ///
    /// Must be called while holding the cross-process lock.
    pub fn map(path: &Path, create_size: usize, protect: bool) -> OdbResult<(Region, bool)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| OdbError::io(path, e, "Failed to open region file"))?;

        let existing = file
            .metadata()
            .map_err(|e| OdbError::io(path, e, "Failed to stat region file"))?
            .len();

        let created = existing == 0;
        let len = if created {
            file.set_len(create_size as u64)
                .map_err(|e| OdbError::io(path, e, "Failed to size region file"))?;
            create_size
        } else {
            existing as usize
        };

        // SAFETY: the file stays open for the life of the mapping; concurrent
        // writers in other processes are serialized by the database lock.
        let mut mmap = unsafe {
            MmapOptions::new()
                .len(len)
                .map_mut(&file)
                .map_err(|e| OdbError::io(path, e, "Failed to map region file"))?
        };
        let base = mmap.as_mut_ptr();

        info!(path = %path.display(), size = len, created, "mapped shared region");

        let region = Region {
            path: path.to_path_buf(),
            _file: file,
            mmap,
            base,
            protect,
        };
        if protect {
            region.set_writable(false);
        }
        Ok((region, created))
    }

    pub(crate) fn mem(&self) -> Mem {
        Mem {
            base: self.base,
            len: self.mmap.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn protected(&self) -> bool {
        self.protect
    }

    /// Lift or restore page protection. A failure here means the defense is
    /// gone, which is treated like any other lock-discipline violation.
    pub(crate) fn set_writable(&self, writable: bool) {
        if !self.protect {
            return;
        }
        if let Err(e) = platform::protect(self.base, self.mmap.len(), writable) {
            fatal(&format!("mprotect failed on {}: {}", self.path.display(), e));
        }
    }

    /// Copy the whole region out (caller holds the lock).
    pub(crate) fn copy_out(&self) -> Vec<u8> {
        self.mem().bytes(0, self.len())
    }

    /// Overwrite the region from a snapshot of identical length.
    pub(crate) fn copy_in(&self, bytes: &[u8]) -> OdbResult<()> {
        if bytes.len() != self.len() {
            return Err(OdbError::OutOfRange {
                what: "snapshot length".into(),
                value: bytes.len() as u64,
                limit: self.len() as u64,
            });
        }
        self.set_writable(true);
        self.mem().write(0, bytes);
        self.set_writable(false);
        Ok(())
    }

    /// Flush dirty pages of the shared file itself.
    pub fn sync(&self) -> OdbResult<()> {
        self.mmap
            .flush()
            .map_err(|e| OdbError::io(&self.path, e, "Failed to flush region mapping"))
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // Unmapping does not care about protection, but leave pages writable
        // so a late flush through memmap2 cannot fault.
        if self.protect {
            let _ = platform::protect(self.base, self.mmap.len(), true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_map_creates_zeroed_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.shm");
        let (region, created) = Region::map(&path, 64 * 1024, false).unwrap();
        assert!(created);
        assert_eq!(region.len(), 64 * 1024);
        assert_eq!(region.mem().u32_at(0), 0);
    }

    #[test]
    fn test_second_mapping_sees_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.shm");
        let (a, _) = Region::map(&path, 8192, false).unwrap();
        let (b, created) = Region::map(&path, 1, false).unwrap();
        assert!(!created);
        assert_eq!(b.len(), 8192);

        a.mem().set_u32(128, 0xDEADBEEF);
        assert_eq!(b.mem().u32_at(128), 0xDEADBEEF);
    }

    #[test]
    fn test_mem_copy_overlapping() {
        let dir = TempDir::new().unwrap();
        let (region, _) = Region::map(&dir.path().join("r.shm"), 4096, false).unwrap();
        let mem = region.mem();
        mem.write(100, &[1, 2, 3, 4, 5]);
        mem.copy(100, 102, 5);
        assert_eq!(mem.bytes(100, 7), vec![1, 2, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_protected_region_roundtrip() {
        let dir = TempDir::new().unwrap();
        let (region, _) = Region::map(&dir.path().join("p.shm"), 8192, true).unwrap();
        region.set_writable(true);
        region.mem().set_u32(64, 42);
        region.set_writable(false);
        assert_eq!(region.mem().u32_at(64), 42);
    }
}
