//! Snapshot files: the whole region flushed to disk
//!
//! The shared region lives in a memory-mapped file that disappears with the
//! machine. A snapshot is a checksummed copy of it:
//!
//! ```text
//! [0..4]   magic "ODBS"
//! [4..8]   format version
//! [8..16]  payload length
//! [16..20] CRC32C of the payload
//! [20..]   raw region bytes
//! ```
//!
//! Snapshots are replaced with the atomic rename pattern:
//! 1. Write the new snapshot to `<name>.odb.tmp`
//! 2. durable_sync the temp file
//! 3. Rename it over `<name>.odb` (atomic on POSIX)
//! 4. durable_sync the parent directory
//!
//! A crash before the rename leaves the previous snapshot intact.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{OdbError, OdbResult};
use crate::platform::durable_sync;

pub const SNAPSHOT_MAGIC: [u8; 4] = *b"ODBS";
pub const SNAPSHOT_VERSION: u32 = 1;
pub const SNAPSHOT_HEADER_SIZE: usize = 20;

/// Write `bytes` as the snapshot at `path`.
pub fn write_snapshot(path: &Path, bytes: &[u8]) -> OdbResult<()> {
    let tmp_path = tmp_path_for(path);
    let checksum = crc32c::crc32c(bytes);

    let mut header = [0u8; SNAPSHOT_HEADER_SIZE];
    header[0..4].copy_from_slice(&SNAPSHOT_MAGIC);
    header[4..8].copy_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
    header[8..16].copy_from_slice(&(bytes.len() as u64).to_le_bytes());
    header[16..20].copy_from_slice(&checksum.to_le_bytes());

    {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|e| OdbError::io(&tmp_path, e, "Failed to create snapshot file"))?;
        file.write_all(&header)
            .map_err(|e| OdbError::io(&tmp_path, e, "Failed to write snapshot header"))?;
        file.write_all(bytes)
            .map_err(|e| OdbError::io(&tmp_path, e, "Failed to write snapshot payload"))?;
        durable_sync(&file).map_err(|e| OdbError::io(&tmp_path, e, "Failed to sync snapshot file"))?;
    }

    fs::rename(&tmp_path, path).map_err(|e| OdbError::io(path, e, "Failed to rename snapshot file"))?;

    #[cfg(unix)]
    {
        if let Some(parent) = path.parent() {
            let dir = fs::File::open(parent)
                .map_err(|e| OdbError::io(parent, e, "Failed to open directory for sync"))?;
            durable_sync(&dir)
                .map_err(|e| OdbError::io(parent, e, "Failed to sync directory after snapshot"))?;
        }
    }

    info!(path = %path.display(), bytes = bytes.len(), checksum, "wrote region snapshot");
    Ok(())
}

/// Read and verify the snapshot at `path`.
pub fn read_snapshot(path: &Path) -> OdbResult<Vec<u8>> {
    let mut file = fs::File::open(path).map_err(|e| OdbError::io(path, e, "Failed to open snapshot file"))?;
    let mut header = [0u8; SNAPSHOT_HEADER_SIZE];
    file.read_exact(&mut header)
        .map_err(|e| OdbError::io(path, e, "Failed to read snapshot header"))?;

    if header[0..4] != SNAPSHOT_MAGIC {
        return Err(OdbError::Corrupted {
            offset: 0,
            reason: format!("{} is not a snapshot file", path.display()),
        });
    }
    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if version != SNAPSHOT_VERSION {
        return Err(OdbError::VersionMismatch {
            found: version,
            expected: SNAPSHOT_VERSION,
        });
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&header[8..16]);
    let len = u64::from_le_bytes(len_bytes);
    let expected = u32::from_le_bytes([header[16], header[17], header[18], header[19]]);

    let mut bytes = Vec::with_capacity(len as usize);
    file.read_to_end(&mut bytes)
        .map_err(|e| OdbError::io(path, e, "Failed to read snapshot payload"))?;
    if bytes.len() as u64 != len {
        return Err(OdbError::Corrupted {
            offset: SNAPSHOT_HEADER_SIZE as u32,
            reason: format!("snapshot payload is {} bytes, header says {}", bytes.len(), len),
        });
    }

    let actual = crc32c::crc32c(&bytes);
    if actual != expected {
        return Err(OdbError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected,
            actual,
        });
    }
    info!(path = %path.display(), bytes = bytes.len(), "loaded region snapshot");
    Ok(bytes)
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("r.odb");
        let bytes: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        write_snapshot(&path, &bytes).unwrap();
        assert_eq!(read_snapshot(&path).unwrap(), bytes);
        assert!(!tmp_path_for(&path).exists());
    }

    #[test]
    fn test_snapshot_replaced_atomically() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("r.odb");
        write_snapshot(&path, b"first").unwrap();
        write_snapshot(&path, b"second version").unwrap();
        assert_eq!(read_snapshot(&path).unwrap(), b"second version");
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("r.odb");
        write_snapshot(&path, &[7u8; 256]).unwrap();

        let mut raw = fs::read(&path).unwrap();
        raw[SNAPSHOT_HEADER_SIZE + 10] ^= 0xFF;
        fs::write(&path, &raw).unwrap();

        assert!(matches!(read_snapshot(&path), Err(OdbError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_not_a_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("r.odb");
        fs::write(&path, [0u8; 64]).unwrap();
        assert!(matches!(read_snapshot(&path), Err(OdbError::Corrupted { .. })));
    }
}
