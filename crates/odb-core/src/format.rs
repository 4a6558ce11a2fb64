//! Binary layout of the shared region
//!
//! Every structure lives at a byte offset from the start of the region and
//! references other structures by offset only, so the region can be mapped
//! at a different address in every attached process.
//!
//! ```text
//! [0 .. HEADER_SIZE)                    RegionHeader + client table
//! [HEADER_SIZE .. +key_size)            index area: Key, KeyList, free blocks
//! [.. +data_size)                       payload area: leaf data, free blocks
//! ```
//!
//! All integers are little-endian. Offset 0 is the null offset (it always
//! points into the header, never into an area).

use crate::types::AccessMode;

/// Magic bytes at offset 0: "ODB" plus a format byte
pub const REGION_MAGIC: [u8; 4] = [b'O', b'D', b'B', 0x01];

/// Region format version understood by this engine
pub const REGION_VERSION: u32 = 3;

/// Maximum length of a key, client or region name, including the terminator
pub const NAME_LENGTH: usize = 32;

/// Capacity of the client table
pub const MAX_CLIENTS: usize = 64;

/// Capacity of each client's open record table
pub const MAX_OPEN_RECORDS: usize = 256;

/// Allocation granularity of both areas
pub const ALIGN: u32 = 8;

/// Bound on tree depth and link chains
pub const MAX_DEPTH: usize = 100;

/// Size of an encoded FreeBlock: size(u32) + next_free(u32)
pub const FREE_BLOCK_SIZE: u32 = 8;

/// Size of an encoded Key
pub const KEY_SIZE: u32 = 72;

/// Size of an encoded KeyList
pub const KEYLIST_SIZE: u32 = 16;

/// Size of one OpenRecord slot
pub const OPEN_RECORD_SIZE: usize = 8;

/// Size of one ClientEntry including its open record table
pub const CLIENT_SIZE: usize = 64 + MAX_OPEN_RECORDS * OPEN_RECORD_SIZE;

/// Offset of the client table inside the header
pub const CLIENTS_OFFSET: usize = 72;

/// Fixed header size: header fields plus the client table, 8-byte aligned
pub const HEADER_SIZE: usize = (CLIENTS_OFFSET + MAX_CLIENTS * CLIENT_SIZE + 7) & !7;

/// Round `size` up to the allocation granularity.
pub fn align8(size: u32) -> u32 {
    (size + ALIGN - 1) & !(ALIGN - 1)
}

/// Region header fields (the client table is accessed slot by slot).
///
/// Layout:
///   [0..4]   magic
///   [4..8]   version
///   [8..40]  name
///   [40..44] num_clients
///   [44..48] max_client_index
///   [48..52] key_size
///   [52..56] data_size
///   [56..60] root_key
///   [60..64] first_free_key
///   [64..68] first_free_data
///   [68..72] reserved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub name: [u8; NAME_LENGTH],
    pub num_clients: u32,
    pub max_client_index: u32,
    pub key_size: u32,
    pub data_size: u32,
    pub root_key: u32,
    pub first_free_key: u32,
    pub first_free_data: u32,
}

/// Byte offsets of header fields that are updated in place.
pub mod header_field {
    pub const NUM_CLIENTS: usize = 40;
    pub const MAX_CLIENT_INDEX: usize = 44;
    pub const ROOT_KEY: usize = 56;
    pub const FIRST_FREE_KEY: usize = 60;
    pub const FIRST_FREE_DATA: usize = 64;
}

impl RegionHeader {
    pub const ENCODED_SIZE: usize = CLIENTS_OFFSET;

    pub fn new(name: &str, key_size: u32, data_size: u32) -> Self {
        Self {
            magic: REGION_MAGIC,
            version: REGION_VERSION,
            name: encode_name(name),
            num_clients: 0,
            max_client_index: 0,
            key_size,
            data_size,
            root_key: 0,
            first_free_key: 0,
            first_free_data: 0,
        }
    }

    /// Start offset of the index area.
    pub fn key_area_start(&self) -> u32 {
        HEADER_SIZE as u32
    }

    /// Start offset of the payload area.
    pub fn data_area_start(&self) -> u32 {
        HEADER_SIZE as u32 + self.key_size
    }

    /// Total region size described by this header.
    pub fn region_size(&self) -> usize {
        HEADER_SIZE + self.key_size as usize + self.data_size as usize
    }

    pub fn name_str(&self) -> String {
        decode_name(&self.name)
    }

    pub fn to_bytes(&self) -> [u8; Self::ENCODED_SIZE] {
        let mut buf = [0u8; Self::ENCODED_SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        put_u32(&mut buf, 4, self.version);
        buf[8..40].copy_from_slice(&self.name);
        put_u32(&mut buf, 40, self.num_clients);
        put_u32(&mut buf, 44, self.max_client_index);
        put_u32(&mut buf, 48, self.key_size);
        put_u32(&mut buf, 52, self.data_size);
        put_u32(&mut buf, 56, self.root_key);
        put_u32(&mut buf, 60, self.first_free_key);
        put_u32(&mut buf, 64, self.first_free_data);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&buf[0..4]);
        let mut name = [0u8; NAME_LENGTH];
        name.copy_from_slice(&buf[8..40]);
        Self {
            magic,
            version: get_u32(buf, 4),
            name,
            num_clients: get_u32(buf, 40),
            max_client_index: get_u32(buf, 44),
            key_size: get_u32(buf, 48),
            data_size: get_u32(buf, 52),
            root_key: get_u32(buf, 56),
            first_free_key: get_u32(buf, 60),
            first_free_data: get_u32(buf, 64),
        }
    }
}

/// One node of the tree index.
///
/// Layout (72 bytes):
///   [0..4]   type_id
///   [4..8]   num_values
///   [8..40]  name (NUL terminated)
///   [40..44] data_offset       (KeyList for directories, payload otherwise)
///   [44..48] total_size
///   [48..52] item_size
///   [52..54] access_mode
///   [54..56] notify_count
///   [56..60] next_key_offset
///   [60..64] parent_keylist_offset
///   [64..68] last_written      (seconds since the epoch)
///   [68..72] reserved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Key {
    pub type_id: u32,
    pub num_values: u32,
    pub name: [u8; NAME_LENGTH],
    pub data: u32,
    pub total_size: u32,
    pub item_size: u32,
    pub access_mode: AccessMode,
    pub notify_count: u16,
    pub next_key: u32,
    pub parent_keylist: u32,
    pub last_written: u32,
}

impl Key {
    pub fn new(type_id: u32, name: &str, parent_keylist: u32, now: u32) -> Self {
        Self {
            type_id,
            num_values: 1,
            name: encode_name(name),
            data: 0,
            total_size: 0,
            item_size: 0,
            access_mode: AccessMode::DEFAULT,
            notify_count: 0,
            next_key: 0,
            parent_keylist,
            last_written: now,
        }
    }

    pub fn name_str(&self) -> String {
        decode_name(&self.name)
    }

    /// Raw name bytes up to the terminator.
    pub fn name_bytes(&self) -> &[u8] {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_LENGTH);
        &self.name[..end]
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = encode_name(name);
    }

    pub fn to_bytes(&self) -> [u8; KEY_SIZE as usize] {
        let mut buf = [0u8; KEY_SIZE as usize];
        put_u32(&mut buf, 0, self.type_id);
        put_u32(&mut buf, 4, self.num_values);
        buf[8..40].copy_from_slice(&self.name);
        put_u32(&mut buf, 40, self.data);
        put_u32(&mut buf, 44, self.total_size);
        put_u32(&mut buf, 48, self.item_size);
        buf[52..54].copy_from_slice(&self.access_mode.bits().to_le_bytes());
        buf[54..56].copy_from_slice(&self.notify_count.to_le_bytes());
        put_u32(&mut buf, 56, self.next_key);
        put_u32(&mut buf, 60, self.parent_keylist);
        put_u32(&mut buf, 64, self.last_written);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        let mut name = [0u8; NAME_LENGTH];
        name.copy_from_slice(&buf[8..40]);
        Self {
            type_id: get_u32(buf, 0),
            num_values: get_u32(buf, 4),
            name,
            data: get_u32(buf, 40),
            total_size: get_u32(buf, 44),
            item_size: get_u32(buf, 48),
            access_mode: AccessMode(u16::from_le_bytes([buf[52], buf[53]])),
            notify_count: u16::from_le_bytes([buf[54], buf[55]]),
            next_key: get_u32(buf, 56),
            parent_keylist: get_u32(buf, 60),
            last_written: get_u32(buf, 64),
        }
    }
}

/// Children of a directory key.
///
/// Layout (16 bytes): parent_key, num_keys, first_key, reserved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyList {
    pub parent: u32,
    pub num_keys: u32,
    pub first_key: u32,
}

impl KeyList {
    pub fn to_bytes(&self) -> [u8; KEYLIST_SIZE as usize] {
        let mut buf = [0u8; KEYLIST_SIZE as usize];
        put_u32(&mut buf, 0, self.parent);
        put_u32(&mut buf, 4, self.num_keys);
        put_u32(&mut buf, 8, self.first_key);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            parent: get_u32(buf, 0),
            num_keys: get_u32(buf, 4),
            first_key: get_u32(buf, 8),
        }
    }
}

/// A client's registered interest in one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenRecord {
    pub handle: u32,
    pub access_mode: AccessMode,
    pub flags: u16,
}

impl OpenRecord {
    pub fn to_bytes(&self) -> [u8; OPEN_RECORD_SIZE] {
        let mut buf = [0u8; OPEN_RECORD_SIZE];
        put_u32(&mut buf, 0, self.handle);
        buf[4..6].copy_from_slice(&self.access_mode.bits().to_le_bytes());
        buf[6..8].copy_from_slice(&self.flags.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            handle: get_u32(buf, 0),
            access_mode: AccessMode(u16::from_le_bytes([buf[4], buf[5]])),
            flags: u16::from_le_bytes([buf[6], buf[7]]),
        }
    }
}

/// Fixed part of a client table slot (open records follow it).
///
/// Layout (64 bytes):
///   [0..32]  name
///   [32..36] pid
///   [36..40] port
///   [40..44] num_open_records
///   [44..48] max_index         (one past the last used open record slot)
///   [48..56] last_activity     (milliseconds since the epoch)
///   [56..60] watchdog_timeout  (milliseconds, 0 = never expires)
///   [60..64] reserved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientEntry {
    pub name: [u8; NAME_LENGTH],
    pub pid: u32,
    pub port: u32,
    pub num_open_records: u32,
    pub max_index: u32,
    pub last_activity: u64,
    pub watchdog_timeout: u32,
}

impl ClientEntry {
    pub const ENCODED_SIZE: usize = 64;

    pub fn new(name: &str, pid: u32, port: u32, now_ms: u64, watchdog_timeout: u32) -> Self {
        Self {
            name: encode_name(name),
            pid,
            port,
            num_open_records: 0,
            max_index: 0,
            last_activity: now_ms,
            watchdog_timeout,
        }
    }

    pub fn name_str(&self) -> String {
        decode_name(&self.name)
    }

    pub fn is_free(&self) -> bool {
        self.pid == 0
    }

    pub fn to_bytes(&self) -> [u8; Self::ENCODED_SIZE] {
        let mut buf = [0u8; Self::ENCODED_SIZE];
        buf[0..32].copy_from_slice(&self.name);
        put_u32(&mut buf, 32, self.pid);
        put_u32(&mut buf, 36, self.port);
        put_u32(&mut buf, 40, self.num_open_records);
        put_u32(&mut buf, 44, self.max_index);
        buf[48..56].copy_from_slice(&self.last_activity.to_le_bytes());
        put_u32(&mut buf, 56, self.watchdog_timeout);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        let mut name = [0u8; NAME_LENGTH];
        name.copy_from_slice(&buf[0..32]);
        let mut activity = [0u8; 8];
        activity.copy_from_slice(&buf[48..56]);
        Self {
            name,
            pid: get_u32(buf, 32),
            port: get_u32(buf, 36),
            num_open_records: get_u32(buf, 40),
            max_index: get_u32(buf, 44),
            last_activity: u64::from_le_bytes(activity),
            watchdog_timeout: get_u32(buf, 56),
        }
    }
}

/// Offset of client slot `index`.
pub fn client_offset(index: usize) -> usize {
    CLIENTS_OFFSET + index * CLIENT_SIZE
}

/// Offset of open record `slot` inside client `index`.
pub fn open_record_offset(index: usize, slot: usize) -> usize {
    client_offset(index) + ClientEntry::ENCODED_SIZE + slot * OPEN_RECORD_SIZE
}

/// Names are stored NUL terminated and truncated to `NAME_LENGTH - 1` bytes.
pub fn encode_name(name: &str) -> [u8; NAME_LENGTH] {
    let mut buf = [0u8; NAME_LENGTH];
    let bytes = name.as_bytes();
    let mut n = bytes.len().min(NAME_LENGTH - 1);
    while n > 0 && !name.is_char_boundary(n) {
        n -= 1;
    }
    buf[..n].copy_from_slice(&bytes[..n]);
    buf
}

pub fn decode_name(buf: &[u8; NAME_LENGTH]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(NAME_LENGTH);
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn get_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_size_is_aligned() {
        assert_eq!(HEADER_SIZE % ALIGN as usize, 0);
        assert!(HEADER_SIZE >= CLIENTS_OFFSET + MAX_CLIENTS * CLIENT_SIZE);
    }

    #[test]
    fn test_key_encoding() {
        let mut key = Key::new(4, "EventID", 1234, 1_700_000_000);
        key.data = 5000;
        key.total_size = 2;
        key.item_size = 2;
        key.notify_count = 3;
        let bytes = key.to_bytes();
        assert_eq!(bytes.len(), KEY_SIZE as usize);
        let decoded = Key::from_bytes(&bytes);
        assert_eq!(decoded, key);
        assert_eq!(decoded.name_str(), "EventID");
    }

    #[test]
    fn test_long_name_truncated() {
        let long = "x".repeat(40);
        let encoded = encode_name(&long);
        assert_eq!(encoded[NAME_LENGTH - 1], 0);
        assert_eq!(decode_name(&encoded).len(), NAME_LENGTH - 1);
    }

    #[test]
    fn test_name_truncation_respects_char_boundary() {
        let name = format!("{}é", "a".repeat(30));
        let decoded = decode_name(&encode_name(&name));
        assert_eq!(decoded, "a".repeat(30));
    }

    #[test]
    fn test_client_offsets_do_not_overlap() {
        let last_record = open_record_offset(MAX_CLIENTS - 1, MAX_OPEN_RECORDS - 1);
        assert!(last_record + OPEN_RECORD_SIZE <= HEADER_SIZE);
        assert_eq!(client_offset(1) - client_offset(0), CLIENT_SIZE);
    }

    #[test]
    fn test_align8() {
        assert_eq!(align8(1), 8);
        assert_eq!(align8(8), 8);
        assert_eq!(align8(9), 16);
        assert_eq!(align8(0), 0);
    }
}
