//! Typed access to leaf payloads
//!
//! The region stores a leaf as `num_values` items of `item_size` bytes.
//! Reads and writes go through [`Value`]; the typed entry points on
//! `Database` convert through [`OdbType`] after checking the stored type id.

use crate::alloc::Area;
use crate::client::ClientTable;
use crate::engine::Database;
use crate::error::{OdbError, OdbResult};
use crate::format::{Key, NAME_LENGTH};
use crate::tree::Tree;
use crate::types::{AccessMode, OdbType, TypeId, Value};

impl Tree {
    /// Load a leaf after checking read access.
    fn readable_leaf(&self, handle: u32) -> OdbResult<(Key, TypeId)> {
        let key = self.key(handle)?;
        let tid = self.type_of(&key);
        if tid.is_dir() {
            return Err(OdbError::TypeMismatch {
                path: self.path_of(handle),
                expected: "leaf".into(),
                found: tid.name().into(),
            });
        }
        if !key.access_mode.contains(AccessMode::READ) {
            return Err(OdbError::NoAccess {
                path: self.path_of(handle),
                reason: "read not permitted".into(),
            });
        }
        Ok((key, tid))
    }

    fn writable_leaf(&self, handle: u32, tid: TypeId) -> OdbResult<Key> {
        let key = self.key(handle)?;
        let stored = self.type_of(&key);
        if stored != tid {
            return Err(OdbError::TypeMismatch {
                path: self.path_of(handle),
                expected: tid.name().into(),
                found: stored.name().into(),
            });
        }
        if !key.access_mode.contains(AccessMode::WRITE) {
            return Err(OdbError::NoAccess {
                path: self.path_of(handle),
                reason: "write not permitted".into(),
            });
        }
        Ok(key)
    }

    /// Stored type and all items of a leaf.
    pub fn read_values(&self, handle: u32) -> OdbResult<(TypeId, Vec<Value>)> {
        let (key, tid) = self.readable_leaf(handle)?;
        let count = key.num_values as usize;
        if key.item_size == 0 || key.total_size == 0 {
            let zero = Value::from_bytes(tid, &[0u8; 8])?;
            return Ok((tid, vec![zero; count]));
        }
        let payload = self.payload_of(&key);
        let values = payload
            .chunks(key.item_size as usize)
            .take(count)
            .map(|item| Value::from_bytes(tid, item))
            .collect::<OdbResult<Vec<_>>>()?;
        Ok((tid, values))
    }

    pub fn read_index(&self, handle: u32, index: u32) -> OdbResult<Value> {
        let (key, tid) = self.readable_leaf(handle)?;
        if index >= key.num_values {
            return Err(OdbError::OutOfRange {
                what: format!("index into {}", self.path_of(handle)),
                value: index as u64,
                limit: key.num_values as u64,
            });
        }
        if key.item_size == 0 || key.total_size == 0 {
            return Value::from_bytes(tid, &[0u8; 8]);
        }
        let start = (index * key.item_size) as usize;
        let payload = self.payload_of(&key);
        Value::from_bytes(tid, &payload[start..start + key.item_size as usize])
    }

    /// Replace all items. Strings get an item size large enough for the
    /// longest value and at least `min_item_size`.
    pub fn write_values(&self, handle: u32, tid: TypeId, values: &[Value], min_item_size: u32) -> OdbResult<()> {
        if values.is_empty() {
            return Err(OdbError::OutOfRange {
                what: "number of values".into(),
                value: 0,
                limit: 1,
            });
        }
        let key = self.writable_leaf(handle, tid)?;
        if let Some(bad) = values.iter().find(|v| v.type_id() != tid && !(tid.is_text() && v.as_str().is_some())) {
            return Err(OdbError::TypeMismatch {
                path: self.path_of(handle),
                expected: tid.name().into(),
                found: bad.type_id().name().into(),
            });
        }

        let item_size = if tid.is_text() {
            let needed = values
                .iter()
                .map(|v| v.as_str().map_or(1, |s| s.len() as u32 + 1))
                .max()
                .unwrap_or(1)
                .max(min_item_size);
            // strings under an open record keep their slot width while they fit
            let pinned = values.len() as u32 == key.num_values
                && needed <= key.item_size
                && ClientTable::new(self.mem()).record_holder(self, handle).is_some();
            if pinned {
                key.item_size
            } else {
                needed
            }
        } else {
            tid.item_size()
        };
        let mut bytes = Vec::with_capacity(item_size as usize * values.len());
        for value in values {
            value.write_bytes(item_size as usize, &mut bytes);
        }
        self.store(handle, item_size, values.len() as u32, &bytes)
    }

    /// Write one item, growing the array (zero filled) when `index` is past
    /// the end.
    pub fn write_index(&self, handle: u32, index: u32, value: &Value) -> OdbResult<()> {
        let tid = value.type_id();
        let key = self.writable_leaf(handle, tid)?;
        if index >= key.num_values {
            let item_size = match value.as_str() {
                Some(s) => (s.len() as u64 + 1).max(key.item_size as u64),
                None => tid.item_size() as u64,
            };
            let needed = (index as u64 + 1) * item_size;
            if needed > u32::MAX as u64 {
                return Err(OdbError::OutOfRange {
                    what: format!("index into {}", self.path_of(handle)),
                    value: index as u64,
                    limit: u32::MAX as u64 / item_size.max(1),
                });
            }
            if needed > self.data_area().free_bytes()? + key.total_size as u64 {
                return Err(OdbError::RegionFull {
                    area: Area::Data.name(),
                    requested: needed as u32,
                });
            }
        }
        let (_, mut values) = self.read_values(handle)?;
        let zero = Value::from_bytes(tid, &[0u8; 8])?;
        if index as usize >= values.len() {
            values.resize(index as usize + 1, zero);
        }
        values[index as usize] = value.clone();
        self.write_values(handle, tid, &values, key.item_size)
    }

    /// Change the number of items, truncating or zero filling.
    pub fn resize(&self, handle: u32, num_values: u32) -> OdbResult<()> {
        if num_values == 0 {
            return Err(OdbError::OutOfRange {
                what: "number of values".into(),
                value: 0,
                limit: 1,
            });
        }
        let key = self.key(handle)?;
        let tid = self.type_of(&key);
        self.writable_leaf(handle, tid)?;
        let item_size = match key.item_size {
            0 if tid.is_text() => NAME_LENGTH as u32,
            n => n,
        };
        let mut bytes = self.payload_of(&key);
        bytes.resize((item_size * num_values) as usize, 0);
        self.store(handle, item_size, num_values, &bytes)
    }

    /// Raw payload into `buf`; `Truncated` after copying what fits.
    pub fn read_data_into(&self, handle: u32, buf: &mut [u8]) -> OdbResult<usize> {
        let (key, _) = self.readable_leaf(handle)?;
        let payload = self.payload_of(&key);
        let n = payload.len().min(buf.len());
        buf[..n].copy_from_slice(&payload[..n]);
        if n < payload.len() {
            return Err(OdbError::Truncated {
                needed: payload.len(),
                available: buf.len(),
            });
        }
        Ok(n)
    }

    /// Replace the raw payload; `bytes` must hold `num_values` whole items.
    pub fn write_data(&self, handle: u32, bytes: &[u8], num_values: u32) -> OdbResult<()> {
        let key = self.key(handle)?;
        let tid = self.type_of(&key);
        self.writable_leaf(handle, tid)?;
        if num_values == 0 || bytes.len() % num_values as usize != 0 {
            return Err(OdbError::OutOfRange {
                what: "payload length".into(),
                value: bytes.len() as u64,
                limit: num_values as u64,
            });
        }
        let item_size = (bytes.len() / num_values as usize) as u32;
        if tid.item_size() > 0 && item_size != tid.item_size() {
            return Err(OdbError::TypeMismatch {
                path: self.path_of(handle),
                expected: format!("{} ({} bytes per item)", tid.name(), tid.item_size()),
                found: format!("{} bytes per item", item_size),
            });
        }
        self.store(handle, item_size, num_values, bytes)
    }
}

fn convert<T: OdbType>(tree: &Tree, handle: u32, value: Value) -> OdbResult<T> {
    let found = value.type_id();
    T::from_value(value).ok_or_else(|| OdbError::TypeMismatch {
        path: tree.path_of(handle),
        expected: T::TID.name().into(),
        found: found.name().into(),
    })
}

fn check_stored<T: OdbType>(tree: &Tree, handle: u32) -> OdbResult<()> {
    let key = tree.key(handle)?;
    let stored = tree.type_of(&key);
    if stored != T::TID {
        return Err(OdbError::TypeMismatch {
            path: tree.path_of(handle),
            expected: T::TID.name().into(),
            found: stored.name().into(),
        });
    }
    Ok(())
}

impl Database {
    /// First item of a leaf.
    pub fn get_value<T: OdbType>(&self, handle: u32) -> OdbResult<T> {
        self.with_tree(|tree| {
            check_stored::<T>(tree, handle)?;
            convert(tree, handle, tree.read_index(handle, 0)?)
        })
    }

    pub fn get_array<T: OdbType>(&self, handle: u32) -> OdbResult<Vec<T>> {
        self.with_tree(|tree| {
            check_stored::<T>(tree, handle)?;
            let (_, values) = tree.read_values(handle)?;
            values.into_iter().map(|v| convert(tree, handle, v)).collect()
        })
    }

    pub fn get_index<T: OdbType>(&self, handle: u32, index: u32) -> OdbResult<T> {
        self.with_tree(|tree| {
            check_stored::<T>(tree, handle)?;
            convert(tree, handle, tree.read_index(handle, index)?)
        })
    }

    /// Make the leaf a single item holding `value`.
    pub fn set_value<T: OdbType>(&self, handle: u32, value: &T) -> OdbResult<()> {
        self.write_op(handle, -1, |tree| {
            tree.write_values(handle, T::TID, &[value.to_value()], value.item_size() as u32)
        })
    }

    pub fn set_array<T: OdbType>(&self, handle: u32, values: &[T]) -> OdbResult<()> {
        let values: Vec<Value> = values.iter().map(OdbType::to_value).collect();
        self.write_op(handle, -1, |tree| tree.write_values(handle, T::TID, &values, 0))
    }

    pub fn set_index<T: OdbType>(&self, handle: u32, index: u32, value: &T) -> OdbResult<()> {
        let notified = i32::try_from(index).unwrap_or(-1);
        self.write_op(handle, notified, |tree| {
            tree.write_index(handle, index, &value.to_value())
        })
    }

    /// Set the leaf at `path`, creating it (and its directories) if missing.
    pub fn set_value_at<T: OdbType>(&self, start: u32, path: &str, value: &T) -> OdbResult<u32> {
        self.locked(|db| {
            let handle = db.with_tree(|tree| tree.create(start, path, T::TID))?;
            db.set_value(handle, value)?;
            Ok(handle)
        })
    }

    /// Stored value at `path`, or `default` written there when the key does
    /// not exist yet. An existing value is never overwritten.
    pub fn get_value_or_init<T: OdbType>(&self, start: u32, path: &str, default: T) -> OdbResult<T> {
        self.locked(|db| {
            let (created, handle) = db.with_tree(|tree| match tree.find(start, path) {
                Ok(handle) => Ok((false, handle)),
                Err(OdbError::NoSuchKey { .. }) => Ok((true, tree.create(start, path, T::TID)?)),
                Err(e) => Err(e),
            })?;
            if created {
                db.set_value(handle, &default)?;
                return Ok(default);
            }
            db.get_value(handle)
        })
    }

    /// All items as dynamic values, with the stored type.
    pub fn get_values(&self, handle: u32) -> OdbResult<(TypeId, Vec<Value>)> {
        self.with_tree(|tree| tree.read_values(handle))
    }

    /// Replace all items with dynamic values of type `tid`. For text types
    /// `item_size` sets the minimum slot width.
    pub fn set_values(&self, handle: u32, tid: TypeId, values: &[Value], item_size: u32) -> OdbResult<()> {
        self.write_op(handle, -1, |tree| tree.write_values(handle, tid, values, item_size))
    }

    pub fn resize(&self, handle: u32, num_values: u32) -> OdbResult<()> {
        self.write_op(handle, -1, |tree| tree.resize(handle, num_values))
    }

    pub fn get_data(&self, handle: u32) -> OdbResult<Vec<u8>> {
        self.with_tree(|tree| {
            let key = tree.key(handle)?;
            let mut buf = vec![0u8; key.total_size as usize];
            tree.read_data_into(handle, &mut buf)?;
            Ok(buf)
        })
    }

    /// Copy the payload into `buf`. A short buffer still receives the bytes
    /// that fit, and the call reports `Truncated`.
    pub fn get_data_into(&self, handle: u32, buf: &mut [u8]) -> OdbResult<usize> {
        self.with_tree(|tree| tree.read_data_into(handle, buf))
    }

    pub fn set_data(&self, handle: u32, bytes: &[u8], num_values: u32) -> OdbResult<()> {
        self.write_op(handle, -1, |tree| tree.write_data(handle, bytes, num_values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::tests::test_tree;

    #[test]
    fn test_whole_array_roundtrip() {
        let (_dir, _region, tree) = test_tree();
        let h = tree.create(tree.root(), "/a", TypeId::Int32).unwrap();
        let values: Vec<Value> = (0..5).map(Value::Int32).collect();
        tree.write_values(h, TypeId::Int32, &values, 0).unwrap();
        let (tid, back) = tree.read_values(h).unwrap();
        assert_eq!(tid, TypeId::Int32);
        assert_eq!(back, values);
        assert_eq!(tree.info(h).unwrap().total_size, 20);
    }

    #[test]
    fn test_index_past_end_extends_with_zeros() {
        let (_dir, _region, tree) = test_tree();
        let h = tree.create(tree.root(), "/a", TypeId::Uint16).unwrap();
        tree.write_index(h, 4, &Value::Uint16(9)).unwrap();
        let (_, values) = tree.read_values(h).unwrap();
        assert_eq!(
            values,
            vec![
                Value::Uint16(0),
                Value::Uint16(0),
                Value::Uint16(0),
                Value::Uint16(0),
                Value::Uint16(9)
            ]
        );
        assert!(matches!(tree.read_index(h, 5), Err(OdbError::OutOfRange { .. })));
    }

    #[test]
    fn test_type_mismatch_never_reinterprets() {
        let (_dir, _region, tree) = test_tree();
        let h = tree.create(tree.root(), "/a", TypeId::Float).unwrap();
        assert!(matches!(
            tree.write_values(h, TypeId::Int32, &[Value::Int32(1)], 0),
            Err(OdbError::TypeMismatch { .. })
        ));
        assert!(matches!(
            tree.write_index(h, 0, &Value::Double(1.0)),
            Err(OdbError::TypeMismatch { .. })
        ));
        assert!(matches!(
            tree.write_data(h, &[0u8; 8], 1),
            Err(OdbError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_strings_size_to_longest() {
        let (_dir, _region, tree) = test_tree();
        let h = tree.create(tree.root(), "/s", TypeId::String).unwrap();
        assert_eq!(tree.read_values(h).unwrap().1, vec![Value::Str(String::new())]);

        tree.write_values(h, TypeId::String, &[Value::Str("hello".into())], 32).unwrap();
        assert_eq!(tree.info(h).unwrap().item_size, 32);

        tree.write_index(h, 1, &Value::Str("x".repeat(40))).unwrap();
        let info = tree.info(h).unwrap();
        assert_eq!(info.num_values, 2);
        assert_eq!(info.item_size, 41);
        assert_eq!(tree.read_index(h, 0).unwrap(), Value::Str("hello".into()));
    }

    #[test]
    fn test_resize_and_truncated_read() {
        let (_dir, _region, tree) = test_tree();
        let h = tree.create(tree.root(), "/a", TypeId::Double).unwrap();
        tree.write_values(h, TypeId::Double, &[Value::Double(1.5)], 0).unwrap();
        tree.resize(h, 3).unwrap();
        assert_eq!(
            tree.read_values(h).unwrap().1,
            vec![Value::Double(1.5), Value::Double(0.0), Value::Double(0.0)]
        );

        let mut small = [0u8; 10];
        match tree.read_data_into(h, &mut small) {
            Err(OdbError::Truncated { needed, available }) => {
                assert_eq!((needed, available), (24, 10));
            }
            other => panic!("expected Truncated, got {:?}", other),
        }
        assert_eq!(&small[..8], &1.5f64.to_le_bytes());
        assert!(matches!(tree.resize(h, 0), Err(OdbError::OutOfRange { .. })));
    }

    #[test]
    fn test_huge_index_is_refused_before_growing() {
        let (_dir, _region, tree) = test_tree();
        let h = tree.create(tree.root(), "/a", TypeId::Double).unwrap();
        tree.write_values(h, TypeId::Double, &[Value::Double(2.0)], 0).unwrap();

        assert!(matches!(
            tree.write_index(h, 3_000_000_000, &Value::Double(1.0)),
            Err(OdbError::OutOfRange { .. })
        ));
        let free = tree.data_area().free_bytes().unwrap();
        let past_free = (free / 8 + 1) as u32;
        assert!(matches!(
            tree.write_index(h, past_free, &Value::Double(1.0)),
            Err(OdbError::RegionFull { .. })
        ));
        assert_eq!(tree.read_values(h).unwrap().1, vec![Value::Double(2.0)]);
    }

    #[test]
    fn test_open_record_pins_leaf_sizes() {
        let (_dir, region, tree) = test_tree();
        let table = ClientTable::new(region.mem());
        let arr = tree.create(tree.root(), "/S/Arr", TypeId::Double).unwrap();
        let name = tree.create(tree.root(), "/S/Name", TypeId::String).unwrap();
        tree.write_values(name, TypeId::String, &[Value::Str("abc".into())], 32).unwrap();
        let s = tree.find(tree.root(), "/S").unwrap();
        let slot = table.attach("owner", 1, 0, 0).unwrap();
        table.add_open_record(&tree, slot, s, AccessMode::READ).unwrap();
        let size = tree.record_size(s).unwrap();

        assert!(matches!(tree.resize(arr, 5), Err(OdbError::OpenRecord { .. })));
        assert!(matches!(
            tree.write_index(arr, 3, &Value::Double(1.0)),
            Err(OdbError::OpenRecord { .. })
        ));
        assert!(matches!(
            tree.write_data(arr, &[0u8; 16], 2),
            Err(OdbError::OpenRecord { .. })
        ));
        assert!(matches!(
            tree.write_values(name, TypeId::String, &[Value::Str("x".repeat(40))], 0),
            Err(OdbError::OpenRecord { .. })
        ));
        assert_eq!(tree.record_size(s).unwrap(), size);

        tree.write_values(arr, TypeId::Double, &[Value::Double(1.5)], 0).unwrap();
        tree.write_values(name, TypeId::String, &[Value::Str("abcdef".into())], 0).unwrap();
        assert_eq!(tree.info(name).unwrap().item_size, 32);
        assert_eq!(tree.record_size(s).unwrap(), size);

        assert!(table.remove_open_record(&tree, slot, s, false));
        tree.resize(arr, 5).unwrap();
        assert_eq!(tree.info(arr).unwrap().num_values, 5);
    }

    #[test]
    fn test_read_protected_key() {
        let (_dir, _region, tree) = test_tree();
        let h = tree.create(tree.root(), "/a", TypeId::Int32).unwrap();
        tree.set_mode(h, AccessMode::WRITE, false).unwrap();
        assert!(matches!(tree.read_values(h), Err(OdbError::NoAccess { .. })));
    }
}
