//! Records: a directory subtree mirrored as one fixed-layout byte block
//!
//! The block follows C struct rules. Each leaf starts on a boundary of its
//! own item alignment, a directory is aligned to the largest alignment among
//! its members and padded at the end to a multiple of it. Links are not part
//! of the layout.
//!
//! `open_record` keeps a local copy of the block. Read-mode records are
//! refreshed by `poll` when a notification arrives; write-mode records are
//! edited locally and pushed by `send_changed_records`, which only writes
//! blocks that differ from the copy taken at the last push.

use std::sync::atomic::Ordering;

use tracing::{debug, trace};

use crate::client::ClientTable;
use crate::engine::Database;
use crate::error::{OdbError, OdbResult};
use crate::notify::{Event, Observer};
use crate::tree::Tree;
use crate::types::{AccessMode, TypeId};

/// Identifies an open record of one `Database`.
pub type RecordId = u32;

/// Position of one leaf inside a record block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Field {
    pub handle: u32,
    pub offset: usize,
    pub size: usize,
}

#[derive(Debug)]
pub(crate) struct LocalRecord {
    pub handle: u32,
    pub mode: AccessMode,
    pub data: Vec<u8>,
    /// Block as of the last push, write mode only
    pub copy: Vec<u8>,
    pub observer: Option<Observer>,
}

fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) / align * align
}

impl Tree {
    /// Alignment of `handle` within a record.
    fn record_alignment(&self, handle: u32) -> OdbResult<usize> {
        let key = self.key(handle)?;
        let tid = self.type_of(&key);
        match tid {
            TypeId::Link => Ok(1),
            TypeId::Key => {
                let mut align = 1;
                for child in self.children(handle) {
                    align = align.max(self.record_alignment(child)?);
                }
                Ok(align)
            }
            _ => Ok(tid.alignment()),
        }
    }

    fn lay_out(&self, handle: u32, mut offset: usize, fields: &mut Vec<Field>) -> OdbResult<usize> {
        let key = self.key(handle)?;
        let tid = self.type_of(&key);
        match tid {
            TypeId::Link => Ok(offset),
            TypeId::Key => {
                let align = self.record_alignment(handle)?;
                offset = align_up(offset, align);
                for child in self.children(handle) {
                    offset = self.lay_out(child, offset, fields)?;
                }
                Ok(align_up(offset, align))
            }
            _ => {
                offset = align_up(offset, tid.alignment());
                fields.push(Field {
                    handle,
                    offset,
                    size: key.total_size as usize,
                });
                Ok(offset + key.total_size as usize)
            }
        }
    }

    /// Leaves of the record rooted at `handle` and the block size.
    pub(crate) fn record_layout(&self, handle: u32) -> OdbResult<(Vec<Field>, usize)> {
        let mut fields = Vec::new();
        let size = self.lay_out(handle, 0, &mut fields)?;
        Ok((fields, size))
    }

    pub fn record_size(&self, handle: u32) -> OdbResult<usize> {
        Ok(self.record_layout(handle)?.1)
    }

    /// Copy every leaf under `handle` into a block, padding zeroed.
    pub fn get_record(&self, handle: u32) -> OdbResult<Vec<u8>> {
        let (fields, size) = self.record_layout(handle)?;
        let mut block = vec![0u8; size];
        for field in fields {
            let key = self.key(field.handle)?;
            if !key.access_mode.contains(AccessMode::READ) {
                return Err(OdbError::NoAccess {
                    path: self.path_of(field.handle),
                    reason: "read not permitted".into(),
                });
            }
            let payload = self.payload_of(&key);
            block[field.offset..field.offset + payload.len()].copy_from_slice(&payload);
        }
        Ok(block)
    }

    /// Write `block` back into the leaves under `handle`. The block must have
    /// the exact record size; nothing is written unless every leaf is
    /// writable.
    pub fn set_record(&self, handle: u32, block: &[u8]) -> OdbResult<()> {
        let (fields, size) = self.record_layout(handle)?;
        if block.len() != size {
            return Err(OdbError::StructSizeMismatch {
                expected: size,
                actual: block.len(),
            });
        }
        let mut keys = Vec::with_capacity(fields.len());
        for field in &fields {
            let key = self.key(field.handle)?;
            if !key.access_mode.contains(AccessMode::WRITE) {
                return Err(OdbError::NoAccess {
                    path: self.path_of(field.handle),
                    reason: "write not permitted".into(),
                });
            }
            keys.push(key);
        }
        for (field, key) in fields.iter().zip(keys) {
            let bytes = &block[field.offset..field.offset + field.size];
            self.store(field.handle, key.item_size, key.num_values, bytes)?;
        }
        Ok(())
    }
}

impl Database {
    pub fn get_record_size(&self, handle: u32) -> OdbResult<usize> {
        self.with_tree(|tree| tree.record_size(handle))
    }

    pub fn get_record(&self, handle: u32) -> OdbResult<Vec<u8>> {
        self.with_tree(|tree| tree.get_record(handle))
    }

    /// Write a whole record block under one lock hold. Observers of the
    /// record key and its ancestors get a single notification.
    pub fn set_record(&self, handle: u32, block: &[u8]) -> OdbResult<()> {
        self.write_op(handle, -1, |tree| tree.set_record(handle, block))
    }

    /// Register a hot-link on `handle`. `size` is the caller's idea of the
    /// block size and must match the current layout. Write mode marks the key
    /// exclusive until the record is closed.
    pub fn open_record(
        &self,
        handle: u32,
        size: usize,
        mode: AccessMode,
        observer: Option<Observer>,
    ) -> OdbResult<RecordId> {
        let mode = mode.without(AccessMode::WATCH);
        if !mode.contains(AccessMode::READ) && !mode.contains(AccessMode::WRITE) {
            return Err(OdbError::OutOfRange {
                what: "record access mode".into(),
                value: mode.bits() as u64,
                limit: (AccessMode::READ | AccessMode::WRITE).bits() as u64,
            });
        }

        // database lock before the local record map, as under `locked`
        self.locked(|db| {
            let mut records = db.records.lock();
            if records.values().any(|r| r.handle == handle) {
                return Err(OdbError::OpenRecord {
                    path: db.with_tree(|tree| Ok(tree.path_of(handle)))?,
                });
            }

            let slot = db.slot();
            let data = db.with_tree(|tree| {
                let actual = tree.record_size(handle)?;
                if actual != size {
                    return Err(OdbError::StructSizeMismatch {
                        expected: actual,
                        actual: size,
                    });
                }
                let data = tree.get_record(handle)?;
                ClientTable::new(tree.mem()).add_open_record(tree, slot, handle, mode)?;
                Ok(data)
            })?;

            let id = db.next_record.fetch_add(1, Ordering::Relaxed);
            let copy = if mode.contains(AccessMode::WRITE) {
                data.clone()
            } else {
                Vec::new()
            };
            records.insert(
                id,
                LocalRecord {
                    handle,
                    mode,
                    data,
                    copy,
                    observer,
                },
            );
            debug!(record = id, handle, mode = mode.bits(), "opened record");
            Ok(id)
        })
    }

    pub fn close_record(&self, id: RecordId) -> OdbResult<()> {
        let record = self
            .records
            .lock()
            .remove(&id)
            .ok_or(OdbError::InvalidHandle { handle: id })?;
        let slot = self.slot();
        self.with_tree(|tree| {
            ClientTable::new(tree.mem()).remove_open_record(tree, slot, record.handle, false);
            Ok(())
        })?;
        debug!(record = id, handle = record.handle, "closed record");
        Ok(())
    }

    /// Local copy of an open record's block.
    pub fn record_data(&self, id: RecordId) -> OdbResult<Vec<u8>> {
        self.records
            .lock()
            .get(&id)
            .map(|r| r.data.clone())
            .ok_or(OdbError::InvalidHandle { handle: id })
    }

    /// Edit the local block of a write-mode record. Nothing reaches the
    /// region until `send_changed_records`.
    pub fn update_record(&self, id: RecordId, block: &[u8]) -> OdbResult<()> {
        let mut records = self.records.lock();
        let record = records.get_mut(&id).ok_or(OdbError::InvalidHandle { handle: id })?;
        if !record.mode.contains(AccessMode::WRITE) {
            return Err(OdbError::NoAccess {
                path: format!("record {}", id),
                reason: "record not opened for writing".into(),
            });
        }
        if block.len() != record.data.len() {
            return Err(OdbError::StructSizeMismatch {
                expected: record.data.len(),
                actual: block.len(),
            });
        }
        record.data.copy_from_slice(block);
        Ok(())
    }

    /// Push every write-mode record whose block changed since the last push.
    /// Returns how many records were written.
    pub fn send_changed_records(&self) -> OdbResult<usize> {
        let changed: Vec<(RecordId, u32, Vec<u8>)> = self
            .records
            .lock()
            .iter()
            .filter(|(_, r)| r.mode.contains(AccessMode::WRITE) && r.data != r.copy)
            .map(|(&id, r)| (id, r.handle, r.data.clone()))
            .collect();

        let mut sent = 0;
        for (id, handle, data) in changed {
            self.set_record(handle, &data)?;
            if let Some(record) = self.records.lock().get_mut(&id) {
                record.copy = data;
            }
            trace!(record = id, handle, "pushed changed record");
            sent += 1;
        }
        Ok(sent)
    }

    /// Register a path-level hot-link: the observer gets an `Event::Watch`
    /// for every change of `handle` or a key below it.
    pub fn watch(&self, handle: u32, observer: Observer) -> OdbResult<()> {
        self.locked(|db| {
            let mut watches = db.watches.lock();
            if watches.contains_key(&handle) {
                return Err(OdbError::OpenRecord {
                    path: db.with_tree(|tree| Ok(tree.path_of(handle)))?,
                });
            }
            let slot = db.slot();
            db.with_tree(|tree| {
                tree.key(handle)?;
                ClientTable::new(tree.mem()).add_open_record(tree, slot, handle, AccessMode::READ | AccessMode::WATCH)
            })?;
            watches.insert(handle, observer);
            debug!(handle, "watching key");
            Ok(())
        })
    }

    pub fn unwatch(&self, handle: u32) -> OdbResult<()> {
        if self.watches.lock().remove(&handle).is_none() {
            return Err(OdbError::InvalidHandle { handle });
        }
        let slot = self.slot();
        self.with_tree(|tree| {
            ClientTable::new(tree.mem()).remove_open_record(tree, slot, handle, true);
            Ok(())
        })
    }

    pub fn unwatch_all(&self) -> OdbResult<()> {
        let handles: Vec<u32> = self.watches.lock().keys().copied().collect();
        for handle in handles {
            self.unwatch(handle)?;
        }
        Ok(())
    }

    /// Drain pending notifications and dispatch them to observers. Read-mode
    /// records are refreshed before their observer runs. Returns the number
    /// of events dispatched.
    pub fn poll(&self) -> OdbResult<usize> {
        let pending: Vec<_> = self.inbox.lock().drain(..).collect();
        let mut events = Vec::new();
        for n in pending {
            if n.watch {
                if let Some(observer) = self.watches.lock().get(&n.watched).cloned() {
                    events.push((
                        observer,
                        Event::Watch {
                            watched: n.watched,
                            mutated: n.mutated,
                            index: n.index,
                        },
                    ));
                }
                continue;
            }

            let targets: Vec<RecordId> = self
                .records
                .lock()
                .iter()
                .filter(|(_, r)| r.handle == n.watched && !r.mode.contains(AccessMode::WRITE))
                .map(|(&id, _)| id)
                .collect();
            for id in targets {
                let data = self.with_tree(|tree| tree.get_record(n.watched))?;
                let mut records = self.records.lock();
                if let Some(record) = records.get_mut(&id) {
                    record.data.clone_from(&data);
                    if let Some(observer) = record.observer.clone() {
                        events.push((
                            observer,
                            Event::Record {
                                handle: n.watched,
                                data,
                            },
                        ));
                    }
                }
            }
        }

        let count = events.len();
        for (observer, event) in events {
            observer.dispatch(event);
        }
        Ok(count)
    }
}
