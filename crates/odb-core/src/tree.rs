//! Tree index: named, typed keys linked by offsets
//!
//! A directory key points at a `KeyList`; its children hang off
//! `KeyList::first_key` and are chained through `Key::next_key` in creation
//! order. Every child records the `KeyList` it belongs to, which is how the
//! tree is walked upwards.
//!
//! Name comparison is an ASCII case fold. Links store an absolute target path
//! and are substituted during lookup, restarting from the root. A link whose
//! target carries an `[index]` suffix designates one array element and is
//! never followed.
//!
//! All functions here assume the caller holds the database lock.

use tracing::debug;

use crate::alloc::{Area, FreeList};
use crate::client::ClientTable;
use crate::error::{OdbError, OdbResult};
use crate::format::{Key, KeyList, ALIGN, KEYLIST_SIZE, KEY_SIZE, MAX_DEPTH, NAME_LENGTH};
use crate::platform::now_secs;
use crate::region::{fatal, Mem};
use crate::types::{decode_text, encode_text, AccessMode, TypeId, TID_LAST};

/// Metadata of one key, as returned by `get_key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    pub name: String,
    pub type_id: TypeId,
    pub num_values: u32,
    pub item_size: u32,
    pub total_size: u32,
    pub access_mode: AccessMode,
    pub notify_count: u16,
    pub last_written: u32,
    /// Number of children for directories, 0 otherwise
    pub num_keys: u32,
}

/// Split `name[3]` into `("name", Some(3))`.
pub fn split_index(path: &str) -> OdbResult<(&str, Option<u32>)> {
    let trimmed = path.trim_end();
    if let Some(open) = trimmed.rfind('[') {
        if let Some(inner) = trimmed[open + 1..].strip_suffix(']') {
            let index = inner.trim().parse::<u32>().map_err(|_| OdbError::InvalidName {
                name: path.to_string(),
                reason: "array index is not a number".into(),
            })?;
            return Ok((&trimmed[..open], Some(index)));
        }
    }
    Ok((path, None))
}

/// View of the tree inside one mapped region.
#[derive(Clone, Copy)]
pub(crate) struct Tree {
    mem: Mem,
    keys: FreeList,
    data: FreeList,
    check_utf8: bool,
}

impl Tree {
    pub fn new(mem: Mem, check_utf8: bool) -> Self {
        Self {
            mem,
            keys: FreeList::new(mem, Area::Key),
            data: FreeList::new(mem, Area::Data),
            check_utf8,
        }
    }

    pub fn mem(&self) -> Mem {
        self.mem
    }

    pub fn key_area(&self) -> FreeList {
        self.keys
    }

    pub fn data_area(&self) -> FreeList {
        self.data
    }

    pub fn check_utf8(&self) -> bool {
        self.check_utf8
    }

    /// Lay out empty areas and the root directory in a freshly created header.
    pub fn format(&self) -> OdbResult<()> {
        self.keys.format();
        self.data.format();

        let root = self.alloc_key()?;
        let list = self.alloc_keylist()?;
        let mut key = Key::new(TypeId::Key.as_u32(), "", 0, now_secs());
        key.data = list;
        key.item_size = KEYLIST_SIZE;
        key.total_size = KEYLIST_SIZE;
        self.mem.set_key(root, &key);
        self.mem.set_keylist(
            list,
            &KeyList {
                parent: root,
                num_keys: 0,
                first_key: 0,
            },
        );
        self.mem.set_u32(crate::format::header_field::ROOT_KEY, root);
        Ok(())
    }

    pub fn root(&self) -> u32 {
        self.mem.u32_at(crate::format::header_field::ROOT_KEY)
    }

    /// True if `handle` plausibly designates a key: aligned, inside the index
    /// area and carrying a valid type id.
    pub fn is_key(&self, handle: u32) -> bool {
        if handle == 0 || handle % ALIGN != 0 || !self.keys.contains(handle, KEY_SIZE) {
            return false;
        }
        let tid = self.mem.u32_at(handle as usize);
        tid > 0 && tid < TID_LAST
    }

    /// Load a key, failing with `InvalidHandle` for anything that is not one.
    pub fn key(&self, handle: u32) -> OdbResult<Key> {
        if !self.is_key(handle) {
            return Err(OdbError::InvalidHandle { handle });
        }
        Ok(self.mem.key(handle))
    }

    /// Load a key reached by following an offset stored in the region.
    /// An offset outside the index area at this point is fatal.
    fn key_at(&self, offset: u32) -> Key {
        if !self.keys.contains(offset, KEY_SIZE) {
            fatal(&format!("key offset {} outside index area", offset));
        }
        self.mem.key(offset)
    }

    fn keylist_at(&self, offset: u32) -> KeyList {
        if !self.keys.contains(offset, KEYLIST_SIZE) {
            fatal(&format!("keylist offset {} outside index area", offset));
        }
        self.mem.keylist(offset)
    }

    pub fn type_of(&self, key: &Key) -> TypeId {
        match TypeId::from_u32(key.type_id) {
            Some(tid) => tid,
            None => fatal(&format!("type id {} out of range", key.type_id)),
        }
    }

    fn alloc_key(&self) -> OdbResult<u32> {
        match self.keys.alloc(KEY_SIZE) {
            0 => Err(OdbError::RegionFull {
                area: Area::Key.name(),
                requested: KEY_SIZE,
            }),
            offset => Ok(offset),
        }
    }

    fn alloc_keylist(&self) -> OdbResult<u32> {
        match self.keys.alloc(KEYLIST_SIZE) {
            0 => Err(OdbError::RegionFull {
                area: Area::Key.name(),
                requested: KEYLIST_SIZE,
            }),
            offset => Ok(offset),
        }
    }

    /// Children of `dir` in chain order.
    pub fn children(&self, dir: u32) -> Vec<u32> {
        let key = self.key_at(dir);
        let mut out = Vec::new();
        if key.type_id != TypeId::Key.as_u32() {
            return out;
        }
        let list = self.keylist_at(key.data);
        let limit = (self.keys.area_size() / KEY_SIZE) as usize;
        let mut cur = list.first_key;
        while cur != 0 {
            out.push(cur);
            if out.len() > limit {
                fatal(&format!("cycle in key chain of directory at {}", dir));
            }
            cur = self.key_at(cur).next_key;
        }
        out
    }

    pub fn num_keys(&self, dir: u32) -> OdbResult<u32> {
        let key = self.key(dir)?;
        if key.type_id != TypeId::Key.as_u32() {
            return Ok(0);
        }
        Ok(self.keylist_at(key.data).num_keys)
    }

    pub fn parent(&self, handle: u32) -> Option<u32> {
        let key = self.key_at(handle);
        if key.parent_keylist == 0 {
            return None;
        }
        Some(self.keylist_at(key.parent_keylist).parent)
    }

    fn find_child(&self, dir: u32, name: &str) -> Option<u32> {
        let name = name.as_bytes();
        self.children(dir)
            .into_iter()
            .find(|&child| self.key_at(child).name_bytes().eq_ignore_ascii_case(name))
    }

    pub fn validate_name(&self, name: &str) -> OdbResult<()> {
        let invalid = |reason: &str| {
            Err(OdbError::InvalidName {
                name: name.to_string(),
                reason: reason.into(),
            })
        };
        if name.is_empty() {
            return invalid("empty name");
        }
        if name.len() >= NAME_LENGTH {
            return invalid("name too long");
        }
        if name == "." || name == ".." {
            return invalid("reserved name");
        }
        if name.chars().any(|c| c == '/' || c == '[' || c == ']' || c.is_control()) {
            return invalid("name contains '/', '[', ']' or a control character");
        }
        // names must survive the `name = TYPE : value` lines of the ASCII dump
        if name.starts_with('#') || name.starts_with(';') {
            return invalid("name starts with a comment character");
        }
        if name.contains(" = ") {
            return invalid("name contains \" = \"");
        }
        if name.trim() != name {
            return invalid("name has leading or trailing whitespace");
        }
        Ok(())
    }

    /// Resolve `path` relative to `start` (absolute paths start at the root),
    /// following links.
    pub fn find(&self, start: u32, path: &str) -> OdbResult<u32> {
        self.resolve(start, path, true, 0)
    }

    /// Like `find`, but a link named by the last segment is returned itself.
    pub fn find_link(&self, start: u32, path: &str) -> OdbResult<u32> {
        self.resolve(start, path, false, 0)
    }

    fn resolve(&self, start: u32, path: &str, follow_trailing: bool, depth: usize) -> OdbResult<u32> {
        if depth > MAX_DEPTH {
            return Err(OdbError::InvalidLink {
                path: path.to_string(),
                reason: format!("more than {} nested links", MAX_DEPTH),
            });
        }
        let mut cur = if path.starts_with('/') { self.root() } else { start };
        self.key(cur)?;

        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        for (i, segment) in segments.iter().enumerate() {
            let last = i + 1 == segments.len();
            match *segment {
                "." => continue,
                ".." => {
                    cur = self.parent(cur).unwrap_or(cur);
                    continue;
                }
                _ => {}
            }

            let key = self.key_at(cur);
            if key.type_id != TypeId::Key.as_u32() {
                return Err(OdbError::NoSuchKey {
                    path: path.to_string(),
                });
            }
            if !key.access_mode.contains(AccessMode::READ) {
                return Err(OdbError::NoAccess {
                    path: self.path_of(cur),
                    reason: "directory is not readable".into(),
                });
            }
            let child = self.find_child(cur, segment).ok_or_else(|| OdbError::NoSuchKey {
                path: path.to_string(),
            })?;

            let child_key = self.key_at(child);
            if child_key.type_id == TypeId::Link.as_u32() && (!last || follow_trailing) {
                let target = self.link_target(&child_key);
                let (_, index) = split_index(&target)?;
                if index.is_some() {
                    if last {
                        return Ok(child);
                    }
                    return Err(OdbError::InvalidLink {
                        path: target,
                        reason: "array element link used as a directory".into(),
                    });
                }
                let base = self.parent(child).unwrap_or(self.root());
                cur = self.resolve(base, &target, true, depth + 1).map_err(|e| match e {
                    OdbError::NoSuchKey { .. } => OdbError::InvalidLink {
                        path: self.path_of(child),
                        reason: format!("target \"{}\" does not exist", target),
                    },
                    other => other,
                })?;
            } else {
                cur = child;
            }
        }
        Ok(cur)
    }

    /// Create `path` as type `tid`, creating missing directories on the way.
    /// An existing key of the same type is returned as is.
    pub fn create(&self, start: u32, path: &str, tid: TypeId) -> OdbResult<u32> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            return Err(OdbError::InvalidName {
                name: path.to_string(),
                reason: "path names no key".into(),
            });
        }
        let mut cur = if path.starts_with('/') { self.root() } else { start };
        self.key(cur)?;

        for (i, segment) in segments.iter().enumerate() {
            let last = i + 1 == segments.len();
            match *segment {
                "." => continue,
                ".." => {
                    cur = self.parent(cur).unwrap_or(cur);
                    continue;
                }
                _ => {}
            }
            let want = if last { tid } else { TypeId::Key };

            match self.find_child(cur, segment) {
                Some(child) => {
                    let key = self.key_at(child);
                    let found = self.type_of(&key);
                    if !last && found == TypeId::Link {
                        cur = self.resolve(cur, segment, true, 0)?;
                        if self.type_of(&self.key_at(cur)) != TypeId::Key {
                            return Err(self.mismatch(cur, want, found));
                        }
                        continue;
                    }
                    if found != want {
                        return Err(self.mismatch(child, want, found));
                    }
                    cur = child;
                }
                None => {
                    cur = self.create_child(cur, segment, want)?;
                }
            }
        }
        Ok(cur)
    }

    fn mismatch(&self, handle: u32, expected: TypeId, found: TypeId) -> OdbError {
        OdbError::TypeMismatch {
            path: self.path_of(handle),
            expected: expected.name().into(),
            found: found.name().into(),
        }
    }

    /// Allocate a key named `name` and append it to `dir`'s chain.
    pub fn create_child(&self, dir: u32, name: &str, tid: TypeId) -> OdbResult<u32> {
        self.validate_name(name)?;
        let parent = self.key_at(dir);
        if parent.type_id != TypeId::Key.as_u32() {
            return Err(self.mismatch(dir, TypeId::Key, self.type_of(&parent)));
        }
        if !parent.access_mode.contains(AccessMode::WRITE) {
            return Err(OdbError::NoAccess {
                path: self.path_of(dir),
                reason: "directory is not writable".into(),
            });
        }
        if self.find_child(dir, name).is_some() {
            return Err(OdbError::KeyExists {
                path: join(&self.path_of(dir), name),
            });
        }

        let handle = self.alloc_key()?;
        let mut key = Key::new(tid.as_u32(), name, parent.data, now_secs());
        match tid {
            TypeId::Key => {
                let list = match self.alloc_keylist() {
                    Ok(list) => list,
                    Err(e) => {
                        self.keys.free(handle, KEY_SIZE)?;
                        return Err(e);
                    }
                };
                self.mem.set_keylist(
                    list,
                    &KeyList {
                        parent: handle,
                        num_keys: 0,
                        first_key: 0,
                    },
                );
                key.data = list;
                key.item_size = KEYLIST_SIZE;
                key.total_size = KEYLIST_SIZE;
            }
            tid if tid.item_size() > 0 => {
                let size = tid.item_size();
                let data = self.data.alloc(size);
                if data == 0 {
                    self.keys.free(handle, KEY_SIZE)?;
                    return Err(OdbError::RegionFull {
                        area: Area::Data.name(),
                        requested: size,
                    });
                }
                key.data = data;
                key.item_size = size;
                key.total_size = size;
            }
            _ => {}
        }
        self.mem.set_key(handle, &key);

        // append at the end of the chain
        let mut list = self.keylist_at(parent.data);
        match self.children(dir).last() {
            Some(&tail) => {
                let mut tail_key = self.key_at(tail);
                tail_key.next_key = handle;
                self.mem.set_key(tail, &tail_key);
            }
            None => list.first_key = handle,
        }
        list.num_keys += 1;
        self.mem.set_keylist(parent.data, &list);

        debug!(path = %self.path_of(handle), type_name = tid.name(), "created key");
        Ok(handle)
    }

    /// Every key of the subtree rooted at `handle`, parents before children.
    pub fn subtree(&self, handle: u32) -> Vec<u32> {
        let mut out = Vec::new();
        self.collect(handle, 0, &mut out);
        out
    }

    fn collect(&self, handle: u32, depth: usize, out: &mut Vec<u32>) {
        if depth > MAX_DEPTH {
            fatal(&format!("tree deeper than {} levels below {}", MAX_DEPTH, handle));
        }
        out.push(handle);
        for child in self.children(handle) {
            self.collect(child, depth + 1, out);
        }
    }

    /// Delete `handle` and everything below it. With `follow_links`, the
    /// target of a link is deleted as well; nothing is deleted unless both
    /// the link and its target can be.
    pub fn delete(&self, handle: u32, follow_links: bool) -> OdbResult<()> {
        let key = self.key(handle)?;
        if handle == self.root() {
            return Err(OdbError::NoAccess {
                path: "/".into(),
                reason: "the root cannot be deleted".into(),
            });
        }

        let target = if follow_links && key.type_id == TypeId::Link.as_u32() {
            Some(self.resolve_for_delete(handle, &key)?)
        } else {
            None
        };

        self.check_deletable(handle)?;
        if let Some(target) = target {
            self.check_deletable(target)?;
        }
        self.unlink(handle);
        self.free_subtree(handle, 0)?;

        if let Some(target) = target {
            self.delete(target, false)?;
        }
        Ok(())
    }

    /// The key a link designates, which must exist and must not be the root.
    fn resolve_for_delete(&self, handle: u32, key: &Key) -> OdbResult<u32> {
        let target = self.link_target(key);
        let (base, _) = split_index(&target)?;
        let resolved = match self.find(self.root(), base) {
            Ok(resolved) => resolved,
            Err(OdbError::NoSuchKey { .. }) => {
                return Err(OdbError::InvalidLink {
                    path: self.path_of(handle),
                    reason: format!("target {} does not exist", target),
                })
            }
            Err(e) => return Err(e),
        };
        if resolved == self.root() {
            return Err(OdbError::NoAccess {
                path: "/".into(),
                reason: "the root cannot be deleted".into(),
            });
        }
        Ok(resolved)
    }

    fn check_deletable(&self, handle: u32) -> OdbResult<()> {
        for node in self.subtree(handle) {
            let key = self.key_at(node);
            if key.notify_count > 0 {
                return Err(OdbError::OpenRecord {
                    path: self.path_of(node),
                });
            }
            if !key.access_mode.contains(AccessMode::DELETE) {
                return Err(OdbError::NoAccess {
                    path: self.path_of(node),
                    reason: "delete not permitted".into(),
                });
            }
        }
        Ok(())
    }

    /// Remove `handle` from its parent's chain.
    fn unlink(&self, handle: u32) {
        let key = self.key_at(handle);
        let mut list = self.keylist_at(key.parent_keylist);
        if list.first_key == handle {
            list.first_key = key.next_key;
        } else {
            let mut cur = list.first_key;
            while cur != 0 {
                let mut k = self.key_at(cur);
                if k.next_key == handle {
                    k.next_key = key.next_key;
                    self.mem.set_key(cur, &k);
                    break;
                }
                cur = k.next_key;
            }
        }
        list.num_keys = list.num_keys.saturating_sub(1);
        self.mem.set_keylist(key.parent_keylist, &list);
    }

    fn free_subtree(&self, handle: u32, depth: usize) -> OdbResult<()> {
        if depth > MAX_DEPTH {
            fatal(&format!("tree deeper than {} levels below {}", MAX_DEPTH, handle));
        }
        let key = self.key_at(handle);
        if key.type_id == TypeId::Key.as_u32() {
            for child in self.children(handle) {
                self.free_subtree(child, depth + 1)?;
            }
            self.keys.free(key.data, KEYLIST_SIZE)?;
        } else if key.data != 0 && key.total_size > 0 {
            self.data.free(key.data, key.total_size)?;
        }
        self.keys.free(handle, KEY_SIZE)
    }

    /// Child `index` of `dir` in chain order, or `None` past the end.
    pub fn enum_key(&self, dir: u32, index: usize) -> OdbResult<Option<u32>> {
        let key = self.key(dir)?;
        if key.type_id != TypeId::Key.as_u32() {
            return Err(self.mismatch(dir, TypeId::Key, self.type_of(&key)));
        }
        Ok(self.children(dir).get(index).copied())
    }

    /// The key after `handle` in depth-first order over the whole tree.
    /// Links are not followed.
    pub fn next_key(&self, handle: u32) -> OdbResult<Option<u32>> {
        let key = self.key(handle)?;
        if key.type_id == TypeId::Key.as_u32() {
            if let Some(&first) = self.children(handle).first() {
                return Ok(Some(first));
            }
        }
        let mut cur = handle;
        let mut steps = 0usize;
        loop {
            let k = self.key_at(cur);
            if k.next_key != 0 {
                return Ok(Some(k.next_key));
            }
            match self.parent(cur) {
                Some(parent) if cur != self.root() => cur = parent,
                _ => return Ok(None),
            }
            steps += 1;
            if steps > MAX_DEPTH {
                fatal(&format!("parent chain longer than {} from {}", MAX_DEPTH, handle));
            }
        }
    }

    /// Absolute path of `handle`; the root is "/".
    pub fn path_of(&self, handle: u32) -> String {
        let mut names = Vec::new();
        let mut cur = handle;
        while cur != self.root() {
            let key = self.key_at(cur);
            names.push(key.name_str());
            match self.parent(cur) {
                Some(parent) => cur = parent,
                None => break,
            }
            if names.len() > MAX_DEPTH {
                fatal(&format!("parent chain longer than {} from {}", MAX_DEPTH, handle));
            }
        }
        if names.is_empty() {
            return "/".into();
        }
        names.reverse();
        format!("/{}", names.join("/"))
    }

    pub fn info(&self, handle: u32) -> OdbResult<KeyInfo> {
        let key = self.key(handle)?;
        let type_id = self.type_of(&key);
        let num_keys = if type_id.is_dir() {
            self.keylist_at(key.data).num_keys
        } else {
            0
        };
        Ok(KeyInfo {
            name: key.name_str(),
            type_id,
            num_values: key.num_values,
            item_size: key.item_size,
            total_size: key.total_size,
            access_mode: key.access_mode,
            notify_count: key.notify_count,
            last_written: key.last_written,
            num_keys,
        })
    }

    pub fn rename(&self, handle: u32, new_name: &str) -> OdbResult<()> {
        self.validate_name(new_name)?;
        let mut key = self.key(handle)?;
        if handle == self.root() {
            return Err(OdbError::NoAccess {
                path: "/".into(),
                reason: "the root cannot be renamed".into(),
            });
        }
        if !key.access_mode.contains(AccessMode::WRITE) {
            return Err(OdbError::NoAccess {
                path: self.path_of(handle),
                reason: "rename not permitted".into(),
            });
        }
        if let Some(parent) = self.parent(handle) {
            if let Some(existing) = self.find_child(parent, new_name) {
                if existing != handle {
                    return Err(OdbError::KeyExists {
                        path: join(&self.path_of(parent), new_name),
                    });
                }
            }
        }
        key.set_name(new_name);
        self.mem.set_key(handle, &key);
        Ok(())
    }

    pub fn set_mode(&self, handle: u32, mode: AccessMode, recursive: bool) -> OdbResult<()> {
        if !mode.is_valid_key_mode() {
            return Err(OdbError::OutOfRange {
                what: "access mode".into(),
                value: mode.bits() as u64,
                limit: AccessMode::KEY_MASK as u64,
            });
        }
        self.key(handle)?;
        let nodes = if recursive { self.subtree(handle) } else { vec![handle] };
        for node in nodes {
            let mut key = self.key_at(node);
            // exclusive is owned by open records
            let exclusive = key.access_mode.bits() & AccessMode::EXCLUSIVE.bits();
            key.access_mode = AccessMode(mode.without(AccessMode::EXCLUSIVE).bits() | exclusive);
            self.mem.set_key(node, &key);
        }
        Ok(())
    }

    /// Create a link at `path` pointing at the absolute path `target`.
    pub fn create_link(&self, start: u32, path: &str, target: &str) -> OdbResult<u32> {
        if !target.starts_with('/') {
            return Err(OdbError::InvalidLink {
                path: target.to_string(),
                reason: "link target must be an absolute path".into(),
            });
        }
        let (base, _) = split_index(target)?;
        let resolved = self.find(self.root(), base).map_err(|_| OdbError::InvalidLink {
            path: target.to_string(),
            reason: "target does not exist".into(),
        })?;

        let handle = self.create(start, path, TypeId::Link)?;
        if handle == resolved {
            return Err(OdbError::InvalidLink {
                path: path.to_string(),
                reason: "link would point at itself".into(),
            });
        }
        let mut bytes = Vec::with_capacity(target.len() + 1);
        encode_text(target, target.len() + 1, &mut bytes);
        self.store(handle, target.len() as u32 + 1, 1, &bytes)?;
        Ok(handle)
    }

    pub fn read_link(&self, handle: u32) -> OdbResult<String> {
        let key = self.key(handle)?;
        let tid = self.type_of(&key);
        if tid != TypeId::Link {
            return Err(self.mismatch(handle, TypeId::Link, tid));
        }
        Ok(self.link_target(&key))
    }

    fn link_target(&self, key: &Key) -> String {
        if key.data == 0 || key.total_size == 0 {
            return String::new();
        }
        decode_text(&self.payload_of(key))
    }

    /// Raw payload bytes of a leaf.
    pub fn payload_of(&self, key: &Key) -> Vec<u8> {
        if key.data == 0 || key.total_size == 0 {
            return Vec::new();
        }
        if !self.data.contains(key.data, key.total_size) {
            fatal(&format!("payload at {} (+{}) outside data area", key.data, key.total_size));
        }
        self.mem.bytes(key.data as usize, key.total_size as usize)
    }

    /// Replace the payload of a leaf with `bytes`, reallocating when the size
    /// changes. On `RegionFull` the previous payload is left intact.
    ///
    /// The size of a leaf covered by an open record is part of the record
    /// layout and cannot change while the record is open.
    pub fn store(&self, handle: u32, item_size: u32, num_values: u32, bytes: &[u8]) -> OdbResult<()> {
        let mut key = self.key(handle)?;
        let total = item_size.checked_mul(num_values).ok_or_else(|| OdbError::OutOfRange {
            what: "payload size".into(),
            value: item_size as u64 * num_values as u64,
            limit: self.data.area_size() as u64,
        })?;
        debug_assert_eq!(total as usize, bytes.len());
        if total != key.total_size && self.type_of(&key) != TypeId::Link {
            if let Some(holder) = ClientTable::new(self.mem).record_holder(self, handle) {
                return Err(OdbError::OpenRecord {
                    path: self.path_of(holder),
                });
            }
        }

        if total != key.total_size || key.data == 0 {
            let moved = if total == 0 {
                if key.data != 0 && key.total_size > 0 {
                    self.data.free(key.data, key.total_size)?;
                }
                0
            } else if key.data == 0 || key.total_size == 0 {
                self.data.alloc(total)
            } else {
                self.data.realloc(key.data, key.total_size, total)?
            };
            if total > 0 && moved == 0 {
                return Err(OdbError::RegionFull {
                    area: Area::Data.name(),
                    requested: total,
                });
            }
            key.data = moved;
        }
        if total > 0 {
            self.mem.write(key.data as usize, bytes);
        }
        key.item_size = item_size;
        key.num_values = num_values;
        key.total_size = total;
        key.last_written = now_secs();
        self.mem.set_key(handle, &key);
        Ok(())
    }

    /// Adjust `notify_count` of `handle` by `delta`, saturating at 0.
    pub fn adjust_notify(&self, handle: u32, delta: i32) {
        let mut key = self.key_at(handle);
        key.notify_count = if delta < 0 {
            key.notify_count.saturating_sub(delta.unsigned_abs() as u16)
        } else {
            key.notify_count.saturating_add(delta as u16)
        };
        self.mem.set_key(handle, &key);
    }

    pub fn set_exclusive(&self, handle: u32, on: bool) {
        let mut key = self.key_at(handle);
        key.access_mode = if on {
            key.access_mode.union(AccessMode::EXCLUSIVE)
        } else {
            key.access_mode.without(AccessMode::EXCLUSIVE)
        };
        self.mem.set_key(handle, &key);
    }

    /// `handle` followed by all its ancestors up to the root.
    pub fn ancestors(&self, handle: u32) -> Vec<u32> {
        let mut out = vec![handle];
        let mut cur = handle;
        while let Some(parent) = self.parent(cur) {
            if out.len() > MAX_DEPTH {
                fatal(&format!("parent chain longer than {} from {}", MAX_DEPTH, handle));
            }
            out.push(parent);
            cur = parent;
        }
        out
    }
}

fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}
