//! Client table and open records
//!
//! Every attachment owns one slot of the fixed client table in the region
//! header. A slot holds the owner's pid, its watchdog and its open records:
//! the keys it has registered interest in. An open record increments the
//! key's `notify_count`; a write-mode open record also marks the key
//! exclusive.
//!
//! The sweep reclaims the slots of clients whose process is gone or whose
//! watchdog has expired, undoing the effects of their open records.

use tracing::{info, warn};

use crate::error::{OdbError, OdbResult};
use crate::format::{
    client_offset, header_field, ClientEntry, OpenRecord, CLIENT_SIZE, MAX_CLIENTS, MAX_OPEN_RECORDS,
};
use crate::platform;
use crate::region::Mem;
use crate::tree::Tree;
use crate::types::AccessMode;

/// Snapshot of one client slot, for maintenance listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub slot: usize,
    pub name: String,
    pub pid: u32,
    pub last_activity: u64,
    pub watchdog_timeout: u32,
    pub open_records: Vec<OpenRecord>,
}

/// A client removed by the sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reclaimed {
    pub slot: usize,
    pub name: String,
    pub pid: u32,
    /// Open records that were dropped with the client
    pub dropped: usize,
}

#[derive(Clone, Copy)]
pub(crate) struct ClientTable {
    mem: Mem,
}

impl ClientTable {
    pub fn new(mem: Mem) -> Self {
        Self { mem }
    }

    pub fn entry(&self, slot: usize) -> ClientEntry {
        self.mem.client(slot)
    }

    /// Claim the first free slot.
    pub fn attach(&self, name: &str, pid: u32, now_ms: u64, watchdog_ms: u32) -> OdbResult<usize> {
        let slot = (0..MAX_CLIENTS)
            .find(|&i| self.mem.client(i).is_free())
            .ok_or(OdbError::ClientTableFull { max: MAX_CLIENTS })?;
        self.mem.fill(client_offset(slot), CLIENT_SIZE, 0);
        self.mem
            .set_client(slot, &ClientEntry::new(name, pid, 0, now_ms, watchdog_ms));
        self.recount();
        Ok(slot)
    }

    /// Release a slot, dropping its open records.
    pub fn detach(&self, tree: &Tree, slot: usize) -> usize {
        let dropped = self.drop_open_records(tree, slot);
        self.mem.fill(client_offset(slot), CLIENT_SIZE, 0);
        self.recount();
        dropped
    }

    pub fn touch(&self, slot: usize, now_ms: u64) {
        let mut entry = self.mem.client(slot);
        if entry.is_free() {
            return;
        }
        entry.last_activity = now_ms;
        self.mem.set_client(slot, &entry);
    }

    pub fn set_watchdog(&self, slot: usize, watchdog_ms: u32) {
        let mut entry = self.mem.client(slot);
        entry.watchdog_timeout = watchdog_ms;
        self.mem.set_client(slot, &entry);
    }

    /// Occupied slots in table order.
    pub fn active(&self) -> Vec<usize> {
        (0..MAX_CLIENTS)
            .filter(|&i| !self.mem.client(i).is_free())
            .collect()
    }

    pub fn num_clients(&self) -> u32 {
        self.mem.u32_at(header_field::NUM_CLIENTS)
    }

    fn recount(&self) {
        let active = self.active();
        let max_index = active.last().map(|&i| i as u32 + 1).unwrap_or(0);
        self.mem.set_u32(header_field::NUM_CLIENTS, active.len() as u32);
        self.mem.set_u32(header_field::MAX_CLIENT_INDEX, max_index);
    }

    pub fn info(&self, slot: usize) -> ClientInfo {
        let entry = self.mem.client(slot);
        ClientInfo {
            slot,
            name: entry.name_str(),
            pid: entry.pid,
            last_activity: entry.last_activity,
            watchdog_timeout: entry.watchdog_timeout,
            open_records: self.open_records(slot).into_iter().map(|(_, r)| r).collect(),
        }
    }

    /// Used open record slots of a client as `(slot, record)`.
    pub fn open_records(&self, slot: usize) -> Vec<(usize, OpenRecord)> {
        let entry = self.mem.client(slot);
        let max = (entry.max_index as usize).min(MAX_OPEN_RECORDS);
        (0..max)
            .map(|j| (j, self.mem.open_record(slot, j)))
            .filter(|(_, r)| r.handle != 0)
            .collect()
    }

    /// True if the client holds a write-mode open record on `handle`.
    pub fn holds_write(&self, slot: usize, handle: u32) -> bool {
        self.open_records(slot)
            .iter()
            .any(|(_, r)| r.handle == handle && r.access_mode.contains(AccessMode::WRITE))
    }

    /// True while `slot` still belongs to the client `name` of process `pid`.
    pub fn owned_by(&self, slot: usize, pid: u32, name: &str) -> bool {
        let entry = self.mem.client(slot);
        !entry.is_free() && entry.pid == pid && entry.name_str() == name
    }

    /// `handle` or the nearest ancestor on which some client holds a record
    /// (not a watch). Watches do not pin the layout.
    pub fn record_holder(&self, tree: &Tree, handle: u32) -> Option<u32> {
        let pinned = tree
            .ancestors(handle)
            .into_iter()
            .filter(|&h| tree.mem().key(h).notify_count > 0)
            .collect::<Vec<_>>();
        if pinned.is_empty() {
            return None;
        }
        let records: Vec<OpenRecord> = self
            .active()
            .into_iter()
            .flat_map(|slot| self.open_records(slot))
            .map(|(_, r)| r)
            .filter(|r| !r.access_mode.contains(AccessMode::WATCH))
            .collect();
        pinned
            .into_iter()
            .find(|&h| records.iter().any(|r| r.handle == h))
    }

    /// Register interest of `slot` in `handle`.
    pub fn add_open_record(&self, tree: &Tree, slot: usize, handle: u32, mode: AccessMode) -> OdbResult<()> {
        let key = tree.key(handle)?;
        if mode.contains(AccessMode::WRITE) {
            if !key.access_mode.contains(AccessMode::WRITE) {
                return Err(OdbError::NoAccess {
                    path: tree.path_of(handle),
                    reason: "key is not writable".into(),
                });
            }
            if key.access_mode.contains(AccessMode::EXCLUSIVE) {
                return Err(OdbError::NoAccess {
                    path: tree.path_of(handle),
                    reason: "key is opened exclusively by another writer".into(),
                });
            }
        }

        let mut entry = self.mem.client(slot);
        let free = (0..MAX_OPEN_RECORDS)
            .find(|&j| self.mem.open_record(slot, j).handle == 0)
            .ok_or(OdbError::TooManyOpenRecords {
                max: MAX_OPEN_RECORDS,
            })?;
        self.mem.set_open_record(
            slot,
            free,
            &OpenRecord {
                handle,
                access_mode: mode,
                flags: 0,
            },
        );
        entry.num_open_records += 1;
        entry.max_index = entry.max_index.max(free as u32 + 1);
        self.mem.set_client(slot, &entry);

        tree.adjust_notify(handle, 1);
        if mode.contains(AccessMode::WRITE) {
            tree.set_exclusive(handle, true);
        }
        Ok(())
    }

    /// Remove one open record of `slot` on `handle` whose watch bit equals
    /// `watch`. Returns false when there was none.
    pub fn remove_open_record(&self, tree: &Tree, slot: usize, handle: u32, watch: bool) -> bool {
        let found = self
            .open_records(slot)
            .into_iter()
            .find(|(_, r)| r.handle == handle && r.access_mode.contains(AccessMode::WATCH) == watch);
        match found {
            Some((j, record)) => {
                self.clear_open_record(tree, slot, j, &record);
                true
            }
            None => false,
        }
    }

    fn clear_open_record(&self, tree: &Tree, slot: usize, j: usize, record: &OpenRecord) {
        if tree.is_key(record.handle) {
            tree.adjust_notify(record.handle, -1);
            if record.access_mode.contains(AccessMode::WRITE) {
                tree.set_exclusive(record.handle, false);
            }
        }
        self.mem.set_open_record(slot, j, &OpenRecord::default());

        let mut entry = self.mem.client(slot);
        entry.num_open_records = entry.num_open_records.saturating_sub(1);
        entry.max_index = self
            .open_records(slot)
            .last()
            .map(|&(k, _)| k as u32 + 1)
            .unwrap_or(0);
        self.mem.set_client(slot, &entry);
    }

    fn drop_open_records(&self, tree: &Tree, slot: usize) -> usize {
        let records = self.open_records(slot);
        for (j, record) in &records {
            self.clear_open_record(tree, slot, *j, record);
        }
        records.len()
    }

    /// Drop open records whose handle no longer designates a key.
    pub fn purge_invalid(&self, tree: &Tree) -> usize {
        let mut removed = 0;
        for slot in self.active() {
            for (j, record) in self.open_records(slot) {
                if !tree.is_key(record.handle) {
                    warn!(slot, handle = record.handle, "removing open record with invalid handle");
                    self.clear_open_record(tree, slot, j, &record);
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Reclaim dead or unresponsive clients, probing pids with the OS.
    pub fn sweep(&self, tree: &Tree, now_ms: u64, own_slot: Option<usize>) -> Vec<Reclaimed> {
        self.sweep_with(tree, now_ms, own_slot, platform::process_alive)
    }

    pub fn sweep_with<F>(&self, tree: &Tree, now_ms: u64, own_slot: Option<usize>, alive: F) -> Vec<Reclaimed>
    where
        F: Fn(u32) -> bool,
    {
        let mut reclaimed = Vec::new();
        for slot in self.active() {
            if Some(slot) == own_slot {
                continue;
            }
            let entry = self.mem.client(slot);
            let process_gone = !alive(entry.pid);
            let expired = entry.watchdog_timeout > 0
                && now_ms > entry.last_activity.saturating_add(entry.watchdog_timeout as u64);
            if !process_gone && !expired {
                continue;
            }

            let dropped = self.detach(tree, slot);
            info!(
                slot,
                client = %entry.name_str(),
                pid = entry.pid,
                process_gone,
                expired,
                dropped,
                "reclaimed client"
            );
            reclaimed.push(Reclaimed {
                slot,
                name: entry.name_str(),
                pid: entry.pid,
                dropped,
            });
        }
        reclaimed
    }

    /// Recompute every key's `notify_count` from the open records and clear
    /// exclusive bits no write record accounts for. Returns the number of keys
    /// whose metadata changed.
    pub fn fix_notify_counts(&self, tree: &Tree) -> usize {
        let mut counts: hashbrown::HashMap<u32, (u16, bool)> = hashbrown::HashMap::new();
        for slot in self.active() {
            for (_, record) in self.open_records(slot) {
                let e = counts.entry(record.handle).or_insert((0, false));
                e.0 = e.0.saturating_add(1);
                e.1 |= record.access_mode.contains(AccessMode::WRITE);
            }
        }

        let mut fixed = 0;
        for handle in tree.subtree(tree.root()) {
            let mut key = tree.mem().key(handle);
            let (count, write) = counts.get(&handle).copied().unwrap_or((0, false));
            let exclusive = key.access_mode.contains(AccessMode::EXCLUSIVE);
            if key.notify_count != count || exclusive != write {
                warn!(
                    path = %tree.path_of(handle),
                    was = key.notify_count,
                    now = count,
                    "corrected notify count"
                );
                key.notify_count = count;
                key.access_mode = if write {
                    key.access_mode.union(AccessMode::EXCLUSIVE)
                } else {
                    key.access_mode.without(AccessMode::EXCLUSIVE)
                };
                tree.mem().set_key(handle, &key);
                fixed += 1;
            }
        }
        fixed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::tests::test_tree;
    use crate::types::TypeId;

    #[test]
    fn test_attach_and_detach_recount() {
        let (_dir, region, _tree) = test_tree();
        let table = ClientTable::new(region.mem());
        let a = table.attach("a", 100, 0, 1000).unwrap();
        let b = table.attach("b", 101, 0, 1000).unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(table.num_clients(), 2);
        assert_eq!(region.mem().u32_at(header_field::MAX_CLIENT_INDEX), 2);

        table.detach(&Tree::new(region.mem(), true), b);
        assert_eq!(table.num_clients(), 1);
        assert_eq!(region.mem().u32_at(header_field::MAX_CLIENT_INDEX), 1);
        assert_eq!(table.attach("c", 102, 0, 1000).unwrap(), 1);
    }

    #[test]
    fn test_client_table_full() {
        let (_dir, region, _tree) = test_tree();
        let table = ClientTable::new(region.mem());
        for i in 0..MAX_CLIENTS {
            table.attach("x", 1000 + i as u32, 0, 0).unwrap();
        }
        assert!(matches!(
            table.attach("y", 5, 0, 0),
            Err(OdbError::ClientTableFull { .. })
        ));
    }

    #[test]
    fn test_write_record_is_exclusive() {
        let (_dir, region, tree) = test_tree();
        let table = ClientTable::new(region.mem());
        let h = tree.create(tree.root(), "/x", TypeId::Int32).unwrap();
        let a = table.attach("a", 1, 0, 0).unwrap();
        let b = table.attach("b", 2, 0, 0).unwrap();

        table.add_open_record(&tree, a, h, AccessMode::READ | AccessMode::WRITE).unwrap();
        assert!(table.holds_write(a, h));
        assert!(tree.key(h).unwrap().access_mode.contains(AccessMode::EXCLUSIVE));
        assert!(matches!(
            table.add_open_record(&tree, b, h, AccessMode::WRITE),
            Err(OdbError::NoAccess { .. })
        ));
        table.add_open_record(&tree, b, h, AccessMode::READ).unwrap();
        assert_eq!(tree.key(h).unwrap().notify_count, 2);

        assert!(table.remove_open_record(&tree, a, h, false));
        assert!(!tree.key(h).unwrap().access_mode.contains(AccessMode::EXCLUSIVE));
        assert_eq!(tree.key(h).unwrap().notify_count, 1);
    }

    #[test]
    fn test_dead_client_is_reclaimed() {
        let (_dir, region, tree) = test_tree();
        let table = ClientTable::new(region.mem());
        let h = tree.create(tree.root(), "/Equipment/X/Settings/Value", TypeId::Double).unwrap();
        let me = table.attach("me", 10, 1_000, 10_000).unwrap();
        let ghost = table.attach("ghost", 999_999, 1_000, 10_000).unwrap();
        table.add_open_record(&tree, ghost, h, AccessMode::READ | AccessMode::WRITE).unwrap();
        assert_eq!(tree.key(h).unwrap().notify_count, 1);

        let reclaimed = table.sweep_with(&tree, 2_000, Some(me), |pid| pid != 999_999);
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].dropped, 1);
        assert_eq!(tree.key(h).unwrap().notify_count, 0);
        assert!(!tree.key(h).unwrap().access_mode.contains(AccessMode::EXCLUSIVE));
        assert!(table.entry(ghost).is_free());
        assert_eq!(table.entry(ghost), ClientEntry::from_bytes(&[0u8; 64]));
        assert_eq!(table.num_clients(), 1);
    }

    #[test]
    fn test_watchdog_expiry_is_reclaimed() {
        let (_dir, region, tree) = test_tree();
        let table = ClientTable::new(region.mem());
        let idle = table.attach("idle", 10, 1_000, 500).unwrap();
        let forever = table.attach("forever", 11, 1_000, 0).unwrap();

        assert!(table.sweep_with(&tree, 1_400, None, |_| true).is_empty());
        let reclaimed = table.sweep_with(&tree, 1_600, None, |_| true);
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].slot, idle);
        assert!(!table.entry(forever).is_free());
    }

    #[test]
    fn test_record_holder_ignores_watches() {
        let (_dir, region, tree) = test_tree();
        let table = ClientTable::new(region.mem());
        let arr = tree.create(tree.root(), "/S/Arr", TypeId::Double).unwrap();
        let s = tree.find(tree.root(), "/S").unwrap();
        let a = table.attach("a", 1, 0, 0).unwrap();

        table.add_open_record(&tree, a, s, AccessMode::READ | AccessMode::WATCH).unwrap();
        assert_eq!(table.record_holder(&tree, arr), None);
        table.add_open_record(&tree, a, s, AccessMode::READ).unwrap();
        assert_eq!(table.record_holder(&tree, arr), Some(s));
        assert!(table.remove_open_record(&tree, a, s, false));
        assert_eq!(table.record_holder(&tree, arr), None);
    }

    #[test]
    fn test_owned_by_checks_pid_and_name() {
        let (_dir, region, tree) = test_tree();
        let table = ClientTable::new(region.mem());
        let a = table.attach("a", 1, 0, 0).unwrap();
        assert!(table.owned_by(a, 1, "a"));
        assert!(!table.owned_by(a, 2, "a"));
        assert!(!table.owned_by(a, 1, "b"));

        table.detach(&tree, a);
        assert!(!table.owned_by(a, 1, "a"));
        let b = table.attach("b", 2, 0, 0).unwrap();
        assert_eq!(a, b);
        assert!(!table.owned_by(b, 1, "a"));
    }

    #[test]
    fn test_fix_notify_counts() {
        let (_dir, region, tree) = test_tree();
        let table = ClientTable::new(region.mem());
        let h = tree.create(tree.root(), "/x", TypeId::Int32).unwrap();
        let a = table.attach("a", 1, 0, 0).unwrap();
        table.add_open_record(&tree, a, h, AccessMode::READ).unwrap();

        tree.adjust_notify(h, 5);
        assert_eq!(table.fix_notify_counts(&tree), 1);
        assert_eq!(tree.key(h).unwrap().notify_count, 1);
        assert_eq!(table.fix_notify_counts(&tree), 0);
    }
}
