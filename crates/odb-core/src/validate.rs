//! Consistency walk with in-place repair
//!
//! Checks the header, both free lists and the whole tree. Each finding is
//! one of three kinds:
//!
//! - repaired: metadata was clamped or relabelled in place (sizes, names,
//!   access bits, counts, timestamps, stale open records)
//! - warning: suspicious but left alone (fill ratio, non-UTF-8 text,
//!   self-referencing links)
//! - fatal: the subtree below the finding is not walked (bad type id,
//!   broken back-reference, chain or payload outside its area)
//!
//! Payload bytes are never touched. A header with the wrong magic or
//! version is an error, and nothing else is checked.

use std::fmt;

use tracing::warn;

use crate::alloc::FreeList;
use crate::client::ClientTable;
use crate::error::{OdbError, OdbResult};
use crate::format::{Key, ALIGN, KEYLIST_SIZE, KEY_SIZE, MAX_DEPTH, NAME_LENGTH, REGION_MAGIC, REGION_VERSION};
use crate::platform::now_secs;
use crate::region::Mem;
use crate::tree::Tree;
use crate::types::{AccessMode, TypeId};

/// Timestamps further than this from now are reset
const TIMESTAMP_WINDOW_SECS: u32 = 10 * 365 * 24 * 3600;

/// Free-list fill ratio above which a warning is reported
const FILL_WARNING_RATIO: f64 = 0.9;

/// Outcome of one validation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub repaired: Vec<String>,
    pub warnings: Vec<String>,
    pub fatal: Vec<String>,
}

impl ValidationReport {
    /// True when nothing fatal was found.
    pub fn is_ok(&self) -> bool {
        self.fatal.is_empty()
    }

    fn repair(&mut self, path: &str, what: String) {
        warn!(path, repair = %what, "repaired database metadata");
        self.repaired.push(format!("{}: {}", path, what));
    }

    fn warn(&mut self, path: &str, what: String) {
        warn!(path, warning = %what, "database validation warning");
        self.warnings.push(format!("{}: {}", path, what));
    }

    fn fatal(&mut self, path: &str, what: String) {
        tracing::error!(path, corruption = %what, "unrepairable database corruption");
        self.fatal.push(format!("{}: {}", path, what));
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} repaired, {} warnings, {} fatal",
            self.repaired.len(),
            self.warnings.len(),
            self.fatal.len()
        )
    }
}

/// Validate and repair the region behind `tree`. Caller holds the lock.
pub(crate) fn validate(tree: &Tree) -> OdbResult<ValidationReport> {
    let mem = tree.mem();
    check_header(mem)?;

    let mut report = ValidationReport::default();
    check_free_list(&tree.key_area(), &mut report);
    check_free_list(&tree.data_area(), &mut report);

    let root = tree.root();
    if !tree.is_key(root) || mem.key(root).type_id != TypeId::Key.as_u32() {
        report.fatal("/", format!("root key at {} is not a directory", root));
        return Ok(report);
    }
    let mut walker = Walker {
        tree,
        now: now_secs(),
        report: &mut report,
    };
    walker.walk_dir(root, "/", 0);

    let purged = ClientTable::new(mem).purge_invalid(tree);
    if purged > 0 {
        report.repair("client table", format!("removed {} open records with invalid handles", purged));
    }
    Ok(report)
}

pub(crate) fn check_header(mem: Mem) -> OdbResult<()> {
    let header = mem.header();
    if header.magic != REGION_MAGIC {
        return Err(OdbError::Corrupted {
            offset: 0,
            reason: "region magic mismatch".into(),
        });
    }
    if header.version != REGION_VERSION {
        return Err(OdbError::VersionMismatch {
            found: header.version,
            expected: REGION_VERSION,
        });
    }
    if header.region_size() > mem.len() {
        return Err(OdbError::Corrupted {
            offset: 0,
            reason: format!(
                "header describes {} bytes but region has {}",
                header.region_size(),
                mem.len()
            ),
        });
    }
    Ok(())
}

fn check_free_list(list: &FreeList, report: &mut ValidationReport) {
    let label = format!("{} area", list.area().name());
    match list.free_bytes() {
        Ok(free) => {
            let used = 1.0 - free as f64 / list.area_size() as f64;
            if used > FILL_WARNING_RATIO {
                report.warn(&label, format!("{:.1}% used", used * 100.0));
            }
        }
        Err(e) => report.fatal(&label, e.to_string()),
    }
}

struct Walker<'a> {
    tree: &'a Tree,
    now: u32,
    report: &'a mut ValidationReport,
}

impl Walker<'_> {
    fn walk_dir(&mut self, handle: u32, path: &str, depth: usize) {
        let mem = self.tree.mem();
        let keys = self.tree.key_area();
        let key = mem.key(handle);

        if key.data % ALIGN != 0 || !keys.contains(key.data, KEYLIST_SIZE) {
            self.report
                .fatal(path, format!("key list offset {} outside index area", key.data));
            return;
        }
        let mut list = mem.keylist(key.data);
        if list.parent != handle {
            self.report.fatal(
                path,
                format!("key list points back to {} instead of {}", list.parent, handle),
            );
            return;
        }
        if depth >= MAX_DEPTH {
            self.report.fatal(path, format!("deeper than {} levels", MAX_DEPTH));
            return;
        }

        let limit = (keys.area_size() / KEY_SIZE) as usize;
        let mut children = Vec::new();
        let mut cur = list.first_key;
        while cur != 0 {
            if cur % ALIGN != 0 || !keys.contains(cur, KEY_SIZE) {
                self.report
                    .fatal(path, format!("child offset {} outside index area", cur));
                return;
            }
            if children.len() >= limit || children.contains(&cur) {
                self.report.fatal(path, "cycle in child chain".into());
                return;
            }
            children.push(cur);
            cur = mem.key(cur).next_key;
        }

        if list.num_keys as usize != children.len() {
            self.report.repair(
                path,
                format!("num_keys {} corrected to {}", list.num_keys, children.len()),
            );
            list.num_keys = children.len() as u32;
            mem.set_keylist(key.data, &list);
        }

        for child in children {
            let mut child_key = mem.key(child);
            if child_key.parent_keylist != key.data {
                self.report.fatal(
                    path,
                    format!("child at {} does not point back to its key list", child),
                );
                continue;
            }
            let child_path = join(path, &child_key.name_str());
            if !self.check_key(child, &mut child_key, &child_path) {
                continue;
            }
            if child_key.type_id == TypeId::Key.as_u32() {
                self.walk_dir(child, &child_path, depth + 1);
            }
        }
    }

    /// Check one key's own fields. Returns false on a fatal finding.
    fn check_key(&mut self, handle: u32, key: &mut Key, path: &str) -> bool {
        let mem = self.tree.mem();
        let tid = match TypeId::from_u32(key.type_id) {
            Some(tid) => tid,
            None => {
                self.report.fatal(path, format!("type id {} out of range", key.type_id));
                return false;
            }
        };
        let mut changed = false;

        if !valid_name(key.name_bytes()) {
            let placeholder = format!("Corrupted_{}", handle);
            self.report.repair(path, format!("invalid name replaced by {}", placeholder));
            key.set_name(&placeholder);
            changed = true;
        }

        if !key.access_mode.is_valid_key_mode() {
            let masked = AccessMode(key.access_mode.bits() & AccessMode::KEY_MASK);
            self.report.repair(
                path,
                format!("access mode 0x{:x} masked to 0x{:x}", key.access_mode.bits(), masked.bits()),
            );
            key.access_mode = masked;
            changed = true;
        }

        if key.last_written.abs_diff(self.now) > TIMESTAMP_WINDOW_SECS {
            self.report
                .repair(path, format!("timestamp {} reset to now", key.last_written));
            key.last_written = self.now;
            changed = true;
        }

        if tid.item_size() > 0 && key.item_size != tid.item_size() {
            self.report.repair(
                path,
                format!("item_size {} corrected to {}", key.item_size, tid.item_size()),
            );
            key.item_size = tid.item_size();
            changed = true;
        }

        let expected_total = key.item_size as u64 * key.num_values as u64;
        if key.total_size as u64 != expected_total && expected_total <= u32::MAX as u64 {
            self.report.repair(
                path,
                format!("total_size {} corrected to {}", key.total_size, expected_total),
            );
            key.total_size = expected_total as u32;
            changed = true;
        }

        if changed {
            mem.set_key(handle, key);
        }

        if tid.is_dir() {
            return true;
        }

        let data_area = self.tree.data_area();
        if key.total_size > 0 && (key.data == 0 || !data_area.contains(key.data, key.total_size)) {
            self.report.fatal(
                path,
                format!("payload {} (+{}) outside data area", key.data, key.total_size),
            );
            return false;
        }

        if tid.is_text() && key.total_size > 0 {
            let bytes = mem.bytes(key.data as usize, key.total_size as usize);
            let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            if self.tree.check_utf8() && std::str::from_utf8(&bytes[..end]).is_err() {
                self.report.warn(path, "string payload is not valid UTF-8".into());
            }
            if tid == TypeId::Link {
                let target = String::from_utf8_lossy(&bytes[..end]);
                let target = target.split('[').next().unwrap_or("").trim_end_matches('/');
                let own = path.to_ascii_lowercase();
                let target = target.to_ascii_lowercase();
                if own == target {
                    self.report.warn(path, "link points at itself".into());
                } else if target.is_empty() || own.starts_with(&format!("{}/", target)) {
                    self.report
                        .warn(path, format!("link points into its own ancestry ({})", target));
                }
            }
        }
        true
    }
}

fn valid_name(bytes: &[u8]) -> bool {
    if bytes.is_empty() || bytes.len() >= NAME_LENGTH {
        return false;
    }
    match std::str::from_utf8(bytes) {
        Ok(name) => !name.chars().any(|c| c == '/' || c.is_control()),
        Err(_) => false,
    }
}

fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::header_field;
    use crate::tree::tests::test_tree;

    #[test]
    fn test_fresh_tree_is_clean() {
        let (_dir, _region, tree) = test_tree();
        tree.create(tree.root(), "/a/b/c", TypeId::Double).unwrap();
        tree.create_link(tree.root(), "/l", "/a/b").unwrap();
        let report = validate(&tree).unwrap();
        assert!(report.is_ok(), "{:?}", report);
        assert!(report.repaired.is_empty(), "{:?}", report);
        assert!(report.warnings.is_empty(), "{:?}", report);
    }

    #[test]
    fn test_repairs_sizes_and_counts() {
        let (_dir, region, tree) = test_tree();
        let h = tree.create(tree.root(), "/dir/x", TypeId::Uint16).unwrap();
        let dir = tree.find(tree.root(), "/dir").unwrap();

        let mut key = region.mem().key(h);
        key.item_size = 7;
        key.total_size = 99;
        key.access_mode = AccessMode(0x8003);
        key.last_written = 5;
        region.mem().set_key(h, &key);

        let list_off = region.mem().key(dir).data;
        let mut list = region.mem().keylist(list_off);
        list.num_keys = 4;
        region.mem().set_keylist(list_off, &list);

        let report = validate(&tree).unwrap();
        assert!(report.is_ok());
        assert_eq!(report.repaired.len(), 5, "{:?}", report.repaired);

        let key = region.mem().key(h);
        assert_eq!(key.item_size, 2);
        assert_eq!(key.total_size, 2);
        assert_eq!(key.access_mode.bits(), 0x03);
        assert_eq!(tree.num_keys(dir).unwrap(), 1);

        assert!(validate(&tree).unwrap().repaired.is_empty());
    }

    #[test]
    fn test_invalid_name_gets_placeholder() {
        let (_dir, region, tree) = test_tree();
        let h = tree.create(tree.root(), "/good", TypeId::Int32).unwrap();
        let mut key = region.mem().key(h);
        key.name = [0u8; NAME_LENGTH];
        key.name[0] = 0xFF;
        region.mem().set_key(h, &key);

        let report = validate(&tree).unwrap();
        assert_eq!(report.repaired.len(), 1);
        assert_eq!(tree.find(tree.root(), &format!("/Corrupted_{}", h)).unwrap(), h);
    }

    #[test]
    fn test_bad_type_id_is_fatal_but_isolated() {
        let (_dir, region, tree) = test_tree();
        let bad = tree.create(tree.root(), "/bad", TypeId::Int32).unwrap();
        tree.create(tree.root(), "/fine/x", TypeId::Int32).unwrap();
        region.mem().set_u32(bad as usize, 77);

        let report = validate(&tree).unwrap();
        assert_eq!(report.fatal.len(), 1);
        assert!(report.fatal[0].contains("type id 77"));
        assert!(tree.find(tree.root(), "/fine/x").is_ok());
    }

    #[test]
    fn test_broken_back_reference_is_fatal() {
        let (_dir, region, tree) = test_tree();
        let d = tree.create(tree.root(), "/d", TypeId::Key).unwrap();
        let list_off = region.mem().key(d).data;
        let mut list = region.mem().keylist(list_off);
        list.parent = tree.root();
        region.mem().set_keylist(list_off, &list);

        let report = validate(&tree).unwrap();
        assert!(!report.is_ok());
    }

    #[test]
    fn test_free_list_cycle_is_fatal() {
        let (_dir, region, tree) = test_tree();
        let head = region.mem().u32_at(header_field::FIRST_FREE_DATA);
        region.mem().set_u32(head as usize + 4, head);
        let report = validate(&tree).unwrap();
        assert!(report.fatal.iter().any(|f| f.starts_with("data area")));
    }

    #[test]
    fn test_version_mismatch() {
        let (_dir, region, tree) = test_tree();
        let mut header = region.mem().header();
        header.version = REGION_VERSION + 1;
        region.mem().set_header(&header);
        assert!(matches!(validate(&tree), Err(OdbError::VersionMismatch { .. })));
    }

    #[test]
    fn test_self_link_warns() {
        let (_dir, _region, tree) = test_tree();
        tree.create(tree.root(), "/a/inner", TypeId::Int32).unwrap();
        tree.create_link(tree.root(), "/a/up", "/a").unwrap();
        let report = validate(&tree).unwrap();
        assert_eq!(report.warnings.len(), 1, "{:?}", report.warnings);
        assert!(report.is_ok());
    }
}
