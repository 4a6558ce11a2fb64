//! Database handle: one attachment to a shared region
//!
//! `Database::open` maps `<dir>/.<name>.SHM` (creating and formatting it, or
//! restoring it from the `<name>.odb` snapshot, when no live region exists),
//! validates it and claims a slot in the client table. Every attachment,
//! even a second one inside the same process, has its own mapping, lock file
//! descriptor and client slot.
//!
//! **Locking**: every public method runs under the two-layer database lock.
//! `locked` holds it across a caller-supplied closure so that read-modify-write
//! sequences are atomic with respect to all attachers.
//! **Notifications**: collected while the lock is held, delivered after it
//! is released, and dispatched to observers by `poll`.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::client::{ClientInfo, ClientTable, Reclaimed};
use crate::config::Config;
use crate::error::{OdbError, OdbResult};
use crate::format::{RegionHeader, NAME_LENGTH};
use crate::housekeeping::{start_housekeeping, HousekeepingHandle, HousekeepingStats};
use crate::lock::DbLock;
use crate::notify::{self, Inbox, Observer, Pending, RemoteTransport};
use crate::platform::{current_pid, now_millis};
use crate::record::{LocalRecord, RecordId};
use crate::region::Region;
use crate::snapshot::{read_snapshot, write_snapshot};
use crate::tree::{KeyInfo, Tree};
use crate::types::{AccessMode, TypeId};
use crate::validate::{self, ValidationReport};

/// Files backing one named region.
#[derive(Debug, Clone)]
struct RegionPaths {
    region: PathBuf,
    lock: PathBuf,
    snapshot: PathBuf,
}

impl RegionPaths {
    fn new(directory: &Path, name: &str) -> Self {
        Self {
            region: directory.join(format!(".{}.SHM", name)),
            lock: directory.join(format!(".{}.LCK", name)),
            snapshot: directory.join(format!("{}.odb", name)),
        }
    }
}

/// State shared between a `Database` and its housekeeping thread.
pub(crate) struct Shared {
    pub name: String,
    pub config: Config,
    pub region: Region,
    pub lock: DbLock,
    pub slot: usize,
    pub pid: u32,
    pub client: String,
    pub snapshot_path: PathBuf,
}

impl Shared {
    /// True while the client table still lists this attachment in its slot.
    /// Caller holds the lock.
    pub fn owns_slot(&self, table: &ClientTable) -> bool {
        table.owned_by(self.slot, self.pid, &self.client)
    }

    /// Run `f` under the database lock. Refreshes this client's activity
    /// while it still owns its slot.
    pub fn with_lock<R>(&self, f: impl FnOnce(&Tree) -> R) -> R {
        let _guard = self.lock.acquire(&self.region);
        let tree = Tree::new(self.region.mem(), self.config.check_utf8);
        let table = ClientTable::new(self.region.mem());
        if self.owns_slot(&table) {
            table.touch(self.slot, now_millis());
        }
        f(&tree)
    }

    /// Like `with_lock`, failing with `ClientReclaimed` once another
    /// client's sweep has taken this attachment's slot.
    pub fn with_client<R>(&self, f: impl FnOnce(&Tree) -> OdbResult<R>) -> OdbResult<R> {
        self.with_lock(|tree| {
            if !self.owns_slot(&ClientTable::new(tree.mem())) {
                return Err(OdbError::ClientReclaimed { slot: self.slot });
            }
            f(tree)
        })
    }

    pub fn heartbeat(&self) -> OdbResult<()> {
        self.with_client(|_| Ok(()))
    }

    /// Reclaim dead and watchdog-expired clients other than this one.
    pub fn cleanup(&self) -> Vec<Reclaimed> {
        self.with_lock(|tree| {
            let table = ClientTable::new(tree.mem());
            let own = self.owns_slot(&table).then_some(self.slot);
            table.sweep(tree, now_millis(), own)
        })
    }

    /// Snapshot the region. The image is copied under the lock and written
    /// after it is released.
    pub fn flush(&self) -> OdbResult<()> {
        let image = self.with_lock(|_| self.region.copy_out());
        self.region.sync()?;
        write_snapshot(&self.snapshot_path, &image)
    }
}

/// One attachment to a named online database region.
///
/// All methods take `&self`; a `Database` may be shared between threads.
/// Handles (`u32`) are region offsets and are valid in every attachment of
/// the same region.
pub struct Database {
    shared: Arc<Shared>,
    pub(crate) inbox: Inbox,
    pub(crate) records: Mutex<HashMap<RecordId, LocalRecord>>,
    pub(crate) watches: Mutex<HashMap<u32, Observer>>,
    pub(crate) next_record: AtomicU32,
    transport: RwLock<Option<Arc<dyn RemoteTransport>>>,
    housekeeping: Mutex<Option<HousekeepingHandle>>,
    created: bool,
    detached: AtomicBool,
}

impl Database {
    /// Attach to region `name` under `config.directory`, creating it if
    /// needed. The client name defaults to the executable name.
    pub fn open(name: &str, config: Config) -> OdbResult<Self> {
        Self::open_as(name, &default_client_name(), config)
    }

    /// Like [`Database::open`] with an explicit client name.
    pub fn open_as(name: &str, client: &str, config: Config) -> OdbResult<Self> {
        config.validate()?;
        check_region_name(name)?;
        fs::create_dir_all(&config.directory)
            .map_err(|e| OdbError::io(&config.directory, e, "Failed to create region directory"))?;

        let paths = RegionPaths::new(&config.directory, name);
        let lock = DbLock::open(&paths.lock, config.lock_timeout)?;

        lock.lock_file();
        let mapped = map_region(name, &paths, &config);
        lock.unlock_file();
        let (region, created) = mapped?;

        let pid = current_pid();
        let watchdog_ms = config.watchdog_timeout.as_millis().min(u32::MAX as u128) as u32;
        let (slot, stored_name) = {
            let _guard = lock.acquire(&region);
            let mem = region.mem();
            validate::check_header(mem)?;
            let tree = Tree::new(mem, config.check_utf8);
            if config.validate_on_attach {
                let report = validate::validate(&tree)?;
                if !report.is_ok() {
                    return Err(OdbError::Corrupted {
                        offset: 0,
                        reason: report.fatal.join("; "),
                    });
                }
            }
            let table = ClientTable::new(mem);
            table.sweep(&tree, now_millis(), None);
            let slot = table.attach(client, pid, now_millis(), watchdog_ms)?;
            (slot, table.entry(slot).name_str())
        };

        let inbox = notify::register(region.path(), slot);
        info!(region = name, client, slot, pid, created, "attached to online database");

        let shared = Shared {
            name: name.to_string(),
            config,
            region,
            lock,
            slot,
            pid,
            client: stored_name,
            snapshot_path: paths.snapshot,
        };
        Ok(Self {
            shared: Arc::new(shared),
            inbox,
            records: Mutex::new(HashMap::new()),
            watches: Mutex::new(HashMap::new()),
            next_record: AtomicU32::new(1),
            transport: RwLock::new(None),
            housekeeping: Mutex::new(None),
            created,
            detached: AtomicBool::new(false),
        })
    }

    /// True if this attachment created (or restored) the region.
    pub fn created(&self) -> bool {
        self.created
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Path of the shared region file.
    pub fn region_path(&self) -> &Path {
        self.shared.region.path()
    }

    /// This attachment's slot in the client table.
    pub fn client_slot(&self) -> usize {
        self.shared.slot
    }

    pub(crate) fn slot(&self) -> usize {
        self.shared.slot
    }

    /// Hold the database lock for the whole of `f`. Calls made on this
    /// handle inside `f` nest without blocking; other attachers wait.
    pub fn locked<R>(&self, f: impl FnOnce(&Database) -> R) -> R {
        let _guard = self.shared.lock.acquire(&self.shared.region);
        f(self)
    }

    pub(crate) fn with_tree<R>(&self, f: impl FnOnce(&Tree) -> OdbResult<R>) -> OdbResult<R> {
        self.shared.with_client(f)
    }

    /// Mutate `handle` under the lock, then notify its observers.
    pub(crate) fn write_op<R>(&self, handle: u32, index: i32, f: impl FnOnce(&Tree) -> OdbResult<R>) -> OdbResult<R> {
        let (result, pending) = self.shared.with_client(|tree| -> OdbResult<(R, Vec<Pending>)> {
            self.check_exclusive(tree, handle)?;
            let result = f(tree)?;
            let pending = notify::collect(tree, self.shared.region.path(), handle, index);
            Ok((result, pending))
        })?;
        self.deliver(pending);
        Ok(result)
    }

    /// A key, or any ancestor, opened for writing by another client cannot
    /// be written.
    fn check_exclusive(&self, tree: &Tree, handle: u32) -> OdbResult<()> {
        tree.key(handle)?;
        let table = ClientTable::new(tree.mem());
        for h in tree.ancestors(handle) {
            let key = tree.mem().key(h);
            if key.access_mode.contains(AccessMode::EXCLUSIVE) && !table.holds_write(self.shared.slot, h) {
                return Err(OdbError::NoAccess {
                    path: tree.path_of(handle),
                    reason: format!("{} is open for writing by another client", tree.path_of(h)),
                });
            }
        }
        Ok(())
    }

    fn deliver(&self, pending: Vec<Pending>) {
        if pending.is_empty() {
            return;
        }
        let transport = self.transport.read().clone();
        notify::deliver(pending, transport.as_deref());
    }

    /// Route notifications for attachers in other processes through
    /// `transport`.
    pub fn set_remote_transport(&self, transport: Arc<dyn RemoteTransport>) {
        *self.transport.write() = Some(transport);
    }

    // ------------------------------------------------------------------
    // Paths and keys
    // ------------------------------------------------------------------

    pub fn root(&self) -> u32 {
        self.shared.with_lock(|tree| tree.root())
    }

    /// Resolve `path` relative to `start` (absolute paths ignore `start`),
    /// following links.
    pub fn find(&self, start: u32, path: &str) -> OdbResult<u32> {
        self.with_tree(|tree| tree.find(start, path))
    }

    /// Like `find`, but a link in the last segment is returned itself.
    pub fn find_link(&self, start: u32, path: &str) -> OdbResult<u32> {
        self.with_tree(|tree| tree.find_link(start, path))
    }

    /// Create `path` with type `tid`, adding missing directories. Creating an
    /// existing key of the same type returns it.
    pub fn create(&self, start: u32, path: &str, tid: TypeId) -> OdbResult<u32> {
        self.with_tree(|tree| tree.create(start, path, tid))
    }

    /// Delete a key and everything below it. With `follow_links` a link's
    /// target is deleted as well.
    pub fn delete(&self, handle: u32, follow_links: bool) -> OdbResult<()> {
        self.with_tree(|tree| tree.delete(handle, follow_links))
    }

    /// The `index`-th child of `dir`, `None` past the end.
    pub fn enum_key(&self, dir: u32, index: usize) -> OdbResult<Option<u32>> {
        self.with_tree(|tree| tree.enum_key(dir, index))
    }

    /// The key after `handle` in depth-first order.
    pub fn next_key(&self, handle: u32) -> OdbResult<Option<u32>> {
        self.with_tree(|tree| tree.next_key(handle))
    }

    pub fn get_path(&self, handle: u32) -> OdbResult<String> {
        self.with_tree(|tree| {
            tree.key(handle)?;
            Ok(tree.path_of(handle))
        })
    }

    /// Parent directory; `None` for the root.
    pub fn get_parent(&self, handle: u32) -> OdbResult<Option<u32>> {
        self.with_tree(|tree| {
            tree.key(handle)?;
            Ok(tree.parent(handle))
        })
    }

    pub fn get_key(&self, handle: u32) -> OdbResult<KeyInfo> {
        self.with_tree(|tree| tree.info(handle))
    }

    pub fn num_keys(&self, dir: u32) -> OdbResult<u32> {
        self.with_tree(|tree| tree.num_keys(dir))
    }

    pub fn rename(&self, handle: u32, name: &str) -> OdbResult<()> {
        self.with_tree(|tree| tree.rename(handle, name))
    }

    pub fn set_mode(&self, handle: u32, mode: AccessMode, recursive: bool) -> OdbResult<()> {
        self.with_tree(|tree| tree.set_mode(handle, mode, recursive))
    }

    /// Create a link at `path` pointing to the absolute path `target`.
    pub fn create_link(&self, start: u32, path: &str, target: &str) -> OdbResult<u32> {
        self.with_tree(|tree| tree.create_link(start, path, target))
    }

    pub fn read_link(&self, handle: u32) -> OdbResult<String> {
        self.with_tree(|tree| tree.read_link(handle))
    }

    /// Free bytes in the (index, payload) areas.
    pub fn get_free_mem(&self) -> OdbResult<(u64, u64)> {
        self.with_tree(|tree| Ok((tree.key_area().free_bytes()?, tree.data_area().free_bytes()?)))
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Check and repair the region in place.
    pub fn validate(&self) -> OdbResult<ValidationReport> {
        self.with_tree(validate::validate)
    }

    /// Textual map of the header, both areas and the client table.
    pub fn show_mem(&self) -> OdbResult<String> {
        self.with_tree(|tree| {
            let mem = tree.mem();
            let header = mem.header();
            let table = ClientTable::new(mem);
            let mut out = String::new();
            let _ = writeln!(
                out,
                "region \"{}\" v{}: {} bytes, {} clients",
                header.name_str(),
                header.version,
                header.region_size(),
                table.num_clients()
            );
            for area in [tree.key_area(), tree.data_area()] {
                let blocks = area.blocks()?;
                let free: u64 = blocks.iter().map(|&(_, size)| size as u64).sum();
                let _ = writeln!(
                    out,
                    "{} area: offset {}, {} bytes, {} free in {} blocks",
                    area.area().name(),
                    area.start(),
                    area.area_size(),
                    free,
                    blocks.len()
                );
                for (offset, size) in blocks {
                    let _ = writeln!(out, "  free {:>10} {:>10}", offset, size);
                }
            }
            for slot in table.active() {
                let info = table.info(slot);
                let _ = writeln!(
                    out,
                    "client {:>2} \"{}\" pid {} open records {}",
                    slot,
                    info.name,
                    info.pid,
                    info.open_records.len()
                );
            }
            Ok(out)
        })
    }

    /// Every attached client with its open records.
    pub fn list_open_records(&self) -> OdbResult<Vec<ClientInfo>> {
        self.with_tree(|tree| {
            let table = ClientTable::new(tree.mem());
            Ok(table.active().into_iter().map(|slot| table.info(slot)).collect())
        })
    }

    /// Recompute notify counts and exclusive bits from the client table.
    /// Returns the number of keys corrected.
    pub fn fix_open_records(&self) -> OdbResult<usize> {
        self.with_tree(|tree| Ok(ClientTable::new(tree.mem()).fix_notify_counts(tree)))
    }

    /// Reclaim clients whose process is gone or whose watchdog expired.
    pub fn cleanup(&self) -> Vec<Reclaimed> {
        self.shared.cleanup()
    }

    /// Change this client's watchdog; zero disables expiry.
    pub fn set_watchdog(&self, timeout: Duration) -> OdbResult<()> {
        let ms = timeout.as_millis().min(u32::MAX as u128) as u32;
        self.shared.with_client(|tree| {
            ClientTable::new(tree.mem()).set_watchdog(self.shared.slot, ms);
            Ok(())
        })
    }

    /// Write a snapshot of the region to `<name>.odb`.
    pub fn flush(&self) -> OdbResult<()> {
        self.shared.flush()
    }

    // ------------------------------------------------------------------
    // Housekeeping
    // ------------------------------------------------------------------

    /// Start the background heartbeat/cleanup/flush thread. A running thread
    /// is replaced.
    pub fn start_housekeeping(&self) -> OdbResult<Arc<HousekeepingStats>> {
        let handle = start_housekeeping(Arc::clone(&self.shared))?;
        let stats = handle.stats();
        if let Some(old) = self.housekeeping.lock().replace(handle) {
            old.shutdown();
        }
        Ok(stats)
    }

    pub fn stop_housekeeping(&self) {
        if let Some(handle) = self.housekeeping.lock().take() {
            handle.shutdown();
        }
    }

    /// Detach from the region. The last client to detach writes a snapshot
    /// when `flush_on_close` is set.
    pub fn close(self) -> OdbResult<()> {
        self.detach()
    }

    fn detach(&self) -> OdbResult<()> {
        if self.detached.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop_housekeeping();
        self.records.lock().clear();
        self.watches.lock().clear();

        let shared = &self.shared;
        let (dropped, image) = shared.with_lock(|tree| {
            let table = ClientTable::new(tree.mem());
            let dropped = if shared.owns_slot(&table) {
                table.detach(tree, shared.slot)
            } else {
                warn!(region = %shared.name, slot = shared.slot, "client slot was reclaimed before detach");
                0
            };
            let last = table.num_clients() == 0;
            let image = (last && shared.config.flush_on_close).then(|| shared.region.copy_out());
            (dropped, image)
        });
        notify::unregister(shared.region.path(), shared.slot, &self.inbox);
        info!(region = %shared.name, slot = shared.slot, dropped, "detached from online database");

        if let Some(image) = image {
            shared.region.sync()?;
            write_snapshot(&shared.snapshot_path, &image)?;
        }
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.detach() {
            warn!(region = %self.shared.name, error = %e, "detach on drop failed");
        }
    }
}

/// Map the region, creating it from the snapshot or from scratch when no
/// live region file exists. Caller holds the file lock.
fn map_region(name: &str, paths: &RegionPaths, config: &Config) -> OdbResult<(Region, bool)> {
    let live = fs::metadata(&paths.region).map(|m| m.len() > 0).unwrap_or(false);
    let restored = if !live && paths.snapshot.exists() {
        Some(read_snapshot(&paths.snapshot)?)
    } else {
        None
    };
    let size = restored.as_ref().map_or(config.region_size, Vec::len);
    let (region, created) = Region::map(&paths.region, size, config.protect)?;
    if !created {
        return Ok((region, false));
    }

    match restored {
        Some(image) => {
            region.copy_in(&image)?;
            region.set_writable(true);
            let tree = Tree::new(region.mem(), config.check_utf8);
            let table = ClientTable::new(region.mem());
            for slot in table.active() {
                table.detach(&tree, slot);
            }
            table.fix_notify_counts(&tree);
            region.set_writable(false);
            info!(region = name, snapshot = %paths.snapshot.display(), "restored region from snapshot");
        }
        None => {
            region.set_writable(true);
            let (key_size, data_size) = config.area_sizes();
            region.mem().set_header(&RegionHeader::new(name, key_size, data_size));
            let formatted = Tree::new(region.mem(), config.check_utf8).format();
            region.set_writable(false);
            formatted?;
            info!(region = name, key_size, data_size, "created online database region");
        }
    }
    Ok((region, true))
}

fn check_region_name(name: &str) -> OdbResult<()> {
    let reason = if name.is_empty() {
        "region name is empty"
    } else if name.len() >= NAME_LENGTH {
        "region name too long"
    } else if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        "region name may only contain letters, digits, '_' and '-'"
    } else {
        return Ok(());
    };
    Err(OdbError::InvalidName {
        name: name.to_string(),
        reason: reason.into(),
    })
}

fn default_client_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "odb".to_string())
}
