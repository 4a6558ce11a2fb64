//! Hot-link notification routing
//!
//! A mutation of key K is reported to every open record on K or on one of
//! K's ancestors. Notifications are computed while the database lock is
//! held and delivered after it is released:
//!
//! - attachments living in this process have an inbox in a process-wide
//!   registry, drained by `Database::poll`
//! - attachments of other processes are handed to a [`RemoteTransport`],
//!   when one is installed
//!
//! Observers registered with a record or watch are either a callback or a
//! channel sender; both receive [`Event`]s from `poll`.

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use hashbrown::HashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::client::ClientTable;
use crate::error::OdbResult;
use crate::tree::Tree;
use crate::types::AccessMode;

/// One hot-link message: `watched` is the key the observer registered on,
/// `mutated` the key that changed, `index` the array element or -1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Region file the notification belongs to
    pub region: PathBuf,
    /// Client slot of the receiver
    pub slot: usize,
    pub watched: u32,
    pub mutated: u32,
    pub index: i32,
    /// True when addressed to a watch rather than a record
    pub watch: bool,
}

/// Carries notifications to attachments in other processes.
pub trait RemoteTransport: Send + Sync {
    fn send(&self, pid: u32, client: &str, notification: &Notification) -> OdbResult<()>;
}

/// What an observer receives.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A record changed; `data` is the refreshed local copy
    Record { handle: u32, data: Vec<u8> },
    /// A watched key or one of its descendants changed
    Watch { watched: u32, mutated: u32, index: i32 },
}

/// Receiver of events for one record or watch.
#[derive(Clone)]
pub enum Observer {
    Callback(Arc<dyn Fn(&Event) + Send + Sync>),
    Channel(Sender<Event>),
}

impl Observer {
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        Observer::Callback(Arc::new(f))
    }

    pub(crate) fn dispatch(&self, event: Event) {
        match self {
            Observer::Callback(f) => f(&event),
            Observer::Channel(tx) => {
                if tx.send(event).is_err() {
                    debug!("observer channel closed, event dropped");
                }
            }
        }
    }
}

impl fmt::Debug for Observer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Observer::Callback(_) => f.write_str("Observer::Callback"),
            Observer::Channel(_) => f.write_str("Observer::Channel"),
        }
    }
}

pub(crate) type Inbox = Arc<Mutex<VecDeque<Notification>>>;

static INBOXES: Lazy<Mutex<HashMap<(PathBuf, usize), Inbox>>> = Lazy::new(|| Mutex::new(HashMap::new()));

pub(crate) fn register(region: &Path, slot: usize) -> Inbox {
    let inbox: Inbox = Arc::new(Mutex::new(VecDeque::new()));
    INBOXES
        .lock()
        .insert((region.to_path_buf(), slot), Arc::clone(&inbox));
    inbox
}

/// Remove `inbox` from the registry. An entry registered since by a newer
/// owner of the same slot is left in place.
pub(crate) fn unregister(region: &Path, slot: usize, inbox: &Inbox) {
    let key = (region.to_path_buf(), slot);
    let mut inboxes = INBOXES.lock();
    if inboxes.get(&key).map_or(false, |current| Arc::ptr_eq(current, inbox)) {
        inboxes.remove(&key);
    }
}

/// A notification plus the receiver's identity, computed under the lock.
#[derive(Debug, Clone)]
pub(crate) struct Pending {
    pub pid: u32,
    pub client: String,
    pub notification: Notification,
}

/// Open records affected by a change of `mutated`. Caller holds the lock.
pub(crate) fn collect(tree: &Tree, region: &Path, mutated: u32, index: i32) -> Vec<Pending> {
    let table = ClientTable::new(tree.mem());
    let mut out = Vec::new();
    let mut slots: Option<Vec<usize>> = None;

    for watched in tree.ancestors(mutated) {
        if tree.mem().key(watched).notify_count == 0 {
            continue;
        }
        let slots = slots.get_or_insert_with(|| table.active());
        for &slot in slots.iter() {
            let entry = table.entry(slot);
            for (_, record) in table.open_records(slot) {
                if record.handle != watched {
                    continue;
                }
                out.push(Pending {
                    pid: entry.pid,
                    client: entry.name_str(),
                    notification: Notification {
                        region: region.to_path_buf(),
                        slot,
                        watched,
                        mutated,
                        index,
                        watch: record.access_mode.contains(AccessMode::WATCH),
                    },
                });
            }
        }
    }
    out
}

/// Route collected notifications. Called without the database lock.
pub(crate) fn deliver(pending: Vec<Pending>, transport: Option<&dyn RemoteTransport>) {
    let own_pid = crate::platform::current_pid();
    for p in pending {
        let key = (p.notification.region.clone(), p.notification.slot);
        let inbox = INBOXES.lock().get(&key).cloned();
        match inbox {
            Some(inbox) => {
                trace!(slot = p.notification.slot, watched = p.notification.watched, "local notification");
                inbox.lock().push_back(p.notification);
            }
            None if p.pid == own_pid => {
                debug!(slot = p.notification.slot, "no inbox for local client, notification dropped");
            }
            None => match transport {
                Some(transport) => {
                    trace!(pid = p.pid, client = %p.client, "remote notification");
                    if let Err(e) = transport.send(p.pid, &p.client, &p.notification) {
                        debug!(pid = p.pid, error = %e, "remote notification failed");
                    }
                }
                None => {
                    debug!(pid = p.pid, client = %p.client, "no remote transport, notification dropped");
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::tests::test_tree;
    use crate::types::TypeId;

    #[test]
    fn test_collect_walks_ancestors_only() {
        let (dir, region, tree) = test_tree();
        let path = dir.path().join("tree.shm");
        let table = ClientTable::new(region.mem());
        let value = tree
            .create(tree.root(), "/Equipment/X/Settings/Value", TypeId::Double)
            .unwrap();
        let settings = tree.find(tree.root(), "/Equipment/X/Settings").unwrap();
        let other = tree.create(tree.root(), "/Other/Y", TypeId::Int32).unwrap();

        let owner = table.attach("owner", 1, 0, 0).unwrap();
        let bystander = table.attach("bystander", 2, 0, 0).unwrap();
        table.add_open_record(&tree, owner, settings, AccessMode::READ).unwrap();
        table.add_open_record(&tree, bystander, other, AccessMode::READ).unwrap();

        let pending = collect(&tree, &path, value, -1);
        assert_eq!(pending.len(), 1);
        let n = &pending[0].notification;
        assert_eq!((n.slot, n.watched, n.mutated, n.index), (owner, settings, value, -1));
        assert!(!n.watch);
    }

    #[test]
    fn test_deliver_to_registered_inbox() {
        let (dir, region, tree) = test_tree();
        let path = dir.path().join("tree.shm");
        let table = ClientTable::new(region.mem());
        let h = tree.create(tree.root(), "/v", TypeId::Int32).unwrap();
        let slot = table
            .attach("me", crate::platform::current_pid(), 0, 0)
            .unwrap();
        table
            .add_open_record(&tree, slot, h, AccessMode::READ | AccessMode::WATCH)
            .unwrap();

        let inbox = register(&path, slot);
        deliver(collect(&tree, &path, h, 3), None);
        let got: Vec<_> = inbox.lock().drain(..).collect();
        assert_eq!(got.len(), 1);
        assert!(got[0].watch);
        assert_eq!(got[0].index, 3);
        unregister(&path, slot, &inbox);
    }

    #[test]
    fn test_unregister_keeps_newer_inbox() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tree.shm");
        let stale = register(&path, 0);
        let current = register(&path, 0);
        unregister(&path, 0, &stale);
        assert!(INBOXES.lock().get(&(path.clone(), 0)).map_or(false, |i| Arc::ptr_eq(i, &current)));
        unregister(&path, 0, &current);
        assert!(INBOXES.lock().get(&(path, 0)).is_none());
    }

    #[test]
    fn test_remote_transport_receives_foreign_pids() {
        struct Recorder(Mutex<Vec<u32>>);
        impl RemoteTransport for Recorder {
            fn send(&self, pid: u32, _client: &str, _n: &Notification) -> OdbResult<()> {
                self.0.lock().push(pid);
                Ok(())
            }
        }

        let (dir, region, tree) = test_tree();
        let path = dir.path().join("tree.shm");
        let table = ClientTable::new(region.mem());
        let h = tree.create(tree.root(), "/v", TypeId::Int32).unwrap();
        let slot = table.attach("far", 4_000_000, 0, 0).unwrap();
        table.add_open_record(&tree, slot, h, AccessMode::READ).unwrap();

        let recorder = Recorder(Mutex::new(Vec::new()));
        deliver(collect(&tree, &path, h, -1), Some(&recorder));
        assert_eq!(*recorder.0.lock(), vec![4_000_000]);
    }
}
