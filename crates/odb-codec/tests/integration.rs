//! Integration tests: several attachments of one region, and subtrees
//! copied between regions through the codecs.

use std::process::Command;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use odb_codec::{load_ascii, load_json, load_xml, read_subtree, save_ascii, save_json, save_xml, Node};
use odb_core::{AccessMode, Config, Database, Event, Observer, OdbError, TypeId, Value};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn config(dir: &TempDir) -> Config {
    Config::small().with_directory(dir.path())
}

fn test_db() -> (Database, TempDir) {
    let dir = TempDir::new().unwrap();
    let db = Database::open_as("odb", "test", config(&dir)).unwrap();
    (db, dir)
}

/// `/Equipment/Test` with a few typed keys, a subdirectory and a link.
fn populate(db: &Database) -> u32 {
    let root = db.root();
    let event_id = db.create(root, "/Equipment/Test/Common/Event ID", TypeId::Uint16).unwrap();
    db.set_value(event_id, &7u16).unwrap();

    let buffer = db.create(root, "/Equipment/Test/Common/Buffer", TypeId::String).unwrap();
    db.set_values(buffer, TypeId::String, &[Value::Str("SYSTEM".into())], 32).unwrap();

    let gains = db.create(root, "/Equipment/Test/Settings/Gains", TypeId::Double).unwrap();
    db.set_array(gains, &[1.5f64, -0.25, 1e-3]).unwrap();

    let enabled = db.create(root, "/Equipment/Test/Settings/Enabled", TypeId::Bool).unwrap();
    db.set_value(enabled, &true).unwrap();

    let names = db.create(root, "/Equipment/Test/Settings/Names", TypeId::String).unwrap();
    db.set_array(names, &["left".to_string(), "right & <up>".to_string()]).unwrap();

    db.create(root, "/Equipment/Test/Empty", TypeId::Key).unwrap();
    db.create_link(root, "/Equipment/Test/Alias", "/Equipment/Test/Common").unwrap();
    db.find(root, "/Equipment/Test").unwrap()
}

fn fresh_target(dir: &TempDir) -> (Database, u32) {
    let db = Database::open_as("copy", "test", config(dir)).unwrap();
    let target = db.create(db.root(), "/Equipment/Test", TypeId::Key).unwrap();
    (db, target)
}

fn children(node: Node) -> Vec<Node> {
    match node {
        Node::Dir { children, .. } => children,
        other => panic!("expected a directory, got {:?}", other),
    }
}

// ---------------------------------------------------------------------------
// Codecs
// ---------------------------------------------------------------------------

#[test]
fn test_ascii_export_reimport_into_fresh_region() {
    let (db, dir) = test_db();
    let test = populate(&db);
    let text = save_ascii(&db, test).unwrap();
    assert!(text.contains("[Common]\nEvent ID = WORD : 7\nBuffer = STRING : [32] SYSTEM\n"));

    let (copy, target) = fresh_target(&dir);
    load_ascii(&copy, target, &text).unwrap();

    let event_id = copy.find(copy.root(), "/Equipment/Test/Common/Event ID").unwrap();
    assert_eq!(copy.get_key(event_id).unwrap().type_id, TypeId::Uint16);
    assert_eq!(copy.get_value::<u16>(event_id).unwrap(), 7);

    let gains = copy.find(copy.root(), "/Equipment/Test/Settings/Gains").unwrap();
    assert_eq!(copy.get_array::<f64>(gains).unwrap(), vec![1.5, -0.25, 1e-3]);

    let alias = copy.find_link(copy.root(), "/Equipment/Test/Alias").unwrap();
    assert_eq!(copy.read_link(alias).unwrap(), "/Equipment/Test/Common");
    assert_eq!(save_ascii(&copy, target).unwrap(), text);
}

#[test]
fn test_xml_export_reimport_into_fresh_region() {
    let (db, dir) = test_db();
    let test = populate(&db);
    let xml = save_xml(&db, test).unwrap();
    assert!(xml.contains("right &amp; &lt;up&gt;"));

    let (copy, target) = fresh_target(&dir);
    load_xml(&copy, target, &xml).unwrap();
    assert_eq!(
        children(read_subtree(&copy, target).unwrap()),
        children(read_subtree(&db, test).unwrap())
    );
}

#[test]
fn test_json_export_reimport_into_fresh_region() {
    let (db, dir) = test_db();
    let test = populate(&db);
    let json = save_json(&db, test).unwrap();

    let (copy, target) = fresh_target(&dir);
    load_json(&copy, target, &json).unwrap();
    assert_eq!(
        children(read_subtree(&copy, target).unwrap()),
        children(read_subtree(&db, test).unwrap())
    );
}

#[test]
fn test_load_overwrites_existing_values() {
    let (db, _dir) = test_db();
    let h = db.create(db.root(), "/Run/Number", TypeId::Int32).unwrap();
    db.set_value(h, &1i32).unwrap();

    let run = db.find(db.root(), "/Run").unwrap();
    load_ascii(&db, run, "[.]\nNumber = INT : 42\n").unwrap();
    assert_eq!(db.get_value::<i32>(h).unwrap(), 42);

    let err = load_ascii(&db, run, "[.]\nNumber = DOUBLE : 1.0\n").unwrap_err();
    assert!(matches!(err, odb_codec::CodecError::Odb(OdbError::TypeMismatch { .. })));
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[test]
fn test_notification_reaches_only_the_owner() {
    let dir = TempDir::new().unwrap();
    let writer = Database::open_as("odb", "writer", config(&dir)).unwrap();
    let owner = Database::open_as("odb", "owner", config(&dir)).unwrap();
    let bystander = Database::open_as("odb", "bystander", config(&dir)).unwrap();

    let root = writer.root();
    let value = writer
        .create(root, "/Equipment/X/Settings/Value", TypeId::Double)
        .unwrap();
    let settings = writer.find(root, "/Equipment/X/Settings").unwrap();
    let other = writer.create(root, "/Other/Y", TypeId::Int32).unwrap();

    let (owner_tx, owner_rx) = mpsc::channel();
    let size = owner.get_record_size(settings).unwrap();
    owner
        .open_record(settings, size, AccessMode::READ, Some(Observer::Channel(owner_tx)))
        .unwrap();

    let (other_tx, other_rx) = mpsc::channel();
    bystander
        .open_record(other, 4, AccessMode::READ, Some(Observer::Channel(other_tx)))
        .unwrap();

    writer.set_value(value, &3.25f64).unwrap();

    assert_eq!(owner.poll().unwrap(), 1);
    assert_eq!(bystander.poll().unwrap(), 0);
    assert_eq!(writer.poll().unwrap(), 0);

    let events: Vec<Event> = owner_rx.try_iter().collect();
    assert_eq!(events.len(), 1);
    match &events[0] {
        Event::Record { handle, data } => {
            assert_eq!(*handle, settings);
            assert_eq!(data.as_slice(), &3.25f64.to_le_bytes());
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(other_rx.try_iter().count(), 0);
}

// ---------------------------------------------------------------------------
// Locking
// ---------------------------------------------------------------------------

#[test]
fn test_two_attachments_increment_under_lock() {
    const INCREMENTS: u32 = 5_000;

    let dir = TempDir::new().unwrap();
    let config = config(&dir).with_lock_timeout(Duration::from_secs(60));
    let first = Database::open_as("odb", "first", config.clone()).unwrap();
    let second = Database::open_as("odb", "second", config).unwrap();
    let counter = first.create(first.root(), "/Counter", TypeId::Uint32).unwrap();

    thread::scope(|s| {
        for db in [&first, &second] {
            s.spawn(move || {
                for _ in 0..INCREMENTS {
                    db.locked(|db| {
                        let v = db.get_value::<u32>(counter).unwrap();
                        db.set_value(counter, &(v + 1)).unwrap();
                    });
                }
            });
        }
    });

    assert_eq!(first.get_value::<u32>(counter).unwrap(), 10_000);
    assert_eq!(second.get_value::<u32>(counter).unwrap(), 10_000);
}

/// Set in the environment of child processes spawned by
/// `test_two_processes_increment_under_lock`: the region directory.
const CHILD_REGION_DIR: &str = "ODB_TEST_CHILD_REGION_DIR";
const CHILD_INCREMENTS: u32 = 5_000;

/// Runs only inside a child process; a no-op in a normal test run.
#[test]
fn child_increments_counter() {
    let Ok(dir) = std::env::var(CHILD_REGION_DIR) else {
        return;
    };
    let config = Config::small()
        .with_directory(dir)
        .with_lock_timeout(Duration::from_secs(60));
    let db = Database::open_as("odb", "child", config).unwrap();
    let counter = db.find(db.root(), "/Counter").unwrap();
    for _ in 0..CHILD_INCREMENTS {
        db.locked(|db| {
            let v = db.get_value::<u32>(counter).unwrap();
            db.set_value(counter, &(v + 1)).unwrap();
        });
    }
}

#[test]
fn test_two_processes_increment_under_lock() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir)
        .with_lock_timeout(Duration::from_secs(60))
        .with_watchdog_timeout(Duration::ZERO);
    let db = Database::open_as("odb", "parent", config).unwrap();
    let counter = db.create(db.root(), "/Counter", TypeId::Uint32).unwrap();

    let exe = std::env::current_exe().unwrap();
    let children: Vec<_> = (0..2)
        .map(|_| {
            Command::new(&exe)
                .args(["--exact", "child_increments_counter", "--nocapture", "--test-threads=1"])
                .env(CHILD_REGION_DIR, dir.path())
                .spawn()
                .unwrap()
        })
        .collect();
    for mut child in children {
        assert!(child.wait().unwrap().success());
    }

    assert_eq!(db.get_value::<u32>(counter).unwrap(), 2 * CHILD_INCREMENTS);
    assert_eq!(db.list_open_records().unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Paths and validation
// ---------------------------------------------------------------------------

#[test]
fn test_create_is_idempotent() {
    let (db, _dir) = test_db();
    let root = db.root();
    let a = db.create(root, "/A/B/C", TypeId::Float).unwrap();
    let b = db.create(root, "/a/b/c", TypeId::Float).unwrap();
    assert_eq!(a, b);
    assert_eq!(db.num_keys(db.find(root, "/A").unwrap()).unwrap(), 1);
    assert_eq!(db.get_path(a).unwrap(), "/A/B/C");
    assert!(matches!(
        db.create(root, "/A/B/C", TypeId::Int32),
        Err(OdbError::TypeMismatch { .. })
    ));
}

#[test]
fn test_validate_clean_after_create_and_delete() {
    let (db, _dir) = test_db();
    let root = db.root();
    let free_before = db.get_free_mem().unwrap();

    for i in 0..50i32 {
        let h = db.create(root, &format!("/Runs/Run{}/Number", i), TypeId::Int32).unwrap();
        db.set_value(h, &i).unwrap();
        let s = db.create(root, &format!("/Runs/Run{}/Comment", i), TypeId::String).unwrap();
        db.set_value(s, &format!("run number {}", i)).unwrap();
    }
    for i in (0..50).step_by(2) {
        let h = db.find(root, &format!("/Runs/Run{}", i)).unwrap();
        db.delete(h, false).unwrap();
    }

    let report = db.validate().unwrap();
    assert!(report.is_ok(), "{}", report);
    assert!(report.repaired.is_empty(), "{}", report);
    assert_eq!(db.num_keys(db.find(root, "/Runs").unwrap()).unwrap(), 25);

    db.delete(db.find(root, "/Runs").unwrap(), false).unwrap();
    assert_eq!(db.get_free_mem().unwrap(), free_before);
    assert!(db.validate().unwrap().is_ok());
}
