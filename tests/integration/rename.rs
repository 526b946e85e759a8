use std::sync::Arc;

use bucketfs::backend::memory::{MemoryStore, Op};
use bucketfs::backend::Backend;
use bucketfs::error::FsError;
use bucketfs::fs::mount::Mount;

use crate::helpers::{pid, Fixture, ROOT_ID};

#[test]
fn rename_moves_the_blob_and_keeps_the_inode() {
    let t = Fixture::new();
    t.store.insert("a", "1");
    let ino = t.lookup_path("a");

    t.fs.rename(ROOT_ID, "a", ROOT_ID, "b").unwrap();
    assert!(!t.store.contains("a"));
    assert_eq!(t.store.body("b").unwrap(), b"1");
    assert_eq!(t.store.calls(Op::Rename), 1);

    t.store.reset_counters();
    assert_eq!(t.fs.lookup(ROOT_ID, "b").unwrap().ino(), ino);
    assert_eq!(t.store.total_calls(), 0);
    assert_eq!(t.fs.inodes.get(ino).unwrap().path(), "/b");
}

#[test]
fn stores_without_rename_copy_then_delete() {
    let t = Fixture::with(MemoryStore::new("test").without_rename(), |_| {});
    t.store.insert("a", "1");
    t.lookup_path("a");

    t.fs.rename(ROOT_ID, "a", ROOT_ID, "b").unwrap();
    assert_eq!(t.store.calls(Op::Copy), 1);
    assert_eq!(t.store.calls(Op::Delete), 1);
    assert_eq!(t.store.keys(), ["b"]);
}

#[test]
fn rename_over_an_existing_file_replaces_it() {
    let t = Fixture::new();
    t.store.insert("a", "new");
    t.store.insert("b", "old");
    let a = t.lookup_path("a");
    let b = t.lookup_path("b");

    t.fs.rename(ROOT_ID, "a", ROOT_ID, "b").unwrap();
    assert_eq!(t.store.body("b").unwrap(), b"new");
    assert_eq!(t.fs.lookup(ROOT_ID, "b").unwrap().ino(), a);
    assert!(t.fs.inodes.get(b).unwrap().is_detached());
}

#[test]
fn unflushed_file_renames_locally() {
    let t = Fixture::new();
    let (_, fh) = t.fs.create(ROOT_ID, "draft", pid()).unwrap();
    t.fs.write(fh, 0, b"text").unwrap();

    t.fs.rename(ROOT_ID, "draft", ROOT_ID, "final").unwrap();
    t.fs.release(fh).unwrap();
    assert_eq!(t.store.keys(), ["final"]);
}

#[test]
fn missing_source_is_enoent() {
    let t = Fixture::new();
    t.store.insert("a", "1");
    t.lookup_path("a");
    t.store.remove("a");
    let err = t.fs.rename(ROOT_ID, "a", ROOT_ID, "b").unwrap_err();
    assert_eq!(err.errno(), libc::ENOENT);
}

#[test]
fn directory_rename_moves_every_key() {
    let t = Fixture::with(MemoryStore::new("test").without_rename(), |_| {});
    for key in ["d/", "d/x", "d/sub/y"] {
        t.store.insert(key, "1");
    }
    let d = t.lookup_path("d");
    let y = t.lookup_path("d/sub/y");

    t.fs.rename(ROOT_ID, "d", ROOT_ID, "e").unwrap();
    assert_eq!(t.store.keys(), ["e/", "e/sub/y", "e/x"]);
    assert_eq!(t.fs.lookup(ROOT_ID, "e").unwrap().ino(), d);
    assert_eq!(t.fs.inodes.get(y).unwrap().path(), "/e/sub/y");
}

#[test]
fn directory_rename_onto_a_non_empty_directory() {
    let t = Fixture::new();
    t.store.insert("d/x", "1");
    t.store.insert("e/y", "1");
    t.lookup_path("d");
    t.lookup_path("e");
    assert!(matches!(
        t.fs.rename(ROOT_ID, "d", ROOT_ID, "e"),
        Err(FsError::NotEmpty)
    ));
    assert!(t.store.contains("d/x"));
}

#[test]
fn kind_mismatches() {
    let t = Fixture::new();
    t.store.insert("f", "1");
    t.store.insert("d/x", "1");
    t.lookup_path("f");
    t.lookup_path("d");

    assert!(matches!(t.fs.rename(ROOT_ID, "d", ROOT_ID, "f"), Err(FsError::NotDir)));
    assert!(matches!(t.fs.rename(ROOT_ID, "f", ROOT_ID, "d"), Err(FsError::IsDir)));
    assert!(matches!(t.fs.rename(ROOT_ID, "f", ROOT_ID, ".."), Err(FsError::Invalid)));
}

#[test]
fn directory_cannot_move_below_itself() {
    let t = Fixture::new();
    t.store.insert("d/sub/x", "1");
    let sub = t.lookup_path("d/sub");
    assert!(matches!(t.fs.rename(ROOT_ID, "d", sub, "d"), Err(FsError::Invalid)));
}

#[test]
fn rename_across_stores_is_exdev() {
    let t = Fixture::new();
    t.store.insert("a", "1");
    t.lookup_path("a");

    let other = Arc::new(Backend::new(Arc::new(MemoryStore::new("other")), None));
    t.fs.mount(Arc::new(Mount::new("data", other, ""))).unwrap();
    let data = t.lookup_path("data");

    let err = t.fs.rename(ROOT_ID, "a", data, "a").unwrap_err();
    assert_eq!(err.errno(), libc::EXDEV);
    assert!(t.store.contains("a"));

    assert!(matches!(
        t.fs.rename(ROOT_ID, "data", ROOT_ID, "moved"),
        Err(FsError::NotPermitted)
    ));
}

#[test]
fn crossing_renames_do_not_deadlock() {
    let t = Fixture::new();
    t.fs.mkdir(ROOT_ID, "A").unwrap();
    t.fs.mkdir(ROOT_ID, "B").unwrap();
    let a = t.lookup_path("A");
    let b = t.lookup_path("B");
    t.store.insert("A/one", "1");
    t.store.insert("B/two", "2");
    t.lookup_path("A/one");
    t.lookup_path("B/two");

    std::thread::scope(|s| {
        s.spawn(|| {
            for _ in 0..200 {
                t.fs.rename(a, "one", b, "one").unwrap();
                t.fs.rename(b, "one", a, "one").unwrap();
            }
        });
        s.spawn(|| {
            for _ in 0..200 {
                t.fs.rename(b, "two", a, "two").unwrap();
                t.fs.rename(a, "two", b, "two").unwrap();
            }
        });
    });

    assert!(t.store.contains("A/one"));
    assert!(t.store.contains("B/two"));
    assert_eq!(t.fs.inodes.get(a).unwrap().lock().dir.as_ref().unwrap().children.len(), 1);
    assert_eq!(t.fs.inodes.get(b).unwrap().lock().dir.as_ref().unwrap().children.len(), 1);
}
