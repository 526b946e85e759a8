use std::sync::Arc;

use bucketfs::backend::local::DirStore;
use bucketfs::backend::memory::{MemoryStore, Op};
use bucketfs::backend::Backend;
use bucketfs::error::FsError;
use bucketfs::fs::mount::Mount;
use fuser::FileType;

use crate::helpers::{pid, test_config, Fixture, ROOT_ID};

fn graft(t: &Fixture, path: &str, prefix: &str) -> (Arc<MemoryStore>, Arc<Mount>) {
    let store = Arc::new(MemoryStore::new("grafted"));
    let backend = Arc::new(Backend::new(store.clone(), None));
    let mount = Arc::new(Mount::new(path, backend, prefix));
    t.fs.mount(Arc::clone(&mount)).unwrap();
    (store, mount)
}

#[test]
fn grafted_directory_reads_from_its_own_store() {
    let t = Fixture::new();
    let (store, mount) = graft(&t, "data", "x/");
    store.insert("x/file.txt", "grafted");
    t.store.insert("data/file.txt", "shadowed");
    assert!(mount.is_mounted());

    let ino = t.lookup_path("data/file.txt");
    assert_eq!(store.requested(Op::Head), ["x/file.txt"]);

    let (fh, _) = t.fs.open(ino, libc::O_RDONLY, pid()).unwrap();
    assert_eq!(t.fs.read(fh, 0, 64).unwrap(), b"grafted");
    t.fs.release(fh).unwrap();
}

#[test]
fn nested_graft_creates_the_path_to_it() {
    let t = Fixture::new();
    let (store, _) = graft(&t, "/a/b/", "");
    store.insert("f", "1");

    let a = t.fs.lookup(ROOT_ID, "a").unwrap();
    assert_eq!(a.attr.kind, FileType::Directory);
    t.lookup_path("a/b/f");
    assert_eq!(t.store.total_calls(), 0);
}

#[test]
fn grafts_survive_forget_and_relisting() {
    let t = Fixture::uncached();
    graft(&t, "data", "");
    t.store.insert("other", "1");

    let data = t.fs.lookup(ROOT_ID, "data").unwrap().ino();
    t.fs.forget(data, 1).unwrap();
    assert!(t.fs.inodes.contains(data));

    let mut names = t.names(ROOT_ID);
    names.sort();
    assert_eq!(names, [".", "..", "data", "other"]);
    assert_eq!(t.fs.lookup(ROOT_ID, "data").unwrap().ino(), data);
}

#[test]
fn graft_points_cannot_be_removed() {
    let t = Fixture::new();
    graft(&t, "data", "");
    assert_eq!(t.fs.rmdir(ROOT_ID, "data").unwrap_err().errno(), libc::EPERM);
}

#[test]
fn mounting_twice_is_a_no_op() {
    let t = Fixture::new();
    let (_, mount) = graft(&t, "data", "");
    t.fs.mount(Arc::clone(&mount)).unwrap();
    assert_eq!(t.fs.mounts.lock().len(), 1);
}

#[test]
fn graft_over_a_file_fails() {
    let t = Fixture::new();
    t.store.insert("f", "1");
    t.lookup_path("f");

    let backend = Arc::new(Backend::new(Arc::new(MemoryStore::new("g")), None));
    let mount = Arc::new(Mount::new("f", backend, ""));
    assert!(matches!(t.fs.mount(Arc::clone(&mount)), Err(FsError::NotDir)));
    assert!(!mount.is_mounted());
}

#[test]
fn unmount_falls_back_to_the_parent_store() {
    let t = Fixture::new();
    let (store, mount) = graft(&t, "data", "");
    store.insert("file.txt", "grafted");
    t.store.insert("data/file.txt", "underneath");
    let data = t.lookup_path("data");
    let grafted = t.lookup_path("data/file.txt");

    t.fs.unmount("data").unwrap();
    assert!(!mount.is_mounted());
    assert!(t.fs.mounts.lock().is_empty());
    assert!(t.fs.inodes.get(grafted).unwrap().is_detached());

    let ino = t.lookup_path("data/file.txt");
    assert_ne!(ino, grafted);
    let (fh, _) = t.fs.open(ino, libc::O_RDONLY, pid()).unwrap();
    assert_eq!(t.fs.read(fh, 0, 64).unwrap(), b"underneath");
    t.fs.release(fh).unwrap();
    assert_eq!(t.fs.lookup(ROOT_ID, "data").unwrap().ino(), data);
}

#[test]
fn unmount_of_an_unknown_path() {
    let t = Fixture::new();
    assert!(matches!(t.fs.unmount("nope"), Err(FsError::NotFound)));
    assert!(matches!(t.fs.unmount("/"), Err(FsError::Invalid)));
}

#[test]
fn directory_store_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("docs")).unwrap();
    std::fs::write(dir.path().join("docs/readme.txt"), "read me").unwrap();

    let backend = Arc::new(Backend::new(Arc::new(DirStore::new(dir.path())), None));
    backend.init().unwrap();
    let fs = bucketfs::fs::BucketFs::new(test_config(), backend);

    let docs = fs.lookup(ROOT_ID, "docs").unwrap();
    assert_eq!(docs.attr.kind, FileType::Directory);
    let readme = fs.lookup(docs.ino(), "readme.txt").unwrap();
    let (fh, _) = fs.open(readme.ino(), libc::O_RDONLY, pid()).unwrap();
    assert_eq!(fs.read(fh, 0, 4).unwrap(), b"read");
    fs.release(fh).unwrap();

    let (_, fh) = fs.create(docs.ino(), "new.txt", pid()).unwrap();
    fs.write(fh, 0, b"written").unwrap();
    fs.release(fh).unwrap();
    assert_eq!(
        std::fs::read(dir.path().join("docs/new.txt")).unwrap(),
        b"written"
    );
}
