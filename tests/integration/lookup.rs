use bucketfs::backend::memory::{MemoryStore, Op};
use bucketfs::backend::BackendError;
use bucketfs::error::FsError;
use fuser::FileType;
use rand::Rng;

use crate::helpers::{pid, Fixture, ROOT_ID};

#[test]
fn cached_lookup_makes_no_store_calls() {
    let t = Fixture::new();
    t.store.insert("a.txt", "hello");

    let first = t.fs.lookup(ROOT_ID, "a.txt").unwrap();
    assert_eq!(t.store.calls(Op::Head), 1);
    assert_eq!(first.attr.size, 5);
    assert_eq!(first.attr.kind, FileType::RegularFile);

    t.store.reset_counters();
    let second = t.fs.lookup(ROOT_ID, "a.txt").unwrap();
    assert_eq!(second.ino(), first.ino());
    assert_eq!(t.store.total_calls(), 0);
}

#[test]
fn expired_entry_is_revalidated_in_place() {
    let t = Fixture::uncached();
    t.store.insert("a.txt", "hello");
    let first = t.fs.lookup(ROOT_ID, "a.txt").unwrap();

    t.store.insert("a.txt", "hello, again");
    let second = t.fs.lookup(ROOT_ID, "a.txt").unwrap();
    assert_eq!(t.store.calls(Op::Head), 2);
    assert_eq!(second.ino(), first.ino());
    assert_eq!(second.attr.size, 12);
}

#[test]
fn open_handle_keeps_attributes_fresh() {
    let t = Fixture::uncached();
    t.store.insert("a.txt", "hello");
    let ino = t.fs.lookup(ROOT_ID, "a.txt").unwrap().ino();
    let (fh, _) = t.fs.open(ino, libc::O_RDONLY, pid()).unwrap();

    t.store.reset_counters();
    t.fs.lookup(ROOT_ID, "a.txt").unwrap();
    t.fs.getattr(ino).unwrap();
    assert_eq!(t.store.total_calls(), 0);

    t.fs.release(fh).unwrap();
    t.fs.getattr(ino).unwrap();
    assert_eq!(t.store.calls(Op::Head), 1);
}

#[test]
fn removed_file_disappears_on_revalidation() {
    let t = Fixture::uncached();
    t.store.insert("gone", "x");
    let ino = t.fs.lookup(ROOT_ID, "gone").unwrap().ino();

    t.store.remove("gone");
    let err = t.fs.lookup(ROOT_ID, "gone").unwrap_err();
    assert_eq!(err.errno(), libc::ENOENT);
    assert!(t.fs.inodes.get(ino).unwrap().is_detached());
}

#[test]
fn missing_name_is_enoent() {
    let t = Fixture::new();
    let err = t.fs.lookup(ROOT_ID, "nope").unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(err.errno(), libc::ENOENT);
}

#[test]
fn implicit_directory_outlives_its_last_child() {
    let t = Fixture::uncached();
    t.store.insert("dir/x", "1");
    let dir = t.fs.lookup(ROOT_ID, "dir").unwrap();
    assert_eq!(dir.attr.kind, FileType::Directory);

    t.store.remove("dir/x");
    let again = t.fs.lookup(ROOT_ID, "dir").unwrap();
    assert_eq!(again.ino(), dir.ino());
}

#[test]
fn explicit_directories_need_a_marker() {
    let t = Fixture::with(MemoryStore::new("test"), |c| c.explicit_dir = true);
    t.store.insert("dir/x", "1");
    assert!(matches!(t.fs.lookup(ROOT_ID, "dir"), Err(FsError::NotFound)));

    t.store.insert("marked/", "");
    let dir = t.fs.lookup(ROOT_ID, "marked").unwrap();
    assert_eq!(dir.attr.kind, FileType::Directory);
}

#[test]
fn store_failure_leaves_no_reference_behind() {
    let t = Fixture::uncached();
    t.store.insert("a", "1");
    let ino = t.fs.lookup(ROOT_ID, "a").unwrap().ino();

    t.store.fail_next(
        Op::Head,
        BackendError::Http {
            status: 503,
            message: "slow down".into(),
        },
    );
    let err = t.fs.lookup(ROOT_ID, "a").unwrap_err();
    assert_eq!(err.errno(), libc::EAGAIN);
    assert_eq!(t.fs.inodes.get(ino).unwrap().refs(), 1);
}

#[test]
fn dot_entries() {
    let t = Fixture::new();
    t.store.insert("d/f", "1");
    let d = t.lookup_path("d");

    assert_eq!(t.fs.lookup(d, ".").unwrap().ino(), d);
    assert_eq!(t.fs.lookup(d, "..").unwrap().ino(), ROOT_ID);
    assert_eq!(t.fs.lookup(ROOT_ID, "..").unwrap().ino(), ROOT_ID);
}

#[test]
fn lookup_in_a_file_is_enotdir() {
    let t = Fixture::new();
    t.store.insert("f", "1");
    let f = t.lookup_path("f");
    assert!(matches!(t.fs.lookup(f, "x"), Err(FsError::NotDir)));
}

#[test]
fn forget_releases_exactly_once() {
    let t = Fixture::new();
    t.store.insert("a", "1");
    let ino = t.fs.lookup(ROOT_ID, "a").unwrap().ino();
    t.fs.lookup(ROOT_ID, "a").unwrap();

    t.fs.forget(ino, 1).unwrap();
    assert!(t.fs.inodes.contains(ino));

    t.fs.forget(ino, 1).unwrap();
    assert!(!t.fs.inodes.contains(ino));
    assert_eq!(t.fs.inodes.forgotten(), 1);

    assert!(matches!(t.fs.forget(ino, 1), Err(FsError::UnknownInode(id)) if id == ino));
    assert!(matches!(t.fs.getattr(ino), Err(FsError::UnknownInode(_))));
}

#[test]
fn forgotten_name_gets_a_new_id() {
    let t = Fixture::new();
    t.store.insert("a", "1");
    let first = t.fs.lookup(ROOT_ID, "a").unwrap().ino();
    t.fs.forget(first, 1).unwrap();

    let second = t.fs.lookup(ROOT_ID, "a").unwrap().ino();
    assert_ne!(first, second);
}

#[test]
fn concurrent_lookups_share_one_inode() {
    let t = Fixture::new();
    t.store.insert("shared", "1");

    let ids: Vec<u64> = std::thread::scope(|s| {
        let workers: Vec<_> = (0..8)
            .map(|_| s.spawn(|| t.fs.lookup(ROOT_ID, "shared").unwrap().ino()))
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    assert!(ids.iter().all(|id| *id == ids[0]));
    assert_eq!(t.fs.inodes.get(ids[0]).unwrap().refs(), 8);
}

#[test]
fn interleaved_lookup_and_forget_balance_out() {
    let t = Fixture::new();
    for i in 0..4 {
        t.store.insert(&format!("f{}", i), "x");
    }

    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                let mut rng = rand::thread_rng();
                for _ in 0..200 {
                    let name = format!("f{}", rng.gen_range(0..4));
                    let ino = t.fs.lookup(ROOT_ID, &name).unwrap().ino();
                    if rng.gen_bool(0.5) {
                        std::thread::yield_now();
                    }
                    t.fs.forget(ino, 1).unwrap();
                }
            });
        }
    });

    // Only the root is left once every reference is returned.
    assert_eq!(t.fs.inodes.len(), 1);
}

#[test]
fn root_attributes_never_touch_the_store() {
    let t = Fixture::uncached();
    let root = t.fs.getattr(ROOT_ID).unwrap();
    assert_eq!(root.attr.kind, FileType::Directory);
    assert_eq!(root.attr.perm, 0o755);
    assert_eq!(root.attr.uid, 1000);
    assert_eq!(t.store.total_calls(), 0);
}
