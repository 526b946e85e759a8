use bucketfs::backend::memory::{MemoryStore, Op};
use bucketfs::backend::BackendError;
use bucketfs::error::FsError;
use bucketfs::fs::inode::Stamp;

use crate::helpers::{pid, Fixture, ROOT_ID};

fn unavailable() -> BackendError {
    BackendError::Http {
        status: 503,
        message: "unavailable".into(),
    }
}

#[test]
fn created_file_reads_back_from_its_buffer() {
    let t = Fixture::new();
    let (entry, fh) = t.fs.create(ROOT_ID, "new.txt", pid()).unwrap();
    assert_eq!(entry.attr.size, 0);
    assert!(!t.store.contains("new.txt"));

    assert_eq!(t.fs.write(fh, 0, b"0123456789").unwrap(), 10);
    t.fs.flush(fh, pid()).unwrap();
    assert_eq!(t.store.body("new.txt").unwrap(), b"0123456789");

    t.store.reset_counters();
    assert_eq!(t.fs.read(fh, 2, 4).unwrap(), b"2345");
    assert_eq!(t.store.calls(Op::Get), 0);

    t.fs.release(fh).unwrap();
    let attr = t.fs.getattr(entry.ino()).unwrap().attr;
    assert_eq!(attr.size, 10);
}

#[test]
fn create_over_a_cached_name_is_eexist() {
    let t = Fixture::new();
    t.store.insert("taken", "x");
    t.lookup_path("taken");
    assert!(matches!(t.fs.create(ROOT_ID, "taken", pid()), Err(FsError::Exists)));
}

#[test]
fn reads_go_to_the_store_by_range() {
    let t = Fixture::new();
    t.store.insert("r", "hello world");
    let ino = t.lookup_path("r");
    let (fh, keep) = t.fs.open(ino, libc::O_RDONLY, pid()).unwrap();
    assert!(keep);

    assert_eq!(t.fs.read(fh, 6, 5).unwrap(), b"world");
    assert_eq!(t.fs.read(fh, 20, 5).unwrap(), b"");
    assert_eq!(t.fs.read(fh, 0, 0).unwrap(), b"");
    assert_eq!(t.store.calls(Op::Get), 2);
    t.fs.release(fh).unwrap();
}

#[test]
fn change_under_an_open_handle_drops_the_page_cache() {
    let t = Fixture::new();
    t.store.insert("r", "before");
    let ino = t.lookup_path("r");
    let (fh, _) = t.fs.open(ino, libc::O_RDONLY, pid()).unwrap();

    t.store.insert("r", "after!");
    assert!(t.fs.read(fh, 0, 6).is_err());
    t.fs.release(fh).unwrap();

    let (fh, keep) = t.fs.open(ino, libc::O_RDONLY, pid()).unwrap();
    assert!(!keep);
    t.fs.release(fh).unwrap();
}

#[test]
fn first_write_loads_the_remote_body() {
    let t = Fixture::new();
    t.store.insert("w", "hello");
    let ino = t.lookup_path("w");
    let (fh, _) = t.fs.open(ino, libc::O_WRONLY, pid()).unwrap();

    t.fs.write(fh, 5, b"!!").unwrap();
    assert_eq!(t.store.calls(Op::Get), 1);
    t.fs.release(fh).unwrap();
    assert_eq!(t.store.body("w").unwrap(), b"hello!!");
}

#[test]
fn open_with_truncate_skips_the_download() {
    let t = Fixture::new();
    t.store.insert("t", "abc");
    let ino = t.lookup_path("t");
    let (fh, keep) = t.fs.open(ino, libc::O_WRONLY | libc::O_TRUNC, pid()).unwrap();
    assert!(!keep);

    t.fs.release(fh).unwrap();
    assert_eq!(t.store.body("t").unwrap(), b"");
    assert_eq!(t.store.calls(Op::Get), 0);
}

#[test]
fn truncate_without_a_handle_rewrites_the_blob() {
    let t = Fixture::new();
    t.store.insert("s", "hello");
    let ino = t.lookup_path("s");

    let entry = t.fs.setattr(ino, Some(2), None, None).unwrap();
    assert_eq!(entry.attr.size, 2);
    assert_eq!(t.store.body("s").unwrap(), b"he");

    t.fs.setattr(ino, Some(4), None, None).unwrap();
    assert_eq!(t.store.body("s").unwrap(), b"he\0\0");
}

#[test]
fn truncate_through_a_handle_waits_for_flush() {
    let t = Fixture::new();
    t.store.insert("s", "hello");
    let ino = t.lookup_path("s");
    let (fh, _) = t.fs.open(ino, libc::O_RDWR, pid()).unwrap();

    t.fs.setattr(ino, Some(1), None, Some(fh)).unwrap();
    assert_eq!(t.store.body("s").unwrap(), b"hello");
    t.fs.flush(fh, pid()).unwrap();
    assert_eq!(t.store.body("s").unwrap(), b"h");
    t.fs.release(fh).unwrap();
}

#[test]
fn write_past_the_end_leaves_a_zero_filled_gap() {
    let t = Fixture::new();
    let (_, fh) = t.fs.create(ROOT_ID, "sparse", pid()).unwrap();
    t.fs.write(fh, 4, b"xy").unwrap();
    t.fs.release(fh).unwrap();
    assert_eq!(t.store.body("sparse").unwrap(), b"\0\0\0\0xy");
}

#[test]
fn writes_past_the_size_limit_are_efbig() {
    let t = Fixture::new();
    let (entry, fh) = t.fs.create(ROOT_ID, "huge", pid()).unwrap();

    let err = t.fs.write(fh, 1 << 44, b"x").unwrap_err();
    assert_eq!(err.errno(), libc::EFBIG);
    assert!(matches!(t.fs.write(fh, u64::MAX, b"x"), Err(FsError::FileTooLarge)));
    assert_eq!(t.fs.getattr(entry.ino()).unwrap().attr.size, 0);
    t.fs.release(fh).unwrap();
}

#[test]
fn truncates_past_the_size_limit_are_efbig() {
    let t = Fixture::with(MemoryStore::new("test"), |c| c.max_file_size = 8);
    t.store.insert("f", "1234");
    let ino = t.lookup_path("f");

    t.store.reset_counters();
    assert!(matches!(t.fs.setattr(ino, Some(9), None, None), Err(FsError::FileTooLarge)));
    assert_eq!(t.store.total_calls(), 0);

    let (fh, _) = t.fs.open(ino, libc::O_RDWR, pid()).unwrap();
    assert!(matches!(
        t.fs.setattr(ino, Some(9), None, Some(fh)),
        Err(FsError::FileTooLarge)
    ));
    assert!(matches!(t.fs.write(fh, 4, b"56789"), Err(FsError::FileTooLarge)));
    t.fs.write(fh, 4, b"5678").unwrap();
    t.fs.release(fh).unwrap();
    assert_eq!(t.store.body("f").unwrap(), b"12345678");
}

// pid 0 has no /proc entry.
#[cfg(target_os = "linux")]
#[test]
fn unresolvable_callers_get_unscoped_handles() {
    let t = Fixture::new();
    let (entry, fh) = t.fs.create(ROOT_ID, "f", 0).unwrap();
    t.fs.write(fh, 0, b"one").unwrap();
    t.fs.flush(fh, pid()).unwrap();
    assert_eq!(t.store.body("f").unwrap(), b"one");
    t.fs.release(fh).unwrap();

    let (fh, _) = t.fs.open(entry.ino(), libc::O_WRONLY, 0).unwrap();
    t.fs.write(fh, 0, b"two").unwrap();
    t.fs.flush(fh, pid()).unwrap();
    assert_eq!(t.store.body("f").unwrap(), b"two");
    t.fs.release(fh).unwrap();
}

#[cfg(target_os = "linux")]
#[test]
fn flush_from_another_process_is_ignored() {
    if pid() == 1 {
        return;
    }
    let t = Fixture::new();
    let (_, fh) = t.fs.create(ROOT_ID, "mine", pid()).unwrap();
    t.fs.write(fh, 0, b"data").unwrap();

    // pid 1 is never in this test's thread group.
    t.fs.flush(fh, 1).unwrap();
    assert!(!t.store.contains("mine"));

    t.fs.flush(fh, pid()).unwrap();
    assert_eq!(t.store.body("mine").unwrap(), b"data");
    t.fs.release(fh).unwrap();
}

#[test]
fn read_only_handles_flush_for_anyone() {
    let t = Fixture::new();
    t.store.insert("ro", "x");
    let ino = t.lookup_path("ro");
    let (fh, _) = t.fs.open(ino, libc::O_RDONLY, pid()).unwrap();
    t.fs.flush(fh, u32::MAX).unwrap();
    assert_eq!(t.store.calls(Op::Put), 0);
    t.fs.release(fh).unwrap();
}

#[test]
fn failed_flush_of_a_new_file_expires_its_attributes() {
    let t = Fixture::new();
    let (entry, fh) = t.fs.create(ROOT_ID, "f", pid()).unwrap();
    t.fs.write(fh, 0, b"abc").unwrap();

    t.store.fail_next(Op::Put, unavailable());
    let err = t.fs.flush(fh, pid()).unwrap_err();
    assert_eq!(err.errno(), libc::EAGAIN);
    let inode = t.fs.inodes.get(entry.ino()).unwrap();
    assert_eq!(inode.lock().attr_stamp, Stamp::Expired);

    t.fs.flush(fh, pid()).unwrap();
    assert_eq!(t.store.body("f").unwrap(), b"abc");
    t.fs.release(fh).unwrap();
}

#[test]
fn release_uploads_pending_writes() {
    let t = Fixture::new();
    let (_, fh) = t.fs.create(ROOT_ID, "late", pid()).unwrap();
    t.fs.write(fh, 0, b"bytes").unwrap();
    t.fs.release(fh).unwrap();
    assert_eq!(t.store.body("late").unwrap(), b"bytes");
    assert!(matches!(t.fs.release(fh), Err(FsError::BadHandle(_))));
}

#[test]
fn large_bodies_use_multipart() {
    let t = Fixture::with(MemoryStore::new("test"), |c| c.multipart_threshold = 4);
    let (_, fh) = t.fs.create(ROOT_ID, "big", pid()).unwrap();
    t.fs.write(fh, 0, b"0123456789").unwrap();
    t.fs.flush(fh, pid()).unwrap();

    assert_eq!(t.store.calls(Op::MultipartBegin), 1);
    assert_eq!(t.store.calls(Op::MultipartAdd), 3);
    assert_eq!(t.store.calls(Op::MultipartCommit), 1);
    assert_eq!(t.store.calls(Op::Put), 0);
    assert_eq!(t.store.body("big").unwrap(), b"0123456789");
    assert_eq!(t.fs.replicators.outstanding(), 0);
    t.fs.release(fh).unwrap();
}

#[test]
fn failed_part_aborts_the_upload() {
    let t = Fixture::with(MemoryStore::new("test"), |c| c.multipart_threshold = 4);
    let (_, fh) = t.fs.create(ROOT_ID, "big", pid()).unwrap();
    t.fs.write(fh, 0, b"0123456789").unwrap();

    t.store.fail_next(Op::MultipartAdd, unavailable());
    assert!(t.fs.flush(fh, pid()).is_err());
    assert_eq!(t.store.calls(Op::MultipartAbort), 1);
    assert_eq!(t.store.pending_uploads(), 0);
    assert!(!t.store.contains("big"));
    assert!(t.fs.file_handles.get(fh).unwrap().is_dirty());
}

#[test]
fn part_size_respects_the_store_limit() {
    let store = MemoryStore::new("test").with_max_multipart_size(3);
    let t = Fixture::with(store, |c| c.multipart_threshold = 8);
    let (_, fh) = t.fs.create(ROOT_ID, "big", pid()).unwrap();
    t.fs.write(fh, 0, b"0123456789").unwrap();
    t.fs.flush(fh, pid()).unwrap();
    assert_eq!(t.store.calls(Op::MultipartAdd), 4);
    assert_eq!(t.store.body("big").unwrap(), b"0123456789");
}

#[test]
fn sequential_reads_are_prefetched() {
    let t = Fixture::with(MemoryStore::new("test"), |c| c.readahead_size = 8);
    t.store.insert("seq", "abcdefghijklmnop");
    let ino = t.lookup_path("seq");
    let (fh, _) = t.fs.open(ino, libc::O_RDONLY, pid()).unwrap();

    assert_eq!(t.fs.read(fh, 0, 4).unwrap(), b"abcd");
    assert_eq!(t.fs.read(fh, 4, 4).unwrap(), b"efgh");
    // The read-ahead of bytes 8..16 runs in the background.
    assert!(crate::helpers::wait_for(std::time::Duration::from_secs(5), || {
        t.fs.restorers.outstanding() == 0 && t.store.calls(Op::Get) == 3
    }));

    t.store.reset_counters();
    assert_eq!(t.fs.read(fh, 8, 4).unwrap(), b"ijkl");
    assert_eq!(t.store.calls(Op::Get), 0);
    t.fs.release(fh).unwrap();
}

#[test]
fn open_files_are_listed_with_their_owner() {
    let t = Fixture::new();
    t.store.insert("d/f", "x");
    let ino = t.lookup_path("d/f");
    let (fh, _) = t.fs.open(ino, libc::O_WRONLY, pid()).unwrap();

    let open = t.fs.file_handles.list_open();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].fh, fh);
    assert_eq!(open[0].path, "/d/f");
    assert!(open[0].tgid.is_some());
    t.fs.release(fh).unwrap();
    assert!(t.fs.file_handles.is_empty());
}

#[test]
fn directories_cannot_be_opened_as_files() {
    let t = Fixture::new();
    t.store.insert("d/f", "x");
    let d = t.lookup_path("d");
    assert!(matches!(t.fs.open(d, libc::O_RDONLY, pid()), Err(FsError::IsDir)));
    assert!(matches!(t.fs.setattr(d, Some(0), None, None), Err(FsError::IsDir)));
}
