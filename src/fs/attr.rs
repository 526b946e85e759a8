use std::time::SystemTime;

use fuser::{FileAttr, FileType};

use super::inode::{Inode, InodeState, Kind};

const BLOCK_SIZE: u32 = 4096;

pub fn kind_to_filetype(kind: Kind) -> FileType {
    match kind {
        Kind::File => FileType::RegularFile,
        Kind::Dir => FileType::Directory,
        Kind::Symlink => FileType::Symlink,
    }
}

/// Kernel attributes for `inode` as currently cached. Entries the store
/// never dated report `fallback_time`.
pub fn file_attr(inode: &Inode, st: &InodeState, fallback_time: SystemTime) -> FileAttr {
    let kind = inode.kind();
    let size = match (kind, &st.symlink_target) {
        (Kind::Symlink, Some(target)) => target.len() as u64,
        _ => st.attrs.size,
    };
    let mtime = st.attrs.mtime.unwrap_or(fallback_time);
    FileAttr {
        ino: fuser::INodeNo(inode.id),
        size,
        blocks: size.div_ceil(512),
        atime: mtime,
        mtime,
        ctime: mtime,
        crtime: mtime,
        kind: kind_to_filetype(kind),
        perm: match kind {
            Kind::Symlink => 0o777,
            _ => st.attrs.mode,
        },
        nlink: if kind == Kind::Dir { 2 } else { 1 },
        uid: st.attrs.uid,
        gid: st.attrs.gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}
