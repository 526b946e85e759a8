//! Kernel-facing adapter: decodes each request, runs the matching
//! [`BucketFs`] operation behind a panic boundary and encodes the reply.

use std::ffi::OsStr;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::time::SystemTime;

use fuser::{
    BsdFileFlags, Errno, FileHandle, Filesystem, FopenFlags, Generation, INodeNo, KernelConfig,
    LockOwner, OpenFlags, RenameFlags, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
    WriteFlags,
};
use tracing::{debug, error, info};

use super::attr::kind_to_filetype;
use super::{BucketFs, XattrReply};
use crate::error::{FsError, Result};

fn errno(e: &FsError) -> Errno {
    Errno::from(std::io::Error::from_raw_os_error(e.errno()))
}

/// Run one operation. Failures are logged and mapped to an errno; a panic
/// fails only this request.
fn guarded<T>(op: &'static str, f: impl FnOnce() -> Result<T>) -> std::result::Result<T, Errno> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            if e.is_invariant_violation() {
                error!("{}: {}", op, e);
            } else {
                debug!("{}: {}", op, e);
            }
            Err(errno(&e))
        }
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!("{} panicked: {}", op, msg);
            Err(errno(&FsError::Internal(msg)))
        }
    }
}

fn utf8(name: &OsStr) -> Result<&str> {
    name.to_str().ok_or(FsError::Invalid)
}

fn open_flags(keep_cache: bool) -> FopenFlags {
    if keep_cache {
        FopenFlags::FOPEN_KEEP_CACHE
    } else {
        FopenFlags::empty()
    }
}

fn reply_xattr(reply: ReplyXattr, res: std::result::Result<XattrReply, Errno>) {
    match res {
        Ok(XattrReply::Size(n)) => reply.size(n),
        Ok(XattrReply::Data(data)) => reply.data(&data),
        Err(e) => reply.error(e),
    }
}

impl Filesystem for BucketFs {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> std::io::Result<()> {
        let root = self.inodes.root();
        let bucket = root.binding().map(|b| b.backend.bucket()).unwrap_or_default();
        info!("bucketfs initialized over {}", bucket);
        Ok(())
    }

    fn destroy(&mut self) {
        info!(
            "bucketfs shutting down: {} inodes, {} open files",
            self.inodes.len(),
            self.file_handles.len()
        );
    }

    fn lookup(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEntry) {
        let parent = u64::from(parent);
        debug!("lookup(parent={}, name={:?})", parent, name);
        match guarded("lookup", || self.lookup(parent, utf8(name)?)) {
            Ok(entry) => reply.entry(&entry.ttl(), &entry.attr, Generation(0)),
            Err(e) => reply.error(e),
        }
    }

    fn forget(&self, _req: &Request, ino: INodeNo, nlookup: u64) {
        let ino = u64::from(ino);
        debug!("forget(ino={}, nlookup={})", ino, nlookup);
        let _ = guarded("forget", || self.forget(ino, nlookup));
    }

    fn getattr(&self, _req: &Request, ino: INodeNo, _fh: Option<FileHandle>, reply: ReplyAttr) {
        let ino = u64::from(ino);
        debug!("getattr(ino={})", ino);
        match guarded("getattr", || self.getattr(ino)) {
            Ok(entry) => reply.attr(&entry.attr_ttl, &entry.attr),
            Err(e) => reply.error(e),
        }
    }

    fn setattr(
        &self,
        _req: &Request,
        ino: INodeNo,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<FileHandle>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<BsdFileFlags>,
        reply: ReplyAttr,
    ) {
        let ino = u64::from(ino);
        debug!("setattr(ino={}, size={:?})", ino, size);
        let mtime = mtime.map(|t| match t {
            TimeOrNow::SpecificTime(t) => t,
            TimeOrNow::Now => SystemTime::now(),
        });
        let fh = fh.map(u64::from);
        match guarded("setattr", || self.setattr(ino, size, mtime, fh)) {
            Ok(entry) => reply.attr(&entry.attr_ttl, &entry.attr),
            Err(e) => reply.error(e),
        }
    }

    fn readlink(&self, _req: &Request, ino: INodeNo, reply: ReplyData) {
        let ino = u64::from(ino);
        debug!("readlink(ino={})", ino);
        match guarded("readlink", || self.readlink(ino)) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(e),
        }
    }

    fn mkdir(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let parent = u64::from(parent);
        debug!("mkdir(parent={}, name={:?})", parent, name);
        match guarded("mkdir", || self.mkdir(parent, utf8(name)?)) {
            Ok(entry) => reply.entry(&entry.ttl(), &entry.attr, Generation(0)),
            Err(e) => reply.error(e),
        }
    }

    fn unlink(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        let parent = u64::from(parent);
        debug!("unlink(parent={}, name={:?})", parent, name);
        match guarded("unlink", || self.unlink(parent, utf8(name)?)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn rmdir(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        let parent = u64::from(parent);
        debug!("rmdir(parent={}, name={:?})", parent, name);
        match guarded("rmdir", || self.rmdir(parent, utf8(name)?)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn symlink(
        &self,
        _req: &Request,
        parent: INodeNo,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let parent = u64::from(parent);
        debug!("symlink(parent={}, name={:?}, target={:?})", parent, link_name, target);
        let res = guarded("symlink", || {
            let target = target.to_str().ok_or(FsError::Invalid)?;
            self.symlink(parent, utf8(link_name)?, target)
        });
        match res {
            Ok(entry) => reply.entry(&entry.ttl(), &entry.attr, Generation(0)),
            Err(e) => reply.error(e),
        }
    }

    fn rename(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        newparent: INodeNo,
        newname: &OsStr,
        _flags: RenameFlags,
        reply: ReplyEmpty,
    ) {
        let parent = u64::from(parent);
        let newparent = u64::from(newparent);
        debug!(
            "rename(parent={}, name={:?}, newparent={}, newname={:?})",
            parent, name, newparent, newname
        );
        let res = guarded("rename", || {
            self.rename(parent, utf8(name)?, newparent, utf8(newname)?)
        });
        match res {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn open(&self, req: &Request, ino: INodeNo, flags: OpenFlags, reply: ReplyOpen) {
        let ino = u64::from(ino);
        debug!("open(ino={}, flags={:#x})", ino, flags.0);
        match guarded("open", || self.open(ino, flags.0, req.pid())) {
            Ok((fh, keep)) => reply.opened(FileHandle(fh), open_flags(keep)),
            Err(e) => reply.error(e),
        }
    }

    fn read(
        &self,
        _req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        size: u32,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyData,
    ) {
        let fh = u64::from(fh);
        debug!("read(ino={}, fh={}, offset={}, size={})", u64::from(ino), fh, offset, size);
        match guarded("read", || self.read(fh, offset, size)) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e),
        }
    }

    fn write(
        &self,
        _req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        data: &[u8],
        _write_flags: WriteFlags,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyWrite,
    ) {
        let fh = u64::from(fh);
        debug!("write(ino={}, fh={}, offset={}, size={})", u64::from(ino), fh, offset, data.len());
        match guarded("write", || self.write(fh, offset, data)) {
            Ok(n) => reply.written(n),
            Err(e) => reply.error(e),
        }
    }

    fn flush(&self, req: &Request, ino: INodeNo, fh: FileHandle, _lock_owner: LockOwner, reply: ReplyEmpty) {
        let fh = u64::from(fh);
        debug!("flush(ino={}, fh={})", u64::from(ino), fh);
        match guarded("flush", || self.flush(fh, req.pid())) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn release(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let fh = u64::from(fh);
        debug!("release(fh={})", fh);
        match guarded("release", || self.release(fh)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn fsync(&self, _req: &Request, _ino: INodeNo, fh: FileHandle, _datasync: bool, reply: ReplyEmpty) {
        let fh = u64::from(fh);
        debug!("fsync(fh={})", fh);
        match guarded("fsync", || self.fsync(fh)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn opendir(&self, _req: &Request, ino: INodeNo, _flags: OpenFlags, reply: ReplyOpen) {
        let ino = u64::from(ino);
        debug!("opendir(ino={})", ino);
        match guarded("opendir", || self.opendir(ino)) {
            Ok(fh) => reply.opened(FileHandle(fh), FopenFlags::empty()),
            Err(e) => reply.error(e),
        }
    }

    fn readdir(
        &self,
        _req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        mut reply: ReplyDirectory,
    ) {
        let fh = u64::from(fh);
        debug!("readdir(ino={}, fh={}, offset={})", u64::from(ino), fh, offset);
        match guarded("readdir", || self.readdir(fh, offset)) {
            Ok(entries) => {
                for (i, entry) in entries.iter().enumerate() {
                    let next = offset + i as u64 + 1;
                    if reply.add(INodeNo(entry.id), next, kind_to_filetype(entry.kind), &entry.name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(e) => reply.error(e),
        }
    }

    fn releasedir(&self, _req: &Request, _ino: INodeNo, fh: FileHandle, _flags: OpenFlags, reply: ReplyEmpty) {
        let fh = u64::from(fh);
        debug!("releasedir(fh={})", fh);
        match guarded("releasedir", || self.releasedir(fh)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn statfs(&self, _req: &Request, _ino: INodeNo, reply: ReplyStatfs) {
        let st = self.statfs();
        reply.statfs(
            st.blocks, st.bfree, st.bavail, st.files, st.ffree, st.bsize, st.namelen, st.frsize,
        );
    }

    fn setxattr(
        &self,
        _req: &Request,
        ino: INodeNo,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let ino = u64::from(ino);
        debug!("setxattr(ino={}, name={:?})", ino, name);
        match guarded("setxattr", || self.setxattr(ino, utf8(name)?, value, flags)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn getxattr(&self, _req: &Request, ino: INodeNo, name: &OsStr, size: u32, reply: ReplyXattr) {
        let ino = u64::from(ino);
        debug!("getxattr(ino={}, name={:?}, size={})", ino, name, size);
        let res = guarded("getxattr", || {
            XattrReply::fit(self.getxattr(ino, utf8(name)?)?, size)
        });
        reply_xattr(reply, res);
    }

    fn listxattr(&self, _req: &Request, ino: INodeNo, size: u32, reply: ReplyXattr) {
        let ino = u64::from(ino);
        debug!("listxattr(ino={}, size={})", ino, size);
        let res = guarded("listxattr", || XattrReply::fit(self.listxattr(ino)?, size));
        reply_xattr(reply, res);
    }

    fn removexattr(&self, _req: &Request, ino: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        let ino = u64::from(ino);
        debug!("removexattr(ino={}, name={:?})", ino, name);
        match guarded("removexattr", || self.removexattr(ino, utf8(name)?)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn create(
        &self,
        req: &Request,
        parent: INodeNo,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let parent = u64::from(parent);
        debug!("create(parent={}, name={:?})", parent, name);
        match guarded("create", || self.create(parent, utf8(name)?, req.pid())) {
            Ok((entry, fh)) => reply.created(
                &entry.ttl(),
                &entry.attr,
                Generation(0),
                FileHandle(fh),
                open_flags(true),
            ),
            Err(e) => reply.error(e),
        }
    }
}
