pub mod attr;
pub mod buffer;
pub mod fuse;
pub mod handles;
pub mod inode;
pub mod inodes;
pub mod mount;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::FileAttr;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use self::attr::file_attr;
use self::buffer::BufferPool;
use self::handles::{resize_buffer, DirEntry, DirHandle, FileHandle, HandleTable};
use self::inode::{probe, Inode, Kind, Location, Probe, Stamp, ROOT_ID, SYMLINK_TARGET};
use self::inodes::InodeTable;
use self::mount::Mount;
use crate::backend::{
    Backend, BackendError, CopyBlobInput, GetBlobInput, ListBlobsInput, Metadata, PutBlobInput,
};
use crate::config::FsConfig;
use crate::error::{FsError, Result};
use crate::state::ticket::Ticket;

/// Read-only attribute exposing the blob's ETag.
pub const ETAG_XATTR: &str = "cloud.etag";
const USER_XATTR_PREFIX: &str = "user.";
const NAME_MAX: u32 = 255;

/// An inode as handed to the kernel, with how long each part may be cached.
#[derive(Debug, Clone)]
pub struct Entry {
    pub attr: FileAttr,
    pub attr_ttl: Duration,
    pub entry_ttl: Duration,
}

impl Entry {
    pub fn ino(&self) -> u64 {
        u64::from(self.attr.ino)
    }

    /// The single timeout used where the kernel protocol takes only one.
    /// Entry replies carry one TTL for both, so the two horizons stay apart
    /// only in getattr and setattr replies.
    pub fn ttl(&self) -> Duration {
        self.attr_ttl.min(self.entry_ttl)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statfs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// Answer to an xattr query under the kernel's buffer-size protocol.
#[derive(Debug, PartialEq, Eq)]
pub enum XattrReply {
    Size(u32),
    Data(Vec<u8>),
}

impl XattrReply {
    /// A zero `size` asks for the length only; a non-zero one too small for
    /// the value is ERANGE.
    pub fn fit(data: Vec<u8>, size: u32) -> Result<Self> {
        if size == 0 {
            Ok(XattrReply::Size(data.len() as u32))
        } else if data.len() > size as usize {
            Err(FsError::Range)
        } else {
            Ok(XattrReply::Data(data))
        }
    }
}

/// Thread-group id of `pid`, which identifies the process behind a request
/// issued by any of its threads.
#[cfg(target_os = "linux")]
pub fn process_group(pid: u32) -> Result<u32> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid))
        .map_err(|e| FsError::Internal(format!("pid {}: {}", pid, e)))?;
    status
        .lines()
        .find_map(|line| line.strip_prefix("Tgid:"))
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| FsError::Internal(format!("no Tgid for pid {}", pid)))
}

#[cfg(not(target_os = "linux"))]
pub fn process_group(pid: u32) -> Result<u32> {
    Ok(pid)
}

/// The thread-group that owns a new write handle. A caller that cannot be
/// resolved (pid 0, another pid namespace) leaves the handle unscoped.
fn owner_group(pid: u32) -> Option<u32> {
    process_group(pid)
        .inspect_err(|e| debug!("no thread-group for pid {}: {}", pid, e))
        .ok()
}

/// The filesystem: an inode tree over one or more object stores.
pub struct BucketFs {
    pub config: FsConfig,
    pub inodes: Arc<InodeTable>,
    pub file_handles: Arc<HandleTable<FileHandle>>,
    pub dir_handles: HandleTable<DirHandle>,
    pub pool: BufferPool,
    /// Bounds concurrent multipart part uploads.
    pub replicators: Arc<Ticket>,
    /// Bounds concurrent read-ahead fetches.
    pub restorers: Arc<Ticket>,
    pub mounts: Mutex<Vec<Arc<Mount>>>,
    /// Reported for entries the store never dated.
    pub mount_time: SystemTime,
}

impl BucketFs {
    pub fn new(config: FsConfig, backend: Arc<Backend>) -> Self {
        let root = Inode::new_root(backend, &config);
        let replicators = Arc::new(Ticket::new("replicators", config.replicators));
        let restorers = Arc::new(Ticket::new("restorers", config.restorers));
        Self {
            config,
            inodes: Arc::new(InodeTable::new(root)),
            file_handles: Arc::new(HandleTable::new()),
            dir_handles: HandleTable::new(),
            pool: BufferPool::default(),
            replicators,
            restorers,
            mounts: Mutex::new(Vec::new()),
            mount_time: SystemTime::now(),
        }
    }

    fn entry(&self, inode: &Inode) -> Entry {
        let attr = file_attr(inode, &inode.lock(), self.mount_time);
        Entry {
            attr,
            attr_ttl: self.config.stat_cache_ttl,
            entry_ttl: self.config.type_cache_ttl,
        }
    }

    fn dir(&self, id: u64) -> Result<Arc<Inode>> {
        let inode = self.inodes.get(id)?;
        if !inode.is_dir() {
            return Err(FsError::NotDir);
        }
        Ok(inode)
    }

    // ---- Lookup & attributes ----

    pub fn lookup(&self, parent: u64, name: &str) -> Result<Entry> {
        let parent = self.dir(parent)?;
        let inode = match name {
            "." => {
                parent.inc_ref(1);
                parent
            }
            ".." => {
                let up = parent.parent().unwrap_or(parent);
                up.inc_ref(1);
                up
            }
            _ => self.resolve(&parent, name)?,
        };
        debug!("lookup {:?} -> inode {}", name, inode.id);
        Ok(self.entry(&inode))
    }

    /// Find `name` under `parent`, revalidating with the store when the
    /// cached entry is stale. The returned inode carries one new reference.
    fn resolve(&self, parent: &Arc<Inode>, name: &str) -> Result<Arc<Inode>> {
        // The speculative reference is taken under the parent lock so a
        // concurrent forget or prune cannot reclaim the child in between.
        let cached = {
            let st = parent.lock();
            let dir = st.dir.as_ref().ok_or(FsError::NotDir)?;
            dir.children.get(name).map(|child| {
                child.inc_ref(1);
                Arc::clone(child)
            })
        };
        if let Some(ref child) = cached {
            if !child.attr_expired(&child.lock(), self.config.stat_cache_ttl) {
                return Ok(Arc::clone(child));
            }
        }

        let fetched = parent
            .location()
            .and_then(|loc| probe(&loc.child(name), self.config.explicit_dir));

        match (fetched, cached) {
            (Ok(Some(fresh)), Some(child)) if child.kind() == fresh.kind => {
                child.lock().merge(&fresh, child.handles() > 0);
                Ok(child)
            }
            (Ok(Some(fresh)), stale) => {
                if let Some(ref old) = stale {
                    old.dec_ref(1);
                }
                let build = |id| Inode::from_probe(id, name, parent, &fresh, &self.config);
                let (child, inserted) =
                    self.inodes.insert(parent, name, stale.as_ref(), 1, build)?;
                if !inserted && child.kind() == fresh.kind {
                    child.lock().merge(&fresh, child.handles() > 0);
                }
                if let Some(old) = stale {
                    self.inodes.purge_if_orphaned(&old);
                }
                Ok(child)
            }
            (Ok(None), Some(child)) if child.is_dir() && !self.config.explicit_dir => {
                // Implicit directories outlive their last remote child.
                child.lock().attr_stamp.touch();
                Ok(child)
            }
            (Ok(None), Some(child)) => {
                child.dec_ref(1);
                self.inodes.detach(parent, &child);
                Err(FsError::NotFound)
            }
            (Ok(None), None) => Err(FsError::NotFound),
            (Err(e), Some(child)) => {
                child.dec_ref(1);
                self.inodes.purge_if_orphaned(&child);
                Err(e)
            }
            (Err(e), None) => Err(e),
        }
    }

    /// The child named `name`, from the cache or the store, without keeping
    /// a kernel reference on it.
    fn child_of(&self, parent: &Arc<Inode>, name: &str) -> Result<Arc<Inode>> {
        let cached = parent
            .lock()
            .dir
            .as_ref()
            .ok_or(FsError::NotDir)?
            .children
            .get(name)
            .cloned();
        match cached {
            Some(child) => Ok(child),
            None => {
                let child = self.resolve(parent, name)?;
                child.dec_ref(1);
                Ok(child)
            }
        }
    }

    pub fn forget(&self, id: u64, nlookup: u64) -> Result<()> {
        self.inodes.forget(id, nlookup)?;
        Ok(())
    }

    pub fn getattr(&self, id: u64) -> Result<Entry> {
        let inode = self.inodes.get(id)?;
        let expired = inode.attr_expired(&inode.lock(), self.config.stat_cache_ttl);
        if expired && id != ROOT_ID {
            self.refresh(&inode)?;
        }
        Ok(self.entry(&inode))
    }

    fn refresh(&self, inode: &Arc<Inode>) -> Result<()> {
        let loc = inode.location()?;
        match probe(&loc, self.config.explicit_dir)? {
            Some(fresh) if fresh.kind == inode.kind()
                || (inode.kind() == Kind::Symlink && fresh.kind == Kind::File) =>
            {
                inode.lock().merge(&fresh, inode.handles() > 0);
                Ok(())
            }
            None if inode.is_dir() && !self.config.explicit_dir => {
                inode.lock().attr_stamp.touch();
                Ok(())
            }
            _ => {
                if let Some(parent) = inode.parent() {
                    self.inodes.detach(&parent, inode);
                }
                Err(FsError::NotFound)
            }
        }
    }

    /// Apply a size and/or mtime change. Ownership and permission bits come
    /// from configuration and are left as they are.
    pub fn setattr(
        &self,
        id: u64,
        size: Option<u64>,
        mtime: Option<SystemTime>,
        fh: Option<u64>,
    ) -> Result<Entry> {
        let inode = self.inodes.get(id)?;
        if let Some(size) = size {
            if inode.is_dir() {
                return Err(FsError::IsDir);
            }
            match fh {
                Some(fh) => self.file_handles.get(fh)?.truncate(self, size)?,
                None => self.truncate_remote(&inode, size)?,
            }
        }
        if let Some(mtime) = mtime {
            inode.lock().attrs.mtime = Some(mtime);
        }
        Ok(self.entry(&inode))
    }

    fn truncate_remote(&self, inode: &Arc<Inode>, size: u64) -> Result<()> {
        if size > self.config.max_file_size {
            return Err(FsError::FileTooLarge);
        }
        let loc = inode.location()?;
        let metadata = self.load_metadata(inode)?;
        let mut body = if size == 0 {
            Vec::new()
        } else {
            loc.backend()
                .get_blob(GetBlobInput {
                    key: loc.key(),
                    ..Default::default()
                })?
                .body
        };
        resize_buffer(&mut body, size, self.config.max_file_size)?;
        let out = loc.backend().put_blob(PutBlobInput {
            key: loc.key(),
            metadata,
            body,
            ..Default::default()
        })?;

        let mut st = inode.lock();
        st.known_etag = out.etag;
        st.known_size = Some(size);
        st.attrs.size = size;
        st.attrs.mtime = Some(SystemTime::now());
        st.invalidate_cache = true;
        st.attr_stamp.touch();
        Ok(())
    }

    pub fn statfs(&self) -> Statfs {
        const BLOCK_SIZE: u32 = 4096;
        const TOTAL_SPACE: u64 = 1024 * 1024 * 1024 * 1024 * 1024;
        const INODES: u64 = 1_000_000_000;
        const IO_SIZE: u32 = 1024 * 1024;

        let capacity = self
            .inodes
            .root()
            .binding()
            .and_then(|b| b.backend.capabilities().capacity);
        match capacity {
            Some(c) => Statfs {
                blocks: c.blocks,
                bfree: c.blocks_free,
                bavail: c.blocks_available,
                files: c.inodes,
                ffree: c.inodes_free,
                bsize: c.io_size.max(c.block_size),
                namelen: NAME_MAX,
                frsize: c.block_size,
            },
            None => {
                let blocks = TOTAL_SPACE / u64::from(BLOCK_SIZE);
                Statfs {
                    blocks,
                    bfree: blocks,
                    bavail: blocks,
                    files: INODES,
                    ffree: INODES,
                    bsize: IO_SIZE,
                    namelen: NAME_MAX,
                    frsize: BLOCK_SIZE,
                }
            }
        }
    }

    // ---- Extended attributes ----

    /// User metadata, fetched by HEAD on first use.
    fn load_metadata(&self, inode: &Arc<Inode>) -> Result<Metadata> {
        {
            let st = inode.lock();
            if let Some(ref md) = st.metadata {
                return Ok(md.clone());
            }
            if !inode.is_dir() && st.known_size.is_none() {
                return Ok(Metadata::new());
            }
        }
        let loc = inode.location()?;
        let key = if inode.is_dir() { loc.dir_prefix() } else { loc.key() };
        if key.is_empty() {
            return Ok(Metadata::new());
        }

        let head = match loc.backend().head_blob(&key) {
            Ok(head) => head,
            // An implicit directory has nowhere to keep metadata.
            Err(e) if e.is_not_found() && inode.is_dir() => return Ok(Metadata::new()),
            Err(e) => return Err(e.into()),
        };
        let mut st = inode.lock();
        if st.known_etag.is_none() {
            st.known_etag = head.item.etag.clone();
        }
        st.metadata = Some(head.metadata.clone());
        Ok(head.metadata)
    }

    fn store_metadata(&self, inode: &Arc<Inode>, metadata: Metadata) -> Result<()> {
        let local = !inode.is_dir() && inode.lock().known_size.is_none();
        if !local {
            let loc = inode.location()?;
            let backend = loc.backend();
            if inode.is_dir() {
                let key = loc.dir_prefix();
                if key.is_empty() {
                    return Err(FsError::Unsupported);
                }
                backend.put_blob(PutBlobInput {
                    key,
                    metadata: metadata.clone(),
                    dir_blob: true,
                    ..Default::default()
                })?;
            } else {
                let (etag, size) = {
                    let st = inode.lock();
                    (st.known_etag.clone(), st.known_size)
                };
                backend.copy_blob(CopyBlobInput {
                    source: loc.key(),
                    destination: loc.key(),
                    size,
                    etag,
                    metadata: Some(metadata.clone()),
                    storage_class: None,
                })?;
            }
        }

        let mut st = inode.lock();
        st.metadata = Some(metadata);
        if !local {
            // The self-copy produced a new ETag; pick it up on the next query.
            st.known_etag = None;
            st.attr_stamp = Stamp::Expired;
        }
        Ok(())
    }

    pub fn getxattr(&self, id: u64, name: &str) -> Result<Vec<u8>> {
        let inode = self.inodes.get(id)?;
        if name == ETAG_XATTR {
            self.load_metadata(&inode)?;
            let stale = {
                let st = inode.lock();
                st.known_etag.is_none() && inode.attr_expired(&st, self.config.stat_cache_ttl)
            };
            if stale && inode.id != ROOT_ID {
                self.refresh(&inode)?;
            }
            let etag = inode.lock().known_etag.clone();
            return etag.map(String::into_bytes).ok_or(FsError::NoAttr);
        }
        let Some(key) = name.strip_prefix(USER_XATTR_PREFIX) else {
            return Err(FsError::NoAttr);
        };
        self.load_metadata(&inode)?
            .remove(key)
            .map(String::into_bytes)
            .ok_or(FsError::NoAttr)
    }

    /// NUL-terminated attribute names.
    pub fn listxattr(&self, id: u64) -> Result<Vec<u8>> {
        let inode = self.inodes.get(id)?;
        let metadata = self.load_metadata(&inode)?;
        let mut out = Vec::new();
        if inode.lock().known_etag.is_some() {
            out.extend_from_slice(ETAG_XATTR.as_bytes());
            out.push(0);
        }
        for key in metadata.keys().filter(|k| k.as_str() != SYMLINK_TARGET) {
            out.extend_from_slice(USER_XATTR_PREFIX.as_bytes());
            out.extend_from_slice(key.as_bytes());
            out.push(0);
        }
        Ok(out)
    }

    pub fn setxattr(&self, id: u64, name: &str, value: &[u8], flags: i32) -> Result<()> {
        let inode = self.inodes.get(id)?;
        let key = user_xattr_key(name)?;
        let value = std::str::from_utf8(value).map_err(|_| FsError::Invalid)?;
        let mut metadata = self.load_metadata(&inode)?;
        let exists = metadata.contains_key(key);
        if flags & libc::XATTR_CREATE != 0 && exists {
            return Err(FsError::Exists);
        }
        if flags & libc::XATTR_REPLACE != 0 && !exists {
            return Err(FsError::NoAttr);
        }
        metadata.insert(key.to_string(), value.to_string());
        self.store_metadata(&inode, metadata)
    }

    pub fn removexattr(&self, id: u64, name: &str) -> Result<()> {
        let inode = self.inodes.get(id)?;
        let key = user_xattr_key(name)?;
        let mut metadata = self.load_metadata(&inode)?;
        if metadata.remove(key).is_none() {
            return Err(FsError::NoAttr);
        }
        self.store_metadata(&inode, metadata)
    }

    // ---- Directories ----

    pub fn opendir(&self, id: u64) -> Result<u64> {
        let inode = self.dir(id)?;
        Ok(self.dir_handles.alloc(DirHandle::new(inode)))
    }

    pub fn readdir(&self, fh: u64, offset: u64) -> Result<Vec<DirEntry>> {
        self.dir_handles.get(fh)?.read(self, offset)
    }

    pub fn releasedir(&self, fh: u64) -> Result<()> {
        self.dir_handles
            .remove(fh)
            .map(|_| ())
            .ok_or(FsError::BadHandle(fh))
    }

    // ---- Files ----

    /// Open a file; returns the handle id and whether the kernel may keep
    /// its page cache.
    pub fn open(&self, id: u64, flags: i32, pid: u32) -> Result<(u64, bool)> {
        let inode = self.inodes.get(id)?;
        if inode.is_dir() {
            return Err(FsError::IsDir);
        }
        let writing = flags & libc::O_ACCMODE != libc::O_RDONLY;
        let tgid = if writing { owner_group(pid) } else { None };
        let truncate = writing && flags & libc::O_TRUNC != 0;

        let keep = {
            let mut st = inode.lock();
            let keep = !st.invalidate_cache && !truncate;
            st.invalidate_cache = false;
            keep
        };
        inode.open_handle();
        let handle = FileHandle::new(Arc::clone(&inode), tgid, keep);
        if truncate {
            if let Err(e) = handle.truncate(self, 0) {
                inode.close_handle();
                return Err(e);
            }
        }
        let fh = self.file_handles.alloc(handle);
        debug!("open inode {} -> fh {} (keep_cache={})", id, fh, keep);
        Ok((fh, keep))
    }

    pub fn read(&self, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>> {
        self.file_handles.get(fh)?.read(self, offset, size)
    }

    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Result<u32> {
        self.file_handles.get(fh)?.write(self, offset, data)
    }

    /// Upload pending writes, unless the request comes from a process other
    /// than the one that opened the handle for writing.
    pub fn flush(&self, fh: u64, pid: u32) -> Result<()> {
        let handle = self.file_handles.get(fh)?;
        if let Some(owner) = handle.tgid {
            let caller = process_group(pid)?;
            if caller != owner {
                debug!("fh {}: ignoring flush from tgid {} (owner {})", fh, caller, owner);
                return Ok(());
            }
        }
        self.flush_handle(&handle)
    }

    fn flush_handle(&self, handle: &FileHandle) -> Result<()> {
        handle.flush(self).inspect_err(|_| {
            let mut st = handle.inode.lock();
            if st.known_size.is_none() {
                st.attr_stamp = Stamp::Expired;
            }
        })
    }

    /// Writes are uploaded on flush and release only.
    pub fn fsync(&self, fh: u64) -> Result<()> {
        self.file_handles.get(fh).map(|_| ())
    }

    pub fn release(&self, fh: u64) -> Result<()> {
        let handle = self.file_handles.remove(fh).ok_or(FsError::BadHandle(fh))?;
        if handle.is_dirty() {
            if let Err(e) = self.flush_handle(&handle) {
                warn!("fh {}: upload of {} on release failed: {}", fh, handle.inode.path(), e);
            }
        }
        handle.inode.close_handle();
        handle.recycle(self);
        Ok(())
    }

    // ---- Namespace ----

    /// Create a file that exists only locally until its first flush.
    pub fn create(&self, parent: u64, name: &str, pid: u32) -> Result<(Entry, u64)> {
        let parent = self.dir(parent)?;
        let tgid = owner_group(pid);
        let build = |id| {
            let inode = Inode::new(id, Kind::File, name, Some(&parent), &self.config);
            inode.lock().attrs.mtime = Some(SystemTime::now());
            inode
        };
        let (inode, inserted) = self.inodes.insert(&parent, name, None, 1, build)?;
        if !inserted {
            inode.dec_ref(1);
            return Err(FsError::Exists);
        }

        inode.open_handle();
        let handle = FileHandle::new_local(Arc::clone(&inode), tgid, self.pool.acquire());
        let fh = self.file_handles.alloc(handle);
        debug!("created {} -> inode {}, fh {}", inode.path(), inode.id, fh);
        Ok((self.entry(&inode), fh))
    }

    pub fn mkdir(&self, parent: u64, name: &str) -> Result<Entry> {
        let parent = self.dir(parent)?;
        if parent.lock().dir.as_ref().is_some_and(|d| d.children.contains_key(name)) {
            return Err(FsError::Exists);
        }
        let loc = parent.location()?.child(name);
        let out = loc.backend().put_blob(PutBlobInput {
            key: loc.dir_prefix(),
            dir_blob: true,
            ..Default::default()
        })?;

        let build = |id| {
            let inode = Inode::new(id, Kind::Dir, name, Some(&parent), &self.config);
            {
                let mut st = inode.lock();
                st.attrs.mtime = Some(SystemTime::now());
                st.known_etag = out.etag.clone();
                if let Some(dir) = st.dir.as_mut() {
                    dir.list_stamp = Stamp::now();
                }
            }
            inode
        };
        let (inode, inserted) = self.inodes.insert(&parent, name, None, 1, build)?;
        if !inserted {
            inode.dec_ref(1);
            return Err(FsError::Exists);
        }
        Ok(self.entry(&inode))
    }

    pub fn unlink(&self, parent: u64, name: &str) -> Result<()> {
        let parent = self.dir(parent)?;
        let child = self.child_of(&parent, name)?;
        if child.is_dir() {
            return Err(FsError::IsDir);
        }
        let loc = child.location()?;
        let local = child.lock().known_size.is_none();
        match loc.backend().delete_blob(&loc.key()) {
            Ok(()) => {}
            Err(e) if e.is_not_found() && local => {}
            Err(e) => return Err(e.into()),
        }
        self.inodes.detach(&parent, &child);
        Ok(())
    }

    pub fn rmdir(&self, parent: u64, name: &str) -> Result<()> {
        let parent = self.dir(parent)?;
        let child = self.child_of(&parent, name)?;
        if !child.is_dir() {
            return Err(FsError::NotDir);
        }
        if child.binding().is_some() {
            return Err(FsError::NotPermitted);
        }
        let busy = child.lock().dir.as_ref().is_some_and(|d| {
            d.children
                .values()
                .any(|c| c.handles() > 0 || c.is_dir() && c.binding().is_some())
        });
        if busy {
            return Err(FsError::NotEmpty);
        }

        let loc = child.location()?;
        let marker = loc.dir_prefix();
        let listing = loc.backend().list_blobs(ListBlobsInput {
            prefix: Some(marker.clone()),
            max_keys: Some(2),
            ..Default::default()
        })?;
        if listing.prefixes.iter().chain(listing.items.iter().map(|i| &i.key)).any(|k| *k != marker) {
            return Err(FsError::NotEmpty);
        }
        match loc.backend().delete_blob(&marker) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        self.inodes.detach(&parent, &child);
        Ok(())
    }

    pub fn symlink(&self, parent: u64, name: &str, target: &str) -> Result<Entry> {
        let parent = self.dir(parent)?;
        if parent.lock().dir.as_ref().is_some_and(|d| d.children.contains_key(name)) {
            return Err(FsError::Exists);
        }
        let loc = parent.location()?.child(name);
        let mut metadata = Metadata::new();
        metadata.insert(SYMLINK_TARGET.to_string(), target.to_string());
        let out = loc.backend().put_blob(PutBlobInput {
            key: loc.key(),
            metadata: metadata.clone(),
            ..Default::default()
        })?;

        let fresh = Probe {
            kind: Kind::Symlink,
            size: 0,
            mtime: Some(out.last_modified.map_or_else(SystemTime::now, SystemTime::from)),
            etag: out.etag,
            metadata: Some(metadata),
            symlink_target: Some(target.to_string()),
        };
        let build = |id| Inode::from_probe(id, name, &parent, &fresh, &self.config);
        let (inode, inserted) = self.inodes.insert(&parent, name, None, 1, build)?;
        if !inserted {
            inode.dec_ref(1);
            return Err(FsError::Exists);
        }
        Ok(self.entry(&inode))
    }

    pub fn readlink(&self, id: u64) -> Result<String> {
        let inode = self.inodes.get(id)?;
        if inode.kind() != Kind::Symlink {
            return Err(FsError::Invalid);
        }
        if let Some(target) = inode.lock().symlink_target.clone() {
            return Ok(target);
        }
        let loc = inode.location()?;
        let fresh = Probe::from_head(loc.backend().head_blob(&loc.key())?);
        inode.lock().merge(&fresh, inode.handles() > 0);
        fresh.symlink_target.ok_or(FsError::Invalid)
    }

    // ---- Rename ----

    /// Move `name` under `parent` to `new_name` under `new_parent`. The store
    /// is updated first with no locks held; the tree then changes under both
    /// directory locks, taken in id order.
    pub fn rename(&self, parent: u64, name: &str, new_parent: u64, new_name: &str) -> Result<()> {
        if new_name.is_empty() || new_name == "." || new_name == ".." || new_name.contains('/') {
            return Err(FsError::Invalid);
        }
        let src_dir = self.dir(parent)?;
        let dst_dir = self.dir(new_parent)?;
        let child = self.child_of(&src_dir, name)?;
        if child.binding().is_some() {
            return Err(FsError::NotPermitted);
        }

        let from = child.location()?;
        let to = dst_dir.location()?.child(new_name);
        if !Arc::ptr_eq(from.backend(), to.backend()) {
            return Err(FsError::CrossDevice);
        }

        let existing = dst_dir
            .lock()
            .dir
            .as_ref()
            .and_then(|d| d.children.get(new_name).cloned());
        if let Some(ref existing) = existing {
            if Arc::ptr_eq(existing, &child) {
                return Ok(());
            }
            match (child.is_dir(), existing.is_dir()) {
                (true, false) => return Err(FsError::NotDir),
                (false, true) => return Err(FsError::IsDir),
                _ => {}
            }
        }

        if child.is_dir() {
            // Moving a directory below itself.
            let mut up = Some(Arc::clone(&dst_dir));
            while let Some(dir) = up {
                if Arc::ptr_eq(&dir, &child) {
                    return Err(FsError::Invalid);
                }
                up = dir.parent();
            }
            self.rename_prefix(&from, &to)?;
        } else {
            match self.rename_key(from.backend(), &from.key(), &to.key()) {
                Ok(()) => {}
                Err(e) if e.is_not_found() && child.handles() > 0 => {
                    debug!("{} is not uploaded yet; renaming locally", from.key());
                }
                Err(e) => return Err(e),
            }
        }

        let replaced = self.relink(&src_dir, &child, &dst_dir, new_name);
        if let Some(old) = replaced {
            self.inodes.purge_if_orphaned(&old);
        }
        info!("renamed {} -> {}", from.key(), to.key());
        Ok(())
    }

    /// Move `child` from `src` to `dst` as `new_name`; returns the inode it
    /// displaced, if any.
    fn relink(
        &self,
        src: &Arc<Inode>,
        child: &Arc<Inode>,
        dst: &Arc<Inode>,
        new_name: &str,
    ) -> Option<Arc<Inode>> {
        let same = Arc::ptr_eq(src, dst);
        let (first, second) = if src.id <= dst.id { (src, dst) } else { (dst, src) };
        let mut first_st = first.lock();
        let mut second_st = if same { None } else { Some(second.lock()) };

        let (src_st, dst_st) = match second_st.as_mut() {
            None => (None, &mut *first_st),
            Some(second_st) if Arc::ptr_eq(first, src) => (Some(&mut *first_st), &mut **second_st),
            Some(second_st) => (Some(&mut **second_st), &mut *first_st),
        };
        let Some(dst_state) = dst_st.dir.as_mut() else {
            return None;
        };

        let mut moved = false;
        match src_st {
            Some(src_st) => {
                if let Some(src_state) = src_st.dir.as_mut() {
                    moved = src_state.detach(child);
                }
            }
            None => moved = dst_state.detach(child),
        }

        let mut replaced = None;
        if let Some(old) = dst_state.children.get(new_name).cloned() {
            dst_state.detach(&old);
            replaced = Some(old);
        }
        // Forgotten while the store was being updated: leave the new name
        // to be found by the next lookup.
        if moved {
            child.set_link(new_name, dst);
            dst_state
                .children
                .insert(new_name.to_string(), Arc::clone(child));
        }
        replaced
    }

    /// Rename one key, falling back to copy and delete where the store has
    /// no native rename.
    fn rename_key(&self, backend: &Arc<Backend>, from: &str, to: &str) -> Result<()> {
        match backend.rename_blob(from, to) {
            Err(BackendError::Unsupported) => {
                backend.copy_blob(CopyBlobInput {
                    source: from.to_string(),
                    destination: to.to_string(),
                    ..Default::default()
                })?;
                backend.delete_blob(from)?;
                Ok(())
            }
            res => Ok(res?),
        }
    }

    fn rename_prefix(&self, from: &Location, to: &Location) -> Result<()> {
        let backend = from.backend();
        let (src, dst) = (from.dir_prefix(), to.dir_prefix());

        let occupied = backend.list_blobs(ListBlobsInput {
            prefix: Some(dst.clone()),
            max_keys: Some(2),
            ..Default::default()
        })?;
        if occupied.items.iter().any(|i| i.key != dst) {
            return Err(FsError::NotEmpty);
        }

        let mut keys = Vec::new();
        let mut token = None;
        loop {
            let page = backend.list_blobs(ListBlobsInput {
                prefix: Some(src.clone()),
                continuation_token: token,
                ..Default::default()
            })?;
            keys.extend(page.items.into_iter().map(|i| i.key));
            if !page.is_truncated || page.next_continuation_token.is_none() {
                break;
            }
            token = page.next_continuation_token;
        }
        debug!("moving {} keys from {} to {}", keys.len(), src, dst);
        for key in keys {
            let target = format!("{}{}", dst, &key[src.len()..]);
            self.rename_key(backend, &key, &target)?;
        }
        Ok(())
    }
}

fn user_xattr_key(name: &str) -> Result<&str> {
    if name == ETAG_XATTR {
        return Err(FsError::NotPermitted);
    }
    match name.strip_prefix(USER_XATTR_PREFIX) {
        Some(key) if !key.is_empty() && key != SYMLINK_TARGET => Ok(key),
        Some(_) => Err(FsError::Invalid),
        None => Err(FsError::Unsupported),
    }
}
