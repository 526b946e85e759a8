use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::inode::{Inode, Kind, Location, Probe, Stamp};
use super::BucketFs;
use crate::backend::{
    Backend, BackendError, GetBlobInput, ListBlobsInput, ListBlobsOutput, Metadata,
    MultipartBeginInput, PutBlobInput, PutBlobOutput,
};
use crate::error::{FsError, Result};
use crate::state::ticket::Ticket;

/// Open handles of one kind, keyed by the id handed to the kernel.
pub struct HandleTable<H> {
    handles: DashMap<u64, Arc<H>>,
    next_fh: AtomicU64,
}

impl<H> HandleTable<H> {
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_fh: AtomicU64::new(1),
        }
    }

    pub fn alloc(&self, handle: H) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(fh, Arc::new(handle));
        fh
    }

    pub fn get(&self, fh: u64) -> Result<Arc<H>> {
        self.handles
            .get(&fh)
            .map(|h| Arc::clone(h.value()))
            .ok_or(FsError::BadHandle(fh))
    }

    pub fn remove(&self, fh: u64) -> Option<Arc<H>> {
        self.handles.remove(&fh).map(|(_, h)| h)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl<H> Default for HandleTable<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// An open file, as reported when an unmount is refused.
#[derive(Debug, Clone)]
pub struct OpenFileInfo {
    pub fh: u64,
    pub path: String,
    pub tgid: Option<u32>,
}

impl HandleTable<FileHandle> {
    pub fn list_open(&self) -> Vec<OpenFileInfo> {
        let mut open: Vec<OpenFileInfo> = self
            .handles
            .iter()
            .map(|entry| OpenFileInfo {
                fh: *entry.key(),
                path: entry.value().inode.path(),
                tgid: entry.value().tgid,
            })
            .collect();
        open.sort_by_key(|info| info.fh);
        open
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub id: u64,
    pub kind: Kind,
    pub name: String,
}

#[derive(Default)]
struct Cursor {
    started: bool,
    entries: Vec<DirEntry>,
    names: HashSet<String>,
    /// Names the store reported during this listing.
    listed: HashSet<String>,
    token: Option<String>,
    listing_done: bool,
    done: bool,
}

impl Cursor {
    fn push(&mut self, entry: DirEntry) {
        if self.names.insert(entry.name.clone()) {
            self.entries.push(entry);
        }
    }

    fn from(&self, offset: usize) -> Vec<DirEntry> {
        self.entries.get(offset..).map(<[_]>::to_vec).unwrap_or_default()
    }
}

/// An open directory: a cursor over cached children merged with a paged
/// store listing.
pub struct DirHandle {
    pub inode: Arc<Inode>,
    cursor: Mutex<Cursor>,
}

impl DirHandle {
    pub fn new(inode: Arc<Inode>) -> Self {
        Self {
            inode,
            cursor: Mutex::new(Cursor::default()),
        }
    }

    /// Entries from position `offset` on, fetching the next store page when
    /// the kernel has consumed everything seen so far.
    pub fn read(&self, fs: &BucketFs, offset: u64) -> Result<Vec<DirEntry>> {
        let offset = offset as usize;
        if !self.cursor.lock().started {
            self.start(fs)?;
        }

        loop {
            let loc = self.inode.location()?;
            let page = {
                let mut cur = self.cursor.lock();
                if offset < cur.entries.len() || cur.done {
                    return Ok(cur.from(offset));
                }
                if cur.listing_done {
                    None
                } else {
                    let page = self.list_page(fs, &loc, cur.token.clone())?;
                    cur.token = page.next_continuation_token.clone();
                    cur.listing_done = !page.is_truncated || cur.token.is_none();
                    Some(page)
                }
            };

            if let Some(page) = page {
                let fresh = fs.materialize(&self.inode, &loc, &page)?;
                let mut cur = self.cursor.lock();
                for entry in fresh {
                    cur.listed.insert(entry.name.clone());
                    cur.push(entry);
                }
                if !cur.listing_done {
                    continue;
                }
            }

            self.finish(fs);
        }
    }

    fn start(&self, fs: &BucketFs) -> Result<()> {
        let parent_id = self.inode.parent().map_or(self.inode.id, |p| p.id);
        let (fresh, cached) = {
            let st = self.inode.lock();
            let dir = st.dir.as_ref().ok_or(FsError::NotDir)?;
            let fresh = !dir.list_stamp.expired(fs.config.type_cache_ttl);
            let cached: Vec<DirEntry> = dir
                .children
                .iter()
                .map(|(name, child)| DirEntry {
                    id: child.id,
                    kind: child.kind(),
                    name: name.clone(),
                })
                .collect();
            (fresh, cached)
        };

        let mut cur = self.cursor.lock();
        if cur.started {
            return Ok(());
        }
        cur.started = true;
        cur.push(DirEntry {
            id: self.inode.id,
            kind: Kind::Dir,
            name: ".".to_string(),
        });
        cur.push(DirEntry {
            id: parent_id,
            kind: Kind::Dir,
            name: "..".to_string(),
        });
        if fresh {
            debug!("readdir of inode {} served from cache", self.inode.id);
            for entry in cached {
                cur.push(entry);
            }
            cur.listing_done = true;
            cur.done = true;
        }
        Ok(())
    }

    fn list_page(
        &self,
        fs: &BucketFs,
        loc: &Location,
        token: Option<String>,
    ) -> Result<ListBlobsOutput> {
        Ok(loc.backend().list_blobs(ListBlobsInput {
            prefix: Some(loc.dir_prefix()),
            delimiter: Some("/".to_string()),
            max_keys: Some(fs.config.dir_page_size),
            continuation_token: token,
            ..Default::default()
        })?)
    }

    /// The store listing is complete: drop children it no longer reports and
    /// append the cached ones it never listed but that must stay.
    fn finish(&self, fs: &BucketFs) {
        let listed = {
            let mut cur = self.cursor.lock();
            if cur.done {
                return;
            }
            std::mem::take(&mut cur.listed)
        };

        // Pruning takes table and inode locks, so the cursor is not held here.
        let implicit_dirs = !fs.config.explicit_dir;
        let kept = fs.inodes.prune(&self.inode, |name, child| {
            if listed.contains(name) || child.handles() > 0 {
                return true;
            }
            // An implicit directory outlives its last remote child.
            if implicit_dirs && child.is_dir() {
                return true;
            }
            let st = child.lock();
            // Created here and not flushed yet.
            let local = child.kind() == Kind::File && st.known_size.is_none();
            local || child.is_pinned(&st)
        });
        if let Some(dir) = self.inode.lock().dir.as_mut() {
            dir.list_stamp = Stamp::now();
        }

        let mut cur = self.cursor.lock();
        if cur.done {
            return;
        }
        for child in kept {
            cur.push(DirEntry {
                id: child.id,
                kind: child.kind(),
                name: child.name(),
            });
        }
        cur.done = true;
    }
}

/// Resize a whole-file buffer, zero-filling any gap. Sizes past `limit`, or
/// that cannot be reserved, fail the request instead of the process.
pub(crate) fn resize_buffer(buf: &mut Vec<u8>, size: u64, limit: u64) -> Result<()> {
    if size > limit {
        return Err(FsError::FileTooLarge);
    }
    let size = usize::try_from(size).map_err(|_| FsError::FileTooLarge)?;
    if size > buf.len() {
        buf.try_reserve_exact(size - buf.len())
            .map_err(|_| FsError::OutOfMemory)?;
    }
    buf.resize(size, 0);
    Ok(())
}

struct FileState {
    /// Whole-file contents once the handle has written or truncated.
    buf: Option<Vec<u8>>,
    dirty: bool,
    last_read_end: u64,
}

struct Prefetch {
    offset: u64,
    data: Vec<u8>,
    /// The chunk reaches the end of the blob.
    eof: bool,
}

/// An open regular file.
pub struct FileHandle {
    pub inode: Arc<Inode>,
    /// Thread-group that opened the handle, when flushes are scoped to it.
    pub tgid: Option<u32>,
    pub keep_page_cache: bool,
    state: Mutex<FileState>,
    prefetch: Arc<Mutex<Option<Prefetch>>>,
}

impl FileHandle {
    pub fn new(inode: Arc<Inode>, tgid: Option<u32>, keep_page_cache: bool) -> Self {
        Self {
            inode,
            tgid,
            keep_page_cache,
            state: Mutex::new(FileState {
                buf: None,
                dirty: false,
                last_read_end: 0,
            }),
            prefetch: Arc::new(Mutex::new(None)),
        }
    }

    /// A handle on a file that exists only locally so far.
    pub fn new_local(inode: Arc<Inode>, tgid: Option<u32>, buf: Vec<u8>) -> Self {
        let handle = Self::new(inode, tgid, true);
        {
            let mut st = handle.state.lock();
            st.buf = Some(buf);
            st.dirty = true;
        }
        handle
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    /// The store copy, when there is one worth keeping.
    fn remote_body(&self, fs: &BucketFs) -> Result<Vec<u8>> {
        let (etag, size) = {
            let st = self.inode.lock();
            (st.known_etag.clone(), st.known_size)
        };
        let mut buf = fs.pool.acquire();
        if size.unwrap_or(0) > 0 {
            let loc = self.inode.location()?;
            let out = loc.backend().get_blob(GetBlobInput {
                key: loc.key(),
                if_match: etag,
                ..Default::default()
            })?;
            buf.extend_from_slice(&out.body);
        }
        Ok(buf)
    }

    pub fn read(&self, fs: &BucketFs, offset: u64, size: u32) -> Result<Vec<u8>> {
        if size == 0 {
            return Ok(Vec::new());
        }
        {
            let st = self.state.lock();
            if let Some(ref buf) = st.buf {
                let start = (offset as usize).min(buf.len());
                let end = start.saturating_add(size as usize).min(buf.len());
                return Ok(buf[start..end].to_vec());
            }
        }

        if let Some(data) = self.take_prefetched(offset, size) {
            debug!("inode {}: read at {} served by read-ahead", self.inode.id, offset);
            self.note_read(fs, offset, data.len() as u64, size);
            return Ok(data);
        }

        let etag = self.inode.lock().known_etag.clone();
        let loc = self.inode.location()?;
        let out = loc.backend().get_blob(GetBlobInput {
            key: loc.key(),
            start: offset,
            count: u64::from(size),
            if_match: etag,
        });
        let out = match out {
            Ok(out) => out,
            Err(BackendError::Http { status: 412, .. }) => {
                let mut st = self.inode.lock();
                st.invalidate_cache = true;
                st.attr_stamp = Stamp::Expired;
                warn!("{} changed while open", loc.key());
                return Err(FsError::Backend(BackendError::Http {
                    status: 412,
                    message: "changed while open".to_string(),
                }));
            }
            Err(e) => return Err(e.into()),
        };
        self.note_read(fs, offset, out.body.len() as u64, size);
        Ok(out.body)
    }

    fn take_prefetched(&self, offset: u64, size: u32) -> Option<Vec<u8>> {
        let pf = self.prefetch.lock();
        let pf = pf.as_ref()?;
        let chunk_end = pf.offset + pf.data.len() as u64;
        let want_end = offset + u64::from(size);
        if offset < pf.offset || offset > chunk_end || (want_end > chunk_end && !pf.eof) {
            return None;
        }
        let start = (offset - pf.offset) as usize;
        let end = (want_end.min(chunk_end) - pf.offset) as usize;
        Some(pf.data[start..end].to_vec())
    }

    /// Track sequential access and schedule read-ahead after a full read
    /// that continued the previous one.
    fn note_read(&self, fs: &BucketFs, offset: u64, got: u64, wanted: u32) {
        let sequential = {
            let mut st = self.state.lock();
            let sequential = offset > 0 && st.last_read_end == offset;
            st.last_read_end = offset + got;
            sequential
        };
        if sequential && got == u64::from(wanted) {
            self.schedule_readahead(fs, offset + got);
        }
    }

    fn schedule_readahead(&self, fs: &BucketFs, start: u64) {
        let covered = self.prefetch.lock().as_ref().is_some_and(|pf| {
            pf.offset <= start && (start < pf.offset + pf.data.len() as u64 || pf.eof)
        });
        if covered || fs.config.readahead_size == 0 {
            return;
        }
        let Ok(loc) = self.inode.location() else {
            return;
        };
        if !fs.restorers.take(1, false) {
            debug!("read-ahead for {} skipped: restorers busy", loc.key());
            return;
        }

        let restorers: Arc<Ticket> = Arc::clone(&fs.restorers);
        let slot = Arc::clone(&self.prefetch);
        let backend: Arc<Backend> = Arc::clone(loc.backend());
        let count = fs.config.readahead_size;
        let input = GetBlobInput {
            key: loc.key(),
            start,
            count,
            if_match: self.inode.lock().known_etag.clone(),
        };
        let spawned = std::thread::Builder::new()
            .name("bucketfs-readahead".to_string())
            .spawn(move || {
                match backend.get_blob(input) {
                    Ok(out) => {
                        let eof = (out.body.len() as u64) < count;
                        *slot.lock() = Some(Prefetch {
                            offset: start,
                            data: out.body,
                            eof,
                        });
                    }
                    Err(e) => debug!("read-ahead at {} failed: {}", start, e),
                }
                restorers.release(1);
            });
        if let Err(e) = spawned {
            warn!("failed to spawn read-ahead: {}", e);
            fs.restorers.release(1);
        }
    }

    /// Buffer `data` at `offset`. Nothing reaches the store until flush.
    pub fn write(&self, fs: &BucketFs, offset: u64, data: &[u8]) -> Result<u32> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(FsError::FileTooLarge)?;
        if end > fs.config.max_file_size {
            return Err(FsError::FileTooLarge);
        }

        let loaded = if self.state.lock().buf.is_none() {
            Some(self.remote_body(fs)?)
        } else {
            None
        };

        let len = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            if st.buf.is_none() {
                st.buf = loaded;
            } else if let Some(spare) = loaded {
                fs.pool.release(spare);
            }
            let buf = st.buf.get_or_insert_with(Vec::new);
            if (buf.len() as u64) < end {
                resize_buffer(buf, end, fs.config.max_file_size)?;
            }
            buf[offset as usize..end as usize].copy_from_slice(data);
            st.dirty = true;
            buf.len() as u64
        };
        *self.prefetch.lock() = None;

        let mut st = self.inode.lock();
        st.attrs.size = len;
        st.attrs.mtime = Some(SystemTime::now());
        Ok(data.len() as u32)
    }

    pub fn truncate(&self, fs: &BucketFs, size: u64) -> Result<()> {
        if size > fs.config.max_file_size {
            return Err(FsError::FileTooLarge);
        }
        let loaded = if self.state.lock().buf.is_none() {
            Some(if size == 0 {
                fs.pool.acquire()
            } else {
                self.remote_body(fs)?
            })
        } else {
            None
        };

        {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            if st.buf.is_none() {
                st.buf = loaded;
            }
            resize_buffer(st.buf.get_or_insert_with(Vec::new), size, fs.config.max_file_size)?;
            st.dirty = true;
        }
        *self.prefetch.lock() = None;

        let mut st = self.inode.lock();
        st.attrs.size = size;
        st.attrs.mtime = Some(SystemTime::now());
        Ok(())
    }

    /// Upload pending writes. On success the inode takes on the state the
    /// store confirmed.
    pub fn flush(&self, fs: &BucketFs) -> Result<()> {
        let loc = match self.inode.location() {
            Ok(loc) => loc,
            Err(_) => {
                debug!("inode {} is detached, dropping its pending writes", self.inode.id);
                self.state.lock().dirty = false;
                return Ok(());
            }
        };
        let metadata = self.inode.lock().metadata.clone().unwrap_or_default();

        let (out, len) = {
            let mut st = self.state.lock();
            if !st.dirty {
                return Ok(());
            }
            let body = st.buf.as_deref().unwrap_or(&[]);
            let out = upload(fs, &loc, body, metadata.clone())?;
            let len = body.len() as u64;
            st.dirty = false;
            (out, len)
        };
        debug!("flushed {} ({} bytes)", loc.key(), len);

        let mut st = self.inode.lock();
        st.known_etag = out.etag;
        st.known_size = Some(len);
        st.attrs.size = len;
        st.attrs.mtime = Some(out.last_modified.map_or_else(SystemTime::now, SystemTime::from));
        st.metadata = Some(metadata);
        st.attr_stamp.touch();
        Ok(())
    }

    /// Give the buffer back to the pool.
    pub fn recycle(&self, fs: &BucketFs) {
        if let Some(buf) = self.state.lock().buf.take() {
            fs.pool.release(buf);
        }
    }
}

/// Store `body` at `loc`, through a parallel multipart upload when it is
/// larger than one part.
fn upload(fs: &BucketFs, loc: &Location, body: &[u8], metadata: Metadata) -> Result<PutBlobOutput> {
    let backend = loc.backend();
    let caps = backend.capabilities();
    let mut part_size = fs.config.multipart_threshold.max(1);
    if caps.max_multipart_size > 0 {
        part_size = part_size.min(caps.max_multipart_size);
    }

    if body.len() as u64 <= part_size {
        return Ok(backend.put_blob(PutBlobInput {
            key: loc.key(),
            metadata,
            content_type: None,
            dir_blob: false,
            body: body.to_vec(),
        })?);
    }

    let upload = backend.multipart_begin(MultipartBeginInput {
        key: loc.key(),
        metadata,
        content_type: None,
    })?;
    let parts: Vec<&[u8]> = body.chunks(part_size as usize).collect();
    debug!("multipart upload of {} in {} parts", upload.key, parts.len());

    let results: Vec<Result<String>> = if caps.no_parallel_multipart {
        parts
            .iter()
            .enumerate()
            .map(|(i, part)| Ok(backend.multipart_add(&upload, i as u32 + 1, part.to_vec())?))
            .collect()
    } else {
        let upload = &upload;
        let replicators = &fs.replicators;
        std::thread::scope(|s| {
            let workers: Vec<_> = parts
                .iter()
                .enumerate()
                .map(|(i, part)| {
                    s.spawn(move || -> Result<String> {
                        let _ticket = replicators.acquire(1, true);
                        Ok(backend.multipart_add(upload, i as u32 + 1, part.to_vec())?)
                    })
                })
                .collect();
            workers
                .into_iter()
                .map(|w| {
                    w.join()
                        .unwrap_or_else(|_| Err(FsError::Internal("part upload panicked".into())))
                })
                .collect()
        })
    };

    match results.into_iter().collect::<Result<Vec<String>>>() {
        Ok(etags) => Ok(backend.multipart_commit(&upload, etags)?),
        Err(e) => {
            warn!("multipart upload of {} failed: {}", upload.key, e);
            if let Err(abort) = backend.multipart_abort(&upload) {
                warn!("aborting upload of {} failed: {}", upload.key, abort);
            }
            Err(e)
        }
    }
}

impl BucketFs {
    /// Link everything in a listing page under `dir`, the store's view
    /// winning over what was cached.
    pub(crate) fn materialize(
        &self,
        dir: &Arc<Inode>,
        loc: &Location,
        page: &ListBlobsOutput,
    ) -> Result<Vec<DirEntry>> {
        let dir_prefix = loc.dir_prefix();
        let mut found: Vec<(String, Probe)> = Vec::new();
        for prefix in &page.prefixes {
            if let Some(name) = prefix.strip_prefix(&dir_prefix) {
                let name = name.trim_end_matches('/');
                if !name.is_empty() {
                    found.push((name.to_string(), Probe::implicit_dir()));
                }
            }
        }
        for item in &page.items {
            if let Some(name) = item.key.strip_prefix(&dir_prefix) {
                if !name.is_empty() && !name.contains('/') {
                    found.push((name.to_string(), Probe::from_item(item)));
                }
            }
        }
        found.sort_by(|a, b| a.0.cmp(&b.0));

        let mut entries = Vec::with_capacity(found.len());
        for (name, probe) in found {
            let child = self.link_listed(dir, &name, &probe)?;
            entries.push(DirEntry {
                id: child.id,
                kind: child.kind(),
                name,
            });
        }
        Ok(entries)
    }

    fn link_listed(&self, dir: &Arc<Inode>, name: &str, probe: &Probe) -> Result<Arc<Inode>> {
        let build = |id| Inode::from_probe(id, name, dir, probe, &self.config);
        let (child, inserted) = self.inodes.insert(dir, name, None, 0, build)?;
        if inserted {
            return Ok(child);
        }

        // Listings cannot tell a symlink from a file.
        let compatible = child.kind() == probe.kind
            || (child.kind() == Kind::Symlink && probe.kind == Kind::File);
        if compatible {
            if child.kind() != Kind::Dir {
                child.lock().merge(probe, child.handles() > 0);
            }
            return Ok(child);
        }
        if child.handles() > 0 {
            return Ok(child);
        }
        let build = |id| Inode::from_probe(id, name, dir, probe, &self.config);
        let (fresh, _) = self.inodes.insert(dir, name, Some(&child), 0, build)?;
        Ok(fresh)
    }
}
