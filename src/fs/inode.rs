//! One namespace entry and its cached view of the store.
//!
//! Lock order: the inode table, then one inode's `state`. Two `state` locks
//! are only ever held together by rename, which takes both directories in
//! id order. `link` and `mount` are leaves: they are never held while
//! acquiring another lock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::warn;

use crate::backend::{Backend, BlobItem, HeadBlobOutput, ListBlobsInput, Metadata};
use crate::config::FsConfig;
use crate::error::{FsError, Result};

pub const ROOT_ID: u64 = 1;

/// User metadata key marking a blob as a symlink.
pub const SYMLINK_TARGET: &str = "symlink-target";

const DIR_SIZE: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    File,
    Dir,
    Symlink,
}

/// When a cached value was last confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stamp {
    Expired,
    At(Instant),
    /// Never revalidated: grafted directories and their parents.
    Forever,
}

impl Stamp {
    pub fn now() -> Self {
        Stamp::At(Instant::now())
    }

    pub fn expired(self, ttl: Duration) -> bool {
        match self {
            Stamp::Expired => true,
            Stamp::At(t) => t.elapsed() >= ttl,
            Stamp::Forever => false,
        }
    }

    /// Refresh unless pinned.
    pub fn touch(&mut self) {
        if *self != Stamp::Forever {
            *self = Stamp::now();
        }
    }
}

/// A store and key prefix serving a subtree.
#[derive(Debug)]
pub struct Binding {
    pub backend: Arc<Backend>,
    /// Empty, or ending in `/`.
    pub prefix: String,
}

impl Binding {
    pub fn new(backend: Arc<Backend>, prefix: &str) -> Self {
        let trimmed = prefix.trim_matches('/');
        let prefix = if trimmed.is_empty() {
            String::new()
        } else {
            format!("{}/", trimmed)
        };
        Self { backend, prefix }
    }
}

/// Where an inode lives in a store.
#[derive(Debug, Clone)]
pub struct Location {
    pub binding: Arc<Binding>,
    /// Path below the binding, without leading or trailing `/`.
    pub rel: String,
}

impl Location {
    pub fn backend(&self) -> &Arc<Backend> {
        &self.binding.backend
    }

    pub fn key(&self) -> String {
        format!("{}{}", self.binding.prefix, self.rel)
    }

    /// Prefix under which this directory's children are stored.
    pub fn dir_prefix(&self) -> String {
        if self.rel.is_empty() {
            self.binding.prefix.clone()
        } else {
            format!("{}{}/", self.binding.prefix, self.rel)
        }
    }

    pub fn child(&self, name: &str) -> Location {
        let rel = if self.rel.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.rel, name)
        };
        Location {
            binding: Arc::clone(&self.binding),
            rel,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attributes {
    pub size: u64,
    /// `None` until the store reports one; implicit directories never do.
    pub mtime: Option<SystemTime>,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
}

impl Attributes {
    pub fn for_kind(kind: Kind, config: &FsConfig) -> Self {
        let (size, mode) = match kind {
            Kind::Dir => (DIR_SIZE, config.dir_mode),
            Kind::File | Kind::Symlink => (0, config.file_mode),
        };
        Self {
            size,
            mtime: None,
            mode,
            uid: config.uid,
            gid: config.gid,
        }
    }
}

pub struct DirState {
    pub children: BTreeMap<String, Arc<Inode>>,
    /// When the children were last reconciled with a full listing.
    pub list_stamp: Stamp,
}

impl DirState {
    fn new() -> Self {
        Self {
            children: BTreeMap::new(),
            list_stamp: Stamp::Expired,
        }
    }

    /// Unlink `child` if the index still points at it. Safe to repeat; a
    /// child that has since moved elsewhere is left alone.
    pub fn detach(&mut self, child: &Arc<Inode>) -> bool {
        let name = child.name();
        let present = self
            .children
            .get(&name)
            .is_some_and(|c| Arc::ptr_eq(c, child));
        if present {
            self.children.remove(&name);
            child.clear_parent();
        }
        present
    }
}

pub struct InodeState {
    pub attrs: Attributes,
    pub attr_stamp: Stamp,
    pub known_etag: Option<String>,
    /// Size the store has confirmed; `None` for content that only exists
    /// locally so far.
    pub known_size: Option<u64>,
    /// The next open must not reuse the page cache.
    pub invalidate_cache: bool,
    /// User metadata as last seen on the store; `None` until fetched.
    pub metadata: Option<Metadata>,
    pub symlink_target: Option<String>,
    pub dir: Option<DirState>,
}

impl InodeState {
    /// Fold freshly fetched state in without replacing the inode. Returns
    /// true when the page cache has to be dropped.
    pub fn merge(&mut self, fresh: &Probe, has_handles: bool) -> bool {
        let etag_changed = matches!(
            (&self.known_etag, &fresh.etag),
            (Some(old), Some(new)) if old != new
        );
        let mtime_changed = matches!(
            (self.attrs.mtime, fresh.mtime),
            (Some(old), Some(new)) if old != new
        );

        // An open handle's own view of the size wins over the store's.
        if !has_handles && self.dir.is_none() {
            self.attrs.size = fresh.size;
            self.known_size = Some(fresh.size);
        }
        if fresh.mtime.is_some() {
            self.attrs.mtime = fresh.mtime;
        }
        if fresh.etag.is_some() {
            self.known_etag = fresh.etag.clone();
        }
        if fresh.metadata.is_some() {
            self.metadata = fresh.metadata.clone();
        }
        if fresh.symlink_target.is_some() {
            self.symlink_target = fresh.symlink_target.clone();
        }
        self.attr_stamp.touch();

        let invalidate = etag_changed || mtime_changed;
        if invalidate {
            self.invalidate_cache = true;
        }
        invalidate
    }

    /// Back to a fresh, empty, never-listed directory.
    pub fn reset_dir(&mut self, config: &FsConfig) {
        self.attrs = Attributes::for_kind(Kind::Dir, config);
        self.known_etag = None;
        self.metadata = None;
        self.dir = Some(DirState::new());
    }
}

struct Link {
    name: String,
    parent: Weak<Inode>,
}

pub struct Inode {
    pub id: u64,
    kind: Kind,
    link: Mutex<Link>,
    mount: RwLock<Option<Arc<Binding>>>,
    state: Mutex<InodeState>,
    handles: AtomicU32,
    refs: AtomicU64,
}

impl Inode {
    pub fn new(id: u64, kind: Kind, name: &str, parent: Option<&Arc<Inode>>, config: &FsConfig) -> Self {
        Self {
            id,
            kind,
            link: Mutex::new(Link {
                name: name.to_string(),
                parent: parent.map(Arc::downgrade).unwrap_or_default(),
            }),
            mount: RwLock::new(None),
            state: Mutex::new(InodeState {
                attrs: Attributes::for_kind(kind, config),
                attr_stamp: Stamp::now(),
                known_etag: None,
                known_size: None,
                invalidate_cache: false,
                metadata: None,
                symlink_target: None,
                dir: (kind == Kind::Dir).then(DirState::new),
            }),
            handles: AtomicU32::new(0),
            refs: AtomicU64::new(0),
        }
    }

    /// The root directory, bound to `backend` and never expiring.
    pub fn new_root(backend: Arc<Backend>, config: &FsConfig) -> Arc<Self> {
        let root = Self::new(ROOT_ID, Kind::Dir, "", None, config)
            .with_binding(Arc::new(Binding::new(backend, "")));
        root.state.lock().attr_stamp = Stamp::Forever;
        root.refs.store(1, Ordering::SeqCst);
        Arc::new(root)
    }

    /// Build an inode from what the store reported for it.
    pub fn from_probe(
        id: u64,
        name: &str,
        parent: &Arc<Inode>,
        probe: &Probe,
        config: &FsConfig,
    ) -> Self {
        let inode = Self::new(id, probe.kind, name, Some(parent), config);
        {
            let mut st = inode.state.lock();
            if probe.kind != Kind::Dir {
                st.attrs.size = probe.size;
                st.known_size = Some(probe.size);
            }
            st.attrs.mtime = probe.mtime;
            st.known_etag = probe.etag.clone();
            st.metadata = probe.metadata.clone();
            st.symlink_target = probe.symlink_target.clone();
        }
        inode
    }

    pub fn with_binding(self, binding: Arc<Binding>) -> Self {
        *self.mount.write() = Some(binding);
        self
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn is_dir(&self) -> bool {
        self.kind == Kind::Dir
    }

    pub fn lock(&self) -> MutexGuard<'_, InodeState> {
        self.state.lock()
    }

    pub fn name(&self) -> String {
        self.link.lock().name.clone()
    }

    pub fn parent(&self) -> Option<Arc<Inode>> {
        self.link.lock().parent.upgrade()
    }

    pub fn set_link(&self, name: &str, parent: &Arc<Inode>) {
        let mut link = self.link.lock();
        link.name = name.to_string();
        link.parent = Arc::downgrade(parent);
    }

    fn clear_parent(&self) {
        self.link.lock().parent = Weak::new();
    }

    /// No longer reachable by traversal.
    pub fn is_detached(&self) -> bool {
        self.id != ROOT_ID && self.parent().is_none()
    }

    pub fn binding(&self) -> Option<Arc<Binding>> {
        self.mount.read().clone()
    }

    pub fn bind(&self, binding: Option<Arc<Binding>>) {
        *self.mount.write() = binding;
    }

    pub fn refs(&self) -> u64 {
        self.refs.load(Ordering::SeqCst)
    }

    pub fn inc_ref(&self, n: u64) {
        self.refs.fetch_add(n, Ordering::SeqCst);
    }

    /// Drop `n` references; true when none remain.
    pub fn dec_ref(&self, n: u64) -> bool {
        let mut cur = self.refs.load(Ordering::SeqCst);
        loop {
            let next = match cur.checked_sub(n) {
                Some(next) => next,
                None => {
                    warn!("inode {}: forgetting {} of {} references", self.id, n, cur);
                    0
                }
            };
            match self
                .refs
                .compare_exchange(cur, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next == 0,
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn handles(&self) -> u32 {
        self.handles.load(Ordering::SeqCst)
    }

    pub fn open_handle(&self) {
        self.handles.fetch_add(1, Ordering::SeqCst);
    }

    pub fn close_handle(&self) {
        let prev = self
            .handles
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |h| h.checked_sub(1));
        if prev.is_err() {
            warn!("inode {}: closing a handle that was never opened", self.id);
        }
    }

    /// Attributes need revalidation. Open handles exempt a file from expiry.
    pub fn attr_expired(&self, st: &InodeState, ttl: Duration) -> bool {
        self.handles() == 0 && st.attr_stamp.expired(ttl)
    }

    /// Anchored below a mount point that keeps it from being pruned.
    pub fn is_pinned(&self, st: &InodeState) -> bool {
        st.attr_stamp == Stamp::Forever || self.binding().is_some()
    }

    /// Walk up to the nearest bound directory.
    pub fn location(self: &Arc<Self>) -> Result<Location> {
        let mut names = Vec::new();
        let mut cur = Arc::clone(self);
        loop {
            if let Some(binding) = cur.binding() {
                names.reverse();
                return Ok(Location {
                    binding,
                    rel: names.join("/"),
                });
            }
            let (name, parent) = {
                let link = cur.link.lock();
                (link.name.clone(), link.parent.upgrade())
            };
            match parent {
                Some(parent) => {
                    names.push(name);
                    cur = parent;
                }
                None => return Err(FsError::NotFound),
            }
        }
    }

    /// Path from the mount root, for diagnostics.
    pub fn path(self: &Arc<Self>) -> String {
        let mut names = Vec::new();
        let mut cur = Arc::clone(self);
        while let Some(parent) = cur.parent() {
            names.push(cur.name());
            cur = parent;
        }
        if cur.id != ROOT_ID {
            names.push(format!("<detached {}>", cur.id));
        }
        names.reverse();
        format!("/{}", names.join("/"))
    }
}

impl std::fmt::Debug for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inode")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("name", &self.name())
            .field("refs", &self.refs())
            .field("handles", &self.handles())
            .finish()
    }
}

/// What the store currently says about one name.
#[derive(Debug, Clone)]
pub struct Probe {
    pub kind: Kind,
    pub size: u64,
    pub mtime: Option<SystemTime>,
    pub etag: Option<String>,
    pub metadata: Option<Metadata>,
    pub symlink_target: Option<String>,
}

impl Probe {
    pub fn from_head(head: HeadBlobOutput) -> Self {
        let symlink_target = head.metadata.get(SYMLINK_TARGET).cloned();
        let kind = if head.is_dir_blob {
            Kind::Dir
        } else if symlink_target.is_some() {
            Kind::Symlink
        } else {
            Kind::File
        };
        Self {
            kind,
            size: head.item.size,
            mtime: head.item.last_modified.map(SystemTime::from),
            etag: head.item.etag,
            metadata: Some(head.metadata),
            symlink_target,
        }
    }

    /// A file as reported by a listing, which carries no metadata.
    pub fn from_item(item: &BlobItem) -> Self {
        Self {
            kind: Kind::File,
            size: item.size,
            mtime: item.last_modified.map(SystemTime::from),
            etag: item.etag.clone(),
            metadata: None,
            symlink_target: None,
        }
    }

    /// A directory known only from a key prefix.
    pub fn implicit_dir() -> Self {
        Self {
            kind: Kind::Dir,
            size: DIR_SIZE,
            mtime: None,
            etag: None,
            metadata: None,
            symlink_target: None,
        }
    }
}

/// Ask the store what `loc` is: a blob, a `dir/` marker, or (unless
/// `explicit_dir`) a prefix with children under it.
pub fn probe(loc: &Location, explicit_dir: bool) -> Result<Option<Probe>> {
    let backend = loc.backend();
    let key = loc.key();

    match backend.head_blob(&key) {
        Ok(head) => return Ok(Some(Probe::from_head(head))),
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e.into()),
    }

    let dir_key = format!("{}/", key);
    match backend.head_blob(&dir_key) {
        Ok(head) => {
            let mut probe = Probe::from_head(head);
            probe.kind = Kind::Dir;
            probe.size = DIR_SIZE;
            probe.symlink_target = None;
            return Ok(Some(probe));
        }
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e.into()),
    }

    if explicit_dir {
        return Ok(None);
    }
    let listing = backend.list_blobs(ListBlobsInput {
        prefix: Some(dir_key),
        delimiter: Some("/".to_string()),
        max_keys: Some(1),
        ..Default::default()
    })?;
    if listing.prefixes.is_empty() && listing.items.is_empty() {
        Ok(None)
    } else {
        Ok(Some(Probe::implicit_dir()))
    }
}
