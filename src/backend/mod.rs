//! Object store capability interface consumed by the filesystem core.
//!
//! The core only ever talks to a [`Backend`], which wraps a concrete
//! [`ObjectBackend`] with lazy one-time initialisation and the globally
//! configured request timeout.

pub mod local;
pub mod memory;

use std::collections::BTreeMap;
use std::sync::{mpsc, Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

pub type Metadata = BTreeMap<String, String>;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("no such key")]
    NoSuchKey,

    #[error("no such bucket")]
    NoSuchBucket,

    #[error("key already exists")]
    KeyAlreadyExists,

    #[error("unsupported method")]
    Unsupported,

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("request timed out")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// Map a backend failure onto a filesystem errno. `None` means the error
    /// is not recognised and is reported as an opaque I/O failure.
    pub fn errno(&self) -> Option<i32> {
        match self {
            BackendError::NoSuchKey => Some(libc::ENOENT),
            BackendError::NoSuchBucket => Some(libc::ENXIO),
            BackendError::KeyAlreadyExists => Some(libc::EEXIST),
            BackendError::Unsupported => Some(libc::ENOTSUP),
            BackendError::Timeout => Some(libc::EAGAIN),
            BackendError::Http { status, .. } => map_http_status(*status),
            BackendError::Io(_) | BackendError::Other(_) => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BackendError::NoSuchKey | BackendError::Http { status: 404, .. }
        )
    }
}

/// Transport status code to errno.
pub fn map_http_status(status: u16) -> Option<i32> {
    match status {
        400 => Some(libc::EINVAL),
        401 | 403 => Some(libc::EACCES),
        404 => Some(libc::ENOENT),
        405 => Some(libc::ENOTSUP),
        409 => Some(libc::EINTR),
        429 => Some(libc::EAGAIN),
        500..=599 => Some(libc::EAGAIN),
        _ => None,
    }
}

impl Clone for BackendError {
    fn clone(&self) -> Self {
        match self {
            BackendError::NoSuchKey => BackendError::NoSuchKey,
            BackendError::NoSuchBucket => BackendError::NoSuchBucket,
            BackendError::KeyAlreadyExists => BackendError::KeyAlreadyExists,
            BackendError::Unsupported => BackendError::Unsupported,
            BackendError::Http { status, message } => BackendError::Http {
                status: *status,
                message: message.clone(),
            },
            BackendError::Timeout => BackendError::Timeout,
            BackendError::Io(e) => BackendError::Io(match e.raw_os_error() {
                Some(code) => std::io::Error::from_raw_os_error(code),
                None => std::io::Error::new(e.kind(), e.to_string()),
            }),
            BackendError::Other(msg) => BackendError::Other(msg.clone()),
        }
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Storage accounting reported through statfs.
#[derive(Debug, Clone, Default)]
pub struct CapacityBase {
    pub block_size: u32,
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub io_size: u32,
    pub inodes: u64,
    pub inodes_free: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    pub name: String,
    pub no_parallel_multipart: bool,
    /// Largest body accepted by a single multipart part; 0 means no limit.
    pub max_multipart_size: u64,
    /// The store has native directory objects.
    pub dir_blob: bool,
    pub capacity: Option<CapacityBase>,
}

#[derive(Debug, Clone, Default)]
pub struct BlobItem {
    pub key: String,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub size: u64,
    pub storage_class: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct HeadBlobOutput {
    pub item: BlobItem,
    pub content_type: Option<String>,
    pub metadata: Metadata,
    pub is_dir_blob: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ListBlobsInput {
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    pub max_keys: Option<u32>,
    pub start_after: Option<String>,
    pub continuation_token: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListBlobsOutput {
    /// Common prefixes, each ending in the delimiter.
    pub prefixes: Vec<String>,
    pub items: Vec<BlobItem>,
    pub next_continuation_token: Option<String>,
    pub is_truncated: bool,
}

#[derive(Debug, Clone, Default)]
pub struct GetBlobInput {
    pub key: String,
    pub start: u64,
    /// Number of bytes to read; 0 reads to the end of the blob.
    pub count: u64,
    pub if_match: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct GetBlobOutput {
    pub head: HeadBlobOutput,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct PutBlobInput {
    pub key: String,
    pub metadata: Metadata,
    pub content_type: Option<String>,
    pub dir_blob: bool,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct PutBlobOutput {
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub storage_class: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CopyBlobInput {
    pub source: String,
    pub destination: String,
    pub size: Option<u64>,
    /// Conditional copy: only succeed when the source still has this ETag.
    pub etag: Option<String>,
    /// Replacement metadata; `None` copies the source's.
    pub metadata: Option<Metadata>,
    pub storage_class: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MultipartBeginInput {
    pub key: String,
    pub metadata: Metadata,
    pub content_type: Option<String>,
}

/// An in-progress multipart upload.
#[derive(Debug, Clone, Default)]
pub struct MultipartUpload {
    pub key: String,
    pub upload_id: String,
    pub metadata: Metadata,
}

/// Key/value blob store. Every method may be called concurrently.
pub trait ObjectBackend: Send + Sync {
    /// One-time setup. [`Backend`] guarantees this runs once before any
    /// other call.
    fn init(&self, key: &str) -> BackendResult<()>;
    fn capabilities(&self) -> Capabilities;
    /// Human-readable location, typically bucket/prefix.
    fn bucket(&self) -> String;

    fn head_blob(&self, key: &str) -> BackendResult<HeadBlobOutput>;
    fn list_blobs(&self, input: &ListBlobsInput) -> BackendResult<ListBlobsOutput>;
    fn get_blob(&self, input: &GetBlobInput) -> BackendResult<GetBlobOutput>;
    fn put_blob(&self, input: PutBlobInput) -> BackendResult<PutBlobOutput>;
    fn copy_blob(&self, input: &CopyBlobInput) -> BackendResult<()>;
    fn rename_blob(&self, source: &str, destination: &str) -> BackendResult<()>;
    fn delete_blob(&self, key: &str) -> BackendResult<()>;
    fn delete_blobs(&self, keys: &[String]) -> BackendResult<()>;

    fn multipart_begin(&self, input: &MultipartBeginInput) -> BackendResult<MultipartUpload>;
    /// Upload one part; returns the part's ETag.
    fn multipart_add(
        &self,
        upload: &MultipartUpload,
        part_number: u32,
        body: Vec<u8>,
    ) -> BackendResult<String>;
    fn multipart_commit(
        &self,
        upload: &MultipartUpload,
        parts: &[String],
    ) -> BackendResult<PutBlobOutput>;
    fn multipart_abort(&self, upload: &MultipartUpload) -> BackendResult<()>;
}

/// The handle the filesystem core uses to reach an object store.
pub struct Backend {
    inner: Arc<dyn ObjectBackend>,
    init_key: String,
    init: OnceLock<BackendResult<()>>,
    timeout: Option<Duration>,
}

impl Backend {
    pub fn new(inner: Arc<dyn ObjectBackend>, timeout: Option<Duration>) -> Self {
        Self {
            inner,
            init_key: String::new(),
            init: OnceLock::new(),
            timeout,
        }
    }

    pub fn with_init_key(mut self, key: impl Into<String>) -> Self {
        self.init_key = key.into();
        self
    }

    /// Initialise the store on first use. Later calls return the memoised
    /// outcome, including a memoised failure.
    pub fn init(&self) -> BackendResult<()> {
        self.init
            .get_or_init(|| {
                let res = self.inner.init(&self.init_key);
                if let Err(ref e) = res {
                    warn!("backend {} failed to initialise: {}", self.inner.bucket(), e);
                }
                res
            })
            .clone()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    pub fn bucket(&self) -> String {
        self.inner.bucket()
    }

    /// Run `f` against the store, bounded by the request timeout. A call
    /// that times out keeps running in the background and its result is
    /// dropped; the caller sees a retryable `Timeout`.
    fn call<T, F>(&self, op: &'static str, f: F) -> BackendResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ObjectBackend) -> BackendResult<T> + Send + 'static,
    {
        self.init()?;
        let Some(timeout) = self.timeout else {
            return f(&*self.inner);
        };

        let inner = Arc::clone(&self.inner);
        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name(format!("bucketfs-{}", op))
            .spawn(move || {
                let _ = tx.send(f(&*inner));
            })?;

        match rx.recv_timeout(timeout) {
            Ok(res) => res,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                debug!("{} timed out after {:?}", op, timeout);
                Err(BackendError::Timeout)
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(BackendError::Other(format!("{} worker exited without a result", op)))
            }
        }
    }

    pub fn head_blob(&self, key: &str) -> BackendResult<HeadBlobOutput> {
        let key = key.to_string();
        self.call("head", move |b| b.head_blob(&key))
    }

    pub fn list_blobs(&self, input: ListBlobsInput) -> BackendResult<ListBlobsOutput> {
        self.call("list", move |b| b.list_blobs(&input))
    }

    pub fn get_blob(&self, input: GetBlobInput) -> BackendResult<GetBlobOutput> {
        self.call("get", move |b| b.get_blob(&input))
    }

    pub fn put_blob(&self, input: PutBlobInput) -> BackendResult<PutBlobOutput> {
        self.call("put", move |b| b.put_blob(input))
    }

    pub fn copy_blob(&self, input: CopyBlobInput) -> BackendResult<()> {
        self.call("copy", move |b| b.copy_blob(&input))
    }

    pub fn rename_blob(&self, source: &str, destination: &str) -> BackendResult<()> {
        let (source, destination) = (source.to_string(), destination.to_string());
        self.call("rename", move |b| b.rename_blob(&source, &destination))
    }

    pub fn delete_blob(&self, key: &str) -> BackendResult<()> {
        let key = key.to_string();
        self.call("delete", move |b| b.delete_blob(&key))
    }

    pub fn delete_blobs(&self, keys: Vec<String>) -> BackendResult<()> {
        self.call("delete-many", move |b| b.delete_blobs(&keys))
    }

    pub fn multipart_begin(&self, input: MultipartBeginInput) -> BackendResult<MultipartUpload> {
        self.call("mpu-begin", move |b| b.multipart_begin(&input))
    }

    pub fn multipart_add(
        &self,
        upload: &MultipartUpload,
        part_number: u32,
        body: Vec<u8>,
    ) -> BackendResult<String> {
        let upload = upload.clone();
        self.call("mpu-add", move |b| b.multipart_add(&upload, part_number, body))
    }

    pub fn multipart_commit(
        &self,
        upload: &MultipartUpload,
        parts: Vec<String>,
    ) -> BackendResult<PutBlobOutput> {
        let upload = upload.clone();
        self.call("mpu-commit", move |b| b.multipart_commit(&upload, &parts))
    }

    pub fn multipart_abort(&self, upload: &MultipartUpload) -> BackendResult<()> {
        let upload = upload.clone();
        self.call("mpu-abort", move |b| b.multipart_abort(&upload))
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("bucket", &self.inner.bucket())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Content fingerprint used by the in-process stores: hex SHA-256 of the body.
pub fn etag_of(body: &[u8]) -> String {
    use sha2::{Digest, Sha256};

    Sha256::digest(body)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Apply prefix/delimiter/pagination semantics to a key-sorted sequence of
/// blobs. Shared by the in-process stores.
pub(crate) fn paginate<I>(items: I, input: &ListBlobsInput) -> ListBlobsOutput
where
    I: IntoIterator<Item = BlobItem>,
{
    let prefix = input.prefix.as_deref().unwrap_or("");
    let delimiter = input.delimiter.as_deref().filter(|d| !d.is_empty());
    let after = input
        .continuation_token
        .as_deref()
        .or(input.start_after.as_deref());
    let max_keys = input.max_keys.unwrap_or(1000).max(1) as usize;

    let mut out = ListBlobsOutput::default();
    let mut emitted = 0usize;
    let mut last: Option<String> = None;

    for item in items {
        if !item.key.starts_with(prefix) {
            continue;
        }
        if let Some(after) = after {
            if item.key.as_str() <= after {
                continue;
            }
            // Resuming after a common prefix skips everything under it.
            if delimiter.is_some_and(|d| after.ends_with(d)) && item.key.starts_with(after) {
                continue;
            }
        }

        let rest = &item.key[prefix.len()..];
        let common = delimiter
            .and_then(|d| rest.find(d).map(|pos| format!("{}{}", prefix, &rest[..pos + d.len()])));

        match common {
            Some(common) => {
                if out.prefixes.last() == Some(&common) {
                    continue;
                }
                if emitted == max_keys {
                    out.is_truncated = true;
                    break;
                }
                last = Some(common.clone());
                out.prefixes.push(common);
            }
            None => {
                if emitted == max_keys {
                    out.is_truncated = true;
                    break;
                }
                last = Some(item.key.clone());
                out.items.push(item);
            }
        }
        emitted += 1;
    }

    if out.is_truncated {
        out.next_continuation_token = last;
    }
    out
}
