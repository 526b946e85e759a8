//! In-process object store.
//!
//! Counts every call and can inject failures, which is what the test suite
//! uses to assert on backend round trips.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;

use super::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Head,
    List,
    Get,
    Put,
    Copy,
    Rename,
    Delete,
    MultipartBegin,
    MultipartAdd,
    MultipartCommit,
    MultipartAbort,
}

#[derive(Debug, Clone)]
struct StoredBlob {
    body: Vec<u8>,
    etag: String,
    last_modified: DateTime<Utc>,
    metadata: Metadata,
    content_type: Option<String>,
}

impl StoredBlob {
    fn new(body: Vec<u8>, metadata: Metadata, content_type: Option<String>) -> Self {
        Self {
            etag: etag_of(&body),
            body,
            last_modified: Utc::now(),
            metadata,
            content_type,
        }
    }

    fn item(&self, key: &str) -> BlobItem {
        BlobItem {
            key: key.to_string(),
            etag: Some(self.etag.clone()),
            last_modified: Some(self.last_modified),
            size: self.body.len() as u64,
            storage_class: Some("STANDARD".to_string()),
        }
    }

    fn head(&self, key: &str) -> HeadBlobOutput {
        HeadBlobOutput {
            item: self.item(key),
            content_type: self.content_type.clone(),
            metadata: self.metadata.clone(),
            is_dir_blob: key.ends_with('/'),
        }
    }
}

struct Fault {
    op: Op,
    key: Option<String>,
    error: BackendError,
    once: bool,
}

pub struct MemoryStore {
    name: String,
    objects: Mutex<BTreeMap<String, StoredBlob>>,
    uploads: Mutex<HashMap<String, BTreeMap<u32, Vec<u8>>>>,
    next_upload: AtomicU64,
    counters: DashMap<Op, u64>,
    requests: Mutex<Vec<(Op, String)>>,
    faults: Mutex<Vec<Fault>>,
    latency: Mutex<Option<Duration>>,
    init_calls: AtomicU64,
    supports_rename: bool,
    max_multipart_size: u64,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: Mutex::new(BTreeMap::new()),
            uploads: Mutex::new(HashMap::new()),
            next_upload: AtomicU64::new(1),
            counters: DashMap::new(),
            requests: Mutex::new(Vec::new()),
            faults: Mutex::new(Vec::new()),
            latency: Mutex::new(None),
            init_calls: AtomicU64::new(0),
            supports_rename: true,
            max_multipart_size: 0,
        }
    }

    /// A store without a native rename, forcing copy + delete.
    pub fn without_rename(mut self) -> Self {
        self.supports_rename = false;
        self
    }

    pub fn with_max_multipart_size(mut self, size: u64) -> Self {
        self.max_multipart_size = size;
        self
    }

    /// Put an object directly, bypassing counters (simulates an out-of-band
    /// writer).
    pub fn insert(&self, key: &str, body: impl Into<Vec<u8>>) {
        self.insert_with_metadata(key, body, Metadata::new());
    }

    pub fn insert_with_metadata(&self, key: &str, body: impl Into<Vec<u8>>, metadata: Metadata) {
        self.objects
            .lock()
            .insert(key.to_string(), StoredBlob::new(body.into(), metadata, None));
    }

    /// Remove an object directly, bypassing counters.
    pub fn remove(&self, key: &str) -> bool {
        self.objects.lock().remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().contains_key(key)
    }

    pub fn body(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().get(key).map(|b| b.body.clone())
    }

    pub fn metadata(&self, key: &str) -> Option<Metadata> {
        self.objects.lock().get(key).map(|b| b.metadata.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }

    /// Number of calls made for `op`.
    pub fn calls(&self, op: Op) -> u64 {
        self.counters.get(&op).map(|c| *c).unwrap_or(0)
    }

    /// Total calls across every operation.
    pub fn total_calls(&self) -> u64 {
        self.counters.iter().map(|c| *c.value()).sum()
    }

    /// Keys passed to `op`, in call order.
    pub fn requested(&self, op: Op) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .filter(|(o, _)| *o == op)
            .map(|(_, k)| k.clone())
            .collect()
    }

    pub fn reset_counters(&self) {
        self.counters.clear();
        self.requests.lock().clear();
    }

    pub fn init_calls(&self) -> u64 {
        self.init_calls.load(Ordering::SeqCst)
    }

    /// Fail the next call of `op` with `error`.
    pub fn fail_next(&self, op: Op, error: BackendError) {
        self.faults.lock().push(Fault {
            op,
            key: None,
            error,
            once: true,
        });
    }

    /// Fail every call of `op` on `key` until [`clear_faults`](Self::clear_faults).
    pub fn fail_key(&self, op: Op, key: &str, error: BackendError) {
        self.faults.lock().push(Fault {
            op,
            key: Some(key.to_string()),
            error,
            once: false,
        });
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    fn enter(&self, op: Op, key: &str) -> BackendResult<()> {
        *self.counters.entry(op).or_insert(0) += 1;
        self.requests.lock().push((op, key.to_string()));

        if let Some(latency) = *self.latency.lock() {
            std::thread::sleep(latency);
        }

        let mut faults = self.faults.lock();
        let hit = faults
            .iter()
            .position(|f| f.op == op && f.key.as_deref().map_or(true, |k| k == key));
        match hit {
            Some(idx) if faults[idx].once => Err(faults.remove(idx).error),
            Some(idx) => Err(faults[idx].error.clone()),
            None => Ok(()),
        }
    }
}

impl ObjectBackend for MemoryStore {
    fn init(&self, _key: &str) -> BackendResult<()> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            name: "memory".to_string(),
            no_parallel_multipart: false,
            max_multipart_size: self.max_multipart_size,
            dir_blob: false,
            capacity: None,
        }
    }

    fn bucket(&self) -> String {
        self.name.clone()
    }

    fn head_blob(&self, key: &str) -> BackendResult<HeadBlobOutput> {
        self.enter(Op::Head, key)?;
        self.objects
            .lock()
            .get(key)
            .map(|b| b.head(key))
            .ok_or(BackendError::NoSuchKey)
    }

    fn list_blobs(&self, input: &ListBlobsInput) -> BackendResult<ListBlobsOutput> {
        self.enter(Op::List, input.prefix.as_deref().unwrap_or(""))?;
        let items: Vec<BlobItem> = self
            .objects
            .lock()
            .iter()
            .map(|(k, b)| b.item(k))
            .collect();
        Ok(paginate(items, input))
    }

    fn get_blob(&self, input: &GetBlobInput) -> BackendResult<GetBlobOutput> {
        self.enter(Op::Get, &input.key)?;
        let objects = self.objects.lock();
        let blob = objects.get(&input.key).ok_or(BackendError::NoSuchKey)?;
        if let Some(ref want) = input.if_match {
            if *want != blob.etag {
                return Err(BackendError::Http {
                    status: 412,
                    message: "precondition failed".to_string(),
                });
            }
        }

        let len = blob.body.len() as u64;
        let start = input.start.min(len) as usize;
        let end = if input.count == 0 {
            len
        } else {
            input.start.saturating_add(input.count).min(len)
        } as usize;
        Ok(GetBlobOutput {
            head: blob.head(&input.key),
            body: blob.body[start..end].to_vec(),
        })
    }

    fn put_blob(&self, input: PutBlobInput) -> BackendResult<PutBlobOutput> {
        self.enter(Op::Put, &input.key)?;
        let blob = StoredBlob::new(input.body, input.metadata, input.content_type);
        let out = PutBlobOutput {
            etag: Some(blob.etag.clone()),
            last_modified: Some(blob.last_modified),
            storage_class: Some("STANDARD".to_string()),
        };
        self.objects.lock().insert(input.key, blob);
        Ok(out)
    }

    fn copy_blob(&self, input: &CopyBlobInput) -> BackendResult<()> {
        self.enter(Op::Copy, &input.source)?;
        let mut objects = self.objects.lock();
        let source = objects
            .get(&input.source)
            .cloned()
            .ok_or(BackendError::NoSuchKey)?;
        if let Some(ref etag) = input.etag {
            if *etag != source.etag {
                return Err(BackendError::Http {
                    status: 412,
                    message: "precondition failed".to_string(),
                });
            }
        }
        let metadata = input.metadata.clone().unwrap_or(source.metadata);
        let copy = StoredBlob::new(source.body, metadata, source.content_type);
        objects.insert(input.destination.clone(), copy);
        Ok(())
    }

    fn rename_blob(&self, source: &str, destination: &str) -> BackendResult<()> {
        self.enter(Op::Rename, source)?;
        if !self.supports_rename {
            return Err(BackendError::Unsupported);
        }
        let mut objects = self.objects.lock();
        let blob = objects.remove(source).ok_or(BackendError::NoSuchKey)?;
        objects.insert(destination.to_string(), blob);
        Ok(())
    }

    fn delete_blob(&self, key: &str) -> BackendResult<()> {
        self.enter(Op::Delete, key)?;
        self.objects
            .lock()
            .remove(key)
            .map(|_| ())
            .ok_or(BackendError::NoSuchKey)
    }

    fn delete_blobs(&self, keys: &[String]) -> BackendResult<()> {
        for key in keys {
            self.enter(Op::Delete, key)?;
            self.objects.lock().remove(key);
        }
        Ok(())
    }

    fn multipart_begin(&self, input: &MultipartBeginInput) -> BackendResult<MultipartUpload> {
        self.enter(Op::MultipartBegin, &input.key)?;
        let id = format!("upload-{}", self.next_upload.fetch_add(1, Ordering::SeqCst));
        self.uploads.lock().insert(id.clone(), BTreeMap::new());
        Ok(MultipartUpload {
            key: input.key.clone(),
            upload_id: id,
            metadata: input.metadata.clone(),
        })
    }

    fn multipart_add(
        &self,
        upload: &MultipartUpload,
        part_number: u32,
        body: Vec<u8>,
    ) -> BackendResult<String> {
        self.enter(Op::MultipartAdd, &upload.key)?;
        if self.max_multipart_size > 0 && body.len() as u64 > self.max_multipart_size {
            return Err(BackendError::Http {
                status: 400,
                message: "part too large".to_string(),
            });
        }
        let etag = etag_of(&body);
        let mut uploads = self.uploads.lock();
        let parts = uploads
            .get_mut(&upload.upload_id)
            .ok_or(BackendError::NoSuchKey)?;
        parts.insert(part_number, body);
        Ok(etag)
    }

    fn multipart_commit(
        &self,
        upload: &MultipartUpload,
        parts: &[String],
    ) -> BackendResult<PutBlobOutput> {
        self.enter(Op::MultipartCommit, &upload.key)?;
        let stored = self
            .uploads
            .lock()
            .remove(&upload.upload_id)
            .ok_or(BackendError::NoSuchKey)?;
        if stored.len() != parts.len() {
            return Err(BackendError::Http {
                status: 400,
                message: format!("expected {} parts, got {}", stored.len(), parts.len()),
            });
        }
        let body: Vec<u8> = stored.into_values().flatten().collect();
        let blob = StoredBlob::new(body, upload.metadata.clone(), None);
        let out = PutBlobOutput {
            etag: Some(blob.etag.clone()),
            last_modified: Some(blob.last_modified),
            storage_class: Some("STANDARD".to_string()),
        };
        self.objects.lock().insert(upload.key.clone(), blob);
        Ok(out)
    }

    fn multipart_abort(&self, upload: &MultipartUpload) -> BackendResult<()> {
        self.enter(Op::MultipartAbort, &upload.key)?;
        self.uploads.lock().remove(&upload.upload_id);
        Ok(())
    }
}

impl MemoryStore {
    /// Number of multipart uploads begun but neither committed nor aborted.
    pub fn pending_uploads(&self) -> usize {
        self.uploads.lock().len()
    }
}
