//! Object store rooted at a local directory.
//!
//! Keys map to paths below the root; `dir/` markers map to directories.
//! User metadata lives in JSON sidecars under `.bucketfs-meta/`, which is
//! never listed.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::*;

const META_DIR: &str = ".bucketfs-meta";
const UPLOAD_DIR: &str = "uploads";

pub struct DirStore {
    root: PathBuf,
    next_upload: AtomicU64,
}

fn map_io(e: io::Error) -> BackendError {
    if e.kind() == io::ErrorKind::NotFound {
        BackendError::NoSuchKey
    } else {
        BackendError::Io(e)
    }
}

fn bad_key(key: &str) -> BackendError {
    BackendError::Http {
        status: 400,
        message: format!("invalid key {:?}", key),
    }
}

fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect())
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            next_upload: AtomicU64::new(1),
        }
    }

    fn meta_root(&self) -> PathBuf {
        self.root.join(META_DIR)
    }

    /// Resolve a key to a path below the root, refusing anything that would
    /// escape it or touch the sidecar area.
    fn path_of(&self, key: &str) -> BackendResult<PathBuf> {
        let trimmed = key.trim_end_matches('/');
        if trimmed.is_empty() {
            return Ok(self.root.clone());
        }
        let mut path = self.root.clone();
        for (i, seg) in trimmed.split('/').enumerate() {
            if seg.is_empty() || seg == "." || seg == ".." || (i == 0 && seg == META_DIR) {
                return Err(bad_key(key));
            }
            path.push(seg);
        }
        Ok(path)
    }

    fn sidecar_of(&self, key: &str) -> PathBuf {
        self.meta_root().join(format!("{}.json", key.replace('/', "%2F")))
    }

    fn read_metadata(&self, key: &str) -> Metadata {
        fs::read(self.sidecar_of(key))
            .ok()
            .and_then(|raw| serde_json::from_slice(&raw).ok())
            .unwrap_or_default()
    }

    fn write_metadata(&self, key: &str, metadata: &Metadata) -> BackendResult<()> {
        let sidecar = self.sidecar_of(key);
        if metadata.is_empty() {
            match fs::remove_file(&sidecar) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(BackendError::Io(e)),
            }
            return Ok(());
        }
        fs::create_dir_all(self.meta_root())?;
        let raw = serde_json::to_vec(metadata).map_err(|e| BackendError::Other(e.to_string()))?;
        fs::write(sidecar, raw)?;
        Ok(())
    }

    /// Write `body` to `path` through a temporary file so readers never see a
    /// partial object.
    fn write_atomic(&self, path: &Path, body: &[u8]) -> BackendResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_dir = self.meta_root();
        fs::create_dir_all(&tmp_dir)?;
        let tmp = tmp_dir.join(format!(
            "tmp-{}-{}",
            std::process::id(),
            self.next_upload.fetch_add(1, Ordering::Relaxed)
        ));
        {
            let mut f = File::create(&tmp)?;
            f.write_all(body)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn item_for(&self, key: &str, path: &Path) -> BackendResult<BlobItem> {
        let md = fs::symlink_metadata(path).map_err(map_io)?;
        let last_modified = md.modified().ok().map(DateTime::<Utc>::from);
        if md.is_dir() {
            return Ok(BlobItem {
                key: key.to_string(),
                etag: None,
                last_modified,
                size: 0,
                storage_class: None,
            });
        }
        Ok(BlobItem {
            key: key.to_string(),
            etag: Some(hash_file(path).map_err(map_io)?),
            last_modified,
            size: md.len(),
            storage_class: None,
        })
    }

    /// Every key in the store, sorted.
    fn walk(&self) -> BackendResult<Vec<BlobItem>> {
        let mut out = Vec::new();
        let mut stack = vec![(self.root.clone(), String::new())];
        while let Some((dir, prefix)) = stack.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(rd) => rd,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(BackendError::Io(e)),
            };
            for entry in entries {
                let entry = entry?;
                let name = entry.file_name();
                if prefix.is_empty() && name.as_bytes() == META_DIR.as_bytes() {
                    continue;
                }
                let name = name.to_string_lossy().to_string();
                let file_type = entry.file_type()?;
                if file_type.is_dir() {
                    let key = format!("{}{}/", prefix, name);
                    out.push(self.item_for(&key, &entry.path())?);
                    stack.push((entry.path(), key));
                } else if file_type.is_file() {
                    let key = format!("{}{}", prefix, name);
                    out.push(self.item_for(&key, &entry.path())?);
                }
            }
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    fn upload_dir(&self, upload_id: &str) -> PathBuf {
        self.meta_root().join(UPLOAD_DIR).join(upload_id)
    }
}

impl ObjectBackend for DirStore {
    fn init(&self, _key: &str) -> BackendResult<()> {
        let md = fs::metadata(&self.root).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => BackendError::NoSuchBucket,
            _ => BackendError::Io(e),
        })?;
        if !md.is_dir() {
            return Err(BackendError::NoSuchBucket);
        }
        debug!("directory store ready at {}", self.root.display());
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            name: "dir".to_string(),
            no_parallel_multipart: false,
            max_multipart_size: 0,
            dir_blob: true,
            capacity: statfs(&self.root).ok(),
        }
    }

    fn bucket(&self) -> String {
        self.root.display().to_string()
    }

    fn head_blob(&self, key: &str) -> BackendResult<HeadBlobOutput> {
        let path = self.path_of(key)?;
        let md = fs::symlink_metadata(&path).map_err(map_io)?;
        if md.is_dir() != key.ends_with('/') {
            return Err(BackendError::NoSuchKey);
        }
        Ok(HeadBlobOutput {
            item: self.item_for(key, &path)?,
            content_type: None,
            metadata: self.read_metadata(key),
            is_dir_blob: md.is_dir(),
        })
    }

    fn list_blobs(&self, input: &ListBlobsInput) -> BackendResult<ListBlobsOutput> {
        Ok(paginate(self.walk()?, input))
    }

    fn get_blob(&self, input: &GetBlobInput) -> BackendResult<GetBlobOutput> {
        let head = self.head_blob(&input.key)?;
        if let Some(ref want) = input.if_match {
            if head.item.etag.as_ref() != Some(want) {
                return Err(BackendError::Http {
                    status: 412,
                    message: "precondition failed".to_string(),
                });
            }
        }
        let body = fs::read(self.path_of(&input.key)?).map_err(map_io)?;
        let len = body.len() as u64;
        let start = input.start.min(len) as usize;
        let end = if input.count == 0 {
            len
        } else {
            input.start.saturating_add(input.count).min(len)
        } as usize;
        Ok(GetBlobOutput {
            head,
            body: body[start..end].to_vec(),
        })
    }

    fn put_blob(&self, input: PutBlobInput) -> BackendResult<PutBlobOutput> {
        let path = self.path_of(&input.key)?;
        if input.key.ends_with('/') || input.dir_blob {
            fs::create_dir_all(&path)?;
        } else {
            self.write_atomic(&path, &input.body)?;
        }
        self.write_metadata(&input.key, &input.metadata)?;
        let item = self.item_for(&input.key, &path)?;
        Ok(PutBlobOutput {
            etag: item.etag,
            last_modified: item.last_modified,
            storage_class: None,
        })
    }

    fn copy_blob(&self, input: &CopyBlobInput) -> BackendResult<()> {
        let head = self.head_blob(&input.source)?;
        if let Some(ref etag) = input.etag {
            if head.item.etag.as_ref() != Some(etag) {
                return Err(BackendError::Http {
                    status: 412,
                    message: "precondition failed".to_string(),
                });
            }
        }
        let src = self.path_of(&input.source)?;
        let dst = self.path_of(&input.destination)?;
        if head.is_dir_blob {
            fs::create_dir_all(&dst)?;
        } else if src != dst {
            let body = fs::read(&src).map_err(map_io)?;
            self.write_atomic(&dst, &body)?;
        }
        let metadata = input.metadata.clone().unwrap_or(head.metadata);
        self.write_metadata(&input.destination, &metadata)
    }

    fn rename_blob(&self, source: &str, destination: &str) -> BackendResult<()> {
        let src = self.path_of(source)?;
        let dst = self.path_of(destination)?;
        if !src.exists() {
            return Err(BackendError::NoSuchKey);
        }
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&src, &dst).map_err(map_io)?;
        let metadata = self.read_metadata(source);
        self.write_metadata(source, &Metadata::new())?;
        self.write_metadata(destination, &metadata)
    }

    fn delete_blob(&self, key: &str) -> BackendResult<()> {
        let path = self.path_of(key)?;
        if key.ends_with('/') {
            match fs::remove_dir(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(BackendError::NoSuchKey),
                // A marker over live children stays implicit.
                Err(_) => {}
            }
        } else {
            fs::remove_file(&path).map_err(map_io)?;
        }
        self.write_metadata(key, &Metadata::new())
    }

    fn delete_blobs(&self, keys: &[String]) -> BackendResult<()> {
        for key in keys {
            match self.delete_blob(key) {
                Ok(()) | Err(BackendError::NoSuchKey) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn multipart_begin(&self, input: &MultipartBeginInput) -> BackendResult<MultipartUpload> {
        self.path_of(&input.key)?;
        let upload_id = format!(
            "{}-{}",
            std::process::id(),
            self.next_upload.fetch_add(1, Ordering::Relaxed)
        );
        fs::create_dir_all(self.upload_dir(&upload_id))?;
        Ok(MultipartUpload {
            key: input.key.clone(),
            upload_id,
            metadata: input.metadata.clone(),
        })
    }

    fn multipart_add(
        &self,
        upload: &MultipartUpload,
        part_number: u32,
        body: Vec<u8>,
    ) -> BackendResult<String> {
        let dir = self.upload_dir(&upload.upload_id);
        if !dir.is_dir() {
            return Err(BackendError::NoSuchKey);
        }
        fs::write(dir.join(format!("{:08}", part_number)), &body)?;
        Ok(etag_of(&body))
    }

    fn multipart_commit(
        &self,
        upload: &MultipartUpload,
        parts: &[String],
    ) -> BackendResult<PutBlobOutput> {
        let dir = self.upload_dir(&upload.upload_id);
        let mut names: Vec<PathBuf> = fs::read_dir(&dir)
            .map_err(map_io)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .collect();
        names.sort();
        if names.len() != parts.len() {
            return Err(BackendError::Http {
                status: 400,
                message: format!("expected {} parts, got {}", names.len(), parts.len()),
            });
        }
        let mut body = Vec::new();
        for name in &names {
            body.extend_from_slice(&fs::read(name)?);
        }
        let out = self.put_blob(PutBlobInput {
            key: upload.key.clone(),
            metadata: upload.metadata.clone(),
            content_type: None,
            dir_blob: false,
            body,
        })?;
        fs::remove_dir_all(&dir)?;
        Ok(out)
    }

    fn multipart_abort(&self, upload: &MultipartUpload) -> BackendResult<()> {
        match fs::remove_dir_all(self.upload_dir(&upload.upload_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BackendError::Io(e)),
        }
    }
}

fn statfs(path: &Path) -> io::Result<CapacityBase> {
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains null byte"))?;
    unsafe {
        let mut st: libc::statfs = std::mem::zeroed();
        if libc::statfs(c_path.as_ptr(), &mut st) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(CapacityBase {
            block_size: st.f_bsize as u32,
            blocks: st.f_blocks as u64,
            blocks_free: st.f_bfree as u64,
            blocks_available: st.f_bavail as u64,
            io_size: st.f_bsize as u32,
            inodes: st.f_files as u64,
            inodes_free: st.f_ffree as u64,
        })
    }
}
