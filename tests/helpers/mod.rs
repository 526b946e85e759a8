#![allow(dead_code)]

use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bucketfs::backend::memory::MemoryStore;
use bucketfs::backend::Backend;
use bucketfs::config::FsConfig;
use bucketfs::fs::handles::DirEntry;
use bucketfs::fs::BucketFs;

pub use bucketfs::fs::inode::ROOT_ID;

/// A filesystem over an in-memory store the test can inspect and poke at.
pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub fs: BucketFs,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with(MemoryStore::new("test"), |_| {})
    }

    /// Caches expire immediately, so every lookup goes to the store.
    pub fn uncached() -> Self {
        Self::with(MemoryStore::new("test"), |c| {
            c.stat_cache_ttl = Duration::ZERO;
            c.type_cache_ttl = Duration::ZERO;
        })
    }

    pub fn with(store: MemoryStore, tune: impl FnOnce(&mut FsConfig)) -> Self {
        let mut config = test_config();
        tune(&mut config);
        let store = Arc::new(store);
        let backend = Arc::new(Backend::new(store.clone(), None));
        Fixture {
            fs: BucketFs::new(config, backend),
            store,
        }
    }

    /// Id of `path`, looked up one segment at a time from the root.
    pub fn lookup_path(&self, path: &str) -> u64 {
        path.split('/')
            .filter(|s| !s.is_empty())
            .fold(ROOT_ID, |parent, seg| {
                self.fs
                    .lookup(parent, seg)
                    .unwrap_or_else(|e| panic!("lookup {:?} in {}: {}", seg, parent, e))
                    .ino()
            })
    }

    /// Every entry of directory `id`, read the way the kernel does: keep
    /// asking from the last offset until an empty batch comes back.
    pub fn list(&self, id: u64) -> Vec<DirEntry> {
        let fh = self.fs.opendir(id).expect("opendir");
        let mut all = Vec::new();
        loop {
            let batch = self.fs.readdir(fh, all.len() as u64).expect("readdir");
            if batch.is_empty() {
                break;
            }
            all.extend(batch);
        }
        self.fs.releasedir(fh).expect("releasedir");
        all
    }

    pub fn names(&self, id: u64) -> Vec<String> {
        self.list(id).into_iter().map(|e| e.name).collect()
    }
}

pub fn test_config() -> FsConfig {
    FsConfig {
        uid: 1000,
        gid: 1000,
        request_timeout: None,
        readahead_size: 0,
        ..FsConfig::default()
    }
}

pub fn pid() -> u32 {
    std::process::id()
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    cond()
}

/// Check whether `path` appears in the output of the `mount` command.
pub fn is_mounted(path: &Path) -> bool {
    let output = match Command::new("mount").output() {
        Ok(o) => o,
        Err(_) => return false,
    };
    let stdout = String::from_utf8_lossy(&output.stdout);
    let path_str = path.to_string_lossy();
    stdout.lines().any(|line| line.contains(path_str.as_ref()))
}
