//! Grafting stores onto subtrees of the namespace.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use super::inode::{Binding, Inode, Kind, Stamp};
use super::BucketFs;
use crate::backend::Backend;
use crate::error::{FsError, Result};

/// A store bound below `name`, a `/`-separated path from the root.
pub struct Mount {
    pub name: String,
    pub backend: Arc<Backend>,
    pub prefix: String,
    mounted: AtomicBool,
}

impl Mount {
    pub fn new(name: &str, backend: Arc<Backend>, prefix: &str) -> Self {
        Self {
            name: name.trim_matches('/').to_string(),
            backend,
            prefix: prefix.to_string(),
            mounted: AtomicBool::new(false),
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

impl BucketFs {
    /// Bind `mount` at its path, creating the directories leading to it.
    /// Grafting an already mounted record does nothing.
    pub fn mount(&self, mount: Arc<Mount>) -> Result<()> {
        if mount.mounted.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let res = self.graft(&mount);
        if res.is_err() {
            mount.mounted.store(false, Ordering::SeqCst);
        } else {
            self.mounts.lock().push(mount);
        }
        res
    }

    fn graft(&self, mount: &Mount) -> Result<()> {
        let segs = segments(&mount.name);
        let Some((last, parents)) = segs.split_last() else {
            return Err(FsError::Invalid);
        };

        let mut dir = self.inodes.root();
        for seg in parents {
            dir = self.graft_dir(&dir, seg, None)?;
        }
        let binding = Arc::new(Binding::new(Arc::clone(&mount.backend), &mount.prefix));
        self.graft_dir(&dir, last, Some(binding))?;
        info!(
            "grafted {} (prefix {:?}) at /{}",
            mount.backend.bucket(),
            mount.prefix,
            mount.name
        );
        Ok(())
    }

    /// Make sure `name` under `parent` is a never-expiring directory, binding
    /// it when `binding` is given.
    fn graft_dir(
        &self,
        parent: &Arc<Inode>,
        name: &str,
        binding: Option<Arc<Binding>>,
    ) -> Result<Arc<Inode>> {
        let build = |id| {
            let dir = Inode::new(id, Kind::Dir, name, Some(parent), &self.config);
            match binding.clone() {
                Some(b) => dir.with_binding(b),
                None => dir,
            }
        };
        let (dir, inserted) = self.inodes.insert(parent, name, None, 0, build)?;
        if dir.kind() != Kind::Dir {
            return Err(FsError::NotDir);
        }

        if !inserted {
            if let Some(binding) = binding {
                dir.bind(Some(binding));
                reset_list_stamps(&dir);
            }
        }
        let mut st = dir.lock();
        if st.attr_stamp != Stamp::Forever {
            // The graft holds a reference so forget never reclaims it.
            dir.inc_ref(1);
            st.attr_stamp = Stamp::Forever;
        }
        drop(st);
        Ok(dir)
    }

    pub fn mount_all(&self, mounts: Vec<Arc<Mount>>) -> Result<()> {
        for mount in mounts {
            self.mount(mount)?;
        }
        Ok(())
    }

    /// Drop the binding at `path` and forget everything cached below it.
    pub fn unmount(&self, path: &str) -> Result<()> {
        let segs = segments(path);
        if segs.is_empty() {
            return Err(FsError::Invalid);
        }

        let mut dir = self.inodes.root();
        for seg in &segs {
            let next = dir
                .lock()
                .dir
                .as_ref()
                .and_then(|d| d.children.get(*seg).cloned());
            dir = next.ok_or(FsError::NotFound)?;
        }
        if !dir.is_dir() {
            return Err(FsError::NotDir);
        }

        dir.bind(None);
        self.inodes.clear_children(&dir);
        {
            let mut st = dir.lock();
            st.reset_dir(&self.config);
            st.attr_stamp.touch();
        }

        let name = segs.join("/");
        let mut mounts = self.mounts.lock();
        mounts.retain(|m| {
            if m.name == name {
                m.mounted.store(false, Ordering::SeqCst);
                false
            } else {
                true
            }
        });
        info!("unmounted /{}", name);
        Ok(())
    }
}

/// Expire the listing of `dir` and of every cached directory below it.
fn reset_list_stamps(dir: &Arc<Inode>) {
    let mut pending = vec![Arc::clone(dir)];
    while let Some(next) = pending.pop() {
        let children: Vec<Arc<Inode>> = {
            let mut st = next.lock();
            match st.dir.as_mut() {
                Some(d) => {
                    d.list_stamp = Stamp::Expired;
                    d.children.values().filter(|c| c.is_dir()).cloned().collect()
                }
                None => {
                    warn!("inode {} lost its directory state", next.id);
                    Vec::new()
                }
            }
        };
        pending.extend(children);
    }
}
