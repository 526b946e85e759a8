use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockWriteGuard};
use tracing::debug;

use super::inode::{Inode, ROOT_ID};
use crate::error::{FsError, Result};

struct Table {
    inodes: HashMap<u64, Arc<Inode>>,
    next_id: u64,
}

/// Every inode the kernel may name, keyed by id.
pub struct InodeTable {
    table: RwLock<Table>,
    root: Arc<Inode>,
    forgotten: AtomicU64,
}

impl InodeTable {
    pub fn new(root: Arc<Inode>) -> Self {
        debug_assert_eq!(root.id, ROOT_ID);
        let mut inodes = HashMap::new();
        inodes.insert(ROOT_ID, Arc::clone(&root));
        Self {
            table: RwLock::new(Table {
                inodes,
                next_id: ROOT_ID + 1,
            }),
            root,
            forgotten: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> Arc<Inode> {
        Arc::clone(&self.root)
    }

    pub fn get(&self, id: u64) -> Result<Arc<Inode>> {
        self.table
            .read()
            .inodes
            .get(&id)
            .cloned()
            .ok_or(FsError::UnknownInode(id))
    }

    pub fn contains(&self, id: u64) -> bool {
        self.table.read().inodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.table.read().inodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inodes reclaimed through forget since startup.
    pub fn forgotten(&self) -> u64 {
        self.forgotten.load(Ordering::Relaxed)
    }

    /// A fresh id. Ids are never handed out twice.
    pub fn allocate(&self) -> u64 {
        let mut table = self.table.write();
        let id = table.next_id;
        table.next_id += 1;
        id
    }

    /// Link a new child named `name` under `parent`, building it with a fresh
    /// id. If a child with that name is already linked, it is returned
    /// instead, unless it is `stale`, in which case it is detached and
    /// replaced. `refs` references are taken on whichever inode is returned
    /// before any lock is released. The flag is true when a new inode was
    /// linked.
    pub fn insert<F>(
        &self,
        parent: &Arc<Inode>,
        name: &str,
        stale: Option<&Arc<Inode>>,
        refs: u64,
        build: F,
    ) -> Result<(Arc<Inode>, bool)>
    where
        F: FnOnce(u64) -> Inode,
    {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(FsError::Invalid);
        }

        let mut table = self.table.write();
        let mut replaced = None;
        let child = {
            let mut pstate = parent.lock();
            let dir = pstate.dir.as_mut().ok_or(FsError::NotDir)?;
            if let Some(existing) = dir.children.get(name).cloned() {
                match stale {
                    Some(stale) if Arc::ptr_eq(stale, &existing) => {
                        dir.detach(&existing);
                        replaced = Some(existing);
                    }
                    _ => {
                        existing.inc_ref(refs);
                        return Ok((existing, false));
                    }
                }
            }

            let id = table.next_id;
            table.next_id += 1;
            let child = Arc::new(build(id));
            debug_assert_eq!(child.id, id);
            child.inc_ref(refs);
            dir.children.insert(name.to_string(), Arc::clone(&child));
            child
        };
        table.inodes.insert(child.id, Arc::clone(&child));

        if let Some(old) = replaced {
            if old.refs() == 0 {
                Self::purge_locked(&mut table, &old);
            }
        }
        Ok((child, true))
    }

    /// Unlink `child` from `parent`, dropping it from the table when nothing
    /// references it any more.
    pub fn detach(&self, parent: &Arc<Inode>, child: &Arc<Inode>) {
        let mut table = self.table.write();
        if let Some(dir) = parent.lock().dir.as_mut() {
            dir.detach(child);
        }
        if child.refs() == 0 {
            Self::purge_locked(&mut table, child);
        }
    }

    /// Drop `inode` if it is both unreferenced and unreachable.
    pub fn purge_if_orphaned(&self, inode: &Arc<Inode>) -> bool {
        let mut table = self.table.write();
        if inode.refs() == 0 && inode.is_detached() {
            Self::purge_locked(&mut table, inode);
            true
        } else {
            false
        }
    }

    /// Release `n` kernel references to `id`. When the last one goes the
    /// inode is detached from its parent and removed; true in that case.
    /// Forgetting an id that is not in the table is an error, so a repeated
    /// forget can never free anything twice.
    pub fn forget(&self, id: u64, n: u64) -> Result<bool> {
        let inode = self.get(id)?;
        loop {
            let parent = inode.parent();
            let mut table = self.table.write();
            let live = table
                .inodes
                .get(&id)
                .is_some_and(|i| Arc::ptr_eq(i, &inode));
            if !live {
                return Err(FsError::UnknownInode(id));
            }

            match parent {
                Some(parent) => {
                    let mut pstate = parent.lock();
                    // Renamed between reading the link and locking the parent.
                    if !inode.parent().is_some_and(|p| Arc::ptr_eq(&p, &parent)) {
                        continue;
                    }
                    if !inode.dec_ref(n) {
                        return Ok(false);
                    }
                    if let Some(dir) = pstate.dir.as_mut() {
                        dir.detach(&inode);
                    }
                }
                None => {
                    if !inode.dec_ref(n) || id == ROOT_ID {
                        return Ok(false);
                    }
                }
            }

            Self::purge_locked(&mut table, &inode);
            self.forgotten.fetch_add(1, Ordering::Relaxed);
            debug!("forgot inode {}", id);
            return Ok(true);
        }
    }

    /// Detach every child of `dir` that `keep` rejects, purging the
    /// unreferenced ones. Returns the children that remain. `keep` runs
    /// without the directory locked and may lock the child.
    pub fn prune<F>(&self, dir: &Arc<Inode>, keep: F) -> Vec<Arc<Inode>>
    where
        F: Fn(&str, &Arc<Inode>) -> bool,
    {
        let snapshot: Vec<(String, Arc<Inode>)> = match dir.lock().dir.as_ref() {
            Some(state) => state
                .children
                .iter()
                .map(|(name, child)| (name.clone(), Arc::clone(child)))
                .collect(),
            None => return Vec::new(),
        };
        let doomed: Vec<Arc<Inode>> = snapshot
            .into_iter()
            .filter(|(name, child)| !keep(name, child))
            .map(|(_, child)| child)
            .collect();

        let mut table = self.table.write();
        let mut dropped = Vec::new();
        let kept = {
            let mut st = dir.lock();
            let Some(state) = st.dir.as_mut() else {
                return Vec::new();
            };
            for child in doomed {
                if state.detach(&child) {
                    dropped.push(child);
                }
            }
            state.children.values().cloned().collect()
        };
        for child in dropped {
            debug!("pruned {:?} from inode {}", child.name(), dir.id);
            if child.refs() == 0 {
                Self::purge_locked(&mut table, &child);
            }
        }
        kept
    }

    /// Detach and purge all children of `dir`.
    pub fn clear_children(&self, dir: &Arc<Inode>) {
        self.prune(dir, |_, _| false);
    }

    /// Remove `inode` and every unreferenced inode below it.
    fn purge_locked(table: &mut RwLockWriteGuard<'_, Table>, inode: &Arc<Inode>) {
        let mut pending = vec![Arc::clone(inode)];
        while let Some(next) = pending.pop() {
            if next.id == ROOT_ID {
                continue;
            }
            if table
                .inodes
                .get(&next.id)
                .is_some_and(|i| Arc::ptr_eq(i, &next))
            {
                table.inodes.remove(&next.id);
            }
            if let Some(dir) = next.lock().dir.as_ref() {
                pending.extend(dir.children.values().filter(|c| c.refs() == 0).cloned());
            }
        }
    }
}
