use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::GitSha1;

use super::nodes::{DirNode, FileNode, InodeData};

/// The root inode of the mount.
pub(crate) const ROOT_ID: u64 = 1;

/// Key of the process-wide node cache: blobs with equal contents and equal
/// execute bit share one inode.
#[derive(Clone, PartialEq, Eq, Hash)]
struct NodeCacheKey {
    id: GitSha1,
    executable: bool,
}

/// InodeTracker keeps the entire inode table: data behind each inode, inode
/// allocation, and the node cache that hard-links identical blobs.
///
/// Reusing one node for the same blob in multiple checkouts means each blob
/// occupies kernel page cache memory only once, and moving the data into the
/// kernel is paid for once. The node cache is the longest-lived holder of a
/// file node: removing a workspace drops only the workspace's directory
/// entries, never the shared file nodes.
pub struct InodeTracker {
    data: HashMap<u64, InodeData>,

    // lookup table for blobs by (id, executable bit)
    node_cache: HashMap<NodeCacheKey, u64>,

    next_inode: u64,
}

impl Default for InodeTracker {
    fn default() -> Self {
        let mut data = HashMap::new();
        data.insert(ROOT_ID, InodeData::Dir(DirNode::default()));
        Self {
            data,
            node_cache: HashMap::new(),
            next_inode: 2,
        }
    }
}

impl InodeTracker {
    pub fn get(&self, ino: u64) -> Option<&InodeData> {
        self.data.get(&ino)
    }

    fn insert(&mut self, data: InodeData) -> u64 {
        let ino = self.next_inode;
        self.next_inode += 1;
        self.data.insert(ino, data);
        ino
    }

    /// Allocates a fresh directory inode.
    pub fn put_dir(&mut self) -> u64 {
        self.insert(InodeData::Dir(DirNode::default()))
    }

    pub fn put_symlink(&mut self, target: Bytes) -> u64 {
        self.insert(InodeData::Symlink(target))
    }

    pub fn put_mem(&mut self, data: Bytes) -> u64 {
        self.insert(InodeData::Mem(data))
    }

    /// Returns the cached inode for `(id, executable)`, or builds the node
    /// with `make` and allocates one.
    pub fn get_or_put_file(
        &mut self,
        id: &GitSha1,
        executable: bool,
        make: impl FnOnce() -> FileNode,
    ) -> (u64, Arc<FileNode>) {
        let key = NodeCacheKey {
            id: id.clone(),
            executable,
        };
        if let Some(&ino) = self.node_cache.get(&key) {
            match self.data.get(&ino) {
                Some(InodeData::Regular(node)) => return (ino, node.clone()),
                _ => unreachable!("node cache points at a non-file inode"),
            }
        }

        let node = Arc::new(make());
        let ino = self.insert(InodeData::Regular(node.clone()));
        self.node_cache.insert(key, ino);
        (ino, node)
    }

    /// Looks up a child inode by name.
    pub fn child(&self, parent: u64, name: &str) -> Option<u64> {
        match self.data.get(&parent) {
            Some(InodeData::Dir(dir)) => dir.children.get(name).copied(),
            _ => None,
        }
    }

    /// Attaches `child` under `parent`. Panics if `parent` is not a
    /// directory.
    pub fn add_child(&mut self, parent: u64, name: &str, child: u64) {
        match self.data.get_mut(&parent) {
            Some(InodeData::Dir(dir)) => {
                dir.children.insert(name.to_string(), child);
            }
            _ => panic!("add_child on non-directory inode {}", parent),
        }
    }

    pub fn remove_child(&mut self, parent: u64, name: &str) -> Option<u64> {
        match self.data.get_mut(&parent) {
            Some(InodeData::Dir(dir)) => dir.children.remove(name),
            _ => None,
        }
    }

    /// Returns the child directory inode with `name`, creating it if absent.
    pub fn ensure_dir(&mut self, parent: u64, name: &str) -> u64 {
        if let Some(ino) = self.child(parent, name) {
            return ino;
        }
        let ino = self.put_dir();
        self.add_child(parent, name, ino);
        ino
    }

    /// Walks `path` below `parent`, synthesizing intermediate directories.
    pub fn mkdirs(&mut self, parent: u64, path: &str) -> u64 {
        let mut ino = parent;
        for comp in path.split('/').filter(|c| !c.is_empty()) {
            ino = self.ensure_dir(ino, comp);
        }
        ino
    }

    /// Resolves a slash-separated path below `parent`.
    pub fn resolve(&self, parent: u64, path: &str) -> Option<u64> {
        let mut ino = parent;
        for comp in path.split('/').filter(|c| !c.is_empty()) {
            ino = self.child(ino, comp)?;
        }
        Some(ino)
    }

    /// Snapshot of a directory listing, in name order.
    pub fn dir_entries(&self, ino: u64) -> Option<Vec<(String, u64)>> {
        match self.data.get(&ino) {
            Some(InodeData::Dir(dir)) => Some(
                dir.children
                    .iter()
                    .map(|(name, ino)| (name.clone(), *ino))
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Detaches and forgets the subtree rooted at `ino`. Shared file nodes
    /// stay alive in the node cache; only workspace-owned directory, symlink
    /// and in-memory inodes are dropped.
    pub fn remove_subtree(&mut self, ino: u64) {
        let mut todo = vec![ino];
        while let Some(cur) = todo.pop() {
            let children: Vec<u64> = match self.data.get(&cur) {
                Some(InodeData::Dir(dir)) => dir.children.values().copied().collect(),
                Some(InodeData::Regular(_)) => continue,
                Some(InodeData::Symlink(_)) | Some(InodeData::Mem(_)) => {
                    self.data.remove(&cur);
                    continue;
                }
                None => continue,
            };
            self.data.remove(&cur);
            todo.extend(children);
        }
    }
}
