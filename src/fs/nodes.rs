//! Inode-level entities: shared blob-backed file nodes, synthesized
//! directories, literal symlinks, and in-memory metadata files.

#![allow(clippy::unnecessary_cast)] // libc::S_IFDIR is u32 on Linux and u16 on MacOS

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use fuse_backend_rs::abi::fuse_abi::Attr;
use parking_lot::Mutex;

use crate::GitSha1;

use super::fetcher::BlobFetcher;

/// A read-only blob in the filesystem.
///
/// FileNodes are hash-consed through the node cache: the same `(id,
/// executable)` pair resolves to the same node, and thus the same inode, in
/// every workspace. Only the modification time is mutable, and because the
/// node is shared, an mtime update is visible process wide.
pub struct FileNode {
    /// Git object id of the blob.
    pub id: GitSha1,
    /// Git file mode (0100644, 0100755 or 0120000).
    pub mode: u32,
    pub size: u64,
    /// Symlink target for 0120000 entries.
    pub link_target: Option<Bytes>,
    /// Whether a read of this file should trigger a background clone of the
    /// repository it came from.
    pub clone: bool,
    /// The fetch engine of the repository this node was first seen in.
    pub fetcher: Arc<BlobFetcher>,

    mtime: Mutex<SystemTime>,
}

impl FileNode {
    pub fn new(
        id: GitSha1,
        mode: u32,
        size: u64,
        link_target: Option<Bytes>,
        clone: bool,
        fetcher: Arc<BlobFetcher>,
    ) -> Self {
        FileNode {
            id,
            mode,
            size,
            link_target,
            clone,
            fetcher,
            mtime: Mutex::new(default_mtime()),
        }
    }

    pub fn mtime(&self) -> SystemTime {
        *self.mtime.lock()
    }

    pub fn set_mtime(&self, t: SystemTime) {
        *self.mtime.lock() = t;
    }

    pub fn executable(&self) -> bool {
        self.mode & 0o111 != 0
    }

    pub(crate) fn attr(&self, ino: u64) -> Attr {
        let (secs, nanos) = split_time(self.mtime());
        Attr {
            ino,
            size: self.size,
            blksize: 1024,
            mode: self.mode,
            mtime: secs,
            mtimensec: nanos,
            ..Default::default()
        }
    }
}

/// Ninja and friends use mtime == 0 as a "file does not exist" marker, so
/// freshly created nodes sit one second past the epoch.
pub(crate) fn default_mtime() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(1)
}

pub(crate) fn split_time(t: SystemTime) -> (u64, u32) {
    let d = t.duration_since(UNIX_EPOCH).unwrap_or_default();
    (d.as_secs(), d.subsec_nanos())
}

/// A directory synthesized from tree entry paths. Owned by the workspace it
/// appears in.
#[derive(Default)]
pub struct DirNode {
    pub children: BTreeMap<String, u64>,
}

/// The data behind one inode.
pub enum InodeData {
    Dir(DirNode),
    /// A blob; shared across workspaces through the node cache.
    Regular(Arc<FileNode>),
    /// A literal symlink target (linkfile overlays, config entries).
    Symlink(Bytes),
    /// An in-memory metadata file (`.slothfs/…`, `ERROR`).
    Mem(Bytes),
}

impl InodeData {
    pub(crate) fn attr(&self, ino: u64) -> Attr {
        let (secs, nanos) = split_time(default_mtime());
        match self {
            InodeData::Dir(_) => Attr {
                ino,
                blksize: 1024,
                mode: libc::S_IFDIR as u32 | 0o755,
                mtime: secs,
                mtimensec: nanos,
                ..Default::default()
            },
            InodeData::Regular(node) => node.attr(ino),
            InodeData::Symlink(target) => Attr {
                ino,
                size: target.len() as u64,
                blksize: 1024,
                mode: libc::S_IFLNK as u32,
                mtime: secs,
                mtimensec: nanos,
                ..Default::default()
            },
            InodeData::Mem(data) => Attr {
                ino,
                size: data.len() as u64,
                blksize: 1024,
                mode: libc::S_IFREG as u32 | 0o644,
                mtime: secs,
                mtimensec: nanos,
                ..Default::default()
            },
        }
    }

    pub(crate) fn as_fuse_type(&self) -> u32 {
        match self {
            InodeData::Dir(_) => libc::DT_DIR as u32,
            InodeData::Regular(node) if node.link_target.is_some() => libc::DT_LNK as u32,
            InodeData::Regular(_) | InodeData::Mem(_) => libc::DT_REG as u32,
            InodeData::Symlink(_) => libc::DT_LNK as u32,
        }
    }
}
