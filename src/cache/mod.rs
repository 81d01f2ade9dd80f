//! Persistent, filesystem-backed caches: raw blobs (content addressed),
//! recursively expanded tree listings, and bare git repositories.

mod cas;
mod gitcache;
mod lazyrepo;
mod treecache;

pub use cas::Cas;
pub use gitcache::{read_blob, read_tree, GitCache};
pub use lazyrepo::LazyRepo;
pub use treecache::TreeCache;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Configurable options for the different caches.
#[derive(Clone, Debug, Default)]
pub struct Options {
    /// How often to run git fetch on the locally cached bare repositories.
    /// None disables the background fetch loop.
    pub fetch_frequency: Option<Duration>,
}

/// Combines the blob, tree and git repo caches under one root directory.
pub struct Cache {
    pub git: Arc<GitCache>,
    pub tree: TreeCache,
    pub blob: Arc<Cas>,

    root: PathBuf,
}

impl Cache {
    /// Sets up a cache instance rooted at `dir`. A background fetch loop is
    /// spawned onto the current tokio runtime if `fetch_frequency` is set.
    pub fn new(dir: impl AsRef<Path>, opts: Options) -> std::io::Result<Arc<Self>> {
        let root = std::path::absolute(dir.as_ref())?;
        mkdir_private(&root)?;

        let git = GitCache::new(root.join("git"), &opts)?;
        let blob = Arc::new(Cas::new(root.join("blobs"))?);
        let tree = TreeCache::new(root.join("tree"))?;

        Ok(Arc::new(Cache {
            git,
            tree,
            blob,
            root,
        }))
    }

    /// The directory holding the cache storage.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Creates a directory (and parents) with mode 0700.
pub(crate) fn mkdir_private(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
}

/// The two-level `xxx/yyyy…` sharding used by the blob and tree stores: the
/// first three hex characters name the subdirectory.
pub(crate) fn shard_path(root: &Path, id: &crate::GitSha1) -> PathBuf {
    let hex = id.hex();
    root.join(&hex[..3]).join(&hex[3..])
}
