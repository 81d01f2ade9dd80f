use std::path::PathBuf;

use tracing::instrument;

use crate::gitiles::Tree;
use crate::{Error, GitSha1};

use super::{mkdir_private, shard_path};

/// Caches recursively expanded trees, keyed by git commit or tree id.
///
/// Records are human readable JSON, written to a tempfile and renamed into
/// place. A tree requested by commit id is additionally indexed under its own
/// embedded tree id, so either key finds it later.
pub struct TreeCache {
    dir: PathBuf,
}

impl TreeCache {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        mkdir_private(&dir)?;
        Ok(TreeCache { dir })
    }

    fn path(&self, id: &GitSha1) -> PathBuf {
        shard_path(&self.dir, id)
    }

    /// Returns the tree stored under `id`, if present.
    pub fn get(&self, id: &GitSha1) -> Result<Option<Tree>, Error> {
        let content = match std::fs::read(self.path(id)) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let tree = serde_json::from_slice(&content)?;
        Ok(Some(tree))
    }

    /// Stores `tree` under `id`, and under the tree's own id if different.
    #[instrument(skip_all, fields(tree.id = %id), err)]
    pub fn add(&self, id: &GitSha1, tree: &Tree) -> Result<(), Error> {
        self.write_record(id, tree)?;

        if id.hex() != tree.id {
            let tree_id = GitSha1::from_hex(&tree.id)?;
            self.write_record(&tree_id, tree)?;
        }
        Ok(())
    }

    fn write_record(&self, id: &GitSha1, tree: &Tree) -> Result<(), Error> {
        let tmp = tempfile::NamedTempFile::new_in(&self.dir).map_err(Error::from)?;
        let content = serde_json::to_vec_pretty(tree)?;
        std::fs::write(tmp.path(), content).map_err(Error::from)?;

        let dest = self.path(id);
        mkdir_private(dest.parent().expect("sharded path has a parent")).map_err(Error::from)?;
        tmp.persist(&dest).map_err(|e| Error::from(e.error))?;
        Ok(())
    }
}
