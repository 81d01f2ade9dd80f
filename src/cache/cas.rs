use std::fs::File;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
#[cfg(test)]
use std::path::Path;

use tracing::instrument;

use crate::GitSha1;

use super::{mkdir_private, shard_path};

/// Content addressed storage for git SHA1 blob data.
///
/// Blobs are stored as plain uncompressed files without the git object
/// header, so the FUSE layer can hand an ordinary file descriptor straight to
/// the kernel. Writes land in a tempfile in the store root and are renamed
/// into place, which makes them atomic against concurrent readers.
///
/// The writer does NOT verify that the data hashes to the id it is stored
/// under; callers are trusted to pass bytes obtained from the upstream git
/// store for that id.
pub struct Cas {
    dir: PathBuf,
}

impl Cas {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        mkdir_private(&dir)?;
        Ok(Cas { dir })
    }

    fn path(&self, id: &GitSha1) -> PathBuf {
        shard_path(&self.dir, id)
    }

    /// Returns the blob opened for reading, or None if it is not present.
    pub fn open(&self, id: &GitSha1) -> std::io::Result<Option<File>> {
        match File::open(self.path(id)) {
            Ok(f) => Ok(Some(f)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Installs `data` under `id` atomically.
    #[instrument(skip_all, fields(blob.id = %id, blob.len = data.len()), err)]
    pub fn write(&self, id: &GitSha1, data: &[u8]) -> std::io::Result<()> {
        let tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        std::fs::write(tmp.path(), data)?;
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o444))?;

        let dest = self.path(id);
        mkdir_private(dest.parent().expect("sharded path has a parent"))?;
        tmp.persist(&dest).map_err(|e| e.error)?;
        Ok(())
    }

}

/// Helper for test setups: a CAS rooted in a fresh location under `dir`.
#[cfg(test)]
pub(crate) fn scratch_cas(dir: &Path) -> Cas {
    Cas::new(dir.join("blobs")).expect("cas setup")
}
