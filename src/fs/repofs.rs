//! Builds the directory tree for one repository at one pinned revision.

use std::sync::Arc;

use bytes::Bytes;
use tracing::instrument;

use crate::gitiles::Tree;
use crate::{Error, GitSha1};

use super::config::{decide, CloneRule};
use super::fetcher::BlobFetcher;
use super::inode_tracker::InodeTracker;
use super::nodes::FileNode;
use super::META_DIR;

/// Options for one repository mount.
pub(crate) struct RepoOptions<'a> {
    /// Whether a clone URL is configured at all; without one no file carries
    /// a clone hint.
    pub clone_url_configured: bool,
    /// Per-file clone rules; the first match wins over the default.
    pub file_clone_rules: &'a [CloneRule],
}

/// Expands `tree` below `root`, hash-consing blobs through the tracker's
/// node cache and registering each blob's path with the fetch engine.
///
/// Submodule (`commit`) entries materialize as empty directories, the same
/// thing a plain git checkout leaves behind. Afterwards a `.slothfs`
/// directory with `treeID` and `tree.json` is attached.
#[instrument(skip_all, fields(tree.id = %tree.id), err)]
pub(crate) fn build(
    tracker: &mut InodeTracker,
    root: u64,
    tree: &Tree,
    fetcher: &Arc<BlobFetcher>,
    opts: &RepoOptions<'_>,
) -> Result<(), Error> {
    for entry in &tree.entries {
        match entry.entry_type.as_str() {
            "commit" => {
                // Submodule bodies are not supported; leave the empty
                // directory.
                tracker.mkdirs(root, &entry.name);
            }
            "blob" => {
                let id = GitSha1::from_hex(&entry.id)
                    .map_err(|e| Error::Protocol(format!("entry {}: {}", entry.name, e)))?;

                let (dir, base) = match entry.name.rsplit_once('/') {
                    Some((dir, base)) => (dir, base),
                    None => ("", entry.name.as_str()),
                };
                let parent = tracker.mkdirs(root, dir);

                let clone = decide(
                    opts.file_clone_rules,
                    &entry.name,
                    opts.clone_url_configured,
                );

                let executable = entry.mode & 0o111 != 0;
                let (ino, _) = tracker.get_or_put_file(&id, executable, || {
                    let target: Option<Bytes> =
                        entry.target.as_ref().map(|t| Bytes::from(t.clone().into_bytes()));
                    let size = match &target {
                        Some(t) => t.len() as u64,
                        None => entry.size.unwrap_or(0),
                    };
                    FileNode::new(id.clone(), entry.mode, size, target, clone, fetcher.clone())
                });
                tracker.add_child(parent, base, ino);

                fetcher.record_path(id, entry.name.clone());
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected object type {:?} for {}",
                    other, entry.name
                )))
            }
        }
    }

    let meta = tracker.ensure_dir(root, META_DIR);
    let id_file = tracker.put_mem(Bytes::from(tree.id.clone().into_bytes()));
    tracker.add_child(meta, "treeID", id_file);

    let tree_json = serde_json::to_vec_pretty(tree)?;
    let json_file = tracker.put_mem(Bytes::from(tree_json));
    tracker.add_child(meta, "tree.json", json_file);

    Ok(())
}
