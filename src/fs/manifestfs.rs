//! Composes many repository trees under one workspace root, at the paths a
//! manifest dictates, plus copyfile/linkfile overlays and metadata files.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::task::JoinSet;
use tracing::{instrument, warn};

use crate::cache::{self, Cache};
use crate::gitiles::{Client, Tree};
use crate::manifest::Manifest;
use crate::{Error, GitSha1};

use super::config::decide;
use super::fetcher::BlobFetcher;
use super::inode_tracker::InodeTracker;
use super::multifs::MultiFsOptions;
use super::repofs;
use super::META_DIR;

/// Obtains the tree for every project in parallel: tree cache first, then a
/// local bare repository, then the Gitiles REST service. Freshly fetched
/// trees are cached under the revision id. Any project failing to produce a
/// tree fails the whole map.
#[instrument(skip_all, err)]
pub(crate) async fn fetch_tree_map(
    cache: &Arc<Cache>,
    gitiles: &Arc<Client>,
    manifest: &Manifest,
) -> Result<HashMap<String, Tree>, Error> {
    let mut set = JoinSet::new();
    for p in &manifest.projects {
        let path = p.get_path().to_string();
        let name = p.name.clone();
        let revision = p.revision.clone();
        let clone_url = p.clone_url.clone();
        let cache = cache.clone();
        let gitiles = gitiles.clone();

        set.spawn(async move {
            let result = fetch_tree(&cache, &gitiles, &name, &revision, &clone_url).await;
            (path, result)
        });
    }

    // All producers report; the first error wins.
    let mut trees = HashMap::new();
    let mut first_err: Option<Error> = None;
    while let Some(joined) = set.join_next().await {
        let (path, result) = joined.map_err(Error::from)?;
        match result {
            Ok(tree) => {
                trees.insert(path, tree);
            }
            Err(e) if first_err.is_none() => {
                first_err = Some(Error::Storage(format!("Tree({}): {}", path, e)))
            }
            Err(_) => {}
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(trees),
    }
}

async fn fetch_tree(
    cache: &Arc<Cache>,
    gitiles: &Arc<Client>,
    name: &str,
    revision: &str,
    clone_url: &str,
) -> Result<Tree, Error> {
    let rev_id = GitSha1::from_hex(revision)?;

    if let Some(tree) = cache.tree.get(&rev_id)? {
        return Ok(tree);
    }

    let mut tree = None;
    if !clone_url.is_empty() {
        if let Some(repo_path) = cache.git.open_local(clone_url) {
            let id = rev_id.clone();
            match tokio::task::spawn_blocking(move || cache::read_tree(&repo_path, &id)).await? {
                Ok(t) => tree = Some(t),
                Err(e) => warn!(repo = name, error = %e, "local tree expansion failed"),
            }
        }
    }

    let tree = match tree {
        Some(t) => t,
        None => gitiles.repo(name).get_tree(revision, "", true).await?,
    };

    if let Err(e) = cache.tree.add(&rev_id, &tree) {
        warn!(error = %e, "tree cache add failed");
    }
    Ok(tree)
}

/// Builds a workspace below `ws_root`: mounts every project tree in depth
/// order, applies copyfile/linkfile overlays, and attaches the workspace
/// metadata files.
pub(crate) fn build(
    tracker: &mut InodeTracker,
    ws_root: u64,
    manifest: &Manifest,
    manifest_xml: &[u8],
    trees: &HashMap<String, Tree>,
    cache: &Arc<Cache>,
    gitiles: &Arc<Client>,
    options: &MultiFsOptions,
) -> Result<(), Error> {
    // Sort by path component count so a parent project is mounted before any
    // child project nested inside it.
    let mut by_depth: Vec<&crate::manifest::Project> = manifest.projects.iter().collect();
    by_depth.sort_by_key(|p| p.get_path().split('/').count());

    for p in &by_depth {
        let path = p.get_path();
        let tree = trees
            .get(path)
            .ok_or_else(|| Error::Storage(format!("no tree for project {}", path)))?;

        // clone-depth expresses shallow intent: never clone those. Otherwise
        // repo-path rules decide, and the default is to clone.
        let clone = if !p.clone_depth.is_empty() {
            false
        } else {
            decide(&options.repo_clone_rules, path, true)
        };
        let clone_url = if clone { p.clone_url.as_str() } else { "" };

        let lazy_repo = if clone_url.is_empty() {
            None
        } else {
            Some(cache.git.lazy(clone_url))
        };
        let fetcher = BlobFetcher::new(
            cache.blob.clone(),
            gitiles.repo(&p.name),
            p.revision.clone(),
            lazy_repo,
        );

        let mount = tracker.mkdirs(ws_root, path);
        repofs::build(
            tracker,
            mount,
            tree,
            &fetcher,
            &repofs::RepoOptions {
                clone_url_configured: !clone_url.is_empty(),
                file_clone_rules: &options.file_clone_rules,
            },
        )
        .map_err(|e| Error::Storage(format!("mount({}): {}", path, e)))?;
    }

    // Overlays go in after all repositories, so their directories exist.
    for p in &manifest.projects {
        for cp in &p.copyfile {
            let src = format!("{}/{}", p.get_path(), cp.src);
            let src_ino = tracker.resolve(ws_root, &src).ok_or_else(|| {
                Error::Storage(format!("copyfile({}): source {} does not exist", p.name, cp.src))
            })?;

            let (dir, base) = split_dest(&cp.dest);
            let dir_ino = tracker.resolve(ws_root, dir).ok_or_else(|| {
                Error::Storage(format!(
                    "copyfile({}): directory for dest {} does not exist",
                    p.name, cp.dest
                ))
            })?;
            if tracker.child(dir_ino, base).is_some() {
                return Err(Error::Storage(format!(
                    "copyfile({}): dest {} already exists",
                    p.name, cp.dest
                )));
            }

            // Hard-link semantics: the copy shares inode, mtime and xattrs
            // with its source.
            tracker.add_child(dir_ino, base, src_ino);
        }

        for lf in &p.linkfile {
            let (dir, base) = split_dest(&lf.dest);
            let dir_ino = tracker.resolve(ws_root, dir).ok_or_else(|| {
                Error::Storage(format!(
                    "linkfile({}): directory for dest {} does not exist",
                    p.name, lf.dest
                ))
            })?;
            if tracker.child(dir_ino, base).is_some() {
                return Err(Error::Storage(format!(
                    "linkfile({}): dest {} already exists",
                    p.name, lf.dest
                )));
            }

            let src = format!("{}/{}", p.get_path(), lf.src);
            let target = relative_path(dir, &src);
            let link = tracker.put_symlink(Bytes::from(target.into_bytes()));
            tracker.add_child(dir_ino, base, link);
        }
    }

    let meta = tracker.ensure_dir(ws_root, META_DIR);
    let xml_ino = tracker.put_mem(Bytes::copy_from_slice(manifest_xml));
    tracker.add_child(meta, "manifest.xml", xml_ino);

    let empty_tree = serde_json::to_vec(&Tree::default())?;
    let json_ino = tracker.put_mem(Bytes::from(empty_tree));
    tracker.add_child(meta, "tree.json", json_ino);

    Ok(())
}

/// Validates that every project revision is a hex object id.
pub(crate) fn check_revisions(manifest: &Manifest) -> Result<(), Error> {
    for p in &manifest.projects {
        GitSha1::from_hex(&p.revision).map_err(|e| {
            Error::Parse(format!(
                "project {} revision {:?} does not parse: {}",
                p.name, p.revision, e
            ))
        })?;
    }
    Ok(())
}

/// Replaces a broken workspace subtree with a single `ERROR` file describing
/// the cause.
pub(crate) fn attach_error(tracker: &mut InodeTracker, ws_root: u64, err: &Error) {
    for (name, child) in tracker.dir_entries(ws_root).unwrap_or_default() {
        tracker.remove_child(ws_root, &name);
        tracker.remove_subtree(child);
    }
    let msg = tracker.put_mem(Bytes::from(err.to_string().into_bytes()));
    tracker.add_child(ws_root, "ERROR", msg);
}

fn split_dest(dest: &str) -> (&str, &str) {
    match dest.rsplit_once('/') {
        Some((dir, base)) => (dir, base),
        None => ("", dest),
    }
}

/// The relative path from directory `from` to `to`, both workspace relative.
fn relative_path(from: &str, to: &str) -> String {
    let from_parts: Vec<&str> = from.split('/').filter(|c| !c.is_empty()).collect();
    let to_parts: Vec<&str> = to.split('/').filter(|c| !c.is_empty()).collect();

    let common = from_parts
        .iter()
        .zip(to_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut parts: Vec<&str> = Vec::new();
    for _ in common..from_parts.len() {
        parts.push("..");
    }
    parts.extend(&to_parts[common..]);
    parts.join("/")
}
