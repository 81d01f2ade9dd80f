//! Augments a partial read-write checkout with a symlink forest into a
//! mounted slothfs workspace, and computes which files changed between two
//! workspace snapshots so the build system can be nudged.

mod deref;
mod repotree;

pub use deref::{deref_manifest, fetch_manifest};
pub use repotree::{FileInfo, RepoTree};

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use tokio::task::JoinSet;
use tracing::{debug, instrument};
use walkdir::WalkDir;

use crate::Error;

pub(crate) use crate::fs::META_DIR;

/// Updates `rw` with symlinks into the workspace at `ro`. Returns the files
/// that should be touched: `(added, changed)`, as absolute paths inside the
/// workspace, lexicographically sorted.
///
/// Running it twice with unchanged inputs yields empty lists the second
/// time. Nothing outside `rw` is modified.
#[instrument(skip_all, fields(ro = %ro.display(), rw = %rw.display()), err)]
pub async fn checkout(ro: &Path, rw: &Path) -> Result<(Vec<String>, Vec<String>), Error> {
    let mount = ro
        .parent()
        .ok_or_else(|| Error::Parse(format!("checkout root {} has no parent", ro.display())))?
        .to_path_buf();
    let ro = ro.to_path_buf();
    let rw = rw.to_path_buf();

    let ws_names = {
        let mount = mount.clone();
        let rw = rw.clone();
        tokio::task::spawn_blocking(move || clear_links(&mount, &rw)).await??
    };

    // A previously linked workspace that still exists serves as the old
    // snapshot for the diff. A repeat run against the same workspace diffs
    // it against itself, which is what makes the operation idempotent.
    let mut old_root = None;
    for name in &ws_names {
        let candidate = mount.join(name);
        if !candidate.exists() {
            continue;
        }
        if candidate != ro {
            old_root = Some(candidate);
            break;
        }
        old_root.get_or_insert(candidate);
    }

    // The three traversals run in parallel; all report before the first
    // error wins.
    let mut set: JoinSet<Result<Scan, Error>> = JoinSet::new();
    {
        let old_root = old_root.clone();
        set.spawn_blocking(move || {
            let infos = match old_root {
                Some(root) => RepoTree::from_slothfs(&root)?.all_files(),
                None => BTreeMap::new(),
            };
            Ok(Scan::Old(infos))
        });
    }
    {
        let rw = rw.clone();
        set.spawn_blocking(move || Ok(Scan::Rw(RepoTree::from_fs(&rw)?)));
    }
    {
        let ro = ro.clone();
        set.spawn_blocking(move || Ok(Scan::Ro(RepoTree::from_slothfs(&ro)?)));
    }

    let mut old_infos = None;
    let mut rw_tree = None;
    let mut ro_tree = None;
    let mut first_err = None;
    while let Some(joined) = set.join_next().await {
        match joined.map_err(Error::from)? {
            Ok(Scan::Old(i)) => old_infos = Some(i),
            Ok(Scan::Rw(t)) => rw_tree = Some(t),
            Ok(Scan::Ro(t)) => ro_tree = Some(t),
            Err(e) if first_err.is_none() => first_err = Some(e),
            Err(_) => {}
        }
    }
    if let Some(e) = first_err {
        return Err(e);
    }
    let (old_infos, rw_tree, ro_tree) = (
        old_infos.expect("old scan reported"),
        rw_tree.expect("rw scan reported"),
        ro_tree.expect("ro scan reported"),
    );

    create_links(&ro_tree, &rw_tree, &ro, &rw)?;

    let new_infos = ro_tree.all_files();
    let (added, changed) = changed_files(&old_infos, &new_infos);

    let absolute = |names: Vec<String>| -> Vec<String> {
        names
            .into_iter()
            .map(|n| ro.join(n).to_string_lossy().to_string())
            .collect()
    };
    Ok((absolute(added), absolute(changed)))
}

enum Scan {
    Old(BTreeMap<String, FileInfo>),
    Rw(RepoTree),
    Ro(RepoTree),
}

/// Removes all symlinks under `dir` that point into the mount. Directories
/// that the removal emptied are removed too, deepest first. Returns the
/// workspace names that were linked before.
fn clear_links(mount: &Path, dir: &Path) -> Result<HashSet<String>, Error> {
    let mut prev_names = HashSet::new();
    let mut dirs = Vec::new();
    let mut touched_dirs: HashSet<PathBuf> = HashSet::new();

    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(|e| Error::Storage(format!("walk {}: {}", dir.display(), e)))?;
        if entry.path_is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            if target.starts_with(mount) {
                if let Some(name) = workspace_name(&target, mount) {
                    prev_names.insert(name);
                }
                std::fs::remove_file(entry.path())?;
                if let Some(parent) = entry.path().parent() {
                    touched_dirs.insert(parent.to_path_buf());
                }
            }
        } else if entry.file_type().is_dir() && entry.path() != dir {
            dirs.push(entry.path().to_path_buf());
        }
    }

    // Deepest subdirectories first. Only directories the link removal
    // touched are candidates; anything a concurrent writer put elsewhere is
    // left alone, and remove_dir refuses non-empty directories anyway.
    dirs.sort();
    for d in dirs.iter().rev() {
        if touched_dirs.contains(d) && std::fs::remove_dir(d).is_ok() {
            if let Some(parent) = d.parent() {
                touched_dirs.insert(parent.to_path_buf());
            }
        }
    }

    Ok(prev_names)
}

// The first path component of `target` below the mount root: the workspace
// name it points into.
fn workspace_name(target: &Path, mount: &Path) -> Option<String> {
    let rel = target.strip_prefix(mount).ok()?;
    rel.components().next().map(|c| {
        c.as_os_str().to_string_lossy().to_string()
    })
}

/// Creates symlinks for all the files in `child`, which sits at `name`
/// below the roots.
fn symlink_repo(name: &str, child: &RepoTree, ro_root: &Path, rw_root: &Path) -> Result<(), Error> {
    if rw_root.join(name).is_dir() {
        return Ok(());
    }

    for entry in child.entries.keys() {
        let dest = rw_root.join(name).join(entry);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::os::unix::fs::symlink(ro_root.join(name).join(entry), &dest)?;
    }
    Ok(())
}

/// Short-cuts symlinks for whole trees: a repository in `ro` with no
/// checkout at or below its path becomes one symlink to its project root.
/// Where a checkout shadows a subtree, recurse.
fn create_tree_links(
    ro: &RepoTree,
    rw: &RepoTree,
    ro_root: &Path,
    rw_root: &Path,
) -> Result<(), Error> {
    let all_rw: Vec<String> = rw
        .child_paths()
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect();

    'outer: for (name, child) in &ro.children {
        let mut found_checkout = false;
        for k in &all_rw {
            if k == name {
                // a checkout exactly here: recurse into both trees
                let rw_child = rw
                    .at_path(name)
                    .ok_or_else(|| Error::Storage(format!("no rw tree at {}", name)))?;
                create_tree_links(child, rw_child, &ro_root.join(name), &rw_root.join(name))?;
                continue 'outer;
            }
            if k.starts_with(&format!("{}/", name)) {
                found_checkout = true;
                break;
            }
        }

        if !found_checkout {
            let dest = rw_root.join(name);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::os::unix::fs::symlink(ro_root.join(name), &dest)?;
        }
    }
    Ok(())
}

/// Populates the RW tree with symlinks to the RO tree.
fn create_links(ro: &RepoTree, rw: &RepoTree, ro_root: &Path, rw_root: &Path) -> Result<(), Error> {
    create_tree_links(ro, rw, ro_root, rw_root)?;

    let rw_children: HashSet<String> = rw.child_paths().into_iter().collect();
    for path in ro.child_paths() {
        if path.is_empty() || rw_children.contains(&path) {
            continue;
        }
        let child = ro.at_path(&path).expect("path came from the tree");
        symlink_repo(&path, child, ro_root, rw_root)?;
    }

    for copied in &ro.copied {
        match std::os::unix::fs::symlink(ro_root.join(copied), rw_root.join(copied)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

/// Diffs two `(path -> object id)` maps. A path is added if it is absent in
/// `old`, changed if present in both with differing (or unknown) ids. Paths
/// absent in `new` are irrelevant.
fn changed_files(
    old: &BTreeMap<String, FileInfo>,
    new: &BTreeMap<String, FileInfo>,
) -> (Vec<String>, Vec<String>) {
    let mut added = Vec::new();
    let mut changed = Vec::new();

    for (path, info) in new {
        match old.get(path) {
            None => added.push(path.clone()),
            Some(old_info) => match (&old_info.id, &info.id) {
                (Some(a), Some(b)) if a == b => {}
                _ => changed.push(path.clone()),
            },
        }
    }

    added.sort();
    changed.sort();
    debug!(added = added.len(), changed = changed.len(), "diffed snapshots");
    (added, changed)
}

/// Guesses where slothfs is mounted by scanning the OS mount table for the
/// `fuse.slothfs` filesystem type.
pub fn find_slothfs_mount() -> Option<PathBuf> {
    let content = std::fs::read_to_string("/proc/mounts").ok()?;
    for line in content.lines() {
        let fields: Vec<&str> = line.split(' ').collect();
        if fields.len() >= 3 && fields[2] == "fuse.slothfs" {
            return Some(PathBuf::from(fields[1]));
        }
    }
    None
}
