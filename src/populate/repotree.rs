use std::collections::BTreeMap;
use std::path::Path;

use crate::gitiles::Tree;
use crate::manifest;
use crate::{Error, GitSha1};

use super::META_DIR;

/// Data about one file contained in a repository.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FileInfo {
    /// The object id of the file. None if obtaining it was too expensive
    /// (plain filesystem walks don't hash).
    pub id: Option<GitSha1>,
}

/// A nested set of git repositories: what the populate engine diffs and
/// links.
#[derive(Debug, Default)]
pub struct RepoTree {
    /// repositories below this one, keyed by relative path
    pub children: BTreeMap<String, RepoTree>,

    /// files in this repository, keyed by relative path
    pub entries: BTreeMap<String, FileInfo>,

    /// workspace-relative paths instantiated by copyfile/linkfile
    pub copied: Vec<String>,
}

impl RepoTree {
    /// Builds the repository skeleton from a manifest: one (empty) node per
    /// project, nested by mount path, plus the overlay paths.
    pub fn from_manifest(xml_path: &Path) -> Result<RepoTree, Error> {
        let mf = manifest::parse_file(xml_path)?;

        let mut by_depth: Vec<&manifest::Project> = mf.projects.iter().collect();
        by_depth.sort_by_key(|p| p.get_path().split('/').count());

        let mut root = RepoTree::default();
        for p in &by_depth {
            root.attach(p.get_path(), RepoTree::default());
        }

        for p in &mf.projects {
            for c in &p.copyfile {
                root.copied.push(c.dest.clone());
            }
            for l in &p.linkfile {
                root.copied.push(l.dest.clone());
            }
        }
        root.copied.sort();
        Ok(root)
    }

    // Hangs `child` below the deepest repository whose path prefixes
    // `path`; the remainder of the path becomes its key.
    fn attach(&mut self, path: &str, child: RepoTree) {
        let owner = self
            .children
            .keys()
            .find(|k| path.starts_with(&format!("{}/", k)))
            .cloned();
        match owner {
            Some(k) => {
                let rest = path[k.len() + 1..].to_string();
                self.children
                    .get_mut(&k)
                    .expect("key came from the map")
                    .attach(&rest, child);
            }
            None => {
                self.children.insert(path.to_string(), child);
            }
        }
    }

    /// Reads `.slothfs/tree.json` to fill the entries of this node only.
    fn fill_from_slothfs(&mut self, dir: &Path) -> Result<(), Error> {
        let content = std::fs::read(dir.join(META_DIR).join("tree.json"))?;
        let tree: Tree = serde_json::from_slice(&content)?;

        for e in &tree.entries {
            self.entries.insert(
                e.name.clone(),
                FileInfo {
                    id: Some(GitSha1::from_hex(&e.id)?),
                },
            );
        }
        Ok(())
    }

    /// Constructs a fully populated tree from a mounted workspace, using its
    /// embedded manifest and per-project tree metadata.
    pub fn from_slothfs(dir: &Path) -> Result<RepoTree, Error> {
        let mut root = Self::from_manifest(&dir.join(META_DIR).join("manifest.xml"))?;

        for path in root.child_paths() {
            let node = root.at_path_mut(&path).expect("path came from the tree");
            node.fill_from_slothfs(&dir.join(&path))?;
        }
        Ok(root)
    }

    /// Constructs a tree by walking the filesystem. A directory is a
    /// repository boundary if it contains `.git/` or `.slothfs/`; the
    /// top-level `out/` build directory is ignored.
    pub fn from_fs(dir: &Path) -> Result<RepoTree, Error> {
        let mut root = RepoTree::default();
        root.fill(dir, "")?;
        Ok(root)
    }

    fn fill(&mut self, repo_root: &Path, dir: &str) -> Result<(), Error> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(repo_root.join(dir))? {
            let entry = entry?;
            let name = match entry.file_name().into_string() {
                Ok(n) => n,
                Err(_) => continue,
            };
            let is_dir = entry.file_type()?.is_dir();
            names.push((name, is_dir));
        }
        names.sort();

        for (name, is_dir) in names {
            if is_dir && (name == ".git" || name == META_DIR) {
                continue;
            }
            if is_dir && name == "out" && dir.is_empty() {
                // the build output directory
                continue;
            }

            let sub_name = join_rel(dir, &name);
            if is_dir {
                let sub_root = repo_root.join(&sub_name);
                if is_repo_dir(&sub_root) {
                    let mut child = RepoTree::default();
                    child.fill(&sub_root, "")?;
                    self.children.insert(sub_name, child);
                } else {
                    self.fill(repo_root, &sub_name)?;
                }
            } else {
                self.entries.insert(sub_name, FileInfo::default());
            }
        }
        Ok(())
    }

    /// All repositories including the receiver, keyed by relative path. The
    /// receiver is "".
    pub fn child_paths(&self) -> Vec<String> {
        let mut out = vec![String::new()];
        for (name, child) in &self.children {
            for sub in child.child_paths() {
                out.push(join_rel(name, &sub));
            }
        }
        out
    }

    pub fn at_path(&self, path: &str) -> Option<&RepoTree> {
        if path.is_empty() {
            return Some(self);
        }
        for (name, child) in &self.children {
            if path == name {
                return Some(child);
            }
            if let Some(rest) = path.strip_prefix(&format!("{}/", name)) {
                return child.at_path(rest);
            }
        }
        None
    }

    fn at_path_mut(&mut self, path: &str) -> Option<&mut RepoTree> {
        if path.is_empty() {
            return Some(self);
        }
        let key = self
            .children
            .keys()
            .find(|k| path == k.as_str() || path.starts_with(&format!("{}/", k)))
            .cloned()?;
        let child = self.children.get_mut(&key)?;
        if path == key {
            Some(child)
        } else {
            child.at_path_mut(&path[key.len() + 1..])
        }
    }

    /// All files below this tree, keyed by path relative to the receiver.
    pub fn all_files(&self) -> BTreeMap<String, FileInfo> {
        let mut out = BTreeMap::new();
        for (name, info) in &self.entries {
            out.insert(name.clone(), info.clone());
        }
        for (name, child) in &self.children {
            for (sub, info) in child.all_files() {
                out.insert(join_rel(name, &sub), info);
            }
        }
        out
    }
}

/// Whether `path` is the top directory of some git repository, in plain git
/// or in slothfs form.
pub(super) fn is_repo_dir(path: &Path) -> bool {
    path.join(".git").is_dir() || path.join(META_DIR).is_dir()
}

pub(super) fn join_rel(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else if name.is_empty() {
        dir.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}
