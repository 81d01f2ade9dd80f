use std::collections::HashMap;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::process::Command;
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

use crate::gitiles::{Tree, TreeEntry};
use crate::{Error, GitSha1};

use super::lazyrepo::LazyRepo;
use super::{mkdir_private, Options};

/// Manages a set of bare git repositories, keyed by clone URL.
///
/// The port number and a trailing `.git` are not part of the cache key: two
/// URLs differing only in those resolve to the same on-disk repository at
/// `<dir>/<host>/<path>.git`. Clones and fetches shell out to the `git`
/// binary; each invocation logs into `<dir>/slothfs-logs/`.
pub struct GitCache {
    dir: PathBuf,
    log_dir: PathBuf,

    // per-URL clone coordinators, interned by normalized repository path
    lazy: Mutex<HashMap<PathBuf, Arc<LazyRepo>>>,

    fetch_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl GitCache {
    pub(super) fn new(dir: PathBuf, opts: &Options) -> std::io::Result<Arc<Self>> {
        let log_dir = dir.join("slothfs-logs");
        mkdir_private(&log_dir)?;
        mkdir_private(&dir)?;

        let cache = Arc::new(GitCache {
            dir,
            log_dir,
            lazy: Mutex::new(HashMap::new()),
            fetch_task: Mutex::new(None),
        });

        if let Some(freq) = opts.fetch_frequency {
            let weak = Arc::downgrade(&cache);
            let handle = tokio::spawn(recurring_fetch(weak, freq));
            *cache.fetch_task.lock() = Some(handle);
        }

        Ok(cache)
    }

    /// Transforms a clone URL into a repository path under the cache
    /// directory.
    pub fn git_path(&self, url: &str) -> Result<PathBuf, Error> {
        let parsed = url::Url::parse(url)?;
        let host = parsed
            .host_str()
            .ok_or_else(|| Error::Parse(format!("no host in {}", url)))?;

        let mut path = parsed.path().trim_matches('/').to_string();
        if let Some(stripped) = path.strip_suffix(".git") {
            path = stripped.trim_end_matches('/').to_string();
        }

        Ok(self.dir.join(host).join(path + ".git"))
    }

    /// Returns the repository for `url` if it is already present locally.
    /// Never touches the network.
    pub fn open_local(&self, url: &str) -> Option<PathBuf> {
        let p = self.git_path(url).ok()?;
        git2::Repository::open_bare(&p).ok()?;
        Some(p)
    }

    /// Returns the repository for `url`, cloning it first if necessary. May
    /// be slow. Concurrent processes may race to create the same repository;
    /// a lock on the parent directory serializes clones within reach of the
    /// same filesystem.
    #[instrument(skip(self), err)]
    pub async fn open(&self, url: &str) -> Result<PathBuf, Error> {
        let p = self.git_path(url)?;

        if std::fs::symlink_metadata(&p).is_err() {
            let parent = p.parent().expect("git path has a parent").to_path_buf();
            let base = p
                .file_name()
                .expect("git path has a basename")
                .to_string_lossy()
                .to_string();
            std::fs::DirBuilder::new()
                .recursive(true)
                .create(&parent)
                .map_err(Error::from)?;

            let lock = {
                let parent = parent.clone();
                tokio::task::spawn_blocking(move || DirLock::acquire(&parent)).await??
            };

            // Re-check: another holder of the lock may have done the clone.
            if std::fs::symlink_metadata(&p).is_err() {
                self.run_git(
                    &parent,
                    &["clone", "--bare", "--progress", "--verbose", url, base.as_str()],
                )
                .await?;
            }
            drop(lock);
        }

        git2::Repository::open_bare(&p)?;
        Ok(p)
    }

    /// Returns the per-URL clone coordinator, creating it on first use. At
    /// most one background clone per URL runs in this process.
    pub fn lazy(self: &Arc<Self>, url: &str) -> Arc<LazyRepo> {
        let key = self.git_path(url).unwrap_or_else(|_| PathBuf::from(url));
        let mut lazy = self.lazy.lock();
        lazy.entry(key)
            .or_insert_with(|| LazyRepo::new(url.to_string(), Arc::downgrade(self)))
            .clone()
    }

    /// Updates the local clone of the repository at `dir`.
    pub async fn fetch(&self, dir: &Path) -> Result<(), Error> {
        let git_dir = format!("--git-dir={}", dir.display());
        self.run_git(&self.dir, &[git_dir.as_str(), "fetch", "origin"])
            .await
    }

    /// Finds all known bare repositories and runs git fetch on them.
    #[instrument(skip(self), err)]
    pub async fn fetch_all(&self) -> Result<(), Error> {
        let mut dirs = Vec::new();
        let mut it = WalkDir::new(&self.dir).follow_links(true).into_iter();
        while let Some(entry) = it.next() {
            let entry = entry.map_err(|e| Error::Storage(e.to_string()))?;
            if entry.file_type().is_dir()
                && entry.path().extension() == Some(std::ffi::OsStr::new("git"))
            {
                dirs.push(entry.path().to_path_buf());
                it.skip_current_dir();
            }
        }

        for d in dirs {
            self.fetch(&d)
                .await
                .map_err(|e| Error::Storage(format!("fetch {}: {}", d.display(), e)))?;
        }
        Ok(())
    }

    // A logfile open for writing with a unique name.
    fn logfile(&self) -> std::io::Result<std::fs::File> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let name = format!("git.{}.{:09}.log", now.as_secs(), now.subsec_nanos());
        std::fs::File::create(self.log_dir.join(name))
    }

    /// Runs git with the given arguments under the given directory, recording
    /// the invocation in the log directory.
    async fn run_git(&self, dir: &Path, args: &[&str]) -> Result<(), Error> {
        let mut logfile = self.logfile().map_err(Error::from)?;

        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::Storage(format!("running git: {}", e)))?;

        use std::io::Write;
        write!(
            logfile,
            "args: git {:?}\ndir: {}\nEXIT: {:?}\n\nOUT\n{}\n\nERR\n{}\n",
            args,
            dir.display(),
            output.status,
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr),
        )
        .map_err(Error::from)?;

        if !output.status.success() {
            warn!(?args, status = ?output.status, "git invocation failed");
            return Err(Error::Storage(format!(
                "git {:?} exited with {:?}",
                args, output.status
            )));
        }
        Ok(())
    }
}

impl Drop for GitCache {
    fn drop(&mut self) {
        if let Some(handle) = self.fetch_task.lock().take() {
            handle.abort();
        }
    }
}

async fn recurring_fetch(cache: Weak<GitCache>, freq: std::time::Duration) {
    let mut ticker = tokio::time::interval(freq);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(cache) = cache.upgrade() else {
            return;
        };
        if let Err(e) = cache.fetch_all().await {
            warn!(error = %e, "periodic fetch failed");
        }
    }
}

/// An exclusive flock on a directory, held for the duration of a clone.
struct DirLock {
    _file: std::fs::File,
}

impl DirLock {
    fn acquire(dir: &Path) -> std::io::Result<DirLock> {
        let file = std::fs::File::open(dir)?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(DirLock { _file: file })
    }
}

/// Reads a blob out of an on-disk bare repository. Returns None if the
/// repository does not have the object.
pub fn read_blob(repo_path: &Path, id: &GitSha1) -> Result<Option<Vec<u8>>, git2::Error> {
    let repo = git2::Repository::open_bare(repo_path)?;
    let oid = git2::Oid::from_bytes(id.as_slice())?;
    let result = match repo.find_blob(oid) {
        Ok(blob) => Ok(Some(blob.content().to_vec())),
        Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
        Err(e) => Err(e),
    };
    result
}

/// Loads a recursively expanded [Tree] from an on-disk bare repository. `id`
/// may name a commit or a tree.
pub fn read_tree(repo_path: &Path, id: &GitSha1) -> Result<Tree, Error> {
    let repo = git2::Repository::open_bare(repo_path)?;
    let oid = git2::Oid::from_bytes(id.as_slice())?;
    let obj = repo.find_object(oid, None)?;
    let git_tree = obj.peel_to_tree()?;

    let mut tree = Tree {
        id: id.hex(),
        entries: Vec::new(),
    };

    let mut walk_err: Option<Error> = None;
    git_tree.walk(git2::TreeWalkMode::PreOrder, |root, entry| {
        match tree_entry(&repo, root, entry) {
            Ok(Some(e)) => tree.entries.push(e),
            Ok(None) => {}
            Err(e) => {
                walk_err = Some(e);
                return git2::TreeWalkResult::Abort;
            }
        }
        git2::TreeWalkResult::Ok
    })?;
    if let Some(e) = walk_err {
        return Err(e);
    }

    debug!(tree.id = %tree.id, entries = tree.entries.len(), "expanded tree from local repo");
    Ok(tree)
}

fn tree_entry(
    repo: &git2::Repository,
    root: &str,
    entry: &git2::TreeEntry<'_>,
) -> Result<Option<TreeEntry>, Error> {
    let name = format!(
        "{}{}",
        root,
        entry
            .name()
            .ok_or_else(|| Error::Storage("non-utf8 tree entry name".to_string()))?
    );
    let mode = entry.filemode() as u32;

    match entry.kind() {
        Some(git2::ObjectType::Tree) => Ok(None),
        Some(git2::ObjectType::Commit) => Ok(Some(TreeEntry {
            mode,
            entry_type: "commit".to_string(),
            id: entry.id().to_string(),
            name,
            size: None,
            target: None,
        })),
        Some(git2::ObjectType::Blob) => {
            let blob = repo.find_blob(entry.id())?;
            let target = if mode == 0o120000 {
                Some(
                    String::from_utf8(blob.content().to_vec())
                        .map_err(|_| Error::Storage(format!("non-utf8 symlink target: {}", name)))?,
                )
            } else {
                None
            };
            Ok(Some(TreeEntry {
                mode,
                entry_type: "blob".to_string(),
                id: entry.id().to_string(),
                name,
                size: Some(blob.size() as u64),
                target,
            }))
        }
        other => Err(Error::Storage(format!(
            "illegal object type {:?} for {}",
            other, name
        ))),
    }
}
