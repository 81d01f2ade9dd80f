//! The multi-workspace root: hosts concurrent workspaces, created and
//! destroyed through symlink operations on the `config/` directory.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{info, instrument, warn};

use crate::cache::Cache;
use crate::gitiles::Client;
use crate::manifest;
use crate::Error;

use super::config::CloneRule;
use super::inode_tracker::{InodeTracker, ROOT_ID};
use super::manifestfs;

/// Options for the multi-workspace filesystem.
#[derive(Default)]
pub struct MultiFsOptions {
    /// If set, manifests of successfully mounted workspaces are persisted
    /// here, and mounted again on the next start.
    pub manifest_dir: Option<PathBuf>,

    pub repo_clone_rules: Vec<CloneRule>,
    pub file_clone_rules: Vec<CloneRule>,
}

/// The filesystem served at the mount point.
///
/// The inode table is shared by all workspaces, which is what makes
/// identical blobs in different workspaces one inode. The FUSE operations on
/// this type live in the sibling `ops` module.
pub struct SlothFs {
    pub(super) cache: Arc<Cache>,
    pub(super) gitiles: Arc<Client>,
    pub(super) options: MultiFsOptions,

    pub(super) inodes: RwLock<InodeTracker>,
    pub(super) config_ino: u64,

    pub(super) file_handles: RwLock<HashMap<u64, Arc<File>>>,
    pub(super) next_file_handle: AtomicU64,

    /// Set when the kernel advertises read-without-open; see `ops::init`.
    pub(super) handle_less: AtomicBool,

    pub(super) tokio_handle: tokio::runtime::Handle,
}

impl SlothFs {
    /// Creates the filesystem. Must be called within a tokio runtime.
    pub fn new(cache: Arc<Cache>, gitiles: Arc<Client>, options: MultiFsOptions) -> Self {
        let mut tracker = InodeTracker::default();
        let config_ino = tracker.put_dir();
        tracker.add_child(ROOT_ID, "config", config_ino);

        SlothFs {
            cache,
            gitiles,
            options,
            inodes: RwLock::new(tracker),
            config_ino,
            file_handles: RwLock::new(HashMap::new()),
            next_file_handle: AtomicU64::new(1),
            handle_less: AtomicBool::new(false),
            tokio_handle: tokio::runtime::Handle::current(),
        }
    }

    /// Mounts one workspace per manifest found in the configured manifest
    /// directory. Call before serving.
    pub async fn configure_workspaces(&self) -> Result<(), Error> {
        let Some(dir) = self.options.manifest_dir.clone() else {
            return Ok(());
        };
        std::fs::create_dir_all(&dir).map_err(Error::from)?;

        let mut found = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(Error::from)? {
            let entry = entry.map_err(Error::from)?;
            if entry.file_type().map_err(Error::from)?.is_file() {
                found.push(entry.path());
            }
        }
        if found.is_empty() {
            return Ok(());
        }

        info!(count = found.len(), "configuring workspaces");
        for path in found {
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };
            // A broken saved manifest only logs; the remaining workspaces
            // still come up. Tree fetches inside each create are already
            // fan-out parallel.
            if let Err(e) = self.create_workspace_from_file(&name, &path).await {
                warn!(workspace = %name, error = %e, "configuring workspace failed");
            }
        }

        Ok(())
    }

    /// Reads `target` and mounts it as workspace `name`. This is the
    /// symlink-as-command entry point; parse failures reject the call and
    /// attach nothing.
    pub(super) async fn create_workspace_from_file(
        &self,
        name: &str,
        target: &Path,
    ) -> Result<(), Error> {
        let bytes = std::fs::read(target).map_err(Error::from)?;
        let mf = manifest::parse(&bytes)?;
        self.create_workspace(name, &mf).await
    }

    /// Builds and attaches workspace `name` from a parsed manifest.
    ///
    /// Tree fetching happens before anything is attached; a fetch failure
    /// leaves no trace. Later composition failures attach the workspace as a
    /// directory holding a single `ERROR` file.
    #[instrument(skip(self, mf), fields(workspace = %name), err)]
    pub(super) async fn create_workspace(&self, name: &str, mf: &manifest::Manifest) -> Result<(), Error> {
        if name.is_empty() || name == "config" || name.contains('/') {
            return Err(Error::Parse(format!("invalid workspace name {:?}", name)));
        }
        if self.inodes.read().child(ROOT_ID, name).is_some() {
            return Err(Error::Storage(format!("workspace {} exists", name)));
        }

        manifestfs::check_revisions(mf).map_err(|e| Error::Storage(e.to_string()))?;
        let xml = mf.marshal_xml()?;

        let trees = manifestfs::fetch_tree_map(&self.cache, &self.gitiles, mf).await?;

        let built = {
            let mut tracker = self.inodes.write();
            if tracker.child(ROOT_ID, name).is_some() {
                return Err(Error::Storage(format!("workspace {} exists", name)));
            }

            let ws_root = tracker.put_dir();
            tracker.add_child(ROOT_ID, name, ws_root);

            let built = match manifestfs::build(
                &mut tracker,
                ws_root,
                mf,
                &xml,
                &trees,
                &self.cache,
                &self.gitiles,
                &self.options,
            ) {
                Ok(()) => true,
                Err(e) => {
                    warn!(workspace = %name, error = %e, "workspace composition failed");
                    manifestfs::attach_error(&mut tracker, ws_root, &e);
                    false
                }
            };

            let link_target = format!("../{}/.slothfs/manifest.xml", name);
            let link = tracker.put_symlink(Bytes::from(link_target.into_bytes()));
            tracker.add_child(self.config_ino, name, link);
            built
        };

        // only successfully mounted workspaces are worth restoring
        if built {
            self.persist_manifest(name, &xml);
        }
        Ok(())
    }

    /// Detaches workspace `name` and forgets its persisted manifest.
    pub(super) fn destroy_workspace(&self, name: &str) -> Result<(), Error> {
        let mut tracker = self.inodes.write();
        let Some(ws_root) = tracker.remove_child(ROOT_ID, name) else {
            return Err(Error::NotFound(format!("workspace {}", name)));
        };
        tracker.remove_subtree(ws_root);

        if let Some(link) = tracker.remove_child(self.config_ino, name) {
            tracker.remove_subtree(link);
        }
        drop(tracker);

        if let Some(dir) = &self.options.manifest_dir {
            // Ignore errors: the workspace may never have been persisted.
            let _ = std::fs::remove_file(dir.join(name));
        }
        Ok(())
    }

    // Saves the manifest bytes under the workspace name, via tempfile and
    // rename.
    fn persist_manifest(&self, name: &str, xml: &[u8]) {
        let Some(dir) = &self.options.manifest_dir else {
            return;
        };
        let write = || -> std::io::Result<()> {
            std::fs::create_dir_all(dir)?;
            let tmp = tempfile::NamedTempFile::new_in(dir)?;
            std::fs::write(tmp.path(), xml)?;
            tmp.persist(dir.join(name)).map_err(|e| e.error)?;
            Ok(())
        };
        if let Err(e) = write() {
            warn!(workspace = %name, error = %e, "persisting manifest failed");
        }
    }
}
