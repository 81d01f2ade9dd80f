//! The lazy, deduplicated blob fetch engine behind one repository at one
//! revision.

use std::collections::HashMap;
use std::fs::File;
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tracing::{instrument, warn};

use crate::cache::{self, Cas, LazyRepo};
use crate::gitiles::RepoClient;
use crate::{Error, GitSha1};

type InflightFuture = Shared<BoxFuture<'static, Result<(), Error>>>;

/// Fetches blobs for one repository, with single-flight coalescing.
///
/// A blob is looked for in the CAS first. On a miss, exactly one expensive
/// fetch per hash runs at any time; concurrent readers of the same hash share
/// the in-flight future and are all woken by its completion. The expensive
/// path tries a local bare repository (triggering a background clone when the
/// caller's clone hint asks for one), then the Gitiles REST service, and
/// writes whatever it obtained through to the CAS.
pub struct BlobFetcher {
    cas: Arc<Cas>,
    repo: RepoClient,
    revision: String,
    lazy_repo: Option<Arc<LazyRepo>>,

    // blob id => path within the repository, for the REST fallback
    sha_map: RwLock<HashMap<GitSha1, String>>,

    in_flight: Mutex<HashMap<GitSha1, InflightFuture>>,
}

impl BlobFetcher {
    pub fn new(
        cas: Arc<Cas>,
        repo: RepoClient,
        revision: String,
        lazy_repo: Option<Arc<LazyRepo>>,
    ) -> Arc<Self> {
        Arc::new(BlobFetcher {
            cas,
            repo,
            revision,
            lazy_repo,
            sha_map: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    /// Records where a blob lives inside the repository.
    pub fn record_path(&self, id: GitSha1, path: String) {
        self.sha_map.write().insert(id, path);
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    /// Opens the blob for reading, fetching it first if necessary.
    pub async fn open_blob(self: &Arc<Self>, id: &GitSha1, clone_hint: bool) -> Result<File, Error> {
        if let Some(f) = self.cas.open(id).map_err(Error::from)? {
            return Ok(f);
        }

        loop {
            // Either join an in-flight fetch, or become the driver of a new
            // one. The lock is only held to inspect and update the map; the
            // fetch itself runs with no locks held.
            let (fut, driver) = {
                let mut in_flight = self.in_flight.lock();
                match in_flight.get(id) {
                    Some(fut) => (fut.clone(), false),
                    None => {
                        // Lost wakeups are impossible, but the blob may have
                        // landed since the fast path; don't fetch it twice.
                        if let Some(f) = self.cas.open(id).map_err(Error::from)? {
                            return Ok(f);
                        }
                        let fut = {
                            let this = self.clone();
                            let id = id.clone();
                            async move { this.fetch_expensive(&id, clone_hint).await }
                        }
                        .boxed()
                        .shared();
                        in_flight.insert(id.clone(), fut.clone());
                        (fut, true)
                    }
                }
            };

            let result = fut.await;
            if driver {
                self.in_flight.lock().remove(id);
            }

            match result {
                Ok(()) => match self.cas.open(id).map_err(Error::from)? {
                    Some(f) => return Ok(f),
                    None if driver => {
                        return Err(Error::Storage(format!(
                            "fetch of {} succeeded, but blob is not in the store",
                            id
                        )))
                    }
                    // A waiter that saw success but no blob re-runs the loop
                    // and may start its own fetch.
                    None => continue,
                },
                Err(e) => return Err(e),
            }
        }
    }

    #[instrument(skip(self), fields(blob.id = %id, repo = %self.repo.name()), err)]
    async fn fetch_expensive(&self, id: &GitSha1, clone_hint: bool) -> Result<(), Error> {
        let mut content: Option<Vec<u8>> = None;

        if let Some(lazy) = &self.lazy_repo {
            match lazy.repository() {
                Some(repo_path) => {
                    let id = id.clone();
                    content = tokio::task::spawn_blocking(move || {
                        cache::read_blob(&repo_path, &id)
                    })
                    .await
                    .map_err(Error::from)?
                    .unwrap_or_else(|e| {
                        warn!(error = %e, "reading blob from local repo failed");
                        None
                    });
                }
                None => {
                    if clone_hint {
                        lazy.clone_in_background();
                    }
                }
            }
        }

        let content = match content {
            Some(c) => c,
            None => {
                let path = self.sha_map.read().get(id).cloned().ok_or_else(|| {
                    Error::NotFound(format!("no path known for blob {}", id))
                })?;
                self.repo.get_blob(&self.revision, &path).await?
            }
        };

        self.cas.write(id, &content).map_err(Error::from)?;
        Ok(())
    }
}
