use std::path::PathBuf;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, instrument, warn};

use super::GitCache;

/// A bare git repository that may be cloned on demand, in the background.
///
/// At most one clone runs per URL per process: instances are interned by
/// [GitCache::lazy], and the state machine coalesces concurrent
/// [LazyRepo::clone_in_background] calls.
pub struct LazyRepo {
    url: String,
    cache: Weak<GitCache>,

    state: Mutex<State>,
    done: Notify,
}

#[derive(Clone, Debug)]
enum State {
    NotStarted,
    Cloning,
    Ready(PathBuf),
    Failed,
}

impl LazyRepo {
    pub(super) fn new(url: String, cache: Weak<GitCache>) -> Arc<Self> {
        Arc::new(LazyRepo {
            url,
            cache,
            state: Mutex::new(State::NotStarted),
            done: Notify::new(),
        })
    }

    /// The repository path, if the clone has completed. Never blocks.
    pub fn repository(&self) -> Option<PathBuf> {
        match &*self.state.lock() {
            State::Ready(p) => Some(p.clone()),
            _ => None,
        }
    }

    /// Schedules the repository to be cloned. Idempotent; a clone that is
    /// already running or finished is left alone. Requires a tokio runtime
    /// context.
    #[instrument(skip(self), fields(url = %self.url))]
    pub fn clone_in_background(self: &Arc<Self>) {
        if self.url.is_empty() {
            return;
        }
        {
            let mut state = self.state.lock();
            match *state {
                State::NotStarted => *state = State::Cloning,
                // Failed stays failed; re-cloning on every read would hammer
                // the remote.
                State::Cloning | State::Ready(_) | State::Failed => return,
            }
        }

        let this = self.clone();
        tokio::spawn(async move {
            this.run_clone().await;
        });
    }

    async fn run_clone(self: Arc<Self>) {
        let result = match self.cache.upgrade() {
            Some(cache) => cache.open(&self.url).await,
            None => return,
        };

        let mut state = self.state.lock();
        match result {
            Ok(path) => {
                debug!(url = %self.url, "clone finished");
                *state = State::Ready(path);
            }
            Err(e) => {
                warn!(url = %self.url, error = %e, "clone failed");
                *state = State::Failed;
            }
        }
        drop(state);
        self.done.notify_waiters();
    }

    /// Waits until the repository is either Ready or Failed. Test helper.
    pub async fn wait(&self) -> Option<PathBuf> {
        loop {
            let notified = self.done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match &*self.state.lock() {
                State::Ready(p) => return Some(p.clone()),
                State::Failed => return None,
                State::NotStarted | State::Cloning => {}
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::{Cache, Options};

    #[tokio::test]
    async fn empty_url_never_clones() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path(), Options::default()).unwrap();

        let lazy = cache.git.lazy("");
        lazy.clone_in_background();
        assert!(lazy.repository().is_none());
    }

    #[tokio::test]
    async fn failed_clone_is_broadcast() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path(), Options::default()).unwrap();

        // nothing serves this URL, so the clone must fail
        let lazy = cache.git.lazy("http://127.0.0.1:1/nosuchrepo");
        lazy.clone_in_background();
        lazy.clone_in_background(); // coalesced

        assert!(lazy.wait().await.is_none());
        assert!(lazy.repository().is_none());
    }
}
