//! Client for the Gitiles source viewer JSON interface.
//!
//! All outbound requests pass through a token-bucket rate limiter. JSON
//! responses carry a leading `)]}'` XSS tag which is stripped before parsing;
//! its absence is a protocol violation and such responses are never cached.
//! Blob responses arrive base64 encoded under
//! `Content-Type: text/plain; charset=UTF-8`.

mod types;

pub use types::{Commit, Person, Project, RefData, Tree, TreeEntry};

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use data_encoding::BASE64;
use futures::Stream;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};
use url::Url;

use crate::cookies;
use crate::Error;

const XSS_TAG: &[u8] = b")]}'\n";

/// The content type gitiles uses for base64-encoded blob responses.
const BLOB_CONTENT_TYPE: &str = "text/plain; charset=UTF-8";

/// Configures the Gitiles client.
#[derive(Clone, Debug)]
pub struct Options {
    /// Base URL of the Gitiles service.
    pub address: String,

    pub sustained_qps: f64,
    pub burst_qps: u32,

    /// Path to a Netscape/Mozilla style cookie jar file.
    pub cookie_jar: Option<PathBuf>,

    /// How we present ourselves to the server.
    pub user_agent: String,

    pub debug: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            address: "https://android.googlesource.com".to_string(),
            sustained_qps: 4.0,
            burst_qps: 0,
            cookie_jar: None,
            user_agent: "slothfs".to_string(),
            debug: false,
        }
    }
}

/// A client for one Gitiles server.
pub struct Client {
    addr: Url,
    http: reqwest::Client,
    limiter: DefaultDirectRateLimiter,
    debug: bool,
}

impl Client {
    pub fn new(opts: Options) -> Result<Arc<Self>, Error> {
        let addr = Url::parse(&opts.address)?;

        let mut builder = reqwest::Client::builder().user_agent(opts.user_agent.clone());
        if let Some(jar_path) = &opts.cookie_jar {
            builder = builder.cookie_provider(cookies::load_jar(jar_path)?);
        }
        let http = builder.build()?;

        let sustained = if opts.sustained_qps > 0.0 {
            opts.sustained_qps
        } else {
            4.0
        };
        let burst = match opts.burst_qps {
            0 => (10.0 * sustained) as u32,
            b if (b as f64) < sustained => sustained as u32 + 1,
            b => b,
        };
        let quota = Quota::with_period(Duration::from_secs_f64(1.0 / sustained))
            .expect("nonzero rate period")
            .allow_burst(NonZeroU32::new(burst.max(1)).expect("nonzero burst"));

        Ok(Arc::new(Client {
            addr,
            http,
            limiter: RateLimiter::direct(quota),
            debug: opts.debug,
        }))
    }

    /// The address of the gitiles service.
    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    fn url(&self, segments: &[&str], query: &str) -> Url {
        let mut u = self.addr.clone();
        let mut path = u.path().trim_end_matches('/').to_string();
        for s in segments {
            for part in s.split('/').filter(|p| !p.is_empty()) {
                path.push('/');
                path.push_str(part);
            }
        }
        u.set_path(&path);
        u.set_query(if query.is_empty() { None } else { Some(query) });
        u
    }

    async fn stream(&self, url: Url) -> Result<reqwest::Response, Error> {
        self.limiter.until_ready().await;

        let resp = self.http.get(url.clone()).send().await?;
        if resp.status() != reqwest::StatusCode::OK {
            return Err(Error::Transient(format!("{}: {}", url, resp.status())));
        }

        if self.debug {
            debug!(url = %url, status = %resp.status(), "GET");
        }

        // Redirects are accepted, but only for authentication. A 200 from a
        // different page than requested is probably a login page.
        if resp.url() != &url {
            return Err(Error::Auth {
                got: resp.url().to_string(),
                want: url.to_string(),
            });
        }

        Ok(resp)
    }

    async fn get(&self, url: Url) -> Result<Vec<u8>, Error> {
        let resp = self.stream(url).await?;

        let is_blob = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v == BLOB_CONTENT_TYPE)
            .unwrap_or(false);

        let body = resp.bytes().await?;
        if is_blob {
            let cleaned: Vec<u8> = body
                .iter()
                .copied()
                .filter(|b| !b.is_ascii_whitespace())
                .collect();
            return BASE64
                .decode(&cleaned)
                .map_err(|e| Error::Protocol(format!("base64 blob: {}", e)));
        }
        Ok(body.to_vec())
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, Error> {
        let content = self.get(url.clone()).await?;

        let stripped = content.strip_prefix(XSS_TAG).ok_or_else(|| {
            Error::Protocol(format!("gitiles JSON {} is missing the XSS tag", url))
        })?;

        serde_json::from_slice(stripped)
            .map_err(|e| Error::Protocol(format!("unmarshal({}): {}", url, e)))
    }

    /// Retrieves the list of projects, with branch heads resolved for the
    /// given branch names.
    #[instrument(skip(self), err)]
    pub async fn list(&self, branches: &[String]) -> Result<HashMap<String, Project>, Error> {
        let mut query = "format=JSON".to_string();
        for b in branches {
            query.push_str("&b=");
            query.push_str(b);
        }
        let url = self.url(&[], &query);

        let projects: HashMap<String, Project> = self.get_json(url).await?;
        for (key, p) in &projects {
            if key != &p.name {
                return Err(Error::Protocol(format!(
                    "list key {:?} had project name {:?}",
                    key, p.name
                )));
            }
        }
        Ok(projects)
    }

    /// Creates a client scoped to one repository on this server.
    pub fn repo(self: &Arc<Self>, name: &str) -> RepoClient {
        RepoClient {
            name: name.to_string(),
            client: self.clone(),
        }
    }
}

/// A JSON client for the functionality of a specific repository.
#[derive(Clone)]
pub struct RepoClient {
    name: String,
    client: Arc<Client>,
}

/// Archive formats accepted by `get_archive`.
pub const ARCHIVE_TGZ: &str = "tar.gz";
pub const ARCHIVE_TBZ: &str = "tar.bz2";
pub const ARCHIVE_TAR: &str = "tar";

impl RepoClient {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Retrieves this repository's metadata.
    pub async fn get(&self) -> Result<Project, Error> {
        let url = self.client.url(&[&self.name], "format=JSON");
        self.client.get_json(url).await
    }

    /// Fetches a blob at `(revision, path)`; the result is decoded.
    #[instrument(skip(self), fields(repo = %self.name), err)]
    pub async fn get_blob(&self, revision: &str, path: &str) -> Result<Vec<u8>, Error> {
        let url = self
            .client
            .url(&[&self.name, "+show", revision, path], "format=TEXT");
        self.client.get(url).await
    }

    /// Fetches a tree. `dir` may not point to a blob. With `recursive`, the
    /// server expands the whole tree into a flat listing.
    #[instrument(skip(self), fields(repo = %self.name), err)]
    pub async fn get_tree(&self, revision: &str, dir: &str, recursive: bool) -> Result<Tree, Error> {
        let mut query = "format=JSON&long=1".to_string();
        if recursive {
            query.push_str("&recursive=1");
        }
        let mut url = self.client.url(&[&self.name, "+", revision, dir], &query);
        // Tree URLs are directories; gitiles wants the trailing slash.
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        self.client.get_json(url).await
    }

    /// Gets the commit a revision resolves to.
    #[instrument(skip(self), fields(repo = %self.name), err)]
    pub async fn get_commit(&self, revision: &str) -> Result<Commit, Error> {
        let url = self.client.url(&[&self.name, "+", revision], "format=JSON");
        self.client.get_json(url).await
    }

    /// Streams an archive of the repository at `revision`, optionally
    /// restricted to `dir_prefix`. `format` is one of the `ARCHIVE_*`
    /// constants.
    pub async fn get_archive(
        &self,
        revision: &str,
        dir_prefix: &str,
        format: &str,
    ) -> Result<impl Stream<Item = reqwest::Result<Bytes>>, Error> {
        let mut path = format!("{}/+archive/{}", self.name, revision);
        if !dir_prefix.is_empty() {
            path.push('/');
            path.push_str(dir_prefix.trim_matches('/'));
        }
        path.push('.');
        path.push_str(format);

        let url = self.client.url(&[&path], "");
        let resp = self.client.stream(url).await?;
        Ok(resp.bytes_stream())
    }

    /// Describes a commit as a ref visible to the caller. Only the
    /// `contains` flavor is implemented server side, so `options` must
    /// include it.
    pub async fn describe(&self, revision: &str, options: &[&str]) -> Result<String, Error> {
        let query = format!("format=JSON&{}", options.join("&"));
        let url = self.client.url(&[&self.name, "+describe", revision], &query);

        let result: HashMap<String, String> = self.client.get_json(url).await?;
        if result.len() != 1 {
            return Err(Error::Protocol(format!(
                "describe: got map {:?}, want one entry",
                result
            )));
        }
        Ok(result.into_values().next().expect("one entry"))
    }

    /// Returns the refs of the repository, optionally filtered by prefix.
    pub async fn refs(&self, prefix: &str) -> Result<HashMap<String, RefData>, Error> {
        let mut segments = vec![self.name.as_str(), "+refs"];
        if !prefix.is_empty() {
            segments.push(prefix);
        }
        let url = self.client.url(&segments, "format=JSON");
        self.client.get_json(url).await
    }
}
