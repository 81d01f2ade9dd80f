//! The FUSE filesystem: a multi-workspace root whose workspaces are composed
//! manifest checkouts, each project a read-only tree at a pinned revision
//! with lazily fetched blob contents.

mod config;
mod fetcher;
pub mod fuse;
mod inode_tracker;
mod manifestfs;
mod multifs;
mod nodes;
mod ops;
mod repofs;

pub use config::{read_config, CloneRule};
pub use multifs::{MultiFsOptions, SlothFs};

#[cfg(test)]
pub(crate) use fetcher::BlobFetcher;
#[cfg(test)]
pub(crate) use nodes::FileNode;

use std::time::Duration;

/// Attribute and entry timeout advertised for content below a workspace. The
/// revision is pinned, so directory contents never change.
pub(crate) const CONTENT_TTL: Duration = Duration::from_secs(3600);

/// Timeout for root-level and `config/` entries. Workspaces come and go at
/// runtime, and we have no way to push invalidations to the kernel, so these
/// dentries must not be cached.
pub(crate) const ROOT_TTL: Duration = Duration::ZERO;

/// The metadata directory appearing in every workspace and project.
pub(crate) const META_DIR: &str = ".slothfs";
