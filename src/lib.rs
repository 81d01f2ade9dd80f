//! SlothFS presents lightweight, lazily populated, read-only snapshots of a
//! large multi-repository Git tree as a FUSE filesystem.
//!
//! File metadata is synthesized from a Gitiles JSON service, blob contents are
//! fetched on demand (individually over HTTP, or from an opportunistically
//! cloned bare repository), and everything fetched once is kept in a
//! persistent on-disk cache. The companion populate engine overlays a writable
//! checkout with a symlink forest into such a snapshot.

mod digests;
mod errors;

pub mod cache;
pub mod cookies;
pub mod fs;
pub mod gitiles;
pub mod manifest;
pub mod populate;

pub use digests::{GitSha1, GIT_SHA1_LEN};
pub use errors::Error;

#[cfg(test)]
pub mod fixtures;

#[cfg(test)]
mod tests;
