//! Shared test data: a small kati checkout as the Gitiles server reports it.

use std::sync::Arc;

use data_encoding::BASE64;
use lazy_static::lazy_static;

use crate::cache::Cas;
use crate::fs::{BlobFetcher, FileNode};
use crate::gitiles::{self, Tree};
use crate::GitSha1;

/// Revision the test manifest pins.
pub const COMMIT_HEX: &str = "ce34badf691d36e8048b63f89d1a86ee5fa4325c";
/// The tree of that commit.
pub const TREE_HEX: &str = "58d9fdae2c26d82e04f3fcafc4358b99109f0e70";

/// Base64 as served for the AUTHORS blob (`787d…5d4`).
pub const ENCODED_BLOB: &str = "IyBUaGlzIGlzIHRoZSBvZmZpY2lhbCBsaXN0IG9mIGdsb2cgYXV0aG9ycyBmb3IgY29weXJpZ2h0IHB1cnBvc2VzLgojIFRoaXMgZmlsZSBpcyBkaXN0aW5jdCBmcm9tIHRoZSBDT05UUklCVVRPUlMgZmlsZXMuCiMgU2VlIHRoZSBsYXR0ZXIgZm9yIGFuIGV4cGxhbmF0aW9uLgojCiMgTmFtZXMgc2hvdWxkIGJlIGFkZGVkIHRvIHRoaXMgZmlsZSBhczoKIwlOYW1lIG9yIE9yZ2FuaXphdGlvbiA8ZW1haWwgYWRkcmVzcz4KIyBUaGUgZW1haWwgYWRkcmVzcyBpcyBub3QgcmVxdWlyZWQgZm9yIG9yZ2FuaXphdGlvbnMuCiMKIyBQbGVhc2Uga2VlcCB0aGUgbGlzdCBzb3J0ZWQuCgpLb3VoZWkgU3V0b3UgPGtvdUBjb3ptaXhuZy5vcmc+Ckdvb2dsZSBJbmMuCg==";

pub const TEST_MANIFEST_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<manifest>
  <remote  name="aosp"
           fetch=".."
           review="https://android-review.googlesource.com/" />
  <default revision="master"
           remote="aosp"
           sync-j="4" />
  <project path="build/kati" name="platform/build/kati" groups="pdk,tradefed" revision="ce34badf691d36e8048b63f89d1a86ee5fa4325c"
            clone-url="http://localhost/platform/platform/build/kati" >
    <copyfile dest="build/copydest" src="AUTHORS" />
    <linkfile dest="build/linkdest" src="AUTHORS" />
  </project>
</manifest>"#;

pub const TEST_TREE_JSON: &str = r#"{
  "id": "58d9fdae2c26d82e04f3fcafc4358b99109f0e70",
  "entries": [
    {
      "mode": 33188,
      "type": "blob",
      "id": "787d767f94fd634ed29cd69ec9f93bab2b25f5d4",
      "name": "AUTHORS",
      "size": 373
    },
    {
      "mode": 33188,
      "type": "blob",
      "id": "787d767f94fd634ed29cd69ec9f93bab2b25f5d4",
      "name": "AUTHORS2",
      "size": 373
    },
    {
      "mode": 33261,
      "type": "blob",
      "id": "787d767f94fd634ed29cd69ec9f93bab2b25f5d4",
      "name": "AUTHORSx",
      "size": 373
    },
    {
      "mode": 33188,
      "type": "blob",
      "id": "91c29720b08211898308eb2b6bde8bd3208c6dcd",
      "name": "Android.bp",
      "size": 1935
    },
    {
      "mode": 33188,
      "type": "blob",
      "id": "bdea84459e8c5266251248e593c8ba226a535ad2",
      "name": "testcase/addprefix.mk",
      "size": 38
    },
    {
      "mode": 33188,
      "type": "blob",
      "id": "072b5fc6ca14a64f35f7841080e4b9c972c89b3d",
      "name": "testcase/addsuffix.mk",
      "size": 36
    }
  ]
}"#;

lazy_static! {
    /// Id of the AUTHORS blob (also AUTHORS2 and AUTHORSx).
    pub static ref BLOB_ID: GitSha1 =
        GitSha1::from_hex("787d767f94fd634ed29cd69ec9f93bab2b25f5d4").unwrap();

    /// Decoded contents of the AUTHORS blob.
    pub static ref BLOB_CONTENT: Vec<u8> = BASE64.decode(ENCODED_BLOB.as_bytes()).unwrap();

    pub static ref TEST_TREE: Tree = serde_json::from_str(TEST_TREE_JSON).unwrap();
}

/// A fetch engine pointing at nothing in particular, for tests that only
/// exercise tree construction.
pub fn dummy_fetcher() -> Arc<BlobFetcher> {
    let dir = tempfile::tempdir().unwrap();
    let cas = Arc::new(Cas::new(dir.path().join("blobs")).unwrap());
    // test-lifetime scratch space; cleaned up by the OS
    std::mem::forget(dir);
    let client = gitiles::Client::new(gitiles::Options::default()).unwrap();
    BlobFetcher::new(cas, client.repo("test/repo"), COMMIT_HEX.to_string(), None)
}

/// A file node for the AUTHORS blob with the given git mode.
pub fn file_node(fetcher: &Arc<BlobFetcher>, mode: u32) -> FileNode {
    FileNode::new(
        BLOB_ID.clone(),
        mode,
        BLOB_CONTENT.len() as u64,
        None,
        false,
        fetcher.clone(),
    )
}
