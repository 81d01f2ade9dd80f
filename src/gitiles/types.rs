//! JSON types of the Gitiles source viewer protocol.
//!
//! Gitiles sends lowercase keys on the wire; our own persisted records (tree
//! cache entries, `.slothfs/tree.json`) use the capitalized spelling. Each
//! field therefore serializes capitalized and accepts the lowercase form as an
//! alias on input.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Project {
    #[serde(rename = "Name", alias = "name", default)]
    pub name: String,
    #[serde(rename = "clone_url", default)]
    pub clone_url: String,
    #[serde(rename = "Description", alias = "description", default)]
    pub description: String,
    #[serde(rename = "Branches", alias = "branches", default)]
    pub branches: HashMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Person {
    #[serde(rename = "Name", alias = "name", default)]
    pub name: String,
    #[serde(rename = "Email", alias = "email", default)]
    pub email: String,
    #[serde(rename = "Time", alias = "time", default)]
    pub time: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Commit {
    #[serde(rename = "Commit", alias = "commit", default)]
    pub commit: String,
    #[serde(rename = "Tree", alias = "tree", default)]
    pub tree: String,
    #[serde(rename = "Parents", alias = "parents", default)]
    pub parents: Vec<String>,
    #[serde(rename = "Author", alias = "author", default)]
    pub author: Person,
    #[serde(rename = "Committer", alias = "committer", default)]
    pub committer: Person,
    #[serde(rename = "Message", alias = "message", default)]
    pub message: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct RefData {
    #[serde(rename = "Value", alias = "value", default)]
    pub value: String,
    #[serde(rename = "Peeled", alias = "peeled", default)]
    pub peeled: Option<String>,
}

/// One entry of a recursively expanded tree. Only `blob` and `commit`
/// (submodule) entries appear in recursive expansions; `dir` never does.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct TreeEntry {
    #[serde(rename = "Mode", alias = "mode", default)]
    pub mode: u32,
    #[serde(rename = "Type", alias = "type", default)]
    pub entry_type: String,
    #[serde(rename = "ID", alias = "id", default)]
    pub id: String,
    #[serde(rename = "Name", alias = "name", default)]
    pub name: String,

    #[serde(rename = "Size", alias = "size", default)]
    pub size: Option<u64>,
    #[serde(rename = "Target", alias = "target", default)]
    pub target: Option<String>,
}

/// A fully recursively expanded repository listing at one revision.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Tree {
    #[serde(rename = "ID", alias = "id", default)]
    pub id: String,
    #[serde(
        rename = "Entries",
        alias = "entries",
        default,
        deserialize_with = "null_as_empty"
    )]
    pub entries: Vec<TreeEntry>,
}

// Records written by older implementations spell an empty entry list as
// `null`.
fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<TreeEntry>, D::Error>
where
    D: Deserializer<'de>,
{
    let v: Option<Vec<TreeEntry>> = Option::deserialize(deserializer)?;
    Ok(v.unwrap_or_default())
}
