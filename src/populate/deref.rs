use std::collections::HashSet;
use std::sync::Arc;

use tracing::instrument;

use crate::gitiles::Client;
use crate::manifest::{self, Manifest};
use crate::{Error, GitSha1};

/// Gets the default manifest file from the manifest repository.
pub async fn fetch_manifest(
    client: &Arc<Client>,
    repo: &str,
    branch: &str,
) -> Result<Manifest, Error> {
    // When checking this out, repo calls it "manifest.xml". Go figure.
    let content = client.repo(repo).get_blob(branch, "default.xml").await?;
    manifest::parse(&content)
}

/// Fills in `revision` (as a hex object id) and `clone_url` for every
/// project, using one `List` call for all branches involved.
#[instrument(skip_all, err)]
pub async fn deref_manifest(client: &Arc<Client>, mf: &mut Manifest) -> Result<(), Error> {
    // Normally all projects sit on the same branch, but individual projects
    // may name their own; collect the full set for a single request.
    let mut branch_set = HashSet::new();
    let mut todo = Vec::new();
    for (i, p) in mf.projects.iter().enumerate() {
        let rev = mf.project_revision(p);

        // The field should be a branch, but commit ids are allowed and kept.
        if GitSha1::from_hex(rev).is_ok() {
            continue;
        }
        branch_set.insert(rev.to_string());
        todo.push(i);
    }

    let branches: Vec<String> = branch_set.into_iter().collect();
    let repos = client.list(&branches).await?;

    for i in todo {
        let branch = mf.project_revision(&mf.projects[i]).to_string();
        let p = &mut mf.projects[i];

        let proj = repos.get(&p.name).ok_or_else(|| {
            Error::Protocol(format!("server list doesn't mention repo {}", p.name))
        })?;
        p.clone_url = proj.clone_url.clone();

        let commit = proj.branches.get(&branch).ok_or_else(|| {
            Error::Protocol(format!(
                "branch {:?} for repo {} not returned",
                branch, p.name
            ))
        })?;
        p.revision = commit.clone();
    }
    Ok(())
}
