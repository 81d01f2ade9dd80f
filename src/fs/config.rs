use regex::Regex;
use serde::Deserialize;

use crate::Error;

/// Configures for which paths reads should trigger a git clone. The first
/// matching rule wins.
#[derive(Clone, Debug)]
pub struct CloneRule {
    pub re: Regex,
    pub clone: bool,
}

#[derive(Deserialize)]
struct ConfigEntry {
    #[serde(rename = "File", default)]
    file: String,
    #[serde(rename = "Repo", default)]
    repo: String,
    #[serde(rename = "Clone")]
    clone: bool,
}

/// Reads a JSON clone policy: an ordered list of entries, each of which sets
/// exactly one of `File` or `Repo` to a regular expression. `File` entries
/// apply to file paths inside a project, `Repo` entries to project mount
/// paths.
pub fn read_config(contents: &[u8]) -> Result<(Vec<CloneRule>, Vec<CloneRule>), Error> {
    let entries: Vec<ConfigEntry> =
        serde_json::from_slice(contents).map_err(|e| Error::Parse(e.to_string()))?;

    let mut repo = Vec::new();
    let mut file = Vec::new();
    for e in &entries {
        let (pattern, out) = if !e.file.is_empty() {
            (&e.file, &mut file)
        } else if !e.repo.is_empty() {
            (&e.repo, &mut repo)
        } else {
            return Err(Error::Parse("must set either File or Repo".to_string()));
        };

        let re = Regex::new(pattern).map_err(|err| Error::Parse(err.to_string()))?;
        out.push(CloneRule { re, clone: e.clone });
    }

    Ok((repo, file))
}

/// Applies the first matching rule, or returns `default`.
pub(crate) fn decide(rules: &[CloneRule], path: &str, default: bool) -> bool {
    for rule in rules {
        if rule.re.is_match(path) {
            return rule.clone;
        }
    }
    default
}
