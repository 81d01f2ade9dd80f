//! Parser for cURL/Mozilla/Netscape style cookie jar files.

use std::path::Path;
use std::sync::Arc;

use reqwest::cookie::Jar;
use url::Url;

use crate::Error;

/// One cookie from a jar file.
#[derive(Clone, Debug, PartialEq)]
pub struct JarCookie {
    pub domain: String,
    pub path: String,
    pub secure: bool,
    pub expires: i64,
    pub name: String,
    pub value: String,
    pub http_only: bool,
}

/// Parses the tab-separated cookie jar format. Lines starting with
/// `#HttpOnly_` are cookies too; other `#` lines are comments.
pub fn parse_cookie_jar(content: &str) -> Result<Vec<JarCookie>, Error> {
    const HTTP_ONLY_PREFIX: &str = "#HttpOnly_";

    let mut result = Vec::new();
    for line in content.lines() {
        let (line, http_only) = match line.strip_prefix(HTTP_ONLY_PREFIX) {
            Some(rest) => (rest, true),
            None => (line, false),
        };
        if line.starts_with('#') {
            continue;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 7 {
            return Err(Error::Parse(format!(
                "got {} fields in line {:?}, want 7",
                fields.len(),
                line
            )));
        }

        let expires: i64 = fields[4]
            .parse()
            .map_err(|e| Error::Parse(format!("expiry in line {:?}: {}", line, e)))?;

        result.push(JarCookie {
            domain: fields[0].to_string(),
            path: fields[2].to_string(),
            secure: fields[3] == "TRUE",
            expires,
            name: fields[5].to_string(),
            value: fields[6].to_string(),
            http_only,
        });
    }

    Ok(result)
}

/// Loads a cookie jar file into a cookie store usable by the HTTP client.
pub fn load_jar(path: &Path) -> Result<Arc<Jar>, Error> {
    let content = std::fs::read_to_string(path)?;
    let cookies = parse_cookie_jar(&content)?;

    let jar = Jar::default();
    for c in &cookies {
        let host = c.domain.trim_start_matches('.');
        let url: Url = format!("http://{}/", host)
            .parse()
            .map_err(|e| Error::Parse(format!("cookie domain {:?}: {}", c.domain, e)))?;

        let mut header = format!(
            "{}={}; Domain={}; Path={}",
            c.name, c.value, c.domain, c.path
        );
        if c.secure {
            header.push_str("; Secure");
        }
        if c.http_only {
            header.push_str("; HttpOnly");
        }
        jar.add_cookie_str(&header, &url);
    }

    Ok(Arc::new(jar))
}
