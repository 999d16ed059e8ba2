//! Workspace configuration
//!
//! A workspace may carry a `.charon.json` file that routes URIs to helpers
//! ahead of the built-in host table. Rules are tried in order; the first
//! match wins. String fields glob-match with `*` as "any run of characters";
//! an absent field matches anything.

use crate::api;
use crate::error::{CharonError, CharonResult};
use crate::locate;
use serde::Deserialize;
use std::path::Path;
use url::Url;

/// One routing rule from the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UrlRule {
    /// Exact scheme to match (`https`, `grpcs`, ...)
    #[serde(default)]
    pub scheme: Option<String>,

    /// Glob pattern for the host
    #[serde(default)]
    pub host: Option<String>,

    /// Glob pattern for the path
    #[serde(default)]
    pub path: Option<String>,

    /// Name of the helper handling matched URIs
    pub helper: String,

    /// Opaque helper configuration, forwarded to the helper as-is
    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

impl UrlRule {
    fn matches(&self, url: &Url) -> bool {
        if let Some(scheme) = &self.scheme {
            if !scheme.is_empty() && scheme != url.scheme() {
                return false;
            }
        }
        if let Some(host) = &self.host {
            if !host.is_empty() && !glob_match(host, url.host_str().unwrap_or("")) {
                return false;
            }
        }
        if let Some(path) = &self.path {
            if !path.is_empty() && !glob_match(path, url.path()) {
                return false;
            }
        }
        true
    }
}

/// The parsed workspace config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub urls: Vec<UrlRule>,
}

impl Config {
    /// First rule matching the URI, if any.
    pub fn find_rule(&self, uri: &str) -> CharonResult<Option<&UrlRule>> {
        let url = Url::parse(uri)?;
        Ok(self.urls.iter().find(|rule| rule.matches(&url)))
    }
}

/// Read the workspace config. `Ok(None)` when no file exists.
pub fn read() -> CharonResult<Option<Config>> {
    let path = locate::lookup_path_env(
        api::env::CONFIG_FILE,
        "%workspace%/.charon.json",
        false,
    )?;
    read_file(&path)
}

fn read_file(path: &Path) -> CharonResult<Option<Config>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(CharonError::io(
                format!("reading config from {}", path.display()),
                e,
            ))
        }
    };
    let config = serde_json::from_str(&raw).map_err(|e| CharonError::ConfigInvalid {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(Some(config))
}

/// Glob match with `*` as a greedy zero-or-more wildcard, with backtracking.
pub(crate) fn glob_match(pattern: &str, candidate: &str) -> bool {
    let pattern = pattern.as_bytes();
    let candidate = candidate.as_bytes();
    let (mut p, mut c) = (0usize, 0usize);
    let (mut next_p, mut next_c) = (0usize, 0usize);
    while p < pattern.len() || c < candidate.len() {
        if p < pattern.len() {
            match pattern[p] {
                b'*' => {
                    next_p = p;
                    next_c = c + 1;
                    p += 1;
                    continue;
                }
                ch => {
                    if c < candidate.len() && candidate[c] == ch {
                        p += 1;
                        c += 1;
                        continue;
                    }
                }
            }
        }
        if 0 < next_c && next_c <= candidate.len() {
            p = next_p;
            c = next_c;
            continue;
        }
        return false;
    }
    true
}
