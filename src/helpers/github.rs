//! GitHub helper
//!
//! One token covers everything GitHub hosts (git-over-https, raw files,
//! release assets, tarballs), so the cache key is just the host. The token
//! comes from the lookup chain, falling back to the gh CLI.

use crate::api::{CredentialRequest, CredentialResponse};
use crate::error::{CharonError, CharonResult};
use crate::helpers::HelperContext;
use crate::lookup::{LookupChain, Source};
use serde::Deserialize;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, Copy, Default)]
pub struct Github;

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct GithubConfig {
    lookup_chain: LookupChain,
    /// Whether to fall back to the gh CLI when the chain has no token
    read_cli_token: bool,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            lookup_chain: LookupChain::new(vec![
                Source::Env {
                    name: "GH_TOKEN".to_string(),
                    binding: "default".to_string(),
                },
                Source::Env {
                    name: "GITHUB_TOKEN".to_string(),
                    binding: "default".to_string(),
                },
                Source::Keyring {
                    service: "gh:github.com".to_string(),
                    binding: "default".to_string(),
                },
            ]),
            read_cli_token: true,
        }
    }
}

impl Github {
    /// The same token works for the whole host.
    pub fn cache_key(&self, request: &CredentialRequest) -> String {
        match Url::parse(&request.uri) {
            Ok(url) => url.host_str().unwrap_or("").to_string(),
            Err(_) => String::new(), // disable caching
        }
    }

    pub async fn resolve(
        &self,
        ctx: &HelperContext,
        request: &CredentialRequest,
    ) -> CharonResult<CredentialResponse> {
        let url = Url::parse(&request.uri)?;
        if url.scheme() != "https" {
            return Err(CharonError::UnsupportedUri {
                uri: request.uri.clone(),
                reason: "only https is supported".to_string(),
            });
        }
        let host = url.host_str().unwrap_or("").to_ascii_lowercase();
        let known = host == "github.com"
            || host.ends_with(".github.com")
            || host == "raw.githubusercontent.com";
        if !known {
            return Err(CharonError::UnsupportedUri {
                uri: request.uri.clone(),
                reason: "only github.com and subdomains are supported".to_string(),
            });
        }

        let config: GithubConfig = ctx.fragment()?;
        let token = match config.lookup_chain.lookup("default")? {
            Some(token) => token,
            None if config.read_cli_token => {
                debug!("no token in the lookup chain - asking the gh CLI");
                gh_cli_token().await?
            }
            None => return Err(CharonError::GithubNotAuthenticated),
        };

        let expires = probe_token_expiration(&token).await.unwrap_or_default();
        let mut headers = std::collections::BTreeMap::new();
        headers.insert(
            "Authorization".to_string(),
            vec![format!("Bearer {token}")],
        );
        Ok(CredentialResponse { expires, headers })
    }

    pub fn setup_instructions(&self, ctx: &HelperContext, uri: &str) -> String {
        let config: GithubConfig = ctx.fragment().unwrap_or_default();
        let chain = config.lookup_chain.setup_instructions(
            "default",
            "secret sent to GitHub as a bearer token in the Authorization header",
        );
        format!(
            "{uri} is a GitHub url.\n\n\
             The credential helper can download any assets GitHub hosts,\n\
             including raw files, patches, source tarballs, and release assets.\n\
             With credentials you are also less likely to hit rate limits.\n\n\
             Option 1: GitHub CLI (recommended)\n\
             \x20 1. Install gh: https://github.com/cli/cli#installation\n\
             \x20 2. Run: gh auth login\n\n\
             Option 2: provide a token directly\n{chain}"
        )
    }
}

/// Ask the gh CLI for its stored token.
async fn gh_cli_token() -> CharonResult<String> {
    let output = Command::new("gh")
        .args(["auth", "token"])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| CharonError::command_failed("gh auth token", e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("not logged in") || stderr.contains("gh auth login") {
            return Err(CharonError::GithubNotAuthenticated);
        }
        return Err(CharonError::command_exec("gh auth token", stderr));
    }

    let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if token.is_empty() {
        return Err(CharonError::GithubNotAuthenticated);
    }
    Ok(token)
}

/// Best-effort expiry probe. GitHub reports token expiration on the
/// rate-limit endpoint for tokens that have one; everything else (classic
/// PATs without expiry, probe failures) yields an empty string, which keeps
/// the response out of the cache.
async fn probe_token_expiration(token: &str) -> Option<String> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .ok()?;
    let response = client
        .get("https://api.github.com/rate_limit")
        .header("Authorization", format!("Bearer {token}"))
        .header("User-Agent", "charon")
        .send()
        .await
        .ok()?;

    let raw = response
        .headers()
        .get("GitHub-Authentication-Token-Expiration")?
        .to_str()
        .ok()?;
    let expiration = chrono::DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S %z").ok()?;
    Some(expiration.with_timezone(&chrono::Utc).to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str) -> CredentialRequest {
        CredentialRequest {
            uri: uri.to_string(),
        }
    }

    #[test]
    fn cache_key_is_the_host() {
        assert_eq!(
            Github.cache_key(&request("https://github.com/org/repo/archive/v1.tar.gz")),
            "github.com"
        );
        assert_eq!(
            Github.cache_key(&request("https://raw.githubusercontent.com/o/r/c/f")),
            "raw.githubusercontent.com"
        );
        assert_eq!(Github.cache_key(&request("not a uri")), "");
    }

    #[tokio::test]
    async fn rejects_http() {
        let err = Github
            .resolve(&HelperContext::default(), &request("http://github.com/x"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("only https"));
    }

    #[tokio::test]
    async fn rejects_unknown_hosts() {
        let err = Github
            .resolve(&HelperContext::default(), &request("https://gitlab.com/x"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("github.com and subdomains"));
    }

    #[tokio::test]
    async fn static_chain_token_is_used() {
        let ctx = HelperContext::from_rule(Some(serde_json::json!({
            "lookup_chain": [{"source": "static", "value": "ghp_test"}],
            "read_cli_token": false
        })));
        let response = Github
            .resolve(&ctx, &request("https://github.com/org/repo"))
            .await
            .unwrap();
        assert_eq!(
            response.headers["Authorization"],
            vec!["Bearer ghp_test".to_string()]
        );
    }
}
