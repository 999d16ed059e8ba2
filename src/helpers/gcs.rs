//! Google Cloud Storage helper
//!
//! Tokens come from `GOOGLE_OAUTH_ACCESS_TOKEN` or the gcloud CLI. One token
//! covers every bucket, so the cache key is the storage endpoint itself.

use crate::api::{CredentialRequest, CredentialResponse};
use crate::error::{CharonError, CharonResult};
use crate::helpers::HelperContext;
use crate::lookup::{LookupChain, Source};
use chrono::Utc;
use serde::Deserialize;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;
use url::Url;

/// gcloud access tokens live for an hour; leave headroom for the fetch.
pub(crate) const TOKEN_VALIDITY_MINUTES: i64 = 55;

#[derive(Debug, Clone, Copy, Default)]
pub struct Gcs;

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct GcsConfig {
    lookup_chain: LookupChain,
}

impl Default for GcsConfig {
    fn default() -> Self {
        Self {
            lookup_chain: LookupChain::new(vec![Source::Env {
                name: "GOOGLE_OAUTH_ACCESS_TOKEN".to_string(),
                binding: "default".to_string(),
            }]),
        }
    }
}

impl Gcs {
    /// The same token works for every object; strip everything but the
    /// endpoint so related requests share one entry.
    pub fn cache_key(&self, _request: &CredentialRequest) -> String {
        "https://storage.googleapis.com/".to_string()
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
        if url.host_str() != Some("storage.googleapis.com") {
            return Err(CharonError::UnsupportedUri {
                uri: request.uri.clone(),
                reason: "only storage.googleapis.com is supported".to_string(),
            });
        }
        if !matches!(url.port(), None | Some(443)) {
            return Err(CharonError::UnsupportedUri {
                uri: request.uri.clone(),
                reason: "only port 443 is supported".to_string(),
            });
        }

        let config: GcsConfig = ctx.fragment()?;
        let token = match config.lookup_chain.lookup("default")? {
            Some(token) => token,
            None => gcloud_access_token().await?,
        };

        let expires = (Utc::now() + chrono::Duration::minutes(TOKEN_VALIDITY_MINUTES)).to_rfc3339();
        let mut headers = std::collections::BTreeMap::new();
        headers.insert(
            "Authorization".to_string(),
            vec![format!("Bearer {token}")],
        );
        Ok(CredentialResponse { expires, headers })
    }

    pub fn setup_instructions(&self, uri: &str) -> String {
        format!(
            "{uri} is a Google Cloud Storage (GCS) url.\n\n\
             You need a Google Cloud account with read access to the objects\n\
             (storage.objects.get).\n\n\
             Option 1: gcloud CLI (recommended)\n\
             \x20 1. Install the Google Cloud SDK\n\
             \x20 2. Run: gcloud auth login\n\n\
             Option 2: export GOOGLE_OAUTH_ACCESS_TOKEN with a valid access token"
        )
    }
}

/// Ask the gcloud CLI for an access token. Shared with the Artifact
/// Registry helper, which authenticates the same way.
pub(crate) async fn gcloud_access_token() -> CharonResult<String> {
    debug!("requesting GCS access token from gcloud...");

    let output = Command::new("gcloud")
        .args(["auth", "print-access-token"])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| CharonError::command_failed("gcloud auth print-access-token", e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("not logged in") || stderr.contains("no active account") {
            return Err(CharonError::GcloudNotAuthenticated);
        }
        return Err(CharonError::command_exec(
            "gcloud auth print-access-token",
            stderr,
        ));
    }

    let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if token.is_empty() {
        return Err(CharonError::GcloudNotAuthenticated);
    }
    Ok(token)
}
