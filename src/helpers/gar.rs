//! Google Artifact Registry helper
//!
//! Same token source as the GCS helper, but scoped per registry: the cache
//! key keeps the project and repository path segments, since one repository
//! may be readable while another is not.

use crate::api::{CredentialRequest, CredentialResponse};
use crate::error::{CharonError, CharonResult};
use crate::helpers::gcs;
use crate::helpers::HelperContext;
use crate::lookup::{LookupChain, Source};
use chrono::Utc;
use serde::Deserialize;
use url::Url;

#[derive(Debug, Clone, Copy, Default)]
pub struct Gar;

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct GarConfig {
    lookup_chain: LookupChain,
}

impl Default for GarConfig {
    fn default() -> Self {
        Self {
            lookup_chain: LookupChain::new(vec![Source::Env {
                name: "GOOGLE_OAUTH_ACCESS_TOKEN".to_string(),
                binding: "default".to_string(),
            }]),
        }
    }
}

impl Gar {
    /// The URI truncated to `/<project>/<repository>`: requests for objects
    /// in the same repository share a token.
    pub fn cache_key(&self, request: &CredentialRequest) -> String {
        let Ok(mut url) = Url::parse(&request.uri) else {
            return request.uri.clone();
        };
        let mut segments: Vec<&str> = url
            .path()
            .trim_start_matches('/')
            .split('/')
            .collect();
        segments.truncate(2);
        let truncated = format!("/{}", segments.join("/"));
        url.set_path(&truncated);
        url.to_string()
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
        if host != "pkg.dev" && !host.ends_with(".pkg.dev") {
            return Err(CharonError::UnsupportedUri {
                uri: request.uri.clone(),
                reason: "only pkg.dev URLs are supported".to_string(),
            });
        }
        if !matches!(url.port(), None | Some(443)) {
            return Err(CharonError::UnsupportedUri {
                uri: request.uri.clone(),
                reason: "only port 443 is supported".to_string(),
            });
        }

        let config: GarConfig = ctx.fragment()?;
        let token = match config.lookup_chain.lookup("default")? {
            Some(token) => token,
            None => gcs::gcloud_access_token().await?,
        };

        let expires =
            (Utc::now() + chrono::Duration::minutes(gcs::TOKEN_VALIDITY_MINUTES)).to_rfc3339();
        let mut headers = std::collections::BTreeMap::new();
        headers.insert(
            "Authorization".to_string(),
            vec![format!("Bearer {token}")],
        );
        Ok(CredentialResponse { expires, headers })
    }

    pub fn setup_instructions(&self, uri: &str) -> String {
        format!(
            "{uri} is a Google Artifact Registry URL.\n\n\
             You need a Google Cloud account with read access to the repos\n\
             (e.g. the roles/artifactregistry.reader IAM role).\n\n\
             Option 1: gcloud CLI (recommended)\n\
             \x20 1. Install the Google Cloud SDK\n\
             \x20 2. Run: gcloud auth login\n\n\
             Option 2: export GOOGLE_OAUTH_ACCESS_TOKEN with a valid access token"
        )
    }
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
    fn cache_key_keeps_project_and_repository() {
        assert_eq!(
            Gar.cache_key(&request(
                "https://us-docker.pkg.dev/my-project/my-repo/my-image/manifests/latest"
            )),
            "https://us-docker.pkg.dev/my-project/my-repo"
        );
        // objects in the same repository share a key
        assert_eq!(
            Gar.cache_key(&request("https://us-docker.pkg.dev/my-project/my-repo/other")),
            Gar.cache_key(&request("https://us-docker.pkg.dev/my-project/my-repo/thing"))
        );
        // short paths pass through unchanged
        assert_eq!(
            Gar.cache_key(&request("https://us-docker.pkg.dev/my-project")),
            "https://us-docker.pkg.dev/my-project"
        );
    }

    #[tokio::test]
    async fn rejects_http() {
        let err = Gar
            .resolve(
                &HelperContext::default(),
                &request("http://us-docker.pkg.dev/p/r/i"),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("only https"));
    }

    #[tokio::test]
    async fn rejects_foreign_host() {
        let err = Gar
            .resolve(
                &HelperContext::default(),
                &request("https://artifacts.example.com/p/r/i"),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("pkg.dev"));
    }

    #[tokio::test]
    async fn static_chain_token_is_used() {
        let ctx = HelperContext::from_rule(Some(serde_json::json!({
            "lookup_chain": [{"source": "static", "value": "gar-token"}]
        })));
        let response = Gar
            .resolve(&ctx, &request("https://us-docker.pkg.dev/my-project/my-repo/img"))
            .await
            .unwrap();
        assert_eq!(
            response.headers["Authorization"],
            vec!["Bearer gar-token".to_string()]
        );
        assert!(!response.expires.is_empty());
    }
}
