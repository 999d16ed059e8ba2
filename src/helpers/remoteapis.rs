//! Remote-execution API helper
//!
//! Injects an authentication header into gRPC calls against remote build
//! execution services (remote cache, remote executors, build event service).
//! The URI path is the gRPC method's service name, which must be one we
//! know; everything else would silently leak the secret.

use crate::api::{CredentialRequest, CredentialResponse};
use crate::error::{CharonError, CharonResult};
use crate::helpers::HelperContext;
use crate::lookup::{LookupChain, Source};
use base64::Engine as _;
use serde::Deserialize;
use std::collections::BTreeMap;
use url::Url;

/// Well-known gRPC service names of the remote APIs.
const KNOWN_SERVICES: &[&str] = &[
    "google.bytestream.ByteStream",
    "google.devtools.build.v1.PublishBuildEvent",
    "build.bazel.remote.asset.v1.Fetch",
    "build.bazel.remote.asset.v1.Push",
    "build.bazel.remote.execution.v2.ActionCache",
    "build.bazel.remote.execution.v2.Capabilities",
    "build.bazel.remote.execution.v2.ContentAddressableStorage",
    "build.bazel.remote.execution.v2.Execution",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteApis;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RemoteApisConfig {
    /// `header` (secret is the header value) or `basic_auth`
    /// (secret is `username:password`, sent base64-encoded)
    auth_method: String,
    header_name: String,
    lookup_chain: LookupChain,
}

impl Default for RemoteApisConfig {
    fn default() -> Self {
        Self {
            auth_method: "header".to_string(),
            header_name: String::new(),
            lookup_chain: LookupChain::new(vec![
                Source::Env {
                    name: "CHARON_REMOTEAPIS_SECRET".to_string(),
                    binding: "default".to_string(),
                },
                Source::Keyring {
                    service: "charon:remoteapis".to_string(),
                    binding: "default".to_string(),
                },
            ]),
        }
    }
}

/// Services whose header conventions are known; these take precedence over
/// any per-rule configuration.
fn well_known_config(host: &str) -> Option<RemoteApisConfig> {
    match host {
        "remote.buildbuddy.io" => Some(RemoteApisConfig {
            auth_method: "header".to_string(),
            header_name: "x-buildbuddy-api-key".to_string(),
            lookup_chain: LookupChain::new(vec![
                Source::Env {
                    name: "BUILDBUDDY_API_KEY".to_string(),
                    binding: "default".to_string(),
                },
                Source::Env {
                    name: "CHARON_REMOTEAPIS_SECRET".to_string(),
                    binding: "default".to_string(),
                },
                Source::Keyring {
                    service: "charon:remoteapis".to_string(),
                    binding: "default".to_string(),
                },
            ]),
        }),
        _ => None,
    }
}

impl RemoteApis {
    /// Tokens are endpoint-specific; the full URI is the cache key.
    pub fn cache_key(&self, request: &CredentialRequest) -> String {
        request.uri.clone()
    }

    pub fn resolve(
        &self,
        ctx: &HelperContext,
        request: &CredentialRequest,
    ) -> CharonResult<CredentialResponse> {
        let url = Url::parse(&request.uri)?;
        // Bazel forwards remote API endpoints as https regardless of the
        // configured grpc(s) scheme; accept all three.
        if !matches!(url.scheme(), "https" | "grpc" | "grpcs") {
            return Err(CharonError::UnsupportedUri {
                uri: request.uri.clone(),
                reason: format!("only https, grpc, and grpcs are supported, got {:?}", url.scheme()),
            });
        }

        let service = url.path().trim_start_matches('/');
        if !KNOWN_SERVICES.contains(&service) {
            return Err(CharonError::UnsupportedUri {
                uri: request.uri.clone(),
                reason: format!(
                    "unknown remote execution API path {:?} - only gRPC endpoints are supported",
                    url.path()
                ),
            });
        }

        let host = url.host_str().unwrap_or("");
        let config = match well_known_config(host) {
            Some(config) => config,
            None => ctx.fragment()?,
        };

        let secret = config
            .lookup_chain
            .lookup("default")?
            .ok_or_else(|| CharonError::CredentialsUnavailable {
                uri: request.uri.clone(),
                reason: "no secret in the lookup chain".to_string(),
            })?;

        let (header_name, header_value) = match config.auth_method.as_str() {
            "header" => {
                if config.header_name.is_empty() {
                    return Err(CharonError::User(
                        "header_name must be set for auth method \"header\"".to_string(),
                    ));
                }
                (config.header_name.clone(), secret)
            }
            "basic_auth" => {
                let name = if config.header_name.is_empty() {
                    "authorization".to_string()
                } else {
                    config.header_name.clone()
                };
                let encoded =
                    base64::engine::general_purpose::STANDARD.encode(secret.as_bytes());
                (name, format!("Basic {encoded}"))
            }
            other => {
                return Err(CharonError::User(format!(
                    "unknown auth method {other:?}. Possible values are \"header\" and \"basic_auth\""
                )))
            }
        };

        let mut headers = BTreeMap::new();
        headers.insert(header_name, vec![header_value]);
        // No expiry: these secrets are long-lived and must not be cached.
        Ok(CredentialResponse {
            expires: String::new(),
            headers,
        })
    }

    pub fn setup_instructions(&self, ctx: &HelperContext, uri: &str) -> String {
        let host = Url::parse(uri)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();
        let config = well_known_config(&host)
            .map(Ok)
            .unwrap_or_else(|| ctx.fragment())
            .unwrap_or_default();
        let provider_note = if host == "remote.buildbuddy.io" {
            "For BuildBuddy, copy the secret after \"x-buildbuddy-api-key=\" from\n\
             https://app.buildbuddy.io/docs/setup/"
        } else {
            "Cannot infer the RBE provider from the uri; consult your provider's\n\
             documentation for the expected header"
        };
        format!(
            "{uri} refers to a remote build execution (RBE) endpoint.\n\n{provider_note}\n\n{}",
            config.lookup_chain.setup_instructions(
                "default",
                "secret sent to the remote API as an authentication header"
            )
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

    fn ctx_with(config: serde_json::Value) -> HelperContext {
        HelperContext::from_rule(Some(config))
    }

    #[test]
    fn rejects_unknown_service_paths() {
        let ctx = ctx_with(serde_json::json!({
            "header_name": "x-api-key",
            "lookup_chain": [{"source": "static", "value": "sekrit"}]
        }));
        let err = RemoteApis
            .resolve(&ctx, &request("https://cache.example.com/cache/ac/1234"))
            .unwrap_err();
        assert!(err.to_string().contains("unknown remote execution API path"));
    }

    #[test]
    fn header_method_sends_secret_verbatim() {
        let ctx = ctx_with(serde_json::json!({
            "header_name": "x-api-key",
            "lookup_chain": [{"source": "static", "value": "sekrit"}]
        }));
        let response = RemoteApis
            .resolve(
                &ctx,
                &request("https://cache.example.com/google.bytestream.ByteStream"),
            )
            .unwrap();
        assert_eq!(response.headers["x-api-key"], vec!["sekrit".to_string()]);
        assert!(response.expires.is_empty());
    }

    #[test]
    fn basic_auth_encodes_user_pass() {
        let ctx = ctx_with(serde_json::json!({
            "auth_method": "basic_auth",
            "lookup_chain": [{"source": "static", "value": "user:pass"}]
        }));
        let response = RemoteApis
            .resolve(
                &ctx,
                &request("grpcs://cache.example.com/build.bazel.remote.execution.v2.ActionCache"),
            )
            .unwrap();
        assert_eq!(
            response.headers["authorization"],
            vec!["Basic dXNlcjpwYXNz".to_string()]
        );
    }

    #[test]
    fn header_method_requires_header_name() {
        let ctx = ctx_with(serde_json::json!({
            "lookup_chain": [{"source": "static", "value": "sekrit"}]
        }));
        let err = RemoteApis
            .resolve(
                &ctx,
                &request("https://cache.example.com/google.bytestream.ByteStream"),
            )
            .unwrap_err();
        assert!(err.to_string().contains("header_name must be set"));
    }

    #[test]
    fn buildbuddy_convention_is_built_in() {
        std::env::set_var("BUILDBUDDY_API_KEY", "bb-key");
        let response = RemoteApis
            .resolve(
                &HelperContext::default(),
                &request("https://remote.buildbuddy.io/google.bytestream.ByteStream"),
            )
            .unwrap();
        std::env::remove_var("BUILDBUDDY_API_KEY");
        assert_eq!(
            response.headers["x-buildbuddy-api-key"],
            vec!["bb-key".to_string()]
        );
    }

    #[test]
    fn cache_key_is_the_uri() {
        let uri = "https://remote.buildbuddy.io/google.bytestream.ByteStream";
        assert_eq!(RemoteApis.cache_key(&request(uri)), uri);
    }
}
