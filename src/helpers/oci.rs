//! OCI registry helper
//!
//! Implements the distribution-spec token dance: learn the token endpoint
//! from the registry's `WWW-Authenticate` challenge, exchange credentials
//! (or nothing, for public images) for a pull-scoped bearer token, and hand
//! the downloader the headers registries expect.

use crate::api::{self, CredentialRequest, CredentialResponse};
use crate::error::{CharonError, CharonResult};
use crate::helpers::HelperContext;
use crate::lookup::{LookupChain, Source};
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;
use url::Url;

const BINDING_USERNAME: &str = "username";
const BINDING_PASSWORD: &str = "password";
const BINDING_AUTH: &str = "auth";
const BINDING_IDENTITY_TOKEN: &str = "identitytoken";
const BINDING_REGISTRY_TOKEN: &str = "registrytoken";

/// Accept values registries expect on pull requests.
const ACCEPT: &[&str] = &[
    "application/vnd.docker.distribution.manifest.v2+json",
    "application/vnd.oci.image.manifest.v1+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
    "application/vnd.oci.image.index.v1+json",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct Oci;

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct OciConfig {
    /// Read `~/.docker/config.json` for registry credentials
    parse_docker_config: bool,
    /// `auto`, `oauth2`, or `basic`
    token_exchange_method: String,
    /// Explicit chain from a config rule; absent means the registry-keyed
    /// default from [`default_chain`]
    lookup_chain: Option<LookupChain>,
}

impl Default for OciConfig {
    fn default() -> Self {
        Self {
            parse_docker_config: true,
            token_exchange_method: "auto".to_string(),
            lookup_chain: None,
        }
    }
}

/// Built-in lookup chains, keyed by registry. ghcr.io reuses the same token
/// flow as the GitHub api, so a user who already has `GH_TOKEN` or
/// `GITHUB_TOKEN` exported can pull private images with no extra setup.
fn default_chain(registry: &str) -> LookupChain {
    let env = |name: &str, binding: &str| Source::Env {
        name: name.to_string(),
        binding: binding.to_string(),
    };
    match registry {
        "ghcr.io" => LookupChain::new(vec![
            env("GITHUB_ACTOR", BINDING_USERNAME),
            // ghcr.io requires a username but does not validate it
            Source::Static {
                value: "unset".to_string(),
                binding: BINDING_USERNAME.to_string(),
            },
            env("GHCR_TOKEN", BINDING_PASSWORD),
            env("GH_TOKEN", BINDING_PASSWORD),
            env("GITHUB_TOKEN", BINDING_PASSWORD),
            Source::Keyring {
                service: "gh:github.com".to_string(),
                binding: BINDING_PASSWORD.to_string(),
            },
        ]),
        _ => LookupChain::new(vec![
            env("OCI_REGISTRY_TOKEN", BINDING_REGISTRY_TOKEN),
            env("OCI_USERNAME", BINDING_USERNAME),
            env("OCI_PASSWORD", BINDING_PASSWORD),
            Source::Keyring {
                service: "charon:oci-registry-token".to_string(),
                binding: BINDING_REGISTRY_TOKEN.to_string(),
            },
        ]),
    }
}

impl Oci {
    /// Registry plus repository (the token's scope), never the object path.
    /// Endpoints outside the authenticated `/v2/` pull surface opt out.
    pub fn cache_key(&self, request: &CredentialRequest) -> String {
        match derive_repository(&request.uri) {
            Ok(Some((registry, repository))) => {
                format!("oci-registry-v2-auth://{registry}?action=pull&repository={repository}")
            }
            Ok(None) => String::new(),
            Err(e) => {
                debug!("deriving oci repository from request: {e}");
                String::new()
            }
        }
    }

    pub async fn resolve(
        &self,
        ctx: &HelperContext,
        request: &CredentialRequest,
    ) -> CharonResult<CredentialResponse> {
        let Some((registry, repository)) = derive_repository(&request.uri)? else {
            debug!("ignoring request for {}", request.uri);
            return Ok(CredentialResponse::default());
        };

        let config: OciConfig = ctx.fragment()?;
        let chain = config
            .lookup_chain
            .clone()
            .unwrap_or_else(|| default_chain(&registry));

        if let Some(token) = chain.lookup(BINDING_REGISTRY_TOKEN)? {
            // Immediately usable token; no exchange, unknown expiry.
            return Ok(bearer_response(&token, String::new()));
        }

        let credentials = registry_credentials(&chain, config.parse_docker_config, &registry)?;
        let challenge = discover_challenge(&registry).await?;
        let scope = format!("repository:{repository}:pull");
        let token = exchange_token(&config, &challenge, &scope, credentials.as_ref()).await?;

        let expires = token
            .expires_at()
            .map(|ts| ts.to_rfc3339())
            .unwrap_or_default();
        Ok(bearer_response(&token.secret(), expires))
    }

    pub fn setup_instructions(&self, ctx: &HelperContext, uri: &str) -> String {
        let registry = Url::parse(uri)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
            .unwrap_or_default();
        let config: OciConfig = ctx.fragment().unwrap_or_default();
        let chain = config
            .lookup_chain
            .clone()
            .unwrap_or_else(|| default_chain(&registry));
        let registry_note = if registry == "ghcr.io" {
            "\n\nFor ghcr.io, the credential helper uses the same token flow that is\n\
             also used for the GitHub api: GHCR_TOKEN, GH_TOKEN, or GITHUB_TOKEN."
        } else {
            ""
        };
        let steps = [
            chain.setup_instructions(BINDING_USERNAME, "registry username"),
            chain.setup_instructions(BINDING_PASSWORD, "registry password"),
            chain.setup_instructions(
                BINDING_REGISTRY_TOKEN,
                "immediately usable registry token - no exchange necessary",
            ),
        ];
        format!(
            "{uri} is a container image hosted on an OCI registry.\n\n\
             Public images need no setup. For private images, either\n\
             log in with `docker login <registry>` (the docker config file\n\
             is read by default), or provide credentials directly:{registry_note}\n\n{}",
            steps.join("\n\n")
        )
    }
}

fn bearer_response(token: &str, expires: String) -> CredentialResponse {
    let mut headers = BTreeMap::new();
    headers.insert(
        "Authorization".to_string(),
        vec![format!("Bearer {token}")],
    );
    headers.insert(
        "Accept".to_string(),
        ACCEPT.iter().map(|s| s.to_string()).collect(),
    );
    headers.insert(
        "Docker-Distribution-API-Version".to_string(),
        vec!["registry/2.0".to_string()],
    );
    CredentialResponse { expires, headers }
}

/// `/v2/<name>/{blobs,manifests}/<ref>` and `/v2/<name>/tags/list` are the
/// pull endpoints tokens can be scoped to. `Ok(None)` marks a URI that is
/// on the registry but outside that surface (version check, uploads): the
/// request is answered with an empty response rather than an error.
pub fn derive_repository(uri: &str) -> CharonResult<Option<(String, String)>> {
    let url = Url::parse(uri)?;
    if url.scheme() != "https" {
        return Err(CharonError::UnsupportedUri {
            uri: uri.to_string(),
            reason: format!("unsupported scheme: {}", url.scheme()),
        });
    }
    let host = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => {
            return Err(CharonError::UnsupportedUri {
                uri: uri.to_string(),
                reason: "missing host".to_string(),
            })
        }
    };

    let path = url.path();
    let Some(endpoint) = path.strip_prefix("/v2/") else {
        // not a request to the OCI registry API
        return Ok(None);
    };
    if endpoint.is_empty() {
        // the bare /v2/ version check is deliberately unauthenticated
        return Ok(None);
    }

    if let Some(repository) = endpoint.strip_suffix("/tags/list") {
        return Ok(Some((host, repository.to_string())));
    }
    let parts: Vec<&str> = endpoint.split('/').collect();
    if parts.len() < 3 {
        return Ok(None);
    }
    let kind = parts[parts.len() - 2];
    if kind == "blobs" || kind == "manifests" {
        let repository = parts[..parts.len() - 2].join("/");
        return Ok(Some((host, repository)));
    }
    Ok(None)
}

/// Opt-in fallback: treat an unknown URI as a registry when the flag is set
/// and the URL has the `/v2/` pull shape.
pub fn guess_registry(uri: &str) -> bool {
    if std::env::var(api::env::GUESS_OCI_REGISTRY).as_deref() != Ok("1") {
        return false;
    }
    matches!(derive_repository(uri), Ok(Some(_)))
}

#[derive(Debug, PartialEq)]
struct Challenge {
    realm: String,
    service: String,
}

#[derive(Debug, Clone)]
struct BasicCredentials {
    username: String,
    password: String,
    identity_token: Option<String>,
}

/// Credentials for the registry: lookup chain first, docker config second,
/// anonymous otherwise.
fn registry_credentials(
    chain: &LookupChain,
    parse_docker_config: bool,
    registry: &str,
) -> CharonResult<Option<BasicCredentials>> {
    let identity_token = chain.lookup(BINDING_IDENTITY_TOKEN)?;

    if let (Some(username), Some(password)) = (
        chain.lookup(BINDING_USERNAME)?,
        chain.lookup(BINDING_PASSWORD)?,
    ) {
        return Ok(Some(BasicCredentials {
            username,
            password,
            identity_token,
        }));
    }
    if let Some(auth) = chain.lookup(BINDING_AUTH)? {
        if let Some(credentials) = decode_auth(&auth, identity_token.clone()) {
            return Ok(Some(credentials));
        }
    }
    if parse_docker_config {
        if let Some(credentials) = docker_config_credentials(registry) {
            return Ok(Some(credentials));
        }
    }
    Ok(identity_token.map(|token| BasicCredentials {
        username: String::new(),
        password: String::new(),
        identity_token: Some(token),
    }))
}

fn decode_auth(auth: &str, identity_token: Option<String>) -> Option<BasicCredentials> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(auth)
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some(BasicCredentials {
        username: username.to_string(),
        password: password.to_string(),
        identity_token,
    })
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: BTreeMap<String, DockerAuthEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerAuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    identitytoken: Option<String>,
}

fn docker_config_path() -> Option<std::path::PathBuf> {
    if let Ok(dir) = std::env::var("DOCKER_CONFIG") {
        return Some(std::path::PathBuf::from(dir).join("config.json"));
    }
    dirs::home_dir().map(|home| home.join(".docker").join("config.json"))
}

fn docker_config_credentials(registry: &str) -> Option<BasicCredentials> {
    let raw = std::fs::read_to_string(docker_config_path()?).ok()?;
    let parsed: DockerConfigFile = serde_json::from_str(&raw).ok()?;
    lookup_docker_auth(&parsed, registry)
}

fn lookup_docker_auth(config: &DockerConfigFile, registry: &str) -> Option<BasicCredentials> {
    let mut candidates = vec![registry.to_string(), format!("https://{registry}")];
    if registry == "index.docker.io" || registry == "registry-1.docker.io" {
        candidates.push("https://index.docker.io/v1/".to_string());
    }
    for candidate in candidates {
        let Some(entry) = config.auths.get(&candidate) else {
            continue;
        };
        if let Some(auth) = &entry.auth {
            if let Some(credentials) = decode_auth(auth, entry.identitytoken.clone()) {
                return Some(credentials);
            }
        }
        if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
            return Some(BasicCredentials {
                username: username.clone(),
                password: password.clone(),
                identity_token: entry.identitytoken.clone(),
            });
        }
    }
    None
}

/// Learn realm and service from the registry's version endpoint.
async fn discover_challenge(registry: &str) -> CharonResult<Challenge> {
    let endpoint = format!("https://{registry}/v2/");
    let response = http_client()?.get(&endpoint).send().await?;

    let Some(header) = response.headers().get("WWW-Authenticate") else {
        return Err(CharonError::TokenExchange {
            endpoint,
            reason: format!(
                "expected a WWW-Authenticate challenge, got status {}",
                response.status()
            ),
        });
    };
    let header = header.to_str().map_err(|e| CharonError::TokenExchange {
        endpoint: endpoint.clone(),
        reason: format!("unreadable WWW-Authenticate header: {e}"),
    })?;
    parse_challenge(header).ok_or_else(|| CharonError::TokenExchange {
        endpoint,
        reason: format!("missing realm or service in WWW-Authenticate: {header}"),
    })
}

fn parse_challenge(header: &str) -> Option<Challenge> {
    let params = header.strip_prefix("Bearer ")?;
    let mut realm = None;
    let mut service = None;
    for param in params.split(',') {
        let (key, value) = param.trim().split_once('=')?;
        let value = value.trim_matches('"');
        match key.trim() {
            "realm" => realm = Some(value.to_string()),
            "service" => service = Some(value.to_string()),
            _ => {}
        }
    }
    Some(Challenge {
        realm: realm?,
        service: service?,
    })
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    issued_at: Option<String>,
}

impl TokenResponse {
    fn secret(&self) -> String {
        self.token
            .clone()
            .or_else(|| self.access_token.clone())
            .unwrap_or_default()
    }

    fn expires_at(&self) -> Option<DateTime<Utc>> {
        let lifetime = self.expires_in.filter(|&secs| secs > 0)?;
        let issued = self
            .issued_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        Some(issued + chrono::Duration::seconds(lifetime))
    }
}

/// Trade credentials (or nothing) for a pull-scoped token.
async fn exchange_token(
    config: &OciConfig,
    challenge: &Challenge,
    scope: &str,
    credentials: Option<&BasicCredentials>,
) -> CharonResult<TokenResponse> {
    debug!(
        "exchange token for service {} via realm {}",
        challenge.service, challenge.realm
    );

    let use_oauth = match config.token_exchange_method.as_str() {
        "oauth2" => true,
        "basic" => false,
        _ => credentials.is_some_and(|c| c.identity_token.is_some()),
    };

    let response = if use_oauth {
        let mut form = vec![
            ("client_id".to_string(), "charon".to_string()),
            ("service".to_string(), challenge.service.clone()),
            ("scope".to_string(), scope.to_string()),
        ];
        match credentials {
            Some(c) if c.identity_token.is_some() => {
                form.push(("grant_type".to_string(), "refresh_token".to_string()));
                form.push((
                    "refresh_token".to_string(),
                    c.identity_token.clone().unwrap_or_default(),
                ));
            }
            Some(c) => {
                form.push(("grant_type".to_string(), "password".to_string()));
                form.push(("username".to_string(), c.username.clone()));
                form.push(("password".to_string(), c.password.clone()));
            }
            None => {
                return Err(CharonError::TokenExchange {
                    endpoint: challenge.realm.clone(),
                    reason: "oauth2 exchange requires credentials".to_string(),
                })
            }
        }
        http_client()?.post(&challenge.realm).form(&form).send().await?
    } else {
        let mut request = http_client()?.get(&challenge.realm).query(&[
            ("service", challenge.service.as_str()),
            ("scope", scope),
        ]);
        if let Some(c) = credentials {
            request = request.basic_auth(&c.username, Some(&c.password));
        }
        request.send().await?
    };

    if !response.status().is_success() {
        return Err(CharonError::TokenExchange {
            endpoint: challenge.realm.clone(),
            reason: format!("unexpected status code {}", response.status()),
        });
    }
    let token: TokenResponse = response.json().await?;
    if token.secret().is_empty() {
        return Err(CharonError::TokenExchange {
            endpoint: challenge.realm.clone(),
            reason: "token endpoint returned no token".to_string(),
        });
    }
    Ok(token)
}

fn http_client() -> CharonResult<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_pull_endpoints() {
        assert_eq!(
            derive_repository("https://ghcr.io/v2/org/image/manifests/latest").unwrap(),
            Some(("ghcr.io".to_string(), "org/image".to_string()))
        );
        assert_eq!(
            derive_repository("https://ghcr.io/v2/org/image/blobs/sha256:abc").unwrap(),
            Some(("ghcr.io".to_string(), "org/image".to_string()))
        );
        assert_eq!(
            derive_repository("https://quay.io/v2/a/b/c/tags/list").unwrap(),
            Some(("quay.io".to_string(), "a/b/c".to_string()))
        );
        assert_eq!(
            derive_repository("https://registry.example.com:5000/v2/img/manifests/v1").unwrap(),
            Some(("registry.example.com:5000".to_string(), "img".to_string()))
        );
    }

    #[test]
    fn derive_ignores_non_pull_endpoints() {
        // version check
        assert_eq!(derive_repository("https://ghcr.io/v2/").unwrap(), None);
        // not the registry API at all
        assert_eq!(
            derive_repository("https://ghcr.io/org/image/releases").unwrap(),
            None
        );
        // too short to be a pull endpoint
        assert_eq!(derive_repository("https://ghcr.io/v2/foo").unwrap(), None);
        // uploads are not supported
        assert_eq!(
            derive_repository("https://ghcr.io/v2/org/image/uploads/uuid").unwrap(),
            None
        );
    }

    #[test]
    fn derive_rejects_http() {
        assert!(derive_repository("http://ghcr.io/v2/org/image/manifests/latest").is_err());
    }

    #[test]
    fn cache_key_scopes_to_repository() {
        let request = CredentialRequest {
            uri: "https://ghcr.io/v2/org/image/manifests/latest".to_string(),
        };
        assert_eq!(
            Oci.cache_key(&request),
            "oci-registry-v2-auth://ghcr.io?action=pull&repository=org/image"
        );

        // same repository, different object: same key
        let blob = CredentialRequest {
            uri: "https://ghcr.io/v2/org/image/blobs/sha256:abc".to_string(),
        };
        assert_eq!(Oci.cache_key(&request), Oci.cache_key(&blob));

        let ignored = CredentialRequest {
            uri: "https://ghcr.io/v2/".to_string(),
        };
        assert_eq!(Oci.cache_key(&ignored), "");
    }

    #[test]
    fn guess_needs_flag_and_shape() {
        std::env::remove_var(api::env::GUESS_OCI_REGISTRY);
        assert!(!guess_registry("https://reg.example.com/v2/img/manifests/v1"));

        std::env::set_var(api::env::GUESS_OCI_REGISTRY, "1");
        assert!(guess_registry("https://reg.example.com/v2/img/manifests/v1"));
        assert!(!guess_registry("https://reg.example.com/download/file.tar.gz"));
        std::env::remove_var(api::env::GUESS_OCI_REGISTRY);
    }

    #[test]
    fn challenge_parsing() {
        let challenge = parse_challenge(
            "Bearer realm=\"https://ghcr.io/token\",service=\"ghcr.io\",scope=\"repository:x:pull\"",
        )
        .unwrap();
        assert_eq!(challenge.realm, "https://ghcr.io/token");
        assert_eq!(challenge.service, "ghcr.io");

        assert!(parse_challenge("Basic realm=\"x\"").is_none());
        assert!(parse_challenge("Bearer realm=\"only-realm\"").is_none());
    }

    #[test]
    fn docker_auth_lookup() {
        let config: DockerConfigFile = serde_json::from_str(
            r#"{"auths":{
                "ghcr.io":{"auth":"dXNlcjpwYXNz"},
                "https://index.docker.io/v1/":{"username":"dockeruser","password":"dockerpass"}
            }}"#,
        )
        .unwrap();

        let ghcr = lookup_docker_auth(&config, "ghcr.io").unwrap();
        assert_eq!(ghcr.username, "user");
        assert_eq!(ghcr.password, "pass");

        let hub = lookup_docker_auth(&config, "index.docker.io").unwrap();
        assert_eq!(hub.username, "dockeruser");

        assert!(lookup_docker_auth(&config, "quay.io").is_none());
    }

    #[test]
    fn ghcr_default_chain_reads_github_tokens() {
        std::env::set_var("GHCR_TOKEN", "ghcr-secret");
        let chain = default_chain("ghcr.io");
        assert_eq!(
            chain.lookup(BINDING_PASSWORD).unwrap(),
            Some("ghcr-secret".to_string())
        );
        // a username is always available; ghcr.io does not validate it
        assert!(chain.lookup(BINDING_USERNAME).unwrap().is_some());
        std::env::remove_var("GHCR_TOKEN");
    }

    #[test]
    fn other_registries_keep_the_generic_chain() {
        std::env::set_var("OCI_REGISTRY_TOKEN", "reg-token");
        let chain = default_chain("quay.io");
        assert_eq!(
            chain.lookup(BINDING_REGISTRY_TOKEN).unwrap(),
            Some("reg-token".to_string())
        );
        std::env::remove_var("OCI_REGISTRY_TOKEN");

        // the ghcr chain has no registry-token source at all
        assert_eq!(
            default_chain("ghcr.io").lookup(BINDING_REGISTRY_TOKEN).unwrap(),
            None
        );
    }

    #[test]
    fn token_expiry_computation() {
        let token: TokenResponse = serde_json::from_str(
            r#"{"token":"t","expires_in":300,"issued_at":"2030-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(
            token.expires_at().unwrap().to_rfc3339(),
            "2030-01-01T00:05:00+00:00"
        );

        let no_expiry: TokenResponse = serde_json::from_str(r#"{"token":"t"}"#).unwrap();
        assert!(no_expiry.expires_at().is_none());
    }
}
