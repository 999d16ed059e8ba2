//! Provider dispatch
//!
//! A helper turns a URI into the headers a downloader should send. The set
//! of helpers is closed and small, so dispatch is an enum, not a registry of
//! trait objects. Selection precedence: workspace config rules, then the
//! built-in host table, then the opt-in OCI shape guess, then the null
//! helper (empty response, nothing cached).

pub mod gar;
pub mod gcs;
pub mod github;
pub mod null;
pub mod oci;
pub mod remoteapis;
pub mod s3;

pub use gar::Gar;
pub use gcs::Gcs;
pub use github::Github;
pub use null::Null;
pub use oci::Oci;
pub use remoteapis::RemoteApis;
pub use s3::S3;

use crate::api::{CredentialRequest, CredentialResponse};
use crate::config::Config;
use crate::error::{CharonError, CharonResult};
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use url::Url;

/// Request-scoped configuration channel.
///
/// When a config rule matched, its `config` object rides along here and is
/// deserialized into the helper's own config fragment on demand. Fragments
/// use `#[serde(default)]`, so an absent or partial object keeps the
/// helper's defaults.
#[derive(Debug, Clone, Default)]
pub struct HelperContext {
    rule_config: Option<serde_json::Value>,
}

impl HelperContext {
    pub fn from_rule(rule_config: Option<serde_json::Value>) -> Self {
        Self { rule_config }
    }

    /// Deserialize the per-rule config into `T`, or give `T`'s defaults.
    pub fn fragment<T: Default + DeserializeOwned>(&self) -> CharonResult<T> {
        match &self.rule_config {
            None => Ok(T::default()),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| CharonError::User(format!("invalid helper config: {e}"))),
        }
    }
}

/// One credential helper. Closed set.
#[derive(Debug, Clone)]
pub enum Helper {
    S3(S3),
    Gcs(Gcs),
    Gar(Gar),
    Github(Github),
    Oci(Oci),
    RemoteApis(RemoteApis),
    Null(Null),
}

impl Helper {
    /// Resolve a helper by its config-file name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "s3" => Some(Self::S3(S3)),
            "gcs" => Some(Self::Gcs(Gcs)),
            "gar" => Some(Self::Gar(Gar)),
            "github" => Some(Self::Github(Github)),
            "oci" => Some(Self::Oci(Oci)),
            "remoteapis" => Some(Self::RemoteApis(RemoteApis)),
            "null" => Some(Self::Null(Null)),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::S3(_) => "s3",
            Self::Gcs(_) => "gcs",
            Self::Gar(_) => "gar",
            Self::Github(_) => "github",
            Self::Oci(_) => "oci",
            Self::RemoteApis(_) => "remoteapis",
            Self::Null(_) => "null",
        }
    }

    /// Stable cache key for the request; empty opts out of caching.
    pub fn cache_key(&self, request: &CredentialRequest) -> String {
        match self {
            Self::S3(h) => h.cache_key(request),
            Self::Gcs(h) => h.cache_key(request),
            Self::Gar(h) => h.cache_key(request),
            Self::Github(h) => h.cache_key(request),
            Self::Oci(h) => h.cache_key(request),
            Self::RemoteApis(h) => h.cache_key(request),
            Self::Null(h) => h.cache_key(request),
        }
    }

    /// The potentially slow token acquisition. Runs in the short-lived
    /// client process, never in the agent.
    pub async fn resolve(
        &self,
        ctx: &HelperContext,
        request: &CredentialRequest,
    ) -> CharonResult<CredentialResponse> {
        match self {
            Self::S3(h) => h.resolve(ctx, request),
            Self::Gcs(h) => h.resolve(ctx, request).await,
            Self::Gar(h) => h.resolve(ctx, request).await,
            Self::Github(h) => h.resolve(ctx, request).await,
            Self::Oci(h) => h.resolve(ctx, request).await,
            Self::RemoteApis(h) => h.resolve(ctx, request),
            Self::Null(h) => Ok(h.resolve(request)),
        }
    }

    /// Setup guidance for `setup-uri`; helpers without any say `None`.
    pub fn setup_instructions(&self, ctx: &HelperContext, uri: &str) -> Option<String> {
        match self {
            Self::S3(h) => Some(h.setup_instructions(ctx, uri)),
            Self::Gcs(h) => Some(h.setup_instructions(uri)),
            Self::Gar(h) => Some(h.setup_instructions(uri)),
            Self::Github(h) => Some(h.setup_instructions(ctx, uri)),
            Self::Oci(h) => Some(h.setup_instructions(ctx, uri)),
            Self::RemoteApis(h) => Some(h.setup_instructions(ctx, uri)),
            Self::Null(_) => None,
        }
    }
}

/// Choose the helper for a URI, honoring config rules first.
pub fn for_uri(config: Option<&Config>, uri: &str) -> CharonResult<(Helper, HelperContext)> {
    if let Some(config) = config {
        if let Some(rule) = config.find_rule(uri)? {
            let helper = Helper::from_name(&rule.helper)
                .ok_or_else(|| CharonError::UnknownHelper(rule.helper.clone()))?;
            debug!("config rule routed {uri} to the {} helper", helper.name());
            return Ok((helper, HelperContext::from_rule(rule.config.clone())));
        }
    }
    Ok((fallback_for_uri(uri)?, HelperContext::default()))
}

/// Registries served by the generic OCI helper when no rule says otherwise.
const KNOWN_OCI_REGISTRIES: &[&str] = &[
    "cgr.dev",
    "docker.elastic.co",
    "gcr.io",
    "ghcr.io",
    "index.docker.io",
    "nvcr.io",
    "public.ecr.aws",
    "quay.io",
    "registry.gitlab.com",
];

const KNOWN_OCI_REGISTRY_SUFFIXES: &[&str] = &[".azurecr.io", ".app.snowflake.com"];

fn fallback_for_uri(uri: &str) -> CharonResult<Helper> {
    let url = Url::parse(uri)?;
    let host = url.host_str().unwrap_or("").to_ascii_lowercase();

    if host.ends_with(".amazonaws.com") {
        return Ok(Helper::S3(S3));
    }
    if host == "storage.googleapis.com" {
        return Ok(Helper::Gcs(Gcs));
    }
    if host == "github.com" || host.ends_with(".github.com") || host == "raw.githubusercontent.com"
    {
        return Ok(Helper::Github(Github));
    }
    if host.ends_with(".r2.cloudflarestorage.com") && !has_query_param(&url, "X-Amz-Expires") {
        return Ok(Helper::S3(S3));
    }
    if host.ends_with(".buildbuddy.io") {
        return Ok(Helper::RemoteApis(RemoteApis));
    }
    if host == "pkg.dev" || host.ends_with(".pkg.dev") {
        return Ok(Helper::Gar(Gar));
    }
    if KNOWN_OCI_REGISTRIES.contains(&host.as_str())
        || KNOWN_OCI_REGISTRY_SUFFIXES
            .iter()
            .any(|suffix| host.ends_with(suffix))
    {
        return Ok(Helper::Oci(Oci));
    }
    if oci::guess_registry(uri) {
        debug!("{} is set and the uri looks like a registry: {uri}", crate::api::env::GUESS_OCI_REGISTRY);
        return Ok(Helper::Oci(Oci));
    }

    info!("no matching credential helper found for {uri} - returning empty response");
    Ok(Helper::Null(Null))
}

fn has_query_param(url: &Url, name: &str) -> bool {
    url.query_pairs().any(|(key, _)| key == name)
}
