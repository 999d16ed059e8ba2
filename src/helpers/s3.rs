//! S3 helper
//!
//! Signs GET requests for S3 and S3-compatible stores (including Cloudflare
//! R2) with AWS Signature Version 4, entirely from headers the downloader
//! can replay. Every object has a unique signature, so the full URI is the
//! cache key.

use crate::api::{CredentialRequest, CredentialResponse};
use crate::error::{CharonError, CharonResult};
use crate::helpers::HelperContext;
use crate::lookup::{LookupChain, Source};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::debug;
use url::Url;

type HmacSha256 = Hmac<Sha256>;

/// SHA-256 of an empty body; GET requests never carry one.
const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

const EXPIRES_IN_MINUTES: i64 = 15;

const BINDING_ACCESS_KEY_ID: &str = "access_key_id";
const BINDING_SECRET_ACCESS_KEY: &str = "secret_access_key";
const BINDING_SESSION_TOKEN: &str = "session_token";
const BINDING_REGION: &str = "region";
const BINDING_CLOUDFLARE_API_TOKEN: &str = "cloudflare_api_token";

#[derive(Debug, Clone, Copy, Default)]
pub struct S3;

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct S3Config {
    region: Option<String>,
    lookup_chain: LookupChain,
}

impl Default for S3Config {
    fn default() -> Self {
        let env = |name: &str, binding: &str| Source::Env {
            name: name.to_string(),
            binding: binding.to_string(),
        };
        Self {
            region: None,
            lookup_chain: LookupChain::new(vec![
                env("AWS_ACCESS_KEY_ID", BINDING_ACCESS_KEY_ID),
                env("AWS_SECRET_ACCESS_KEY", BINDING_SECRET_ACCESS_KEY),
                env("AWS_SESSION_TOKEN", BINDING_SESSION_TOKEN),
                env("AWS_REGION", BINDING_REGION),
                env("AWS_DEFAULT_REGION", BINDING_REGION),
                env("CLOUDFLARE_API_TOKEN", BINDING_CLOUDFLARE_API_TOKEN),
                Source::Keyring {
                    service: "charon:s3-access-key-id".to_string(),
                    binding: BINDING_ACCESS_KEY_ID.to_string(),
                },
                Source::Keyring {
                    service: "charon:s3-secret-access-key".to_string(),
                    binding: BINDING_SECRET_ACCESS_KEY.to_string(),
                },
            ]),
        }
    }
}

struct Credentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl S3 {
    /// Every object gets its own signature.
    pub fn cache_key(&self, request: &CredentialRequest) -> String {
        request.uri.clone()
    }

    pub fn resolve(
        &self,
        ctx: &HelperContext,
        request: &CredentialRequest,
    ) -> CharonResult<CredentialResponse> {
        let url = Url::parse(&request.uri)?;

        if url.query_pairs().any(|(key, _)| key == "X-Amz-Expires") {
            // Presigned URL; signing it again would only break it.
            return Ok(CredentialResponse::default());
        }
        if url.scheme() != "https" {
            return Err(CharonError::UnsupportedUri {
                uri: request.uri.clone(),
                reason: "only https is supported".to_string(),
            });
        }

        let config: S3Config = ctx.fragment()?;
        let chain = &config.lookup_chain;
        let host = url.host_str().unwrap_or("").to_ascii_lowercase();

        let region = match config.region.filter(|r| !r.is_empty()) {
            Some(region) => region,
            None => match chain.lookup(BINDING_REGION)? {
                Some(region) => region,
                None => region_from_host(&host),
            },
        };
        if region.is_empty() {
            debug!("signing with an empty region - this may fail");
        }

        let mut secret_access_key = String::new();
        if host.ends_with(".r2.cloudflarestorage.com") {
            // The R2 secret access key is the hash of the Cloudflare token.
            if let Some(token) = chain.lookup(BINDING_CLOUDFLARE_API_TOKEN)? {
                secret_access_key = hex::encode(Sha256::digest(token.as_bytes()));
            }
        }
        if let Some(secret) = chain.lookup(BINDING_SECRET_ACCESS_KEY)? {
            secret_access_key = secret;
        }
        let access_key_id = chain.lookup(BINDING_ACCESS_KEY_ID)?.unwrap_or_default();
        if access_key_id.is_empty() || secret_access_key.is_empty() {
            return Err(CharonError::CredentialsUnavailable {
                uri: request.uri.clone(),
                reason: "no access key id / secret access key in the lookup chain".to_string(),
            });
        }

        let credentials = Credentials {
            access_key_id,
            secret_access_key,
            session_token: chain.lookup(BINDING_SESSION_TOKEN)?,
        };

        let now = Utc::now();
        let headers = sign_get(&url, &credentials, &region, now)?;
        Ok(CredentialResponse {
            expires: (now + chrono::Duration::minutes(EXPIRES_IN_MINUTES)).to_rfc3339(),
            headers,
        })
    }

    pub fn setup_instructions(&self, ctx: &HelperContext, uri: &str) -> String {
        let config: S3Config = ctx.fragment().unwrap_or_default();
        let chain = &config.lookup_chain;
        let steps = [
            chain.setup_instructions(BINDING_ACCESS_KEY_ID, "AWS Access Key ID"),
            chain.setup_instructions(BINDING_SECRET_ACCESS_KEY, "AWS Secret Access Key"),
            chain.setup_instructions(BINDING_REGION, "AWS Region"),
        ];
        format!(
            "{uri} is an S3 (or S3-compatible) object.\n\n\
             You need an account with read access to the objects\n\
             (s3:GetObject).\n\n{}",
            steps.join("\n\n")
        )
    }
}

/// Region derivable from well-known hosts; empty when it must come from
/// configuration.
fn region_from_host(host: &str) -> String {
    if host.ends_with(".r2.cloudflarestorage.com") {
        return "auto".to_string();
    }
    let Some(trimmed) = host.strip_suffix(".amazonaws.com") else {
        debug!("endpoint {host} has no well-known provider - skipping region autodetection");
        return String::new();
    };
    // bucket.s3.region / s3.region / bucket.s3 / s3 / bucket.s3-region (legacy)
    let last = trimmed.rsplit('.').next().unwrap_or("");
    if let Some(region) = last.strip_prefix("s3-") {
        return region.to_string();
    }
    if last != "s3" && (trimmed.contains(".s3.") || trimmed.starts_with("s3.")) {
        return last.to_string();
    }
    "us-east-1".to_string()
}

/// AWS Signature Version 4 for a GET with an empty body.
fn sign_get(
    url: &Url,
    credentials: &Credentials,
    region: &str,
    now: DateTime<Utc>,
) -> CharonResult<BTreeMap<String, Vec<String>>> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let datestamp = now.format("%Y%m%d").to_string();

    let host = match url.port() {
        Some(port) => format!("{}:{port}", url.host_str().unwrap_or("")),
        None => url.host_str().unwrap_or("").to_string(),
    };

    let mut canonical_headers = vec![
        ("host", host.as_str()),
        ("x-amz-content-sha256", EMPTY_SHA256),
        ("x-amz-date", amz_date.as_str()),
    ];
    if let Some(token) = &credentials.session_token {
        canonical_headers.push(("x-amz-security-token", token.as_str()));
    }
    let signed_headers = canonical_headers
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(";");
    let canonical_header_block: String = canonical_headers
        .iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect();

    let canonical_path = if url.path().is_empty() { "/" } else { url.path() };
    let canonical_query = canonical_query_string(url.query().unwrap_or(""));
    let canonical_request = format!(
        "GET\n{canonical_path}\n{canonical_query}\n{canonical_header_block}\n{signed_headers}\n{EMPTY_SHA256}"
    );

    let scope = format!("{datestamp}/{region}/s3/aws4_request");
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let mut key = hmac_sha256(
        format!("AWS4{}", credentials.secret_access_key).as_bytes(),
        datestamp.as_bytes(),
    )?;
    for part in [region, "s3", "aws4_request"] {
        key = hmac_sha256(&key, part.as_bytes())?;
    }
    let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?);

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
        credentials.access_key_id
    );

    let mut headers = BTreeMap::new();
    headers.insert("Authorization".to_string(), vec![authorization]);
    headers.insert(
        "X-Amz-Content-Sha256".to_string(),
        vec![EMPTY_SHA256.to_string()],
    );
    headers.insert("X-Amz-Date".to_string(), vec![amz_date]);
    if let Some(token) = &credentials.session_token {
        headers.insert("X-Amz-Security-Token".to_string(), vec![token.clone()]);
    }
    Ok(headers)
}

/// Query parameters sorted bytewise, preserving their existing encoding.
fn canonical_query_string(query: &str) -> String {
    if query.is_empty() {
        return String::new();
    }
    let mut parts: Vec<String> = query
        .split('&')
        .map(|pair| {
            if pair.contains('=') {
                pair.to_string()
            } else {
                format!("{pair}=")
            }
        })
        .collect();
    parts.sort();
    parts.join("&")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> CharonResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| CharonError::Internal(format!("hmac key: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}
