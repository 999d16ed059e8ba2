//! The foreground handler behind `charon get`
//!
//! One invocation per fetch: decode the request, pick a helper, try the
//! agent cache, resolve on a miss, print, and hand the response back to the
//! agent. Slow resolver work always happens here, in the short-lived client,
//! so it dies with the parent tool instead of lingering in the agent.

use crate::api::{CacheableResponse, CredentialRequest, CredentialResponse};
use crate::error::{CharonError, CharonResult};
use crate::{agent, config, helpers};
use tracing::{debug, error, info, warn};

pub async fn execute() -> CharonResult<()> {
    let request: CredentialRequest = serde_json::from_reader(std::io::stdin().lock())
        .map_err(|e| CharonError::User(format!("decoding credential request from stdin: {e}")))?;
    debug!("credential request for {}", request.uri);

    let config = config::read()?;
    let (helper, ctx) = helpers::for_uri(config.as_ref(), &request.uri)?;

    let cache_key = helper.cache_key(&request);
    if cache_key.is_empty() {
        info!("no cache key returned - not caching");
    } else {
        debug!("cache key: {cache_key}");
    }

    let mut cache = agent::launch_or_connect().await?;

    if !cache_key.is_empty() {
        match cache.retrieve(&cache_key).await {
            Ok(Some(response)) => {
                debug!("cache hit");
                return print_response(&response);
            }
            Ok(None) => debug!("cache miss"),
            // A broken cache must not break the fetch.
            Err(e) => error!("retrieving credentials from agent cache: {e}"),
        }
    }

    let response = match helper.resolve(&ctx, &request).await {
        Ok(response) => response,
        Err(e) => {
            if helper.setup_instructions(&ctx, &request.uri).is_some() {
                return Err(CharonError::User(format!(
                    "{e}\n\nTip: try running the following command for setup instructions:\n  \
                     $ charon setup-uri {}",
                    request.uri
                )));
            }
            return Err(e);
        }
    };

    print_response(&response)?;

    if !cache_key.is_empty() && !response.expires.is_empty() {
        let value = CacheableResponse {
            cache_key,
            response,
        };
        if let Err(e) = cache.store(&value).await {
            // The user already has their credentials for this fetch.
            warn!("storing response in cache: {e}");
        }
    }
    Ok(())
}

/// stdout carries exactly one JSON response, written only on success.
fn print_response(response: &CredentialResponse) -> CharonResult<()> {
    let mut out = serde_json::to_string(response)?;
    out.push('\n');
    use std::io::Write;
    std::io::stdout()
        .write_all(out.as_bytes())
        .map_err(|e| CharonError::io("printing response to stdout", e))
}
