//! The null helper: no authentication

use crate::api::{CredentialRequest, CredentialResponse};

/// Helper for URIs nothing else claims. Returns an empty response and opts
/// out of caching with an empty cache key.
#[derive(Debug, Clone, Copy, Default)]
pub struct Null;

impl Null {
    pub fn cache_key(&self, _request: &CredentialRequest) -> String {
        String::new()
    }

    pub fn resolve(&self, _request: &CredentialRequest) -> CredentialResponse {
        CredentialResponse::default()
    }
}
