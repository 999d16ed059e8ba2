//! No-op cache for standalone mode

use crate::api::{CacheableResponse, CredentialResponse};

/// A cache that never hits and never stores. Used when `CHARON_STANDALONE`
/// forbids talking to (or spawning) an agent.
#[derive(Debug, Default)]
pub struct NoCache;

impl NoCache {
    pub fn retrieve(&self, _cache_key: &str) -> Option<CredentialResponse> {
        None
    }

    pub fn store(&self, _value: &CacheableResponse) {}
}
