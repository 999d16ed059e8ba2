//! In-memory credential cache owned by the agent

use crate::api::{CacheableResponse, CredentialResponse};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

/// Concurrent map from cache key to cacheable response.
///
/// Many readers may retrieve at once; store and prune take the write lock.
/// Every stored value has a non-empty cache key and a non-empty `expires`.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, CacheableResponse>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a cache key. `None` is a cache miss.
    ///
    /// Expiry is deliberately *not* checked here: a token that expires in a
    /// few seconds is still useful to the downloader, and stale entries are
    /// removed by the periodic [`prune`](Self::prune). A just-expired entry
    /// can therefore be served between prunes; downloaders that get a 401
    /// retry and miss.
    pub fn retrieve(&self, cache_key: &str) -> Option<CredentialResponse> {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        entries.get(cache_key).map(|v| v.response.clone())
    }

    /// Insert a value, overwriting any prior entry under the same key.
    ///
    /// A value with an empty cache key or an empty `expires` is silently
    /// dropped; that is what keeps the cache invariant true.
    pub fn store(&self, value: CacheableResponse) {
        if value.cache_key.is_empty() || value.response.expires.is_empty() {
            return;
        }
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        entries.insert(value.cache_key.clone(), value);
    }

    /// Drop every entry whose `expires` is unparseable or not in the future.
    pub fn prune(&self) {
        let now = Utc::now();
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, v| match DateTime::parse_from_rfc3339(&v.response.expires) {
            Ok(ts) => ts.with_timezone(&Utc) > now,
            Err(_) => false,
        });
        debug!("pruned {} of {} cache entries", before - entries.len(), before);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
