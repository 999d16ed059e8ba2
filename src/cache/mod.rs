//! Credential caches
//!
//! The agent owns a [`MemoryCache`]; clients talk to it through a
//! [`SocketCache`], or skip caching entirely with [`NoCache`] in standalone
//! mode. The client-side choice is a closed sum type.

pub mod memory;
pub mod none;
pub mod socket;

pub use memory::MemoryCache;
pub use none::NoCache;
pub use socket::SocketCache;

use crate::api::{CacheableResponse, CredentialResponse};
use crate::error::CharonResult;

/// The cache a single `get` invocation writes through.
pub enum ClientCache {
    /// Connected to the workspace agent
    Socket(SocketCache),
    /// Standalone mode: nothing is cached
    Disabled(NoCache),
}

impl ClientCache {
    /// `Ok(None)` is a cache miss.
    pub async fn retrieve(&mut self, cache_key: &str) -> CharonResult<Option<CredentialResponse>> {
        match self {
            Self::Socket(cache) => cache.retrieve(cache_key).await,
            Self::Disabled(cache) => Ok(cache.retrieve(cache_key)),
        }
    }

    pub async fn store(&mut self, value: &CacheableResponse) -> CharonResult<()> {
        match self {
            Self::Socket(cache) => cache.store(value).await,
            Self::Disabled(cache) => {
                cache.store(value);
                Ok(())
            }
        }
    }
}
