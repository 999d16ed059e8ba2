//! Wire types shared between the client, the agent, and the resolvers
//!
//! The request/response pair follows the credential-helper spec:
//! <https://github.com/EngFlow/credential-helper-spec>

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Request read from stdin by `charon get`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRequest {
    /// URI of the object being fetched
    pub uri: String,
}

/// Response printed to stdout by `charon get`.
///
/// An empty response means "no authentication needed". An empty `expires`
/// means the response must not be cached, even if a cache key exists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialResponse {
    /// RFC 3339 timestamp after which the headers are no longer valid
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub expires: String,

    /// Headers the downloader should attach, in order, per header name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, Vec<String>>,
}

/// A response paired with the cache key it may be stored under.
///
/// Only values with a non-empty `cache_key` *and* a non-empty
/// `response.expires` are ever admitted to the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheableResponse {
    #[serde(rename = "cacheKey")]
    pub cache_key: String,
    pub response: CredentialResponse,
}

/// Method names understood by the agent.
pub mod method {
    pub const RETRIEVE: &str = "retrieve";
    pub const STORE: &str = "store";
    pub const PRUNE: &str = "prune";
    pub const SHUTDOWN: &str = "shutdown";
}

/// One request on the agent socket.
///
/// `method` is a plain string on purpose: `{}` must decode into a request
/// with an empty method (answered with an `unknown method` error while the
/// connection stays open), whereas malformed JSON closes the connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentRequest {
    #[serde(default)]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// Status of an [`AgentResponse`]. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentStatus {
    Ok,
    CacheMiss,
    Error,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::CacheMiss => write!(f, "cache-miss"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One response on the agent socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl AgentResponse {
    pub fn ok() -> Self {
        Self {
            status: AgentStatus::Ok,
            payload: None,
        }
    }

    pub fn ok_with(payload: serde_json::Value) -> Self {
        Self {
            status: AgentStatus::Ok,
            payload: Some(payload),
        }
    }

    pub fn cache_miss() -> Self {
        Self {
            status: AgentStatus::CacheMiss,
            payload: None,
        }
    }

    /// The payload of an error response is always a JSON-encoded string.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: AgentStatus::Error,
            payload: Some(serde_json::Value::String(message.into())),
        }
    }
}

/// Environment variables recognized by charon. Closed set.
pub mod env {
    /// Truthy (`1`/`true`) disables agent mode entirely
    pub const STANDALONE: &str = "CHARON_STANDALONE";
    /// Override for the agent socket path (leading `@` selects an abstract socket)
    pub const AGENT_SOCKET: &str = "CHARON_AGENT_SOCKET";
    /// Override for the agent pid/lock file path
    pub const AGENT_PID: &str = "CHARON_AGENT_PID";
    /// `off`/`basic`/`debug` or `0`/`1`/`2`
    pub const LOGGING: &str = "CHARON_LOGGING";
    /// Agent idle timeout; negative disables the idle watchdog
    pub const IDLE_TIMEOUT: &str = "CHARON_IDLE_TIMEOUT";
    /// Agent prune interval; negative disables the prune scheduler
    pub const PRUNE_INTERVAL: &str = "CHARON_PRUNE_INTERVAL";
    /// Override for the workspace config file path
    pub const CONFIG_FILE: &str = "CHARON_CONFIG_FILE";
    /// Explicit workspace root
    pub const WORKSPACE_DIRECTORY: &str = "CHARON_WORKSPACE_DIRECTORY";
    /// Explicit workdir (bypasses the hashed per-workspace layout)
    pub const WORKDIR: &str = "CHARON_WORKDIR";
    /// `1` opts unknown URIs with registry-shaped paths into the OCI helper
    pub const GUESS_OCI_REGISTRY: &str = "CHARON_GUESS_OCI_REGISTRY";
    /// Workspace root provided by the build tool
    pub const BUILD_WORKSPACE_DIRECTORY: &str = "BUILD_WORKSPACE_DIRECTORY";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_response_serializes_empty() {
        let resp = CredentialResponse::default();
        assert_eq!(serde_json::to_string(&resp).unwrap(), "{}");
    }

    #[test]
    fn response_field_order() {
        let mut headers = BTreeMap::new();
        headers.insert("x-test".to_string(), vec!["bar".to_string()]);
        let resp = CredentialResponse {
            expires: "2006-01-02T15:04:05Z".to_string(),
            headers,
        };
        assert_eq!(
            serde_json::to_string(&resp).unwrap(),
            r#"{"expires":"2006-01-02T15:04:05Z","headers":{"x-test":["bar"]}}"#
        );
    }

    #[test]
    fn cacheable_uses_camel_case_key() {
        let value = CacheableResponse {
            cache_key: "foo".to_string(),
            response: CredentialResponse::default(),
        };
        assert_eq!(
            serde_json::to_string(&value).unwrap(),
            r#"{"cacheKey":"foo","response":{}}"#
        );
    }

    #[test]
    fn empty_object_decodes_as_empty_method() {
        let req: AgentRequest = serde_json::from_str("{}").unwrap();
        assert!(req.method.is_empty());
        assert!(req.payload.is_none());
    }

    #[test]
    fn status_round_trip() {
        assert_eq!(
            serde_json::to_string(&AgentStatus::CacheMiss).unwrap(),
            r#""cache-miss""#
        );
        let status: AgentStatus = serde_json::from_str(r#""ok""#).unwrap();
        assert_eq!(status, AgentStatus::Ok);
    }

    #[test]
    fn error_payload_is_json_string() {
        let resp = AgentResponse::error("unknown method");
        assert_eq!(
            serde_json::to_string(&resp).unwrap(),
            r#"{"status":"error","payload":"unknown method"}"#
        );
    }
}
