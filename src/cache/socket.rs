//! Client side of the agent socket
//!
//! One newline-framed JSON request/response pair per call. The dial retries
//! on a short interval because the caller usually races a freshly launched
//! agent to the socket.

use crate::api::{self, AgentRequest, AgentResponse, AgentStatus, CacheableResponse, CredentialResponse};
use crate::error::{CharonError, CharonResult};
use crate::locate::SocketPath;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::Instant;
use tracing::debug;

const DIAL_RETRY: Duration = Duration::from_millis(1);

/// A connection to the caching agent.
pub struct SocketCache {
    stream: BufReader<UnixStream>,
}

impl SocketCache {
    /// Dial the agent socket, retrying until `timeout` elapses.
    pub async fn connect(socket: &SocketPath, timeout: Duration) -> CharonResult<Self> {
        let deadline = Instant::now() + timeout;
        loop {
            match Self::dial(socket).await {
                Ok(stream) => {
                    return Ok(Self {
                        stream: BufReader::new(stream),
                    })
                }
                Err(CharonError::AbstractSocketUnsupported(name)) => {
                    return Err(CharonError::AbstractSocketUnsupported(name))
                }
                Err(e) => debug!("dialing agent socket: {e}"),
            }
            if Instant::now() >= deadline {
                return Err(CharonError::DialTimeout);
            }
            tokio::time::sleep(DIAL_RETRY).await;
        }
    }

    /// Dial exactly once. Used by the `agent-*` commands, which must not
    /// wait around for an agent that may simply not exist.
    pub async fn try_connect(socket: &SocketPath) -> CharonResult<Self> {
        Ok(Self {
            stream: BufReader::new(Self::dial(socket).await?),
        })
    }

    async fn dial(socket: &SocketPath) -> CharonResult<UnixStream> {
        match socket {
            SocketPath::File(path) => UnixStream::connect(path)
                .await
                .map_err(|e| CharonError::io(format!("dialing {}", path.display()), e)),
            #[cfg(target_os = "linux")]
            SocketPath::Abstract(name) => {
                use std::os::linux::net::SocketAddrExt;
                let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())
                    .map_err(|e| CharonError::io(format!("abstract address @{name}"), e))?;
                let std_stream = std::os::unix::net::UnixStream::connect_addr(&addr)
                    .map_err(|e| CharonError::io(format!("dialing @{name}"), e))?;
                std_stream
                    .set_nonblocking(true)
                    .and_then(|()| UnixStream::from_std(std_stream))
                    .map_err(|e| CharonError::io(format!("registering @{name}"), e))
            }
            #[cfg(not(target_os = "linux"))]
            SocketPath::Abstract(name) => {
                Err(CharonError::AbstractSocketUnsupported(name.clone()))
            }
        }
    }

    /// Send one request and read one response.
    pub async fn command(&mut self, request: &AgentRequest) -> CharonResult<AgentResponse> {
        let mut frame = serde_json::to_vec(request)?;
        frame.push(b'\n');
        self.stream
            .write_all(&frame)
            .await
            .map_err(|e| CharonError::io("writing request to agent", e))?;
        self.stream
            .flush()
            .await
            .map_err(|e| CharonError::io("flushing request to agent", e))?;

        let mut line = String::new();
        let n = self
            .stream
            .read_line(&mut line)
            .await
            .map_err(|e| CharonError::io("reading response from agent", e))?;
        if n == 0 {
            return Err(CharonError::io(
                "reading response from agent",
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "connection closed"),
            ));
        }
        Ok(serde_json::from_str(&line)?)
    }

    /// Ask the agent for a cached response. `Ok(None)` is a cache miss.
    pub async fn retrieve(&mut self, cache_key: &str) -> CharonResult<Option<CredentialResponse>> {
        if cache_key.is_empty() {
            return Ok(None);
        }
        let request = AgentRequest {
            method: api::method::RETRIEVE.to_string(),
            payload: Some(serde_json::Value::String(cache_key.to_string())),
        };
        let response = self.command(&request).await?;
        match response.status {
            AgentStatus::CacheMiss => Ok(None),
            AgentStatus::Ok => {
                let payload = response.payload.unwrap_or_default();
                Ok(Some(serde_json::from_value(payload)?))
            }
            AgentStatus::Error => Err(agent_error(response)),
        }
    }

    /// Hand a response to the agent for caching. Values without a cache key
    /// or expiry are not worth a round trip and are skipped client-side too.
    pub async fn store(&mut self, value: &CacheableResponse) -> CharonResult<()> {
        if value.cache_key.is_empty() || value.response.expires.is_empty() {
            return Ok(());
        }
        let request = AgentRequest {
            method: api::method::STORE.to_string(),
            payload: Some(serde_json::to_value(value)?),
        };
        let response = self.command(&request).await?;
        match response.status {
            AgentStatus::Ok => Ok(()),
            _ => Err(agent_error(response)),
        }
    }
}

fn agent_error(response: AgentResponse) -> CharonError {
    let message = match response.payload {
        Some(serde_json::Value::String(s)) => s,
        Some(other) => other.to_string(),
        None => String::new(),
    };
    CharonError::AgentResponse {
        status: response.status.to_string(),
        message,
    }
}
