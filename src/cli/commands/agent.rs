//! Agent-facing subcommands: launch, shutdown, prune, raw, logs

use crate::agent::{client, AgentConfig, CachingAgent};
use crate::api::{self, AgentRequest, AgentStatus};
use crate::cache::{MemoryCache, SocketCache};
use crate::error::{CharonError, CharonResult};
use crate::locate;
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(3 * 60 * 60);
const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// `charon agent-launch`: become the workspace agent.
///
/// Exits cleanly when another agent already holds the lock; the client that
/// spawned us connects to that one instead.
pub async fn launch() -> CharonResult<()> {
    info!("starting agent {}", std::process::id());
    if client::standalone() {
        return Err(CharonError::User(
            "running as agent is not supported in standalone mode".to_string(),
        ));
    }

    let (socket, pid_path) = locate::agent_paths()?;
    let config = AgentConfig {
        idle_timeout: duration_env(api::env::IDLE_TIMEOUT, Some(DEFAULT_IDLE_TIMEOUT))?,
        prune_interval: duration_env(api::env::PRUNE_INTERVAL, Some(DEFAULT_PRUNE_INTERVAL))?,
    };

    let agent = match CachingAgent::new(socket, &pid_path, MemoryCache::new(), config) {
        Ok(agent) => agent,
        Err(CharonError::LockHeld(e)) => {
            debug!("{e}");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let handle = agent.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.shutdown();
        }
    });

    agent.serve().await
}

/// `charon agent-shutdown`: silent success when no agent is running.
pub async fn shutdown() -> CharonResult<()> {
    let (socket, _) = locate::agent_paths()?;
    let mut conn = match SocketCache::try_connect(&socket).await {
        Ok(conn) => conn,
        Err(_) => return Ok(()), // no agent, nothing to stop
    };
    let response = conn
        .command(&AgentRequest {
            method: api::method::SHUTDOWN.to_string(),
            payload: None,
        })
        .await?;
    expect_ok(response)
}

/// `charon agent-prune`
pub async fn prune() -> CharonResult<()> {
    let (socket, _) = locate::agent_paths()?;
    let mut conn = SocketCache::try_connect(&socket).await?;
    let response = conn
        .command(&AgentRequest {
            method: api::method::PRUNE.to_string(),
            payload: None,
        })
        .await?;
    expect_ok(response)
}

/// `charon agent-raw <method>`: forward stdin as the payload, print the
/// response payload. A debugging tool, not part of the fetch path.
pub async fn raw(method: &str) -> CharonResult<()> {
    use std::io::Read;
    let mut raw_payload = String::new();
    std::io::stdin()
        .read_to_string(&mut raw_payload)
        .map_err(|e| CharonError::io("reading payload from stdin", e))?;
    let payload = if raw_payload.trim().is_empty() {
        None
    } else {
        Some(serde_json::from_str(&raw_payload).map_err(|e| {
            CharonError::User(format!("payload must be valid JSON: {e}"))
        })?)
    };

    let (socket, _) = locate::agent_paths()?;
    let mut conn = SocketCache::try_connect(&socket).await?;
    let response = conn
        .command(&AgentRequest {
            method: method.to_string(),
            payload,
        })
        .await?;

    if response.status != AgentStatus::Ok {
        return Err(to_error(response));
    }
    if let Some(payload) = response.payload {
        let mut out = serde_json::to_string(&payload)?;
        out.push('\n');
        use std::io::Write;
        std::io::stdout()
            .write_all(out.as_bytes())
            .map_err(|e| CharonError::io("printing response payload", e))?;
    }
    Ok(())
}

/// `charon agent-logs`: replay the agent's captured stdout and stderr.
pub fn logs() -> CharonResult<()> {
    let run = locate::run_dir()?;

    let stdout_path = run.join("agent.stdout");
    let mut stdout_log = std::fs::File::open(&stdout_path)
        .map_err(|e| CharonError::io(format!("opening {}", stdout_path.display()), e))?;
    std::io::copy(&mut stdout_log, &mut std::io::stdout())
        .map_err(|e| CharonError::io("copying agent stdout log", e))?;

    let stderr_path = run.join("agent.stderr");
    let mut stderr_log = std::fs::File::open(&stderr_path)
        .map_err(|e| CharonError::io(format!("opening {}", stderr_path.display()), e))?;
    std::io::copy(&mut stderr_log, &mut std::io::stderr())
        .map_err(|e| CharonError::io("copying agent stderr log", e))?;

    Ok(())
}

fn expect_ok(response: crate::api::AgentResponse) -> CharonResult<()> {
    if response.status == AgentStatus::Ok {
        Ok(())
    } else {
        Err(to_error(response))
    }
}

fn to_error(response: crate::api::AgentResponse) -> CharonError {
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

/// Read a duration from the environment. Accepts humantime syntax (`3h`,
/// `90s`); a leading `-` disables the timer entirely.
fn duration_env(key: &str, default: Option<Duration>) -> CharonResult<Option<Duration>> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => parse_signed_duration(&raw)
            .map_err(|e| CharonError::User(format!("parsing ${key}: {e}"))),
    }
}

fn parse_signed_duration(raw: &str) -> Result<Option<Duration>, String> {
    let raw = raw.trim();
    if let Some(rest) = raw.strip_prefix('-') {
        // still insist on valid syntax after the sign
        humantime::parse_duration(rest.trim())
            .map(|_| None)
            .map_err(|e| e.to_string())
    } else {
        humantime::parse_duration(raw)
            .map(Some)
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_durations() {
        assert_eq!(
            parse_signed_duration("3h").unwrap(),
            Some(Duration::from_secs(3 * 60 * 60))
        );
        assert_eq!(
            parse_signed_duration("90s").unwrap(),
            Some(Duration::from_secs(90))
        );
        assert_eq!(parse_signed_duration("-1us").unwrap(), None);
        assert_eq!(parse_signed_duration("-60s").unwrap(), None);
        assert!(parse_signed_duration("soon").is_err());
        assert!(parse_signed_duration("-").is_err());
    }

    #[test]
    fn duration_env_defaults_when_unset() {
        std::env::remove_var("CHARON_TEST_DURATION");
        assert_eq!(
            duration_env("CHARON_TEST_DURATION", Some(Duration::from_secs(1))).unwrap(),
            Some(Duration::from_secs(1))
        );
        std::env::set_var("CHARON_TEST_DURATION", "-1h");
        assert_eq!(
            duration_env("CHARON_TEST_DURATION", Some(Duration::from_secs(1))).unwrap(),
            None
        );
        std::env::remove_var("CHARON_TEST_DURATION");
    }
}
