//! Client-side agent bootstrap
//!
//! Each `get` invocation launches the agent unconditionally and races it to
//! the socket. If an agent is already running, the fresh child loses the
//! pid-file lock and exits on its own; the parent never waits for it.

use crate::api;
use crate::cache::{ClientCache, NoCache, SocketCache};
use crate::error::{CharonError, CharonResult};
use crate::locate;
use crate::logging;
use std::fs::OpenOptions;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::debug;

/// How long a client waits for the (possibly still starting) agent socket.
const DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// Whether `CHARON_STANDALONE` forbids agent mode. Sandboxed builds set this
/// when spawning side processes is not allowed.
pub fn standalone() -> bool {
    match std::env::var(api::env::STANDALONE) {
        Ok(value) => {
            let value = value.to_ascii_lowercase();
            value == "1" || value == "true"
        }
        Err(_) => false,
    }
}

/// Start `charon agent-launch` as a detached child and let go of it.
///
/// The child gets its own process group so that terminating the build tool's
/// group does not take the agent down with it. Launch always succeeds from
/// the parent's point of view.
pub fn launch_agent_process() -> CharonResult<()> {
    let exe = std::env::current_exe()
        .map_err(|e| CharonError::io("finding path to own executable", e))?;

    let mut cmd = Command::new(exe);
    cmd.arg("agent-launch").stdin(Stdio::null());

    if logging::debug_enabled() {
        let run = locate::run_dir()?;
        std::fs::create_dir_all(&run)
            .map_err(|e| CharonError::io(format!("creating {}", run.display()), e))?;
        let stdout = open_log(&run.join("agent.stdout"))?;
        let stderr = open_log(&run.join("agent.stderr"))?;
        cmd.stdout(stdout).stderr(stderr);
    } else {
        cmd.stdout(Stdio::null()).stderr(Stdio::null());
    }

    detach(&mut cmd);

    let child = cmd
        .spawn()
        .map_err(|e| CharonError::io("starting agent process", e))?;
    // Intentionally not waited on. If another agent holds the lock, this
    // child exits 0 by itself.
    drop(child);
    Ok(())
}

fn open_log(path: &std::path::Path) -> CharonResult<std::fs::File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| CharonError::io(format!("opening agent log {}", path.display()), e))
}

#[cfg(unix)]
fn detach(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(windows)]
fn detach(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;
    const DETACHED_PROCESS: u32 = 0x0000_0008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
}

/// The cache this invocation should use: a no-op in standalone mode,
/// otherwise a connection to the (freshly launched or pre-existing) agent.
pub async fn launch_or_connect() -> CharonResult<ClientCache> {
    if standalone() {
        debug!("running in standalone mode");
        return Ok(ClientCache::Disabled(NoCache));
    }
    debug!("running in agent mode");

    launch_agent_process()?;
    debug!("launched agent");

    let (socket, _) = locate::agent_paths()?;
    debug!("connecting to agent on {socket}");
    let cache = SocketCache::connect(&socket, DIAL_TIMEOUT).await?;
    debug!("connected to agent");
    Ok(ClientCache::Socket(cache))
}
