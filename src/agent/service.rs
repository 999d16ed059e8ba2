//! The caching agent
//!
//! A single agent per workdir owns the in-memory credential cache and serves
//! it over a Unix-domain socket. Requests are JSON objects; the decoder is
//! incremental, so a connection may carry any number of requests and framing
//! newlines are tolerated but not required. Responses are one JSON object
//! plus a newline each.

use crate::agent::harden;
use crate::agent::lockfile::Lockfile;
use crate::api::{self, AgentRequest, AgentResponse};
use crate::cache::MemoryCache;
use crate::error::{CharonError, CharonResult};
use crate::locate::SocketPath;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Stand-in period for disabled timers; the guarded select arms never fire.
const NEVER: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Timer settings for the agent. `None` disables the respective timer.
#[derive(Debug, Clone, Copy)]
pub struct AgentConfig {
    /// Shut down after this long without a decoded request
    pub idle_timeout: Option<Duration>,
    /// Drop expired cache entries this often
    pub prune_interval: Option<Duration>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Some(Duration::from_secs(3 * 60 * 60)),
            prune_interval: Some(Duration::from_secs(60)),
        }
    }
}

/// State shared between the serve loop and every connection task.
struct AgentShared {
    cache: MemoryCache,
    shutdown_started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    activity_tx: mpsc::UnboundedSender<()>,
}

impl AgentShared {
    /// Transition into shutdown exactly once. Repeated calls are no-ops;
    /// each caller still gets an `ok` answer.
    fn begin_shutdown(&self) -> bool {
        if self
            .shutdown_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let _ = self.shutdown_tx.send(true);
            true
        } else {
            false
        }
    }

    fn handle_request(&self, request: AgentRequest) -> AgentResponse {
        match request.method.as_str() {
            api::method::RETRIEVE => self.handle_retrieve(request.payload),
            api::method::STORE => self.handle_store(request.payload),
            api::method::PRUNE => {
                self.cache.prune();
                AgentResponse::ok()
            }
            api::method::SHUTDOWN => {
                if self.begin_shutdown() {
                    info!("shutdown requested");
                } else {
                    debug!("shutdown already started");
                }
                AgentResponse::ok()
            }
            other => {
                debug!("unknown method: {other:?}");
                AgentResponse::error("unknown method")
            }
        }
    }

    fn handle_retrieve(&self, payload: Option<serde_json::Value>) -> AgentResponse {
        let cache_key: String = match payload.map(serde_json::from_value).transpose() {
            Ok(Some(key)) => key,
            Ok(None) => return AgentResponse::error("retrieve: missing cache key payload"),
            Err(e) => {
                return AgentResponse::error(format!("retrieve: decoding cache key: {e}"))
            }
        };
        match self.cache.retrieve(&cache_key) {
            Some(response) => match serde_json::to_value(response) {
                Ok(payload) => AgentResponse::ok_with(payload),
                Err(e) => AgentResponse::error(format!("retrieve: encoding response: {e}")),
            },
            None => AgentResponse::cache_miss(),
        }
    }

    fn handle_store(&self, payload: Option<serde_json::Value>) -> AgentResponse {
        let value = match payload.map(serde_json::from_value).transpose() {
            Ok(Some(value)) => value,
            Ok(None) => return AgentResponse::error("store: missing cache value payload"),
            Err(e) => return AgentResponse::error(format!("store: decoding cache value: {e}")),
        };
        self.cache.store(value);
        AgentResponse::ok()
    }
}

/// Cheap handle for requesting shutdown from outside the serve loop
/// (signal handlers, tests).
#[derive(Clone)]
pub struct AgentHandle {
    shared: Arc<AgentShared>,
}

impl AgentHandle {
    pub fn shutdown(&self) {
        self.shared.begin_shutdown();
    }
}

/// The agent: listener, pid-file lock, cache, and timers.
pub struct CachingAgent {
    listener: UnixListener,
    socket: SocketPath,
    // Held for the whole agent lifetime; released on drop.
    _lock: Lockfile,
    shared: Arc<AgentShared>,
    // Created together with the sender so a shutdown requested before
    // `serve` starts is never lost.
    shutdown_rx: watch::Receiver<bool>,
    activity_rx: mpsc::UnboundedReceiver<()>,
    config: AgentConfig,
}

impl CachingAgent {
    /// Harden the process, prepare directories, take the pid-file lock,
    /// clear any stale socket, and bind.
    ///
    /// A [`CharonError::LockHeld`] means another agent already serves this
    /// workdir; the caller should exit without complaint.
    pub fn new(
        socket: SocketPath,
        lock_path: &Path,
        cache: MemoryCache,
        config: AgentConfig,
    ) -> CharonResult<Self> {
        harden::harden_process();

        if let Some(parent) = lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    CharonError::io(format!("creating {}", parent.display()), e)
                })?;
            }
        }
        if let SocketPath::File(path) = &socket {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        CharonError::io(format!("creating {}", parent.display()), e)
                    })?;
                    if let Err(e) = harden::harden_socket_dir(parent) {
                        warn!("hardening socket directory: {e}");
                    }
                }
            }
        }

        let lock = Lockfile::acquire(lock_path)?;

        if let SocketPath::File(path) = &socket {
            // A previous agent may have died without unlinking its socket.
            let _ = std::fs::remove_file(path);
        }

        let listener = bind(&socket)?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (activity_tx, activity_rx) = mpsc::unbounded_channel();

        Ok(Self {
            listener,
            socket,
            _lock: lock,
            shared: Arc::new(AgentShared {
                cache,
                shutdown_started: AtomicBool::new(false),
                shutdown_tx,
                activity_tx,
            }),
            shutdown_rx,
            activity_rx,
            config,
        })
    }

    pub fn handle(&self) -> AgentHandle {
        AgentHandle {
            shared: self.shared.clone(),
        }
    }

    /// Serve until a shutdown is requested (RPC, idle watchdog, or
    /// [`AgentHandle::shutdown`]), then drain outstanding connections.
    pub async fn serve(mut self) -> CharonResult<()> {
        info!("agent {} serving on {}", std::process::id(), self.socket);

        let mut connections = JoinSet::new();
        let mut shutdown_rx = self.shutdown_rx;

        let idle_enabled = self.config.idle_timeout.is_some();
        let idle = tokio::time::sleep(self.config.idle_timeout.unwrap_or(NEVER));
        tokio::pin!(idle);

        let prune_enabled = self.config.prune_interval.is_some();
        let period = self.config.prune_interval.unwrap_or(NEVER);
        let mut prune = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        prune.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        debug!("handling connection");
                        connections.spawn(handle_connection(self.shared.clone(), stream));
                    }
                    Err(e) => {
                        if self.shared.shutdown_started.load(Ordering::SeqCst) {
                            break;
                        }
                        warn!("accepting connection: {e}");
                    }
                },

                _ = &mut idle, if idle_enabled => {
                    info!("idle timeout reached - shutting down");
                    self.shared.begin_shutdown();
                    idle.as_mut().reset(tokio::time::Instant::now() + NEVER);
                }

                _ = prune.tick(), if prune_enabled => {
                    self.shared.cache.prune();
                }

                Some(()) = self.activity_rx.recv() => {
                    if let Some(timeout) = self.config.idle_timeout {
                        idle.as_mut().reset(tokio::time::Instant::now() + timeout);
                    }
                }
            }
        }

        // Stop accepting, then wait for connection tasks. The wait is
        // bounded because clients close their connections or hit EOF; a
        // request racing the shutdown still gets its response first.
        drop(self.listener);
        while connections.join_next().await.is_some() {}

        if let SocketPath::File(path) = &self.socket {
            let _ = std::fs::remove_file(path);
        }
        info!("agent {} shut down", std::process::id());
        Ok(())
    }
}

fn bind(socket: &SocketPath) -> CharonResult<UnixListener> {
    match socket {
        SocketPath::File(path) => UnixListener::bind(path)
            .map_err(|e| CharonError::io(format!("binding {}", path.display()), e)),
        #[cfg(target_os = "linux")]
        SocketPath::Abstract(name) => {
            use std::os::linux::net::SocketAddrExt;
            let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())
                .map_err(|e| CharonError::io(format!("abstract address @{name}"), e))?;
            let std_listener = std::os::unix::net::UnixListener::bind_addr(&addr)
                .map_err(|e| CharonError::io(format!("binding @{name}"), e))?;
            std_listener
                .set_nonblocking(true)
                .and_then(|()| UnixListener::from_std(std_listener))
                .map_err(|e| CharonError::io(format!("registering @{name}"), e))
        }
        #[cfg(not(target_os = "linux"))]
        SocketPath::Abstract(name) => Err(CharonError::AbstractSocketUnsupported(name.clone())),
    }
}

/// Outcome of trying to pull one request out of the connection buffer.
enum Decoded {
    Request(AgentRequest),
    Incomplete,
    Invalid,
}

/// Incrementally decode one request from the front of `buf`, consuming the
/// bytes it occupied. Truncated JSON is [`Decoded::Incomplete`]; anything
/// that can never become valid JSON is [`Decoded::Invalid`].
fn take_request(buf: &mut Vec<u8>) -> Decoded {
    let outcome = {
        let mut requests =
            serde_json::Deserializer::from_slice(buf).into_iter::<AgentRequest>();
        match requests.next() {
            None => Err(None),
            Some(Ok(request)) => Ok((request, requests.byte_offset())),
            Some(Err(e)) if e.is_eof() => Err(None),
            Some(Err(e)) => Err(Some(e)),
        }
    };
    match outcome {
        Ok((request, consumed)) => {
            buf.drain(..consumed);
            Decoded::Request(request)
        }
        Err(None) => Decoded::Incomplete,
        Err(Some(e)) => {
            debug!("failed to decode request: {e}");
            Decoded::Invalid
        }
    }
}

/// Serve one connection until EOF or a framing error. The task deliberately
/// outlives a shutdown request: a client that sends `shutdown` (or anything
/// else) while the agent drains still gets its response, and repeated
/// `shutdown` calls each earn their own `ok`.
async fn handle_connection(shared: Arc<AgentShared>, mut stream: UnixStream) {
    use tokio::io::AsyncReadExt;

    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    loop {
        // Serve every complete request already buffered, in arrival order.
        loop {
            match take_request(&mut buf) {
                Decoded::Request(request) => {
                    let _ = shared.activity_tx.send(());
                    let response = shared.handle_request(request);
                    if write_response(&mut stream, &response).await.is_err() {
                        return;
                    }
                }
                Decoded::Incomplete => break,
                Decoded::Invalid => {
                    // Framing is lost; answer once and resynchronize by
                    // closing the connection.
                    let _ = write_response(
                        &mut stream,
                        &AgentResponse::error("invalid json in request"),
                    )
                    .await;
                    return;
                }
            }
        }

        match stream.read_buf(&mut buf).await {
            Ok(0) => {
                debug!("connection closed");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                debug!("reading from connection: {e}");
                return;
            }
        }
    }
}

async fn write_response(stream: &mut UnixStream, response: &AgentResponse) -> std::io::Result<()> {
    let mut frame = serde_json::to_vec(response).map_err(std::io::Error::other)?;
    frame.push(b'\n');
    stream.write_all(&frame).await?;
    stream.flush().await
}
