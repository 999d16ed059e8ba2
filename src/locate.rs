//! Per-workspace path layout
//!
//! Every invocation, client and agent alike, fixes its environment before
//! doing anything else: it records the original working directory, resolves
//! the workspace directory, derives the per-workspace workdir below the user
//! cache root, creates it, and changes into it. After that, short relative
//! paths like `run/agent.sock` resolve identically in every process that
//! belongs to the same workspace.

use crate::api;
use crate::error::{CharonError, CharonResult};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// sun_path limit on common platforms; longer socket paths cannot be bound
const SUN_PATH_MAX: usize = 108;

static ORIGINAL_CWD: OnceLock<PathBuf> = OnceLock::new();
static WORKDIR: OnceLock<PathBuf> = OnceLock::new();

/// Address of the agent socket.
///
/// Filesystem sockets have a parent directory that must exist and may need a
/// stale file removed before binding. Abstract sockets (Linux only) have
/// neither; callers must skip all `mkdir`/`unlink`/`chmod` steps for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketPath {
    File(PathBuf),
    Abstract(String),
}

impl SocketPath {
    /// Parse a user-provided socket path. A leading `@` selects the abstract
    /// namespace.
    pub fn parse(s: &str) -> Self {
        match s.strip_prefix('@') {
            Some(name) => Self::Abstract(name.to_string()),
            None => Self::File(PathBuf::from(s)),
        }
    }

    pub fn is_abstract(&self) -> bool {
        matches!(self, Self::Abstract(_))
    }
}

impl std::fmt::Display for SocketPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Abstract(name) => write!(f, "@{name}"),
        }
    }
}

/// Fix the process environment. Must run once, before any command logic.
pub fn setup_environment() -> CharonResult<()> {
    let cwd = std::env::current_dir().map_err(|e| CharonError::Environment {
        context: "reading current directory".to_string(),
        source: e,
    })?;
    let _ = ORIGINAL_CWD.set(cwd);

    let workdir = compute_workdir()?;
    std::fs::create_dir_all(&workdir).map_err(|e| CharonError::Environment {
        context: format!("creating workdir {}", workdir.display()),
        source: e,
    })?;
    std::env::set_current_dir(&workdir).map_err(|e| CharonError::Environment {
        context: format!("changing into workdir {}", workdir.display()),
        source: e,
    })?;
    let _ = WORKDIR.set(workdir);
    Ok(())
}

/// The working directory the process was started in, before the chdir into
/// the workdir. Used to resolve relative paths supplied by the caller.
pub fn original_working_directory() -> Option<&'static Path> {
    ORIGINAL_CWD.get().map(PathBuf::as_path)
}

/// The workspace this invocation belongs to: explicit override, then the
/// build tool's workspace variable, then the original working directory.
pub fn workspace_directory() -> CharonResult<PathBuf> {
    if let Ok(dir) = std::env::var(api::env::WORKSPACE_DIRECTORY) {
        return Ok(PathBuf::from(dir));
    }
    if let Ok(dir) = std::env::var(api::env::BUILD_WORKSPACE_DIRECTORY) {
        return Ok(PathBuf::from(dir));
    }
    if let Some(cwd) = original_working_directory() {
        return Ok(cwd.to_path_buf());
    }
    std::env::current_dir().map_err(|e| CharonError::Environment {
        context: "reading current directory".to_string(),
        source: e,
    })
}

/// Truncated hex digest identifying a workspace directory.
///
/// Case-insensitive filesystems fold the path before hashing so that two
/// spellings of the same directory land on the same workdir.
pub fn workspace_hash(workspace: &Path) -> String {
    let raw = workspace.to_string_lossy();
    #[cfg(any(target_os = "macos", windows))]
    let raw = raw.to_lowercase();
    let digest = Sha256::digest(raw.as_bytes());
    hex::encode(&digest[..8])
}

/// Per-workspace state directory. Created lazily by [`setup_environment`].
pub fn workdir() -> CharonResult<PathBuf> {
    if let Some(dir) = WORKDIR.get() {
        return Ok(dir.clone());
    }
    compute_workdir()
}

fn compute_workdir() -> CharonResult<PathBuf> {
    if let Ok(dir) = std::env::var(api::env::WORKDIR) {
        return Ok(PathBuf::from(dir));
    }
    let cache = dirs::cache_dir().ok_or(CharonError::CacheDirUnavailable)?;
    let workspace = workspace_directory()?;
    Ok(cache.join("charon").join(workspace_hash(&workspace)))
}

/// `workdir/run`: socket, pid file, agent log files.
pub fn run_dir() -> CharonResult<PathBuf> {
    Ok(workdir()?.join("run"))
}

/// `workdir/bin`: the installed helper binary.
pub fn bin_dir() -> CharonResult<PathBuf> {
    Ok(workdir()?.join("bin"))
}

/// Expand `%workdir%`, `%workspace%`, `%tmp%`, `%cache%` and a leading `~`
/// in a configured path. With `short`, a `%workdir%`-rooted result collapses
/// to a relative path: every process already runs chdir'd into the workdir,
/// and relative socket paths stay clear of the sun_path limit.
pub fn expand_path(input: &str, short: bool) -> CharonResult<PathBuf> {
    let workdir = workdir()?;
    let workspace = workspace_directory()?;
    Ok(expand_path_in(input, &workdir, &workspace, short))
}

fn expand_path_in(input: &str, workdir: &Path, workspace: &Path, short: bool) -> PathBuf {
    if short {
        if let Some(rest) = input.strip_prefix("%workdir%") {
            let rest = rest.trim_start_matches(['/', '\\']);
            if rest.is_empty() {
                return PathBuf::from(".");
            }
            return PathBuf::from(rest);
        }
    }

    let mut out = input.to_string();
    if let Some(rest) = out.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            out = format!("{}{}", home.display(), rest);
        }
    }
    out = out.replace("%workdir%", &workdir.to_string_lossy());
    out = out.replace("%workspace%", &workspace.to_string_lossy());
    out = out.replace("%tmp%", &std::env::temp_dir().to_string_lossy());
    if let Some(cache) = dirs::cache_dir() {
        out = out.replace("%cache%", &cache.to_string_lossy());
    }
    PathBuf::from(out)
}

/// Resolve a path from an environment override or a placeholder fallback.
pub fn lookup_path_env(key: &str, fallback: &str, short: bool) -> CharonResult<PathBuf> {
    let raw = std::env::var(key).unwrap_or_else(|_| fallback.to_string());
    expand_path(&raw, short)
}

/// Socket and pid-file locations for the agent of this workspace.
///
/// Two invocations that compute the same workdir always agree on both.
pub fn agent_paths() -> CharonResult<(SocketPath, PathBuf)> {
    let socket = match std::env::var(api::env::AGENT_SOCKET) {
        Ok(raw) => match SocketPath::parse(&raw) {
            SocketPath::File(path) => {
                SocketPath::File(expand_path(&path.to_string_lossy(), true)?)
            }
            abstract_addr => abstract_addr,
        },
        Err(_) => {
            let workdir = workdir()?;
            let workspace = workspace_directory()?;
            default_socket_path(&workdir, &workspace_hash(&workspace))
        }
    };
    let pid = lookup_path_env(api::env::AGENT_PID, "%workdir%/run/agent.pid", false)?;
    Ok((socket, pid))
}

fn default_socket_path(workdir: &Path, workspace_hash: &str) -> SocketPath {
    // The relative form is what gets bound (everyone is chdir'd into the
    // workdir), but external consumers see the absolute path. When even that
    // exceeds sun_path, only the abstract namespace can hold the address.
    let absolute = workdir.join("run").join("agent.sock");
    if absolute.as_os_str().len() >= SUN_PATH_MAX {
        SocketPath::Abstract(format!("charon-{workspace_hash}"))
    } else {
        SocketPath::File(PathBuf::from("run/agent.sock"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_short() {
        let a = workspace_hash(Path::new("/home/user/project"));
        let b = workspace_hash(Path::new("/home/user/project"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, workspace_hash(Path::new("/home/user/other")));
    }

    #[test]
    fn socket_path_parse() {
        assert_eq!(
            SocketPath::parse("/tmp/agent.sock"),
            SocketPath::File(PathBuf::from("/tmp/agent.sock"))
        );
        assert_eq!(
            SocketPath::parse("@charon-abc"),
            SocketPath::Abstract("charon-abc".to_string())
        );
        assert!(SocketPath::parse("@x").is_abstract());
    }

    #[test]
    fn socket_path_display() {
        assert_eq!(
            SocketPath::Abstract("charon-abc".to_string()).to_string(),
            "@charon-abc"
        );
        assert_eq!(
            SocketPath::File(PathBuf::from("run/agent.sock")).to_string(),
            "run/agent.sock"
        );
    }

    #[test]
    fn short_workdir_socket_stays_relative() {
        let socket = default_socket_path(Path::new("/home/user/.cache/charon/abcd"), "abcd");
        assert_eq!(socket, SocketPath::File(PathBuf::from("run/agent.sock")));
    }

    #[test]
    fn overlong_workdir_falls_back_to_abstract() {
        let deep = format!("/{}", "x".repeat(120));
        let socket = default_socket_path(Path::new(&deep), "abcd");
        assert_eq!(socket, SocketPath::Abstract("charon-abcd".to_string()));
    }

    #[test]
    fn expand_placeholders() {
        let workdir = Path::new("/cache/charon/abcd");
        let workspace = Path::new("/home/user/project");
        assert_eq!(
            expand_path_in("%workspace%/.charon.json", workdir, workspace, false),
            PathBuf::from("/home/user/project/.charon.json")
        );
        assert_eq!(
            expand_path_in("%workdir%/run/agent.pid", workdir, workspace, false),
            PathBuf::from("/cache/charon/abcd/run/agent.pid")
        );
    }

    #[test]
    fn expand_short_collapses_workdir_prefix() {
        let workdir = Path::new("/cache/charon/abcd");
        let workspace = Path::new("/ws");
        assert_eq!(
            expand_path_in("%workdir%/run/agent.sock", workdir, workspace, true),
            PathBuf::from("run/agent.sock")
        );
        assert_eq!(
            expand_path_in("%workdir%", workdir, workspace, true),
            PathBuf::from(".")
        );
        // non-workdir paths are untouched by short mode
        assert_eq!(
            expand_path_in("/tmp/agent.sock", workdir, workspace, true),
            PathBuf::from("/tmp/agent.sock")
        );
    }
}
