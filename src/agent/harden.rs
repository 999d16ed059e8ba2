//! Process and socket-directory hardening
//!
//! The agent's files (socket included) must not be reachable by other users.

use crate::error::{CharonError, CharonResult};
use std::path::Path;

/// Clear group/other bits from the file-creation mask before the agent opens
/// any file. No-op on Windows.
#[cfg(unix)]
pub fn harden_process() {
    // SAFETY: umask(2) only mutates process-wide state and cannot fail.
    unsafe {
        libc::umask(0o077);
    }
}

#[cfg(not(unix))]
pub fn harden_process() {}

/// Restrict the socket directory to its owner. No-op on Windows, where this
/// would require ACL surgery.
#[cfg(unix)]
pub fn harden_socket_dir(dir: &Path) -> CharonResult<()> {
    use std::os::unix::fs::PermissionsExt;

    std::os::unix::fs::chown(dir, Some(unsafe { libc::getuid() }), Some(unsafe { libc::getgid() }))
        .map_err(|e| CharonError::io(format!("chown socket directory {}", dir.display()), e))?;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| CharonError::io(format!("chmod socket directory {}", dir.display()), e))
}

#[cfg(not(unix))]
pub fn harden_socket_dir(_dir: &Path) -> CharonResult<()> {
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn socket_dir_becomes_owner_only() {
        let dir = TempDir::new().unwrap();
        harden_socket_dir(dir.path()).unwrap();
        let mode = std::fs::metadata(dir.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
