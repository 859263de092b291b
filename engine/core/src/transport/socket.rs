//! Unix Socket Endpoint
//!
//! Creation and teardown of the engine's socket file and its directory.
//!
//! # Socket Location
//!
//! Production: `/run/installer-engine/engine.sock`
//! Development: `$XDG_RUNTIME_DIR/installer-engine/engine.sock`
//! Fallback: `/tmp/installer-engine-$UID/engine.sock`
//!
//! # Security
//!
//! - Directory created with mode 0700; pre-existing or shared system
//!   directories are never chmod-ed
//! - Socket set to mode 0600 right after bind, before anything is accepted
//! - Optional chown to the invoking user when the engine runs elevated

use std::fs::{self, DirBuilder, Permissions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tokio::net::UnixListener;

use super::TransportError;

/// Default socket path for the production (elevated) engine
pub const PRODUCTION_SOCKET_PATH: &str = "/run/installer-engine/engine.sock";

/// Directories shared by every user; never created or chmod-ed by us
const SHARED_SYSTEM_DIRS: &[&str] = &["/", "/tmp", "/run", "/var/run", "/var/tmp", "/dev/shm"];

/// Get the default socket path for development use
///
/// Uses the XDG runtime directory if available, otherwise falls back
/// to /tmp/installer-engine-$UID/.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    if let Some(runtime_dir) = dirs::runtime_dir() {
        runtime_dir.join("installer-engine").join("engine.sock")
    } else {
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/installer-engine-{uid}/engine.sock"))
    }
}

fn is_shared_system_dir(dir: &Path) -> bool {
    SHARED_SYSTEM_DIRS.iter().any(|d| Path::new(d) == dir)
}

/// Create `dir` with owner-only permissions if it does not exist
///
/// Returns `true` if this call created the directory. An "already exists"
/// race with another process is not an error, and an existing directory
/// keeps its permissions untouched.
///
/// # Errors
///
/// Fails if the directory cannot be created or the path exists and is not
/// a directory.
pub fn ensure_socket_dir(dir: &Path) -> io::Result<bool> {
    if is_shared_system_dir(dir) {
        return Ok(false);
    }

    let create = |dir: &Path| DirBuilder::new().mode(0o700).create(dir);

    let result = match create(dir) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if let Some(parent) = dir.parent() {
                fs::create_dir_all(parent)?;
            }
            create(dir)
        }
        other => other,
    };

    match result {
        Ok(()) => {
            // mode() is filtered through the umask
            fs::set_permissions(dir, Permissions::from_mode(0o700))?;
            tracing::info!(path = ?dir, "Created socket directory");
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            if dir.is_dir() {
                Ok(false)
            } else {
                Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} exists and is not a directory", dir.display()),
                ))
            }
        }
        Err(e) => Err(e),
    }
}

/// Owns the socket file (and a directory we created) for one session
///
/// Dropping the guard unlinks the socket and removes the directory if this
/// process created it and it is empty.
#[derive(Debug)]
pub struct SocketGuard {
    socket_path: PathBuf,
    created_dir: Option<PathBuf>,
}

impl SocketGuard {
    /// Path of the guarded socket
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.socket_path
    }

    /// Remove the socket file now
    pub fn release(&self) {
        match fs::remove_file(&self.socket_path) {
            Ok(()) => tracing::debug!(path = ?self.socket_path, "Socket file removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = ?self.socket_path, error = %e, "Failed to remove socket"),
        }
    }
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        self.release();
        if let Some(dir) = &self.created_dir {
            // Only succeeds when empty
            let _ = fs::remove_dir(dir);
        }
    }
}

/// Whether something is accepting connections on `path`
fn is_live_socket(path: &Path) -> bool {
    std::os::unix::net::UnixStream::connect(path).is_ok()
}

/// Prepare the endpoint and bind a listener on `path`
///
/// - creates the parent directory (see [`ensure_socket_dir`])
/// - fails with `AddressInUse` if a live server already owns the path,
///   otherwise removes a stale socket file
/// - refuses to touch anything at the path that is not a socket
/// - sets the socket to 0600 before returning, so nothing is accepted
///   with looser permissions
/// - chowns the socket (and a directory we created) to `owner_uid`
///
/// Must be called from within a tokio runtime.
///
/// # Errors
///
/// Returns `TransportError` if any step fails.
pub fn bind_socket(
    path: &Path,
    owner_uid: Option<u32>,
) -> Result<(UnixListener, SocketGuard), TransportError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| TransportError::InvalidState(format!("socket path {path:?} has no parent")))?;

    let created_dir = ensure_socket_dir(parent).map_err(|e| {
        TransportError::Io(io::Error::new(
            e.kind(),
            format!("Failed to create directory {parent:?}: {e}"),
        ))
    })?;

    if let Ok(existing) = fs::symlink_metadata(path) {
        if !existing.file_type().is_socket() {
            return Err(TransportError::InvalidState(format!(
                "{} exists and is not a socket",
                path.display()
            )));
        }
        if is_live_socket(path) {
            return Err(TransportError::AddressInUse(path.to_path_buf()));
        }
        tracing::warn!(path = ?path, "Removing stale socket file");
        fs::remove_file(path)?;
    }

    let listener = UnixListener::bind(path)?;
    let guard = SocketGuard {
        socket_path: path.to_path_buf(),
        created_dir: created_dir.then(|| parent.to_path_buf()),
    };

    fs::set_permissions(path, Permissions::from_mode(0o600))?;

    if let Some(uid) = owner_uid {
        let owner = Some(nix::unistd::Uid::from_raw(uid));
        nix::unistd::chown(path, owner, None).map_err(io::Error::from)?;
        if created_dir {
            nix::unistd::chown(parent, owner, None).map_err(io::Error::from)?;
        }
        tracing::debug!(uid, path = ?path, "Socket ownership transferred");
    }

    tracing::info!(path = ?path, "Listening on Unix socket");
    Ok((listener, guard))
}

/// Whether a peer with `peer_uid` may talk to this engine
///
/// Accepted: our own uid, root, and the configured socket owner.
#[must_use]
pub fn peer_allowed(peer_uid: u32, owner_uid: Option<u32>) -> bool {
    let my_uid = unsafe { libc::geteuid() };
    peer_uid == my_uid || peer_uid == 0 || owner_uid == Some(peer_uid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_socket_path() {
        let path = default_socket_path();
        assert!(path.ends_with("installer-engine/engine.sock") || path.to_string_lossy().contains("installer-engine-"));
    }

    #[test]
    fn test_ensure_socket_dir_creates_owner_only() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("a").join("engine");

        assert!(ensure_socket_dir(&dir).unwrap());
        let mode = fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);

        // Second call is idempotent
        assert!(!ensure_socket_dir(&dir).unwrap());
    }

    #[test]
    fn test_ensure_socket_dir_keeps_existing_permissions() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("shared");
        fs::create_dir(&dir).unwrap();
        fs::set_permissions(&dir, Permissions::from_mode(0o755)).unwrap();

        assert!(!ensure_socket_dir(&dir).unwrap());
        let mode = fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn test_ensure_socket_dir_skips_system_dirs() {
        assert!(!ensure_socket_dir(Path::new("/tmp")).unwrap());
    }

    #[test]
    fn test_ensure_socket_dir_rejects_file() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("not-a-dir");
        fs::write(&file, b"x").unwrap();

        assert!(ensure_socket_dir(&file).is_err());
    }

    #[tokio::test]
    async fn test_bind_sets_permissions_and_guard_unlinks() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("run").join("engine.sock");

        let (listener, guard) = bind_socket(&socket_path, None).unwrap();

        let mode = fs::metadata(&socket_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        drop(listener);
        drop(guard);
        assert!(!socket_path.exists());
        // Directory we created is removed once empty
        assert!(!socket_path.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn test_bind_refuses_live_socket() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("engine.sock");

        let (_listener, _guard) = bind_socket(&socket_path, None).unwrap();
        let second = bind_socket(&socket_path, None);

        assert!(matches!(second, Err(TransportError::AddressInUse(_))));
        assert!(socket_path.exists());
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("engine.sock");

        // A bound-then-dropped std listener leaves a dead socket file behind
        drop(std::os::unix::net::UnixListener::bind(&socket_path).unwrap());
        assert!(socket_path.exists());

        let (_listener, _guard) = bind_socket(&socket_path, None).unwrap();
        assert!(socket_path.exists());
    }

    #[tokio::test]
    async fn test_bind_leaves_regular_file_alone() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("engine.sock");
        fs::write(&socket_path, b"keep me").unwrap();

        let result = bind_socket(&socket_path, None);
        assert!(matches!(result, Err(TransportError::InvalidState(_))));
        assert_eq!(fs::read(&socket_path).unwrap(), b"keep me");
    }

    #[tokio::test]
    async fn test_bind_leaves_symlink_alone() {
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("important");
        fs::write(&target, b"data").unwrap();
        let socket_path = temp_dir.path().join("engine.sock");
        std::os::unix::fs::symlink(&target, &socket_path).unwrap();

        assert!(bind_socket(&socket_path, None).is_err());
        assert!(fs::symlink_metadata(&socket_path).unwrap().file_type().is_symlink());
        assert_eq!(fs::read(&target).unwrap(), b"data");
    }

    #[test]
    fn test_peer_allowed() {
        let me = unsafe { libc::geteuid() };
        assert!(peer_allowed(me, None));
        assert!(peer_allowed(0, None));
        assert!(peer_allowed(4242, Some(4242)));
        if me != 4243 {
            assert!(!peer_allowed(4243, Some(4242)));
        }
    }
}
