//! The socket/PID/lock triplet in the platform cache directory.

use std::path::PathBuf;

use crate::error::{EngineError, Result};

/// Name of the Windows named pipe (there is no socket file on Windows).
#[cfg(windows)]
pub const PIPE_NAME: &str = r"\\.\pipe\vibium-clicker";

#[derive(Debug, Clone)]
pub struct DaemonPaths {
    pub dir: PathBuf,
    pub socket: PathBuf,
    pub pid: PathBuf,
    pub lock: PathBuf,
}

impl DaemonPaths {
    /// `$XDG_CACHE_HOME/vibium` on Linux, `~/Library/Caches/vibium` on
    /// macOS, the cache dir on Windows (the transport itself is a named
    /// pipe there).
    pub fn resolve() -> Result<Self> {
        let base = if cfg!(target_os = "linux") {
            std::env::var_os("XDG_CACHE_HOME")
                .map(PathBuf::from)
                .filter(|p| !p.as_os_str().is_empty())
                .or_else(dirs::cache_dir)
        } else {
            dirs::cache_dir()
        };
        let dir = base
            .ok_or_else(|| EngineError::protocol("could not determine the cache directory"))?
            .join("vibium");

        Ok(Self {
            socket: dir.join("clicker.sock"),
            pid: dir.join("clicker.pid"),
            lock: dir.join("clicker.lock"),
            dir,
        })
    }

    /// Remove every on-disk artifact of a daemon instance.
    pub fn cleanup(&self) {
        let _ = std::fs::remove_file(&self.socket);
        let _ = std::fs::remove_file(&self.pid);
        let _ = std::fs::remove_file(&self.lock);
    }
}

/// Whether the recorded PID belongs to a live process. Recovery of stale
/// files keys off this, not file age.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(windows)]
pub fn pid_alive(_pid: u32) -> bool {
    // the pipe probe in `acquire_lock` is authoritative on Windows
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triplet_lives_in_one_directory() {
        let paths = DaemonPaths::resolve().unwrap();
        assert_eq!(paths.socket.parent(), paths.pid.parent());
        assert_eq!(paths.pid.parent(), paths.lock.parent());
        assert!(paths.socket.ends_with("vibium/clicker.sock"));
    }

    #[cfg(unix)]
    #[test]
    fn own_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
        // PIDs wrap well below this on every supported platform
        assert!(!pid_alive(u32::MAX - 1));
    }
}
