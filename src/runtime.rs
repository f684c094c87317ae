//! Runtime mode and path resolution.

use std::env;
use std::path::PathBuf;

use nix::unistd::{Uid, User};

use crate::constants::{SYSTEM_SOCKET_PATH, USER_HOME_SOCKET_NAME, USER_SOCKET_NAME};

/// Whether the daemon runs as the system init or as a user instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    /// Per-user service manager.
    User,
    /// System service manager / init (pid 1 implies this).
    System,
}

/// Resolves the control socket path for the given mode. An explicit
/// override always wins. The user instance prefers the runtime
/// directory, then the home directory, then the passwd entry.
pub fn control_socket_path(mode: RuntimeMode, override_path: Option<&str>) -> Option<PathBuf> {
    if let Some(path) = override_path {
        return Some(PathBuf::from(path));
    }
    match mode {
        RuntimeMode::System => Some(PathBuf::from(SYSTEM_SOCKET_PATH)),
        RuntimeMode::User => {
            if let Some(dir) = env::var_os("XDG_RUNTIME_DIR") {
                if !dir.is_empty() {
                    return Some(PathBuf::from(dir).join(USER_SOCKET_NAME));
                }
            }
            if let Some(home) = env::var_os("HOME") {
                if !home.is_empty() {
                    return Some(PathBuf::from(home).join(USER_HOME_SOCKET_NAME));
                }
            }
            let user = User::from_uid(Uid::current()).ok().flatten()?;
            Some(user.dir.join(USER_HOME_SOCKET_NAME))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_takes_precedence() {
        let path = control_socket_path(RuntimeMode::System, Some("/tmp/ctl.sock"));
        assert_eq!(path, Some(PathBuf::from("/tmp/ctl.sock")));
    }

    #[test]
    fn system_mode_uses_run_path() {
        let path = control_socket_path(RuntimeMode::System, None);
        assert_eq!(path, Some(PathBuf::from(SYSTEM_SOCKET_PATH)));
    }
}
