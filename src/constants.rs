//! Constants and default values for the ordinit daemon.
//!
//! This module centralizes the magic numbers, timing defaults and path
//! fragments used throughout the daemon.

use std::time::Duration;

// ============================================================================
// Control Protocol
// ============================================================================

/// Minimum control protocol version this server can still talk to.
pub const MIN_COMPAT_VERSION: u16 = 1;

/// Current control protocol version.
pub const CP_VERSION: u16 = 1;

/// Capacity of the per-connection receive buffer. A request larger than
/// this is a bad request and drops the connection.
pub const CONTROL_BUFFER_SIZE: usize = 1024;

/// Upper bound on bytes queued for write on one control connection before
/// the connection is treated as resource-exhausted and closed with an
/// out-of-memory indicator.
pub const CONTROL_OUTBUF_MAX: usize = 1024 * 1024;

/// Listen backlog for the control socket and for activation sockets.
pub const SOCKET_BACKLOG: i32 = 128;

// ============================================================================
// Control Socket Paths
// ============================================================================

/// Control socket path for the system instance (overridable on the
/// command line).
pub const SYSTEM_SOCKET_PATH: &str = "/run/ordinitctl";

/// File name of the user-instance control socket under `$XDG_RUNTIME_DIR`.
pub const USER_SOCKET_NAME: &str = "ordinitctl";

/// File name of the user-instance control socket under `$HOME` when no
/// runtime directory is available.
pub const USER_HOME_SOCKET_NAME: &str = ".ordinitctl";

// ============================================================================
// Process Supervision Timing
// ============================================================================

/// Window over which automatic restarts are counted.
pub const DEFAULT_RESTART_INTERVAL: Duration = Duration::from_secs(10);

/// Maximum automatic restarts within [`DEFAULT_RESTART_INTERVAL`] before
/// the service is considered broken and stopped for good.
pub const DEFAULT_MAX_RESTART_COUNT: u32 = 3;

/// Minimum delay between consecutive process launches.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_millis(200);

/// Time allowed for a service to stop before SIGKILL is sent. Zero
/// disables the escalation.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for a service to start before its startup is interrupted
/// with SIGINT. Zero disables the timeout.
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// Child Environment
// ============================================================================

/// Environment variable advertising the number of passed activation
/// sockets (systemd-compatible).
pub const ENV_LISTEN_FDS: &str = "LISTEN_FDS";

/// Environment variable advertising the pid the activation sockets were
/// passed to (systemd-compatible).
pub const ENV_LISTEN_PID: &str = "LISTEN_PID";

/// Environment variable carrying the control-socket fd number for
/// services started with the pass-control-fd flag.
pub const ENV_CONTROL_SOCKET_FD: &str = "ORDINIT_CS_FD";

/// File descriptor at which the activation socket is handed to a child.
pub const ACTIVATION_SOCKET_FD: i32 = 3;

// ============================================================================
// Service Output Capture
// ============================================================================

/// Maximum bytes retained in a per-service output ring buffer. When the
/// buffer is full the supervisor stops draining the pipe.
pub const LOG_BUFFER_MAX: usize = 16 * 1024;

// ============================================================================
// Shutdown Hand-off
// ============================================================================

/// External helper exec'd by the pid-1 instance on SIGQUIT, so that the
/// init binary does not keep an inode open across a shutdown.
pub const SHUTDOWN_HELPER_PATH: &str = "/sbin/shutdown";
