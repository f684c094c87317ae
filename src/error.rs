//! Error handling for ordinit.
use thiserror::Error;

use crate::proto::ExecStage;

/// Errors raised while loading or reloading a service description.
///
/// The description parser itself is an external collaborator; these are
/// the failures the core distinguishes when it asks the loader for a
/// record. They are surfaced to control clients as a `NoService` (or
/// load-failure) reply and logged.
#[derive(Debug, Error)]
pub enum LoadError {
    /// No description exists for the requested service name.
    #[error("Service description not found: '{0}'")]
    NotFound(String),

    /// The service participates in a dependency cycle.
    #[error("Service '{0}' has a cyclic dependency")]
    CyclicDependency(String),

    /// The description exists but is invalid.
    #[error("Service '{service}': {detail}")]
    Description {
        /// The service whose description is faulty.
        service: String,
        /// Human-readable problem description.
        detail: String,
        /// Line number within the description, when known.
        line: Option<usize>,
    },

    /// I/O error reading the description.
    #[error("Failed to read service description: {0}")]
    Io(#[from] std::io::Error),
}

/// Resource acquisition failure during service bring-up.
///
/// These never unwind through the state machine; the starting record
/// converts them into a failed start.
#[derive(Debug, Error)]
pub enum BringUpError {
    /// Could not create the exec-status or readiness pipe.
    #[error("Failed to create pipe: {0}")]
    Pipe(#[source] nix::errno::Errno),

    /// Could not create or bind the activation socket.
    #[error("Activation socket error: {0}")]
    ActivationSocket(String),

    /// Could not create the control-socket pair for the child.
    #[error("Failed to create control socket pair: {0}")]
    ControlSocket(#[source] nix::errno::Errno),

    /// The fork itself failed.
    #[error("Failed to fork: {0}")]
    Fork(#[source] nix::errno::Errno),
}

/// Failure reported by a forked child that could not reach `exec`.
///
/// The child writes the failing stage and the errno over the exec-status
/// pipe; the parent decodes it here and records it as the stop reason.
#[derive(Debug, Clone, Copy, Error)]
#[error("Exec failed during {stage}: {errno}")]
pub struct ExecError {
    /// Which step of child-side setup failed.
    pub stage: ExecStage,
    /// The errno reported by the failing call.
    pub errno: nix::errno::Errno,
}

/// Errors raised by the control server.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Control socket I/O error.
    #[error("control socket I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Socket-level syscall failure.
    #[error("control socket failed: {0}")]
    Sys(#[from] nix::errno::Errno),

    /// No location for the control socket could be determined.
    #[error("no usable control socket path (no runtime dir or home)")]
    NoSocketPath,
}
